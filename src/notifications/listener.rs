//! JetStream notification listener
//!
//! One fetch loop pulls from a durable consumer and hands messages to a
//! fixed pool of worker tasks over a shared channel. Each worker owns its
//! own IPA client, so sessions are never shared between workers.

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{self, AckKind};
use futures_util::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use super::endpoint::{Disposition, NotificationEndpoint};
use crate::config::NotifyArgs;
use crate::ipa::IpaClient;
use crate::nats::NatsClient;
use crate::services::ClientFactory;
use crate::types::{JoinError, Result};

/// How long the bus waits before redelivering a requeued message
const REQUEUE_DELAY: Duration = Duration::from_secs(60);

/// Consumes notifications and applies them to IPA
pub struct NotificationListener {
    nats: NatsClient,
    topic: String,
    worker_count: usize,
    endpoint: Arc<NotificationEndpoint>,
    clients: Arc<dyn ClientFactory>,
}

impl NotificationListener {
    pub fn new(
        nats: NatsClient,
        args: &NotifyArgs,
        endpoint: Arc<NotificationEndpoint>,
        clients: Arc<dyn ClientFactory>,
    ) -> Self {
        Self {
            nats,
            topic: args.notifications_topic.clone(),
            worker_count: args.worker_count,
            endpoint,
            clients,
        }
    }

    /// Run until the message stream ends
    pub async fn run(self) -> Result<()> {
        let stream = self.nats.ensure_stream(&self.topic).await?;
        let consumer = self
            .nats
            .ensure_consumer(&stream, &self.topic, self.worker_count * 2)
            .await?;

        let (message_tx, message_rx) = mpsc::channel::<jetstream::Message>(self.worker_count);
        let message_rx = Arc::new(Mutex::new(message_rx));

        info!("Starting {} notification workers", self.worker_count);
        for worker_id in 0..self.worker_count {
            let message_rx = Arc::clone(&message_rx);
            let endpoint = Arc::clone(&self.endpoint);
            let ipa = self.clients.create();
            tokio::spawn(async move {
                worker_task(worker_id, message_rx, endpoint, ipa).await;
            });
        }

        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| JoinError::Nats(format!("Failed to open message stream: {e}")))?;

        info!("Listening for notifications on {}.>", self.topic);
        while let Some(message) = messages.next().await {
            match message {
                Ok(message) => {
                    if message_tx.send(message).await.is_err() {
                        error!("All notification workers have stopped");
                        break;
                    }
                }
                Err(e) => warn!("Error receiving notification: {}", e),
            }
        }

        Ok(())
    }
}

/// Tell the bus what became of a message
async fn settle(message: &jetstream::Message, disposition: Disposition) {
    let result = if disposition.requeue() {
        message.ack_with(AckKind::Nak(Some(REQUEUE_DELAY))).await
    } else {
        message.ack().await
    };
    if let Err(e) = result {
        warn!("Failed to settle notification ({:?}): {}", disposition, e);
    }
}

async fn worker_task(
    worker_id: usize,
    message_rx: Arc<Mutex<mpsc::Receiver<jetstream::Message>>>,
    endpoint: Arc<NotificationEndpoint>,
    mut ipa: IpaClient,
) {
    debug!("Notification worker {} started", worker_id);

    loop {
        let message = {
            let mut rx = message_rx.lock().await;
            match rx.recv().await {
                Some(message) => message,
                None => {
                    info!("Notification worker {} shutting down (channel closed)", worker_id);
                    return;
                }
            }
        };

        let disposition = endpoint.process(&mut ipa, &message.payload).await;
        debug!(worker_id, subject = %message.subject, ?disposition, "Notification processed");
        settle(&message, disposition).await;
    }
}
