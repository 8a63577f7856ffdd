//! NATS JetStream client wrapper
//!
//! Connection management with credentials and keep-alive; JetStream
//! stream and consumer setup for notification subjects.

use std::time::Duration;

use async_nats::jetstream::{self, consumer::PullConsumer, stream::Stream};
use async_nats::ConnectOptions;
use tracing::info;

use crate::config::NatsArgs;
use crate::types::{JoinError, Result};

/// Default ping interval for keep-alive
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(120);

/// Stream holding compute and network notifications
pub const STREAM_NAME: &str = "NOVAJOIN_NOTIFICATIONS";

/// Notifications older than this are dropped unprocessed
const STREAM_MAX_AGE: Duration = Duration::from_secs(24 * 3600);

/// NATS client wrapper with JetStream support
#[derive(Clone)]
pub struct NatsClient {
    jetstream: jetstream::Context,
    name: String,
}

impl NatsClient {
    /// Connect to the NATS server
    pub async fn new(args: &NatsArgs, name: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", args.nats_url);

        let mut options = ConnectOptions::new()
            .name(name)
            .ping_interval(DEFAULT_PING_INTERVAL)
            .connection_timeout(Duration::from_secs(5));

        if let (Some(user), Some(pass)) = (&args.nats_user, &args.nats_password) {
            options = options.user_and_password(user.clone(), pass.clone());
        }

        let client = options
            .connect(&args.nats_url)
            .await
            .map_err(|e| JoinError::Nats(format!("Failed to connect: {}", e)))?;

        info!("Connected to NATS at {}", args.nats_url);

        Ok(Self {
            jetstream: jetstream::new(client),
            name: name.to_string(),
        })
    }

    /// Stream capturing every subject under `topic`
    pub async fn ensure_stream(&self, topic: &str) -> Result<Stream> {
        let stream = self
            .jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: STREAM_NAME.to_string(),
                subjects: vec![format!("{}.>", topic)],
                max_age: STREAM_MAX_AGE,
                storage: jetstream::stream::StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| JoinError::Nats(format!("Failed to create stream: {e}")))?;

        info!("Using stream {} with subjects {}.>", STREAM_NAME, topic);
        Ok(stream)
    }

    /// Durable pull consumer with explicit acknowledgement
    pub async fn ensure_consumer(
        &self,
        stream: &Stream,
        topic: &str,
        max_ack_pending: usize,
    ) -> Result<PullConsumer> {
        let consumer_name = format!("{}_{}", topic, self.name.replace(['.', ' ', '*', '>'], "_"));

        let consumer = stream
            .get_or_create_consumer(
                &consumer_name,
                jetstream::consumer::pull::Config {
                    durable_name: Some(consumer_name.clone()),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    filter_subject: format!("{topic}.>"),
                    max_ack_pending: max_ack_pending as i64,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| JoinError::Nats(format!("Failed to create consumer: {e}")))?;

        info!("Using consumer {}", consumer_name);
        Ok(consumer)
    }

    /// Get the client name
    pub fn name(&self) -> &str {
        &self.name
    }
}
