//! realm-join-notify - keeps FreeIPA in sync with instance lifecycle
//!
//! Consumes compute and network notifications from NATS JetStream and
//! removes hosts, subhosts, services and DNS records as instances go away.
//!
//! Usage:
//!   realm-join-notify --nats-url nats://localhost:4222 --notification-format versioned
//!
//! Environment variables:
//!   NATS_URL - NATS server URL (default: nats://127.0.0.1:4222)
//!   NOTIFICATIONS_TOPIC - subject prefix (default: novajoin_notifications)
//!   NOTIFICATION_FORMAT - versioned or unversioned (default: unversioned)
//!   WORKER_COUNT - concurrent workers (default: 4)
//!   BACKOFF_SECS - initial IPA reconnect backoff (default: 2)

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use realm_join::{
    cloud::NoCloud,
    config::NotifyArgs,
    nats::NatsClient,
    notifications::{NotificationEndpoint, NotificationListener},
};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    let args = NotifyArgs::parse();

    let log_level = args.directory.log_level.clone();
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("realm_join={},info", log_level))),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!(
        "Starting realm-join-notify (NATS: {}, topic: {}, format: {:?}, workers: {})",
        args.nats.nats_url, args.notifications_topic, args.notification_format, args.worker_count
    );

    let nats = match NatsClient::new(&args.nats, "realm-join-notify").await {
        Ok(nats) => nats,
        Err(e) => {
            error!("Failed to connect to NATS: {}", e);
            std::process::exit(1);
        }
    };

    let endpoint = Arc::new(NotificationEndpoint::new(
        Arc::new(NoCloud),
        args.directory.naming(),
        args.notification_format,
    ));
    let clients = Arc::new(args.directory.client_factory(args.backoff()));
    let listener = NotificationListener::new(nats, &args, endpoint, clients);

    let listener_handle = tokio::spawn(async move {
        if let Err(e) = listener.run().await {
            error!("Listener error: {}", e);
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = listener_handle => {
            if let Err(e) = result {
                error!("Listener task error: {}", e);
            }
        }
    }

    info!("realm-join-notify shutting down");
}
