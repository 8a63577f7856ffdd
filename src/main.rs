//! realm-join - join API for cloud instances
//!
//! Called by the metadata service while an instance is built; registers the
//! host in FreeIPA and hands back a one-time password for ipa-client-install.

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use realm_join::{
    cloud::NoCloud,
    config::Args,
    ipa::ticket::client_configured,
    server::{self, AppState},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.directory.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("realm_join={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  realm-join - IPA enrollment");
    info!("======================================");
    info!("Listen: {}", args.listen);
    info!("IPA config: {}", args.directory.ipa_conf.display());
    info!("Keytab: {}", args.directory.keytab.display());
    info!("Connect retries: {}", args.directory.connect_retries);
    info!("Project subdomain: {}", args.directory.project_subdomain);
    info!("======================================");

    if !client_configured(&args.directory.ipa_conf) {
        warn!("IPA client is not configured; join requests will return no OTP");
    }

    let clients = Arc::new(args.directory.client_factory(None));
    let state = Arc::new(AppState::new(args, Arc::new(NoCloud), clients)?);

    tokio::select! {
        result = server::run(state) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("realm-join shutting down");
    Ok(())
}
