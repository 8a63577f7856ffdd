//! Health check endpoints
//!
//! - /health, /healthz - Liveness probe, 200 whenever the process is serving
//! - /version - build information for deployment verification
//!
//! `ipa_configured` reports whether ipa-client-install has run on this
//! node. An unconfigured node still answers join calls, with `{}`.

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Serialize;

use super::json_response;
use crate::ipa::ticket::client_configured;
use crate::server::AppState;

/// Liveness response
#[derive(Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    /// 'online' when IPA is configured, 'disabled' otherwise
    pub status: &'static str,
    pub version: &'static str,
    pub ipa_configured: bool,
    pub timestamp: String,
}

fn build_health_response(state: &AppState) -> HealthResponse {
    let ipa_configured = client_configured(&state.args.directory.ipa_conf);

    HealthResponse {
        healthy: true,
        status: if ipa_configured { "online" } else { "disabled" },
        version: env!("CARGO_PKG_VERSION"),
        ipa_configured,
        timestamp: chrono::Utc::now().to_rfc3339(),
    }
}

/// Handle liveness probe (/health, /healthz)
pub fn health_check(state: Arc<AppState>) -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, &build_health_response(&state))
}

/// Version information for deployment verification
#[derive(Serialize)]
pub struct VersionResponse {
    /// Cargo package version
    pub version: &'static str,
    /// Git commit hash (short)
    pub commit: &'static str,
    /// Git commit hash (full)
    pub commit_full: &'static str,
    /// Build timestamp
    pub build_time: &'static str,
    /// Service name
    pub service: &'static str,
}

/// Handle version endpoint (/version)
pub fn version_info() -> Response<Full<Bytes>> {
    let response = VersionResponse {
        version: env!("CARGO_PKG_VERSION"),
        commit: option_env!("GIT_COMMIT_SHORT").unwrap_or("unknown"),
        commit_full: option_env!("GIT_COMMIT_FULL").unwrap_or("unknown"),
        build_time: option_env!("BUILD_TIMESTAMP").unwrap_or("unknown"),
        service: "realm-join",
    };

    json_response(StatusCode::OK, &response)
}
