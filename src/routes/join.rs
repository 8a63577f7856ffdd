//! Join endpoint
//!
//! `POST /` (and `/v1`) with a JSON body describing the instance being
//! built. Responds with `{"ipaotp": ..., "hostname": ...}`, or `{}` when the
//! instance did not ask to be enrolled.

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::{Response, StatusCode};
use tracing::{debug, warn};

use super::{error_response, fault, json_response};
use crate::server::AppState;
use crate::services::JoinRequest;

/// Largest join body accepted
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// Handle a join request
pub async fn handle_join<B>(state: Arc<AppState>, body: B) -> Response<Full<Bytes>>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let bytes = match Limited::new(body, MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            warn!("Join body larger than {} bytes", MAX_BODY_BYTES);
            return fault(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large");
        }
        Err(e) => {
            warn!("Failed to read join body: {}", e);
            return fault(StatusCode::BAD_REQUEST, "Failed to read request body");
        }
    };

    if bytes.is_empty() {
        return fault(StatusCode::BAD_REQUEST, "No body in request");
    }

    let request: JoinRequest = match serde_json::from_slice(&bytes) {
        Ok(request) => request,
        Err(e) => {
            debug!("Rejecting join body: {}", e);
            return fault(StatusCode::BAD_REQUEST, &format!("Invalid JSON body: {}", e));
        }
    };

    match state.join.create(request).await {
        Ok(response) => json_response(StatusCode::OK, &response),
        Err(e) => error_response(&e),
    }
}
