//! HTTP routes for realm-join

pub mod health;
pub mod join;

pub use health::{health_check, version_info};
pub use join::handle_join;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;
use tracing::error;

use crate::types::{fault_name, JoinError};

/// JSON response with the given status
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(bytes) => {
            let mut response = Response::new(Full::new(Bytes::from(bytes)));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            error!("Failed to serialize response: {}", e);
            fault(StatusCode::INTERNAL_SERVER_ERROR, "Failed to serialize response")
        }
    }
}

/// Fault envelope: `{"badRequest": {"code": 400, "message": "..."}}`
pub fn fault(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut body = serde_json::Map::new();
    body.insert(
        fault_name(status).to_string(),
        serde_json::json!({
            "code": status.as_u16(),
            "message": message,
        }),
    );
    let body = serde_json::Value::Object(body);

    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Fault for an error that reached the HTTP boundary
pub fn error_response(err: &JoinError) -> Response<Full<Bytes>> {
    let status = err.status_code();
    if status.is_server_error() {
        error!(error = %err, "Request failed");
    }
    fault(status, &err.explanation())
}
