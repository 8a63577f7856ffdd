//! Service-level error type shared by the join API and the notification listener

use hyper::StatusCode;
use thiserror::Error;

use crate::ipa::DirectoryError;

/// Explanation returned for 5xx faults; internal detail stays in the logs.
const SERVER_FAULT_EXPLANATION: &str =
    "The server has either erred or is incapable of performing the requested operation.";

#[derive(Debug, Error)]
pub enum JoinError {
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error(
        "Provided notification version {provided_major}.{provided_minor} did not match \
         expected {expected_major}.{expected_minor} for {event_type}"
    )]
    VersionMismatch {
        event_type: String,
        provided_major: u32,
        provided_minor: u32,
        expected_major: u32,
        expected_minor: u32,
    },

    #[error("NATS error: {0}")]
    Nats(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, JoinError>;

/// Instance or image metadata: string keys to string values
pub type Metadata = std::collections::BTreeMap<String, String>;

impl JoinError {
    /// HTTP status used when this error reaches the join API caller
    pub fn status_code(&self) -> StatusCode {
        match self {
            JoinError::BadRequest(_) | JoinError::Json(_) => StatusCode::BAD_REQUEST,
            JoinError::Forbidden(_) => StatusCode::FORBIDDEN,
            JoinError::NotFound(_) => StatusCode::NOT_FOUND,
            JoinError::Directory(DirectoryError::MalformedPrincipal(_)) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short caller-facing message. Server faults never echo remote diagnostics.
    pub fn explanation(&self) -> String {
        if self.status_code().is_server_error() {
            SERVER_FAULT_EXPLANATION.to_string()
        } else {
            self.to_string()
        }
    }

    /// Whether the notification that produced this error should be redelivered
    pub fn requeue(&self) -> bool {
        matches!(self, JoinError::VersionMismatch { .. })
    }
}

/// Name of the JSON fault envelope for a status code
pub fn fault_name(status: StatusCode) -> &'static str {
    match status.as_u16() {
        400 => "badRequest",
        401 => "unauthorized",
        403 => "forbidden",
        404 => "itemNotFound",
        405 => "badMethod",
        409 => "conflictingRequest",
        413 => "overLimit",
        415 => "badMediaType",
        501 => "notImplemented",
        503 => "serviceUnavailable",
        _ => "computeFault",
    }
}
