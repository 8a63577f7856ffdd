//! JSON-RPC transport to the IPA server
//!
//! The server speaks a JSON-RPC dialect on `/ipa/session/json`:
//!
//! ```text
//! {"method": "host_add", "params": [["h1.example.test"], {"force": true, "version": "2.146"}], "id": 0}
//! {"error": null, "result": {...}, "id": 0}
//! ```
//!
//! Sessions are cookie based. `connect` performs the Kerberos login and the
//! cookie jar of the reqwest client carries the session from then on.

use std::time::Duration;

use reqwest::header::{AUTHORIZATION, REFERER};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use super::ticket::Ticket;
use super::DirectoryError;

/// One JSON-RPC request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    /// Positional and keyword arguments
    pub params: (Vec<Value>, Map<String, Value>),
    pub id: u64,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, args: Vec<Value>, options: Map<String, Value>) -> Self {
        Self {
            method: method.into(),
            params: (args, options),
            id: 0,
        }
    }

    pub fn args(&self) -> &[Value] {
        &self.params.0
    }

    pub fn options(&self) -> &Map<String, Value> {
        &self.params.1
    }
}

/// Error object of a JSON-RPC response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

/// One JSON-RPC response
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub error: Option<RpcError>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub id: Option<u64>,
}

impl RpcResponse {
    pub fn ok(result: Value) -> Self {
        Self {
            error: None,
            result: Some(result),
            id: Some(0),
        }
    }

    pub fn error(code: i64, message: impl Into<String>) -> Self {
        Self {
            error: Some(RpcError {
                code,
                message: message.into(),
                name: None,
                data: None,
            }),
            result: None,
            id: Some(0),
        }
    }
}

/// Low-level channel to the IPA server (allows mocking in tests)
#[async_trait::async_trait]
pub trait Transport: Send {
    /// Establish an authenticated session with `server`
    async fn connect(&mut self, server: &str, ticket: Option<&Ticket>) -> Result<(), DirectoryError>;

    fn is_connected(&self) -> bool;

    fn disconnect(&mut self);

    /// Send one request on the established session
    async fn call(&mut self, request: &RpcRequest) -> Result<RpcResponse, DirectoryError>;
}

/// Production transport over HTTPS
pub struct HttpTransport {
    timeout: Duration,
    client: Option<reqwest::Client>,
    server: Option<String>,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            client: None,
            server: None,
        }
    }

    fn build_client(&self) -> Result<reqwest::Client, DirectoryError> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .cookie_store(true)
            .user_agent(concat!("realm-join/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DirectoryError::Communication(format!("HTTP client: {}", e)))
    }
}

fn request_error(e: reqwest::Error) -> DirectoryError {
    if e.is_decode() {
        DirectoryError::InvalidData(e.to_string())
    } else {
        DirectoryError::Communication(e.to_string())
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn connect(&mut self, server: &str, ticket: Option<&Ticket>) -> Result<(), DirectoryError> {
        self.disconnect();
        let client = self.build_client()?;

        let mut login = client
            .post(format!("https://{}/ipa/session/login_kerberos", server))
            .header(REFERER, format!("https://{}/ipa", server));
        if let Some(token) = ticket.and_then(|t| t.negotiate_token.as_ref()) {
            login = login.header(AUTHORIZATION, format!("Negotiate {}", token.as_str()));
        }

        let response = login.send().await.map_err(request_error)?;
        match response.status() {
            status if status.is_success() => {}
            StatusCode::UNAUTHORIZED => {
                return Err(DirectoryError::CredentialExpired(
                    "IPA rejected the Kerberos login".into(),
                ))
            }
            status => {
                return Err(DirectoryError::Communication(format!(
                    "IPA login returned {}",
                    status
                )))
            }
        }

        debug!(server, "IPA session established");
        self.client = Some(client);
        self.server = Some(server.to_string());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    fn disconnect(&mut self) {
        self.client = None;
        self.server = None;
    }

    async fn call(&mut self, request: &RpcRequest) -> Result<RpcResponse, DirectoryError> {
        let (client, server) = match (&self.client, &self.server) {
            (Some(client), Some(server)) => (client, server),
            _ => return Err(DirectoryError::Communication("not connected".into())),
        };

        let response = client
            .post(format!("https://{}/ipa/session/json", server))
            .header(REFERER, format!("https://{}/ipa", server))
            .json(request)
            .send()
            .await
            .map_err(request_error)?;

        if response.status() == StatusCode::UNAUTHORIZED {
            self.disconnect();
            return Err(DirectoryError::CredentialExpired("IPA session expired".into()));
        }
        if !response.status().is_success() {
            return Err(DirectoryError::Communication(format!(
                "{} returned {}",
                request.method,
                response.status()
            )));
        }

        response.json::<RpcResponse>().await.map_err(request_error)
    }
}
