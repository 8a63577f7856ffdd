//! Command invoker
//!
//! Sends single commands over a [`Connection`], injecting the API version
//! and turning remote error codes into outcomes via the rule table.

use serde_json::{Map, Value};
use tracing::debug;

use super::connection::Connection;
use super::error::{lookup, translate, ErrorKind, Outcome};
use super::transport::RpcRequest;
use super::DirectoryError;

/// API version sent with every command (IPA 4.2.0 compatible)
pub const API_VERSION: &str = "2.146";

/// One directory command: verb, positional and keyword arguments
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub method: String,
    pub args: Vec<Value>,
    pub options: Map<String, Value>,
}

impl Command {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            args: Vec::new(),
            options: Map::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn args(mut self, values: impl IntoIterator<Item = Value>) -> Self {
        self.args.extend(values);
        self
    }

    pub fn option(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.options.insert(name.to_string(), value.into());
        self
    }

    /// Options with the API version filled in if the caller did not set one
    fn versioned_options(&self) -> Map<String, Value> {
        let mut options = self.options.clone();
        options
            .entry("version")
            .or_insert_with(|| Value::String(API_VERSION.to_string()));
        options
    }

    pub fn to_request(&self) -> RpcRequest {
        RpcRequest::new(self.method.clone(), self.args.clone(), self.versioned_options())
    }

    /// Entry of a `batch` command: `{"method": ..., "params": [args, options]}`
    pub fn to_batch_entry(&self) -> Value {
        serde_json::json!({
            "method": self.method,
            "params": [self.args, self.options],
        })
    }
}

/// Executes commands against the directory, recovering from expired
/// credentials and transient network failures
pub struct DirectoryClient {
    connection: Connection,
}

impl DirectoryClient {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Run a command and return its `result` member.
    ///
    /// Errors the rule table ignores come back as `Value::Null`.
    pub async fn invoke(&mut self, command: Command) -> Result<Value, DirectoryError> {
        self.connection.ensure_connected().await?;

        let request = command.to_request();
        let mut refreshed = false;
        let mut network_failures = 0;

        let response = loop {
            match self.connection.call(&request).await {
                Ok(response) => {
                    let expired = !refreshed
                        && response
                            .error
                            .as_ref()
                            .is_some_and(|error| is_credential_code(&command.method, error.code));
                    if !expired {
                        break response;
                    }
                    debug!(method = %command.method, "Refresh authentication");
                    refreshed = true;
                    self.connection.reconnect().await?;
                }
                Err(e) if e.is_credential() && !refreshed => {
                    debug!(method = %command.method, "Refresh authentication");
                    refreshed = true;
                    self.connection.reconnect().await?;
                }
                Err(e) if e.is_network() => {
                    network_failures += 1;
                    if network_failures >= self.connection.max_tries() || !self.connection.backoff().await {
                        self.connection.mark_stale();
                        return Err(e);
                    }
                    self.connection.ensure_connected().await?;
                }
                Err(e) => {
                    if e.is_credential() {
                        self.connection.mark_stale();
                    }
                    return Err(e);
                }
            }
        };

        debug!(method = %command.method, "IPA command complete");
        match response.error {
            Some(error) => {
                if let Err(e) = translate(&command.method, error.code, &error.message) {
                    if e.is_credential() {
                        self.connection.mark_stale();
                    }
                    return Err(e);
                }
                Ok(Value::Null)
            }
            None => Ok(response.result.unwrap_or(Value::Null)),
        }
    }
}

fn is_credential_code(method: &str, code: i64) -> bool {
    matches!(
        lookup(code, method),
        Some(Outcome::Raise(ErrorKind::CredentialExpired))
    )
}
