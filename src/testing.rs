//! Scripted fakes for the IPA transport, ticket source and cloud APIs

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use crate::cloud::CloudMetadata;
use crate::ipa::ticket::TicketRequest;
use crate::ipa::{
    DirectoryClient, Connection, DirectoryError, IpaClient, IpaDefaults, RpcRequest, RpcResponse,
    Session, SessionSettings, Ticket, TicketSource, Transport,
};
use crate::services::ClientFactory;
use crate::types::{JoinError, Metadata, Result};

/// Decode the JSON body of a route response
pub async fn body_json(response: hyper::Response<http_body_util::Full<bytes::Bytes>>) -> Value {
    use http_body_util::BodyExt;
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub fn credential_expired() -> DirectoryError {
    DirectoryError::CredentialExpired("Ticket expired".into())
}

pub fn test_defaults() -> IpaDefaults {
    IpaDefaults {
        host: "join.example.test".into(),
        realm: "EXAMPLE.TEST".into(),
        domain: Some("example.test".into()),
        server: Some("ipa.example.test".into()),
    }
}

pub fn test_session(max_tries: u32, backoff: Option<Duration>) -> Session {
    let settings = SessionSettings {
        max_tries,
        backoff,
        ..Default::default()
    };
    Session::preconfigured(settings, Some(test_defaults()))
}

pub fn fake_directory_client(transport: &FakeTransport, backoff: Option<Duration>) -> DirectoryClient {
    DirectoryClient::new(Connection::new(
        test_session(3, backoff),
        Arc::new(FakeTicketSource::new()),
        Box::new(transport.clone()),
    ))
}

pub fn fake_ipa_client(transport: &FakeTransport) -> IpaClient {
    IpaClient::new(
        test_session(3, None),
        Arc::new(FakeTicketSource::new()),
        Box::new(transport.clone()),
    )
}

pub fn unconfigured_ipa_client(transport: &FakeTransport) -> IpaClient {
    IpaClient::new(
        Session::preconfigured(SessionSettings::default(), None),
        Arc::new(FakeTicketSource::new()),
        Box::new(transport.clone()),
    )
}

// ============================================================================
// Transport
// ============================================================================

#[derive(Default)]
struct TransportState {
    connected: bool,
    connects: usize,
    connect_results: VecDeque<std::result::Result<(), DirectoryError>>,
    ping_responses: VecDeque<RpcResponse>,
    responses: VecDeque<std::result::Result<RpcResponse, DirectoryError>>,
    requests: Vec<RpcRequest>,
}

/// Transport answering from scripted queues and recording every request.
///
/// Pings succeed unless a ping response was queued. Commands with nothing
/// queued get an empty successful result.
#[derive(Clone, Default)]
pub struct FakeTransport {
    state: Arc<Mutex<TransportState>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut TransportState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn push_connect(&self, result: std::result::Result<(), DirectoryError>) {
        self.with(|s| s.connect_results.push_back(result));
    }

    pub fn push_ping(&self, response: RpcResponse) {
        self.with(|s| s.ping_responses.push_back(response));
    }

    pub fn push(&self, response: std::result::Result<RpcResponse, DirectoryError>) {
        self.with(|s| s.responses.push_back(response));
    }

    pub fn respond(&self, result: Value) {
        self.push(Ok(RpcResponse::ok(result)));
    }

    pub fn connects(&self) -> usize {
        self.with(|s| s.connects)
    }

    pub fn is_connected_now(&self) -> bool {
        self.with(|s| s.connected)
    }

    /// Every method sent, pings included
    pub fn methods(&self) -> Vec<String> {
        self.with(|s| s.requests.iter().map(|r| r.method.clone()).collect())
    }

    /// Requests other than connection pings
    pub fn requests(&self) -> Vec<RpcRequest> {
        self.with(|s| {
            s.requests
                .iter()
                .filter(|r| r.method != "ping")
                .cloned()
                .collect()
        })
    }

    pub fn commands(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.method).collect()
    }

    pub fn last_request(&self) -> Option<RpcRequest> {
        self.requests().pop()
    }
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
    async fn connect(
        &mut self,
        _server: &str,
        _ticket: Option<&Ticket>,
    ) -> std::result::Result<(), DirectoryError> {
        self.with(|s| {
            s.connects += 1;
            let result = s.connect_results.pop_front().unwrap_or(Ok(()));
            s.connected = result.is_ok();
            result
        })
    }

    fn is_connected(&self) -> bool {
        self.is_connected_now()
    }

    fn disconnect(&mut self) {
        self.with(|s| s.connected = false);
    }

    async fn call(&mut self, request: &RpcRequest) -> std::result::Result<RpcResponse, DirectoryError> {
        self.with(|s| {
            s.requests.push(request.clone());
            if request.method == "ping" {
                return Ok(s
                    .ping_responses
                    .pop_front()
                    .unwrap_or_else(|| RpcResponse::ok(serde_json::json!({"summary": "IPA server version 4.9"}))));
            }
            s.responses
                .pop_front()
                .unwrap_or_else(|| Ok(RpcResponse::ok(serde_json::json!({}))))
        })
    }
}

// ============================================================================
// Tickets
// ============================================================================

#[derive(Clone, Default)]
pub struct FakeTicketSource {
    acquired: Arc<Mutex<usize>>,
    failure: Option<String>,
}

impl FakeTicketSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Source whose every acquisition fails with an authentication error
    pub fn failing(reason: &str) -> Self {
        Self {
            failure: Some(reason.to_string()),
            ..Self::default()
        }
    }

    pub fn acquired(&self) -> usize {
        *self.acquired.lock().unwrap()
    }
}

#[async_trait::async_trait]
impl TicketSource for FakeTicketSource {
    async fn acquire(&self, request: TicketRequest<'_>) -> std::result::Result<Ticket, DirectoryError> {
        if let Some(reason) = &self.failure {
            return Err(DirectoryError::Authentication(reason.clone()));
        }
        *self.acquired.lock().unwrap() += 1;
        Ok(Ticket {
            principal: request.principal.to_string(),
            cache: request.cache.to_string(),
            negotiate_token: None,
        })
    }
}

// ============================================================================
// Client factory
// ============================================================================

/// Hands out IPA clients that all share one scripted transport
pub struct FakeClientFactory {
    pub transport: FakeTransport,
    pub configured: bool,
}

impl FakeClientFactory {
    pub fn configured(transport: &FakeTransport) -> Self {
        Self {
            transport: transport.clone(),
            configured: true,
        }
    }

    pub fn unconfigured(transport: &FakeTransport) -> Self {
        Self {
            transport: transport.clone(),
            configured: false,
        }
    }
}

impl ClientFactory for FakeClientFactory {
    fn create(&self) -> IpaClient {
        if self.configured {
            fake_ipa_client(&self.transport)
        } else {
            unconfigured_ipa_client(&self.transport)
        }
    }
}

// ============================================================================
// Cloud
// ============================================================================

#[derive(Default)]
pub struct FakeCloud {
    pub images: HashMap<String, Metadata>,
    pub missing_instances: HashSet<String>,
    pub projects: HashMap<String, String>,
    pub servers: HashMap<String, String>,
    pub ports: HashMap<String, String>,
}

impl FakeCloud {
    pub fn new() -> Self {
        let mut cloud = Self::default();
        cloud.images.insert("img1".into(), Metadata::new());
        cloud
    }

    pub fn with_image(mut self, id: &str, properties: &[(&str, &str)]) -> Self {
        self.images.insert(
            id.to_string(),
            properties
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        self
    }

    pub fn without_instance(mut self, id: &str) -> Self {
        self.missing_instances.insert(id.to_string());
        self
    }

    pub fn with_project(mut self, id: &str, name: &str) -> Self {
        self.projects.insert(id.to_string(), name.to_string());
        self
    }

    pub fn with_server(mut self, id: &str, name: &str) -> Self {
        self.servers.insert(id.to_string(), name.to_string());
        self
    }

    pub fn with_port(mut self, port: &str, device: &str) -> Self {
        self.ports.insert(port.to_string(), device.to_string());
        self
    }
}

#[async_trait::async_trait]
impl CloudMetadata for FakeCloud {
    async fn image_properties(&self, image_id: &str) -> Result<Metadata> {
        self.images
            .get(image_id)
            .cloned()
            .ok_or_else(|| JoinError::NotFound(format!("image {image_id}")))
    }

    async fn instance_exists(&self, instance_id: &str) -> Result<bool> {
        Ok(!self.missing_instances.contains(instance_id))
    }

    async fn project_name(&self, project_id: &str) -> Result<String> {
        Ok(self
            .projects
            .get(project_id)
            .cloned()
            .unwrap_or_else(|| project_id.to_string()))
    }

    async fn server_name(&self, instance_id: &str) -> Result<Option<String>> {
        Ok(self.servers.get(instance_id).cloned())
    }

    async fn port_device(&self, port_id: &str) -> Result<Option<String>> {
        Ok(self.ports.get(port_id).cloned())
    }
}
