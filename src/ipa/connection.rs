//! Connection controller
//!
//! Keeps one authenticated channel to the IPA server alive for a session.
//!
//! ```text
//! Disconnected ──► Connecting{0} ──connect + ping ok──► Connected
//!                    │    ▲
//!    credential or   │    │ kinit again, back off
//!    network failure └────┘ (attempt + 1)
//!                    │
//!                    └── attempts == max_tries ──► ExhaustedRetries
//! ```
//!
//! ExhaustedRetries ends one connect cycle only. The next command starts a
//! fresh cycle, so a worker recovers once the server comes back.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::error::translate;
use super::session::Session;
use super::ticket::{TicketManager, TicketSource};
use super::transport::{RpcRequest, RpcResponse, Transport};
use super::DirectoryError;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting { attempt: u32 },
    Connected,
    ExhaustedRetries,
}

pub struct Connection {
    session: Session,
    tickets: TicketManager,
    transport: Box<dyn Transport>,
    state: ConnectionState,
}

impl Connection {
    pub fn new(
        session: Session,
        tickets: Arc<dyn TicketSource>,
        transport: Box<dyn Transport>,
    ) -> Self {
        Self {
            session,
            tickets: TicketManager::new(tickets),
            transport,
            state: ConnectionState::Disconnected,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected && self.transport.is_connected()
    }

    /// Forget the current channel; the next command reconnects
    pub fn mark_stale(&mut self) {
        self.transport.disconnect();
        self.state = ConnectionState::Disconnected;
    }

    pub async fn ensure_connected(&mut self) -> Result<(), DirectoryError> {
        if self.is_connected() {
            return Ok(());
        }
        self.reconnect().await
    }

    /// Sleep for the next backoff delay. Returns false when the session has
    /// no backoff policy.
    pub async fn backoff(&mut self) -> bool {
        match self.session.next_backoff() {
            Some(delay) => {
                debug!(delay_secs = delay.as_secs_f64(), "Backing off");
                tokio::time::sleep(delay).await;
                true
            }
            None => false,
        }
    }

    async fn refresh_ticket(&mut self, principal: &str, server: &str) -> Result<(), DirectoryError> {
        self.tickets
            .acquire(
                principal,
                self.session.keytab(),
                self.session.cache(),
                server,
            )
            .await
            .map(|_| ())
    }

    /// Run one connect cycle, bounded by the session's `max_tries`
    pub async fn reconnect(&mut self) -> Result<(), DirectoryError> {
        let principal = self.session.principal()?;
        let server = self.session.server()?;
        let max_tries = self.session.max_tries();

        if self.tickets.current().is_none() {
            self.refresh_ticket(&principal, &server).await?;
        }

        let mut last_error = None;
        for attempt in 0..max_tries {
            self.state = ConnectionState::Connecting { attempt };
            debug!(attempt = attempt + 1, max_tries, "Connecting to IPA");

            if self.transport.is_connected() {
                self.transport.disconnect();
            }

            match self.try_connect(&server).await {
                Ok(()) => {
                    self.state = ConnectionState::Connected;
                    self.session.reset_backoff();
                    if attempt > 0 {
                        info!(server = %server, attempts = attempt + 1, "Reconnected to IPA");
                    }
                    return Ok(());
                }
                Err(e) if e.is_credential() => {
                    debug!(error = %e, "kinit again");
                    if let Err(kinit) = self.refresh_ticket(&principal, &server).await {
                        debug!(error = %kinit, "kinit failed");
                    }
                    if attempt > 0 {
                        self.backoff().await;
                    }
                    last_error = Some(e);
                }
                Err(e) if e.is_network() => {
                    debug!(error = %e, "IPA unreachable");
                    self.backoff().await;
                    last_error = Some(e);
                }
                Err(e) => {
                    self.mark_stale();
                    return Err(e);
                }
            }
        }

        self.transport.disconnect();
        self.state = ConnectionState::ExhaustedRetries;

        match last_error {
            Some(e) if e.is_network() && !self.session.has_backoff() => {
                warn!(server = %server, error = %e, "IPA unreachable");
                Err(e)
            }
            last => {
                let reason = last.map_or_else(|| "no attempts made".to_string(), |e| e.to_string());
                warn!(server = %server, attempts = max_tries, reason = %reason, "Giving up on IPA connection");
                Err(DirectoryError::ExhaustedRetries {
                    attempts: max_tries,
                    reason,
                })
            }
        }
    }

    /// Transport connect followed by a ping to force a real round trip
    async fn try_connect(&mut self, server: &str) -> Result<(), DirectoryError> {
        self.transport.connect(server, self.tickets.current()).await?;

        let ping = RpcRequest::new("ping", Vec::new(), Default::default());
        let response = self.transport.call(&ping).await?;
        match response.error {
            Some(error) => translate("ping", error.code, &error.message),
            None => Ok(()),
        }
    }

    /// Send a request on the current channel without any recovery
    pub async fn call(&mut self, request: &RpcRequest) -> Result<RpcResponse, DirectoryError> {
        self.transport.call(request).await
    }

    pub fn max_tries(&self) -> u32 {
        self.session.max_tries()
    }

    #[cfg(test)]
    pub(crate) fn backoff_interval(&mut self) -> Option<std::time::Duration> {
        self.session.next_backoff()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::testing::{credential_expired, test_session, FakeTicketSource, FakeTransport};

    fn connection(transport: &FakeTransport, tickets: &FakeTicketSource, backoff: bool) -> Connection {
        Connection::new(
            test_session(3, backoff.then_some(Duration::from_secs(2))),
            Arc::new(tickets.clone()),
            Box::new(transport.clone()),
        )
    }

    #[tokio::test]
    async fn test_connects_and_pings() {
        let transport = FakeTransport::new();
        let tickets = FakeTicketSource::new();
        let mut conn = connection(&transport, &tickets, false);

        conn.ensure_connected().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(transport.connects(), 1);
        assert_eq!(transport.methods(), vec!["ping"]);
        assert_eq!(tickets.acquired(), 1);

        // Already connected: no new round trip
        conn.ensure_connected().await.unwrap();
        assert_eq!(transport.connects(), 1);
    }

    #[tokio::test]
    async fn test_credential_failures_below_budget_recover() {
        let transport = FakeTransport::new();
        transport.push_connect(Err(credential_expired()));
        transport.push_connect(Err(credential_expired()));
        let tickets = FakeTicketSource::new();
        let mut conn = connection(&transport, &tickets, false);

        conn.ensure_connected().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(transport.connects(), 3);
        // Initial ticket plus one refresh per credential failure
        assert_eq!(tickets.acquired(), 3);
    }

    #[tokio::test]
    async fn test_credential_failures_at_budget_exhaust() {
        let transport = FakeTransport::new();
        for _ in 0..3 {
            transport.push_connect(Err(credential_expired()));
        }
        let tickets = FakeTicketSource::new();
        let mut conn = connection(&transport, &tickets, false);

        let err = conn.ensure_connected().await.unwrap_err();
        assert!(matches!(err, DirectoryError::ExhaustedRetries { attempts: 3, .. }));
        assert_eq!(conn.state(), ConnectionState::ExhaustedRetries);
        assert!(!transport.is_connected_now());
    }

    #[tokio::test]
    async fn test_exhaustion_is_not_permanent() {
        let transport = FakeTransport::new();
        for _ in 0..3 {
            transport.push_connect(Err(credential_expired()));
        }
        let tickets = FakeTicketSource::new();
        let mut conn = connection(&transport, &tickets, false);

        assert!(conn.ensure_connected().await.is_err());
        conn.ensure_connected().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_network_failure_without_backoff_propagates() {
        let transport = FakeTransport::new();
        for _ in 0..3 {
            transport.push_connect(Err(DirectoryError::Communication("refused".into())));
        }
        let tickets = FakeTicketSource::new();
        let mut conn = connection(&transport, &tickets, false);

        let err = conn.ensure_connected().await.unwrap_err();
        assert_eq!(err, DirectoryError::Communication("refused".into()));
        assert_eq!(transport.connects(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_failure_with_backoff_sleeps_between_attempts() {
        let transport = FakeTransport::new();
        transport.push_connect(Err(DirectoryError::Communication("refused".into())));
        transport.push_connect(Err(DirectoryError::Communication("refused".into())));
        let tickets = FakeTicketSource::new();
        let mut conn = connection(&transport, &tickets, true);

        let started = tokio::time::Instant::now();
        conn.ensure_connected().await.unwrap();
        // 2s after the first failure, 4s after the second
        assert_eq!(started.elapsed(), Duration::from_secs(6));
        // Successful connect resets the delay
        assert_eq!(conn.backoff_interval(), Some(Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_credential_failure_does_not_back_off() {
        let transport = FakeTransport::new();
        transport.push_connect(Err(credential_expired()));
        let tickets = FakeTicketSource::new();
        let mut conn = connection(&transport, &tickets, true);

        let started = tokio::time::Instant::now();
        conn.ensure_connected().await.unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_failed_ping_is_retried() {
        let transport = FakeTransport::new();
        transport.push_ping(crate::ipa::RpcResponse::error(1101, "ticket expired"));
        let tickets = FakeTicketSource::new();
        let mut conn = connection(&transport, &tickets, false);

        conn.ensure_connected().await.unwrap();
        assert_eq!(transport.connects(), 2);
    }

    #[tokio::test]
    async fn test_initial_ticket_failure_is_authentication_error() {
        let transport = FakeTransport::new();
        let tickets = FakeTicketSource::failing("keytab unreadable");
        let mut conn = connection(&transport, &tickets, false);

        let err = conn.ensure_connected().await.unwrap_err();
        assert!(matches!(err, DirectoryError::Authentication(_)));
        assert_eq!(transport.connects(), 0);
    }

    #[tokio::test]
    async fn test_permanent_error_stops_the_cycle() {
        let transport = FakeTransport::new();
        transport.push_connect(Err(DirectoryError::Authentication("bad key".into())));
        let tickets = FakeTicketSource::new();
        let mut conn = connection(&transport, &tickets, false);

        let err = conn.ensure_connected().await.unwrap_err();
        assert!(matches!(err, DirectoryError::Authentication(_)));
        assert_eq!(transport.connects(), 1);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }
}
