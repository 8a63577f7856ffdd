//! FreeIPA client
//!
//! Layered bottom-up:
//! - [`ticket`] / [`session`]: service identity, credential cache, backoff
//! - [`connection`]: reconnect state machine over a [`transport::Transport`]
//! - [`client`]: single commands with error-code translation ([`error`])
//! - [`batch`]: ordered multi-command round trips
//! - [`ops`]: host, service and DNS operations used by the join API and
//!   the notification listener

pub mod batch;
pub mod client;
pub mod connection;
pub mod error;
pub mod ops;
pub mod principal;
pub mod session;
pub mod ticket;
pub mod transport;

pub use batch::BatchJob;
pub use client::{Command, DirectoryClient, API_VERSION};
pub use connection::{Connection, ConnectionState};
pub use error::DirectoryError;
pub use ops::IpaClient;
pub use principal::{principal_host, split_hostname, split_principal, Principal};
pub use session::{Backoff, Session, SessionSettings};
pub use ticket::{IpaDefaults, KinitTicketSource, Ticket, TicketSource};
pub use transport::{HttpTransport, RpcRequest, RpcResponse, Transport};
