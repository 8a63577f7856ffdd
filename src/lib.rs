//! realm-join - FreeIPA enrollment shim for cloud instances
//!
//! Translates instance lifecycle events into directory operations so that
//! freshly provisioned machines can join the realm with a one-time password.
//!
//! ## Services
//!
//! - **Join API**: HTTP endpoint called by the metadata service at instance
//!   build time; registers the host and returns its OTP
//! - **Notification listener**: consumes compute/network notifications from
//!   NATS JetStream and cleans up hosts, subhosts, services and DNS records
//! - **IPA client**: ticket/session handling, reconnecting JSON-RPC
//!   connection, command invocation with error translation, batching

pub mod cloud;
pub mod config;
pub mod ipa;
pub mod nats;
pub mod notifications;
pub mod routes;
pub mod server;
pub mod services;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{Args, DirectoryArgs, NotifyArgs};
pub use server::{run, AppState};
pub use types::{JoinError, Result};
