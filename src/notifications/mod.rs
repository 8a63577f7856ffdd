//! Compute and network notification handling
//!
//! - **messages**: envelope decoding and versioned payload checks
//! - **endpoint**: applies events to IPA
//! - **listener**: JetStream consumer feeding a pool of workers

pub mod endpoint;
pub mod listener;
pub mod messages;

pub use endpoint::{Disposition, NotificationEndpoint};
pub use listener::NotificationListener;
pub use messages::{Event, ImageSource, InstanceInfo, Notification};
