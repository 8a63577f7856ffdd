//! Services layer for realm-join
//!
//! Business logic shared by the join API and the notification listener.
//!
//! ## Services
//!
//! - **Enrollment**: join request validation, host registration, service
//!   principal setup
//! - **Naming**: instance host names inside the IPA domain

pub mod enrollment;
pub mod naming;

pub use enrollment::{
    compact_services, flag_set, managed_services, queue_services, HostContext, JoinRequest,
    JoinResponse, JoinService,
};
pub use naming::{normalize_label, HostNaming};

use crate::ipa::IpaClient;

/// Creates IPA clients (allows mocking in tests).
///
/// Every client owns its own session, so a client is never shared between
/// concurrent requests or workers.
pub trait ClientFactory: Send + Sync {
    fn create(&self) -> IpaClient;
}
