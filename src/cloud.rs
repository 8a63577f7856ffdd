//! Cloud metadata lookups
//!
//! The join API and the notification listener need a handful of facts from
//! the compute, image, identity and network services. They are reached
//! through [`CloudMetadata`] so deployments can plug in a real client.

use tracing::debug;

use crate::types::{Metadata, Result};

/// Read-only view of the cloud APIs
#[async_trait::async_trait]
pub trait CloudMetadata: Send + Sync {
    /// Properties of an image. Fails when the image cannot be found.
    async fn image_properties(&self, image_id: &str) -> Result<Metadata>;

    async fn instance_exists(&self, instance_id: &str) -> Result<bool>;

    /// Display name of a project
    async fn project_name(&self, project_id: &str) -> Result<String>;

    /// Name of a server, if it still exists
    async fn server_name(&self, instance_id: &str) -> Result<Option<String>>;

    /// Device (server id) a network port is attached to
    async fn port_device(&self, port_id: &str) -> Result<Option<String>>;
}

/// Used when no cloud API is configured.
///
/// Images have no properties, every instance exists, project names are
/// their ids, and server or port lookups find nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCloud;

#[async_trait::async_trait]
impl CloudMetadata for NoCloud {
    async fn image_properties(&self, image_id: &str) -> Result<Metadata> {
        debug!(image_id, "No image service, assuming no properties");
        Ok(Metadata::new())
    }

    async fn instance_exists(&self, _instance_id: &str) -> Result<bool> {
        Ok(true)
    }

    async fn project_name(&self, project_id: &str) -> Result<String> {
        Ok(project_id.to_string())
    }

    async fn server_name(&self, _instance_id: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn port_device(&self, _port_id: &str) -> Result<Option<String>> {
        Ok(None)
    }
}
