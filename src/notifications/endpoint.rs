//! Notification handling
//!
//! Keeps IPA in step with instance lifecycle and floating IP changes:
//! deleted instances lose their host entry, DNS records, per-network
//! subhosts and any managed service no other host still uses.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::messages::{Event, ImageSource, InstanceInfo, Notification};
use crate::cloud::CloudMetadata;
use crate::config::NotificationFormat;
use crate::ipa::{principal_host, DirectoryError, IpaClient};
use crate::services::{compact_services, flag_set, managed_services, queue_services, HostContext, HostNaming};
use crate::types::{Metadata, Result};

/// What to tell the bus about a processed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Handled,
    /// Handling failed; the failure was logged and the message is dropped
    Failed,
    /// Not an event this listener acts on, or undecodable
    Ignored,
    /// Redeliver later
    Requeue,
}

impl Disposition {
    pub fn requeue(self) -> bool {
        self == Disposition::Requeue
    }
}

/// Applies notifications to IPA
pub struct NotificationEndpoint {
    cloud: Arc<dyn CloudMetadata>,
    naming: HostNaming,
    format: NotificationFormat,
}

impl NotificationEndpoint {
    pub fn new(cloud: Arc<dyn CloudMetadata>, naming: HostNaming, format: NotificationFormat) -> Self {
        Self { cloud, naming, format }
    }

    /// Decode and handle one raw bus message
    pub async fn process(&self, ipa: &mut IpaClient, raw: &[u8]) -> Disposition {
        let notification: Notification = match serde_json::from_slice(raw) {
            Ok(n) => n,
            Err(e) => {
                warn!("Dropping undecodable notification: {}", e);
                return Disposition::Ignored;
            }
        };

        debug!(
            publisher = %notification.publisher_id,
            event_type = %notification.event_type,
            "Notification received"
        );

        let event = match Event::parse(&notification, self.format) {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!(event_type = %notification.event_type, "Status update or unknown event");
                return Disposition::Ignored;
            }
            Err(e) if e.requeue() => {
                warn!("{}", e);
                return Disposition::Requeue;
            }
            Err(e) => {
                error!(event_type = %notification.event_type, error = %e, "Malformed notification");
                return Disposition::Ignored;
            }
        };

        match self.handle(ipa, event).await {
            Ok(()) => Disposition::Handled,
            Err(e) if e.requeue() => Disposition::Requeue,
            Err(e) => {
                error!(event_type = %notification.event_type, error = %e, "Notification handling failed");
                Disposition::Failed
            }
        }
    }

    /// Apply one decoded event
    pub async fn handle(&self, ipa: &mut IpaClient, event: Event) -> Result<()> {
        if !ipa.configured() {
            debug!("IPA is not configured, ignoring notification");
            return Ok(());
        }

        match event {
            Event::InstanceCreated(instance) => {
                let project = self.project_name(&instance).await?;
                let domain = ipa.domain()?;
                let hostname = self.context(&domain, project.as_deref()).fqdn(&instance.hostname);
                info!("Add new host {} ({})", instance.instance_id, hostname);
                Ok(())
            }
            Event::InstanceUpdated(instance) => {
                if instance.state.as_deref() == Some("deleted") {
                    self.delete_instance(ipa, &instance).await
                } else {
                    self.update_services(ipa, &instance).await
                }
            }
            Event::InstanceDeleted(instance) => self.delete_instance(ipa, &instance).await,
            Event::FloatingIpAssociated { instance_id, floating_ip } => {
                info!("Associate floating IP {}", floating_ip);
                match self.cloud.server_name(&instance_id).await? {
                    Some(server) => Ok(ipa.add_ip(&server, &floating_ip).await?),
                    None => {
                        error!("Could not resolve {} into a hostname", instance_id);
                        Ok(())
                    }
                }
            }
            Event::FloatingIpDisassociated { instance_id, floating_ip } => {
                info!("Disassociate floating IP {}", floating_ip);
                match self.cloud.server_name(&instance_id).await? {
                    Some(server) => Ok(ipa.remove_ip(&server, &floating_ip).await?),
                    None => {
                        error!("Could not resolve {} into a hostname", instance_id);
                        Ok(())
                    }
                }
            }
            Event::FloatingIpUpdated { floating_ip, port_id } => {
                let Some(port_id) = port_id else {
                    info!("Neutron floating IP disassociate: {}", floating_ip);
                    return Ok(());
                };
                info!("Neutron floating IP associate: {}", floating_ip);
                let Some(device_id) = self.cloud.port_device(&port_id).await? else {
                    error!("No device attached to port {}", port_id);
                    return Ok(());
                };
                match self.cloud.server_name(&device_id).await? {
                    Some(server) => Ok(ipa.add_ip(&server, &floating_ip).await?),
                    None => {
                        error!("Could not resolve {} into a hostname", device_id);
                        Ok(())
                    }
                }
            }
        }
    }

    fn context<'a>(&self, domain: &'a str, project: Option<&'a str>) -> HostContext<'a> {
        HostContext {
            naming: self.naming,
            domain,
            project,
        }
    }

    async fn project_name(&self, instance: &InstanceInfo) -> Result<Option<String>> {
        match (&instance.project_id, self.naming.project_subdomain) {
            (Some(project_id), true) => Ok(Some(self.cloud.project_name(project_id).await?)),
            _ => Ok(None),
        }
    }

    async fn image_metadata(&self, image: &ImageSource) -> Metadata {
        match image {
            ImageSource::Properties(properties) => properties.clone(),
            ImageSource::Lookup(image_id) => match self.cloud.image_properties(image_id).await {
                Ok(properties) => properties,
                Err(e) => {
                    warn!(image_id = %image_id, error = %e, "Image lookup failed");
                    Metadata::new()
                }
            },
            ImageSource::Unknown => Metadata::new(),
        }
    }

    async fn enrollment_requested(&self, instance: &InstanceInfo) -> bool {
        flag_set(&instance.metadata, "ipa_enroll")
            || flag_set(&self.image_metadata(&instance.image).await, "ipa_enroll")
    }

    async fn update_services(&self, ipa: &mut IpaClient, instance: &InstanceInfo) -> Result<()> {
        if !self.enrollment_requested(instance).await {
            debug!(instance_id = %instance.instance_id, "IPA enrollment not requested, skipping update");
            return Ok(());
        }

        let project = self.project_name(instance).await?;
        let domain = ipa.domain()?;
        let ctx = self.context(&domain, project.as_deref());
        info!("Updating services for {}", ctx.fqdn(&instance.hostname));

        ipa.start_batch_operation();
        queue_services(ipa, &ctx, &instance.hostname, &instance.metadata)?;
        ipa.flush_batch_operation().await?;
        Ok(())
    }

    async fn delete_instance(&self, ipa: &mut IpaClient, instance: &InstanceInfo) -> Result<()> {
        let project = self.project_name(instance).await?;
        let domain = ipa.domain()?;
        let ctx = self.context(&domain, project.as_deref());
        let hostname = ctx.fqdn(&instance.hostname);

        if !self.enrollment_requested(instance).await {
            info!("IPA enrollment not requested, skipping delete of {}", hostname);
            return Ok(());
        }

        info!("Delete host {} ({})", instance.instance_id, hostname);
        ipa.delete_host(&hostname).await?;
        self.delete_subhosts(ipa, &ctx, &instance.hostname, &instance.metadata).await
    }

    /// Remove per-network subhosts, then managed services whose last
    /// managing host was this instance
    async fn delete_subhosts(
        &self,
        ipa: &mut IpaClient,
        ctx: &HostContext<'_>,
        host_short: &str,
        metadata: &Metadata,
    ) -> Result<()> {
        let compact = compact_services(metadata)?;
        if !compact.is_empty() {
            let mut hosts = BTreeSet::new();
            ipa.start_batch_operation();
            for networks in compact.values() {
                for host in ctx.compact_subhosts(host_short, networks) {
                    if hosts.insert(host.clone()) {
                        ipa.delete_subhost(&host, true).await?;
                    }
                }
            }
            ipa.flush_batch_operation().await?;
        }

        let mut services_deleted = BTreeSet::new();
        let mut hosts_deleted = BTreeSet::new();
        for principal in managed_services(metadata) {
            if !services_deleted.contains(&principal) {
                match ipa.service_has_hosts(&principal).await {
                    Ok(false) => {}
                    Ok(true) => continue,
                    Err(DirectoryError::NotFound(_)) => continue,
                    Err(DirectoryError::MalformedPrincipal(_)) => {
                        warn!(principal = %principal, "Skipping malformed managed service");
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
                ipa.delete_service(&principal, false).await?;
                services_deleted.insert(principal.clone());
            }

            let Some(host) = principal_host(&principal) else {
                continue;
            };
            if !hosts_deleted.contains(host) && !ipa.host_has_services(host).await? {
                ipa.delete_subhost(host, false).await?;
                hosts_deleted.insert(host.to_string());
            }
        }

        Ok(())
    }
}
