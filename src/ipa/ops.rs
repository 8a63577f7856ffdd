//! Host, service and DNS operations
//!
//! `add_host` and `delete_host` run immediately. Subhost and service
//! registration go through the batch so one provisioning event costs a
//! single round trip.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use super::batch::BatchJob;
use super::client::{Command, DirectoryClient};
use super::connection::Connection;
use super::principal::{split_hostname, split_principal};
use super::session::Session;
use super::ticket::TicketSource;
use super::transport::Transport;
use super::DirectoryError;
use crate::types::Metadata;

/// Description set on hosts created by this service
pub const HOST_DESCRIPTION: &str = "IPA host for OpenStack";

/// Swallow errors that mean "already gone" (or that IPA uses to hide it)
fn ignore_absent(result: Result<Value, DirectoryError>) -> Result<(), DirectoryError> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_absent() => {
            debug!(error = %e, "Ignoring absent entry");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Directory operations for one session
pub struct IpaClient {
    invoker: DirectoryClient,
    batch: BatchJob,
}

impl IpaClient {
    pub fn new(
        session: Session,
        tickets: Arc<dyn TicketSource>,
        transport: Box<dyn Transport>,
    ) -> Self {
        Self {
            invoker: DirectoryClient::new(Connection::new(session, tickets, transport)),
            batch: BatchJob::new(),
        }
    }

    fn session(&self) -> &Session {
        self.invoker.connection().session()
    }

    /// Whether this machine is an enrolled IPA client. When false every
    /// mutating operation is a no-op.
    pub fn configured(&self) -> bool {
        self.session().configured()
    }

    pub fn realm(&self) -> Result<&str, DirectoryError> {
        self.session().realm()
    }

    /// DNS domain of enrolled hosts, without trailing dot
    pub fn domain(&self) -> Result<String, DirectoryError> {
        self.session().domain()
    }

    // =========================================================================
    // Batch
    // =========================================================================

    pub fn start_batch_operation(&mut self) {
        self.batch.start();
    }

    pub async fn flush_batch_operation(&mut self) -> Result<Option<Vec<Value>>, DirectoryError> {
        self.batch.flush(&mut self.invoker).await
    }

    pub fn pending_batch(&self) -> &[Command] {
        self.batch.commands()
    }

    // =========================================================================
    // Hosts
    // =========================================================================

    /// Register a host with a one-time password.
    ///
    /// Tries to update the OTP of an existing entry first and creates the
    /// host when it does not exist. Returns false when the host is already
    /// enrolled and no new OTP can be handed out.
    pub async fn add_host(
        &mut self,
        hostname: &str,
        otp: &str,
        metadata: &Metadata,
        image_metadata: &Metadata,
    ) -> Result<bool, DirectoryError> {
        if !self.configured() {
            debug!("IPA is not configured");
            return Ok(false);
        }

        let modify = Command::new("host_mod")
            .arg(hostname)
            .option("userpassword", otp);

        match self.invoker.invoke(modify).await {
            Ok(_) => Ok(true),
            Err(DirectoryError::NotFound(_)) => {
                let add = host_add_command(hostname, otp, metadata, image_metadata);
                match self.invoker.invoke(add).await {
                    Ok(_)
                    | Err(DirectoryError::DuplicateEntry(_))
                    | Err(DirectoryError::Validation(_))
                    | Err(DirectoryError::DnsNotARecord(_)) => Ok(true),
                    Err(e) => Err(e),
                }
            }
            Err(DirectoryError::Validation(_)) => {
                debug!(hostname, "Host already enrolled, OTP not updated");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Delete a host and its DNS records. Absent entries are not an error.
    pub async fn delete_host(&mut self, hostname: &str) -> Result<(), DirectoryError> {
        if !self.configured() {
            debug!("IPA is not configured");
            return Ok(());
        }

        ignore_absent(self.invoker.invoke(host_del_command(hostname)).await)?;
        ignore_absent(self.invoker.invoke(dns_del_command(hostname)).await)
    }

    /// Queue creation of a host alias (network interface or VIP)
    pub fn add_subhost(&mut self, hostname: &str) -> Result<(), DirectoryError> {
        if !self.configured() {
            return Ok(());
        }
        debug!(hostname, "Adding subhost");
        self.batch
            .add(Command::new("host_add").arg(hostname).option("force", true))
    }

    /// Delete a host alias, queued or immediately.
    ///
    /// A missing DNS record never blocks the removal.
    pub async fn delete_subhost(&mut self, hostname: &str, batch: bool) -> Result<(), DirectoryError> {
        if !self.configured() {
            return Ok(());
        }
        debug!(hostname, batch, "Deleting subhost");

        if batch {
            self.batch.add(host_del_command(hostname))?;
            self.batch.add(dns_del_command(hostname))
        } else {
            self.invoker.invoke(host_del_command(hostname)).await?;
            ignore_absent(self.invoker.invoke(dns_del_command(hostname)).await)
        }
    }

    // =========================================================================
    // Services
    // =========================================================================

    /// Queue creation of a service principal
    pub fn add_service(&mut self, principal: &str) -> Result<(), DirectoryError> {
        if !self.configured() {
            return Ok(());
        }
        debug!(principal, "Adding service");
        self.batch
            .add(Command::new("service_add").arg(principal).option("force", true))
    }

    /// Queue a "managed by" link from `host` to a service
    pub fn service_add_host(&mut self, principal: &str, host: &str) -> Result<(), DirectoryError> {
        if !self.configured() {
            return Ok(());
        }
        debug!(principal, host, "Adding host to service");
        self.batch.add(
            Command::new("service_add_host")
                .arg(principal)
                .option("host", json!([host])),
        )
    }

    /// Whether any host other than the principal's own host manages it.
    ///
    /// A missing service is reported as `NotFound`.
    pub async fn service_has_hosts(&mut self, principal: &str) -> Result<bool, DirectoryError> {
        if !self.configured() {
            return Ok(false);
        }
        debug!(principal, "Checking if service has hosts");

        let realm = self.realm()?.to_string();
        let (_, hostname, _) = split_principal(principal, &realm)?;

        let result = self
            .invoker
            .invoke(Command::new("service_show").arg(principal))
            .await?;
        if result.is_null() {
            return Err(DirectoryError::NotFound(principal.to_string()));
        }

        let managed_by = result["result"]["managedby_host"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        Ok(managed_by
            .iter()
            .filter_map(Value::as_str)
            .any(|candidate| !candidate.eq_ignore_ascii_case(&hostname)))
    }

    /// Whether the host is still the manager of record for any service
    pub async fn host_has_services(&mut self, hostname: &str) -> Result<bool, DirectoryError> {
        if !self.configured() {
            return Ok(false);
        }
        debug!(hostname, "Checking if host has services");

        let result = self
            .invoker
            .invoke(Command::new("service_find").option("man_by_host", hostname))
            .await?;
        Ok(result["count"].as_u64().unwrap_or(0) > 0)
    }

    /// Delete a service principal, queued or immediately
    pub async fn delete_service(&mut self, principal: &str, batch: bool) -> Result<(), DirectoryError> {
        if !self.configured() {
            return Ok(());
        }
        debug!(principal, batch, "Deleting service");

        let command = Command::new("service_del").arg(principal);
        if batch {
            self.batch.add(command)
        } else {
            self.invoker.invoke(command).await.map(|_| ())
        }
    }

    // =========================================================================
    // Floating IPs
    // =========================================================================

    /// Add an A record for a floating IP. Re-adding is not an error.
    pub async fn add_ip(&mut self, hostname: &str, floating_ip: &str) -> Result<(), DirectoryError> {
        if !self.configured() {
            debug!("IPA is not configured");
            return Ok(());
        }

        let domain = self.domain()?;
        let command = Command::new("dnsrecord_add")
            .arg(json!({ "__dns_name__": format!("{}.", domain) }))
            .arg(json!({ "__dns_name__": record_name(hostname, &domain) }))
            .option("a_part_ip_address", floating_ip);

        match self.invoker.invoke(command).await {
            Ok(_) | Err(DirectoryError::DuplicateEntry(_)) | Err(DirectoryError::Validation(_)) => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Remove the A record value of a floating IP. A missing record is not an error.
    pub async fn remove_ip(&mut self, hostname: &str, floating_ip: &str) -> Result<(), DirectoryError> {
        if !self.configured() {
            debug!("IPA is not configured");
            return Ok(());
        }

        let domain = self.domain()?;
        let command = Command::new("dnsrecord_del")
            .arg(json!({ "__dns_name__": format!("{}.", domain) }))
            .arg(json!({ "__dns_name__": record_name(hostname, &domain) }))
            .option("arecord", json!([floating_ip]));

        ignore_absent(self.invoker.invoke(command).await)
    }
}

/// Name of a host's record inside `domain`: short names pass through,
/// FQDNs in the zone lose the zone suffix
fn record_name(hostname: &str, domain: &str) -> String {
    let hostname = hostname.trim_end_matches('.');
    hostname
        .strip_suffix(domain)
        .and_then(|rest| rest.strip_suffix('.'))
        .filter(|rest| !rest.is_empty())
        .unwrap_or(hostname)
        .to_string()
}

fn host_add_command(hostname: &str, otp: &str, metadata: &Metadata, image_metadata: &Metadata) -> Command {
    let mut command = Command::new("host_add")
        .arg(hostname)
        .option("description", HOST_DESCRIPTION)
        .option("userpassword", otp)
        // No IP address yet
        .option("force", true);

    if let Some(class) = metadata.get("ipa_hostclass").filter(|c| !c.is_empty()) {
        command = command.option("userclass", class.as_str());
    }

    let distro = image_metadata.get("os_distro").map(String::as_str).unwrap_or("");
    let version = image_metadata.get("os_version").map(String::as_str).unwrap_or("");
    if !distro.is_empty() || !version.is_empty() {
        command = command.option("nsosversion", format!("{} {}", distro, version).trim());
    }

    if let Some(location) = metadata.get("ipa_host_location").filter(|l| !l.is_empty()) {
        command = command.option("nshostlocation", location.as_str());
    }

    command
}

fn host_del_command(hostname: &str) -> Command {
    Command::new("host_del")
        .arg(hostname)
        .option("updatedns", false)
}

fn dns_del_command(hostname: &str) -> Command {
    let (host, zone) = split_hostname(hostname);
    Command::new("dnsrecord_del")
        .arg(zone)
        .arg(host)
        .option("del_all", true)
}
