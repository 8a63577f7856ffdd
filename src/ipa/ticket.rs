//! Kerberos ticket acquisition for the service identity
//!
//! The service authenticates as `nova/<host>@<REALM>` using its keytab.
//! Host and realm come from the local IPA client configuration because the
//! full client bootstrap needs a connection we do not have yet.
//!
//! Tickets land in a per-session kernel keyring cache with a fresh UUID, so
//! concurrent sessions never share or overwrite each other's credentials
//! and nothing is written to disk. The cache name is passed explicitly to
//! every helper process instead of through this process's environment.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info};
use zeroize::Zeroizing;

use super::DirectoryError;

/// Default location of the IPA client configuration
pub const DEFAULT_IPA_CONF: &str = "/etc/ipa/default.conf";

/// Service name of the principal this shim authenticates as
pub const SERVICE_NAME: &str = "nova";

/// Prefix of per-session credential caches
pub const CCACHE_PREFIX: &str = "KEYRING:session:realm-join-";

/// Values read from the `[global]` section of the IPA client configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpaDefaults {
    /// This machine's FQDN as enrolled in IPA
    pub host: String,
    pub realm: String,
    pub domain: Option<String>,
    /// IPA server to talk to
    pub server: Option<String>,
}

impl IpaDefaults {
    pub fn load(path: &Path) -> Result<Self, DirectoryError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            DirectoryError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, DirectoryError> {
        let global = ini_section(contents, "global");
        let required = |key: &str| {
            global
                .get(key)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| DirectoryError::Config(format!("[global] {key} is not set")))
        };

        let server = global.get("server").cloned().or_else(|| {
            global
                .get("xmlrpc_uri")
                .and_then(|uri| uri.split("//").nth(1))
                .and_then(|rest| rest.split('/').next())
                .map(str::to_string)
        });

        Ok(Self {
            host: required("host")?,
            realm: required("realm")?,
            domain: global.get("domain").cloned(),
            server,
        })
    }

    /// Principal of the service identity, e.g. `nova/join.example.test@EXAMPLE.TEST`
    pub fn service_principal(&self) -> String {
        format!("{}/{}@{}", SERVICE_NAME, self.host, self.realm)
    }
}

/// Read `key = value` pairs of one section of an INI-style file
fn ini_section(contents: &str, section: &str) -> HashMap<String, String> {
    let mut values = HashMap::new();
    let mut in_section = false;

    for line in contents.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            in_section = name.trim() == section;
            continue;
        }
        if !in_section {
            continue;
        }
        if let Some((key, value)) = line.split_once(['=', ':']) {
            values.insert(key.trim().to_lowercase(), value.trim().to_string());
        }
    }

    values
}

/// Whether this machine is an enrolled IPA client.
///
/// Weak detection (the config file exists) but it is what decides whether
/// the service runs in disabled mode.
pub fn client_configured(ipa_conf: &Path) -> bool {
    ipa_conf.exists()
}

/// Fresh, collision-free credential cache name
pub fn new_cache_name() -> String {
    format!("{}{}", CCACHE_PREFIX, uuid::Uuid::new_v4())
}

/// Credentials held by a session
#[derive(Debug, Clone)]
pub struct Ticket {
    pub principal: String,
    pub cache: String,
    /// SPNEGO token for the IPA HTTP service, when a helper produced one
    pub negotiate_token: Option<Zeroizing<String>>,
}

/// Parameters of one ticket acquisition
#[derive(Debug, Clone, Copy)]
pub struct TicketRequest<'a> {
    pub principal: &'a str,
    pub keytab: &'a Path,
    pub cache: &'a str,
    /// IPA server the ticket is meant for
    pub server: &'a str,
}

/// Source of Kerberos credentials (allows mocking in tests)
#[async_trait::async_trait]
pub trait TicketSource: Send + Sync {
    async fn acquire(&self, request: TicketRequest<'_>) -> Result<Ticket, DirectoryError>;
}

/// Obtains tickets with `kinit -k -t <keytab>`.
///
/// The negotiate command is run afterwards with `KRB5CCNAME` pointing at
/// the session cache and `HTTP@<server>` as its argument; its stdout is used
/// as the SPNEGO token for the IPA login. Without one the IPA login can never
/// succeed, so acquisition fails up front.
pub struct KinitTicketSource {
    kinit: PathBuf,
    negotiate_command: Option<PathBuf>,
}

impl KinitTicketSource {
    pub fn new(kinit: impl Into<PathBuf>, negotiate_command: Option<PathBuf>) -> Self {
        Self {
            kinit: kinit.into(),
            negotiate_command,
        }
    }

    async fn negotiate_token(
        &self,
        command: &Path,
        request: &TicketRequest<'_>,
    ) -> Result<Zeroizing<String>, DirectoryError> {
        let output = Command::new(command)
            .arg(format!("HTTP@{}", request.server))
            .env("KRB5CCNAME", request.cache)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                DirectoryError::Authentication(format!("failed to run {}: {}", command.display(), e))
            })?;

        if !output.status.success() {
            return Err(DirectoryError::CredentialExpired(format!(
                "{} failed: {}",
                command.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let token = Zeroizing::new(String::from_utf8_lossy(&output.stdout).trim().to_string());
        if token.is_empty() {
            return Err(DirectoryError::CredentialExpired(format!(
                "{} produced no token",
                command.display()
            )));
        }
        Ok(token)
    }
}

#[async_trait::async_trait]
impl TicketSource for KinitTicketSource {
    async fn acquire(&self, request: TicketRequest<'_>) -> Result<Ticket, DirectoryError> {
        let Some(negotiate_command) = &self.negotiate_command else {
            return Err(DirectoryError::Authentication(
                "no SPNEGO token source configured (NEGOTIATE_COMMAND)".into(),
            ));
        };

        tokio::fs::metadata(request.keytab).await.map_err(|e| {
            DirectoryError::Authentication(format!(
                "keytab {} is unreadable: {}",
                request.keytab.display(),
                e
            ))
        })?;

        let output = Command::new(&self.kinit)
            .arg("-k")
            .arg("-t")
            .arg(request.keytab)
            .arg("-c")
            .arg(request.cache)
            .arg(request.principal)
            .env("KRB5CCNAME", request.cache)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                DirectoryError::Authentication(format!(
                    "failed to run {}: {}",
                    self.kinit.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            return Err(DirectoryError::Authentication(format!(
                "kinit for {} failed: {}",
                request.principal,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let negotiate_token = self.negotiate_token(negotiate_command, &request).await?;

        Ok(Ticket {
            principal: request.principal.to_string(),
            cache: request.cache.to_string(),
            negotiate_token: Some(negotiate_token),
        })
    }
}

/// Holds the current ticket of a session and refreshes it on demand
pub struct TicketManager {
    source: std::sync::Arc<dyn TicketSource>,
    current: Option<Ticket>,
}

impl TicketManager {
    pub fn new(source: std::sync::Arc<dyn TicketSource>) -> Self {
        Self {
            source,
            current: None,
        }
    }

    pub fn current(&self) -> Option<&Ticket> {
        self.current.as_ref()
    }

    /// Obtain a new ticket, replacing the current one on success
    pub async fn acquire(
        &mut self,
        principal: &str,
        keytab: &Path,
        cache: &str,
        server: &str,
    ) -> Result<&Ticket, DirectoryError> {
        debug!(principal, cache, "Acquiring ticket");
        let ticket = self
            .source
            .acquire(TicketRequest {
                principal,
                keytab,
                cache,
                server,
            })
            .await?;
        if self.current.is_none() {
            info!(principal, "Obtained initial ticket");
        }
        Ok(self.current.insert(ticket))
    }
}
