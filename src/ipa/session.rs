//! Per-client session state: identity, credential cache and backoff

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use super::ticket::{client_configured, new_cache_name, IpaDefaults};
use super::DirectoryError;

/// Upper bound for reconnect backoff
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(1024);

/// Delay that doubles on every use, up to a cap
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    current: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(initial: Duration) -> Self {
        Self::with_cap(initial, DEFAULT_BACKOFF_CAP)
    }

    pub fn with_cap(initial: Duration, cap: Duration) -> Self {
        Self {
            initial,
            current: initial,
            cap,
        }
    }

    /// Delay to wait now; the following one is doubled
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.cap);
        self.current = (self.current * 2).min(self.cap);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Connection settings shared by every session built from one configuration
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub keytab: PathBuf,
    pub ipa_conf: PathBuf,
    /// Total connection attempts per connect cycle
    pub max_tries: u32,
    /// Initial reconnect delay; `None` retries immediately and gives up sooner
    pub backoff: Option<Duration>,
    /// Server override; otherwise taken from the IPA client configuration
    pub server: Option<String>,
    /// DNS domain override for enrolled hosts
    pub domain: Option<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            keytab: PathBuf::from("/etc/novajoin/krb5.keytab"),
            ipa_conf: PathBuf::from(super::ticket::DEFAULT_IPA_CONF),
            max_tries: 3,
            backoff: None,
            server: None,
            domain: None,
        }
    }
}

/// Identity and connection bookkeeping of one IPA client instance
#[derive(Debug)]
pub struct Session {
    settings: SessionSettings,
    defaults: Option<IpaDefaults>,
    cache: String,
    backoff: Option<Backoff>,
}

impl Session {
    /// Create a session from settings, reading the IPA client configuration
    /// if the machine is enrolled.
    pub fn new(settings: SessionSettings) -> Self {
        let defaults = if client_configured(&settings.ipa_conf) {
            match IpaDefaults::load(&settings.ipa_conf) {
                Ok(defaults) => Some(defaults),
                Err(e) => {
                    warn!(error = %e, "IPA client configuration is unusable");
                    None
                }
            }
        } else {
            debug!(path = %settings.ipa_conf.display(), "IPA client not configured");
            None
        };
        Self::preconfigured(settings, defaults)
    }

    /// Create a session with already-known client defaults
    pub fn preconfigured(settings: SessionSettings, defaults: Option<IpaDefaults>) -> Self {
        let backoff = settings.backoff.map(Backoff::new);
        Self {
            settings,
            defaults,
            cache: new_cache_name(),
            backoff,
        }
    }

    pub fn configured(&self) -> bool {
        self.defaults.is_some()
    }

    pub fn cache(&self) -> &str {
        &self.cache
    }

    pub fn keytab(&self) -> &Path {
        &self.settings.keytab
    }

    pub fn max_tries(&self) -> u32 {
        self.settings.max_tries.max(1)
    }

    fn defaults(&self) -> Result<&IpaDefaults, DirectoryError> {
        self.defaults
            .as_ref()
            .ok_or_else(|| DirectoryError::Config("IPA client is not configured".into()))
    }

    pub fn principal(&self) -> Result<String, DirectoryError> {
        Ok(self.defaults()?.service_principal())
    }

    pub fn realm(&self) -> Result<&str, DirectoryError> {
        Ok(&self.defaults()?.realm)
    }

    /// Own hostname as enrolled in IPA
    pub fn hostname(&self) -> Result<&str, DirectoryError> {
        Ok(&self.defaults()?.host)
    }

    /// DNS domain for enrolled hosts: override, then client config, then
    /// the domain part of this machine's hostname
    pub fn domain(&self) -> Result<String, DirectoryError> {
        if let Some(domain) = &self.settings.domain {
            return Ok(domain.trim_end_matches('.').to_string());
        }
        let defaults = self.defaults()?;
        if let Some(domain) = &defaults.domain {
            return Ok(domain.clone());
        }
        defaults
            .host
            .split_once('.')
            .map(|(_, domain)| domain.to_string())
            .ok_or_else(|| DirectoryError::Config("cannot determine IPA domain".into()))
    }

    pub fn server(&self) -> Result<String, DirectoryError> {
        if let Some(server) = &self.settings.server {
            return Ok(server.clone());
        }
        self.defaults()?
            .server
            .clone()
            .ok_or_else(|| DirectoryError::Config("no IPA server configured".into()))
    }

    pub fn has_backoff(&self) -> bool {
        self.backoff.is_some()
    }

    /// Next reconnect delay, if this session backs off at all
    pub fn next_backoff(&mut self) -> Option<Duration> {
        self.backoff.as_mut().map(Backoff::next_delay)
    }

    pub fn reset_backoff(&mut self) {
        if let Some(backoff) = self.backoff.as_mut() {
            backoff.reset();
        }
    }
}
