//! Configuration for realm-join
//!
//! CLI arguments and environment variable handling using clap. Both
//! binaries share [`DirectoryArgs`]; the HTTP service adds [`Args`] and the
//! notification listener [`NotifyArgs`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::ipa::{
    HttpTransport, IpaClient, KinitTicketSource, Session, SessionSettings, TicketSource,
};
use crate::services::{ClientFactory, HostNaming};

/// IPA connection and host naming settings shared by both binaries
#[derive(clap::Args, Debug, Clone)]
pub struct DirectoryArgs {
    /// Keytab of the nova/<host> service principal
    #[arg(long, env = "KEYTAB", default_value = "/etc/novajoin/krb5.keytab")]
    pub keytab: PathBuf,

    /// IPA client configuration written by ipa-client-install
    #[arg(long, env = "IPA_CONF", default_value = crate::ipa::ticket::DEFAULT_IPA_CONF)]
    pub ipa_conf: PathBuf,

    /// DNS domain for enrolled hosts (defaults to the IPA domain)
    #[arg(long, env = "DOMAIN")]
    pub domain: Option<String>,

    /// Connection retries after the first attempt
    #[arg(long, env = "CONNECT_RETRIES", default_value = "2")]
    pub connect_retries: u32,

    /// Build host names as <host>.<project>.<domain> (experimental)
    #[arg(long, env = "PROJECT_SUBDOMAIN", default_value = "false")]
    pub project_subdomain: bool,

    /// Turn project names into valid DNS labels when used as subdomains
    #[arg(long, env = "NORMALIZE_PROJECT", default_value_t = true, action = clap::ArgAction::Set)]
    pub normalize_project: bool,

    /// IPA server (defaults to the one in the IPA client configuration)
    #[arg(long, env = "IPA_SERVER")]
    pub ipa_server: Option<String>,

    /// kinit binary
    #[arg(long, env = "KINIT_PATH", default_value = "kinit")]
    pub kinit: PathBuf,

    /// Helper that prints a SPNEGO token for HTTP@<server> using KRB5CCNAME
    #[arg(long, env = "NEGOTIATE_COMMAND")]
    pub negotiate_command: Option<PathBuf>,

    /// IPA request timeout in milliseconds
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value = "30000")]
    pub request_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl DirectoryArgs {
    /// Total connection attempts per connect cycle
    pub fn max_tries(&self) -> u32 {
        self.connect_retries.saturating_add(1)
    }

    pub fn session_settings(&self, backoff: Option<Duration>) -> SessionSettings {
        SessionSettings {
            keytab: self.keytab.clone(),
            ipa_conf: self.ipa_conf.clone(),
            max_tries: self.max_tries(),
            backoff,
            server: self.ipa_server.clone(),
            domain: self.domain.clone(),
        }
    }

    pub fn naming(&self) -> HostNaming {
        HostNaming {
            project_subdomain: self.project_subdomain,
            normalize_project: self.normalize_project,
        }
    }

    /// Factory for IPA clients talking to the real server
    pub fn client_factory(&self, backoff: Option<Duration>) -> DirectoryClientFactory {
        DirectoryClientFactory {
            settings: self.session_settings(backoff),
            tickets: Arc::new(KinitTicketSource::new(
                self.kinit.clone(),
                self.negotiate_command.clone(),
            )),
            timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.request_timeout_ms == 0 {
            return Err("REQUEST_TIMEOUT_MS must be greater than zero".to_string());
        }
        if let Some(domain) = &self.domain {
            if domain.trim_matches('.').is_empty() {
                return Err("DOMAIN must not be empty".to_string());
            }
        }
        if self.negotiate_command.is_none() && crate::ipa::ticket::client_configured(&self.ipa_conf) {
            return Err(format!(
                "NEGOTIATE_COMMAND is required when {} exists",
                self.ipa_conf.display()
            ));
        }
        Ok(())
    }
}

/// Builds one IPA client per request or worker, each with its own session
pub struct DirectoryClientFactory {
    settings: SessionSettings,
    tickets: Arc<dyn TicketSource>,
    timeout: Duration,
}

impl ClientFactory for DirectoryClientFactory {
    fn create(&self) -> IpaClient {
        IpaClient::new(
            Session::new(self.settings.clone()),
            self.tickets.clone(),
            Box::new(HttpTransport::new(self.timeout)),
        )
    }
}

/// realm-join - IPA enrollment for cloud instances
#[derive(Parser, Debug, Clone)]
#[command(name = "realm-join")]
#[command(about = "Registers cloud instances with FreeIPA and hands out one-time passwords")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:9090")]
    pub listen: SocketAddr,

    /// Host classes each project may use: "project=class1,class2;other=*"
    #[arg(long, env = "ALLOWED_CLASSES", default_value = "")]
    pub allowed_classes: String,

    #[command(flatten)]
    pub directory: DirectoryArgs,
}

impl Args {
    pub fn allowed_classes(&self) -> Result<AllowedClasses, String> {
        AllowedClasses::parse(&self.allowed_classes)
    }

    pub fn validate(&self) -> Result<(), String> {
        self.directory.validate()?;
        self.allowed_classes()?;
        Ok(())
    }
}

/// NATS connection settings
#[derive(clap::Args, Debug, Clone)]
pub struct NatsArgs {
    /// NATS server URL
    #[arg(long, env = "NATS_URL", default_value = "nats://127.0.0.1:4222")]
    pub nats_url: String,

    /// NATS username (optional)
    #[arg(long, env = "NATS_USER")]
    pub nats_user: Option<String>,

    /// NATS password (optional)
    #[arg(long, env = "NATS_PASSWORD")]
    pub nats_password: Option<String>,
}

/// Shape of the notifications published by the compute service
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum NotificationFormat {
    /// `instance.*` events with `nova_object` payloads
    Versioned,
    /// Legacy `compute.instance.*` events
    Unversioned,
}

/// realm-join-notify - removes hosts and DNS records as instances go away
#[derive(Parser, Debug, Clone)]
#[command(name = "realm-join-notify")]
#[command(about = "Keeps FreeIPA in sync with compute and network notifications")]
pub struct NotifyArgs {
    #[command(flatten)]
    pub nats: NatsArgs,

    /// Subject prefix the notifications are published under
    #[arg(long, env = "NOTIFICATIONS_TOPIC", default_value = "novajoin_notifications")]
    pub notifications_topic: String,

    /// Notification format to accept
    #[arg(long, env = "NOTIFICATION_FORMAT", value_enum, default_value = "unversioned")]
    pub notification_format: NotificationFormat,

    /// Number of workers processing notifications concurrently
    #[arg(long, env = "WORKER_COUNT", default_value = "4")]
    pub worker_count: usize,

    /// Initial reconnect backoff in seconds (doubles up to 1024)
    #[arg(long, env = "BACKOFF_SECS", default_value = "2")]
    pub backoff_secs: u64,

    #[command(flatten)]
    pub directory: DirectoryArgs,
}

impl NotifyArgs {
    pub fn backoff(&self) -> Option<Duration> {
        (self.backoff_secs > 0).then(|| Duration::from_secs(self.backoff_secs))
    }

    pub fn validate(&self) -> Result<(), String> {
        self.directory.validate()?;
        if self.worker_count == 0 {
            return Err("WORKER_COUNT must be at least 1".to_string());
        }
        if self.notifications_topic.is_empty() || self.notifications_topic.contains(['*', '>', ' ']) {
            return Err("NOTIFICATIONS_TOPIC must be a plain subject name".to_string());
        }
        Ok(())
    }
}

// ============================================================================
// Allowed host classes
// ============================================================================

/// Per-project list of host classes instances may request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowedClasses {
    projects: HashMap<String, Vec<String>>,
}

impl AllowedClasses {
    /// Parse `project=class1,class2;other=*`
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut projects = HashMap::new();

        for entry in raw.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let (project, classes) = entry
                .split_once('=')
                .ok_or_else(|| format!("ALLOWED_CLASSES entry '{}' has no '='", entry))?;
            let project = project.trim();
            if project.is_empty() {
                return Err(format!("ALLOWED_CLASSES entry '{}' has no project", entry));
            }
            let classes = classes
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect();
            projects.insert(project.to_string(), classes);
        }

        Ok(Self { projects })
    }

    pub fn for_project(&self, project: &str) -> &[String] {
        self.projects.get(project).map(Vec::as_slice).unwrap_or_default()
    }

    /// Whether `project` may put instances into `class`
    pub fn allows(&self, project: &str, class: &str) -> bool {
        self.for_project(project)
            .iter()
            .any(|allowed| allowed == class || allowed == "*")
    }
}
