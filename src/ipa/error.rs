//! Directory error taxonomy and remote error-code translation
//!
//! FreeIPA reports failures as numeric codes. Whether a code is fatal
//! depends on what was being done: re-adding a host is a real duplicate,
//! but deleting an already-absent DNS record is not worth reporting. The
//! [`RULES`] table encodes that policy as data so it can be reviewed and
//! tested without a server.

use thiserror::Error;
use tracing::{debug, error, warn};

/// Errors produced by the IPA client
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DirectoryError {
    /// Bad or missing credential material (keytab, principal)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Network unreachable or transport failure
    #[error("Communication with IPA failed: {0}")]
    Communication(String),

    /// Ticket expired or credential cache unusable; recovered by reconnecting
    #[error("Credentials expired: {0}")]
    CredentialExpired(String),

    #[error("Gave up connecting to IPA after {attempts} attempts: {reason}")]
    ExhaustedRetries { attempts: u32, reason: String },

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Duplicate entry: {0}")]
    DuplicateEntry(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// Insufficient access. IPA also uses this to hide whether an entry exists.
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Not an A record: {0}")]
    DnsNotARecord(String),

    #[error("Malformed service principal: {0}")]
    MalformedPrincipal(String),

    #[error("Realm mismatch: {0}")]
    RealmMismatch(String),

    #[error("Batch operation not started")]
    BatchNotStarted,

    #[error("IPA client configuration: {0}")]
    Config(String),

    #[error("Unknown IPA error {code}: {message}")]
    Unknown { code: i64, message: String },
}

impl DirectoryError {
    /// Build the error for a translated remote failure
    pub fn from_kind(kind: ErrorKind, code: i64, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::Authentication => DirectoryError::Authentication(message),
            ErrorKind::Communication => DirectoryError::Communication(message),
            ErrorKind::CredentialExpired => DirectoryError::CredentialExpired(message),
            ErrorKind::InvalidData => DirectoryError::InvalidData(message),
            ErrorKind::DuplicateEntry => DirectoryError::DuplicateEntry(message),
            ErrorKind::NotFound => DirectoryError::NotFound(message),
            ErrorKind::Validation => DirectoryError::Validation(message),
            ErrorKind::AccessDenied => DirectoryError::AccessDenied(message),
            ErrorKind::DnsNotARecord => DirectoryError::DnsNotARecord(message),
            ErrorKind::MalformedPrincipal => DirectoryError::MalformedPrincipal(message),
            ErrorKind::RealmMismatch => DirectoryError::RealmMismatch(message),
            ErrorKind::Unknown => DirectoryError::Unknown { code, message },
        }
    }

    /// Ticket or credential cache trouble; a fresh ticket may fix it
    pub fn is_credential(&self) -> bool {
        matches!(self, DirectoryError::CredentialExpired(_))
    }

    pub fn is_network(&self) -> bool {
        matches!(self, DirectoryError::Communication(_))
    }

    /// Absent entry, or an access error that IPA uses to mask absence
    pub fn is_absent(&self) -> bool {
        matches!(
            self,
            DirectoryError::NotFound(_) | DirectoryError::AccessDenied(_)
        )
    }
}

/// Error kinds a remote code can be translated into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Authentication,
    Communication,
    CredentialExpired,
    InvalidData,
    DuplicateEntry,
    NotFound,
    Validation,
    AccessDenied,
    DnsNotARecord,
    MalformedPrincipal,
    RealmMismatch,
    Unknown,
}

/// What to do with a remote error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Benign for this command; report success
    Ignore,
    Raise(ErrorKind),
}

/// Which commands a rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Every command
    Any,
    /// Commands whose verb prefix matches (`host` for `host_add`)
    Object(&'static str),
    /// One exact verb
    Verb(&'static str),
}

#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pub code: i64,
    pub scope: Scope,
    pub outcome: Outcome,
}

const fn rule(code: i64, scope: Scope, outcome: Outcome) -> Rule {
    Rule { code, scope, outcome }
}

use ErrorKind::*;
use Outcome::{Ignore, Raise};
use Scope::{Any, Object, Verb};

/// Remote code translation table. Narrower scopes win over wider ones.
pub static RULES: &[Rule] = &[
    // Transport-level failures reported by the server
    rule(902, Any, Raise(Unknown)),
    rule(903, Any, Raise(Unknown)),
    rule(904, Any, Raise(Unknown)),
    rule(907, Any, Raise(Communication)),
    rule(908, Any, Raise(Communication)),
    // Authentication and credential cache
    rule(1000, Any, Raise(Authentication)),
    rule(1100, Any, Raise(CredentialExpired)),
    rule(1101, Any, Raise(CredentialExpired)),
    rule(1102, Any, Raise(Authentication)),
    rule(1103, Any, Raise(CredentialExpired)),
    rule(1104, Any, Raise(CredentialExpired)),
    rule(1105, Any, Raise(CredentialExpired)),
    rule(1106, Any, Raise(CredentialExpired)),
    rule(1107, Any, Raise(Communication)),
    rule(1200, Any, Raise(CredentialExpired)),
    // Authorization
    rule(2100, Any, Raise(AccessDenied)),
    // Invocation
    rule(3005, Any, Raise(InvalidData)),
    rule(3007, Any, Raise(InvalidData)),
    rule(3008, Any, Raise(InvalidData)),
    rule(3009, Any, Raise(Validation)),
    // Execution
    rule(4001, Any, Raise(NotFound)),
    rule(4001, Verb("host_del"), Ignore),
    rule(4001, Verb("dnsrecord_del"), Ignore),
    rule(4002, Any, Raise(DuplicateEntry)),
    rule(4004, Any, Raise(MalformedPrincipal)),
    rule(4005, Any, Raise(RealmMismatch)),
    rule(4019, Any, Raise(DnsNotARecord)),
    rule(4026, Any, Raise(InvalidData)),
    rule(4026, Object("dnsrecord"), Ignore),
    rule(4202, Any, Ignore),
    rule(4203, Any, Raise(Unknown)),
];

/// Object type of a verb: the part before the first `_`
pub fn object_type(verb: &str) -> &str {
    verb.split('_').next().unwrap_or(verb)
}

/// Look up the outcome for a remote code raised by `verb`.
///
/// Returns `None` when the table has no entry for the code at all.
pub fn lookup(code: i64, verb: &str) -> Option<Outcome> {
    let object = object_type(verb);
    let mut best: Option<(u8, Outcome)> = None;

    for r in RULES.iter().filter(|r| r.code == code) {
        let rank = match r.scope {
            Verb(v) if v == verb => 2,
            Object(o) if o == object => 1,
            Any => 0,
            _ => continue,
        };
        if best.map_or(true, |(b, _)| rank > b) {
            best = Some((rank, r.outcome));
        }
    }

    best.map(|(_, outcome)| outcome)
}

/// Translate a remote error for `verb` into success or a typed failure
pub fn translate(verb: &str, code: i64, message: &str) -> Result<(), DirectoryError> {
    match lookup(code, verb) {
        None => {
            warn!(verb, code, detail = message, "Unmapped IPA error code, treating as success");
            Ok(())
        }
        Some(Ignore) => {
            debug!(verb, code, detail = message, "Ignoring benign IPA error");
            Ok(())
        }
        Some(Raise(Unknown)) => {
            error!(verb, code, detail = message, "IPA reported an unexpected error");
            Err(DirectoryError::from_kind(Unknown, code, message))
        }
        Some(Raise(kind)) => Err(DirectoryError::from_kind(kind, code, message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_type() {
        assert_eq!(object_type("host_add"), "host");
        assert_eq!(object_type("dnsrecord_del"), "dnsrecord");
        assert_eq!(object_type("service_add_host"), "service");
        assert_eq!(object_type("ping"), "ping");
    }

    #[test]
    fn test_duplicate_host_add_raises() {
        let err = translate("host_add", 4002, "host with name already exists").unwrap_err();
        assert!(matches!(err, DirectoryError::DuplicateEntry(_)));
    }

    #[test]
    fn test_missing_host_on_delete_is_ignored() {
        assert_eq!(lookup(4001, "host_del"), Some(Ignore));
        assert!(translate("host_del", 4001, "host not found").is_ok());
    }

    #[test]
    fn test_missing_host_on_modify_still_raises() {
        // host_mod falls back to host_add on NotFound, so it must surface
        let err = translate("host_mod", 4001, "host not found").unwrap_err();
        assert!(matches!(err, DirectoryError::NotFound(_)));
    }

    #[test]
    fn test_object_scope_applies_to_every_verb_of_that_type() {
        assert_eq!(lookup(4026, "dnsrecord_del"), Some(Ignore));
        assert_eq!(lookup(4026, "dnsrecord_add"), Some(Ignore));
        assert_eq!(lookup(4026, "host_mod"), Some(Raise(InvalidData)));
    }

    #[test]
    fn test_no_changes_is_ignored_everywhere() {
        assert!(translate("host_mod", 4202, "no modifications to be performed").is_ok());
        assert!(translate("service_mod", 4202, "no modifications to be performed").is_ok());
    }

    #[test]
    fn test_unmapped_code_is_success() {
        assert_eq!(lookup(4999, "host_add"), None);
        assert!(translate("host_add", 4999, "something odd").is_ok());
    }

    #[test]
    fn test_unknown_is_surfaced() {
        let err = translate("host_add", 903, "internal error").unwrap_err();
        assert_eq!(
            err,
            DirectoryError::Unknown {
                code: 903,
                message: "internal error".into()
            }
        );
    }

    #[test]
    fn test_credential_codes_are_recoverable() {
        for code in [1100, 1101, 1103, 1104] {
            let err = translate("ping", code, "ticket expired").unwrap_err();
            assert!(err.is_credential(), "code {code} should be recoverable");
        }
        assert!(translate("ping", 907, "unreachable").unwrap_err().is_network());
    }

    #[test]
    fn test_every_code_has_a_default() {
        for r in RULES {
            assert!(
                RULES.iter().any(|d| d.code == r.code && d.scope == Any),
                "code {} has no catch-all rule",
                r.code
            );
        }
    }
}
