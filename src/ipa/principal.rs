//! Service principal and hostname parsing

use std::fmt;

use super::DirectoryError;

/// A Kerberos service principal: `service/hostname@REALM`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal {
    pub service: String,
    pub hostname: String,
    pub realm: String,
}

impl Principal {
    /// Parse a principal, defaulting the realm to `default_realm`.
    ///
    /// The hostname is lowercased and the realm uppercased. Only one realm is
    /// served, so an explicit realm other than `default_realm` is rejected.
    pub fn parse(principal: &str, default_realm: &str) -> Result<Self, DirectoryError> {
        let (service, rest) = match principal.split('/').collect::<Vec<_>>()[..] {
            [service, rest] => (service, rest),
            _ => {
                return Err(DirectoryError::MalformedPrincipal(format!(
                    "missing service in {principal}"
                )))
            }
        };

        if service.is_empty() {
            return Err(DirectoryError::MalformedPrincipal(format!(
                "blank service in {principal}"
            )));
        }

        let (hostname, realm) = match rest.split('@').collect::<Vec<_>>()[..] {
            [host] => (host, default_realm.to_uppercase()),
            [host, realm] => {
                let realm = realm.to_uppercase();
                if realm != default_realm.to_uppercase() {
                    return Err(DirectoryError::RealmMismatch(format!(
                        "{realm} is not {default_realm}"
                    )));
                }
                (host, realm)
            }
            _ => {
                return Err(DirectoryError::MalformedPrincipal(format!(
                    "unable to determine realm of {principal}"
                )))
            }
        };

        Ok(Self {
            service: service.to_string(),
            hostname: hostname.to_lowercase(),
            realm,
        })
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.service, self.hostname, self.realm)
    }
}

/// Split a principal into `(service, hostname, realm)`
pub fn split_principal(
    principal: &str,
    default_realm: &str,
) -> Result<(String, String, String), DirectoryError> {
    let p = Principal::parse(principal, default_realm)?;
    Ok((p.service, p.hostname, p.realm))
}

/// Host part of a principal as written in instance metadata (`HTTP/vip.example.test`)
pub fn principal_host(principal: &str) -> Option<&str> {
    let (_, rest) = principal.split_once('/')?;
    let host = rest.split('@').next().unwrap_or(rest);
    (!host.is_empty()).then_some(host)
}

/// Split an FQDN into its first label and its DNS zone (with trailing dot)
pub fn split_hostname(hostname: &str) -> (String, String) {
    match hostname.split_once('.') {
        Some((host, domain)) => (host.to_string(), format!("{}.", domain.trim_end_matches('.'))),
        None => (hostname.to_string(), ".".to_string()),
    }
}
