//! Host name construction

/// How instance host names map into the IPA DNS domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostNaming {
    /// `<host>.<project>.<domain>` instead of `<host>.<domain>`
    pub project_subdomain: bool,
    /// Turn project names into DNS labels first
    pub normalize_project: bool,
}

impl Default for HostNaming {
    fn default() -> Self {
        Self {
            project_subdomain: false,
            normalize_project: true,
        }
    }
}

impl HostNaming {
    /// Fully-qualified name of `hostname` in `domain`
    pub fn fqdn(&self, hostname: &str, project: Option<&str>, domain: &str) -> String {
        let domain = domain.trim_end_matches('.');
        match project.filter(|_| self.project_subdomain) {
            Some(project) => {
                let label = if self.normalize_project {
                    normalize_label(project)
                } else {
                    project.to_string()
                };
                format!("{}.{}.{}", hostname, label, domain)
            }
            None => format!("{}.{}", hostname, domain),
        }
    }
}

/// Lowercase, map anything outside `[a-z0-9-]` to `-`, and trim dashes
pub fn normalize_label(name: &str) -> String {
    let label: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    let label = label.trim_matches('-');
    // DNS labels are at most 63 octets
    label.chars().take(63).collect::<String>().trim_end_matches('-').to_string()
}
