//! Instance enrollment
//!
//! Handles the metadata service's join call: decide whether the instance
//! asked to be enrolled, register it in IPA with a fresh one-time password
//! and set up the service principals described in its metadata.
//!
//! Services come in two metadata forms:
//!
//! ```text
//! managed_service_web  = "HTTP/vip.example.test"
//! compact_services     = {"HTTP": ["internalapi", "ctlplane"], "rabbitmq": ["internalapi"]}
//! compact_service_HTTP = ["internalapi", "ctlplane"]
//! ```
//!
//! Compact entries expand to `<service>/<host>.<network>.<domain>`; each
//! such name becomes a subhost managed by the instance.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize, Serializer};
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use super::naming::HostNaming;
use super::ClientFactory;
use crate::cloud::CloudMetadata;
use crate::config::AllowedClasses;
use crate::ipa::{principal_host, DirectoryError, IpaClient};
use crate::types::{JoinError, Metadata, Result};

const MANAGED_SERVICE_PREFIX: &str = "managed_service_";
const COMPACT_SERVICES_KEY: &str = "compact_services";
const COMPACT_SERVICE_PREFIX: &str = "compact_service_";

/// Body of a join request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JoinRequest {
    #[serde(rename = "instance-id", default)]
    pub instance_id: Option<String>,
    #[serde(rename = "image-id", default)]
    pub image_id: Option<String>,
    #[serde(rename = "project-id", default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Join response; empty when enrollment was not requested
#[derive(Default, Serialize)]
pub struct JoinResponse {
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "expose_otp")]
    pub ipaotp: Option<Zeroizing<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

fn expose_otp<S: Serializer>(otp: &Option<Zeroizing<String>>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    match otp {
        Some(otp) => serializer.serialize_str(otp.as_str()),
        None => serializer.serialize_none(),
    }
}

impl fmt::Debug for JoinResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinResponse")
            .field("ipaotp", &self.ipaotp.as_ref().map(|_| "<redacted>"))
            .field("hostname", &self.hostname)
            .finish()
    }
}

/// Whether a metadata flag such as `ipa_enroll` is set
pub fn flag_set(metadata: &Metadata, key: &str) -> bool {
    metadata
        .get(key)
        .is_some_and(|value| value.eq_ignore_ascii_case("true"))
}

/// Principals listed under `managed_service_*` keys
pub fn managed_services(metadata: &Metadata) -> Vec<String> {
    metadata
        .iter()
        .filter(|(key, _)| key.starts_with(MANAGED_SERVICE_PREFIX))
        .map(|(_, principal)| principal.clone())
        .collect()
}

/// Service name to networks, merged from `compact_services` and
/// `compact_service_<name>` keys
pub fn compact_services(metadata: &Metadata) -> Result<BTreeMap<String, Vec<String>>> {
    let mut services: BTreeMap<String, Vec<String>> = BTreeMap::new();

    if let Some(raw) = metadata.get(COMPACT_SERVICES_KEY) {
        let parsed: BTreeMap<String, Vec<String>> = serde_json::from_str(raw)
            .map_err(|e| JoinError::BadRequest(format!("Invalid {}: {}", COMPACT_SERVICES_KEY, e)))?;
        services.extend(parsed);
    }

    for (key, raw) in metadata {
        if let Some(service) = key.strip_prefix(COMPACT_SERVICE_PREFIX) {
            let networks: Vec<String> = serde_json::from_str(raw)
                .map_err(|e| JoinError::BadRequest(format!("Invalid {}: {}", key, e)))?;
            services.entry(service.to_string()).or_default().extend(networks);
        }
    }

    Ok(services)
}

/// Where an instance's names live in DNS
#[derive(Debug, Clone)]
pub struct HostContext<'a> {
    pub naming: HostNaming,
    pub domain: &'a str,
    pub project: Option<&'a str>,
}

impl HostContext<'_> {
    pub fn fqdn(&self, hostname: &str) -> String {
        self.naming.fqdn(hostname, self.project, self.domain)
    }

    /// FQDNs of the per-network subhosts of `host_short` for compact services
    pub fn compact_subhosts(&self, host_short: &str, networks: &[String]) -> Vec<String> {
        networks
            .iter()
            .map(|network| self.fqdn(&format!("{}.{}", host_short, network)))
            .collect()
    }
}

/// Queue subhost, service and "managed by" registrations for an instance.
///
/// The caller owns the batch: it must be started before and flushed after.
pub fn queue_services(
    ipa: &mut IpaClient,
    ctx: &HostContext<'_>,
    host_short: &str,
    metadata: &Metadata,
) -> Result<()> {
    let base_host = ctx.fqdn(host_short);
    let mut registrations: Vec<(String, String)> = Vec::new();

    for principal in managed_services(metadata) {
        match principal_host(&principal) {
            Some(host) => registrations.push((principal.clone(), host.to_string())),
            None => warn!(principal = %principal, "Skipping malformed managed service"),
        }
    }

    for (service, networks) in compact_services(metadata)? {
        for host in ctx.compact_subhosts(host_short, &networks) {
            registrations.push((format!("{}/{}", service, host), host));
        }
    }

    let mut hosts = BTreeSet::new();
    let mut services = BTreeSet::new();
    for (principal, host) in registrations {
        if hosts.insert(host.clone()) {
            ipa.add_subhost(&host)?;
        }
        if services.insert(principal.clone()) {
            ipa.add_service(&principal)?;
        }
        ipa.service_add_host(&principal, &base_host)?;
    }

    Ok(())
}

/// Join API business logic
pub struct JoinService {
    cloud: Arc<dyn CloudMetadata>,
    clients: Arc<dyn ClientFactory>,
    allowed: AllowedClasses,
    naming: HostNaming,
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => {
            error!("No {} in request", name);
            Err(JoinError::BadRequest(format!("No {} in request", name)))
        }
    }
}

impl JoinService {
    pub fn new(
        cloud: Arc<dyn CloudMetadata>,
        clients: Arc<dyn ClientFactory>,
        allowed: AllowedClasses,
        naming: HostNaming,
    ) -> Self {
        Self {
            cloud,
            clients,
            allowed,
            naming,
        }
    }

    /// Enroll an instance and return its OTP and FQDN
    pub async fn create(&self, request: JoinRequest) -> Result<JoinResponse> {
        let instance_id = required(&request.instance_id, "instance-id")?;
        let host_short = required(&request.hostname, "hostname")?;
        let image_id = required(&request.image_id, "image-id")?;
        let project_id = required(&request.project_id, "project-id")?;
        let metadata = &request.metadata;

        let mut ipa = self.clients.create();
        if !ipa.configured() {
            debug!("IPA is not configured, not enrolling {}", instance_id);
            return Ok(JoinResponse::default());
        }

        let image_metadata = self.cloud.image_properties(image_id).await.map_err(|e| {
            let msg = format!("Failed to get image: {}", e);
            error!("{}", msg);
            JoinError::BadRequest(msg)
        })?;

        if flag_set(metadata, "ipa_enroll") {
            debug!("IPA enrollment requested as property");
        } else if flag_set(&image_metadata, "ipa_enroll") {
            debug!("IPA enrollment requested in image");
        } else {
            debug!("IPA enrollment not requested");
            return Ok(JoinResponse::default());
        }

        if !self.cloud.instance_exists(instance_id).await? {
            let msg = format!("No such instance-id, {}", instance_id);
            error!("{}", msg);
            return Err(JoinError::BadRequest(msg));
        }

        let hostclass = metadata.get("ipa_hostclass").filter(|c| !c.is_empty());
        let project_name = if hostclass.is_some() || self.naming.project_subdomain {
            Some(self.cloud.project_name(project_id).await?)
        } else {
            None
        };

        if let (Some(class), Some(project)) = (hostclass, project_name.as_deref()) {
            let allowed = self.allowed.for_project(project);
            debug!(hostclass = %class, allowed_classes = ?allowed, "Checking host class");
            if !self.allowed.allows(project, class) {
                let msg = format!("Not allowed to add to hostclass '{}'", class);
                error!("{}", msg);
                return Err(JoinError::Forbidden(msg));
            }
        }

        let domain = ipa.domain()?;
        let ctx = HostContext {
            naming: self.naming,
            domain: &domain,
            project: project_name.as_deref(),
        };
        let hostname = ctx.fqdn(host_short);
        let otp = Zeroizing::new(uuid::Uuid::new_v4().simple().to_string());

        let ipaotp = match ipa.add_host(&hostname, &otp, metadata, &image_metadata).await {
            Ok(true) => Some(otp),
            Ok(false) => {
                debug!(hostname = %hostname, "Host already enrolled, not returning an OTP");
                None
            }
            Err(e) => {
                error!(hostname = %hostname, error = %e, "Adding host failed");
                None
            }
        };

        ipa.start_batch_operation();
        queue_services(&mut ipa, &ctx, host_short, metadata)?;
        ipa.flush_batch_operation().await.map_err(|e: DirectoryError| {
            error!(hostname = %hostname, error = %e, "Registering services failed");
            JoinError::from(e)
        })?;

        info!(instance_id, hostname = %hostname, otp_issued = ipaotp.is_some(), "Instance enrolled");
        Ok(JoinResponse {
            ipaotp,
            hostname: Some(hostname),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipa::RpcResponse;
    use crate::testing::{FakeClientFactory, FakeCloud, FakeTransport};
    use serde_json::json;

    fn service(cloud: FakeCloud, factory: FakeClientFactory, allowed: &str, naming: HostNaming) -> JoinService {
        JoinService::new(
            Arc::new(cloud),
            Arc::new(factory),
            AllowedClasses::parse(allowed).unwrap(),
            naming,
        )
    }

    fn request(metadata: serde_json::Value) -> JoinRequest {
        serde_json::from_value(json!({
            "instance-id": "i1",
            "image-id": "img1",
            "project-id": "p1",
            "hostname": "test",
            "metadata": metadata,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_missing_fields_are_bad_requests() {
        let transport = FakeTransport::new();
        let join = service(FakeCloud::new(), FakeClientFactory::configured(&transport), "", HostNaming::default());

        for missing in ["instance-id", "hostname", "image-id", "project-id"] {
            let mut body = json!({
                "instance-id": "i1", "image-id": "img1", "project-id": "p1", "hostname": "test"
            });
            body.as_object_mut().unwrap().remove(missing);
            let err = join
                .create(serde_json::from_value(body).unwrap())
                .await
                .unwrap_err();
            assert_eq!(err.to_string(), format!("No {} in request", missing));
        }
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_unconfigured_returns_empty() {
        let transport = FakeTransport::new();
        let join = service(FakeCloud::new(), FakeClientFactory::unconfigured(&transport), "", HostNaming::default());

        let response = join.create(request(json!({"ipa_enroll": "true"}))).await.unwrap();
        assert_eq!(serde_json::to_value(&response).unwrap(), json!({}));
        assert_eq!(transport.connects(), 0);
    }

    #[tokio::test]
    async fn test_enrollment_not_requested() {
        let transport = FakeTransport::new();
        let join = service(FakeCloud::new(), FakeClientFactory::configured(&transport), "", HostNaming::default());

        let response = join.create(request(json!({}))).await.unwrap();
        assert_eq!(serde_json::to_value(&response).unwrap(), json!({}));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_enrollment_from_image_property() {
        let transport = FakeTransport::new();
        let cloud = FakeCloud::new().with_image("img1", &[("ipa_enroll", "True")]);
        let join = service(cloud, FakeClientFactory::configured(&transport), "", HostNaming::default());

        let response = join.create(request(json!({}))).await.unwrap();
        assert_eq!(response.hostname.as_deref(), Some("test.example.test"));
        assert_eq!(transport.commands(), vec!["host_mod"]);
    }

    #[tokio::test]
    async fn test_enroll_returns_otp_and_fqdn() {
        let transport = FakeTransport::new();
        transport.push(Ok(RpcResponse::error(4001, "test: host not found")));
        let join = service(FakeCloud::new(), FakeClientFactory::configured(&transport), "", HostNaming::default());

        let response = join.create(request(json!({"ipa_enroll": "true"}))).await.unwrap();
        let body = serde_json::to_value(&response).unwrap();
        let otp = body["ipaotp"].as_str().unwrap();
        assert_eq!(otp.len(), 32);
        assert!(otp.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(body["hostname"], json!("test.example.test"));
        assert_eq!(transport.commands(), vec!["host_mod", "host_add"]);
        assert!(!format!("{:?}", response).contains(otp));
    }

    #[tokio::test]
    async fn test_enrolled_host_gets_no_otp() {
        let transport = FakeTransport::new();
        transport.push(Ok(RpcResponse::error(3009, "enrolled host")));
        let join = service(FakeCloud::new(), FakeClientFactory::configured(&transport), "", HostNaming::default());

        let body = serde_json::to_value(
            join.create(request(json!({"ipa_enroll": "true"}))).await.unwrap(),
        )
        .unwrap();
        assert_eq!(body, json!({"hostname": "test.example.test"}));
    }

    #[tokio::test]
    async fn test_unknown_image_is_bad_request() {
        let transport = FakeTransport::new();
        let join = service(FakeCloud::default(), FakeClientFactory::configured(&transport), "", HostNaming::default());

        let err = join.create(request(json!({"ipa_enroll": "true"}))).await.unwrap_err();
        assert!(matches!(err, JoinError::BadRequest(ref m) if m.starts_with("Failed to get image")));
    }

    #[tokio::test]
    async fn test_unknown_instance_is_bad_request() {
        let transport = FakeTransport::new();
        let cloud = FakeCloud::new().without_instance("i1");
        let join = service(cloud, FakeClientFactory::configured(&transport), "", HostNaming::default());

        let err = join.create(request(json!({"ipa_enroll": "true"}))).await.unwrap_err();
        assert_eq!(err.to_string(), "No such instance-id, i1");
    }

    #[tokio::test]
    async fn test_hostclass_must_be_allowed() {
        let transport = FakeTransport::new();
        let cloud = FakeCloud::new().with_project("p1", "demo");
        let join = service(cloud, FakeClientFactory::configured(&transport), "demo=web", HostNaming::default());

        let err = join
            .create(request(json!({"ipa_enroll": "true", "ipa_hostclass": "db"})))
            .await
            .unwrap_err();
        assert!(matches!(err, JoinError::Forbidden(_)));
        assert!(transport.requests().is_empty());

        join.create(request(json!({"ipa_enroll": "true", "ipa_hostclass": "web"})))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wildcard_hostclass() {
        let transport = FakeTransport::new();
        let cloud = FakeCloud::new().with_project("p1", "demo");
        let join = service(cloud, FakeClientFactory::configured(&transport), "demo=*", HostNaming::default());

        join.create(request(json!({"ipa_enroll": "true", "ipa_hostclass": "anything"})))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_project_subdomain_naming() {
        let transport = FakeTransport::new();
        let cloud = FakeCloud::new().with_project("p1", "Demo Team");
        let naming = HostNaming {
            project_subdomain: true,
            normalize_project: true,
        };
        let join = service(cloud, FakeClientFactory::configured(&transport), "", naming);

        let response = join.create(request(json!({"ipa_enroll": "true"}))).await.unwrap();
        assert_eq!(response.hostname.as_deref(), Some("test.demo-team.example.test"));
    }

    #[tokio::test]
    async fn test_services_registered_in_one_batch() {
        let transport = FakeTransport::new();
        let join = service(FakeCloud::new(), FakeClientFactory::configured(&transport), "", HostNaming::default());

        join.create(request(json!({
            "ipa_enroll": "true",
            "managed_service_a": "HTTP/vip.example.test",
            "managed_service_b": "HTTP/vip.example.test",
            "compact_services": "{\"HTTP\": [\"ctlplane\"], \"rabbitmq\": [\"ctlplane\"]}"
        })))
        .await
        .unwrap();

        assert_eq!(transport.commands(), vec!["host_mod", "batch"]);
        let entries = serde_json::Value::Array(transport.last_request().unwrap().args().to_vec());
        let calls: Vec<(String, String)> = entries
            .as_array()
            .unwrap()
            .iter()
            .map(|e| {
                (
                    e["method"].as_str().unwrap().to_string(),
                    e["params"][0][0].as_str().unwrap().to_string(),
                )
            })
            .collect();

        let expected: Vec<(String, String)> = [
            ("host_add", "vip.example.test"),
            ("service_add", "HTTP/vip.example.test"),
            ("service_add_host", "HTTP/vip.example.test"),
            // Duplicate managed service: only the link is repeated
            ("service_add_host", "HTTP/vip.example.test"),
            ("host_add", "test.ctlplane.example.test"),
            ("service_add", "HTTP/test.ctlplane.example.test"),
            ("service_add_host", "HTTP/test.ctlplane.example.test"),
            ("service_add", "rabbitmq/test.ctlplane.example.test"),
            ("service_add_host", "rabbitmq/test.ctlplane.example.test"),
        ]
        .iter()
        .map(|(m, p)| (m.to_string(), p.to_string()))
        .collect();
        assert_eq!(calls, expected);
        assert_eq!(entries[2]["params"][1]["host"], json!(["test.example.test"]));
    }

    #[test]
    fn test_compact_service_keys_merge() {
        let metadata: Metadata = [
            ("compact_services".to_string(), r#"{"HTTP": ["ctlplane"]}"#.to_string()),
            ("compact_service_HTTP".to_string(), r#"["internalapi"]"#.to_string()),
            ("compact_service_mysql".to_string(), r#"["internalapi"]"#.to_string()),
        ]
        .into_iter()
        .collect();

        let services = compact_services(&metadata).unwrap();
        assert_eq!(services["HTTP"], vec!["ctlplane", "internalapi"]);
        assert_eq!(services["mysql"], vec!["internalapi"]);
    }

    #[test]
    fn test_bad_compact_services_is_rejected() {
        let metadata: Metadata = [("compact_services".to_string(), "{not json".to_string())]
            .into_iter()
            .collect();
        assert!(matches!(compact_services(&metadata), Err(JoinError::BadRequest(_))));
    }
}
