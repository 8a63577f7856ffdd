//! Notification message formats
//!
//! Compute and network services publish an envelope of
//! `{"event_type", "publisher_id", "payload"}`. Two payload shapes exist:
//!
//! - unversioned (legacy): `compute.instance.*` events with flat payloads
//!   carrying `hostname`, `instance_id`, `metadata` and `image_meta`
//! - versioned: `instance.*` events whose payload wraps the data in
//!   `nova_object.data` next to a `nova_object.version` of `major.minor`
//!
//! Floating IP events come from the network service and are not versioned.

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::config::NotificationFormat;
use crate::types::{JoinError, Metadata, Result};

/// Notification envelope as published on the bus
#[derive(Debug, Clone, Deserialize)]
pub struct Notification {
    pub event_type: String,
    #[serde(default)]
    pub publisher_id: String,
    #[serde(default)]
    pub payload: Value,
}

/// Payload versions this listener understands, per versioned event type
const EXPECTED_VERSIONS: &[(&str, u32, u32)] = &[
    ("instance.create.end", 1, 10),
    ("instance.update", 1, 9),
    ("instance.delete.end", 1, 8),
];

/// Where an instance's image properties come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// Properties carried in the payload
    Properties(Metadata),
    /// Image id to look up in the image service
    Lookup(String),
    Unknown,
}

/// Instance fields the handlers need
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub instance_id: String,
    /// Short host name
    pub hostname: String,
    pub project_id: Option<String>,
    pub metadata: Metadata,
    pub image: ImageSource,
    pub state: Option<String>,
}

/// A notification this listener acts on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    InstanceCreated(InstanceInfo),
    InstanceUpdated(InstanceInfo),
    InstanceDeleted(InstanceInfo),
    FloatingIpAssociated { instance_id: String, floating_ip: String },
    FloatingIpDisassociated { instance_id: String, floating_ip: String },
    /// Network service floating IP update; no port means disassociation
    FloatingIpUpdated { floating_ip: String, port_id: Option<String> },
}

impl Event {
    /// Decode a notification. `Ok(None)` for events this listener ignores.
    pub fn parse(notification: &Notification, format: NotificationFormat) -> Result<Option<Self>> {
        let payload = &notification.payload;

        if notification.event_type == "floatingip.update.end" {
            return floating_ip_update(payload).map(Some);
        }

        match format {
            NotificationFormat::Unversioned => {
                if !from_known_publisher(&notification.publisher_id) {
                    return Ok(None);
                }
                let event = match notification.event_type.as_str() {
                    "compute.instance.create.end" => Event::InstanceCreated(unversioned_instance(payload)?),
                    "compute.instance.update" => Event::InstanceUpdated(unversioned_instance(payload)?),
                    "compute.instance.delete.end" => Event::InstanceDeleted(unversioned_instance(payload)?),
                    "network.floating_ip.associate" => Event::FloatingIpAssociated {
                        instance_id: required_str(payload, "instance_id")?,
                        floating_ip: required_str(payload, "floating_ip")?,
                    },
                    "network.floating_ip.disassociate" => Event::FloatingIpDisassociated {
                        instance_id: required_str(payload, "instance_id")?,
                        floating_ip: required_str(payload, "floating_ip")?,
                    },
                    _ => return Ok(None),
                };
                Ok(Some(event))
            }
            NotificationFormat::Versioned => {
                let event_type = notification.event_type.as_str();
                let Some(&(_, major, minor)) = EXPECTED_VERSIONS.iter().find(|(t, _, _)| *t == event_type)
                else {
                    return Ok(None);
                };
                check_version(event_type, payload, major, minor)?;

                let info = versioned_instance(&payload["nova_object.data"])?;
                let event = match event_type {
                    "instance.create.end" => Event::InstanceCreated(info),
                    "instance.update" => Event::InstanceUpdated(info),
                    _ => Event::InstanceDeleted(info),
                };
                Ok(Some(event))
            }
        }
    }
}

fn from_known_publisher(publisher_id: &str) -> bool {
    publisher_id.is_empty() || publisher_id.starts_with("compute") || publisher_id.starts_with("network")
}

/// `major.minor` of a versioned payload
pub fn payload_version(payload: &Value) -> Option<(u32, u32)> {
    let version = payload["nova_object.version"].as_str()?;
    let (major, minor) = version.split_once('.')?;
    Some((major.trim().parse().ok()?, minor.trim().parse().ok()?))
}

/// Major mismatch fails with `VersionMismatch`; minor mismatch only logs
fn check_version(event_type: &str, payload: &Value, expected_major: u32, expected_minor: u32) -> Result<()> {
    let (major, minor) = payload_version(payload).ok_or_else(|| {
        JoinError::BadRequest(format!("{} payload has no usable nova_object.version", event_type))
    })?;

    if major != expected_major {
        return Err(JoinError::VersionMismatch {
            event_type: event_type.to_string(),
            provided_major: major,
            provided_minor: minor,
            expected_major,
            expected_minor,
        });
    }
    if minor != expected_minor {
        debug!(
            event_type,
            provided = %format!("{}.{}", major, minor),
            expected = %format!("{}.{}", expected_major, expected_minor),
            "Notification minor version differs"
        );
    }
    Ok(())
}

fn required_str(payload: &Value, key: &str) -> Result<String> {
    payload[key]
        .as_str()
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| JoinError::BadRequest(format!("Notification payload has no {}", key)))
}

fn optional_str(payload: &Value, key: &str) -> Option<String> {
    payload[key].as_str().filter(|v| !v.is_empty()).map(str::to_string)
}

/// Metadata object with values flattened to strings
fn metadata(value: &Value) -> Metadata {
    value
        .as_object()
        .map(|object| {
            object
                .iter()
                .map(|(key, value)| {
                    let value = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (key.clone(), value)
                })
                .collect()
        })
        .unwrap_or_default()
}

fn unversioned_instance(payload: &Value) -> Result<InstanceInfo> {
    let image = match payload.get("image_meta") {
        Some(meta) if meta.is_object() => ImageSource::Properties(metadata(meta)),
        _ => optional_str(payload, "image_ref_url")
            .and_then(|url| url.rsplit('/').next().map(str::to_string))
            .map_or(ImageSource::Unknown, ImageSource::Lookup),
    };

    Ok(InstanceInfo {
        instance_id: required_str(payload, "instance_id")?,
        hostname: required_str(payload, "hostname")?,
        project_id: optional_str(payload, "tenant_id"),
        metadata: metadata(&payload["metadata"]),
        image,
        state: optional_str(payload, "state"),
    })
}

fn versioned_instance(data: &Value) -> Result<InstanceInfo> {
    Ok(InstanceInfo {
        instance_id: required_str(data, "uuid")?,
        hostname: required_str(data, "host_name")?,
        project_id: optional_str(data, "tenant_id"),
        metadata: metadata(&data["metadata"]),
        image: optional_str(data, "image_uuid").map_or(ImageSource::Unknown, ImageSource::Lookup),
        state: optional_str(data, "state"),
    })
}

fn floating_ip_update(payload: &Value) -> Result<Event> {
    let floatingip = &payload["floatingip"];
    Ok(Event::FloatingIpUpdated {
        floating_ip: required_str(floatingip, "floating_ip_address")?,
        port_id: optional_str(floatingip, "port_id"),
    })
}
