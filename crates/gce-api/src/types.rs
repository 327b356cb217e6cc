use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ── Zones ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Zone {
    pub name: String,
    /// Full URL of the zone's region.
    pub region: String,
    pub status: String,
}

impl Zone {
    pub fn is_up(&self) -> bool {
        self.status == "UP"
    }

    pub fn region_name(&self) -> &str {
        last_segment(&self.region)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ZoneList {
    #[serde(default)]
    pub items: Vec<Zone>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

// ── Operations ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub error: Option<OperationError>,
}

impl Operation {
    pub fn is_done(&self) -> bool {
        self.status == "DONE"
    }

    /// First error message reported by a finished operation.
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(|e| {
            e.errors
                .iter()
                .map(|d| format!("{}: {}", d.code, d.message))
                .collect::<Vec<_>>()
                .join("; ")
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperationError {
    #[serde(default)]
    pub errors: Vec<OperationErrorDetail>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperationErrorDetail {
    pub code: String,
    #[serde(default)]
    pub message: String,
}

// ── Firewalls ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Firewall {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_ranges: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed: Vec<FirewallRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallRule {
    #[serde(rename = "IPProtocol")]
    pub ip_protocol: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
}

// ── Instances ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    /// Numeric instance id, transported as a string.
    pub id: String,
    pub name: String,
    /// Full URL of the instance's zone.
    pub zone: String,
    pub status: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,
    #[serde(default)]
    pub creation_timestamp: Option<String>,
}

impl Instance {
    pub fn zone_name(&self) -> &str {
        last_segment(&self.zone)
    }

    /// External IP of the first one-to-one NAT access config.
    pub fn nat_ip(&self) -> Option<&str> {
        self.network_interfaces
            .iter()
            .flat_map(|n| n.access_configs.iter())
            .find_map(|a| a.nat_ip.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_configs: Vec<AccessConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessConfig {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "natIP", default, skip_serializing_if = "Option::is_none")]
    pub nat_ip: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertInstanceRequest {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub machine_type: String,
    pub disks: Vec<AttachedDisk>,
    pub network_interfaces: Vec<NetworkInterface>,
    pub labels: HashMap<String, String>,
    pub tags: Tags,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedDisk {
    pub boot: bool,
    pub auto_delete: bool,
    pub initialize_params: DiskInitializeParams,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskInitializeParams {
    pub source_image: String,
    pub disk_size_gb: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Tags {
    pub items: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Metadata {
    pub items: Vec<MetadataItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetadataItem {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AggregatedInstanceList {
    #[serde(default)]
    pub items: HashMap<String, InstancesScopedList>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct InstancesScopedList {
    #[serde(default)]
    pub instances: Vec<Instance>,
}

// ── Guest attributes ────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct GuestAttribute {
    #[serde(default)]
    pub namespace: String,
    pub key: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GuestAttributesResponse {
    #[serde(default)]
    pub query_value: Option<GuestAttributesValue>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GuestAttributesValue {
    #[serde(default)]
    pub items: Vec<GuestAttribute>,
}

// ── Addresses ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct CreateAddressRequest {
    pub name: String,
    /// Existing ephemeral IP to promote; `None` reserves a fresh one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// Region name for a zone name, e.g. `us-central1-a` -> `us-central1`.
pub fn region_of_zone(zone: &str) -> &str {
    zone.rsplit_once('-').map(|(region, _)| region).unwrap_or(zone)
}

fn last_segment(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}
