use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Account ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub uuid: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub droplet_limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AccountResponse {
    pub account: Account,
}

// ── Regions ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Region {
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub available: bool,
    #[serde(default)]
    pub sizes: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RegionsResponse {
    pub regions: Vec<Region>,
}

// ── Droplets ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Droplet {
    pub id: u64,
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub region: Region,
    pub size: Size,
    #[serde(default)]
    pub networks: Networks,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Droplet {
    pub fn public_ipv4(&self) -> Option<&str> {
        self.networks
            .v4
            .iter()
            .find(|n| n.kind == "public")
            .map(|n| n.ip_address.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Size {
    pub slug: String,
    /// Monthly price in USD.
    #[serde(default)]
    pub price_monthly: f64,
    /// Included outbound transfer in terabytes.
    #[serde(default)]
    pub transfer: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Networks {
    #[serde(default)]
    pub v4: Vec<NetworkV4>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkV4 {
    pub ip_address: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateDropletRequest {
    pub name: String,
    pub region: String,
    pub size: String,
    pub image: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ssh_keys: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
    pub tags: Vec<String>,
    pub ipv6: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DropletResponse {
    pub droplet: Droplet,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DropletsResponse {
    pub droplets: Vec<Droplet>,
    #[serde(default)]
    pub links: Option<Links>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Links {
    #[serde(default)]
    pub pages: Option<Pages>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Pages {
    #[serde(default)]
    pub next: Option<String>,
}
