//! Typed Rust client for the Compute Engine v1 API.
//!
//! Covers the subset needed for managing Outline instances: zones,
//! firewalls, instances, zone operations, guest attributes, and regional
//! static addresses. Authentication is a caller-supplied OAuth access token;
//! obtaining and refreshing it is out of scope for this crate.

mod types;

pub use reqwest::StatusCode;
pub use types::*;

const BASE_URL: &str = "https://compute.googleapis.com/compute/v1";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("compute api request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("compute api {endpoint} returned {status}: {body}")]
    Api {
        endpoint: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("compute operation {operation} failed: {message}")]
    Operation { operation: String, message: String },
}

impl Error {
    /// The API answered 404 for the requested resource.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { status, .. } if *status == reqwest::StatusCode::NOT_FOUND)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Client for the Compute Engine REST API, scoped to one project.
#[derive(Clone)]
pub struct ComputeClient {
    token: String,
    project: String,
    base_url: String,
    http: reqwest::Client,
}

impl ComputeClient {
    pub fn new(token: impl Into<String>, project: impl Into<String>) -> Self {
        Self::with_base_url(token, project, BASE_URL)
    }

    /// Point the client at a different API root (used against local mock servers).
    pub fn with_base_url(
        token: impl Into<String>,
        project: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            token: token.into(),
            project: project.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    fn url(&self, path: &str) -> String {
        format!("{}/projects/{}{path}", self.base_url, self.project)
    }

    fn auth(&self) -> String {
        format!("Bearer {}", self.token)
    }

    async fn check(resp: reqwest::Response, endpoint: &'static str) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api { endpoint, status, body });
        }
        Ok(resp)
    }

    // ── Zones ───────────────────────────────────────────────────────

    pub async fn list_zones(&self) -> Result<Vec<Zone>> {
        let mut zones = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut builder = self
                .http
                .get(self.url("/zones"))
                .header("Authorization", self.auth());
            if let Some(token) = &page_token {
                builder = builder.query(&[("pageToken", token)]);
            }

            let list: ZoneList = Self::check(builder.send().await?, "list zones")
                .await?
                .json()
                .await?;
            zones.extend(list.items);

            match list.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(zones)
    }

    // ── Operations ──────────────────────────────────────────────────

    /// Block server-side until a zone operation finishes (or the API's own
    /// wait deadline passes), then surface any operation error.
    pub async fn wait_zone_operation(&self, zone: &str, operation: &str) -> Result<Operation> {
        let resp = self
            .http
            .post(self.url(&format!("/zones/{zone}/operations/{operation}/wait")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        let op: Operation = Self::check(resp, "wait zone operation")
            .await?
            .json()
            .await?;
        if let Some(message) = op.error_message() {
            return Err(Error::Operation {
                operation: op.name,
                message,
            });
        }
        Ok(op)
    }

    pub async fn wait_global_operation(&self, operation: &str) -> Result<Operation> {
        let resp = self
            .http
            .post(self.url(&format!("/global/operations/{operation}/wait")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        let op: Operation = Self::check(resp, "wait global operation")
            .await?
            .json()
            .await?;
        if let Some(message) = op.error_message() {
            return Err(Error::Operation {
                operation: op.name,
                message,
            });
        }
        Ok(op)
    }

    pub async fn wait_region_operation(&self, region: &str, operation: &str) -> Result<Operation> {
        let resp = self
            .http
            .post(self.url(&format!("/regions/{region}/operations/{operation}/wait")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        let op: Operation = Self::check(resp, "wait region operation")
            .await?
            .json()
            .await?;
        if let Some(message) = op.error_message() {
            return Err(Error::Operation {
                operation: op.name,
                message,
            });
        }
        Ok(op)
    }

    // ── Firewalls ───────────────────────────────────────────────────

    pub async fn get_firewall(&self, name: &str) -> Result<Firewall> {
        let resp = self
            .http
            .get(self.url(&format!("/global/firewalls/{name}")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        Self::check(resp, "get firewall")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    pub async fn create_firewall(&self, firewall: &Firewall) -> Result<Operation> {
        let resp = self
            .http
            .post(self.url("/global/firewalls"))
            .header("Authorization", self.auth())
            .json(firewall)
            .send()
            .await?;

        Self::check(resp, "create firewall")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    // ── Instances ───────────────────────────────────────────────────

    pub async fn insert_instance(
        &self,
        zone: &str,
        req: &InsertInstanceRequest,
    ) -> Result<Operation> {
        let resp = self
            .http
            .post(self.url(&format!("/zones/{zone}/instances")))
            .header("Authorization", self.auth())
            .json(req)
            .send()
            .await?;

        Self::check(resp, "insert instance")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    pub async fn get_instance(&self, zone: &str, name: &str) -> Result<Instance> {
        let resp = self
            .http
            .get(self.url(&format!("/zones/{zone}/instances/{name}")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        Self::check(resp, "get instance")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    pub async fn delete_instance(&self, zone: &str, name: &str) -> Result<Operation> {
        let resp = self
            .http
            .delete(self.url(&format!("/zones/{zone}/instances/{name}")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        Self::check(resp, "delete instance")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    /// List instances across all zones matching a filter expression,
    /// e.g. `labels.outline=true`.
    pub async fn list_all_instances(&self, filter: &str) -> Result<Vec<Instance>> {
        let mut instances = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut builder = self
                .http
                .get(self.url("/aggregated/instances"))
                .header("Authorization", self.auth())
                .query(&[("filter", filter)]);
            if let Some(token) = &page_token {
                builder = builder.query(&[("pageToken", token)]);
            }

            let list: AggregatedInstanceList =
                Self::check(builder.send().await?, "list instances")
                    .await?
                    .json()
                    .await?;
            instances.extend(list.items.into_values().flat_map(|scoped| scoped.instances));

            match list.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(instances)
    }

    /// Read guest attributes published by the instance under `query_path`
    /// (e.g. `outline/`). Returns an empty list when nothing is published yet.
    pub async fn get_guest_attributes(
        &self,
        zone: &str,
        instance: &str,
        query_path: &str,
    ) -> Result<Vec<GuestAttribute>> {
        let resp = self
            .http
            .get(self.url(&format!("/zones/{zone}/instances/{instance}/getGuestAttributes")))
            .header("Authorization", self.auth())
            .query(&[("queryPath", query_path)])
            .send()
            .await?;

        let attrs: GuestAttributesResponse = Self::check(resp, "get guest attributes")
            .await?
            .json()
            .await?;
        Ok(attrs.query_value.map(|v| v.items).unwrap_or_default())
    }

    // ── Addresses ───────────────────────────────────────────────────

    pub async fn create_static_ip(
        &self,
        region: &str,
        req: &CreateAddressRequest,
    ) -> Result<Operation> {
        let resp = self
            .http
            .post(self.url(&format!("/regions/{region}/addresses")))
            .header("Authorization", self.auth())
            .json(req)
            .send()
            .await?;

        Self::check(resp, "create static ip")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    pub async fn delete_static_ip(&self, region: &str, name: &str) -> Result<Operation> {
        let resp = self
            .http
            .delete(self.url(&format!("/regions/{region}/addresses/{name}")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        Self::check(resp, "delete static ip")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }
}
