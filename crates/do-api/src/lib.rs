//! Typed Rust client for the DigitalOcean v2 API.
//!
//! Covers the subset needed for managing Outline droplets:
//! account, regions, droplets (create, get, list by tag, delete).

mod types;

pub use reqwest::StatusCode;
pub use types::*;

const BASE_URL: &str = "https://api.digitalocean.com/v2";
const PAGE_SIZE: u32 = 200;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("digitalocean api request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("digitalocean api {endpoint} returned {status}: {body}")]
    Api {
        endpoint: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },
}

impl Error {
    /// The API answered 404 for the requested resource.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { status, .. } if *status == reqwest::StatusCode::NOT_FOUND)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Client for the DigitalOcean REST API.
#[derive(Clone)]
pub struct DigitalOceanClient {
    token: String,
    base_url: String,
    http: reqwest::Client,
}

impl DigitalOceanClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_base_url(token, BASE_URL)
    }

    /// Point the client at a different API root (used against local mock servers).
    pub fn with_base_url(token: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Access token, needed by droplets that tag themselves.
    pub fn token(&self) -> &str {
        &self.token
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
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

    // ── Account ──────────────────────────────────────────────────────

    pub async fn get_account(&self) -> Result<Account> {
        let resp = self
            .http
            .get(self.url("/account"))
            .header("Authorization", self.auth())
            .send()
            .await?;

        let wrapper: AccountResponse = Self::check(resp, "get account").await?.json().await?;
        Ok(wrapper.account)
    }

    // ── Regions ──────────────────────────────────────────────────────

    pub async fn list_regions(&self) -> Result<Vec<Region>> {
        let resp = self
            .http
            .get(self.url("/regions"))
            .header("Authorization", self.auth())
            .query(&[("per_page", PAGE_SIZE)])
            .send()
            .await?;

        let wrapper: RegionsResponse = Self::check(resp, "list regions").await?.json().await?;
        Ok(wrapper.regions)
    }

    // ── Droplets ─────────────────────────────────────────────────────

    pub async fn create_droplet(&self, req: &CreateDropletRequest) -> Result<Droplet> {
        let resp = self
            .http
            .post(self.url("/droplets"))
            .header("Authorization", self.auth())
            .json(req)
            .send()
            .await?;

        let wrapper: DropletResponse = Self::check(resp, "create droplet").await?.json().await?;
        Ok(wrapper.droplet)
    }

    pub async fn get_droplet(&self, droplet_id: u64) -> Result<Droplet> {
        let resp = self
            .http
            .get(self.url(&format!("/droplets/{droplet_id}")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        let wrapper: DropletResponse = Self::check(resp, "get droplet").await?.json().await?;
        Ok(wrapper.droplet)
    }

    /// List every droplet carrying `tag`, following pagination.
    pub async fn list_droplets_by_tag(&self, tag: &str) -> Result<Vec<Droplet>> {
        let mut droplets = Vec::new();
        let mut page = 1u32;

        loop {
            let resp = self
                .http
                .get(self.url("/droplets"))
                .header("Authorization", self.auth())
                .query(&[("tag_name", tag)])
                .query(&[("per_page", PAGE_SIZE), ("page", page)])
                .send()
                .await?;

            let wrapper: DropletsResponse = Self::check(resp, "list droplets").await?.json().await?;
            let received = wrapper.droplets.len();
            droplets.extend(wrapper.droplets);

            let has_next = wrapper
                .links
                .and_then(|l| l.pages)
                .and_then(|p| p.next)
                .is_some();
            if !has_next || received == 0 {
                break;
            }
            page += 1;
        }

        Ok(droplets)
    }

    pub async fn delete_droplet(&self, droplet_id: u64) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(&format!("/droplets/{droplet_id}")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        Self::check(resp, "delete droplet").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    const DROPLET_JSON: &str = r#"{
        "id": 3164444,
        "name": "outline-nyc",
        "status": "new",
        "tags": ["outline", "kv:apiurl:68747470733a2f2f"],
        "created_at": "2024-05-01T10:00:00Z",
        "region": {"slug": "nyc3", "name": "New York 3", "available": true},
        "size": {"slug": "s-1vcpu-1gb", "price_monthly": 6.0, "transfer": 1.0},
        "networks": {"v4": [{"ip_address": "203.0.113.7", "type": "public"}]}
    }"#;

    #[tokio::test]
    async fn get_droplet_parses_tags_and_size() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/droplets/3164444")
            .match_header("authorization", "Bearer t0k")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(format!(r#"{{"droplet": {DROPLET_JSON}}}"#))
            .create_async()
            .await;

        let client = DigitalOceanClient::with_base_url("t0k", server.url());
        let droplet = client.get_droplet(3164444).await.unwrap();

        assert_eq!(droplet.name, "outline-nyc");
        assert_eq!(droplet.tags.len(), 2);
        assert_eq!(droplet.region.slug, "nyc3");
        assert_eq!(droplet.size.price_monthly, 6.0);
        assert_eq!(droplet.public_ipv4(), Some("203.0.113.7"));
    }

    #[tokio::test]
    async fn list_droplets_follows_pages() {
        let mut server = Server::new_async().await;
        let _page1 = server
            .mock("GET", "/droplets")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("tag_name".into(), "outline".into()),
                Matcher::UrlEncoded("page".into(), "1".into()),
            ]))
            .with_status(200)
            .with_body(format!(
                r#"{{"droplets": [{DROPLET_JSON}], "links": {{"pages": {{"next": "x"}}}}}}"#
            ))
            .expect(1)
            .create_async()
            .await;
        let _page2 = server
            .mock("GET", "/droplets")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("tag_name".into(), "outline".into()),
                Matcher::UrlEncoded("page".into(), "2".into()),
            ]))
            .with_status(200)
            .with_body(format!(r#"{{"droplets": [{DROPLET_JSON}], "links": {{}}}}"#))
            .expect(1)
            .create_async()
            .await;

        let client = DigitalOceanClient::with_base_url("t0k", server.url());
        let droplets = client.list_droplets_by_tag("outline").await.unwrap();
        assert_eq!(droplets.len(), 2);
    }

    #[tokio::test]
    async fn delete_missing_droplet_is_not_found() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("DELETE", "/droplets/42")
            .with_status(404)
            .with_body(r#"{"id":"not_found","message":"The resource you were accessing could not be found."}"#)
            .create_async()
            .await;

        let client = DigitalOceanClient::with_base_url("t0k", server.url());
        let err = client.delete_droplet(42).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn server_error_is_not_not_found() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/account")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let client = DigitalOceanClient::with_base_url("t0k", server.url());
        let err = client.get_account().await.unwrap_err();
        assert!(!err.is_not_found());
        assert!(err.to_string().contains("get account"));
    }
}
