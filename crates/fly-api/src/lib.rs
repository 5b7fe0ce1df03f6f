//! Typed Rust client for the Fly.io Machines API.
//!
//! Covers the subset needed to provision Cloudify machines:
//! machines (create, get, list, wait, delete).

mod types;

pub use types::*;

const BASE_URL: &str = "https://api.machines.dev/v1";

/// Longest wait the `/wait` endpoint accepts in a single call.
pub const MAX_WAIT: std::time::Duration = std::time::Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("fly api request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("fly api {endpoint} returned {status}: {body}")]
    Api {
        endpoint: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },
}

impl Error {
    /// Whether the API answered 408, which `/wait` uses when the state was
    /// not reached in time.
    pub fn is_wait_timeout(&self) -> bool {
        matches!(self, Self::Api { status, .. } if status.as_u16() == 408)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Client for the Fly.io Machines REST API.
#[derive(Clone)]
pub struct FlyClient {
    token: String,
    app: String,
    base_url: String,
    http: reqwest::Client,
}

impl FlyClient {
    pub fn new(token: impl Into<String>, app: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            app: app.into(),
            base_url: BASE_URL.to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Talk to another Machines API endpoint, e.g. the internal
    /// `http://_api.internal:4280/v1`.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    fn url(&self, path: &str) -> String {
        format!("{}/apps/{}{path}", self.base_url, self.app)
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

    // ── Machines ─────────────────────────────────────────────────────

    pub async fn create_machine(&self, req: &CreateMachineRequest) -> Result<Machine> {
        let resp = self
            .http
            .post(self.url("/machines"))
            .header("Authorization", self.auth())
            .json(req)
            .send()
            .await?;

        Self::check(resp, "create machine")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    pub async fn get_machine(&self, machine_id: &str) -> Result<Machine> {
        let resp = self
            .http
            .get(self.url(&format!("/machines/{machine_id}")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        Self::check(resp, "get machine")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    pub async fn list_machines(&self) -> Result<Vec<Machine>> {
        let resp = self
            .http
            .get(self.url("/machines"))
            .header("Authorization", self.auth())
            .send()
            .await?;

        Self::check(resp, "list machines")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    /// Block until the machine reaches `state`, for at most `timeout`
    /// (clamped to [`MAX_WAIT`], rounded up to whole seconds).
    pub async fn wait_for_state(
        &self,
        machine_id: &str,
        state: MachineState,
        timeout: std::time::Duration,
    ) -> Result<()> {
        let secs = timeout.min(MAX_WAIT).as_secs().max(1).to_string();
        let resp = self
            .http
            .get(self.url(&format!("/machines/{machine_id}/wait")))
            .query(&[("state", state.as_str()), ("timeout", secs.as_str())])
            .header("Authorization", self.auth())
            .send()
            .await?;

        Self::check(resp, "wait for machine").await?;
        Ok(())
    }

    /// Delete a machine. Returns `false` when it did not exist.
    pub async fn delete_machine(&self, machine_id: &str, force: bool) -> Result<bool> {
        let resp = self
            .http
            .delete(self.url(&format!("/machines/{machine_id}")))
            .query(&[("force", force)])
            .header("Authorization", self.auth())
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::check(resp, "delete machine").await?;
        Ok(true)
    }
}
