use std::time::Duration;

use async_trait::async_trait;
use cfy_installer::GridMembership;
use cfy_installer::registration::MembershipError;
use tracing::debug;

/// Treats a management machine as registered once its REST gateway answers.
#[derive(Debug, Clone)]
pub struct RestGatewayProbe {
    http: reqwest::Client,
    port: u16,
    request_timeout: Duration,
}

impl RestGatewayProbe {
    pub fn new(port: u16) -> Self {
        Self {
            http: reqwest::Client::new(),
            port,
            request_timeout: Duration::from_secs(10),
        }
    }

    pub fn url(&self, host: &str) -> String {
        format!("http://{host}:{}/service/testrest", self.port)
    }
}

#[async_trait]
impl GridMembership for RestGatewayProbe {
    async fn is_agent_registered(&self, host: &str) -> Result<bool, MembershipError> {
        let resp = self
            .http
            .get(self.url(host))
            .timeout(self.request_timeout)
            .send()
            .await?;
        let status = resp.status();
        debug!(host, %status, "rest gateway answered");
        Ok(status.is_success())
    }
}
