use crate::config::Gateway;
use crate::model::UpstreamId;
use log::{debug, info, warn};
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway unreachable: {0}")]
    Unreachable(#[from] reqwest::Error),
    #[error("gateway rejected upstream change ({status}): {body}")]
    Rejected { status: StatusCode, body: String },
}

impl GatewayError {
    fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Unreachable(_) => true,
            GatewayError::Rejected { status, .. } => status.is_server_error(),
        }
    }
}

/// Points a gateway upstream at a single node.
pub trait UpstreamSwitcher: Send + Sync + 'static {
    fn set_upstream(
        &self,
        upstream: &UpstreamId,
        host: &str,
        port: u16,
    ) -> impl Future<Output = Result<(), GatewayError>> + Send;
}

/// Node list replacing everything the upstream routed to before.
pub fn upstream_nodes(host: &str, port: u16) -> Value {
    json!({ format!("{host}:{port}"): 100 })
}

/// Delay before retry number `attempt + 1`, doubling from `base`.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

/// APISIX admin api client.
pub struct ApisixAdmin {
    client: Client,
    admin: String,
    key: String,
    retries: u32,
    backoff: Duration,
}

impl ApisixAdmin {
    pub fn new(config: &Gateway) -> Result<Self, GatewayError> {
        let client = Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            client,
            admin: config.admin.trim_end_matches('/').to_string(),
            key: config.key.clone(),
            retries: config.retries,
            backoff: config.backoff(),
        })
    }

    fn nodes_url(&self, upstream: &UpstreamId) -> String {
        format!("{}/apisix/admin/upstreams/{upstream}/nodes", self.admin)
    }

    async fn patch_nodes(&self, url: &str, nodes: &Value) -> Result<(), GatewayError> {
        let response = self
            .client
            .patch(url)
            .header("X-API-KEY", &self.key)
            .json(nodes)
            .send()
            .await?;
        let status = response.status();
        debug!("admin api response: {status}");
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(GatewayError::Rejected { status, body })
    }
}

impl UpstreamSwitcher for ApisixAdmin {
    async fn set_upstream(
        &self,
        upstream: &UpstreamId,
        host: &str,
        port: u16,
    ) -> Result<(), GatewayError> {
        let url = self.nodes_url(upstream);
        let nodes = upstream_nodes(host, port);
        let mut attempt = 0;
        loop {
            match self.patch_nodes(&url, &nodes).await {
                Ok(()) => {
                    info!("upstream {upstream} now routes to {host}:{port}");
                    return Ok(());
                }
                Err(e) if attempt < self.retries && e.is_retryable() => {
                    let delay = backoff_delay(self.backoff, attempt);
                    warn!("switching upstream {upstream} failed: {e}, retrying in {delay:?}");
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
