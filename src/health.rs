use crate::config::Health;
use log::{debug, info, warn};
use reqwest::Client;
use std::time::Duration;
use tokio::time::{Instant, interval_at, timeout};

pub trait HealthCheck: Send + Sync + 'static {
    /// Resolves to `true` once the service answers on `port`.
    fn probe(&self, port: u16, path: &str) -> impl Future<Output = bool> + Send;
}

/// Polls `http://<host>:<port>/<path>` at a fixed interval until it answers
/// with a 2xx or the timeout elapses.
pub struct HttpProber {
    client: Client,
    host: String,
    interval: Duration,
    timeout: Duration,
    enabled: bool,
}

impl HttpProber {
    pub fn new(host: impl Into<String>, interval: Duration, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(interval).build()?;
        Ok(Self {
            client,
            host: host.into(),
            interval,
            timeout,
            enabled: true,
        })
    }

    pub fn from_config(config: &Health) -> Result<Self, reqwest::Error> {
        let mut prober = Self::new(
            config.host.clone(),
            Duration::from_secs(config.interval),
            Duration::from_secs(config.timeout),
        )?;
        prober.enabled = config.enabled;
        Ok(prober)
    }

    pub fn endpoint(&self, port: u16, path: &str) -> String {
        format!(
            "http://{}:{port}/{}",
            self.host,
            path.trim_start_matches('/')
        )
    }

    async fn poll(&self, endpoint: &str) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        loop {
            ticker.tick().await;
            match self.client.get(endpoint).send().await {
                Ok(response) if response.status().is_success() => return,
                Ok(response) => debug!("{endpoint} answered {}", response.status()),
                Err(e) => debug!("{endpoint} not reachable yet: {e}"),
            }
        }
    }
}

impl HealthCheck for HttpProber {
    async fn probe(&self, port: u16, path: &str) -> bool {
        let endpoint = self.endpoint(port, path);
        if !self.enabled {
            warn!("health check disabled, assuming {endpoint} is healthy");
            return true;
        }
        info!("Check health of {endpoint}");
        match timeout(self.timeout, self.poll(&endpoint)).await {
            Ok(()) => true,
            Err(_) => {
                warn!("{endpoint} not healthy after {:?}", self.timeout);
                false
            }
        }
    }
}
