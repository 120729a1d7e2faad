use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, Url};
use tidemark_common::error::CommonError;
use tidemark_core::ports::ConnectivityMonitor;
use tidemark_domain::{ConnectionQuality, ConnectivityStatus};
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

use crate::config::ProbeConfig;
use crate::errors::InfraResult;

/// Latency cut-offs between quality classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityThresholds {
    pub excellent_below: Duration,
    pub good_below: Duration,
}

impl QualityThresholds {
    pub fn classify(&self, latency: Duration) -> ConnectionQuality {
        if latency < self.excellent_below {
            ConnectionQuality::Excellent
        } else if latency < self.good_below {
            ConnectionQuality::Good
        } else {
            ConnectionQuality::Poor
        }
    }
}

impl From<&ProbeConfig> for QualityThresholds {
    fn from(config: &ProbeConfig) -> Self {
        Self { excellent_below: config.excellent_below, good_below: config.good_below }
    }
}

/// Probes an HTTP endpoint and grades reachability by round-trip time
///
/// Any HTTP response counts as reachable. Server errors are graded
/// [`ConnectionQuality::Poor`] whatever their latency; transport failures
/// and timeouts report offline.
#[derive(Debug)]
pub struct HttpConnectivityMonitor {
    client: Client,
    url: Url,
    thresholds: QualityThresholds,
    sender: watch::Sender<ConnectivityStatus>,
}

impl HttpConnectivityMonitor {
    /// # Errors
    /// Fails when no probe URL is configured, the URL is invalid, or the
    /// HTTP client cannot be built.
    pub fn new(config: &ProbeConfig) -> InfraResult<Self> {
        let raw = config
            .url
            .as_deref()
            .ok_or_else(|| CommonError::config_field("probe.url", "required for HTTP probing"))?;
        let url = Url::parse(raw)
            .map_err(|e| CommonError::config_field("probe.url", format!("invalid URL: {e}")))?;
        let client = Client::builder().timeout(config.timeout).no_proxy().build()?;

        // Optimistic until the first probe answers
        let (sender, _) = watch::channel(ConnectivityStatus::online(ConnectionQuality::Good));
        Ok(Self { client, url, thresholds: QualityThresholds::from(config), sender })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl ConnectivityMonitor for HttpConnectivityMonitor {
    fn current(&self) -> ConnectivityStatus {
        *self.sender.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<ConnectivityStatus> {
        self.sender.subscribe()
    }

    #[instrument(skip(self), fields(url = %self.url))]
    async fn probe(&self) -> ConnectivityStatus {
        let started = Instant::now();
        let status = match self.client.get(self.url.clone()).send().await {
            Ok(response) => {
                let latency = started.elapsed();
                let latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
                let quality = if response.status().is_server_error() {
                    warn!(status = %response.status(), "probe endpoint returned a server error");
                    ConnectionQuality::Poor
                } else {
                    self.thresholds.classify(latency)
                };
                debug!(latency_ms, %quality, "probe answered");
                ConnectivityStatus::online(quality).with_latency(latency_ms)
            }
            Err(e) => {
                warn!(error = %e, timeout = e.is_timeout(), "connectivity probe failed");
                ConnectivityStatus::offline()
            }
        };
        self.sender.send_replace(status);
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_classes() {
        let thresholds = QualityThresholds::from(&ProbeConfig::default());
        assert_eq!(thresholds.classify(Duration::from_millis(20)), ConnectionQuality::Excellent);
        assert_eq!(thresholds.classify(Duration::from_millis(150)), ConnectionQuality::Good);
        assert_eq!(thresholds.classify(Duration::from_millis(599)), ConnectionQuality::Good);
        assert_eq!(thresholds.classify(Duration::from_millis(600)), ConnectionQuality::Poor);
    }

    #[test]
    fn requires_a_url() {
        let err = HttpConnectivityMonitor::new(&ProbeConfig::default()).unwrap_err();
        assert!(err.to_string().contains("probe.url"));

        let config = ProbeConfig { url: Some("::nope".into()), ..ProbeConfig::default() };
        assert!(HttpConnectivityMonitor::new(&config).is_err());
    }

    #[test]
    fn starts_optimistic() {
        let config =
            ProbeConfig { url: Some("http://127.0.0.1:9/health".into()), ..ProbeConfig::default() };
        let monitor = HttpConnectivityMonitor::new(&config).unwrap();
        assert!(monitor.current().reachable);
        assert_eq!(monitor.url().path(), "/health");
    }
}
