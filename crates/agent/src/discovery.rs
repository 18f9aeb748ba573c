//! Periodic DNS-SD scan for mesh peers.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent};
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use common::PeerRecord;

use crate::metrics::{push_log, Metrics, SharedLogs};

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("browse for {service_type} failed: {reason}")]
    Browse { service_type: String, reason: String },
}

/// One raw answer to a discovery query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryResponse {
    pub name: String,
    /// `key=value|key=value` attribute blob.
    pub attributes: String,
    pub address: IpAddr,
    pub port: u16,
}

#[async_trait]
pub trait Browser: Send + Sync {
    /// Collect responses for `service_type` until `window` elapses.
    async fn query(&self, service_type: &str, window: Duration) -> Result<Vec<DiscoveryResponse>, DiscoveryError>;
}

pub struct MdnsBrowser {
    daemon: ServiceDaemon,
}

impl MdnsBrowser {
    pub fn new(daemon: ServiceDaemon) -> Self {
        Self { daemon }
    }
}

#[async_trait]
impl Browser for MdnsBrowser {
    async fn query(&self, service_type: &str, window: Duration) -> Result<Vec<DiscoveryResponse>, DiscoveryError> {
        let receiver = self.daemon.browse(service_type).map_err(|e| DiscoveryError::Browse {
            service_type: service_type.to_string(),
            reason: e.to_string(),
        })?;

        let deadline = Instant::now() + window;
        let mut found: HashMap<String, DiscoveryResponse> = HashMap::new();
        loop {
            match timeout_at(deadline, receiver.recv_async()).await {
                Ok(Ok(ServiceEvent::ServiceResolved(info))) => {
                    let Some(address) = info
                        .get_addresses()
                        .iter()
                        .find(|a| a.is_ipv4())
                        .or_else(|| info.get_addresses().iter().next())
                        .copied()
                    else {
                        debug!(name=%info.get_fullname(), "resolved service without address");
                        continue;
                    };
                    let attributes = info
                        .get_properties()
                        .iter()
                        .map(|p| format!("{}={}", p.key(), p.val_str()))
                        .collect::<Vec<_>>()
                        .join("|");
                    let name = info.get_fullname().to_string();
                    found.insert(
                        name.clone(),
                        DiscoveryResponse { name, attributes, address, port: info.get_port() },
                    );
                }
                Ok(Ok(_)) => {}
                // Window elapsed or the daemon went away.
                Ok(Err(_)) | Err(_) => break,
            }
        }
        if let Err(e) = self.daemon.stop_browse(service_type) {
            debug!(error=%e, "stop_browse failed");
        }
        Ok(found.into_values().collect())
    }
}

pub struct Scanner {
    browser: Arc<dyn Browser>,
    service_type: String,
    window: Duration,
    node_id: String,
    metrics: Arc<Metrics>,
    logs: SharedLogs,
}

impl Scanner {
    pub fn new(
        browser: Arc<dyn Browser>,
        service_type: String,
        window: Duration,
        node_id: String,
        metrics: Arc<Metrics>,
        logs: SharedLogs,
    ) -> Self {
        Self { browser, service_type, window, node_id, metrics, logs }
    }

    /// Run one cycle: query, parse, drop malformed records and ourselves.
    pub async fn scan(&self) -> Vec<PeerRecord> {
        Metrics::inc(&self.metrics.discovery_cycles_total);
        let responses = match self.browser.query(&self.service_type, self.window).await {
            Ok(r) => r,
            Err(e) => {
                Metrics::inc(&self.metrics.discovery_errors_total);
                warn!(error=%e, "discovery query failed");
                return Vec::new();
            }
        };

        let mut peers = Vec::with_capacity(responses.len());
        for response in responses {
            match PeerRecord::from_attributes(&response.attributes, response.address, response.port) {
                Ok(record) if record.node_id == self.node_id => {}
                Ok(record) => {
                    Metrics::inc(&self.metrics.peers_seen_total);
                    debug!(node=%record.node_id, address=%record.address, "peer answered");
                    peers.push(record);
                }
                Err(e) => {
                    Metrics::inc(&self.metrics.peers_malformed_total);
                    warn!(name=%response.name, address=%response.address, error=%e, "ignoring malformed discovery record");
                    push_log(&self.logs, "discovery", format!("malformed record from {}: {e}", response.address)).await;
                }
            }
        }
        peers
    }

    /// Scan every `interval` forever, handing each cycle's peers to `sink`.
    /// Stops when the receiver is gone.
    pub fn spawn(self, interval: Duration, sink: mpsc::Sender<Vec<PeerRecord>>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(service=%self.service_type, every=?interval, "starting search for peers");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let peers = self.scan().await;
                if sink.send(peers).await.is_err() {
                    debug!("discovery sink closed");
                    return;
                }
            }
        })
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::Mutex;

    /// Answers each query with the next queued batch, then with nothing.
    #[derive(Default)]
    pub struct FakeBrowser {
        batches: Mutex<Vec<Result<Vec<DiscoveryResponse>, DiscoveryError>>>,
    }

    impl FakeBrowser {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn push(&self, batch: Vec<DiscoveryResponse>) {
            self.batches.lock().unwrap().push(Ok(batch));
        }

        pub fn push_error(&self) {
            self.batches.lock().unwrap().push(Err(DiscoveryError::Browse {
                service_type: "test".into(),
                reason: "no interface".into(),
            }));
        }
    }

    #[async_trait]
    impl Browser for FakeBrowser {
        async fn query(&self, _service_type: &str, _window: Duration) -> Result<Vec<DiscoveryResponse>, DiscoveryError> {
            let mut batches = self.batches.lock().unwrap();
            if batches.is_empty() {
                Ok(Vec::new())
            } else {
                batches.remove(0)
            }
        }
    }

    pub fn response(attributes: &str) -> DiscoveryResponse {
        DiscoveryResponse {
            name: "node._ninja-homecloud-mqtt._tcp.local.".into(),
            attributes: attributes.into(),
            address: "192.168.1.20".parse().unwrap(),
            port: 1883,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::{response, FakeBrowser};
    use super::*;
    use crate::metrics::new_logs;
    use std::sync::atomic::Ordering;

    fn scanner(browser: Arc<FakeBrowser>) -> Scanner {
        Scanner::new(
            browser,
            "_ninja-homecloud-mqtt._tcp.local.".into(),
            Duration::from_secs(5),
            "A".into(),
            Arc::new(Metrics::new()),
            new_logs(),
        )
    }

    #[tokio::test]
    async fn malformed_and_self_records_are_skipped() {
        let browser = FakeBrowser::new();
        browser.push(vec![
            response("ninja.sphere.node_id=B|ninja.sphere.user_id=u1|ninja.sphere.site_id=s1"),
            response("ninja.sphere.user_id=u1|ninja.sphere.site_id=s1"),
            response("node_id=A|user_id=u1"),
            response("node_id=C"),
            response("node_id=D|user_id=u2"),
        ]);
        let scanner = scanner(browser);
        let peers = scanner.scan().await;

        let ids: Vec<&str> = peers.iter().map(|p| p.node_id.as_str()).collect();
        assert_eq!(ids, vec!["B", "D"]);
        assert_eq!(peers[0].site_id.as_deref(), Some("s1"));
        assert_eq!(scanner.metrics.peers_malformed_total.load(Ordering::Relaxed), 2);
        assert_eq!(scanner.metrics.peers_seen_total.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn query_failure_yields_empty_cycle() {
        let browser = FakeBrowser::new();
        browser.push_error();
        let scanner = scanner(browser);
        assert!(scanner.scan().await.is_empty());
        assert_eq!(scanner.metrics.discovery_errors_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_loop_reports_every_interval() {
        let browser = FakeBrowser::new();
        browser.push(vec![response("node_id=B|user_id=u1")]);
        let (tx, mut rx) = mpsc::channel(4);
        scanner(browser).spawn(Duration::from_secs(30), tx);

        assert_eq!(rx.recv().await.unwrap().len(), 1);
        let started = Instant::now();
        assert!(rx.recv().await.unwrap().is_empty());
        assert!(started.elapsed() >= Duration::from_secs(30));
    }
}
