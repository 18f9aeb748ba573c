use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use tracing::{info, warn};

/// Shared per-subsystem event buffer served by the metrics endpoint.
pub type SharedLogs =
    Arc<tokio::sync::Mutex<std::collections::BTreeMap<String, std::collections::VecDeque<String>>>>;

const LOGS_CAP: usize = 1000;

pub fn new_logs() -> SharedLogs {
    Arc::new(tokio::sync::Mutex::new(std::collections::BTreeMap::new()))
}

/// Push a line into the log buffer for a given subsystem, trimming when full.
pub async fn push_log(logs: &SharedLogs, name: &str, line: impl Into<String>) {
    use std::time::{SystemTime, UNIX_EPOCH};
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let mut map = logs.lock().await;
    let buf = map
        .entry(name.to_string())
        .or_insert_with(|| std::collections::VecDeque::with_capacity(LOGS_CAP));
    if buf.len() >= LOGS_CAP {
        buf.pop_front();
    }
    buf.push_back(format!("{} | {}", now, line.into()));
}

/// In-memory counters exposed in Prometheus text format.
#[derive(Default)]
pub struct Metrics {
    pub discovery_cycles_total: AtomicU64,
    pub discovery_errors_total: AtomicU64,
    pub peers_seen_total: AtomicU64,
    pub peers_malformed_total: AtomicU64,
    pub mesh_updates_total: AtomicU64,
    pub relayed_master_to_slave_total: AtomicU64,
    pub relayed_slave_to_master_total: AtomicU64,
    pub relay_dropped_total: AtomicU64,
    pub relay_rejected_total: AtomicU64,
    pub relay_publish_errors_total: AtomicU64,
    pub relay_backpressure_total: AtomicU64,
    pub orphaned_total: AtomicU64,
    pub restarts_requested_total: AtomicU64,
    pub bridged: AtomicU64,
    pub orphaned: AtomicU64,
    pub is_master: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_bridged(&self, v: bool) {
        self.bridged.store(v as u64, Ordering::Relaxed);
    }

    pub fn set_orphaned(&self, v: bool) {
        self.orphaned.store(v as u64, Ordering::Relaxed);
        if v {
            self.orphaned_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn set_master(&self, v: bool) {
        self.is_master.store(v as u64, Ordering::Relaxed);
    }

    pub fn render_prometheus(&self) -> String {
        let rows: [(&str, &str, &AtomicU64); 16] = [
            ("mesh_discovery_cycles_total", "counter", &self.discovery_cycles_total),
            ("mesh_discovery_errors_total", "counter", &self.discovery_errors_total),
            ("mesh_peers_seen_total", "counter", &self.peers_seen_total),
            ("mesh_peers_malformed_total", "counter", &self.peers_malformed_total),
            ("mesh_info_updates_total", "counter", &self.mesh_updates_total),
            ("mesh_relayed_master_to_slave_total", "counter", &self.relayed_master_to_slave_total),
            ("mesh_relayed_slave_to_master_total", "counter", &self.relayed_slave_to_master_total),
            ("mesh_relay_dropped_total", "counter", &self.relay_dropped_total),
            ("mesh_relay_rejected_total", "counter", &self.relay_rejected_total),
            ("mesh_relay_publish_errors_total", "counter", &self.relay_publish_errors_total),
            ("mesh_relay_backpressure_total", "counter", &self.relay_backpressure_total),
            ("mesh_orphaned_total", "counter", &self.orphaned_total),
            ("mesh_restarts_requested_total", "counter", &self.restarts_requested_total),
            ("mesh_bridged", "gauge", &self.bridged),
            ("mesh_orphaned", "gauge", &self.orphaned),
            ("mesh_is_master", "gauge", &self.is_master),
        ];
        let mut out = String::new();
        for (name, kind, value) in rows {
            out.push_str(&format!("# TYPE {name} {kind}\n"));
            out.push_str(&format!("{name} {}\n", value.load(Ordering::Relaxed)));
        }
        out
    }
}

fn render_logs(map: &std::collections::BTreeMap<String, std::collections::VecDeque<String>>, query: Option<&str>) -> String {
    let mut component: Option<String> = None;
    let mut tail: usize = 100;
    if let Some(q) = query {
        for pair in q.split('&') {
            let mut it = pair.split('=');
            if let (Some(k), Some(v)) = (it.next(), it.next()) {
                if k == "component" && !v.is_empty() {
                    component = Some(v.to_string());
                }
                if k == "tail" {
                    if let Ok(n) = v.parse::<usize>() {
                        tail = n.min(LOGS_CAP);
                    }
                }
            }
        }
    }
    let mut out = String::new();
    match component {
        Some(name) => match map.get(&name) {
            Some(buf) => {
                for line in buf.iter().skip(buf.len().saturating_sub(tail)) {
                    out.push_str(line);
                    out.push('\n');
                }
            }
            None => out.push_str("unknown component\n"),
        },
        None => {
            out.push_str("components:\n");
            for k in map.keys() {
                out.push_str(k);
                out.push('\n');
            }
        }
    }
    out
}

/// Minimal HTTP server for `/metrics` and `/logs`.
pub async fn serve_metrics(metrics: Arc<Metrics>, logs: SharedLogs, bind_addr: String) {
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!(address=%bind_addr, error=%e, "metrics server bind failed");
            return;
        }
    };
    info!(address=%bind_addr, "metrics server listening");
    loop {
        match listener.accept().await {
            Ok((mut stream, _)) => {
                let m = metrics.clone();
                let logs = logs.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 2048];
                    let _ = tokio::time::timeout(
                        Duration::from_millis(500),
                        tokio::io::AsyncReadExt::read(&mut stream, &mut buf),
                    )
                    .await;
                    let req = String::from_utf8_lossy(&buf);
                    let path = req
                        .lines()
                        .next()
                        .and_then(|line| line.split_whitespace().nth(1))
                        .unwrap_or("/metrics")
                        .to_string();

                    let (status_line, content_type, body) = if path.starts_with("/metrics") {
                        ("HTTP/1.1 200 OK", "text/plain; version=0.0.4", m.render_prometheus())
                    } else if path.starts_with("/logs") {
                        let map = logs.lock().await;
                        let body = render_logs(&map, path.split('?').nth(1));
                        ("HTTP/1.1 200 OK", "text/plain; charset=utf-8", body)
                    } else {
                        ("HTTP/1.1 404 Not Found", "text/plain; charset=utf-8", "not found".to_string())
                    };

                    let resp = format!(
                        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = tokio::io::AsyncWriteExt::write_all(&mut stream, resp.as_bytes()).await;
                    let _ = tokio::io::AsyncWriteExt::shutdown(&mut stream).await;
                });
            }
            Err(e) => {
                warn!(error=%e, "metrics accept error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_ring_is_capped_and_tailed() {
        let logs = new_logs();
        for i in 0..(LOGS_CAP + 5) {
            push_log(&logs, "bridge", format!("line {i}")).await;
        }
        let map = logs.lock().await;
        assert_eq!(map["bridge"].len(), LOGS_CAP);
        let out = render_logs(&map, Some("component=bridge&tail=2"));
        assert_eq!(out.lines().count(), 2);
        assert!(out.ends_with(&format!("line {}\n", LOGS_CAP + 4)));
        assert_eq!(render_logs(&map, None), "components:\nbridge\n");
    }

    #[test]
    fn prometheus_render_reflects_gauges() {
        let m = Metrics::new();
        m.set_orphaned(true);
        m.set_orphaned(false);
        Metrics::inc(&m.relay_dropped_total);
        let out = m.render_prometheus();
        assert!(out.contains("mesh_orphaned_total 1\n"));
        assert!(out.contains("mesh_orphaned 0\n"));
        assert!(out.contains("mesh_relay_dropped_total 1\n"));
        assert!(out.contains("mesh_relay_backpressure_total 0\n"));
    }
}
