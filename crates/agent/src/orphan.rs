//! Liveness of the path to the master.
//!
//! Two independent signals feed the machine: master-direction traffic (the
//! only heartbeat) and raw transport events from the master link. Transport
//! events are debounced so that a brief flap never becomes visible.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use crate::config::OrphanConfig;
use crate::metrics::{push_log, Metrics, SharedLogs};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanState {
    Connected,
    Orphaned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSignal {
    /// A message arrived from the master side.
    MasterTraffic,
    TransportDown,
    TransportUp,
}

#[derive(Debug, Clone, Copy)]
pub struct OrphanTimings {
    pub timeout: Duration,
    pub disconnect_debounce: Duration,
    pub reconnect_debounce: Duration,
}

impl From<&OrphanConfig> for OrphanTimings {
    fn from(cfg: &OrphanConfig) -> Self {
        Self {
            timeout: Duration::from_secs(cfg.timeout_secs),
            disconnect_debounce: Duration::from_secs(cfg.disconnect_debounce_secs),
            reconnect_debounce: Duration::from_secs(cfg.reconnect_debounce_secs),
        }
    }
}

/// Side effects of a state change. Called only when the state actually changes.
#[async_trait]
pub trait OrphanObserver: Send + Sync {
    async fn on_orphaned(&self);
    async fn on_unorphaned(&self);
}

#[derive(Clone)]
pub struct OrphanHandle {
    tx: mpsc::Sender<LinkSignal>,
    state: watch::Receiver<OrphanState>,
}

impl OrphanHandle {
    pub async fn signal(&self, signal: LinkSignal) {
        let _ = self.tx.send(signal).await;
    }

    pub fn state(&self) -> OrphanState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<OrphanState> {
        self.state.clone()
    }
}

/// Start the machine in `Connected` with the liveness window armed.
pub fn spawn(
    timings: OrphanTimings,
    observer: Arc<dyn OrphanObserver>,
    metrics: Arc<Metrics>,
    logs: SharedLogs,
) -> OrphanHandle {
    let (tx, rx) = mpsc::channel(256);
    let (state_tx, state_rx) = watch::channel(OrphanState::Connected);
    let machine = Machine {
        timings,
        observer,
        metrics,
        logs,
        state: OrphanState::Connected,
        state_tx,
    };
    tokio::spawn(machine.run(rx));
    OrphanHandle { tx, state: state_rx }
}

struct Machine {
    timings: OrphanTimings,
    observer: Arc<dyn OrphanObserver>,
    metrics: Arc<Metrics>,
    logs: SharedLogs,
    state: OrphanState,
    state_tx: watch::Sender<OrphanState>,
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl Machine {
    async fn run(mut self, mut rx: mpsc::Receiver<LinkSignal>) {
        let mut liveness = Some(Instant::now() + self.timings.timeout);
        let mut down_check: Option<Instant> = None;
        let mut up_check: Option<Instant> = None;
        let mut link_up = true;

        loop {
            tokio::select! {
                signal = rx.recv() => {
                    let Some(signal) = signal else { return };
                    match signal {
                        LinkSignal::MasterTraffic => {
                            liveness = Some(Instant::now() + self.timings.timeout);
                            self.transition(OrphanState::Connected, "master traffic").await;
                        }
                        LinkSignal::TransportDown => {
                            debug!("master link down, debouncing");
                            link_up = false;
                            up_check = None;
                            down_check = Some(Instant::now() + self.timings.disconnect_debounce);
                        }
                        LinkSignal::TransportUp => {
                            debug!("master link up, debouncing");
                            link_up = true;
                            down_check = None;
                            up_check = Some(Instant::now() + self.timings.reconnect_debounce);
                        }
                    }
                }
                _ = deadline(liveness) => {
                    liveness = None;
                    self.transition(OrphanState::Orphaned, "no master traffic within timeout").await;
                }
                _ = deadline(down_check) => {
                    down_check = None;
                    if !link_up {
                        self.transition(OrphanState::Orphaned, "still disconnected from master").await;
                    }
                }
                _ = deadline(up_check) => {
                    up_check = None;
                    if link_up {
                        liveness = Some(Instant::now() + self.timings.timeout);
                        self.transition(OrphanState::Connected, "still connected to master").await;
                    }
                }
            }
        }
    }

    async fn transition(&mut self, next: OrphanState, cause: &str) {
        if self.state == next {
            return;
        }
        self.state = next;
        self.state_tx.send_replace(next);
        self.metrics.set_orphaned(next == OrphanState::Orphaned);
        match next {
            OrphanState::Orphaned => {
                info!(cause, "node has been orphaned");
                push_log(&self.logs, "orphan", format!("orphaned: {cause}")).await;
                self.observer.on_orphaned().await;
            }
            OrphanState::Connected => {
                info!(cause, "node has been unorphaned");
                push_log(&self.logs, "orphan", format!("unorphaned: {cause}")).await;
                self.observer.on_unorphaned().await;
            }
        }
    }
}
