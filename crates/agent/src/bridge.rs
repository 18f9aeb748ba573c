//! Relay between the local bus and the master's bus.

use std::sync::Arc;

use futures::future::try_join_all;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use common::{EnvelopeError, MeshEnvelope};

use crate::bus::{Bus, BusEndpoint, BusError, BusEvent, Connector};
use crate::metrics::{push_log, Metrics, SharedLogs};
use crate::orphan::{LinkSignal, OrphanHandle};

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Either endpoint could not be reached; a later sighting may retry.
    #[error("bridge connection failed: {0}")]
    Connect(BusError),
    /// A relay could not be installed. The node cannot run half-bridged.
    #[error("relay subscription failed: {0}")]
    Subscribe(BusError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    MasterToSlave,
    SlaveToMaster,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Direction::MasterToSlave => "master->slave",
            Direction::SlaveToMaster => "slave->master",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Relay {
    Forward(Vec<u8>),
    /// Already crossed the bridge in this direction.
    Drop,
    Reject(EnvelopeError),
}

/// Decide what happens to one payload crossing the bridge.
///
/// Master to slave: anything not originated by this node is relayed, and
/// untagged messages are stamped with the master's id. Slave to master: only
/// untagged (locally originated) messages are relayed, stamped with our id.
pub fn relay_decision(direction: Direction, payload: &[u8], node_id: &str, master_id: &str) -> Relay {
    let envelope = match MeshEnvelope::parse(payload) {
        Ok(e) => e,
        Err(e) => return Relay::Reject(e),
    };
    match (direction, envelope.source.as_deref()) {
        (Direction::MasterToSlave, Some(source)) if source == node_id => Relay::Drop,
        (Direction::MasterToSlave, Some(_)) => Relay::Forward(payload.to_vec()),
        (Direction::MasterToSlave, None) => Relay::Forward(envelope.tagged(master_id)),
        (Direction::SlaveToMaster, Some(_)) => Relay::Drop,
        (Direction::SlaveToMaster, None) => Relay::Forward(envelope.tagged(node_id)),
    }
}

struct BridgeSession {
    master: BusEndpoint,
    _buses: [Arc<dyn Bus>; 2],
    _relays: [JoinHandle<()>; 2],
}

/// Owns both bus connections once a master is found. At most one session
/// exists per process; it is never torn down, only its liveness changes.
pub struct BridgeEngine {
    node_id: String,
    master_id: String,
    topics: Vec<String>,
    connector: Arc<dyn Connector>,
    local: BusEndpoint,
    orphan: Option<OrphanHandle>,
    metrics: Arc<Metrics>,
    logs: SharedLogs,
    session: Mutex<Option<BridgeSession>>,
}

impl BridgeEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: String,
        master_id: String,
        topics: Vec<String>,
        connector: Arc<dyn Connector>,
        local: BusEndpoint,
        orphan: Option<OrphanHandle>,
        metrics: Arc<Metrics>,
        logs: SharedLogs,
    ) -> Self {
        Self {
            node_id,
            master_id,
            topics,
            connector,
            local,
            orphan,
            metrics,
            logs,
            session: Mutex::new(None),
        }
    }

    pub async fn is_bridged(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Connect to the master and the local bus and install both relays.
    /// Returns `Ok(false)` when a session already exists.
    pub async fn bridge(&self, master: &BusEndpoint) -> Result<bool, BridgeError> {
        let mut session = self.session.lock().await;
        if let Some(existing) = session.as_ref() {
            debug!(master=%existing.master, "already bridged");
            return Ok(false);
        }

        info!(master=%master, master_id=%self.master_id, "bridging to master");
        let master_link = self
            .connector
            .connect(master, &format!("slave-{}", self.node_id))
            .await
            .map_err(BridgeError::Connect)?;
        let local_link = self
            .connector
            .connect(&self.local, &format!("meshing-{}", self.node_id))
            .await
            .map_err(BridgeError::Connect)?;

        try_join_all(self.topics.iter().map(|t| master_link.bus.subscribe(t)))
            .await
            .map_err(BridgeError::Subscribe)?;
        try_join_all(self.topics.iter().map(|t| local_link.bus.subscribe(t)))
            .await
            .map_err(BridgeError::Subscribe)?;

        if let Some(orphan) = &self.orphan {
            orphan.signal(LinkSignal::TransportUp).await;
        }

        let down = self.spawn_relay(Direction::MasterToSlave, master_link.events, local_link.bus.clone());
        let up = self.spawn_relay(Direction::SlaveToMaster, local_link.events, master_link.bus.clone());

        *session = Some(BridgeSession {
            master: master.clone(),
            _buses: [master_link.bus, local_link.bus],
            _relays: [down, up],
        });
        self.metrics.set_bridged(true);
        push_log(&self.logs, "bridge", format!("bridged to {} at {master}", self.master_id)).await;
        info!(master=%master, topics=self.topics.len(), "bridge established");
        Ok(true)
    }

    fn spawn_relay(
        &self,
        direction: Direction,
        mut events: mpsc::Receiver<BusEvent>,
        to: Arc<dyn Bus>,
    ) -> JoinHandle<()> {
        let node_id = self.node_id.clone();
        let master_id = self.master_id.clone();
        let orphan = match direction {
            Direction::MasterToSlave => self.orphan.clone(),
            Direction::SlaveToMaster => None,
        };
        let metrics = self.metrics.clone();
        let logs = self.logs.clone();

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let (topic, payload) = match event {
                    BusEvent::Message { topic, payload } => (topic, payload),
                    BusEvent::Connected => {
                        info!(direction = direction.label(), "source bus reconnected");
                        if let Some(o) = &orphan {
                            o.signal(LinkSignal::TransportUp).await;
                        }
                        continue;
                    }
                    BusEvent::Disconnected => {
                        warn!(direction = direction.label(), "source bus disconnected");
                        if let Some(o) = &orphan {
                            o.signal(LinkSignal::TransportDown).await;
                        }
                        continue;
                    }
                };

                if let Some(o) = &orphan {
                    o.signal(LinkSignal::MasterTraffic).await;
                }

                match relay_decision(direction, &payload, &node_id, &master_id) {
                    Relay::Forward(out) => {
                        debug!(direction = direction.label(), topic=%topic, "relaying");
                        let counter = match direction {
                            Direction::MasterToSlave => &metrics.relayed_master_to_slave_total,
                            Direction::SlaveToMaster => &metrics.relayed_slave_to_master_total,
                        };
                        // Never wait on the other link. Its event loop may be
                        // waiting for us to drain this one.
                        match to.try_publish(&topic, out) {
                            Ok(()) => Metrics::inc(counter),
                            Err(BusError::Backpressure { .. }) => {
                                Metrics::inc(&metrics.relay_backpressure_total);
                                debug!(direction = direction.label(), topic=%topic, "outgoing queue full, dropped");
                            }
                            Err(e) => {
                                Metrics::inc(&metrics.relay_publish_errors_total);
                                warn!(direction = direction.label(), topic=%topic, error=%e, "relay publish failed");
                            }
                        }
                    }
                    Relay::Drop => {
                        Metrics::inc(&metrics.relay_dropped_total);
                        debug!(direction = direction.label(), topic=%topic, "not interesting, dropped");
                    }
                    Relay::Reject(e) => {
                        Metrics::inc(&metrics.relay_rejected_total);
                        warn!(direction = direction.label(), topic=%topic, error=%e, "invalid payload, dropped");
                        push_log(&logs, "bridge", format!("rejected payload on {topic}: {e}")).await;
                    }
                }
            }
            debug!(direction = direction.label(), "relay stopped");
        })
    }
}
