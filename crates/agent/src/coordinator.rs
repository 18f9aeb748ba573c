//! Single owner of the mutable mesh view.
//!
//! Discovery cycles and bridge outcomes arrive as messages; the recorded
//! master, the bridge phase and the local mesh record are only ever touched
//! from this task.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use common::{Kinship, MeshInfo, PeerRecord};

use crate::advertise::{Advertisement, Advertiser};
use crate::bridge::{BridgeEngine, BridgeError};
use crate::bus::BusEndpoint;
use crate::mesh::MeshStore;
use crate::metrics::{push_log, Metrics, SharedLogs};
use crate::status::StatusPublisher;
use crate::supervisor::RestartReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgePhase {
    Unbridged,
    Bridging,
    Bridged,
}

#[derive(Debug)]
pub enum CoordinatorExit {
    Restart(RestartReason),
    Fatal(anyhow::Error),
    /// The discovery loop went away.
    Stopped,
}

pub struct Coordinator {
    node_id: String,
    user_id: String,
    mesh: MeshInfo,
    store: MeshStore,
    advertiser: Arc<dyn Advertiser>,
    bridge: Option<Arc<BridgeEngine>>,
    status: Option<Arc<StatusPublisher>>,
    export_retry: Duration,
    phase: BridgePhase,
    metrics: Arc<Metrics>,
    logs: SharedLogs,
}

enum Step {
    Continue,
    Exit(CoordinatorExit),
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: String,
        user_id: String,
        mesh: MeshInfo,
        store: MeshStore,
        advertiser: Arc<dyn Advertiser>,
        bridge: Option<Arc<BridgeEngine>>,
        status: Option<Arc<StatusPublisher>>,
        export_retry: Duration,
        metrics: Arc<Metrics>,
        logs: SharedLogs,
    ) -> Self {
        Self {
            node_id,
            user_id,
            mesh,
            store,
            advertiser,
            bridge,
            status,
            export_retry,
            phase: BridgePhase::Unbridged,
            metrics,
            logs,
        }
    }

    pub async fn run(mut self, mut peers: mpsc::Receiver<Vec<PeerRecord>>) -> CoordinatorExit {
        let (outcome_tx, mut outcomes) = mpsc::channel::<Result<bool, BridgeError>>(4);
        loop {
            let step = tokio::select! {
                cycle = peers.recv() => match cycle {
                    Some(records) => self.on_cycle(records, &outcome_tx).await,
                    None => Step::Exit(CoordinatorExit::Stopped),
                },
                Some(outcome) = outcomes.recv() => self.on_bridge_outcome(outcome).await,
            };
            if let Step::Exit(exit) = step {
                return exit;
            }
        }
    }

    async fn on_cycle(&mut self, records: Vec<PeerRecord>, outcome_tx: &mpsc::Sender<Result<bool, BridgeError>>) -> Step {
        for record in records {
            if let Step::Exit(exit) = self.on_peer(&record).await {
                return Step::Exit(exit);
            }
            if record.node_id == self.mesh.master_node_id {
                self.on_master_sighting(&record, outcome_tx);
            }
        }
        Step::Continue
    }

    async fn on_peer(&mut self, record: &PeerRecord) -> Step {
        match record.kinship(&self.user_id, &self.mesh.site_id) {
            Kinship::Sibling => {
                debug!(node=%record.node_id, address=%record.address, "found sibling node");
                if let Some(newer) = record.newer_mesh_info(&self.mesh) {
                    return self.adopt(record, newer).await;
                }
                if record.site_generation.is_some_and(|g| g > self.mesh.site_generation) {
                    warn!(node=%record.node_id, "peer has a newer site generation but no master id, ignoring");
                } else if record.site_generation.is_none() {
                    debug!(node=%record.node_id, "peer did not report a usable site generation");
                }
            }
            Kinship::ForeignSite => {
                warn!(node=%record.node_id, site=?record.site_id, address=%record.address, "found a node owned by the same user in a different site");
            }
            Kinship::Foreign => {
                info!(node=%record.node_id, user=%record.user_id, address=%record.address, "found a node owned by another user");
            }
        }
        Step::Continue
    }

    /// Take a sibling's strictly newer mesh record.
    async fn adopt(&mut self, record: &PeerRecord, newer: MeshInfo) -> Step {
        info!(node=%record.node_id, generation=newer.site_generation, master=%newer.master_node_id, "peer holds a newer site record");
        if let Err(e) = self.store.persist(newer.clone()).await {
            error!(error=%e, "failed to persist mesh info from peer");
            return Step::Exit(CoordinatorExit::Fatal(anyhow::Error::new(e).context("persisting mesh info from peer")));
        }
        Metrics::inc(&self.metrics.mesh_updates_total);
        push_log(&self.logs, "discovery", format!("site generation {} from {}", newer.site_generation, record.node_id)).await;

        if newer.master_node_id != self.mesh.master_node_id {
            let reason = RestartReason::MasterChanged {
                from: self.mesh.master_node_id.clone(),
                to: newer.master_node_id.clone(),
            };
            warn!(%reason, "mesh topology changed, restart required");
            Metrics::inc(&self.metrics.restarts_requested_total);
            push_log(&self.logs, "restart", reason.to_string()).await;
            return Step::Exit(CoordinatorExit::Restart(reason));
        }

        info!(master=%newer.master_node_id, "master unchanged, carrying on");
        self.mesh = newer;
        let ad = Advertisement::Paired {
            node_id: self.node_id.clone(),
            user_id: self.user_id.clone(),
            mesh: self.mesh.clone(),
        };
        if let Err(e) = self.advertiser.advertise(&ad) {
            warn!(error=%e, "failed to refresh advertisement");
        }
        Step::Continue
    }

    fn on_master_sighting(&mut self, record: &PeerRecord, outcome_tx: &mpsc::Sender<Result<bool, BridgeError>>) {
        info!(master=%record.node_id, address=%record.address, "found the master node");
        let Some(engine) = self.bridge.clone() else { return };
        if self.phase != BridgePhase::Unbridged {
            return;
        }
        self.phase = BridgePhase::Bridging;
        let endpoint = BusEndpoint::new(record.address.to_string(), record.port);
        let tx = outcome_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(engine.bridge(&endpoint).await).await;
        });
    }

    async fn on_bridge_outcome(&mut self, outcome: Result<bool, BridgeError>) -> Step {
        match outcome {
            Ok(_) => {
                self.phase = BridgePhase::Bridged;
                if let Some(status) = &self.status {
                    status.spawn_export(self.export_retry);
                }
                Step::Continue
            }
            Err(BridgeError::Connect(e)) => {
                warn!(error=%e, "could not bridge to master, will retry on next sighting");
                push_log(&self.logs, "bridge", format!("connect failed: {e}")).await;
                self.phase = BridgePhase::Unbridged;
                Step::Continue
            }
            Err(e @ BridgeError::Subscribe(_)) => {
                error!(error=%e, "bridge relay could not be installed");
                Step::Exit(CoordinatorExit::Fatal(anyhow::Error::new(e)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advertise::fake::RecordingAdvertiser;
    use crate::bus::memory::{MemoryBus, MemoryConnector};
    use crate::metrics::new_logs;

    const SELF: &str = "node-self";

    fn local_mesh(master: &str) -> MeshInfo {
        MeshInfo { site_id: "s1".into(), master_node_id: master.into(), site_generation: 50, no_mesh: false }
    }

    fn peer(attrs: &str) -> PeerRecord {
        PeerRecord::from_attributes(attrs, "192.168.1.30".parse().unwrap(), 1883).unwrap()
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: MeshStore,
        advertiser: Arc<RecordingAdvertiser>,
    }

    fn fixture(master: &str) -> (Fixture, Coordinator) {
        let dir = tempfile::tempdir().unwrap();
        let store = MeshStore::new(dir.path().join("mesh.json"), false);
        store.save(&local_mesh(master)).unwrap();
        let advertiser = Arc::new(RecordingAdvertiser::default());
        let coordinator = Coordinator::new(
            SELF.into(),
            "u1".into(),
            local_mesh(master),
            store.clone(),
            advertiser.clone(),
            None,
            None,
            Duration::from_secs(5),
            Arc::new(Metrics::new()),
            new_logs(),
        );
        (Fixture { _dir: dir, store, advertiser }, coordinator)
    }

    #[tokio::test]
    async fn newer_generation_with_new_master_requests_restart() {
        let (fx, coordinator) = fixture("A");
        let (tx, rx) = mpsc::channel(4);
        tx.send(vec![peer("node_id=B|user_id=u1|site_id=s1|site_updated=100|master_node_id=B")])
            .await
            .unwrap();

        match coordinator.run(rx).await {
            CoordinatorExit::Restart(RestartReason::MasterChanged { from, to }) => {
                assert_eq!((from.as_str(), to.as_str()), ("A", "B"));
            }
            other => panic!("unexpected exit {other:?}"),
        }
        let saved = fx.store.load().unwrap().unwrap();
        assert_eq!(saved.master_node_id, "B");
        assert_eq!(saved.site_generation, 100);
    }

    #[tokio::test]
    async fn newer_generation_with_same_master_updates_in_place() {
        let (fx, coordinator) = fixture("A");
        let (tx, rx) = mpsc::channel(4);
        tx.send(vec![peer("node_id=B|user_id=u1|site_id=s1|site_updated=100|master_node_id=A")])
            .await
            .unwrap();
        drop(tx);

        assert!(matches!(coordinator.run(rx).await, CoordinatorExit::Stopped));
        assert_eq!(fx.store.load().unwrap().unwrap().site_generation, 100);
        let ads = fx.advertiser.all();
        assert_eq!(ads.len(), 1);
        let Advertisement::Paired { mesh, .. } = &ads[0] else { panic!("expected paired advertisement") };
        assert_eq!(mesh.site_generation, 100);
    }

    #[tokio::test]
    async fn failed_persist_is_fatal() {
        let (fx, coordinator) = fixture("A");
        let coordinator = Coordinator {
            store: MeshStore::new(fx._dir.path().join("mesh.json").join("nested.json"), false),
            ..coordinator
        };
        let (tx, rx) = mpsc::channel(4);
        tx.send(vec![peer("node_id=B|user_id=u1|site_id=s1|site_updated=100|master_node_id=A")])
            .await
            .unwrap();

        assert!(matches!(coordinator.run(rx).await, CoordinatorExit::Fatal(_)));
        assert_eq!(fx.store.load().unwrap().unwrap().site_generation, 50);
    }

    #[tokio::test]
    async fn foreign_and_stale_records_change_nothing() {
        let (fx, coordinator) = fixture("A");
        let (tx, rx) = mpsc::channel(4);
        tx.send(vec![
            peer("node_id=B|user_id=u2|site_id=s1|site_updated=900|master_node_id=B"),
            peer("node_id=C|user_id=u1|site_id=s9|site_updated=900|master_node_id=C"),
            peer("node_id=D|user_id=u1|site_id=s1|site_updated=50|master_node_id=D"),
            peer("node_id=E|user_id=u1|site_id=s1|site_updated=900"),
        ])
        .await
        .unwrap();
        drop(tx);

        assert!(matches!(coordinator.run(rx).await, CoordinatorExit::Stopped));
        assert_eq!(fx.store.load().unwrap(), Some(local_mesh("A")));
        assert!(fx.advertiser.all().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_master_sightings_bridge_once_and_export_device() {
        let (_fx, mut coordinator) = fixture("M");
        let connector = MemoryConnector::new();
        let master_ep = BusEndpoint::new("192.168.1.30", 1883);
        let local_ep = BusEndpoint::new("localhost", 1883);
        connector.add(&master_ep);
        connector.add(&local_ep);
        let metrics = Arc::new(Metrics::new());
        coordinator.bridge = Some(Arc::new(BridgeEngine::new(
            SELF.into(),
            "M".into(),
            vec!["$node/#".into()],
            connector.clone(),
            local_ep,
            None,
            metrics,
            new_logs(),
        )));
        let control = MemoryBus::new();
        coordinator.status = Some(Arc::new(StatusPublisher::new(control.clone(), SELF.into(), false)));

        let master = "node_id=M|user_id=u1|site_id=s1|site_updated=50|master_node_id=M";
        let (tx, rx) = mpsc::channel(4);
        let run = tokio::spawn(coordinator.run(rx));
        tx.send(vec![peer(master), peer(master)]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(vec![peer(master)]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(tx);

        assert!(matches!(run.await.unwrap(), CoordinatorExit::Stopped));
        assert_eq!(connector.connects(), 2);
        assert_eq!(control.published_on("$node/node-self/device").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_bridge_is_retried_on_next_sighting() {
        let (_fx, mut coordinator) = fixture("M");
        let connector = MemoryConnector::new();
        let master_ep = BusEndpoint::new("192.168.1.30", 1883);
        let local_ep = BusEndpoint::new("localhost", 1883);
        coordinator.bridge = Some(Arc::new(BridgeEngine::new(
            SELF.into(),
            "M".into(),
            vec!["$node/#".into()],
            connector.clone(),
            local_ep.clone(),
            None,
            Arc::new(Metrics::new()),
            new_logs(),
        )));

        let master = "node_id=M|user_id=u1|site_id=s1|site_updated=50|master_node_id=M";
        let (tx, rx) = mpsc::channel(4);
        let run = tokio::spawn(coordinator.run(rx));
        tx.send(vec![peer(master)]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(connector.connects(), 1);

        connector.add(&master_ep);
        connector.add(&local_ep);
        tx.send(vec![peer(master)]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(tx);
        assert!(matches!(run.await.unwrap(), CoordinatorExit::Stopped));
        assert_eq!(connector.connects(), 3);
    }
}
