//! Startup sequence and long-running wiring of the agent.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use common::{topic_matches, AgentRole, BridgeStatus, Credentials, MeshInfo, BRIDGE_STATUS_TOPIC};

use crate::advertise::{Advertisement, Advertiser};
use crate::bridge::BridgeEngine;
use crate::bus::{BusEndpoint, BusEvent, Connector};
use crate::config::AgentConfig;
use crate::coordinator::{Coordinator, CoordinatorExit};
use crate::discovery::{Browser, Scanner};
use crate::mesh::{Directory, MeshError, MeshStore};
use crate::metrics::{push_log, Metrics, SharedLogs};
use crate::orphan::{self, OrphanTimings};
use crate::pairing::{self, Activator};
use crate::services::{self, ServiceControl};
use crate::state::CredentialStore;
use crate::status::{StatusPublisher, UpstreamBridge};
use crate::supervisor::RestartReason;

pub type DirectoryFactory = Box<dyn Fn(&Credentials) -> Result<Arc<dyn Directory>, MeshError> + Send + Sync>;

/// External collaborators of the agent.
pub struct AgentDeps {
    pub connector: Arc<dyn Connector>,
    pub browser: Arc<dyn Browser>,
    pub advertiser: Arc<dyn Advertiser>,
    pub services: Arc<dyn ServiceControl>,
    pub activator: Arc<dyn Activator>,
    pub directory: DirectoryFactory,
}

/// Run the agent until it needs a restart. Errors are fatal.
pub async fn run(
    config: &AgentConfig,
    deps: AgentDeps,
    metrics: Arc<Metrics>,
    logs: SharedLogs,
) -> anyhow::Result<RestartReason> {
    let node_id = config.node_id.clone();
    info!(node=%node_id, "starting mesh agent");

    let local = BusEndpoint::new(config.mqtt.host.clone(), config.mqtt.port);
    let control = deps
        .connector
        .connect(&local, &format!("mesh-agent-{node_id}"))
        .await
        .context("connecting to local bus")?;
    let status = Arc::new(StatusPublisher::new(control.bus.clone(), node_id.clone(), config.no_cloud));

    let creds_store = CredentialStore::new(config.credentials_path());
    let mesh_store = MeshStore::new(config.mesh_path(), config.force_master);

    let creds = if config.no_cloud {
        write_no_cloud_state(config, &mesh_store, &creds_store)?
    } else {
        match creds_store.load() {
            Some(creds) => creds,
            None => {
                if let Err(e) = deps.advertiser.advertise(&Advertisement::Unpaired { node_id: node_id.clone() }) {
                    warn!(error=%e, "failed to advertise setup service");
                }
                let retry = Duration::from_secs(config.retry.pairing_secs);
                pairing::pair(deps.activator.as_ref(), &creds_store, retry)
                    .await
                    .context("pairing failed")?
            }
        }
    };
    info!(user=%creds.user_id, "node is paired");
    status.set_upstream(UpstreamBridge { url: config.cloud.bridge_url.clone(), token: creds.token.clone() });

    status.pairing_light("black", false).await;

    control
        .bus
        .subscribe(BRIDGE_STATUS_TOPIC)
        .await
        .context("subscribing to bridge status")?;
    spawn_bridge_status_listener(control.events, status.clone());

    let mesh = if config.no_cloud {
        mesh_store
            .load()?
            .context("no-cloud mesh info missing after write")?
    } else {
        let directory = (deps.directory)(&creds)?;
        match refresh_mesh(config, &mesh_store, directory.as_ref()).await? {
            Some(mesh) => mesh,
            None => {
                unpair(&status, &creds_store).await?;
                Metrics::inc(&metrics.restarts_requested_total);
                push_log(&logs, "restart", RestartReason::Unpaired.to_string()).await;
                return Ok(RestartReason::Unpaired);
            }
        }
    };
    info!(site=%mesh.site_id, master=%mesh.master_node_id, generation=mesh.site_generation, "mesh info ready");

    let role = AgentRole::derive(&mesh, &node_id);
    status.set_role(role);
    metrics.set_master(role == AgentRole::Master);
    push_log(&logs, "role", format!("{role} (master {})", mesh.master_node_id)).await;

    let ad = Advertisement::Paired { node_id: node_id.clone(), user_id: creds.user_id.clone(), mesh: mesh.clone() };
    if let Err(e) = deps.advertiser.advertise(&ad) {
        warn!(error=%e, "failed to advertise mesh service");
    }

    let export_retry = Duration::from_secs(config.retry.export_secs);
    let bridge = match role {
        AgentRole::Master => {
            info!("this node is the master, starting orchestration");
            let orchestrator = deps.services.clone();
            let retry = Duration::from_secs(config.retry.orchestrator_secs);
            tokio::spawn(async move { services::start_until_acknowledged(orchestrator.as_ref(), retry).await });
            status.spawn_export(export_retry);
            None
        }
        AgentRole::Slave => {
            info!(master=%mesh.master_node_id, "this node is a slave");
            services::stop_once(deps.services.as_ref()).await;
            let orphan = orphan::spawn(
                OrphanTimings::from(&config.orphan),
                status.clone(),
                metrics.clone(),
                logs.clone(),
            );
            Some(Arc::new(BridgeEngine::new(
                node_id.clone(),
                mesh.master_node_id.clone(),
                config.bridge.topics.clone(),
                deps.connector.clone(),
                local,
                Some(orphan),
                metrics.clone(),
                logs.clone(),
            )))
        }
    };

    let scanner = Scanner::new(
        deps.browser.clone(),
        config.discovery.service_type.clone(),
        config.discovery.window(),
        node_id.clone(),
        metrics.clone(),
        logs.clone(),
    );
    let coordinator = Coordinator::new(
        node_id,
        creds.user_id.clone(),
        mesh,
        mesh_store,
        deps.advertiser.clone(),
        bridge,
        Some(status),
        export_retry,
        metrics,
        logs,
    );

    let (peer_tx, peer_rx) = mpsc::channel(4);
    let discovery = scanner.spawn(config.discovery.interval(), peer_tx);
    let exit = coordinator.run(peer_rx).await;
    discovery.abort();
    match exit {
        CoordinatorExit::Restart(reason) => Ok(reason),
        CoordinatorExit::Fatal(e) => Err(e),
        CoordinatorExit::Stopped => anyhow::bail!("discovery loop stopped"),
    }
}

/// Single-node mesh without a cloud: this node is its own master.
fn write_no_cloud_state(
    config: &AgentConfig,
    mesh_store: &MeshStore,
    creds_store: &CredentialStore,
) -> anyhow::Result<Credentials> {
    let mesh = MeshInfo {
        site_id: format!("nomesh-{}", config.node_id),
        master_node_id: config.node_id.clone(),
        site_generation: chrono::Utc::now().timestamp(),
        no_mesh: true,
    };
    mesh_store.save(&mesh).context("saving no-cloud mesh info")?;
    let creds = Credentials {
        user_id: "nouser".into(),
        token: "notoken".into(),
        network_key: "nonetworkkey".into(),
        node_id: config.node_id.clone(),
    };
    creds_store.save(&creds).context("saving no-cloud credentials")?;
    info!("generated no-cloud mesh and credentials");
    Ok(creds)
}

/// Reconcile against the directory. `Ok(None)` means the token was rejected.
async fn refresh_mesh(
    config: &AgentConfig,
    store: &MeshStore,
    directory: &dyn Directory,
) -> anyhow::Result<Option<MeshInfo>> {
    let retry = Duration::from_secs(config.retry.reconcile_secs);
    loop {
        match store.reconcile(directory, &config.node_id).await {
            Ok(mesh) => return Ok(Some(mesh)),
            Err(MeshError::Unauthorized) => {
                warn!("directory rejected our token, unpairing");
                return Ok(None);
            }
            Err(e) => {
                warn!(error=%e, "failed to refresh mesh info");
                match store.load() {
                    Ok(Some(mut local)) => {
                        if config.force_master {
                            local.master_node_id = config.node_id.clone();
                        }
                        info!("using last known mesh info");
                        return Ok(Some(local));
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error=%e, "local mesh info unreadable"),
                }
                info!(retry_in=?retry, "no mesh info yet, retrying");
                tokio::time::sleep(retry).await;
            }
        }
    }
}

async fn unpair(status: &StatusPublisher, creds_store: &CredentialStore) -> anyhow::Result<()> {
    info!("unpairing");
    if let Err(e) = status.announce_unpair().await {
        warn!(error=%e, "could not announce unpair");
    }
    creds_store.clear().context("removing credentials")?;
    Ok(())
}

fn spawn_bridge_status_listener(mut events: mpsc::Receiver<BusEvent>, status: Arc<StatusPublisher>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let BusEvent::Message { topic, payload } = event else { continue };
            if !topic_matches(BRIDGE_STATUS_TOPIC, &topic) {
                continue;
            }
            match serde_json::from_slice::<BridgeStatus>(&payload) {
                Ok(bridge) => status.on_bridge_status(bridge).await,
                Err(e) => debug!(error=%e, "ignoring malformed bridge status"),
            }
        }
    });
}
