//! What the node shows about itself on the local bus: the pairing light,
//! the LED controller while orphaned, bridge configuration requests and the
//! exported node device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};

use common::{
    node_device_topic, node_unpair_topic, AgentRole, BridgeStatus, NodeDevice, PairingLight, BRIDGE_CONNECT_TOPIC,
    LED_CONTROLLER_TOPIC, PAIRING_LIGHT_TOPIC,
};

use crate::bus::{publish_json, Bus, BusError};
use crate::orphan::OrphanObserver;

/// Upstream link parameters handed to the local bridge when this node is master.
#[derive(Clone)]
pub struct UpstreamBridge {
    pub url: String,
    pub token: String,
}

pub struct StatusPublisher {
    bus: Arc<dyn Bus>,
    node_id: String,
    role: OnceLock<AgentRole>,
    upstream: OnceLock<UpstreamBridge>,
    no_cloud: bool,
    exported: AtomicBool,
}

impl StatusPublisher {
    pub fn new(bus: Arc<dyn Bus>, node_id: String, no_cloud: bool) -> Self {
        Self {
            bus,
            node_id,
            role: OnceLock::new(),
            upstream: OnceLock::new(),
            no_cloud,
            exported: AtomicBool::new(false),
        }
    }

    /// Fixed once per process.
    pub fn set_role(&self, role: AgentRole) {
        let _ = self.role.set(role);
    }

    pub fn set_upstream(&self, upstream: UpstreamBridge) {
        let _ = self.upstream.set(upstream);
    }

    fn is_master(&self) -> bool {
        self.role.get() == Some(&AgentRole::Master)
    }

    pub async fn pairing_light(&self, color: &str, flash: bool) {
        let light = PairingLight { color: color.to_string(), flash };
        if let Err(e) = publish_json(self.bus.as_ref(), PAIRING_LIGHT_TOPIC, &light).await {
            warn!(error=%e, "could not update pairing light");
        }
    }

    pub async fn on_bridge_status(&self, status: BridgeStatus) {
        debug!(connected = status.connected, configured = status.configured, "bridge status");
        if status.connected {
            self.pairing_light("green", false).await;
        } else if self.is_master() {
            self.pairing_light("red", true).await;
        } else {
            self.pairing_light("blue", false).await;
        }

        if !status.configured && self.is_master() && !self.no_cloud {
            let Some(upstream) = self.upstream.get() else {
                warn!("bridge unconfigured but no upstream credentials known yet");
                return;
            };
            info!(url=%upstream.url, "configuring bridge");
            let request = json!({ "url": upstream.url, "token": upstream.token });
            if let Err(e) = publish_json(self.bus.as_ref(), BRIDGE_CONNECT_TOPIC, &request).await {
                warn!(error=%e, "could not request bridge configuration");
            }
        }
    }

    async fn led_call(&self, method: &str, params: serde_json::Value) -> Result<(), BusError> {
        let call = json!({ "jsonrpc": "2.0", "method": method, "params": [params] });
        publish_json(self.bus.as_ref(), LED_CONTROLLER_TOPIC, &call).await
    }

    pub async fn announce_unpair(&self) -> Result<(), BusError> {
        let notice = json!({ "jsonrpc": "2.0", "method": "unpair", "params": [] });
        publish_json(self.bus.as_ref(), &node_unpair_topic(&self.node_id), &notice).await
    }

    /// Export the node device once per process, retrying every `retry`.
    pub fn spawn_export(self: &Arc<Self>, retry: Duration) {
        if self.exported.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            let device = NodeDevice::for_node(&this.node_id, env!("CARGO_PKG_VERSION"));
            let topic = node_device_topic(&this.node_id);
            loop {
                match publish_json(this.bus.as_ref(), &topic, &device).await {
                    Ok(()) => {
                        info!(topic=%topic, "exported node device");
                        return;
                    }
                    Err(e) => {
                        warn!(error=%e, retry_in=?retry, "failed to export node device");
                        tokio::time::sleep(retry).await;
                    }
                }
            }
        });
    }
}

#[async_trait]
impl OrphanObserver for StatusPublisher {
    async fn on_orphaned(&self) {
        if let Err(e) = self.led_call("disableControl", serde_json::Value::Null).await {
            warn!(error=%e, "failed to disable control on LED controller");
        }
        if let Err(e) = self.led_call("displayIcon", json!({ "icon": "orphaned.gif" })).await {
            warn!(error=%e, "failed to display orphaned icon");
        }
    }

    async fn on_unorphaned(&self) {
        if let Err(e) = self.led_call("enableControl", serde_json::Value::Null).await {
            warn!(error=%e, "failed to enable control on LED controller");
        }
    }
}
