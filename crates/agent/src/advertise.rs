//! Local DNS-SD advertisement of this node.

use std::collections::HashMap;
use std::sync::Mutex;

use mdns_sd::{ServiceDaemon, ServiceInfo};
use tracing::{debug, info};

use common::{
    MeshInfo, ATTR_MASTER, ATTR_MASTER_NODE_ID, ATTR_NODE_ID, ATTR_SITE_ID, ATTR_SITE_UPDATED, ATTR_USER_ID,
};

/// Namespace prefixed to every advertised attribute key.
pub const ATTR_NAMESPACE: &str = "ninja.sphere";

#[derive(Debug, thiserror::Error)]
pub enum AdvertiseError {
    #[error("invalid service record: {0}")]
    Record(String),
    #[error("mdns registration failed: {0}")]
    Register(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advertisement {
    /// Not yet paired: only the setup assistant is offered.
    Unpaired { node_id: String },
    Paired { node_id: String, user_id: String, mesh: MeshInfo },
}

impl Advertisement {
    pub fn attributes(&self) -> Vec<(String, String)> {
        let key = |k: &str| format!("{ATTR_NAMESPACE}.{k}");
        match self {
            Advertisement::Unpaired { node_id } => vec![(key(ATTR_NODE_ID), node_id.clone())],
            Advertisement::Paired { node_id, user_id, mesh } => vec![
                (key(ATTR_USER_ID), user_id.clone()),
                (key(ATTR_NODE_ID), node_id.clone()),
                (key(ATTR_MASTER), mesh.is_master(node_id).to_string()),
                (key(ATTR_MASTER_NODE_ID), mesh.master_node_id.clone()),
                (key(ATTR_SITE_ID), mesh.site_id.clone()),
                (key(ATTR_SITE_UPDATED), mesh.site_generation.to_string()),
            ],
        }
    }
}

/// Regenerates what this node announces on the local network.
pub trait Advertiser: Send + Sync {
    fn advertise(&self, ad: &Advertisement) -> Result<(), AdvertiseError>;
}

pub struct MdnsAdvertiser {
    daemon: ServiceDaemon,
    host_name: String,
    mesh_service: (String, u16),
    setup_service: (String, u16),
    registered: Mutex<Option<String>>,
}

impl MdnsAdvertiser {
    pub fn new(
        daemon: ServiceDaemon,
        host_name: &str,
        mesh_service: (String, u16),
        setup_service: (String, u16),
    ) -> Self {
        Self {
            daemon,
            host_name: format!("{}.local.", host_name.trim_end_matches(".local.")),
            mesh_service,
            setup_service,
            registered: Mutex::new(None),
        }
    }
}

impl Advertiser for MdnsAdvertiser {
    fn advertise(&self, ad: &Advertisement) -> Result<(), AdvertiseError> {
        let (node_id, (service_type, port)) = match ad {
            Advertisement::Unpaired { node_id } => (node_id, &self.setup_service),
            Advertisement::Paired { node_id, .. } => (node_id, &self.mesh_service),
        };
        let properties: HashMap<String, String> = ad.attributes().into_iter().collect();

        let info = ServiceInfo::new(service_type, node_id, &self.host_name, "", *port, properties)
            .map_err(|e| AdvertiseError::Record(e.to_string()))?
            .enable_addr_auto();
        let fullname = info.get_fullname().to_string();

        let mut registered = self.registered.lock().map_err(|e| AdvertiseError::Register(e.to_string()))?;
        if let Some(previous) = registered.take() {
            if let Err(e) = self.daemon.unregister(&previous) {
                debug!(service=%previous, error=%e, "unregister failed");
            }
        }
        self.daemon
            .register(info)
            .map_err(|e| AdvertiseError::Register(e.to_string()))?;
        info!(service=%fullname, port=*port, "advertising node");
        *registered = Some(fullname);
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use common::PeerRecord;

    fn mesh() -> MeshInfo {
        MeshInfo { site_id: "s1".into(), master_node_id: "A".into(), site_generation: 100, no_mesh: false }
    }

    #[test]
    fn paired_attributes_are_readable_by_peers() {
        let ad = Advertisement::Paired { node_id: "A".into(), user_id: "u1".into(), mesh: mesh() };
        let blob = ad
            .attributes()
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("|");
        assert!(blob.contains("ninja.sphere.master=true"));

        let rec = PeerRecord::from_attributes(&blob, "10.0.0.2".parse().unwrap(), 1883).unwrap();
        assert_eq!(rec.node_id, "A");
        assert_eq!(rec.user_id, "u1");
        assert_eq!(rec.site_id.as_deref(), Some("s1"));
        assert_eq!(rec.site_generation, Some(100));
        assert_eq!(rec.master_node_id.as_deref(), Some("A"));
    }

    #[test]
    fn unpaired_advertises_node_id_only() {
        let ad = Advertisement::Unpaired { node_id: "B".into() };
        assert_eq!(ad.attributes(), vec![("ninja.sphere.node_id".to_string(), "B".to_string())]);
    }
}
