//! Locally persisted view of the mesh, reconciled against the cloud directory.

use std::path::PathBuf;

use tracing::{debug, info};

use common::MeshInfo;

use crate::state::{read_json, write_json_durable};

pub mod directory;

pub use directory::{Directory, HttpDirectory, NodeRecord, SiteRecord};

#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    /// This node or its site is missing from the directory (usually a race while the cloud catches up).
    #[error("node or site not found in directory: {0}")]
    NotFound(String),
    /// The directory rejected our token; the node must be unpaired.
    #[error("directory rejected the credential token")]
    Unauthorized,
    #[error("directory fetch failed: {0}")]
    Fetch(String),
    #[error("directory response could not be decoded: {0}")]
    Decode(String),
    #[error("mesh state i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Owner of `mesh.json`.
#[derive(Debug, Clone)]
pub struct MeshStore {
    path: PathBuf,
    force_master: bool,
}

impl MeshStore {
    pub fn new(path: PathBuf, force_master: bool) -> Self {
        Self { path, force_master }
    }

    /// Last persisted mesh record, if any.
    pub fn load(&self) -> Result<Option<MeshInfo>, MeshError> {
        Ok(read_json(&self.path)?)
    }

    /// Persist with a durability barrier. Failures are surfaced, not retried.
    pub fn save(&self, info: &MeshInfo) -> Result<(), MeshError> {
        info!(path=%self.path.display(), site=%info.site_id, master=%info.master_node_id, generation=info.site_generation, "saving mesh info");
        write_json_durable(&self.path, info)?;
        Ok(())
    }

    /// `save` on the blocking pool, for callers on the async runtime.
    pub async fn persist(&self, info: MeshInfo) -> Result<(), MeshError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.save(&info))
            .await
            .map_err(|e| MeshError::Io(std::io::Error::other(e)))?
    }

    /// Fetch this node's site from the directory, merge it with the local
    /// record and persist the result.
    ///
    /// A remote record whose generation is not newer than the local one never
    /// replaces it, whichever site either names. A local no-cloud record always
    /// yields to the directory. The force-master override is applied last.
    pub async fn reconcile(
        &self,
        directory: &dyn Directory,
        self_node_id: &str,
    ) -> Result<MeshInfo, MeshError> {
        let nodes = directory.nodes().await?;
        let sites = directory.sites().await?;

        let node = nodes
            .iter()
            .find(|n| n.id == self_node_id)
            .ok_or_else(|| MeshError::NotFound(format!("node {self_node_id}")))?;
        let site = sites
            .iter()
            .find(|s| s.id == node.site_id)
            .ok_or_else(|| MeshError::NotFound(format!("site {}", node.site_id)))?;

        let remote = MeshInfo {
            site_id: site.id.clone(),
            master_node_id: site.master_node_id.clone(),
            site_generation: site.updated.timestamp(),
            no_mesh: false,
        };

        let local = self.load()?;
        let mut info = match &local {
            Some(l) if !l.no_mesh && !l.superseded_by(&remote) => {
                debug!(local = l.site_generation, remote = remote.site_generation, "keeping local mesh info");
                l.clone()
            }
            _ => remote,
        };

        if self.force_master {
            info.master_node_id = self_node_id.to_string();
        }

        if local.as_ref() != Some(&info) {
            self.persist(info.clone()).await?;
        }
        Ok(info)
    }
}
