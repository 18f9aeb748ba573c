use common::{AgentRole, MeshInfo};

use crate::config::AgentConfig;
use crate::mesh::MeshStore;
use crate::state::CredentialStore;

pub async fn status(config: &AgentConfig) -> anyhow::Result<()> {
    let paired = config.no_cloud || CredentialStore::new(config.credentials_path()).is_paired();
    let mesh = MeshStore::new(config.mesh_path(), config.force_master).load()?;
    print!("{}", render_status(config, paired, mesh.as_ref()));
    Ok(())
}

fn render_status(config: &AgentConfig, paired: bool, mesh: Option<&MeshInfo>) -> String {
    let mut out = String::new();
    out.push_str(&format!("node:      {}\n", config.node_id));
    out.push_str(&format!("data dir:  {}\n", config.data_dir.display()));
    out.push_str(&format!("paired:    {}\n", if paired { "yes" } else { "no" }));
    match mesh {
        Some(info) => {
            let role = if config.force_master {
                AgentRole::Master
            } else {
                AgentRole::derive(info, &config.node_id)
            };
            let updated = chrono::DateTime::from_timestamp(info.site_generation, 0)
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| info.site_generation.to_string());
            out.push_str(&format!("site:      {}\n", info.site_id));
            out.push_str(&format!("master:    {}\n", info.master_node_id));
            out.push_str(&format!("updated:   {updated}\n"));
            out.push_str(&format!("role:      {role}\n"));
        }
        None => out.push_str("mesh:      unknown (not yet reconciled)\n"),
    }
    out
}
