use anyhow::Context;

use crate::config::AgentConfig;
use crate::state::CredentialStore;

/// Forget the pairing; the running agent picks this up on its next start.
pub async fn unpair(config: &AgentConfig) -> anyhow::Result<()> {
    let store = CredentialStore::new(config.credentials_path());
    if !store.is_paired() {
        println!("node {} is not paired", config.node_id);
        return Ok(());
    }
    store.clear().context("removing credentials")?;
    println!("credentials removed; restart the agent to pair node {} again", config.node_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Credentials;

    #[tokio::test]
    async fn removes_stored_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig { data_dir: dir.path().to_path_buf(), ..AgentConfig::default() };
        let store = CredentialStore::new(config.credentials_path());
        store
            .save(&Credentials {
                user_id: "u1".into(),
                token: "t".into(),
                network_key: "k".into(),
                node_id: config.node_id.clone(),
            })
            .unwrap();

        unpair(&config).await.unwrap();
        assert!(!store.is_paired());
        unpair(&config).await.unwrap();
    }
}
