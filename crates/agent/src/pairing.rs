//! Pairing gate: obtain identity credentials from the activation service.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use common::Credentials;

use crate::state::CredentialStore;

#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error("activation request failed: {0}")]
    Request(String),
    #[error("activation failed with status {status}: {body}")]
    Status { status: u16, body: String },
    /// The service answered but the credentials are unusable. Not retried.
    #[error("invalid credentials from activation service: {0}")]
    InvalidCredentials(String),
    #[error("saving credentials: {0}")]
    Persist(#[from] std::io::Error),
}

#[async_trait]
pub trait Activator: Send + Sync {
    /// One activation attempt. `Ok(None)` means the node is not claimed yet.
    async fn activate(&self) -> Result<Option<Credentials>, PairingError>;
}

#[derive(Debug, Deserialize)]
struct ClaimResponse {
    #[serde(default)]
    data: ClaimData,
}

#[derive(Debug, Default, Deserialize)]
struct ClaimData {
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    node_id: String,
    #[serde(default)]
    token: String,
    #[serde(default)]
    sphere_network_key: String,
}

/// Interpret an activation response for `node_id`.
pub fn parse_activation(status: u16, body: &[u8], node_id: &str) -> Result<Option<Credentials>, PairingError> {
    if status == 408 {
        return Ok(None);
    }
    if status != 200 {
        return Err(PairingError::Status { status, body: String::from_utf8_lossy(body).into_owned() });
    }
    let claim: ClaimResponse =
        serde_json::from_slice(body).map_err(|e| PairingError::InvalidCredentials(e.to_string()))?;
    let data = claim.data;
    if data.node_id != node_id {
        return Err(PairingError::InvalidCredentials(format!(
            "expected node id {node_id}, got {}",
            data.node_id
        )));
    }
    if data.user_id.is_empty() || data.token.is_empty() || data.sphere_network_key.is_empty() {
        return Err(PairingError::InvalidCredentials("missing user, token or network key".into()));
    }
    Ok(Some(Credentials {
        user_id: data.user_id,
        token: data.token,
        network_key: data.sphere_network_key,
        node_id: data.node_id,
    }))
}

/// Address of the interface that routes outward.
pub async fn local_ip() -> std::io::Result<IpAddr> {
    let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect("8.8.8.8:80").await?;
    Ok(socket.local_addr()?.ip())
}

pub fn default_board_type() -> String {
    format!("custom-{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}

pub struct HttpActivator {
    client: reqwest::Client,
    url_template: String,
    node_id: String,
    board: String,
}

impl HttpActivator {
    pub fn new(
        url_template: &str,
        node_id: &str,
        board: &str,
        timeout: Duration,
        allow_self_signed: bool,
    ) -> Result<Self, PairingError> {
        if allow_self_signed {
            warn!("allowing self-signed certificates (development cloud only)");
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(allow_self_signed)
            .build()
            .map_err(|e| PairingError::Request(e.to_string()))?;
        Ok(Self {
            client,
            url_template: url_template.to_string(),
            node_id: node_id.to_string(),
            board: board.to_string(),
        })
    }

    async fn resolve_ip() -> IpAddr {
        loop {
            match local_ip().await {
                Ok(ip) => return ip,
                Err(e) => {
                    debug!(error=%e, "no local address yet");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

#[async_trait]
impl Activator for HttpActivator {
    async fn activate(&self) -> Result<Option<Credentials>, PairingError> {
        let ip = Self::resolve_ip().await;
        let url = self
            .url_template
            .replace("{node_id}", &self.node_id)
            .replace("{ip}", &ip.to_string())
            .replace("{board}", &self.board);
        debug!(url=%url, "activating");
        let res = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PairingError::Request(e.to_string()))?;
        let status = res.status().as_u16();
        let body = res.bytes().await.map_err(|e| PairingError::Request(e.to_string()))?;
        parse_activation(status, &body, &self.node_id)
    }
}

/// Poll the activation service until this node is claimed, then persist
/// the credentials. Transient failures retry every `retry` forever.
pub async fn pair(activator: &dyn Activator, store: &CredentialStore, retry: Duration) -> Result<Credentials, PairingError> {
    info!("node is unpaired, attempting to pair");
    loop {
        match activator.activate().await {
            Ok(Some(creds)) => {
                info!(user=%creds.user_id, "pairing succeeded");
                store.save(&creds)?;
                return Ok(creds);
            }
            Ok(None) => debug!("not claimed yet, polling again"),
            Err(e @ PairingError::InvalidCredentials(_)) => return Err(e),
            Err(e) => {
                warn!(error=%e, retry_in=?retry, "activation error");
                tokio::time::sleep(retry).await;
            }
        }
    }
}
