use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize};
use tracing::{debug, warn};

use super::MeshError;

/// A node as recorded by the cloud directory.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NodeRecord {
    #[serde(rename = "node_id")]
    pub id: String,
    pub site_id: String,
}

/// A site as recorded by the cloud directory.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SiteRecord {
    #[serde(rename = "site_id")]
    pub id: String,
    #[serde(default)]
    pub master_node_id: String,
    #[serde(default)]
    pub user_id: String,
    pub updated: DateTime<Utc>,
}

/// Authoritative source for node and site records.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn nodes(&self) -> Result<Vec<NodeRecord>, MeshError>;
    async fn sites(&self) -> Result<Vec<SiteRecord>, MeshError>;
}

#[derive(Debug, Deserialize)]
struct RestResponse {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
struct RestError {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: Option<serde_json::Value>,
}

const INVALID_TOKEN: &str = "authentication_invalid_token";

/// Decode a `{type, data}` response body. An `error` payload naming an invalid
/// token maps to `Unauthorized`; any other failure is a generic fetch error.
pub fn decode_response<T: DeserializeOwned>(status: u16, body: &[u8]) -> Result<T, MeshError> {
    let response: RestResponse = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) if status == 200 => return Err(MeshError::Decode(e.to_string())),
        Err(_) => return Err(MeshError::Fetch(format!("http status {status}"))),
    };

    if status != 200 || response.kind == "error" {
        let err: RestError = serde_json::from_value(response.data).unwrap_or_default();
        if err.kind == INVALID_TOKEN {
            return Err(MeshError::Unauthorized);
        }
        let message = err.message.map(|m| m.to_string()).unwrap_or_default();
        return Err(MeshError::Fetch(format!(
            "cloud error (status {status}, type {}): {message}",
            err.kind
        )));
    }

    serde_json::from_value(response.data).map_err(|e| MeshError::Decode(e.to_string()))
}

/// Cloud directory reached over HTTPS.
pub struct HttpDirectory {
    client: reqwest::Client,
    nodes_url: String,
    sites_url: String,
}

impl HttpDirectory {
    pub fn new(
        nodes_url_template: &str,
        sites_url_template: &str,
        token: &str,
        timeout: Duration,
        allow_self_signed: bool,
    ) -> Result<Self, MeshError> {
        if allow_self_signed {
            warn!("allowing self-signed certificates (development cloud only)");
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(allow_self_signed)
            .build()
            .map_err(|e| MeshError::Fetch(e.to_string()))?;
        Ok(Self {
            client,
            nodes_url: nodes_url_template.replace("{token}", token),
            sites_url: sites_url_template.replace("{token}", token),
        })
    }

    async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T, MeshError> {
        let res = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| MeshError::Fetch(e.to_string()))?;
        let status = res.status().as_u16();
        let body = res.bytes().await.map_err(|e| MeshError::Fetch(e.to_string()))?;
        decode_response(status, &body)
    }
}

#[async_trait]
impl Directory for HttpDirectory {
    async fn nodes(&self) -> Result<Vec<NodeRecord>, MeshError> {
        let nodes: Vec<NodeRecord> = self.get(&self.nodes_url).await?;
        debug!(count = nodes.len(), "fetched nodes");
        Ok(nodes)
    }

    async fn sites(&self) -> Result<Vec<SiteRecord>, MeshError> {
        let sites: Vec<SiteRecord> = self.get(&self.sites_url).await?;
        debug!(count = sites.len(), "fetched sites");
        Ok(sites)
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use chrono::TimeZone;

    pub struct FixedDirectory {
        pub nodes: Vec<NodeRecord>,
        pub sites: Vec<SiteRecord>,
        pub failure: Option<fn() -> MeshError>,
    }

    impl FixedDirectory {
        /// Node `node` in site `s1`, owned by `u1`, mastered by `master`.
        pub fn single_site(node: &str, master: &str, updated: i64) -> Self {
            Self {
                nodes: vec![NodeRecord { id: node.into(), site_id: "s1".into() }],
                sites: vec![SiteRecord {
                    id: "s1".into(),
                    master_node_id: master.into(),
                    user_id: "u1".into(),
                    updated: Utc.timestamp_opt(updated, 0).unwrap(),
                }],
                failure: None,
            }
        }

        pub fn failing(failure: fn() -> MeshError) -> Self {
            Self { nodes: Vec::new(), sites: Vec::new(), failure: Some(failure) }
        }
    }

    #[async_trait]
    impl Directory for FixedDirectory {
        async fn nodes(&self) -> Result<Vec<NodeRecord>, MeshError> {
            if let Some(failure) = self.failure {
                return Err(failure());
            }
            Ok(self.nodes.clone())
        }

        async fn sites(&self) -> Result<Vec<SiteRecord>, MeshError> {
            Ok(self.sites.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_token_maps_to_unauthorized() {
        let body = br#"{"type":"error","data":{"type":"authentication_invalid_token","code":401}}"#;
        let res: Result<Vec<NodeRecord>, _> = decode_response(401, body);
        assert!(matches!(res, Err(MeshError::Unauthorized)));

        let res: Result<Vec<NodeRecord>, _> = decode_response(200, body);
        assert!(matches!(res, Err(MeshError::Unauthorized)));
    }

    #[test]
    fn other_errors_are_fetch_failures() {
        let body = br#"{"type":"error","data":{"type":"internal","message":"boom"}}"#;
        let res: Result<Vec<NodeRecord>, _> = decode_response(500, body);
        assert!(matches!(res, Err(MeshError::Fetch(_))));

        let res: Result<Vec<NodeRecord>, _> = decode_response(502, b"<html>bad gateway</html>");
        assert!(matches!(res, Err(MeshError::Fetch(_))));
    }

    #[test]
    fn decodes_sites_with_rfc3339_updated() {
        let body = br#"{"type":"object","data":[{"site_id":"s1","master_node_id":"A","user_id":"u1","updated":"2015-03-01T10:00:00Z"}]}"#;
        let sites: Vec<SiteRecord> = decode_response(200, body).unwrap();
        assert_eq!(sites[0].master_node_id, "A");
        assert_eq!(sites[0].updated.timestamp(), 1425204000);
    }
}
