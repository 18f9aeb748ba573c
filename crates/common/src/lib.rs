use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::IpAddr;

/// Reserved envelope field recording the node a bridged message originated from.
pub const MESH_SOURCE_FIELD: &str = "mesh-source";

pub const PAIRING_LIGHT_TOPIC: &str = "$hardware/status/pairing";
pub const BRIDGE_STATUS_TOPIC: &str = "$sphere/bridge/status";
pub const BRIDGE_CONNECT_TOPIC: &str = "$sphere/bridge/connect";
pub const LED_CONTROLLER_TOPIC: &str = "$home/led-controller";

/// Topic trees relayed between the local bus and the master's bus.
pub const DEFAULT_BRIDGE_TOPICS: &[&str] = &[
    "$discover",
    "$site/#",
    "$home/#",
    "$node/#",
    "$thing/#",
    "$device/#",
];

pub fn node_unpair_topic(node_id: &str) -> String {
    format!("$node/{node_id}/unpair")
}

pub fn node_device_topic(node_id: &str) -> String {
    format!("$node/{node_id}/device")
}

/// MQTT topic filter matching with `+` (one level) and `#` (remaining levels).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut f = filter.split('/');
    let mut t = topic.split('/');
    loop {
        match (f.next(), t.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(a), Some(b)) if a == b => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

// ===================== Persisted state =====================

/// Locally held view of the mesh this node belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshInfo {
    #[serde(rename = "siteId")]
    pub site_id: String,
    #[serde(rename = "masterNodeId")]
    pub master_node_id: String,
    /// Seconds since epoch of the last site change. Only ever increases locally.
    #[serde(rename = "siteUpdated")]
    pub site_generation: i64,
    #[serde(rename = "noMesh", default, skip_serializing_if = "std::ops::Not::not")]
    pub no_mesh: bool,
}

impl MeshInfo {
    pub fn is_master(&self, node_id: &str) -> bool {
        self.master_node_id == node_id
    }

    /// True when `candidate` should replace this record.
    pub fn superseded_by(&self, candidate: &MeshInfo) -> bool {
        candidate.site_generation > self.site_generation
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub token: String,
    #[serde(rename = "sphereNetworkKey")]
    pub network_key: String,
    #[serde(rename = "nodeId", default)]
    pub node_id: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user_id", &self.user_id)
            .field("node_id", &self.node_id)
            .field("token", &"<redacted>")
            .field("network_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Master,
    Slave,
}

impl AgentRole {
    pub fn derive(info: &MeshInfo, node_id: &str) -> Self {
        if info.is_master(node_id) {
            AgentRole::Master
        } else {
            AgentRole::Slave
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentRole::Master => f.write_str("master"),
            AgentRole::Slave => f.write_str("slave"),
        }
    }
}

// ===================== Discovery records =====================

pub const ATTR_NODE_ID: &str = "node_id";
pub const ATTR_USER_ID: &str = "user_id";
pub const ATTR_SITE_ID: &str = "site_id";
pub const ATTR_SITE_UPDATED: &str = "site_updated";
pub const ATTR_MASTER_NODE_ID: &str = "master_node_id";
pub const ATTR_MASTER: &str = "master";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerParseError {
    #[error("discovery record has no {0}")]
    MissingField(&'static str),
}

/// Split a `key=value|key=value` attribute blob. Keys may carry a dotted
/// namespace (`ninja.sphere.node_id`); only the last segment is kept.
/// Parts that are not exactly one `key=value` pair are skipped.
pub fn parse_attributes(blob: &str) -> HashMap<String, String> {
    let mut vals = HashMap::new();
    for part in blob.split('|') {
        let chunks: Vec<&str> = part.split('=').collect();
        if chunks.len() != 2 {
            continue;
        }
        let key = chunks[0].trim();
        let key = key.rsplit('.').next().unwrap_or(key);
        if key.is_empty() {
            continue;
        }
        vals.insert(key.to_string(), chunks[1].trim().to_string());
    }
    vals
}

/// One peer's answer to a discovery query. Lives for a single discovery cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub node_id: String,
    pub user_id: String,
    pub site_id: Option<String>,
    /// `None` when absent or not an integer.
    pub site_generation: Option<i64>,
    pub master_node_id: Option<String>,
    pub address: IpAddr,
    pub port: u16,
}

impl PeerRecord {
    pub fn from_attributes(blob: &str, address: IpAddr, port: u16) -> Result<Self, PeerParseError> {
        let mut attrs = parse_attributes(blob);
        let node_id = attrs
            .remove(ATTR_NODE_ID)
            .filter(|v| !v.is_empty())
            .ok_or(PeerParseError::MissingField(ATTR_NODE_ID))?;
        let user_id = attrs
            .remove(ATTR_USER_ID)
            .filter(|v| !v.is_empty())
            .ok_or(PeerParseError::MissingField(ATTR_USER_ID))?;
        let site_generation = attrs
            .get(ATTR_SITE_UPDATED)
            .and_then(|v| v.parse::<i64>().ok());
        Ok(Self {
            node_id,
            user_id,
            site_id: attrs.remove(ATTR_SITE_ID).filter(|v| !v.is_empty()),
            site_generation,
            master_node_id: attrs.remove(ATTR_MASTER_NODE_ID).filter(|v| !v.is_empty()),
            address,
            port,
        })
    }

    pub fn kinship(&self, user_id: &str, site_id: &str) -> Kinship {
        if self.user_id != user_id {
            Kinship::Foreign
        } else if self.site_id.as_deref() == Some(site_id) {
            Kinship::Sibling
        } else {
            Kinship::ForeignSite
        }
    }

    /// The mesh record this peer holds, if it is complete and strictly newer than `local`.
    pub fn newer_mesh_info(&self, local: &MeshInfo) -> Option<MeshInfo> {
        let generation = self.site_generation?;
        if generation <= local.site_generation {
            return None;
        }
        let master = self.master_node_id.clone()?;
        Some(MeshInfo {
            site_id: local.site_id.clone(),
            master_node_id: master,
            site_generation: generation,
            no_mesh: false,
        })
    }
}

/// Relationship of a discovered peer to this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kinship {
    /// Same owner, same site.
    Sibling,
    /// Same owner, another site.
    ForeignSite,
    /// Another owner.
    Foreign,
}

// ===================== Bridged message envelope =====================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("malformed envelope: {0}")]
    Malformed(String),
}

/// A bridged payload: any JSON object, optionally tagged with its origin node.
///
/// Only the tag is decoded. The body stays as the original bytes so relayed
/// messages keep their exact number formatting, escapes and member order.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshEnvelope<'a> {
    pub source: Option<String>,
    raw: &'a [u8],
}

#[derive(Deserialize)]
struct TagField {
    #[serde(rename = "mesh-source", default, deserialize_with = "present")]
    source: Option<serde_json::Value>,
}

fn present<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Option<serde_json::Value>, D::Error> {
    serde_json::Value::deserialize(d).map(Some)
}

impl<'a> MeshEnvelope<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self, EnvelopeError> {
        let first = payload.iter().find(|b| !b.is_ascii_whitespace());
        if first != Some(&b'{') {
            return Err(EnvelopeError::NotAnObject);
        }
        let tag: TagField = serde_json::from_slice(payload).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        let source = match tag.source {
            None => None,
            Some(serde_json::Value::String(s)) => Some(s),
            Some(other) => {
                return Err(EnvelopeError::Malformed(format!("{MESH_SOURCE_FIELD} must be a string, got {other}")))
            }
        };
        Ok(Self { source, raw: payload })
    }

    /// The original payload with `source` spliced in as the first member.
    pub fn tagged(&self, source: &str) -> Vec<u8> {
        let open = self.raw.iter().position(|b| *b == b'{').unwrap_or(0);
        let (head, rest) = self.raw.split_at(open + 1);
        let empty = rest.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b'}');

        let tag = serde_json::Value::String(source.to_string()).to_string();
        let mut out = Vec::with_capacity(self.raw.len() + MESH_SOURCE_FIELD.len() + tag.len() + 4);
        out.extend_from_slice(head);
        out.push(b'"');
        out.extend_from_slice(MESH_SOURCE_FIELD.as_bytes());
        out.extend_from_slice(b"\":");
        out.extend_from_slice(tag.as_bytes());
        if !empty {
            out.push(b',');
        }
        out.extend_from_slice(rest);
        out
    }
}

// ===================== Bus payloads =====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BridgeStatus {
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub configured: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingLight {
    pub color: String,
    pub flash: bool,
}

/// Synthetic device describing a mesh node, exported onto the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDevice {
    #[serde(rename = "naturalId")]
    pub natural_id: String,
    #[serde(rename = "naturalIdType")]
    pub natural_id_type: String,
    pub name: String,
    pub signatures: BTreeMap<String, String>,
}

impl NodeDevice {
    pub fn for_node(node_id: &str, agent_version: &str) -> Self {
        let mut signatures = BTreeMap::new();
        signatures.insert("mesh:thingType".to_string(), "node".to_string());
        signatures.insert("mesh:agentVersion".to_string(), agent_version.to_string());
        Self {
            natural_id: node_id.to_string(),
            natural_id_type: "node".to_string(),
            name: format!("Node {node_id}"),
            signatures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20))
    }

    #[test]
    fn attributes_strip_namespace_and_skip_garbage() {
        let attrs = parse_attributes("ninja.sphere.node_id=B|user_id=u1|junk|a=b=c|site_updated=100");
        assert_eq!(attrs.get("node_id").map(String::as_str), Some("B"));
        assert_eq!(attrs.get("user_id").map(String::as_str), Some("u1"));
        assert_eq!(attrs.get("site_updated").map(String::as_str), Some("100"));
        assert!(!attrs.contains_key("a"));
        assert_eq!(attrs.len(), 3);
    }

    #[test]
    fn record_requires_node_and_user() {
        let err = PeerRecord::from_attributes("user_id=u1", addr(), 1883).unwrap_err();
        assert_eq!(err, PeerParseError::MissingField("node_id"));
        let err = PeerRecord::from_attributes("node_id=B|site_id=s1", addr(), 1883).unwrap_err();
        assert_eq!(err, PeerParseError::MissingField("user_id"));
    }

    #[test]
    fn record_tolerates_partial_attributes() {
        let rec = PeerRecord::from_attributes("node_id=B|user_id=u1|site_updated=soon", addr(), 1883).unwrap();
        assert_eq!(rec.site_generation, None);
        assert_eq!(rec.site_id, None);
        assert_eq!(rec.master_node_id, None);
    }

    #[test]
    fn kinship_by_owner_and_site() {
        let rec = PeerRecord::from_attributes("node_id=B|user_id=u1|site_id=s1", addr(), 1883).unwrap();
        assert_eq!(rec.kinship("u1", "s1"), Kinship::Sibling);
        assert_eq!(rec.kinship("u1", "s2"), Kinship::ForeignSite);
        assert_eq!(rec.kinship("u2", "s1"), Kinship::Foreign);
    }

    #[test]
    fn newer_mesh_info_only_for_strictly_newer_generation() {
        let local = MeshInfo {
            site_id: "s1".into(),
            master_node_id: "A".into(),
            site_generation: 50,
            no_mesh: false,
        };
        let rec = PeerRecord::from_attributes(
            "node_id=B|user_id=u1|site_id=s1|site_updated=100|master_node_id=B",
            addr(),
            1883,
        )
        .unwrap();
        let newer = rec.newer_mesh_info(&local).unwrap();
        assert_eq!(newer.master_node_id, "B");
        assert_eq!(newer.site_generation, 100);

        let same = PeerRecord::from_attributes(
            "node_id=B|user_id=u1|site_id=s1|site_updated=50|master_node_id=B",
            addr(),
            1883,
        )
        .unwrap();
        assert!(same.newer_mesh_info(&local).is_none());

        let no_master = PeerRecord::from_attributes("node_id=B|user_id=u1|site_updated=100", addr(), 1883).unwrap();
        assert!(no_master.newer_mesh_info(&local).is_none());
    }

    #[test]
    fn envelope_tags_and_serializes_source_first() {
        let env = MeshEnvelope::parse(br#"{"temp":21}"#).unwrap();
        assert_eq!(env.source, None);
        let out = env.tagged("node-self");
        assert_eq!(String::from_utf8(out).unwrap(), r#"{"mesh-source":"node-self","temp":21}"#);

        let empty = MeshEnvelope::parse(b" { } ").unwrap().tagged("n");
        assert_eq!(String::from_utf8(empty).unwrap(), r#" {"mesh-source":"n" } "#);
    }

    #[test]
    fn envelope_tagging_keeps_body_bytes() {
        let body = br#"{"id":12345678901234567890123,"v":1e2,"s":"caf\u00e9","z":1}"#;
        let out = MeshEnvelope::parse(body).unwrap().tagged("we\"ird");
        assert_eq!(
            String::from_utf8(out).unwrap(),
            r#"{"mesh-source":"we\"ird","id":12345678901234567890123,"v":1e2,"s":"caf\u00e9","z":1}"#
        );
    }

    #[test]
    fn envelope_reads_existing_tag() {
        let env = MeshEnvelope::parse(br#" {"mesh-source":"B","on":true}"#).unwrap();
        assert_eq!(env.source.as_deref(), Some("B"));
    }

    #[test]
    fn envelope_rejects_non_objects() {
        assert_eq!(MeshEnvelope::parse(b"[1,2]"), Err(EnvelopeError::NotAnObject));
        assert_eq!(MeshEnvelope::parse(b"21"), Err(EnvelopeError::NotAnObject));
        assert!(matches!(MeshEnvelope::parse(b"{nope"), Err(EnvelopeError::Malformed(_))));
        assert!(matches!(MeshEnvelope::parse(br#"{"a":1} x"#), Err(EnvelopeError::Malformed(_))));
        assert!(matches!(
            MeshEnvelope::parse(br#"{"mesh-source":7}"#),
            Err(EnvelopeError::Malformed(_))
        ));
        assert!(matches!(
            MeshEnvelope::parse(br#"{"mesh-source":null}"#),
            Err(EnvelopeError::Malformed(_))
        ));
    }

    #[test]
    fn topic_filters() {
        assert!(topic_matches("$node/#", "$node/abc/device"));
        assert!(topic_matches("$discover", "$discover"));
        assert!(topic_matches("$site/+/state", "$site/s1/state"));
        assert!(!topic_matches("$site/+/state", "$site/s1/other"));
        assert!(!topic_matches("$thing/#", "$device/x"));
        assert!(!topic_matches("$discover", "$discover/extra"));
    }

    #[test]
    fn mesh_info_round_trips_wire_names() {
        let json = r#"{"siteId":"s1","masterNodeId":"A","siteUpdated":50}"#;
        let info: MeshInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.site_generation, 50);
        assert!(!info.no_mesh);
        assert_eq!(serde_json::to_string(&info).unwrap(), json);
        assert_eq!(AgentRole::derive(&info, "A"), AgentRole::Master);
        assert_eq!(AgentRole::derive(&info, "B"), AgentRole::Slave);
    }
}
