//! The `{t, d}` wire envelope and message tags.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Handshake, first frame on every socket.
    NodeStatus,
    QueryBlock,
    Block,
    NewBlock,
    BlockConf,
    QueryPeerList,
    PeerList,
    SteemSyncStatus,
    KeepAlive,
}

/// Every frame on the wire is one of these, as a JSON text message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireMessage {
    pub t: MessageType,
    #[serde(default)]
    pub d: Value,
}

impl WireMessage {
    pub fn new(t: MessageType, d: impl Serialize) -> Self {
        Self {
            t,
            d: serde_json::to_value(d).expect("message: serialize payload"),
        }
    }

    /// The dedup digest for `broadcast_not_sent`: the payload signature
    /// when it carries one, the whole serialized message otherwise.
    pub fn digest(&self) -> String {
        match self.d.get("signature").and_then(Value::as_str) {
            Some(sig) => sig.to_owned(),
            None => self.to_string(),
        }
    }
}

impl std::fmt::Display for WireMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let raw = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
        f.write_str(&raw)
    }
}

/// Payload of the `NODE_STATUS` handshake.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Handshake {
    /// Our public key.
    pub node_id: String,

    /// Hash of block 0; peers on a different chain disconnect here.
    pub origin_hash: String,

    pub head_id: u64,

    /// The canonical port peers should dial us back on.
    pub p2p_port: u16,
}
