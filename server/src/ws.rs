//! Interface to the WebSocket broadcast hub.
//!
//! The hub transport lives outside this crate; handlers only hand it
//! ready-made messages. Broadcast failures are never fatal.

use serde::Serialize;
use serde_json::Value;

pub const NODE_AUTO_REGISTERED: &str = "node_auto_registered";
pub const NODE_DELETED: &str = "node_deleted";
pub const DISCOVERY_UPDATE: &str = "discovery_update";

/// One message pushed to all connected UI sessions.
#[derive(Clone, Debug, Serialize)]
pub struct WsMessage {
    /// Message type, one of the constants above.
    #[serde(rename = "type")]
    pub ty: String,

    /// Type specific payload.
    pub data: Value,

    /// RFC3339 stamp of when the message was created.
    pub timestamp: String,
}

impl WsMessage {
    pub fn new(ty: &str, data: Value) -> Self {
        let timestamp = proxmox_time::epoch_to_rfc3339(proxmox_time::epoch_i64())
            .unwrap_or_default();
        Self {
            ty: ty.to_string(),
            data,
            timestamp,
        }
    }
}

/// The broadcast half of the WebSocket hub.
pub trait Broadcaster: Send + Sync {
    fn broadcast(&self, message: WsMessage);
}

/// Default implementation used when no hub is attached; just logs.
pub struct LogBroadcaster;

impl Broadcaster for LogBroadcaster {
    fn broadcast(&self, message: WsMessage) {
        log::debug!("broadcast {}: {}", message.ty, message.data);
    }
}
