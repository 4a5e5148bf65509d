//! Packet: one immutable entry in a channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::PacketId;

/// A channel entry. The cursor is not stored: it is the packet's 1-based
/// position in its channel at read time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Packet<T> {
    pub id: PacketId,
    pub created_at: DateTime<Utc>,
    pub payload: T,
}

/// A packet as returned by a consume call, with its assigned cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct CursoredPacket<T> {
    pub cursor: u64,
    pub packet: Packet<T>,
}

impl<T> CursoredPacket<T> {
    pub fn payload(&self) -> &T {
        &self.packet.payload
    }
}
