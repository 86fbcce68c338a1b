//! BlueChat data model: peers, chat messages, connection events, discovery packets.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current protocol version. Carried in the stream hello.
pub const PROTOCOL_VERSION: u8 = 1;

/// Well-known service identifier shared by server and client.
pub const SERVICE_UUID: Uuid = uuid::uuid!("2f441ce1-6ee8-40da-81ef-239985b6f61c");

/// Name the listening endpoint is registered under.
pub const SERVICE_NAME: &str = "service_chat";

/// Sender name used when the local device has no name.
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown device";

/// A remote device. Equality and hashing use the address only.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct PeerDevice {
    pub name: Option<String>,
    /// Transport-layer unique identifier (`host:port` on the LAN transport).
    pub address: String,
}

impl PeerDevice {
    pub fn new(name: Option<String>, address: impl Into<String>) -> Self {
        Self {
            name,
            address: address.into(),
        }
    }

    /// Name for display; falls back to the address.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }
}

impl PartialEq for PeerDevice {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl std::hash::Hash for PeerDevice {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

/// One chat message. `is_local_origin` is never sent on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub sender_name: String,
    pub body: String,
    pub is_local_origin: bool,
}

impl Message {
    /// Message typed by the local user, about to be sent.
    pub fn outgoing(sender_name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            sender_name: sender_name.into(),
            body: body.into(),
            is_local_origin: true,
        }
    }
}

/// Which side opened the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Server,
    Client,
}

/// Outcome stream of one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Established,
    MessageReceived(Message),
    Failed(String),
}

impl ConnectionEvent {
    /// True for events after which the session is gone.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionEvent::Failed(_))
    }
}

/// Discovery datagrams. Encoded with `wire::encode_frame`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryPacket {
    /// Scanner asks who offers `service`.
    Probe {
        service: [u8; 16],
        nonce: [u8; 16],
    },
    /// Discoverable node answers a probe. The address is the sender IP plus `listen_port`.
    Announce {
        service: [u8; 16],
        nonce: [u8; 16],
        name: Option<String>,
        listen_port: u16,
    },
}
