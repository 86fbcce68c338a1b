//! BlueChat core: peer-to-peer chat over a short-range stream transport.
//! Host-driven: no I/O; the host opens sockets, reports outcomes and reads state back.

pub mod capability;
pub mod directory;
pub mod protocol;
pub mod session;
pub mod wire;

pub use capability::{Capabilities, Capability, PermissionDenied};
pub use directory::PeerDirectory;
pub use protocol::{
    ConnectionEvent, DiscoveryPacket, Message, PeerDevice, Role, PROTOCOL_VERSION, SERVICE_NAME,
    SERVICE_UUID, UNKNOWN_DEVICE_NAME,
};
pub use session::{SessionCore, SessionId, SessionState, SessionStateError};
pub use wire::{
    decode_frame, decode_message, encode_chat, encode_frame, encode_message, FrameBuffer,
    FrameDecodeError, FrameEncodeError, FrameFormat, DEFAULT_READ_BUFFER_SIZE, DELIMITER,
};
