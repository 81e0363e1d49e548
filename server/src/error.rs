//! Error types for the server core

use shared::{ClientPacket, PacketError};

/// Failures surfaced by the server core.
///
/// Transport faults on a single connection never reach this type; they end
/// that connection and are logged where they happen.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("No handler registered for {0:?}")]
    MissingHandler(ClientPacket),

    #[error("Unknown packet id {0}")]
    UnknownPacketId(i32),

    #[error("Malformed packet: {0}")]
    Packet(PacketError),

    #[error("Shutdown failed: {0}")]
    Shutdown(String),
}

impl From<PacketError> for ServerError {
    fn from(err: PacketError) -> Self {
        match err {
            PacketError::UnknownPacketId(id) => ServerError::UnknownPacketId(id),
            other => ServerError::Packet(other),
        }
    }
}
