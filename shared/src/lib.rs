//! Wire protocol shared by the server and test clients
//!
//! Every message on either transport is a length-prefixed frame whose
//! payload starts with an i32 packet id. Ids are numbered per direction,
//! starting at 1.

pub mod framing;
pub mod math;
pub mod packet;

pub use framing::{FrameDecoder, FrameError};
pub use math::{Quaternion, Vector3};
pub use packet::{Packet, PacketError, WireValue};

/// Default server port for both TCP and UDP
pub const DEFAULT_PORT: u16 = 26950;

/// Size of the per-connection socket receive buffer
pub const RECEIVE_BUFFER_SIZE: usize = 4096;

/// Packets sent from server to client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ServerPacket {
    Welcome = 1,
    SpawnPlayer = 2,
    PlayerPosition = 3,
    PlayerRotation = 4,
}

/// Packets sent from client to server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ClientPacket {
    WelcomeReceived = 1,
    PlayerMovement = 2,
}

impl ServerPacket {
    /// Every kind, in id order
    pub const ALL: [ServerPacket; 4] = [
        ServerPacket::Welcome,
        ServerPacket::SpawnPlayer,
        ServerPacket::PlayerPosition,
        ServerPacket::PlayerRotation,
    ];

    /// Wire id of this packet kind
    pub fn id(self) -> i32 {
        self as i32
    }

    /// Starts an outbound packet for this kind
    pub fn packet(self) -> Packet {
        Packet::with_id(self.id())
    }
}

impl ClientPacket {
    /// Every kind, in id order. The server refuses to start unless each
    /// one has a handler.
    pub const ALL: [ClientPacket; 2] = [ClientPacket::WelcomeReceived, ClientPacket::PlayerMovement];

    /// Wire id of this packet kind
    pub fn id(self) -> i32 {
        self as i32
    }

    /// Starts a packet of this kind, as a client would send it. Used by
    /// the test client and tests.
    pub fn packet(self) -> Packet {
        Packet::with_id(self.id())
    }
}

impl TryFrom<i32> for ServerPacket {
    type Error = PacketError;

    fn try_from(id: i32) -> Result<Self, Self::Error> {
        ServerPacket::ALL
            .into_iter()
            .find(|p| p.id() == id)
            .ok_or(PacketError::UnknownPacketId(id))
    }
}

impl TryFrom<i32> for ClientPacket {
    type Error = PacketError;

    fn try_from(id: i32) -> Result<Self, Self::Error> {
        ClientPacket::ALL
            .into_iter()
            .find(|p| p.id() == id)
            .ok_or(PacketError::UnknownPacketId(id))
    }
}

/// Movement input flags in wire order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MovementInput {
    pub forward: bool,
    pub back: bool,
    pub right: bool,
    pub left: bool,
}

impl MovementInput {
    pub const COUNT: i32 = 4;

    /// Flags in wire order: forward, back, right, left
    pub fn to_array(self) -> [bool; 4] {
        [self.forward, self.back, self.right, self.left]
    }

    pub fn from_array(inputs: [bool; 4]) -> Self {
        Self {
            forward: inputs[0],
            back: inputs[1],
            right: inputs[2],
            left: inputs[3],
        }
    }
}
