//! Builders for server-to-client packets
//!
//! Each returns an unframed packet; `NetworkHandle` adds the length prefix.

use shared::{Packet, Quaternion, ServerPacket, Vector3};

/// First packet on a new stream connection: a greeting and the slot id
/// the client must echo back in WelcomeReceived. Sent over TCP.
pub fn welcome(message: &str, slot: u32) -> Packet {
    let mut packet = ServerPacket::Welcome.packet();
    packet.write_str(message);
    packet.write_i32(wire_id(slot));
    packet
}

/// Announces a player that has entered the game, with its username and
/// starting transform. Sent over TCP.
pub fn spawn_player(id: u32, username: &str, position: Vector3, rotation: Quaternion) -> Packet {
    let mut packet = ServerPacket::SpawnPlayer.packet();
    packet.write_i32(wire_id(id));
    packet.write_str(username);
    packet.write_vector3(position);
    packet.write_quaternion(rotation);
    packet
}

/// Per-tick position of a player. Sent over UDP to every client.
pub fn player_position(id: u32, position: Vector3) -> Packet {
    let mut packet = ServerPacket::PlayerPosition.packet();
    packet.write_i32(wire_id(id));
    packet.write_vector3(position);
    packet
}

/// Per-tick rotation of a player. Sent over UDP to every client except
/// the player itself, which owns its rotation.
pub fn player_rotation(id: u32, rotation: Quaternion) -> Packet {
    let mut packet = ServerPacket::PlayerRotation.packet();
    packet.write_i32(wire_id(id));
    packet.write_quaternion(rotation);
    packet
}

// Slot ids are bounded by the config check on max_players
fn wire_id(id: u32) -> i32 {
    i32::try_from(id).unwrap_or(i32::MAX)
}
