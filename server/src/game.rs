//! Gameplay simulation driven by the tick loop
//!
//! Owns one player per connected slot once that client has answered the
//! Welcome. All state here lives on the simulation thread; the network is
//! only reached through `NetworkHandle`.

use crate::handlers::HandlerTable;
use crate::network::{NetworkHandle, Transport};
use crate::send;
use crate::tick::Simulation;
use log::{info, warn};
use shared::{ClientPacket, MovementInput, Packet, PacketError, Quaternion, Vector3};
use std::collections::BTreeMap;

pub const WELCOME_MESSAGE: &str = "Welcome to the server!";

/// Player movement speed in units per second
pub const MOVE_SPEED: f32 = 5.0;

#[derive(Debug, Clone, PartialEq)]
pub struct Player {
    pub id: u32,
    pub username: String,
    pub position: Vector3,
    pub rotation: Quaternion,
    pub input: MovementInput,
}

impl Player {
    pub fn new(id: u32, username: String) -> Self {
        Self {
            id,
            username,
            position: Vector3::ZERO,
            rotation: Quaternion::IDENTITY,
            input: MovementInput::default(),
        }
    }

    /// Moves the player by one tick of input, relative to where it faces
    pub fn step(&mut self, distance: f32) {
        let mut x = 0.0;
        let mut y = 0.0;
        if self.input.forward {
            y += 1.0;
        }
        if self.input.back {
            y -= 1.0;
        }
        if self.input.right {
            x += 1.0;
        }
        if self.input.left {
            x -= 1.0;
        }

        let forward = self.rotation.rotate(Vector3::FORWARD);
        let right = forward.cross(Vector3::UP).normalize();
        self.position += (right * x + forward * y) * distance;
    }
}

pub struct GameState {
    network: NetworkHandle,
    players: BTreeMap<u32, Player>,
    step_distance: f32,
    tick: u64,
}

impl GameState {
    pub fn new(network: NetworkHandle, tick_rate: u32) -> Self {
        Self {
            network,
            players: BTreeMap::new(),
            step_distance: MOVE_SPEED / tick_rate.max(1) as f32,
            tick: 0,
        }
    }

    pub fn player(&self, id: u32) -> Option<&Player> {
        self.players.get(&id)
    }

    pub fn players(&self) -> impl Iterator<Item = &Player> {
        self.players.values()
    }

    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    /// Puts a player into the world. The newcomer learns about every
    /// existing player, then everyone (newcomer included) learns about it.
    pub fn spawn_player(&mut self, id: u32, username: String) {
        let player = Player::new(id, username);

        for other in self.players.values() {
            self.network.send_to(
                id,
                Transport::Stream,
                send::spawn_player(other.id, &other.username, other.position, other.rotation),
            );
        }
        self.network.send_to(
            id,
            Transport::Stream,
            send::spawn_player(id, &player.username, player.position, player.rotation),
        );
        for &other in self.players.keys() {
            self.network.send_to(
                other,
                Transport::Stream,
                send::spawn_player(id, &player.username, player.position, player.rotation),
            );
        }

        info!("Player {} ({}) entered the game", id, player.username);
        self.players.insert(id, player);
    }

    pub fn set_player_input(&mut self, id: u32, input: MovementInput, rotation: Quaternion) {
        if let Some(player) = self.players.get_mut(&id) {
            player.input = input;
            player.rotation = rotation;
        }
    }

    pub fn remove_player(&mut self, id: u32) -> Option<Player> {
        let removed = self.players.remove(&id);
        if let Some(player) = &removed {
            info!("Removed player {} ({})", id, player.username);
        }
        removed
    }
}

impl Simulation for GameState {
    fn tick(&mut self) {
        self.tick += 1;
        for player in self.players.values_mut() {
            player.step(self.step_distance);
            self.network.send_to_all(
                Transport::Datagram,
                send::player_position(player.id, player.position),
            );
            self.network.send_to_all_except(
                player.id,
                Transport::Datagram,
                send::player_rotation(player.id, player.rotation),
            );
        }
    }

    fn on_connect(&mut self, slot: u32) {
        self.network
            .send_to(slot, Transport::Stream, send::welcome(WELCOME_MESSAGE, slot));
    }

    fn on_disconnect(&mut self, slot: u32) {
        self.remove_player(slot);
    }
}

/// Handler table covering every inbound packet kind
pub fn handlers() -> HandlerTable<GameState> {
    let mut table = HandlerTable::new();
    table
        .register(ClientPacket::WelcomeReceived, welcome_received)
        .register(ClientPacket::PlayerMovement, player_movement);
    table
}

fn welcome_received(game: &mut GameState, slot: u32, packet: &mut Packet) -> Result<(), PacketError> {
    let claimed = packet.read_i32()?;
    let username = packet.read_string()?;

    if i64::from(claimed) != i64::from(slot) {
        warn!(
            "Player \"{}\" in slot {} claimed the wrong slot id ({})",
            username, slot, claimed
        );
        return Ok(());
    }
    if game.players.contains_key(&slot) {
        warn!("Slot {} sent WelcomeReceived twice", slot);
        return Ok(());
    }

    game.spawn_player(slot, username);
    Ok(())
}

fn player_movement(game: &mut GameState, slot: u32, packet: &mut Packet) -> Result<(), PacketError> {
    let count = packet.read_i32()?;
    if count != MovementInput::COUNT {
        return Err(PacketError::InvalidLength(count));
    }

    let mut inputs = [false; 4];
    for input in inputs.iter_mut() {
        *input = packet.read_bool()?;
    }
    let rotation = packet.read_quaternion()?;

    game.set_player_input(slot, MovementInput::from_array(inputs), rotation);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::StreamHandle;
    use crate::client_manager::SlotTable;
    use assert_approx_eq::assert_approx_eq;
    use shared::ServerPacket;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio_test::assert_err;

    struct Harness {
        game: GameState,
        streams: Vec<mpsc::UnboundedReceiver<Vec<u8>>>,
        datagrams: mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>,
    }

    fn harness(connected: u16, tick_rate: u32) -> Harness {
        let slots = Arc::new(SlotTable::new(4));
        let mut streams = Vec::new();
        for port in 0..connected {
            let (tx, rx) = mpsc::unbounded_channel();
            let peer = SocketAddr::from(([127, 0, 0, 1], 5000 + port));
            slots.claim_stream(&StreamHandle::new(peer, tx));
            slots.check_datagram(i32::from(port) + 1, peer);
            streams.push(rx);
        }
        let (tx, datagrams) = mpsc::unbounded_channel();
        Harness {
            game: GameState::new(NetworkHandle::new(slots, tx), tick_rate),
            streams,
            datagrams,
        }
    }

    /// Packet ids and the first i32 field of every frame queued so far
    fn drain_headers(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<(i32, i32)> {
        let mut headers = Vec::new();
        while let Ok(framed) = rx.try_recv() {
            let mut packet = Packet::from_bytes(&framed);
            packet.read_i32().unwrap();
            headers.push((packet.read_i32().unwrap(), packet.read_i32().unwrap()));
        }
        headers
    }

    fn welcome_packet(claimed: i32, name: &str) -> Packet {
        let mut packet = Packet::new();
        packet.write_i32(claimed);
        packet.write_str(name);
        Packet::from_bytes(packet.as_bytes())
    }

    fn movement_packet(count: i32, inputs: [bool; 4], rotation: Quaternion) -> Packet {
        let mut packet = Packet::new();
        packet.write_i32(count);
        for input in inputs {
            packet.write_bool(input);
        }
        packet.write_quaternion(rotation);
        Packet::from_bytes(packet.as_bytes())
    }

    #[test]
    fn test_on_connect_sends_welcome() {
        let mut h = harness(1, 30);
        h.game.on_connect(1);

        let framed = h.streams[0].try_recv().unwrap();
        let mut packet = Packet::from_bytes(&framed);
        assert_eq!(packet.read_i32().unwrap() as usize, framed.len() - 4);
        assert_eq!(packet.read_i32().unwrap(), ServerPacket::Welcome.id());
        assert_eq!(packet.read_string().unwrap(), WELCOME_MESSAGE);
        assert_eq!(packet.read_i32().unwrap(), 1);
    }

    #[test]
    fn test_spawn_announces_players_both_ways() {
        let mut h = harness(2, 30);
        let spawn = ServerPacket::SpawnPlayer.id();

        welcome_received(&mut h.game, 1, &mut welcome_packet(1, "first")).unwrap();
        assert_eq!(drain_headers(&mut h.streams[0]), vec![(spawn, 1)]);

        welcome_received(&mut h.game, 2, &mut welcome_packet(2, "second")).unwrap();
        assert_eq!(drain_headers(&mut h.streams[1]), vec![(spawn, 1), (spawn, 2)]);
        assert_eq!(drain_headers(&mut h.streams[0]), vec![(spawn, 2)]);
        assert_eq!(h.game.player(2).unwrap().username, "second");
    }

    #[test]
    fn test_wrong_claimed_slot_is_ignored() {
        let mut h = harness(2, 30);
        welcome_received(&mut h.game, 2, &mut welcome_packet(1, "liar")).unwrap();
        assert!(h.game.player(2).is_none());
        assert!(h.streams[1].try_recv().is_err());
    }

    #[test]
    fn test_movement_input_moves_player() {
        let mut h = harness(1, 10);
        h.game.spawn_player(1, "runner".to_string());

        let mut packet = movement_packet(4, [true, false, false, false], Quaternion::IDENTITY);
        player_movement(&mut h.game, 1, &mut packet).unwrap();
        h.game.tick();
        h.game.tick();

        let position = h.game.player(1).unwrap().position;
        assert_approx_eq!(position.z, 1.0);
        assert_approx_eq!(position.x, 0.0);
        assert_eq!(h.game.tick_count(), 2);

        // Forward x up points to -x, so "right" input moves toward -x
        let mut packet = movement_packet(4, [false, false, true, false], Quaternion::IDENTITY);
        player_movement(&mut h.game, 1, &mut packet).unwrap();
        h.game.tick();
        assert_approx_eq!(h.game.player(1).unwrap().position.x, -0.5);
    }

    #[test]
    fn test_rotation_turns_forward_axis() {
        let mut player = Player::new(1, "turner".to_string());
        player.rotation = Quaternion::from_yaw(std::f32::consts::FRAC_PI_2);
        player.input.forward = true;
        player.step(1.0);
        assert_approx_eq!(player.position.x, 1.0);
        assert_approx_eq!(player.position.z, 0.0);
    }

    #[test]
    fn test_bad_input_count_is_rejected() {
        let mut h = harness(1, 30);
        h.game.spawn_player(1, "runner".to_string());
        let mut packet = movement_packet(3, [true; 4], Quaternion::IDENTITY);
        assert_err!(player_movement(&mut h.game, 1, &mut packet));
        assert_eq!(h.game.player(1).unwrap().input, MovementInput::default());
    }

    #[test]
    fn test_tick_broadcasts_position_and_rotation() {
        let mut h = harness(2, 30);
        h.game.spawn_player(1, "a".to_string());
        h.game.spawn_player(2, "b".to_string());
        h.game.tick();

        let mut seen = Vec::new();
        while let Ok((framed, to)) = h.datagrams.try_recv() {
            let mut packet = Packet::from_bytes(&framed);
            packet.read_i32().unwrap();
            seen.push((packet.read_i32().unwrap(), packet.read_i32().unwrap(), to.port()));
        }

        let position = ServerPacket::PlayerPosition.id();
        let rotation = ServerPacket::PlayerRotation.id();
        assert_eq!(
            seen,
            vec![
                (position, 1, 5000),
                (position, 1, 5001),
                (rotation, 1, 5001),
                (position, 2, 5000),
                (position, 2, 5001),
                (rotation, 2, 5000),
            ]
        );
    }

    #[test]
    fn test_disconnect_removes_player() {
        let mut h = harness(1, 30);
        h.game.spawn_player(1, "leaver".to_string());
        h.game.on_disconnect(1);
        assert!(h.game.player(1).is_none());
        assert_eq!(h.game.players().count(), 0);
        assert!(handlers().verify().is_ok());
    }
}
