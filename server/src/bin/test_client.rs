//! Headless client that walks the connection handshake and then streams
//! random movement input, logging everything the server sends back.

use clap::Parser;
use log::{debug, info, warn};
use rand::Rng;
use shared::{
    ClientPacket, FrameDecoder, MovementInput, Packet, PacketError, Quaternion, ServerPacket,
    RECEIVE_BUFFER_SIZE,
};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{interval, sleep, Instant};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:26950")]
    server: String,

    /// Username sent with WelcomeReceived
    #[arg(short = 'u', long, default_value = "test_client")]
    username: String,

    /// Movement packets per second
    #[arg(short = 'r', long, default_value = "30")]
    input_rate: u32,

    /// How long to stay connected, in seconds
    #[arg(short = 'd', long, default_value = "10")]
    duration: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    info!("Connecting to {}", args.server);

    let mut stream = TcpStream::connect(&args.server).await?;
    stream.set_nodelay(true)?;
    let server_addr = stream.peer_addr()?;

    let mut decoder = FrameDecoder::default();
    let mut buffer = vec![0u8; RECEIVE_BUFFER_SIZE];
    let slot = loop {
        let len = stream.read(&mut buffer).await?;
        if len == 0 {
            return Err("server closed the connection before Welcome (full?)".into());
        }
        let mut welcome = None;
        decoder.feed(&buffer[..len], |frame| {
            if welcome.is_none() {
                welcome = Some(frame);
            }
        })?;
        if let Some(frame) = welcome {
            break read_welcome(&frame)?;
        }
    };
    info!("Assigned slot {}", slot);

    let mut reply = ClientPacket::WelcomeReceived.packet();
    reply.write_i32(slot);
    reply.write_str(&args.username);
    reply.write_length();
    stream.write_all(reply.as_bytes()).await?;

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(server_addr).await?;
    // Slot id alone binds the endpoint
    socket.send(&slot.to_le_bytes()).await?;
    info!("UDP socket {} bound for slot {}", socket.local_addr()?, slot);

    let mut rng = rand::thread_rng();
    let mut input_timer = interval(Duration::from_secs_f64(1.0 / f64::from(args.input_rate.max(1))));
    let deadline = sleep(Duration::from_secs(args.duration));
    tokio::pin!(deadline);
    let mut datagram = vec![0u8; RECEIVE_BUFFER_SIZE];
    let mut yaw = 0.0f32;
    let mut sent = 0u64;
    let started = Instant::now();

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = input_timer.tick() => {
                let input = MovementInput::from_array(rng.gen());
                yaw += rng.gen_range(-0.1..0.1);
                socket.send(&movement_datagram(slot, input, Quaternion::from_yaw(yaw))).await?;
                sent += 1;
            }
            read = stream.read(&mut buffer) => {
                let len = read?;
                if len == 0 {
                    warn!("Server closed the connection");
                    break;
                }
                decoder.feed(&buffer[..len], |frame| log_frame("TCP", &frame))?;
            }
            received = socket.recv(&mut datagram) => {
                match received {
                    Ok(len) => log_datagram(&datagram[..len]),
                    Err(e) => debug!("UDP receive failed: {}", e),
                }
            }
        }
    }

    info!(
        "Sent {} movement packets in {:.1}s, disconnecting",
        sent,
        started.elapsed().as_secs_f32()
    );
    Ok(())
}

fn read_welcome(frame: &[u8]) -> Result<i32, PacketError> {
    let mut packet = Packet::from_bytes(frame);
    let id = packet.read_i32()?;
    if ServerPacket::try_from(id)? != ServerPacket::Welcome {
        return Err(PacketError::UnknownPacketId(id));
    }
    let message = packet.read_string()?;
    let slot = packet.read_i32()?;
    info!("Server says: {}", message);
    Ok(slot)
}

fn movement_datagram(slot: i32, input: MovementInput, rotation: Quaternion) -> Vec<u8> {
    let mut packet = ClientPacket::PlayerMovement.packet();
    packet.write_i32(MovementInput::COUNT);
    for pressed in input.to_array() {
        packet.write_bool(pressed);
    }
    packet.write_quaternion(rotation);
    packet.write_length();
    packet.insert_i32(slot);
    packet.into_bytes()
}

fn log_datagram(data: &[u8]) {
    let mut packet = Packet::from_bytes(data);
    match packet.read_i32() {
        Ok(len) if len > 0 && len as usize == packet.unread_len() => {
            log_frame("UDP", &data[4..]);
        }
        _ => debug!("Ignoring malformed datagram of {} bytes", data.len()),
    }
}

fn log_frame(transport: &str, frame: &[u8]) {
    let mut packet = Packet::from_bytes(frame);
    let kind = match packet.read_i32().map(ServerPacket::try_from) {
        Ok(Ok(kind)) => kind,
        _ => {
            debug!("{}: unknown frame of {} bytes", transport, frame.len());
            return;
        }
    };

    let player = packet.read_i32().unwrap_or_default();
    match kind {
        ServerPacket::SpawnPlayer => {
            let name = packet.read_string().unwrap_or_default();
            let position = packet.read_vector3().unwrap_or_default();
            info!("{}: spawn player {} \"{}\" at {:?}", transport, player, name, position);
        }
        ServerPacket::PlayerPosition => {
            if let Ok(position) = packet.read_vector3() {
                debug!("{}: player {} at {:?}", transport, player, position);
            }
        }
        ServerPacket::PlayerRotation => {
            if let Ok(rotation) = packet.read_quaternion() {
                debug!("{}: player {} facing {:?}", transport, player, rotation);
            }
        }
        ServerPacket::Welcome => debug!("{}: repeated Welcome", transport),
    }
}
