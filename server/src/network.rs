//! Server network layer: TCP accept loop, UDP receive/send loops and the
//! outbound send API used by the simulation

use crate::client::{write_loop, DatagramVerdict, StreamHandle, StreamSession};
use crate::client_manager::SlotTable;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::handlers::{Dispatcher, HandlerTable};
use crate::scheduler::DeferredQueue;
use crate::tick::{run_simulation, Simulation};
use log::{debug, error, info, warn};
use shared::framing::{datagram_frame, parse_datagram, Datagram};
use shared::{ClientPacket, Packet, RECEIVE_BUFFER_SIZE};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Which transport an outbound packet takes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Reliable, ordered (TCP)
    Stream,
    /// Unreliable (UDP); a no-op for slots without a bound endpoint
    Datagram,
}

type OutboundDatagram = (Vec<u8>, SocketAddr);

/// Outbound side of the server, cheap to clone into the simulation.
///
/// Sends never block: stream bytes go to the session's writer task and
/// datagrams to the shared sender task.
#[derive(Clone)]
pub struct NetworkHandle {
    slots: Arc<SlotTable>,
    datagrams: mpsc::UnboundedSender<OutboundDatagram>,
}

impl NetworkHandle {
    pub fn new(slots: Arc<SlotTable>, datagrams: mpsc::UnboundedSender<OutboundDatagram>) -> Self {
        Self { slots, datagrams }
    }

    pub fn slots(&self) -> &Arc<SlotTable> {
        &self.slots
    }

    /// Slots that currently have a stream connection
    pub fn connected_slots(&self) -> Vec<u32> {
        self.slots.connected()
    }

    /// Frames `packet` and sends it to one slot. Returns whether it was
    /// handed to a transport.
    pub fn send_to(&self, slot: u32, transport: Transport, mut packet: Packet) -> bool {
        packet.write_length();
        self.deliver(slot, transport, packet.into_bytes())
    }

    /// Sends to every connected slot
    pub fn send_to_all(&self, transport: Transport, packet: Packet) {
        self.broadcast(None, transport, packet);
    }

    /// Sends to every connected slot except `except`
    pub fn send_to_all_except(&self, except: u32, transport: Transport, packet: Packet) {
        self.broadcast(Some(except), transport, packet);
    }

    fn broadcast(&self, except: Option<u32>, transport: Transport, mut packet: Packet) {
        packet.write_length();
        let framed = packet.into_bytes();
        for slot in self.slots.connected() {
            if Some(slot) == except {
                continue;
            }
            self.deliver(slot, transport, framed.clone());
        }
    }

    fn deliver(&self, slot: u32, transport: Transport, framed: Vec<u8>) -> bool {
        match transport {
            Transport::Stream => match self.slots.stream_handle(slot) {
                Some(handle) => handle.send(framed),
                None => false,
            },
            Transport::Datagram => match self.slots.datagram_endpoint(slot) {
                Some(to) => self.datagrams.send((framed, to)).is_ok(),
                None => false,
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SessionSettings {
    max_frame_len: usize,
    idle_timeout: Option<Duration>,
}

/// A bound but not yet running server
pub struct Server {
    config: ServerConfig,
    listener: TcpListener,
    socket: Arc<UdpSocket>,
    slots: Arc<SlotTable>,
    datagram_tx: mpsc::UnboundedSender<OutboundDatagram>,
    datagram_rx: mpsc::UnboundedReceiver<OutboundDatagram>,
}

impl Server {
    /// Binds the TCP listener and a UDP socket on the same port
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;

        let listener = TcpListener::bind(config.bind_addr()).await?;
        let local_addr = listener.local_addr()?;
        let socket = Arc::new(UdpSocket::bind(local_addr).await?);
        info!(
            "Server listening on {} (TCP and UDP), {} slots",
            local_addr, config.max_players
        );

        let (datagram_tx, datagram_rx) = mpsc::unbounded_channel();
        Ok(Server {
            slots: Arc::new(SlotTable::new(config.max_players)),
            config,
            listener,
            socket,
            datagram_tx,
            datagram_rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Send API for the simulation; valid before and after `start`
    pub fn network(&self) -> NetworkHandle {
        NetworkHandle::new(Arc::clone(&self.slots), self.datagram_tx.clone())
    }

    /// Spawns the network tasks and the simulation thread.
    ///
    /// Must be called from within a tokio runtime. Fails if `handlers` does
    /// not cover every inbound packet kind.
    pub fn start<S: Simulation>(
        self,
        handlers: HandlerTable<S>,
        sim: S,
    ) -> Result<ServerHandle<S>, ServerError> {
        handlers.verify()?;

        let local_addr = self.listener.local_addr()?;
        let network = self.network();
        let queue = Arc::new(DeferredQueue::new());
        let dispatcher = Arc::new(Dispatcher::new(handlers, Arc::clone(&queue)));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let settings = SessionSettings {
            max_frame_len: self.config.max_frame_len,
            idle_timeout: self.config.idle_timeout(),
        };

        let tasks = vec![
            tokio::spawn(accept_loop(
                self.listener,
                Arc::clone(&self.slots),
                Arc::clone(&dispatcher),
                settings,
                shutdown_rx.clone(),
            )),
            tokio::spawn(datagram_receiver(
                Arc::clone(&self.socket),
                Arc::clone(&self.slots),
                dispatcher,
                shutdown_rx,
            )),
            tokio::spawn(datagram_sender(self.socket, self.datagram_rx)),
        ];

        let running = Arc::new(AtomicBool::new(true));
        let simulation = {
            let running = Arc::clone(&running);
            let tick_rate = self.config.tick_rate;
            std::thread::Builder::new()
                .name("simulation".to_string())
                .spawn(move || run_simulation(sim, queue, tick_rate, running))?
        };

        Ok(ServerHandle {
            local_addr,
            network,
            shutdown_tx,
            running,
            tasks,
            simulation: Some(simulation),
        })
    }
}

/// A running server
pub struct ServerHandle<S> {
    local_addr: SocketAddr,
    network: NetworkHandle,
    shutdown_tx: watch::Sender<bool>,
    running: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
    simulation: Option<std::thread::JoinHandle<S>>,
}

impl<S: Send + 'static> ServerHandle<S> {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn network(&self) -> &NetworkHandle {
        &self.network
    }

    /// Stops the network tasks and the simulation thread, and returns the
    /// final simulation state
    pub async fn shutdown(mut self) -> Result<S, ServerError> {
        info!("Shutting down server on {}", self.local_addr);
        self.stop();

        let simulation = self
            .simulation
            .take()
            .ok_or_else(|| ServerError::Shutdown("simulation already joined".to_string()))?;
        tokio::task::spawn_blocking(move || simulation.join())
            .await
            .map_err(|e| ServerError::Shutdown(e.to_string()))?
            .map_err(|_| ServerError::Shutdown("simulation thread panicked".to_string()))
    }
}

impl<S> ServerHandle<S> {
    fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        for task in &self.tasks {
            task.abort();
        }
        self.running.store(false, Ordering::Release);
    }
}

impl<S> Drop for ServerHandle<S> {
    fn drop(&mut self) {
        // The simulation thread is left to exit on its own
        self.stop();
    }
}

async fn accept_loop<S: Simulation>(
    listener: TcpListener,
    slots: Arc<SlotTable>,
    dispatcher: Arc<Dispatcher<S>>,
    settings: SessionSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.changed() => break,
        };

        match accepted {
            Ok((stream, peer)) => {
                info!("Incoming connection from {}", peer);
                start_session(
                    stream,
                    peer,
                    Arc::clone(&slots),
                    Arc::clone(&dispatcher),
                    settings,
                    shutdown.clone(),
                );
            }
            Err(e) => {
                error!("Error accepting connection: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
    debug!("Accept loop stopped");
}

/// Binds an accepted stream to a slot and spawns its reader and writer
/// tasks. A full server closes the stream without touching any slot.
fn start_session<S: Simulation>(
    stream: TcpStream,
    peer: SocketAddr,
    slots: Arc<SlotTable>,
    dispatcher: Arc<Dispatcher<S>>,
    settings: SessionSettings,
    shutdown: watch::Receiver<bool>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not disable Nagle for {}: {}", peer, e);
    }

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let Some(slot) = slots.claim_stream(&StreamHandle::new(peer, outbound_tx)) else {
        info!("{} failed to connect: server full", peer);
        return;
    };

    let (reader, writer) = stream.into_split();
    tokio::spawn(write_loop(slot, writer, outbound_rx));
    dispatcher
        .queue()
        .enqueue(move |sim: &mut S| sim.on_connect(slot));

    let session = StreamSession::new(slot, reader, settings.max_frame_len, settings.idle_timeout);
    tokio::spawn(async move {
        let reason = session
            .run(|frame| dispatcher.dispatch_or_log(slot, frame), shutdown)
            .await;
        info!("{} (slot {}) disconnected: {}", peer, slot, reason);

        // Queued before the slot is freed, so a later claim's on_connect
        // always runs after this
        dispatcher
            .queue()
            .enqueue(move |sim: &mut S| sim.on_disconnect(slot));
        slots.release(slot);
    });
}

async fn datagram_receiver<S: Simulation>(
    socket: Arc<UdpSocket>,
    slots: Arc<SlotTable>,
    dispatcher: Arc<Dispatcher<S>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buffer = vec![0u8; RECEIVE_BUFFER_SIZE];

    loop {
        let received = tokio::select! {
            received = socket.recv_from(&mut buffer) => received,
            _ = shutdown.changed() => break,
        };

        match received {
            Ok((len, from)) => {
                handle_datagram(&slots, &dispatcher, &buffer[..len], from);
            }
            Err(e) => {
                // ICMP port-unreachable from a vanished client surfaces here
                debug!("Error receiving UDP data: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
    debug!("Datagram receiver stopped");
}

/// Routes one inbound datagram. Returns the packet kind if it was queued
/// for the simulation.
pub fn handle_datagram<S: 'static>(
    slots: &SlotTable,
    dispatcher: &Dispatcher<S>,
    data: &[u8],
    from: SocketAddr,
) -> Option<ClientPacket> {
    let (claimed, body) = match parse_datagram(data) {
        Datagram::Runt | Datagram::Discovery => return None,
        Datagram::Claimed { slot, body } => (slot, body),
    };

    match slots.check_datagram(claimed, from) {
        DatagramVerdict::Bound => {
            info!("Slot {} bound UDP endpoint {}", claimed, from);
            None
        }
        DatagramVerdict::Accepted { slot } => {
            let frame = match datagram_frame(body) {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("Dropping malformed datagram from {}: {}", from, e);
                    return None;
                }
            };
            match dispatcher.dispatch(slot, frame) {
                Ok(kind) => Some(kind),
                Err(e) => {
                    warn!("Ignoring datagram from slot {}: {}", slot, e);
                    None
                }
            }
        }
        DatagramVerdict::Spoofed { first } => {
            if first {
                debug!("Dropping datagram for slot {} from unbound endpoint {}", claimed, from);
            }
            None
        }
        DatagramVerdict::NoStream => {
            debug!("Dropping datagram for unconnected slot {} from {}", claimed, from);
            None
        }
        DatagramVerdict::UnknownSlot => {
            debug!("Dropping datagram for unknown slot {} from {}", claimed, from);
            None
        }
    }
}

async fn datagram_sender(
    socket: Arc<UdpSocket>,
    mut outbound: mpsc::UnboundedReceiver<OutboundDatagram>,
) {
    while let Some((bytes, to)) = outbound.recv().await {
        if let Err(e) = socket.send_to(&bytes, to).await {
            warn!("Error sending data to {} via UDP: {}", to, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::ServerPacket;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    struct Fixture {
        network: NetworkHandle,
        datagrams: mpsc::UnboundedReceiver<OutboundDatagram>,
        streams: Vec<(u32, mpsc::UnboundedReceiver<Vec<u8>>)>,
    }

    fn fixture(capacity: u32, connected: u16) -> Fixture {
        let slots = Arc::new(SlotTable::new(capacity));
        let mut streams = Vec::new();
        for port in 0..connected {
            let (tx, rx) = mpsc::unbounded_channel();
            let slot = slots.claim_stream(&StreamHandle::new(addr(5000 + port), tx)).unwrap();
            streams.push((slot, rx));
        }
        let (tx, datagrams) = mpsc::unbounded_channel();
        Fixture {
            network: NetworkHandle::new(slots, tx),
            datagrams,
            streams,
        }
    }

    fn position_packet(slot: i32) -> Packet {
        let mut packet = ServerPacket::PlayerPosition.packet();
        packet.write_i32(slot);
        packet
    }

    fn expected_frame(slot: i32) -> Vec<u8> {
        let mut packet = position_packet(slot);
        packet.write_length();
        packet.into_bytes()
    }

    #[test]
    fn test_stream_send_is_framed() {
        let mut fx = fixture(4, 2);
        assert!(fx.network.send_to(2, Transport::Stream, position_packet(7)));
        assert!(!fx.network.send_to(3, Transport::Stream, position_packet(7)));

        let (_, rx) = &mut fx.streams[1];
        assert_eq!(rx.try_recv().unwrap(), expected_frame(7));
        assert!(fx.streams[0].1.try_recv().is_err());
    }

    #[test]
    fn test_datagram_send_requires_bound_endpoint() {
        let mut fx = fixture(4, 2);
        assert!(!fx.network.send_to(1, Transport::Datagram, position_packet(1)));
        assert!(fx.datagrams.try_recv().is_err());

        fx.network.slots().check_datagram(1, addr(9000));
        assert!(fx.network.send_to(1, Transport::Datagram, position_packet(1)));
        assert_eq!(fx.datagrams.try_recv().unwrap(), (expected_frame(1), addr(9000)));
    }

    #[test]
    fn test_broadcast_skips_excluded_slot() {
        let mut fx = fixture(4, 3);
        fx.network
            .send_to_all_except(2, Transport::Stream, position_packet(2));

        for (slot, rx) in fx.streams.iter_mut() {
            if *slot == 2 {
                assert!(rx.try_recv().is_err());
            } else {
                assert_eq!(rx.try_recv().unwrap(), expected_frame(2));
            }
        }

        fx.network.send_to_all(Transport::Stream, position_packet(0));
        for (_, rx) in fx.streams.iter_mut() {
            assert_eq!(rx.try_recv().unwrap(), expected_frame(0));
        }
        assert_eq!(fx.network.connected_slots(), vec![1, 2, 3]);
    }

    struct Inputs(Vec<(u32, i32)>);

    fn dispatcher() -> Dispatcher<Inputs> {
        let mut table = HandlerTable::new();
        table
            .register(ClientPacket::WelcomeReceived, |_: &mut Inputs, _, _: &mut Packet| Ok(()))
            .register(ClientPacket::PlayerMovement, |s: &mut Inputs, slot, p: &mut Packet| {
                s.0.push((slot, p.read_i32()?));
                Ok(())
            });
        Dispatcher::new(table, Arc::new(DeferredQueue::new()))
    }

    fn datagram(slot: i32, value: i32) -> Vec<u8> {
        let mut packet = ClientPacket::PlayerMovement.packet();
        packet.write_i32(value);
        packet.write_length();
        packet.insert_i32(slot);
        packet.into_bytes()
    }

    #[test]
    fn test_first_datagram_binds_without_dispatch() {
        let fx = fixture(4, 1);
        let dispatcher = dispatcher();
        let slots = fx.network.slots();

        assert_eq!(handle_datagram(slots, &dispatcher, &datagram(1, 10), addr(7000)), None);
        assert_eq!(slots.datagram_endpoint(1), Some(addr(7000)));
        assert_eq!(
            handle_datagram(slots, &dispatcher, &datagram(1, 11), addr(7000)),
            Some(ClientPacket::PlayerMovement)
        );

        let mut inputs = Inputs(Vec::new());
        dispatcher.queue().drain(&mut Vec::new(), &mut inputs);
        assert_eq!(inputs.0, vec![(1, 11)]);
    }

    #[test]
    fn test_rejected_datagrams_are_not_dispatched() {
        let fx = fixture(4, 1);
        let dispatcher = dispatcher();
        let slots = fx.network.slots();
        handle_datagram(slots, &dispatcher, &datagram(1, 0), addr(7000));

        // Spoofed sender, unconnected slot, out-of-range slot, discovery, runt
        assert_eq!(handle_datagram(slots, &dispatcher, &datagram(1, 1), addr(7001)), None);
        assert_eq!(handle_datagram(slots, &dispatcher, &datagram(2, 1), addr(7000)), None);
        assert_eq!(handle_datagram(slots, &dispatcher, &datagram(9, 1), addr(7000)), None);
        assert_eq!(handle_datagram(slots, &dispatcher, &datagram(0, 1), addr(7000)), None);
        assert_eq!(handle_datagram(slots, &dispatcher, &[1, 0], addr(7000)), None);
        assert_eq!(slots.datagram_endpoint(2), None);

        // Declared length longer than the body
        let mut truncated = datagram(1, 1);
        truncated.truncate(truncated.len() - 2);
        assert_eq!(handle_datagram(slots, &dispatcher, &truncated, addr(7000)), None);

        assert!(!dispatcher.queue().has_pending());
    }
}
