//! Per-slot transport state and the stream session loops
//!
//! A `Slot` is a permanent seat in the connection registry. It holds at most
//! one bound stream connection (as a handle to that connection's writer) and
//! at most one datagram endpoint. The reassembly state of a stream lives in
//! its `StreamSession`, owned by the connection's reader task, so it is
//! dropped on every exit path of that task.

use log::{debug, warn};
use shared::framing::FrameDecoder;
use shared::{FrameError, RECEIVE_BUFFER_SIZE};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

/// Sending side of a bound stream connection
#[derive(Debug, Clone)]
pub struct StreamHandle {
    peer: SocketAddr,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

impl StreamHandle {
    pub fn new(peer: SocketAddr, outbound: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self { peer, outbound }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queues already-framed bytes for the writer task. Returns false once
    /// the connection is gone.
    pub fn send(&self, framed: Vec<u8>) -> bool {
        self.outbound.send(framed).is_ok()
    }
}

/// Result of checking an inbound datagram against a slot's binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramVerdict {
    /// First datagram for the slot; the sender is now its endpoint
    Bound,
    /// Sender matches the bound endpoint of `slot`
    Accepted { slot: u32 },
    /// Sender differs from the bound endpoint. `first` is set only for the
    /// first rejection since the endpoint was bound.
    Spoofed { first: bool },
    /// The slot has no stream connection to pair the endpoint with
    NoStream,
    /// The claimed id is outside the slot table
    UnknownSlot,
}

#[derive(Debug, Default)]
struct DatagramSession {
    endpoint: Option<SocketAddr>,
    spoof_reported: bool,
}

#[derive(Debug)]
pub struct Slot {
    id: u32,
    stream: Mutex<Option<StreamHandle>>,
    datagram: Mutex<DatagramSession>,
}

impl Slot {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            stream: Mutex::new(None),
            datagram: Mutex::new(DatagramSession::default()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn has_stream(&self) -> bool {
        self.stream.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Binds the connection if the slot's stream is free. The datagram
    /// session starts out unbound for every new connection.
    ///
    /// Lock order is always `stream` then `datagram`.
    pub fn try_bind_stream(&self, handle: &StreamHandle) -> bool {
        let mut stream = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        if stream.is_some() {
            return false;
        }
        *self.datagram.lock().unwrap_or_else(|e| e.into_inner()) = DatagramSession::default();
        *stream = Some(handle.clone());
        true
    }

    /// Clears both transports under the stream lock. Returns the stream
    /// handle if one was bound.
    pub fn release(&self) -> Option<StreamHandle> {
        let mut stream = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        *self.datagram.lock().unwrap_or_else(|e| e.into_inner()) = DatagramSession::default();
        stream.take()
    }

    pub fn stream_handle(&self) -> Option<StreamHandle> {
        self.stream.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn datagram_endpoint(&self) -> Option<SocketAddr> {
        self.datagram
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .endpoint
    }

    /// Binds the endpoint on first use, then only accepts that exact
    /// address and port.
    ///
    /// The stream guard is held until the verdict is reached, so a
    /// concurrent `release` can never leave an endpoint on a freed slot.
    pub fn check_datagram(&self, from: SocketAddr) -> DatagramVerdict {
        let stream = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        if stream.is_none() {
            return DatagramVerdict::NoStream;
        }
        let mut session = self.datagram.lock().unwrap_or_else(|e| e.into_inner());
        match session.endpoint {
            None => {
                session.endpoint = Some(from);
                DatagramVerdict::Bound
            }
            Some(bound) if bound == from => DatagramVerdict::Accepted { slot: self.id },
            Some(_) => {
                let first = !session.spoof_reported;
                session.spoof_reported = true;
                DatagramVerdict::Spoofed { first }
            }
        }
    }
}

/// Why a stream session ended
#[derive(Debug)]
pub enum CloseReason {
    PeerClosed,
    ReadFailed(std::io::Error),
    IdleTimeout(Duration),
    Protocol(FrameError),
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed the connection"),
            CloseReason::ReadFailed(e) => write!(f, "read failed: {}", e),
            CloseReason::IdleTimeout(d) => write!(f, "idle for {:?}", d),
            CloseReason::Protocol(e) => write!(f, "protocol violation: {}", e),
            CloseReason::Shutdown => write!(f, "server shutting down"),
        }
    }
}

/// Read side of a bound stream connection
pub struct StreamSession<R> {
    slot: u32,
    reader: R,
    receive_buffer: Box<[u8]>,
    decoder: FrameDecoder,
    idle_timeout: Option<Duration>,
}

impl<R: AsyncRead + Unpin> StreamSession<R> {
    pub fn new(slot: u32, reader: R, max_frame_len: usize, idle_timeout: Option<Duration>) -> Self {
        Self {
            slot,
            reader,
            receive_buffer: vec![0u8; RECEIVE_BUFFER_SIZE].into_boxed_slice(),
            decoder: FrameDecoder::new(max_frame_len),
            idle_timeout,
        }
    }

    /// Reads until the peer goes away, handing each complete frame body to
    /// `on_frame` in arrival order.
    pub async fn run<F>(mut self, mut on_frame: F, mut shutdown: watch::Receiver<bool>) -> CloseReason
    where
        F: FnMut(Vec<u8>),
    {
        loop {
            let read = tokio::select! {
                read = read_with_timeout(&mut self.reader, &mut self.receive_buffer, self.idle_timeout) => read,
                _ = shutdown.changed() => return CloseReason::Shutdown,
            };

            let len = match read {
                Ok(Some(0)) => return CloseReason::PeerClosed,
                Ok(Some(len)) => len,
                Ok(None) => {
                    return CloseReason::IdleTimeout(self.idle_timeout.unwrap_or_default())
                }
                Err(e) => return CloseReason::ReadFailed(e),
            };

            if let Err(e) = self.decoder.feed(&self.receive_buffer[..len], &mut on_frame) {
                return CloseReason::Protocol(e);
            }
            if self.decoder.buffered() > 0 {
                debug!(
                    "Slot {}: {} bytes waiting for the rest of a frame",
                    self.slot,
                    self.decoder.buffered()
                );
            }
        }
    }
}

/// `Ok(None)` means the idle timeout elapsed
async fn read_with_timeout<R: AsyncRead + Unpin>(
    reader: &mut R,
    buffer: &mut [u8],
    idle_timeout: Option<Duration>,
) -> std::io::Result<Option<usize>> {
    match idle_timeout {
        Some(limit) => match tokio::time::timeout(limit, reader.read(buffer)).await {
            Ok(read) => read.map(Some),
            Err(_) => Ok(None),
        },
        None => reader.read(buffer).await.map(Some),
    }
}

/// Drains queued outbound frames onto the socket until every sender is
/// dropped. Write failures are logged; they do not end the session, the
/// read side decides that.
pub async fn write_loop<W: AsyncWrite + Unpin>(
    slot: u32,
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let mut failed = false;
    while let Some(bytes) = outbound.recv().await {
        if failed {
            continue;
        }
        if let Err(e) = writer.write_all(&bytes).await {
            warn!("Error sending data to slot {} over TCP: {}", slot, e);
            failed = true;
        }
    }
    let _ = writer.shutdown().await;
}
