//! Length-prefix framing for the stream transport and the datagram envelope
//!
//! Every logical message is `[i32 len][len bytes]`, little-endian. The stream
//! side arrives in arbitrary chunks, so `FrameDecoder` keeps the bytes that
//! do not yet form a whole frame and replays the pending length once the
//! next chunk lands. Client datagrams carry one extra leading i32, the slot
//! id the sender claims to own.

use crate::packet::{Packet, PacketError};
use thiserror::Error;

/// Size of the length prefix in front of every frame
pub const LENGTH_PREFIX: usize = 4;

/// Default upper bound for a single declared frame length
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("declared frame length {declared} exceeds limit of {max} bytes")]
    TooLarge { declared: usize, max: usize },

    #[error(transparent)]
    Packet(#[from] PacketError),
}

/// Reassembles complete frames from a fragmented byte stream
#[derive(Debug)]
pub struct FrameDecoder {
    received: Packet,
    max_frame_len: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            received: Packet::new(),
            max_frame_len,
        }
    }

    /// Bytes held back waiting for the rest of a frame
    pub fn buffered(&self) -> usize {
        self.received.unread_len()
    }

    /// Feeds one chunk and hands every completed frame body to `on_frame`,
    /// in stream order.
    ///
    /// A non-positive length prefix marks an empty/invalid frame: it is
    /// consumed and the buffer is reset. A declared length above the limit is
    /// a hard error; the caller is expected to drop the connection.
    pub fn feed<F>(&mut self, chunk: &[u8], mut on_frame: F) -> Result<(), FrameError>
    where
        F: FnMut(Vec<u8>),
    {
        self.received.set_bytes(chunk);

        loop {
            match self.next_length()? {
                NextFrame::Incomplete => {
                    self.received.compact();
                    return Ok(());
                }
                NextFrame::Invalid => {
                    self.received.clear();
                    return Ok(());
                }
                NextFrame::Length(len) if len > self.received.unread_len() => {
                    // Keep the length so the next chunk re-reads it
                    self.received.rewind_i32();
                    self.received.compact();
                    return Ok(());
                }
                NextFrame::Length(len) => {
                    let body = self.received.read_bytes(len)?;
                    on_frame(body);
                }
            }
        }
    }

    fn next_length(&mut self) -> Result<NextFrame, FrameError> {
        if self.received.unread_len() < LENGTH_PREFIX {
            return Ok(NextFrame::Incomplete);
        }

        let len = self.received.read_i32()?;
        if len <= 0 {
            return Ok(NextFrame::Invalid);
        }

        let len = len as usize;
        if len > self.max_frame_len {
            self.received.clear();
            return Err(FrameError::TooLarge {
                declared: len,
                max: self.max_frame_len,
            });
        }
        Ok(NextFrame::Length(len))
    }
}

enum NextFrame {
    /// Fewer than four bytes buffered
    Incomplete,
    /// Zero or negative length prefix
    Invalid,
    Length(usize),
}

/// Outcome of peeling the envelope off a client datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram<'a> {
    /// Too short to carry a slot id
    Runt,
    /// Slot id zero: unauthenticated discovery traffic
    Discovery,
    /// Claims `slot`; `body` is everything after the slot id
    Claimed { slot: i32, body: &'a [u8] },
}

pub fn parse_datagram(data: &[u8]) -> Datagram<'_> {
    if data.len() < LENGTH_PREFIX {
        return Datagram::Runt;
    }
    let slot = i32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    if slot == 0 {
        return Datagram::Discovery;
    }
    Datagram::Claimed {
        slot,
        body: &data[LENGTH_PREFIX..],
    }
}

/// Extracts the single frame carried in a datagram body
pub fn datagram_frame(body: &[u8]) -> Result<Vec<u8>, PacketError> {
    let mut packet = Packet::from_bytes(body);
    let len = packet.read_i32()?;
    if len <= 0 {
        return Err(PacketError::InvalidLength(len));
    }
    packet.read_bytes(len as usize)
}
