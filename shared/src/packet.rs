//! Binary packet buffer with typed writers and cursor-based readers
//!
//! A `Packet` is either built for sending (typed writes appended to the end,
//! then `write_length` exactly once before handing it to a transport) or
//! wrapped around received bytes and consumed with the mirrored readers.
//! All multi-byte values are little-endian.

use crate::math::{Quaternion, Vector3};
use thiserror::Error;

/// Failures while decoding a packet. Local to one packet; the caller drops
/// the packet and carries on.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("decode underrun: needed {needed} bytes, {remaining} remaining")]
    DecodeUnderrun { needed: usize, remaining: usize },

    #[error("invalid length field: {0}")]
    InvalidLength(i32),

    #[error("unknown packet id: {0}")]
    UnknownPacketId(i32),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Packet {
    buffer: Vec<u8>,
    read_pos: usize,
}

impl Packet {
    /// Creates an empty packet
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an outbound packet whose first field is the packet id
    pub fn with_id(id: i32) -> Self {
        let mut packet = Self::new();
        packet.write_i32(id);
        packet
    }

    /// Creates a packet for reading from received bytes
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut packet = Self::new();
        packet.set_bytes(data);
        packet
    }

    /// Appends received bytes behind whatever is still buffered
    pub fn set_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Prepends the byte count of the current contents.
    ///
    /// This is the framing step and must happen exactly once, right before
    /// the packet goes out on a transport.
    pub fn write_length(&mut self) {
        let len = self.buffer.len() as i32;
        self.insert_i32(len);
    }

    /// Prepends an arbitrary i32 (e.g. the slot id of a client datagram)
    pub fn insert_i32(&mut self, value: i32) {
        let mut prefixed = value.to_le_bytes().to_vec();
        prefixed.append(&mut self.buffer);
        self.buffer = prefixed;
    }

    /// Whole buffer, including bytes already read
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Consumes the packet, returning its buffer (framed if
    /// `write_length` was called)
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Total buffered bytes, read or not
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Bytes between the cursor and the end of the buffer
    pub fn unread_len(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Clears buffer and cursor so the packet can be reused
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.read_pos = 0;
    }

    /// Un-reads the most recent length field.
    ///
    /// Only valid when the previous read was a 4-byte integer.
    pub fn rewind_i32(&mut self) {
        debug_assert!(self.read_pos >= 4, "rewind past start of packet");
        self.read_pos = self.read_pos.saturating_sub(4);
    }

    /// Drops bytes that have already been read
    pub fn compact(&mut self) {
        if self.read_pos > 0 {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
    }

    /// Appends any `WireValue`; chains for multi-field packets
    pub fn write<T: WireValue>(&mut self, value: &T) -> &mut Self {
        value.encode(self);
        self
    }

    /// Reads any `WireValue` at the cursor
    pub fn read<T: WireValue>(&mut self) -> Result<T, PacketError> {
        T::decode(self)
    }

    // Writers

    /// Appends a single byte
    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    /// Appends raw bytes with no length prefix
    pub fn write_bytes(&mut self, value: &[u8]) {
        self.buffer.extend_from_slice(value);
    }

    /// Appends a little-endian i16
    pub fn write_i16(&mut self, value: i16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Appends a little-endian i32. Packet ids, lengths and slot ids all
    /// use this encoding.
    pub fn write_i32(&mut self, value: i32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Appends a little-endian i64
    pub fn write_i64(&mut self, value: i64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Appends an IEEE-754 f32, little-endian
    pub fn write_f32(&mut self, value: f32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Appends one byte, 1 for true and 0 for false
    pub fn write_bool(&mut self, value: bool) {
        self.buffer.push(value as u8);
    }

    /// Writes an i32 length followed by ASCII bytes. Non-ASCII characters
    /// are replaced with `?`.
    pub fn write_str(&mut self, value: &str) {
        let bytes: Vec<u8> = value
            .chars()
            .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
            .collect();
        self.write_i32(bytes.len() as i32);
        self.buffer.extend_from_slice(&bytes);
    }

    /// Appends x, y, z as three f32s
    pub fn write_vector3(&mut self, value: Vector3) {
        self.write_f32(value.x);
        self.write_f32(value.y);
        self.write_f32(value.z);
    }

    /// Appends x, y, z, w as four f32s
    pub fn write_quaternion(&mut self, value: Quaternion) {
        self.write_f32(value.x);
        self.write_f32(value.y);
        self.write_f32(value.z);
        self.write_f32(value.w);
    }

    // Readers

    fn take<const N: usize>(&mut self) -> Result<[u8; N], PacketError> {
        let remaining = self.unread_len();
        if remaining < N {
            return Err(PacketError::DecodeUnderrun {
                needed: N,
                remaining,
            });
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buffer[self.read_pos..self.read_pos + N]);
        self.read_pos += N;
        Ok(out)
    }

    /// Reads one byte
    pub fn read_u8(&mut self) -> Result<u8, PacketError> {
        self.take::<1>().map(|b| b[0])
    }

    /// Reads exactly `len` raw bytes.
    ///
    /// Fails with `DecodeUnderrun` without moving the cursor when fewer
    /// remain.
    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, PacketError> {
        let remaining = self.unread_len();
        if remaining < len {
            return Err(PacketError::DecodeUnderrun {
                needed: len,
                remaining,
            });
        }
        let out = self.buffer[self.read_pos..self.read_pos + len].to_vec();
        self.read_pos += len;
        Ok(out)
    }

    pub fn read_i16(&mut self) -> Result<i16, PacketError> {
        self.take().map(i16::from_le_bytes)
    }

    /// Reads a little-endian i32
    pub fn read_i32(&mut self) -> Result<i32, PacketError> {
        self.take().map(i32::from_le_bytes)
    }

    pub fn read_i64(&mut self) -> Result<i64, PacketError> {
        self.take().map(i64::from_le_bytes)
    }

    /// Reads a little-endian f32
    pub fn read_f32(&mut self) -> Result<f32, PacketError> {
        self.take().map(f32::from_le_bytes)
    }

    /// Reads one byte; any nonzero value is true
    pub fn read_bool(&mut self) -> Result<bool, PacketError> {
        self.read_u8().map(|b| b != 0)
    }

    /// Reads a length-prefixed ASCII string.
    ///
    /// On failure the cursor is left where it was before the call.
    pub fn read_string(&mut self) -> Result<String, PacketError> {
        let start = self.read_pos;
        let len = self.read_i32()?;
        if len < 0 {
            self.read_pos = start;
            return Err(PacketError::InvalidLength(len));
        }
        match self.read_bytes(len as usize) {
            Ok(bytes) => Ok(bytes
                .into_iter()
                .map(|b| if b.is_ascii() { b as char } else { '?' })
                .collect()),
            Err(e) => {
                self.read_pos = start;
                Err(e)
            }
        }
    }

    /// Reads three f32s as a vector. All 12 bytes must be present.
    pub fn read_vector3(&mut self) -> Result<Vector3, PacketError> {
        let raw: [u8; 12] = self.take()?;
        let f = |i: usize| f32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        Ok(Vector3::new(f(0), f(4), f(8)))
    }

    /// Reads four f32s in x, y, z, w order
    pub fn read_quaternion(&mut self) -> Result<Quaternion, PacketError> {
        let raw: [u8; 16] = self.take()?;
        let f = |i: usize| f32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        Ok(Quaternion::new(f(0), f(4), f(8), f(12)))
    }
}

/// A value with a fixed wire representation
pub trait WireValue: Sized {
    fn encode(&self, packet: &mut Packet);
    fn decode(packet: &mut Packet) -> Result<Self, PacketError>;
}

macro_rules! wire_value {
    ($ty:ty, $write:ident, $read:ident) => {
        impl WireValue for $ty {
            fn encode(&self, packet: &mut Packet) {
                packet.$write(*self);
            }

            fn decode(packet: &mut Packet) -> Result<Self, PacketError> {
                packet.$read()
            }
        }
    };
}

wire_value!(u8, write_u8, read_u8);
wire_value!(i16, write_i16, read_i16);
wire_value!(i32, write_i32, read_i32);
wire_value!(i64, write_i64, read_i64);
wire_value!(f32, write_f32, read_f32);
wire_value!(bool, write_bool, read_bool);
wire_value!(Vector3, write_vector3, read_vector3);
wire_value!(Quaternion, write_quaternion, read_quaternion);

impl WireValue for String {
    fn encode(&self, packet: &mut Packet) {
        packet.write_str(self);
    }

    fn decode(packet: &mut Packet) -> Result<Self, PacketError> {
        packet.read_string()
    }
}
