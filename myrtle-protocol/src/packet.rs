//! Reusable packet buffers.
//!
//! A [`Packet`] holds one logical message payload followed by a single zero
//! byte that is not part of the payload. The sentinel lets
//! [`Packet::read_null_terminated`] scan without a separate bounds check.

use crate::error::ProtocolError;
use bytes::{BufMut, BytesMut};
use std::collections::TryReserveError;

/// Default capacity of freshly allocated send/receive buffers (8 KiB).
pub const DEFAULT_BUFFER_CAPACITY: usize = 8 * 1024;

/// Buffers that grew beyond this are replaced on the next checkout (1 MiB).
pub const DEFAULT_RECLAIM_THRESHOLD: usize = 1024 * 1024;

/// One logical protocol message.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Payload plus trailing sentinel; `buf.len() == len + 1` at all times.
    buf: Vec<u8>,
    len: usize,
    pos: usize,
    sequence: u8,
    multi_packet: bool,
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

impl Packet {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let mut buf = Vec::with_capacity(capacity + 1);
        buf.push(0);
        Self {
            buf,
            len: 0,
            pos: 0,
            sequence: 0,
            multi_packet: false,
        }
    }

    /// Builds a packet holding a copy of `payload`.
    pub fn from_payload(payload: &[u8], sequence: u8) -> Self {
        let mut packet = Self::with_capacity(payload.len());
        packet.extend_payload(payload.len()).copy_from_slice(payload);
        packet.sequence = sequence;
        packet
    }

    /// Empties the packet, keeping its allocation.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.buf.push(0);
        self.len = 0;
        self.pos = 0;
        self.sequence = 0;
        self.multi_packet = false;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Allocated capacity of the underlying buffer.
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    pub fn set_sequence(&mut self, sequence: u8) {
        self.sequence = sequence;
    }

    /// Whether the payload was reassembled from more than one frame.
    pub fn is_multi_packet(&self) -> bool {
        self.multi_packet
    }

    pub fn set_multi_packet(&mut self, multi_packet: bool) {
        self.multi_packet = multi_packet;
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Makes room for `additional` payload bytes (plus the sentinel).
    ///
    /// Reports allocation failure instead of aborting so the caller can drain
    /// the stream before giving up on the message.
    pub fn try_reserve(&mut self, additional: usize) -> Result<(), TryReserveError> {
        let needed = self.len + additional + 1;
        if needed > self.buf.capacity() {
            self.buf.try_reserve(needed - self.buf.len())?;
        }
        Ok(())
    }

    /// Grows the payload by `n` zeroed bytes and returns them for filling.
    pub fn extend_payload(&mut self, n: usize) -> &mut [u8] {
        let start = self.len;
        self.len += n;
        self.buf.resize(self.len + 1, 0);
        &mut self.buf[start..self.len]
    }

    // =========================================================================
    // Read cursor
    // =========================================================================

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn set_position(&mut self, pos: usize) {
        self.pos = pos.min(self.len);
    }

    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    pub fn remaining(&self) -> usize {
        self.len - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&[u8], ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::UnexpectedEnd {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let start = self.pos;
        self.pos += n;
        Ok(&self.buf[start..start + n])
    }

    pub fn peek_u8(&self) -> Option<u8> {
        (self.pos < self.len).then(|| self.buf[self.pos])
    }

    pub fn skip(&mut self, n: usize) -> Result<(), ProtocolError> {
        self.take(n).map(|_| ())
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16, ProtocolError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u24_le(&mut self) -> Result<u32, ProtocolError> {
        let b = self.take(3)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], 0]))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, ProtocolError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64_le(&mut self) -> Result<u64, ProtocolError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    /// Reads a length-encoded integer.
    pub fn read_lenenc_int(&mut self) -> Result<u64, ProtocolError> {
        match self.read_u8()? {
            n @ 0x00..=0xFA => Ok(n as u64),
            0xFB => Err(ProtocolError::Malformed(
                "NULL marker where an integer was expected".to_string(),
            )),
            0xFC => Ok(self.read_u16_le()? as u64),
            0xFD => Ok(self.read_u24_le()? as u64),
            0xFE => self.read_u64_le(),
            0xFF => Err(ProtocolError::Malformed(
                "invalid length-encoded integer prefix 0xff".to_string(),
            )),
        }
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&[u8], ProtocolError> {
        self.take(n)
    }

    /// Reads up to the next NUL (or the end of the payload) and skips the NUL.
    pub fn read_null_terminated(&mut self) -> &[u8] {
        let start = self.pos;
        // The sentinel guarantees a zero at index `len`.
        let end = start
            + self.buf[start..]
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(self.len - start);
        self.pos = (end + 1).min(self.len);
        &self.buf[start..end]
    }

    /// Reads everything left in the payload.
    pub fn read_rest(&mut self) -> &[u8] {
        let start = self.pos;
        self.pos = self.len;
        &self.buf[start..self.len]
    }
}

/// Appends a length-encoded integer.
pub fn put_lenenc_int(buf: &mut BytesMut, value: u64) {
    match value {
        0..=0xFA => buf.put_u8(value as u8),
        0xFB..=0xFFFF => {
            buf.put_u8(0xFC);
            buf.put_u16_le(value as u16);
        }
        0x1_0000..=0xFF_FFFF => {
            buf.put_u8(0xFD);
            buf.put_slice(&(value as u32).to_le_bytes()[..3]);
        }
        _ => {
            buf.put_u8(0xFE);
            buf.put_u64_le(value);
        }
    }
}

/// Appends a NUL-terminated string.
pub fn put_null_terminated(buf: &mut BytesMut, value: &[u8]) {
    buf.put_slice(value);
    buf.put_u8(0);
}

/// The connection's send and receive buffers.
///
/// Both are reused across commands. A buffer that grew past the reclaim
/// threshold is swapped for a fresh default-sized one at checkout so one
/// large result does not pin memory for the life of the connection.
#[derive(Debug)]
pub struct PacketBuffers {
    send: BytesMut,
    recv: Packet,
    default_capacity: usize,
    reclaim_threshold: usize,
}

impl Default for PacketBuffers {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY, DEFAULT_RECLAIM_THRESHOLD)
    }
}

impl PacketBuffers {
    pub fn new(default_capacity: usize, reclaim_threshold: usize) -> Self {
        Self {
            send: BytesMut::with_capacity(default_capacity),
            recv: Packet::with_capacity(default_capacity),
            default_capacity,
            reclaim_threshold: reclaim_threshold.max(default_capacity),
        }
    }

    /// Returns the cleared send buffer.
    pub fn checkout_send(&mut self) -> &mut BytesMut {
        if self.send.capacity() > self.reclaim_threshold {
            self.send = BytesMut::with_capacity(self.default_capacity);
        } else {
            self.send.clear();
        }
        &mut self.send
    }

    /// Returns the cleared receive packet.
    pub fn checkout_recv(&mut self) -> &mut Packet {
        if self.recv.capacity() > self.reclaim_threshold {
            self.recv = Packet::with_capacity(self.default_capacity);
        } else {
            self.recv.clear();
        }
        &mut self.recv
    }

    /// The last packet read into the receive buffer.
    pub fn recv(&self) -> &Packet {
        &self.recv
    }

    pub fn recv_mut(&mut self) -> &mut Packet {
        &mut self.recv
    }
}
