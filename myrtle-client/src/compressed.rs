//! Compressed packet framing layered over another channel.

use crate::error::ClientError;
use crate::transport::{Activity, PacketChannel};
use bytes::{Buf, BytesMut};
use myrtle_protocol::compress::{encode_compressed, inflate};
use myrtle_protocol::{CompressedHeader, COMPRESSED_HEADER_SIZE, MAX_PACKET_LENGTH};
use std::io;

/// Wraps every outbound frame in a compressed packet and unpacks inbound
/// compressed packets into a buffer of logical bytes.
///
/// Compressed packets carry their own sequence number, independent of the
/// logical frames inside them.
#[derive(Debug)]
pub struct Compressed<C> {
    inner: C,
    sequence: u8,
    check_sequence: bool,
    threshold: usize,
    /// Logical bytes unpacked but not yet handed out.
    inbound: BytesMut,
    outbound: BytesMut,
    scratch: Vec<u8>,
}

impl<C> Compressed<C> {
    pub fn new(inner: C, threshold: usize, check_sequence: bool) -> Self {
        Self {
            inner,
            sequence: 0xFF,
            check_sequence,
            threshold,
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            scratch: Vec::new(),
        }
    }

    pub fn get_ref(&self) -> &C {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut C {
        &mut self.inner
    }

    pub fn into_inner(self) -> C {
        self.inner
    }

    /// Logical bytes buffered ahead of the reader.
    pub fn buffered(&self) -> usize {
        self.inbound.len()
    }
}

impl<C: PacketChannel> Compressed<C> {
    fn corrupt(&self, msg: String) -> ClientError {
        ClientError::communication(io::Error::new(io::ErrorKind::InvalidData, msg), self.inner.activity())
    }

    /// Reads one compressed packet into the inbound buffer.
    ///
    /// Returns `false` at a clean end of stream.
    async fn fill(&mut self) -> Result<bool, ClientError> {
        let mut raw = [0u8; COMPRESSED_HEADER_SIZE];
        let read = self.inner.read_full(&mut raw).await?;
        if read == 0 {
            return Ok(false);
        }
        if read < COMPRESSED_HEADER_SIZE {
            return Err(ClientError::communication(
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("compressed header truncated after {} bytes", read),
                ),
                self.inner.activity(),
            ));
        }

        let header = CompressedHeader::decode(&raw);
        let expected = self.sequence.wrapping_add(1);
        if self.check_sequence && header.sequence != expected {
            return Err(ClientError::SequenceError {
                expected,
                actual: header.sequence,
            });
        }
        self.sequence = header.sequence;

        let len = header.compressed_length as usize;
        self.scratch.clear();
        self.scratch.resize(len, 0);
        let read = self.inner.read_full(&mut self.scratch).await?;
        if read < len {
            return Err(ClientError::communication(
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("compressed payload truncated: {} of {} bytes", read, len),
                ),
                self.inner.activity(),
            ));
        }

        if header.is_compressed() {
            let expected = header.uncompressed_length as usize;
            if let Err(e) = inflate(&self.scratch, expected, &mut self.inbound) {
                return Err(self.corrupt(e.to_string()));
            }
        } else {
            self.inbound.extend_from_slice(&self.scratch);
        }

        tracing::trace!(
            sequence = header.sequence,
            compressed = header.compressed_length,
            uncompressed = header.uncompressed_length,
            "read compressed packet"
        );
        Ok(true)
    }
}

impl<C: PacketChannel> PacketChannel for Compressed<C> {
    async fn read_full(&mut self, buf: &mut [u8]) -> Result<usize, ClientError> {
        let mut filled = 0;
        while filled < buf.len() {
            if self.inbound.is_empty() {
                if !self.fill().await? {
                    break;
                }
                continue;
            }
            let n = self.inbound.len().min(buf.len() - filled);
            buf[filled..filled + n].copy_from_slice(&self.inbound[..n]);
            self.inbound.advance(n);
            filled += n;
        }
        Ok(filled)
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), ClientError> {
        self.outbound.clear();
        for chunk in frame.chunks(MAX_PACKET_LENGTH) {
            self.sequence = self.sequence.wrapping_add(1);
            encode_compressed(&mut self.outbound, chunk, self.sequence, self.threshold)?;
        }
        self.inner.write_frame(&self.outbound).await
    }

    async fn flush(&mut self) -> Result<(), ClientError> {
        self.inner.flush().await
    }

    fn reset_sequence(&mut self) {
        self.sequence = 0xFF;
        self.inner.reset_sequence();
    }

    fn activity(&self) -> Activity {
        self.inner.activity()
    }
}
