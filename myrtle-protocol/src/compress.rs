//! Compressed packet framing.
//!
//! With compression negotiated, the logical frame stream is cut into chunks
//! and each chunk travels inside a compressed packet:
//!
//! ```text
//! +-------------------+----------+---------------------+---------+
//! | compressed_length | sequence | uncompressed_length | payload |
//! | 3 bytes (LE)      | 1 byte   | 3 bytes (LE)        |         |
//! +-------------------+----------+---------------------+---------+
//! ```
//!
//! An uncompressed length of 0 means the payload is stored as-is.

use crate::error::ProtocolError;
use crate::MAX_PACKET_LENGTH;
use bytes::{BufMut, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{self, Read, Write};

/// Size of the compressed packet header in bytes.
pub const COMPRESSED_HEADER_SIZE: usize = 7;

/// Chunks at or below this many bytes are sent uncompressed.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressedHeader {
    /// Length of the payload as it appears on the wire.
    pub compressed_length: u32,
    pub sequence: u8,
    /// Inflated length, or 0 when the payload is stored raw.
    pub uncompressed_length: u32,
}

impl CompressedHeader {
    pub fn encode(&self) -> [u8; COMPRESSED_HEADER_SIZE] {
        let c = self.compressed_length.to_le_bytes();
        let u = self.uncompressed_length.to_le_bytes();
        [c[0], c[1], c[2], self.sequence, u[0], u[1], u[2]]
    }

    pub fn decode(raw: &[u8; COMPRESSED_HEADER_SIZE]) -> Self {
        Self {
            compressed_length: u32::from_le_bytes([raw[0], raw[1], raw[2], 0]),
            sequence: raw[3],
            uncompressed_length: u32::from_le_bytes([raw[4], raw[5], raw[6], 0]),
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.uncompressed_length != 0
    }

    /// Number of logical bytes this packet yields once unpacked.
    pub fn logical_len(&self) -> usize {
        if self.is_compressed() {
            self.uncompressed_length as usize
        } else {
            self.compressed_length as usize
        }
    }
}

/// Appends one compressed packet carrying `chunk` to `out`.
///
/// Chunks above `threshold` are deflated; the raw form is kept when deflating
/// does not make the chunk smaller.
pub fn encode_compressed(
    out: &mut BytesMut,
    chunk: &[u8],
    sequence: u8,
    threshold: usize,
) -> Result<(), ProtocolError> {
    if chunk.len() > MAX_PACKET_LENGTH {
        return Err(ProtocolError::PacketTooLarge {
            size: chunk.len(),
            max: MAX_PACKET_LENGTH,
        });
    }

    if chunk.len() > threshold {
        let deflated = deflate(chunk)?;
        if deflated.len() < chunk.len() {
            let header = CompressedHeader {
                compressed_length: deflated.len() as u32,
                sequence,
                uncompressed_length: chunk.len() as u32,
            };
            out.reserve(COMPRESSED_HEADER_SIZE + deflated.len());
            out.put_slice(&header.encode());
            out.put_slice(&deflated);
            return Ok(());
        }
    }

    let header = CompressedHeader {
        compressed_length: chunk.len() as u32,
        sequence,
        uncompressed_length: 0,
    };
    out.reserve(COMPRESSED_HEADER_SIZE + chunk.len());
    out.put_slice(&header.encode());
    out.put_slice(chunk);
    Ok(())
}

fn deflate(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Inflates `compressed` onto the end of `out`.
///
/// The inflated size must match `expected` exactly.
pub fn inflate(compressed: &[u8], expected: usize, out: &mut BytesMut) -> Result<(), ProtocolError> {
    let start = out.len();
    out.reserve(expected);

    // One byte of slack so an oversized stream is detected without
    // inflating all of it.
    let mut decoder = ZlibDecoder::new(compressed).take(expected as u64 + 1);
    let result = io::copy(&mut decoder, &mut (&mut *out).writer());

    let actual = out.len() - start;
    if let Err(e) = result {
        out.truncate(start);
        return Err(ProtocolError::Zlib(e));
    }
    if actual != expected {
        out.truncate(start);
        return Err(ProtocolError::DecompressedSize { expected, actual });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = CompressedHeader {
            compressed_length: 0x000102,
            sequence: 4,
            uncompressed_length: 0x030405,
        };
        let raw = header.encode();
        assert_eq!(raw, [0x02, 0x01, 0x00, 0x04, 0x05, 0x04, 0x03]);
        assert_eq!(CompressedHeader::decode(&raw), header);
        assert_eq!(header.logical_len(), 0x030405);
    }

    #[test]
    fn test_small_payload_stored_raw() {
        let mut out = BytesMut::new();
        encode_compressed(&mut out, b"0123456789", 0, DEFAULT_COMPRESSION_THRESHOLD).unwrap();

        assert_eq!(out.len(), COMPRESSED_HEADER_SIZE + 10);
        let mut raw = [0u8; COMPRESSED_HEADER_SIZE];
        raw.copy_from_slice(&out[..COMPRESSED_HEADER_SIZE]);
        let header = CompressedHeader::decode(&raw);
        assert_eq!(header.compressed_length, 10);
        assert_eq!(header.uncompressed_length, 0);
        assert!(!header.is_compressed());
        assert_eq!(&out[COMPRESSED_HEADER_SIZE..], b"0123456789");
    }

    #[test]
    fn test_large_payload_compressed() {
        let payload = vec![b'a'; 10_000];
        let mut out = BytesMut::new();
        encode_compressed(&mut out, &payload, 3, DEFAULT_COMPRESSION_THRESHOLD).unwrap();

        let mut raw = [0u8; COMPRESSED_HEADER_SIZE];
        raw.copy_from_slice(&out[..COMPRESSED_HEADER_SIZE]);
        let header = CompressedHeader::decode(&raw);
        assert_eq!(header.sequence, 3);
        assert_eq!(header.uncompressed_length, 10_000);
        assert!((header.compressed_length as usize) < payload.len());
        assert_eq!(out.len(), COMPRESSED_HEADER_SIZE + header.compressed_length as usize);

        let mut inflated = BytesMut::new();
        inflate(&out[COMPRESSED_HEADER_SIZE..], 10_000, &mut inflated).unwrap();
        assert_eq!(&inflated[..], &payload[..]);
    }

    #[test]
    fn test_incompressible_payload_stays_raw() {
        // A short run of distinct bytes grows under zlib.
        let payload: Vec<u8> = (0..64u8).collect();
        let mut out = BytesMut::new();
        encode_compressed(&mut out, &payload, 0, 50).unwrap();
        assert_eq!(&out[4..7], &[0, 0, 0]);
        assert_eq!(&out[COMPRESSED_HEADER_SIZE..], &payload[..]);
    }

    #[test]
    fn test_inflate_size_mismatch() {
        let deflated = deflate(&[7u8; 500]).unwrap();

        let mut out = BytesMut::from(&b"keep"[..]);
        let err = inflate(&deflated, 400, &mut out).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::DecompressedSize {
                expected: 400,
                actual: 401
            }
        ));
        assert_eq!(&out[..], b"keep");

        let err = inflate(&deflated, 600, &mut out).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::DecompressedSize {
                expected: 600,
                actual: 500
            }
        ));
    }

    #[test]
    fn test_inflate_garbage() {
        let mut out = BytesMut::new();
        let err = inflate(b"definitely not zlib", 10, &mut out).unwrap_err();
        assert!(matches!(err, ProtocolError::Zlib(_)));
        assert!(out.is_empty());
    }
}
