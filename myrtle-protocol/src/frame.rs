//! Packet frame format.
//!
//! Every message on the wire is carried in one or more frames:
//!
//! ```text
//! +----------------+----------+---------------------+
//! | payload_length | sequence | payload             |
//! | 3 bytes (LE)   | 1 byte   | payload_length bytes|
//! +----------------+----------+---------------------+
//! ```
//!
//! A frame whose length is exactly [`MAX_PACKET_LENGTH`] is followed by a
//! continuation frame; the message ends at the first shorter frame (which may
//! be empty).

use crate::error::ProtocolError;
use crate::MAX_PACKET_LENGTH;
use bytes::{BufMut, BytesMut};

/// Size of the frame header in bytes (3 length + 1 sequence).
pub const FRAME_HEADER_SIZE: usize = 4;

/// A decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Payload length (24 bits).
    pub length: u32,
    /// Sequence number of this frame.
    pub sequence: u8,
}

impl FrameHeader {
    pub fn new(length: u32, sequence: u8) -> Self {
        Self {
            length: length & 0xFF_FFFF,
            sequence,
        }
    }

    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let len = self.length.to_le_bytes();
        [len[0], len[1], len[2], self.sequence]
    }

    pub fn decode(raw: &[u8; FRAME_HEADER_SIZE]) -> Self {
        Self {
            length: u32::from_le_bytes([raw[0], raw[1], raw[2], 0]),
            sequence: raw[3],
        }
    }

    pub fn payload_len(&self) -> usize {
        self.length as usize
    }

    /// A full-length frame means the message continues in the next frame.
    pub fn is_continued(&self) -> bool {
        self.payload_len() == MAX_PACKET_LENGTH
    }
}

/// Reserves the header slot at the start of an outbound frame.
///
/// The payload is appended after this call and the header filled in by
/// [`seal_frame`] once the sequence number is known.
pub fn begin_frame(buf: &mut BytesMut) {
    buf.put_slice(&[0u8; FRAME_HEADER_SIZE]);
}

/// Writes the header of a frame built with [`begin_frame`].
///
/// Returns the payload length. Payloads that would need a continuation frame
/// are rejected; outbound packets are never split.
pub fn seal_frame(frame: &mut [u8], sequence: u8) -> Result<usize, ProtocolError> {
    if frame.len() < FRAME_HEADER_SIZE {
        return Err(ProtocolError::Malformed(format!(
            "frame of {} bytes has no room for a header",
            frame.len()
        )));
    }

    let payload_len = frame.len() - FRAME_HEADER_SIZE;
    if payload_len >= MAX_PACKET_LENGTH {
        return Err(ProtocolError::PacketTooLarge {
            size: payload_len,
            max: MAX_PACKET_LENGTH - 1,
        });
    }

    let header = FrameHeader::new(payload_len as u32, sequence).encode();
    frame[..FRAME_HEADER_SIZE].copy_from_slice(&header);
    Ok(payload_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_header_layout() {
        let header = FrameHeader::new(0x0A0B0C, 7);
        assert_eq!(header.encode(), [0x0C, 0x0B, 0x0A, 0x07]);
        assert_eq!(FrameHeader::decode(&[0x0C, 0x0B, 0x0A, 0x07]), header);
    }

    #[test]
    fn test_continuation_boundary() {
        assert!(FrameHeader::new(0xFF_FFFF, 0).is_continued());
        assert!(!FrameHeader::new(0xFF_FFFE, 0).is_continued());
        assert!(!FrameHeader::new(0, 1).is_continued());
    }

    #[test]
    fn test_seal_query_frame() {
        let mut buf = BytesMut::new();
        begin_frame(&mut buf);
        buf.put_u8(0x03);
        buf.put_slice(b"SELECT 1");

        let len = seal_frame(&mut buf, 0).unwrap();
        assert_eq!(len, 9);
        assert_eq!(&buf[..4], &[0x09, 0x00, 0x00, 0x00]);
        assert_eq!(&buf[4..], b"\x03SELECT 1");
    }

    #[test]
    fn test_seal_empty_payload() {
        let mut buf = BytesMut::new();
        begin_frame(&mut buf);
        assert_eq!(seal_frame(&mut buf, 3).unwrap(), 0);
        assert_eq!(&buf[..], &[0x00, 0x00, 0x00, 0x03]);
    }

    #[test]
    fn test_seal_rejects_continuation_sized_payload() {
        let mut buf = vec![0u8; FRAME_HEADER_SIZE + MAX_PACKET_LENGTH];
        let result = seal_frame(&mut buf, 0);
        assert!(matches!(
            result,
            Err(ProtocolError::PacketTooLarge {
                size: MAX_PACKET_LENGTH,
                ..
            })
        ));
        // Header slot left untouched.
        assert_eq!(&buf[..4], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_seal_without_header_slot() {
        let mut buf = [0u8; 2];
        assert!(matches!(
            seal_frame(&mut buf, 0),
            Err(ProtocolError::Malformed(_))
        ));
    }

    proptest! {
        #[test]
        fn header_roundtrip(length in 0u32..=0xFF_FFFF, sequence in any::<u8>()) {
            let header = FrameHeader::new(length, sequence);
            prop_assert_eq!(FrameHeader::decode(&header.encode()), header);
        }
    }
}
