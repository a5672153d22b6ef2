//! Frame codec: reads and reassembles packets, seals and writes them.

use crate::error::ClientError;
use crate::trace::{Direction, FrameTrace};
use crate::transport::PacketChannel;
use bytes::BytesMut;
use myrtle_protocol::{
    seal_frame, ConnectionState, FrameHeader, Packet, FRAME_HEADER_SIZE, MAX_PACKET_LENGTH,
};

/// Chunk size used when discarding the rest of a rejected message.
const DRAIN_CHUNK: usize = 64 * 1024;

/// Frames packets over a [`PacketChannel`] and tracks their sequence numbers.
#[derive(Debug)]
pub struct FrameCodec {
    state: ConnectionState,
    trace: Option<FrameTrace>,
}

impl FrameCodec {
    pub fn new(state: ConnectionState, trace: Option<FrameTrace>) -> Self {
        Self { state, trace }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ConnectionState {
        &mut self.state
    }

    pub fn trace(&self) -> Option<&FrameTrace> {
        self.trace.as_ref()
    }

    /// Starts a new command exchange.
    pub fn reset(&mut self) {
        self.state.reset();
    }

    /// Accepts the next inbound sequence number without validation.
    pub fn restart_inbound(&mut self) {
        self.state.restart_inbound();
    }

    /// Reads one logical message into a fresh packet.
    pub async fn read_packet<C: PacketChannel>(&mut self, channel: &mut C) -> Result<Packet, ClientError> {
        let mut packet = Packet::new();
        self.read_into(channel, &mut packet).await?;
        Ok(packet)
    }

    /// Reads one logical message into `packet`, reusing its allocation.
    ///
    /// Continuation frames are appended until a frame shorter than the
    /// maximum length ends the message. The packet carries the sequence
    /// number of the last frame.
    pub async fn read_into<C: PacketChannel>(
        &mut self,
        channel: &mut C,
        packet: &mut Packet,
    ) -> Result<(), ClientError> {
        packet.clear();
        let max = self.state.max_allowed_packet();
        let mut total = 0usize;
        let mut frames = 0usize;

        loop {
            let header = self.read_header(channel).await?;
            self.state.accept_inbound(header.sequence)?;

            let len = header.payload_len();
            total += len;
            if total > max {
                tracing::warn!(size = total, max, "inbound message exceeds max_allowed_packet");
                self.drain(channel, len, header.is_continued()).await?;
                return Err(ClientError::PacketTooLarge { size: total, max });
            }

            if packet.try_reserve(len).is_err() {
                if let Err(e) = self.drain(channel, len, header.is_continued()).await {
                    tracing::debug!("drain after allocation failure failed: {}", e);
                }
                return Err(ClientError::OutOfMemory { size: total });
            }

            let start = packet.len();
            let read = channel.read_full(packet.extend_payload(len)).await?;
            if read < len {
                return Err(ClientError::TruncatedPayload {
                    expected: len,
                    read,
                });
            }

            if let Some(trace) = self.trace.as_mut() {
                trace.record(Direction::Inbound, header, &packet.payload()[start..]);
            }
            packet.set_sequence(header.sequence);
            frames += 1;

            if !header.is_continued() {
                break;
            }
        }

        packet.set_multi_packet(frames > 1);
        Ok(())
    }

    /// Seals and writes one outbound packet.
    ///
    /// `frame` must have been started with [`myrtle_protocol::begin_frame`].
    /// Oversized payloads are rejected before anything reaches the channel.
    pub async fn write_packet<C: PacketChannel>(
        &mut self,
        channel: &mut C,
        frame: &mut BytesMut,
    ) -> Result<(), ClientError> {
        let size = frame.len().saturating_sub(FRAME_HEADER_SIZE);
        let max = self.state.max_allowed_packet();
        if size > max {
            return Err(ClientError::PacketTooLarge { size, max });
        }
        if size >= MAX_PACKET_LENGTH {
            return Err(ClientError::PacketTooLarge {
                size,
                max: MAX_PACKET_LENGTH - 1,
            });
        }

        let sequence = self.state.next_outbound();
        seal_frame(frame, sequence)?;

        channel.write_frame(frame).await?;
        channel.flush().await?;

        if let Some(trace) = self.trace.as_mut() {
            trace.record(
                Direction::Outbound,
                FrameHeader::new(size as u32, sequence),
                &frame[FRAME_HEADER_SIZE..],
            );
        }
        Ok(())
    }

    async fn read_header<C: PacketChannel>(&mut self, channel: &mut C) -> Result<FrameHeader, ClientError> {
        let mut raw = [0u8; FRAME_HEADER_SIZE];
        let read = channel.read_full(&mut raw).await?;
        if read < FRAME_HEADER_SIZE {
            return Err(ClientError::TruncatedHeader { read });
        }
        Ok(FrameHeader::decode(&raw))
    }

    /// Discards `remaining` payload bytes of the current frame and any
    /// continuation frames after it.
    async fn drain<C: PacketChannel>(
        &mut self,
        channel: &mut C,
        mut remaining: usize,
        mut continued: bool,
    ) -> Result<(), ClientError> {
        let mut scratch = vec![0u8; remaining.min(DRAIN_CHUNK)];
        loop {
            while remaining > 0 {
                let n = remaining.min(scratch.len());
                let read = channel.read_full(&mut scratch[..n]).await?;
                if read < n {
                    return Err(ClientError::TruncatedPayload {
                        expected: remaining,
                        read,
                    });
                }
                remaining -= n;
            }
            if !continued {
                return Ok(());
            }

            let header = self.read_header(channel).await?;
            self.state.accept_inbound(header.sequence)?;
            remaining = header.payload_len();
            continued = header.is_continued();
            if scratch.len() < remaining.min(DRAIN_CHUNK) {
                scratch.resize(remaining.min(DRAIN_CHUNK), 0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::Socket;
    use bytes::BufMut;
    use myrtle_protocol::{begin_frame, DEFAULT_MAX_ALLOWED_PACKET};
    use proptest::prelude::*;
    use tokio_test::io::Builder;

    fn codec(max: usize) -> FrameCodec {
        FrameCodec::new(ConnectionState::new(true, max), None)
    }

    fn frame(sequence: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = FrameHeader::new(payload.len() as u32, sequence).encode().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[tokio::test]
    async fn test_command_cycle() {
        let mock = Builder::new()
            .write(&frame(0, b"\x03SELECT 1"))
            .read(&frame(1, b"\x00\x00\x00\x02\x00\x00\x00"))
            .build();
        let mut channel = Socket::new(mock, None);
        let mut codec = codec(DEFAULT_MAX_ALLOWED_PACKET);

        let mut buf = BytesMut::new();
        begin_frame(&mut buf);
        buf.put_u8(0x03);
        buf.put_slice(b"SELECT 1");
        codec.write_packet(&mut channel, &mut buf).await.unwrap();

        let packet = codec.read_packet(&mut channel).await.unwrap();
        assert_eq!(packet.sequence(), 1);
        assert_eq!(packet.position(), 0);
        assert_eq!(packet.payload(), b"\x00\x00\x00\x02\x00\x00\x00");
        assert!(!packet.is_multi_packet());
    }

    #[tokio::test]
    async fn test_multi_packet_reassembly() {
        let first = vec![0x5Au8; MAX_PACKET_LENGTH];
        let mut second = vec![0xA5u8; MAX_PACKET_LENGTH];
        second[0] = 0x01;
        second[MAX_PACKET_LENGTH - 1] = 0x02;
        let mock = Builder::new()
            .read(&frame(0, &first))
            .read(&frame(1, &second))
            .read(&frame(2, b""))
            .build();
        let mut channel = Socket::new(mock, None);
        let mut codec = codec(usize::MAX);

        let packet = codec.read_packet(&mut channel).await.unwrap();
        assert_eq!(packet.len(), 2 * MAX_PACKET_LENGTH);
        assert!(packet.is_multi_packet());
        assert_eq!(packet.sequence(), 2);

        let (head, tail) = packet.payload().split_at(MAX_PACKET_LENGTH);
        assert!(head == &first[..], "first fragment out of place");
        assert!(tail == &second[..], "second fragment out of place");
    }

    #[tokio::test]
    async fn test_multi_packet_with_short_tail() {
        let first = vec![0x11u8; MAX_PACKET_LENGTH];
        let mock = Builder::new()
            .read(&frame(7, &first))
            .read(&frame(8, b"tail"))
            .build();
        let mut channel = Socket::new(mock, None);
        let mut codec = codec(usize::MAX);
        for _ in 0..7 {
            codec.state_mut().next_outbound();
        }

        let packet = codec.read_packet(&mut channel).await.unwrap();
        assert_eq!(packet.len(), MAX_PACKET_LENGTH + 4);
        assert!(packet.payload()[..MAX_PACKET_LENGTH].iter().all(|&b| b == 0x11));
        assert_eq!(&packet.payload()[MAX_PACKET_LENGTH..], b"tail");
        assert_eq!(packet.sequence(), 8);
    }

    #[tokio::test]
    async fn test_fragment_out_of_sequence() {
        let fragment = vec![0u8; MAX_PACKET_LENGTH];
        let mock = Builder::new()
            .read(&frame(0, &fragment))
            .read(&frame(5, b""))
            .build();
        let mut channel = Socket::new(mock, None);
        let mut codec = codec(usize::MAX);

        let err = codec.read_packet(&mut channel).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::SequenceError {
                expected: 1,
                actual: 5
            }
        ));
    }

    #[tokio::test]
    async fn test_truncated_header() {
        let mock = Builder::new().read(&[0x05, 0x00]).build();
        let mut channel = Socket::new(mock, None);

        let err = codec(1024).read_packet(&mut channel).await.unwrap_err();
        assert!(matches!(err, ClientError::TruncatedHeader { read: 2 }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_truncated_payload() {
        let mock = Builder::new().read(&[0x0A, 0x00, 0x00, 0x00, 1, 2, 3]).build();
        let mut channel = Socket::new(mock, None);

        let err = codec(1024).read_packet(&mut channel).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::TruncatedPayload {
                expected: 10,
                read: 3
            }
        ));
    }

    #[tokio::test]
    async fn test_oversized_read_drains_message() {
        let mock = Builder::new()
            .read(&frame(0, &[0xEE; 2000]))
            .read(&frame(0, b"\x00\x00\x00\x02\x00\x00\x00"))
            .build();
        let mut channel = Socket::new(mock, None);
        let mut codec = codec(1024);

        let err = codec.read_packet(&mut channel).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::PacketTooLarge {
                size: 2000,
                max: 1024
            }
        ));
        assert!(!err.is_fatal());

        // Stream is still aligned on the next message.
        codec.reset();
        let packet = codec.read_packet(&mut channel).await.unwrap();
        assert_eq!(packet.len(), 7);
    }

    #[tokio::test]
    async fn test_oversized_write_rejected_before_io() {
        let mock = Builder::new().build();
        let mut channel = Socket::new(mock, None);
        let mut codec = codec(1024);

        let mut buf = BytesMut::new();
        begin_frame(&mut buf);
        buf.put_slice(&[0u8; 2000]);

        let err = codec.write_packet(&mut channel, &mut buf).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::PacketTooLarge {
                size: 2000,
                max: 1024
            }
        ));
        assert_eq!(codec.state().send_seq(), 0xFF);
        assert!(channel.activity().since_last_send().is_none());
    }

    #[tokio::test]
    async fn test_write_never_splits() {
        let mock = Builder::new().build();
        let mut channel = Socket::new(mock, None);
        let mut codec = codec(usize::MAX);

        let mut buf = BytesMut::zeroed(FRAME_HEADER_SIZE + MAX_PACKET_LENGTH);
        let err = codec.write_packet(&mut channel, &mut buf).await.unwrap_err();
        assert!(matches!(err, ClientError::PacketTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_read_into_reuses_buffer() {
        let mock = Builder::new()
            .read(&frame(1, b"first response"))
            .read(&frame(0, b"ok"))
            .build();
        let mut channel = Socket::new(mock, None);
        let mut codec = codec(1024);
        codec.state_mut().next_outbound();

        let mut packet = Packet::with_capacity(64);
        codec.read_into(&mut channel, &mut packet).await.unwrap();
        assert_eq!(packet.payload(), b"first response");
        let capacity = packet.capacity();

        codec.reset();
        codec.read_into(&mut channel, &mut packet).await.unwrap();
        assert_eq!(packet.payload(), b"ok");
        assert_eq!(packet.capacity(), capacity);
    }

    /// Writes `payload` with `sequence` through one codec and reads it back
    /// through another over an in-memory pipe.
    async fn round_trip(payload: &[u8], sequence: u8) -> Packet {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut writer_channel = Socket::new(client, None);
        let mut reader_channel = Socket::new(server, None);
        let mut writer = codec(usize::MAX);
        let mut reader = codec(usize::MAX);
        for _ in 0..sequence {
            writer.state_mut().next_outbound();
            reader.state_mut().next_outbound();
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
        begin_frame(&mut buf);
        buf.put_slice(payload);

        let (written, read) = tokio::join!(
            writer.write_packet(&mut writer_channel, &mut buf),
            reader.read_packet(&mut reader_channel)
        );
        written.unwrap();
        read.unwrap()
    }

    #[tokio::test]
    async fn test_largest_single_frame_round_trip() {
        let payload: Vec<u8> = (0..MAX_PACKET_LENGTH - 1).map(|i| (i % 251) as u8).collect();
        let packet = round_trip(&payload, 0xFE).await;
        assert!(packet.payload() == &payload[..]);
        assert_eq!(packet.sequence(), 0xFE);
        assert!(!packet.is_multi_packet());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn payload_roundtrip(
            payload in prop::collection::vec(any::<u8>(), 0..70_000),
            sequence in any::<u8>(),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let packet = rt.block_on(round_trip(&payload, sequence));
            prop_assert_eq!(packet.payload(), &payload[..]);
            prop_assert_eq!(packet.sequence(), sequence);
            prop_assert_eq!(packet.position(), 0);
        }
    }

    #[tokio::test]
    async fn test_trace_records_both_directions() {
        let mock = Builder::new()
            .write(&frame(0, b"\x0e"))
            .read(&frame(1, b"\x00\x00\x00\x02\x00\x00\x00"))
            .build();
        let mut channel = Socket::new(mock, None);
        let mut codec = FrameCodec::new(ConnectionState::default(), Some(FrameTrace::new(8)));

        let mut buf = BytesMut::new();
        begin_frame(&mut buf);
        buf.put_u8(0x0e);
        codec.write_packet(&mut channel, &mut buf).await.unwrap();
        codec.read_packet(&mut channel).await.unwrap();

        let trace = codec.trace().unwrap();
        let directions: Vec<_> = trace.frames().map(|f| f.direction).collect();
        assert_eq!(directions, vec![Direction::Outbound, Direction::Inbound]);
    }
}
