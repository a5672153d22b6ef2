//! Frame tracing for protocol diagnostics.

use myrtle_protocol::FrameHeader;
use std::collections::VecDeque;
use std::fmt::Write;
use std::time::Instant;

/// Bytes of each payload kept in the ring and dumped to the log.
pub const TRACE_PREVIEW_BYTES: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    fn arrow(self) -> &'static str {
        match self {
            Direction::Inbound => "<<",
            Direction::Outbound => ">>",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TracedFrame {
    pub direction: Direction,
    pub sequence: u8,
    /// Full payload length; `preview` may be shorter.
    pub length: usize,
    pub preview: Vec<u8>,
    pub at: Instant,
}

/// Bounded ring of the most recent frames.
#[derive(Debug)]
pub struct FrameTrace {
    frames: VecDeque<TracedFrame>,
    capacity: usize,
}

impl FrameTrace {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, direction: Direction, header: FrameHeader, payload: &[u8]) {
        let preview = &payload[..payload.len().min(TRACE_PREVIEW_BYTES)];
        tracing::trace!(
            "{} seq={} len={} {}",
            direction.arrow(),
            header.sequence,
            header.length,
            hex::encode(preview)
        );

        if self.frames.len() == self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(TracedFrame {
            direction,
            sequence: header.sequence,
            length: header.payload_len(),
            preview: preview.to_vec(),
            at: Instant::now(),
        });
    }

    /// Oldest first.
    pub fn frames(&self) -> impl Iterator<Item = &TracedFrame> {
        self.frames.iter()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    /// Renders the ring as one line per frame.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for frame in &self.frames {
            let _ = writeln!(
                out,
                "{} seq={:3} len={:8} {}{}",
                frame.direction.arrow(),
                frame.sequence,
                frame.length,
                hex::encode(&frame.preview),
                if frame.preview.len() < frame.length { "..." } else { "" }
            );
        }
        out
    }
}
