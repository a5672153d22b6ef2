//! Per-connection sequence-number bookkeeping.
//!
//! Both counters start at 255 so the first packet of an exchange carries 0.
//! Sequence arithmetic is plain `u8` wrapping: 127 is followed by 128 and
//! 255 by 0.

use crate::error::ProtocolError;
use crate::DEFAULT_MAX_ALLOWED_PACKET;

#[derive(Debug, Clone)]
pub struct ConnectionState {
    send_seq: u8,
    recv_seq: u8,
    check_sequence: bool,
    sequence_reset: bool,
    compression: bool,
    max_allowed_packet: usize,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new(true, DEFAULT_MAX_ALLOWED_PACKET)
    }
}

impl ConnectionState {
    pub fn new(check_sequence: bool, max_allowed_packet: usize) -> Self {
        Self {
            send_seq: 0xFF,
            recv_seq: 0xFF,
            check_sequence,
            sequence_reset: false,
            compression: false,
            max_allowed_packet,
        }
    }

    /// Largest message accepted in either direction.
    pub fn max_allowed_packet(&self) -> usize {
        self.max_allowed_packet
    }

    pub fn set_max_allowed_packet(&mut self, max: usize) {
        self.max_allowed_packet = max;
    }

    pub fn compression(&self) -> bool {
        self.compression
    }

    pub fn set_compression(&mut self, enabled: bool) {
        self.compression = enabled;
    }

    /// Last sequence number sent.
    pub fn send_seq(&self) -> u8 {
        self.send_seq
    }

    /// Last sequence number received.
    pub fn recv_seq(&self) -> u8 {
        self.recv_seq
    }

    pub fn check_sequence(&self) -> bool {
        self.check_sequence
    }

    pub fn set_check_sequence(&mut self, enabled: bool) {
        self.check_sequence = enabled;
    }

    /// Starts a new command exchange: the next outbound packet carries 0.
    pub fn reset(&mut self) {
        self.send_seq = 0xFF;
        self.recv_seq = 0xFF;
    }

    /// Accept whatever sequence number the next inbound packet carries.
    ///
    /// Used after commands that make the server restart its numbering.
    pub fn restart_inbound(&mut self) {
        self.sequence_reset = true;
    }

    /// Allocates the sequence number for an outbound frame.
    ///
    /// The reply to it is expected to carry the following number.
    pub fn next_outbound(&mut self) -> u8 {
        self.send_seq = self.send_seq.wrapping_add(1);
        self.recv_seq = self.send_seq;
        self.send_seq
    }

    /// Validates the sequence number of an inbound frame and adopts it.
    pub fn accept_inbound(&mut self, sequence: u8) -> Result<(), ProtocolError> {
        let expected = self.recv_seq.wrapping_add(1);
        if self.check_sequence && !self.sequence_reset && sequence != expected {
            return Err(ProtocolError::SequenceMismatch {
                expected,
                actual: sequence,
            });
        }
        self.sequence_reset = false;
        self.recv_seq = sequence;
        self.send_seq = sequence;
        Ok(())
    }
}
