// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Incremental MQTT fixed-header frame decoder.
//!
//! Assembles one control packet at a time from whatever chunk splits
//! QUIC happens to deliver. The state machine keys off the first two
//! header bytes:
//!
//! ```text
//! scratch[1] == 0          2-byte packet (PINGRESP/DISCONNECT shape)
//! scratch[1] in 1..=2      single-byte remaining length, tiny body
//! scratch[1] >  2          read 3 more bytes, decode the full
//!                          remaining-length field, then collect the
//!                          rest of the body from the ring
//! ```
//!
//! `want` is the total prefix length the decoder needs before it can
//! take the next step; `have` counts the fixed-header bytes already
//! copied into the 5-byte scratch area. A packet is in flight
//! (`pending`) exactly while the decoder has committed to a length.

use crate::packet::decode_remaining_length;
use crate::ring::RecvRing;
use crate::{Packet, TransportResult};

/// Scratch area: 1 type/flags byte + up to 4 remaining-length bytes.
const SCRATCH_LEN: usize = 5;

/// Result of one decoder step.
#[derive(Debug)]
pub enum DecodeStep {
    /// The ring does not hold enough bytes for the current state.
    /// The caller compacts the ring and re-enables QUIC delivery.
    NeedMore,
    /// One packet completed; the decoder has reset for the next one.
    Complete(Packet),
}

/// Length commitment for the packet currently being decoded.
#[derive(Debug, Clone, Copy)]
struct Pending {
    /// Remaining-length field size in bytes.
    used: usize,
    /// Total wire length of the packet.
    total: usize,
}

/// Incremental frame decoder state.
#[derive(Debug)]
pub struct Decoder {
    have: usize,
    want: usize,
    scratch: [u8; SCRATCH_LEN],
    pending: Option<Pending>,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    /// Create a decoder positioned at a packet boundary.
    pub fn new() -> Self {
        Self {
            have: 0,
            want: 2,
            scratch: [0u8; SCRATCH_LEN],
            pending: None,
        }
    }

    /// Reset to the packet boundary state.
    pub fn reset(&mut self) {
        self.have = 0;
        self.want = 2;
        self.pending = None;
    }

    /// True when the decoder has not committed to a packet.
    pub fn at_boundary(&self) -> bool {
        self.have == 0
    }

    /// Advance the state machine against the ring until a packet
    /// completes or more bytes are needed.
    ///
    /// Errors are protocol violations (malformed remaining length);
    /// the stream must be torn down, not resumed.
    pub fn step(&mut self, ring: &mut RecvRing) -> TransportResult<DecodeStep> {
        loop {
            // Packet boundary: collect type/flags + first length byte.
            if self.have == 0 {
                if ring.len() < 2 {
                    return Ok(DecodeStep::NeedMore);
                }
                ring.take_into(&mut self.scratch[0..2]);
                self.have = 2;
                match self.scratch[1] {
                    0 => {
                        // Zero remaining length: PINGRESP/DISCONNECT shape.
                        let packet = Packet::new(self.scratch[0..2].to_vec(), Vec::new());
                        self.reset();
                        return Ok(DecodeStep::Complete(packet));
                    }
                    rl @ 1..=2 => self.want = 2 + rl as usize,
                    _ => self.want = SCRATCH_LEN,
                }
                continue;
            }

            // Single-byte remaining length of 1 or 2: the whole body
            // fits in the scratch area.
            if self.scratch[1] <= 2 && self.pending.is_none() {
                let body_len = self.want - 2;
                if ring.len() < body_len {
                    return Ok(DecodeStep::NeedMore);
                }
                ring.take_into(&mut self.scratch[2..2 + body_len]);
                let packet = Packet::new(
                    self.scratch[0..2].to_vec(),
                    self.scratch[2..2 + body_len].to_vec(),
                );
                self.reset();
                return Ok(DecodeStep::Complete(packet));
            }

            // Five-byte prefix: enough to decode any remaining-length
            // field and commit to the packet's total size.
            if self.want == SCRATCH_LEN && self.pending.is_none() {
                if ring.len() < 3 {
                    return Ok(DecodeStep::NeedMore);
                }
                ring.take_into(&mut self.scratch[2..SCRATCH_LEN]);
                self.have = SCRATCH_LEN;

                let (remaining, used) = decode_remaining_length(&self.scratch[1..SCRATCH_LEN])?;
                let total = 1 + used + remaining as usize;
                self.want = total;
                self.pending = Some(Pending { used, total });

                if total == SCRATCH_LEN {
                    // Remaining length 3 in one byte: already complete.
                    let packet = Packet::new(
                        self.scratch[0..2].to_vec(),
                        self.scratch[2..SCRATCH_LEN].to_vec(),
                    );
                    self.reset();
                    return Ok(DecodeStep::Complete(packet));
                }
                continue;
            }

            // Committed packet: collect the rest of the body. The tail
            // of the scratch area past the remaining-length field is
            // already body.
            if let Some(Pending { used, total }) = self.pending {
                let outstanding = total - SCRATCH_LEN;
                if ring.len() < outstanding {
                    return Ok(DecodeStep::NeedMore);
                }
                let header_len = 1 + used;
                let mut body = Vec::with_capacity(total - header_len);
                body.extend_from_slice(&self.scratch[header_len..SCRATCH_LEN]);
                body.extend_from_slice(&ring.take(outstanding));
                let packet = Packet::new(self.scratch[0..header_len].to_vec(), body);
                self.reset();
                return Ok(DecodeStep::Complete(packet));
            }
        }
    }
}
