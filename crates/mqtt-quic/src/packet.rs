// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT control packet container and the fixed-header length grammar.
//!
//! Every MQTT control packet starts with a fixed header: one byte of
//! packet type + flags, then a variable-length integer (1-4 bytes)
//! encoding the remaining length:
//!
//! ```text
//! +-------------+------------------------+------------------+
//! | type/flags  | remaining length (1-4) | remaining bytes  |
//! +-------------+------------------------+------------------+
//! ```
//!
//! A `Packet` keeps the fixed header and the remaining bytes in two
//! regions, matching the two QUIC buffers the send path submits.

use crate::{TransportError, TransportResult};

/// Largest value a 4-byte remaining length can encode.
pub const REMAINING_LENGTH_MAX: u32 = 268_435_455;

/// Maximum number of remaining-length bytes in a fixed header.
pub const REMAINING_LENGTH_MAX_BYTES: usize = 4;

/// One MQTT control packet, split into fixed header and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    header: Vec<u8>,
    body: Vec<u8>,
}

impl Packet {
    /// Create a packet from already-assembled header and body regions.
    pub fn new(header: Vec<u8>, body: Vec<u8>) -> Self {
        Self { header, body }
    }

    /// Compose a packet from a type/flags byte and body bytes,
    /// encoding the remaining length.
    pub fn compose(type_flags: u8, body: &[u8]) -> TransportResult<Self> {
        let mut header = Vec::with_capacity(1 + REMAINING_LENGTH_MAX_BYTES);
        header.push(type_flags);
        encode_remaining_length(body.len() as u32, &mut header)?;
        Ok(Self {
            header,
            body: body.to_vec(),
        })
    }

    /// Fixed header bytes (type/flags + remaining length).
    pub fn header(&self) -> &[u8] {
        &self.header
    }

    /// Remaining bytes after the fixed header.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Packet type (high nibble of the first header byte).
    pub fn packet_type(&self) -> Option<u8> {
        self.header.first().map(|b| b >> 4)
    }

    /// Total wire length of the packet.
    pub fn wire_len(&self) -> usize {
        self.header.len() + self.body.len()
    }

    /// Header and body concatenated, as they appear on the wire.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.wire_len());
        out.extend_from_slice(&self.header);
        out.extend_from_slice(&self.body);
        out
    }
}

/// Decode an MQTT remaining length from `buf`, returning the value and
/// the number of bytes consumed (1-4).
///
/// Rejects a continuation bit set on the fourth byte and non-minimal
/// encodings (both are protocol violations).
pub fn decode_remaining_length(buf: &[u8]) -> TransportResult<(u32, usize)> {
    let mut value: u32 = 0;
    let mut shift = 0;

    for (i, &byte) in buf.iter().take(REMAINING_LENGTH_MAX_BYTES).enumerate() {
        value |= u32::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            if i > 0 && byte == 0 {
                return Err(TransportError::Protocol(
                    "non-minimal remaining length encoding".to_string(),
                ));
            }
            return Ok((value, i + 1));
        }
        shift += 7;
    }

    if buf.len() < REMAINING_LENGTH_MAX_BYTES {
        return Err(TransportError::Protocol(
            "truncated remaining length".to_string(),
        ));
    }
    Err(TransportError::Protocol(
        "remaining length continuation bit set on fourth byte".to_string(),
    ))
}

/// Encode `len` as an MQTT remaining length, appending 1-4 bytes.
pub fn encode_remaining_length(len: u32, out: &mut Vec<u8>) -> TransportResult<()> {
    if len > REMAINING_LENGTH_MAX {
        return Err(TransportError::Protocol(format!(
            "remaining length {} exceeds maximum {}",
            len, REMAINING_LENGTH_MAX
        )));
    }

    let mut value = len;
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_length_roundtrip() {
        let cases: &[(u32, usize)] = &[
            (0, 1),
            (1, 1),
            (127, 1),
            (128, 2),
            (16_383, 2),
            (16_384, 3),
            (2_097_151, 3),
            (2_097_152, 4),
            (268_435_455, 4),
        ];

        for &(value, expected_bytes) in cases {
            let mut buf = Vec::new();
            encode_remaining_length(value, &mut buf).unwrap();
            assert_eq!(buf.len(), expected_bytes, "encoded size for {}", value);

            let (decoded, used) = decode_remaining_length(&buf).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(used, expected_bytes);
        }
    }

    #[test]
    fn test_remaining_length_trailing_bytes_ignored() {
        // Decoder must stop at the terminator byte.
        let (value, used) = decode_remaining_length(&[0x81, 0x01, 0xFF, 0xFF]).unwrap();
        assert_eq!(value, 129);
        assert_eq!(used, 2);
    }

    #[test]
    fn test_remaining_length_fourth_byte_continuation() {
        let result = decode_remaining_length(&[0xFF, 0xFF, 0xFF, 0xFF]);
        assert!(matches!(result, Err(TransportError::Protocol(_))));
    }

    #[test]
    fn test_remaining_length_truncated() {
        let result = decode_remaining_length(&[0x80]);
        assert!(matches!(result, Err(TransportError::Protocol(_))));
    }

    #[test]
    fn test_remaining_length_non_minimal() {
        // 0 encoded in two bytes.
        let result = decode_remaining_length(&[0x80, 0x00]);
        assert!(matches!(result, Err(TransportError::Protocol(_))));
    }

    #[test]
    fn test_remaining_length_too_large() {
        let mut buf = Vec::new();
        let result = encode_remaining_length(REMAINING_LENGTH_MAX + 1, &mut buf);
        assert!(matches!(result, Err(TransportError::Protocol(_))));
    }

    #[test]
    fn test_compose_pingresp() {
        let packet = Packet::compose(0xD0, &[]).unwrap();
        assert_eq!(packet.header(), &[0xD0, 0x00]);
        assert!(packet.body().is_empty());
        assert_eq!(packet.packet_type(), Some(0x0D));
        assert_eq!(packet.wire_len(), 2);
    }

    #[test]
    fn test_compose_publish_long_body() {
        let body = vec![0x42u8; 129];
        let packet = Packet::compose(0x30, &body).unwrap();
        assert_eq!(packet.header(), &[0x30, 0x81, 0x01]);
        assert_eq!(packet.body().len(), 129);
        assert_eq!(packet.wire_len(), 3 + 129);
    }

    #[test]
    fn test_to_wire() {
        let packet = Packet::new(vec![0x40, 0x02], vec![0x00, 0x01]);
        assert_eq!(packet.to_wire(), vec![0x40, 0x02, 0x00, 0x01]);
    }
}
