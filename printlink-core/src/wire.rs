//! Framing: SACP packets. 7-byte header (magic, LE length, version, receiver, CRC-8),
//! 6-byte envelope tail (sender, attribute, LE sequence, command set, command id),
//! payload, then a LE 16-bit payload checksum.

use serde::Deserialize;
use tracing::warn;

use crate::checksum::{header_checksum, payload_checksum};

/// Leading magic bytes of every packet.
pub const MAGIC: [u8; 2] = [0xAA, 0x55];
/// Protocol version written into every header.
pub const SACP_VERSION: u8 = 0x01;
/// Fixed header: magic, length, version, receiver id, header CRC.
pub const HEADER_LEN: usize = 7;
/// Header plus sender, attribute, sequence, command set and command id.
pub const ENVELOPE_LEN: usize = 13;
const TRAILER_LEN: usize = 2;
/// Bytes counted by the length field beyond the payload (envelope tail + trailer).
const LENGTH_OVERHEAD: usize = ENVELOPE_LEN - HEADER_LEN + TRAILER_LEN;
/// Largest payload the 16-bit length field can describe.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize - LENGTH_OVERHEAD;

/// Attribute value for requests.
pub const ATTR_REQUEST: u8 = 0;
/// Attribute value for responses.
pub const ATTR_RESPONSE: u8 = 1;

/// One framed SACP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub receiver_id: u8,
    pub sender_id: u8,
    /// 0 = request, 1 = response.
    pub attribute: u8,
    pub sequence: u16,
    pub command_set: u8,
    pub command_id: u8,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn command(&self) -> (u8, u8) {
        (self.command_set, self.command_id)
    }

    pub fn is_response(&self) -> bool {
        self.attribute == ATTR_RESPONSE
    }
}

/// How to treat a payload checksum that does not match the trailer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumPolicy {
    /// Log the discrepancy and keep the packet.
    #[default]
    Lenient,
    /// Reject the packet.
    Strict,
}

/// Encode a packet into its wire form.
pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>, PacketEncodeError> {
    let payload_len = packet.payload.len();
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(PacketEncodeError::TooLarge(payload_len));
    }
    let length = (payload_len + LENGTH_OVERHEAD) as u16;
    let mut out = Vec::with_capacity(ENVELOPE_LEN + payload_len + TRAILER_LEN);
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&length.to_le_bytes());
    out.push(SACP_VERSION);
    out.push(packet.receiver_id);
    out.push(0);
    let crc = header_checksum(&out, 6);
    out[6] = crc;
    out.push(packet.sender_id);
    out.push(packet.attribute);
    out.extend_from_slice(&packet.sequence.to_le_bytes());
    out.push(packet.command_set);
    out.push(packet.command_id);
    out.extend_from_slice(&packet.payload);
    let check = payload_checksum(&out[HEADER_LEN..], out.len() - HEADER_LEN);
    out.extend_from_slice(&check.to_le_bytes());
    Ok(out)
}

/// Error encoding a packet.
#[derive(Debug, thiserror::Error)]
pub enum PacketEncodeError {
    #[error("payload of {0} bytes exceeds the 16-bit length field")]
    TooLarge(usize),
}

/// Which integrity field failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumField {
    Header,
    Payload,
}

/// Error decoding a packet.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PacketDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("packet too short: {0} bytes")]
    TooShort(usize),
    #[error("bad magic bytes {0:#04x} {1:#04x}")]
    BadMagic(u8, u8),
    #[error("length field {declared} does not match {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("{field:?} checksum mismatch: expected {expected:#06x}, computed {computed:#06x}")]
    ChecksumMismatch {
        field: ChecksumField,
        expected: u16,
        computed: u16,
    },
}

impl PacketDecodeError {
    /// Whether the bytes can never become a valid packet (as opposed to needing more input).
    pub fn is_malformed(&self) -> bool {
        !matches!(self, PacketDecodeError::NeedMore)
    }
}

/// Decode exactly one packet occupying all of `bytes`.
///
/// The header CRC is always enforced; the payload checksum follows `policy`.
pub fn decode_packet(bytes: &[u8], policy: ChecksumPolicy) -> Result<Packet, PacketDecodeError> {
    if bytes.len() < ENVELOPE_LEN {
        return Err(PacketDecodeError::TooShort(bytes.len()));
    }
    if bytes[..2] != MAGIC {
        return Err(PacketDecodeError::BadMagic(bytes[0], bytes[1]));
    }
    let declared = u16::from_le_bytes([bytes[2], bytes[3]]) as usize;
    if declared != bytes.len() - HEADER_LEN {
        return Err(PacketDecodeError::LengthMismatch {
            declared,
            actual: bytes.len() - HEADER_LEN,
        });
    }
    if bytes.len() < ENVELOPE_LEN + TRAILER_LEN {
        return Err(PacketDecodeError::TooShort(bytes.len()));
    }
    let header_crc = header_checksum(bytes, 6);
    if header_crc != bytes[6] {
        return Err(PacketDecodeError::ChecksumMismatch {
            field: ChecksumField::Header,
            expected: u16::from(bytes[6]),
            computed: u16::from(header_crc),
        });
    }
    let end = bytes.len() - TRAILER_LEN;
    let expected = u16::from_le_bytes([bytes[end], bytes[end + 1]]);
    let computed = payload_checksum(&bytes[HEADER_LEN..end], end - HEADER_LEN);
    if expected != computed {
        match policy {
            ChecksumPolicy::Strict => {
                return Err(PacketDecodeError::ChecksumMismatch {
                    field: ChecksumField::Payload,
                    expected,
                    computed,
                })
            }
            ChecksumPolicy::Lenient => {
                warn!(expected, computed, "SACP payload checksum mismatch, keeping packet");
            }
        }
    }
    Ok(Packet {
        receiver_id: bytes[5],
        sender_id: bytes[7],
        attribute: bytes[8],
        sequence: u16::from_le_bytes([bytes[9], bytes[10]]),
        command_set: bytes[11],
        command_id: bytes[12],
        payload: bytes[ENVELOPE_LEN..end].to_vec(),
    })
}

/// Decode one packet from the front of a stream buffer. Returns the packet and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` until a whole packet is present.
/// On any other error the caller should drop one byte and try again to resynchronize.
pub fn next_packet(
    bytes: &[u8],
    policy: ChecksumPolicy,
) -> Result<(Packet, usize), PacketDecodeError> {
    if bytes.len() < 4 {
        if !bytes.is_empty() && bytes[0] != MAGIC[0] {
            return Err(PacketDecodeError::BadMagic(bytes[0], 0));
        }
        return Err(PacketDecodeError::NeedMore);
    }
    if bytes[..2] != MAGIC {
        return Err(PacketDecodeError::BadMagic(bytes[0], bytes[1]));
    }
    let declared = u16::from_le_bytes([bytes[2], bytes[3]]) as usize;
    if declared < LENGTH_OVERHEAD {
        return Err(PacketDecodeError::TooShort(declared + HEADER_LEN));
    }
    // Reject a corrupt header before waiting on its length field.
    if bytes.len() > 6 {
        let header_crc = header_checksum(bytes, 6);
        if header_crc != bytes[6] {
            return Err(PacketDecodeError::ChecksumMismatch {
                field: ChecksumField::Header,
                expected: u16::from(bytes[6]),
                computed: u16::from(header_crc),
            });
        }
    }
    let total = declared + HEADER_LEN;
    if bytes.len() < total {
        return Err(PacketDecodeError::NeedMore);
    }
    let packet = decode_packet(&bytes[..total], policy)?;
    Ok((packet, total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn sample(payload: Vec<u8>) -> Packet {
        Packet {
            receiver_id: 2,
            sender_id: 0,
            attribute: ATTR_REQUEST,
            sequence: 0x1234,
            command_set: 0xB0,
            command_id: 0x01,
            payload,
        }
    }

    #[test]
    fn layout_matches_wire_format() {
        let bytes = encode_packet(&sample(vec![0xDE, 0xAD])).unwrap();
        assert_eq!(bytes.len(), ENVELOPE_LEN + 2 + 2);
        assert_eq!(&bytes[..2], &MAGIC);
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), 2 + 6 + 2);
        assert_eq!(bytes[4], SACP_VERSION);
        assert_eq!(bytes[5], 2);
        assert_eq!(bytes[6], header_checksum(&bytes, 6));
        assert_eq!(bytes[7], 0);
        assert_eq!(bytes[8], ATTR_REQUEST);
        assert_eq!(&bytes[9..11], &[0x34, 0x12]);
        assert_eq!(&bytes[11..13], &[0xB0, 0x01]);
        assert_eq!(&bytes[13..15], &[0xDE, 0xAD]);
        let check = payload_checksum(&bytes[7..15], 8);
        assert_eq!(&bytes[15..], &check.to_le_bytes());
    }

    #[test]
    fn roundtrip_random_payload_lengths() {
        let mut rng = rand::thread_rng();
        for len in [0usize, 1, 2, 13, 255, 1024, 61_479, 65_000, MAX_PAYLOAD_LEN] {
            let packet = Packet {
                receiver_id: rng.gen(),
                sender_id: rng.gen(),
                attribute: rng.gen_range(0..=1),
                sequence: rng.gen(),
                command_set: rng.gen(),
                command_id: rng.gen(),
                payload: (0..len).map(|_| rng.gen()).collect(),
            };
            let bytes = encode_packet(&packet).unwrap();
            assert_eq!(bytes.len(), ENVELOPE_LEN + len + 2);
            let decoded = decode_packet(&bytes, ChecksumPolicy::Strict).unwrap();
            assert_eq!(decoded, packet);
        }
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let packet = sample(vec![0; MAX_PAYLOAD_LEN + 1]);
        assert!(matches!(
            encode_packet(&packet),
            Err(PacketEncodeError::TooLarge(_))
        ));
    }

    #[test]
    fn decode_rejects_short_input() {
        assert_eq!(
            decode_packet(&[0xAA, 0x55, 0x00], ChecksumPolicy::Lenient),
            Err(PacketDecodeError::TooShort(3))
        );
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let mut bytes = encode_packet(&sample(vec![1, 2, 3])).unwrap();
        bytes[0] = 0xAB;
        assert!(matches!(
            decode_packet(&bytes, ChecksumPolicy::Lenient),
            Err(PacketDecodeError::BadMagic(0xAB, 0x55))
        ));
    }

    #[test]
    fn decode_rejects_length_mismatch() {
        let mut bytes = encode_packet(&sample(vec![1, 2, 3])).unwrap();
        bytes.push(0);
        assert!(matches!(
            decode_packet(&bytes, ChecksumPolicy::Lenient),
            Err(PacketDecodeError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn decode_rejects_header_crc() {
        let mut bytes = encode_packet(&sample(vec![1, 2, 3])).unwrap();
        bytes[6] ^= 0xFF;
        assert!(matches!(
            decode_packet(&bytes, ChecksumPolicy::Lenient),
            Err(PacketDecodeError::ChecksumMismatch {
                field: ChecksumField::Header,
                ..
            })
        ));
    }

    #[test]
    fn payload_checksum_policy() {
        let packet = sample(vec![1, 2, 3]);
        let mut bytes = encode_packet(&packet).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert_eq!(decode_packet(&bytes, ChecksumPolicy::Lenient).unwrap(), packet);
        assert!(matches!(
            decode_packet(&bytes, ChecksumPolicy::Strict),
            Err(PacketDecodeError::ChecksumMismatch {
                field: ChecksumField::Payload,
                ..
            })
        ));
    }

    #[test]
    fn decode_does_not_mutate_input() {
        let bytes = encode_packet(&sample(vec![9; 16])).unwrap();
        let copy = bytes.clone();
        let _ = decode_packet(&bytes, ChecksumPolicy::Strict).unwrap();
        assert_eq!(bytes, copy);
    }

    #[test]
    fn partial_read_need_more() {
        let bytes = encode_packet(&sample(vec![7; 40])).unwrap();
        for cut in [1, 3, 4, ENVELOPE_LEN, bytes.len() - 1] {
            assert_eq!(
                next_packet(&bytes[..cut], ChecksumPolicy::Strict),
                Err(PacketDecodeError::NeedMore)
            );
        }
    }

    #[test]
    fn multiple_packets_in_stream() {
        let a = sample(vec![1]);
        let mut b = sample(vec![2, 2]);
        b.sequence = 7;
        let fa = encode_packet(&a).unwrap();
        let fb = encode_packet(&b).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&fa);
        buf.extend_from_slice(&fb);
        let (p1, n1) = next_packet(&buf, ChecksumPolicy::Strict).unwrap();
        assert_eq!(n1, fa.len());
        let (p2, n2) = next_packet(&buf[n1..], ChecksumPolicy::Strict).unwrap();
        assert_eq!(n2, fb.len());
        assert_eq!(p1, a);
        assert_eq!(p2, b);
    }

    #[test]
    fn garbage_prefix_reports_bad_magic() {
        let mut buf = vec![0x00, 0x13];
        buf.extend_from_slice(&encode_packet(&sample(vec![5])).unwrap());
        assert!(next_packet(&buf, ChecksumPolicy::Strict)
            .unwrap_err()
            .is_malformed());
        assert!(next_packet(&buf[1..], ChecksumPolicy::Strict)
            .unwrap_err()
            .is_malformed());
        assert!(next_packet(&buf[2..], ChecksumPolicy::Strict).is_ok());
    }

    #[test]
    fn corrupt_header_fails_before_its_length_arrives() {
        let mut buf = vec![0xAA, 0x55, 0xFF, 0xFF, 0x01, 0x02, 0x00];
        buf[6] = header_checksum(&buf, 6) ^ 0xFF;
        let valid = sample(vec![9, 9]);
        buf.extend_from_slice(&encode_packet(&valid).unwrap());

        assert!(matches!(
            next_packet(&buf, ChecksumPolicy::Strict),
            Err(PacketDecodeError::ChecksumMismatch {
                field: ChecksumField::Header,
                ..
            })
        ));
        // Dropping one byte at a time reaches the packet behind it.
        let mut start = 0;
        let packet = loop {
            match next_packet(&buf[start..], ChecksumPolicy::Strict) {
                Ok((packet, _)) => break packet,
                Err(e) => {
                    assert!(e.is_malformed());
                    start += 1;
                }
            }
        };
        assert_eq!(start, 7);
        assert_eq!(packet, valid);
    }
}
