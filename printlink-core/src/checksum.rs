//! Integrity: SACP header CRC-8, payload 16-bit checksum, and upload content digest.

use md5::{Digest, Md5};

/// CRC-8 generator polynomial used for the SACP header.
pub const HEADER_POLY: u8 = 0x07;

/// Bit-serial CRC-8 (poly 0x07, MSB first, zero init, no final xor) over the first `length` bytes.
pub fn header_checksum(bytes: &[u8], length: usize) -> u8 {
    let mut crc: u8 = 0;
    for &byte in &bytes[..length.min(bytes.len())] {
        for j in 0..8 {
            let bit = (byte >> (7 - j)) & 0x01 == 1;
            let msb = (crc >> 7) & 0x01 == 1;
            crc <<= 1;
            if msb ^ bit {
                crc ^= HEADER_POLY;
            }
        }
    }
    crc
}

/// Folded ones'-complement sum of the first `length` bytes, read as big-endian 16-bit words.
/// A trailing odd byte is added unshifted.
pub fn folded_sum(bytes: &[u8], length: usize) -> u16 {
    let data = &bytes[..length.min(bytes.len())];
    let mut sum: u64 = 0;
    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum = (sum + u64::from(u16::from_be_bytes([word[0], word[1]]))) & 0xFFFF_FFFF;
    }
    if let [last] = words.remainder() {
        sum += u64::from(*last);
    }
    while sum > 0xFFFF {
        sum = ((sum >> 16) & 0xFFFF) + (sum & 0xFFFF);
    }
    sum as u16
}

/// SACP payload checksum: complement of [`folded_sum`].
pub fn payload_checksum(bytes: &[u8], length: usize) -> u16 {
    !folded_sum(bytes, length)
}

/// Hex MD5 of the payload. Identifies one upload end-to-end.
pub fn payload_digest(payload: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(payload);
    hex::encode(hasher.finalize())
}
