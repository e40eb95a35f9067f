//! CRC-32 checksum over a complete wrapped payload.
//!
//! The fragment header stores the checksum as a *signed* 32-bit integer, so
//! [`signed_crc32`] reinterprets the IEEE CRC bits as `i32`.

/// CRC-32 (IEEE 802.3, reflected polynomial `0xEDB88320`).
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// CRC-32 reinterpreted as a signed integer, as carried in the fragment header.
pub fn signed_crc32(data: &[u8]) -> i32 {
    crc32(data) as i32
}
