//! Sector checksums.
//!
//! A checksum is computed over a sector with its own `checksum` field
//! zeroed, then mixed with a per-device salt via CRC-32 (`crc32fast`).
//! Superblocks always use `salt = 0`; logpack headers and records use the
//! device's `log_checksum_salt`.

use crc32fast::Hasher;

/// Computes the checksum of `buf`, salted with `salt`.
///
/// Callers are expected to have already zeroed whatever `checksum` field
/// lives inside `buf` before calling this, matching the on-disk convention
/// of computing the checksum over the sector "as it will be written, minus
/// its own checksum".
pub fn checksum(buf: &[u8], salt: u32) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(buf);
    hasher.finalize() ^ salt
}

/// Verifies that `buf`'s trailing checksum matches what [`checksum`] would
/// compute for it, given that `checksum_offset..checksum_offset + 4` holds
/// the stored checksum in little-endian form.
pub fn verify(buf: &[u8], checksum_offset: usize, salt: u32) -> bool {
    let stored = u32::from_le_bytes(
        buf[checksum_offset..checksum_offset + 4]
            .try_into()
            .expect("checksum field is 4 bytes"),
    );
    let mut zeroed = buf.to_vec();
    zeroed[checksum_offset..checksum_offset + 4].copy_from_slice(&0u32.to_le_bytes());
    checksum(&zeroed, salt) == stored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_changes_with_salt() {
        let buf = vec![0xA5u8; 64];
        assert_ne!(checksum(&buf, 0), checksum(&buf, 1));
    }

    #[test]
    fn verify_round_trips() {
        let mut buf = vec![0u8; 16];
        buf[4..8].copy_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        let salt = 0x1234_5678;
        let sum = checksum(&buf, salt);
        buf[0..4].copy_from_slice(&sum.to_le_bytes());
        assert!(verify(&buf, 0, salt));

        buf[8] ^= 0xFF;
        assert!(!verify(&buf, 0, salt));
    }
}
