//! Superblock encode/decode.
//!
//! One sector, kept in duplicate at the primary and secondary offsets
//! computed by [`crate::format::constants`]. Superblocks always checksum
//! with `salt = 0`, as opposed to logpack headers and records, which use
//! the device's own `log_checksum_salt`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use snafu::Snafu;

use super::checksum;
use super::constants::{DISK_NAME_LEN, FORMAT_VERSION, SUPER_SECTOR_FIXED_LEN, UUID_LEN};

#[derive(Debug, Snafu)]
pub enum SuperblockError {
    #[snafu(display("superblock checksum mismatch: stored {:#x}, computed {:#x}", stored, computed))]
    ChecksumMismatch { stored: u32, computed: u32 },
    #[snafu(display("superblock I/O error: {}", source))]
    Io { source: std::io::Error },
}

/// In-memory form of a superblock sector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperSector {
    pub sector_size: u32,
    pub snapshot_metadata_size: u32,
    pub uuid: [u8; UUID_LEN],
    pub start_offset: u64,
    pub ring_buffer_size: u64,
    pub oldest_lsid: u64,
    pub written_lsid: u64,
    /// Size of the virtual device W, in logical blocks.
    pub device_size: u64,
    pub log_checksum_salt: u32,
    pub format_version: u32,
    pub name: [u8; DISK_NAME_LEN],
}

impl SuperSector {
    /// Encodes this superblock into a buffer exactly `sector_size` bytes
    /// long, zero-padded past the fixed-size fields, with a freshly
    /// computed checksum (salt 0) written into the first four bytes.
    pub fn encode(&self, sector_size: usize) -> Bytes {
        assert!(sector_size >= SUPER_SECTOR_FIXED_LEN, "sector too small for superblock");

        let mut body = BytesMut::with_capacity(sector_size);
        body.put_u32_le(0); // checksum placeholder
        body.put_u32_le(self.sector_size);
        body.put_u32_le(self.snapshot_metadata_size);
        body.put_u32_le(0); // reserved
        body.put_slice(&self.uuid);
        body.put_u64_le(self.start_offset);
        body.put_u64_le(self.ring_buffer_size);
        body.put_u64_le(self.oldest_lsid);
        body.put_u64_le(self.written_lsid);
        body.put_u64_le(self.device_size);
        body.put_u32_le(self.log_checksum_salt);
        body.put_u32_le(self.format_version);
        body.put_slice(&self.name);
        body.resize(sector_size, 0);

        let sum = checksum::checksum(&body, 0);
        body[0..4].copy_from_slice(&sum.to_le_bytes());
        body.freeze()
    }

    /// Decodes and validates a superblock from a full sector's worth of
    /// bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, SuperblockError> {
        if !checksum::verify(buf, 0, 0) {
            let stored = u32::from_le_bytes(buf[0..4].try_into().unwrap());
            let mut zeroed = buf.to_vec();
            zeroed[0..4].copy_from_slice(&0u32.to_le_bytes());
            let computed = checksum::checksum(&zeroed, 0);
            return Err(SuperblockError::ChecksumMismatch { stored, computed });
        }

        let mut cur = &buf[4..];
        let sector_size = cur.get_u32_le();
        let snapshot_metadata_size = cur.get_u32_le();
        let _reserved = cur.get_u32_le();
        let mut uuid = [0u8; UUID_LEN];
        cur.copy_to_slice(&mut uuid);
        let start_offset = cur.get_u64_le();
        let ring_buffer_size = cur.get_u64_le();
        let oldest_lsid = cur.get_u64_le();
        let written_lsid = cur.get_u64_le();
        let device_size = cur.get_u64_le();
        let log_checksum_salt = cur.get_u32_le();
        let format_version = cur.get_u32_le();
        let mut name = [0u8; DISK_NAME_LEN];
        cur.copy_to_slice(&mut name);

        Ok(SuperSector {
            sector_size,
            snapshot_metadata_size,
            uuid,
            start_offset,
            ring_buffer_size,
            oldest_lsid,
            written_lsid,
            device_size,
            log_checksum_salt,
            format_version,
            name,
        })
    }

    /// Builds a fresh superblock for a newly-formatted device.
    pub fn new_formatted(
        sector_size: u32,
        snapshot_metadata_size: u32,
        ring_buffer_size: u64,
        device_size: u64,
        uuid: [u8; UUID_LEN],
        log_checksum_salt: u32,
        name: &str,
    ) -> Self {
        let mut name_bytes = [0u8; DISK_NAME_LEN];
        let n = name.as_bytes().len().min(DISK_NAME_LEN - 1);
        name_bytes[..n].copy_from_slice(&name.as_bytes()[..n]);

        SuperSector {
            sector_size,
            snapshot_metadata_size,
            uuid,
            start_offset: 0,
            ring_buffer_size,
            oldest_lsid: 0,
            written_lsid: 0,
            device_size,
            log_checksum_salt,
            format_version: FORMAT_VERSION,
            name: name_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SuperSector {
        SuperSector::new_formatted(4096, 16, 1 << 20, 1 << 21, [7u8; UUID_LEN], 0xCAFEF00D, "wal0")
    }

    #[test]
    fn round_trips_through_encode_decode() {
        let sb = sample();
        let encoded = sb.encode(4096);
        assert_eq!(encoded.len(), 4096);

        let decoded = SuperSector::decode(&encoded).unwrap();
        assert_eq!(decoded, sb);
    }

    #[test]
    fn detects_corruption() {
        let sb = sample();
        let mut encoded = sb.encode(4096).to_vec();
        encoded[100] ^= 0xFF;
        assert!(matches!(
            SuperSector::decode(&encoded),
            Err(SuperblockError::ChecksumMismatch { .. })
        ));
    }
}
