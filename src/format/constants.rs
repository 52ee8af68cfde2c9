//! Fixed sizes and sentinel values for the on-log format.
//!
//! These mirror the constants of the original `walb` kernel driver
//! (`walb_log_device.h`), translated from C macros into typed Rust constants.

/// Logical block size, the host-visible unit of addressing.
pub const LBS: u64 = 512;

/// The reserved page at the start of the log device, before the primary
/// superblock. Matches `PAGE_SIZE` in the original driver.
pub const PAGE_SIZE: u64 = 4096;

/// Length, in bytes, of the superblock's `name` field.
pub const DISK_NAME_LEN: usize = 64;

/// Length, in bytes, of the superblock's `uuid` field.
pub const UUID_LEN: usize = 16;

/// Length, in bytes, of a snapshot record's `name` field.
pub const SNAPSHOT_NAME_LEN: usize = 64;

/// `INVALID_LSID`, the sentinel meaning "no such LSID".
pub const INVALID_LSID: u64 = u64::MAX;

/// `MAX_LSID`, the highest LSID an engine will ever allocate.
pub const MAX_LSID: u64 = u64::MAX - 1;

/// On-disk format version. Bumped from the original driver's implicit
/// version because the checksum algorithm was swapped for CRC-32 (see
/// DESIGN.md, "Open question: checksum function").
pub const FORMAT_VERSION: u32 = 2;

/// Fixed size of a packed superblock record, before sector padding.
///
/// `checksum(4) + sector_size(4) + snapshot_metadata_size(4) + reserved(4) +
/// uuid(16) + start_offset(8) + ring_buffer_size(8) + oldest_lsid(8) +
/// written_lsid(8) + device_size(8) + log_checksum_salt(4) +
/// format_version(4) + name(64)`
pub const SUPER_SECTOR_FIXED_LEN: usize = 4 + 4 + 4 + 4 + UUID_LEN + 8 + 8 + 8 + 8 + 8 + 4 + 4 + DISK_NAME_LEN;

/// Fixed size of one packed log record, before the header's record array.
///
/// `checksum(4) + lsid(8) + lsid_local(4) + flags(1) + reserved(3) +
/// offset(8) + io_size(4)`
pub const LOG_RECORD_LEN: usize = 4 + 8 + 4 + 1 + 3 + 8 + 4;

/// Fixed size of a log pack header, before its record array.
///
/// `logpack_lsid(8) + total_io_size(4) + n_records(2) + reserved(2) +
/// header_checksum(4)`
pub const LOG_PACK_HEADER_FIXED_LEN: usize = 8 + 4 + 2 + 2 + 4;

/// Fixed size of a snapshot sector header: `checksum(4) + bitmap(4)`.
pub const SNAPSHOT_SECTOR_HEADER_LEN: usize = 4 + 4;

/// Fixed size of one packed snapshot record: `lsid(8) + timestamp(8) +
/// name(64)`.
pub const SNAPSHOT_RECORD_LEN: usize = 8 + 8 + SNAPSHOT_NAME_LEN;

/// Hard cap on the number of snapshot records held in a single sector,
/// imposed by the bitmap width (`u32`), independent of how many more would
/// fit by size alone.
pub const MAX_SNAPSHOTS_PER_SECTOR: usize = 32;

/// Bound on `total_io_size` representable by a single logpack header
/// (in logical blocks), keeping the field comfortably within a `u32`.
pub const MAX_TOTAL_IO_SIZE_IN_LOGPACK_HEADER: u32 = u32::MAX / 2;

/// Number of log records that fit in one sector of the given physical
/// block size.
pub const fn n_log_record_in_sector(sector_size: usize) -> usize {
    (sector_size - LOG_PACK_HEADER_FIXED_LEN) / LOG_RECORD_LEN
}

/// Number of snapshot records that fit in one sector of the given physical
/// block size, bounded by [`MAX_SNAPSHOTS_PER_SECTOR`].
pub const fn max_snapshots_in_sector(sector_size: usize) -> usize {
    let by_size = (sector_size - SNAPSHOT_SECTOR_HEADER_LEN) / SNAPSHOT_RECORD_LEN;
    if by_size < MAX_SNAPSHOTS_PER_SECTOR {
        by_size
    } else {
        MAX_SNAPSHOTS_PER_SECTOR
    }
}

/// Offset, in sectors, of the primary superblock.
pub const fn super0_offset(sector_size: u64) -> u64 {
    PAGE_SIZE / sector_size
}

/// Offset, in sectors, of the start of the snapshot-metadata region.
pub const fn metadata_offset(sector_size: u64) -> u64 {
    super0_offset(sector_size) + 1
}

/// Offset, in sectors, of the secondary superblock.
pub const fn super1_offset(sector_size: u64, snapshot_metadata_size: u64) -> u64 {
    metadata_offset(sector_size) + snapshot_metadata_size
}

/// Offset, in sectors, of the first sector of the log ring buffer.
pub const fn ring_buffer_offset(sector_size: u64, snapshot_metadata_size: u64) -> u64 {
    super1_offset(sector_size, snapshot_metadata_size) + 1
}
