//! The redo engine: replays the log from the last checkpoint onto D
//! at attach time, before any host I/O is admitted.

use std::sync::Arc;

use snafu::Snafu;
use tracing::{info, instrument, warn};

use crate::device::BlockDevice;
use crate::format::constants::LBS;
use crate::format::logpack::LogPackHeader;
use crate::format::superblock::SuperSector;
use crate::lsid::LsidSnapshot;
use crate::ring_io::{read_physical_blocks, write_physical_blocks, RingGeometry};
use crate::usage::UsageHandle;

#[derive(Debug, Snafu)]
pub enum RedoError {
    #[snafu(display("redo I/O error: {}", source))]
    Io { source: std::io::Error },
    #[snafu(display("redo could not rewrite the truncated pack header: {}", source))]
    HeaderRewrite { source: std::io::Error },
}

/// Replays the log from `super_sector.written_lsid` onto `data_device`,
/// returning the cursor state every LSID cursor should start from: on
/// normal termination, `written == latest == permanent == completed ==
/// flush == cursor`.
#[instrument(skip(log_device, data_device, super_sector))]
pub async fn run<L: BlockDevice, D: BlockDevice>(
    log_device: &L,
    data_device: &D,
    super_sector: &SuperSector,
    ring_buffer_off: u64,
    usage: &UsageHandle,
) -> Result<LsidSnapshot, RedoError> {
    let geo = RingGeometry {
        ring_buffer_off,
        ring_buffer_size: super_sector.ring_buffer_size,
        sector_size: super_sector.sector_size,
        log_checksum_salt: super_sector.log_checksum_salt,
    };

    let mut cursor = super_sector.written_lsid;
    let mut n_packs = 0u64;

    loop {
        let header_buf = read_physical_blocks(log_device, &geo, cursor, 1)
            .await
            .map_err(|source| RedoError::Io { source })?;

        let header = match LogPackHeader::decode(&header_buf, geo.sector_size as usize, geo.log_checksum_salt, cursor) {
            Ok(header) => header,
            Err(_) => break, // end of valid log
        };

        let payload_blocks: u64 = header
            .records
            .iter()
            .map(|r| r.io_size_in_physical_blocks(geo.sector_size) as u64)
            .sum();
        let payload = if payload_blocks > 0 {
            read_physical_blocks(log_device, &geo, cursor + 1, payload_blocks)
                .await
                .map_err(|source| RedoError::Io { source })?
        } else {
            Vec::new()
        };

        let mut valid_count = header.records.len();
        if let Err(_) = header.verify_payload_checksums(&payload, geo.sector_size as usize, geo.log_checksum_salt) {
            // Partial-tail pack: find the longest valid prefix.
            valid_count = longest_valid_prefix(&header, &payload, &geo);
        }

        let mut block_cursor = 0usize;
        for record in &header.records[..valid_count] {
            let blocks = record.io_size_in_physical_blocks(geo.sector_size) as usize;
            let bytes_len = blocks * geo.sector_size as usize;
            let start = block_cursor;
            let end = start + bytes_len;
            block_cursor = end;

            if !record.is_exist {
                continue;
            }
            if record.is_discard {
                data_device
                    .discard(record.offset, record.io_size as u64)
                    .await
                    .map_err(|source| RedoError::Io { source })?;
                usage.add_redo_records_replayed(1);
                continue;
            }
            if record.is_padding {
                continue;
            }
            data_device
                .write_at(record.offset, &payload[start..end])
                .await
                .map_err(|source| RedoError::Io { source })?;
            usage.add_redo_records_replayed(1);
        }

        if valid_count < header.records.len() {
            let truncated = LogPackHeader {
                logpack_lsid: header.logpack_lsid,
                total_io_size: header.records[..valid_count]
                    .iter()
                    .map(|r| r.io_size_in_physical_blocks(geo.sector_size) as u32)
                    .sum(),
                records: header.records[..valid_count].to_vec(),
            };
            let encoded = truncated.encode(geo.sector_size as usize, geo.log_checksum_salt);
            write_physical_blocks(log_device, &geo, cursor, &encoded)
                .await
                .map_err(|source| RedoError::HeaderRewrite { source })?;
            cursor = truncated.next_lsid();
            n_packs += 1;
            break;
        }

        cursor = header.next_lsid();
        n_packs += 1;
    }

    info!(n_packs, final_cursor = cursor, "redo complete");

    Ok(LsidSnapshot {
        oldest: super_sector.oldest_lsid,
        prev_written: cursor,
        written: cursor,
        permanent: cursor,
        completed: cursor,
        flush: cursor,
        latest: cursor,
    })
}

/// Finds how many leading records of a pack have valid payload checksums,
/// for the partial-tail fixup in step 4.
fn longest_valid_prefix(header: &LogPackHeader, payload: &[u8], geo: &RingGeometry) -> usize {
    let mut cursor = 0usize;
    for (i, record) in header.records.iter().enumerate() {
        let blocks = record.io_size_in_physical_blocks(geo.sector_size) as usize;
        let bytes_len = blocks * geo.sector_size;
        if record.is_exist && !record.is_padding && !record.is_discard {
            let start = cursor;
            let end = start + bytes_len;
            if end > payload.len() {
                warn!(record = i, "pack payload truncated before declared end");
                return i;
            }
            let computed = crate::format::checksum::checksum(&payload[start..end], geo.log_checksum_salt);
            if computed != record.checksum {
                return i;
            }
        }
        cursor += bytes_len;
    }
    header.records.len()
}

/// Convenience wrapper for engines that keep L and D behind `Arc`.
pub async fn run_arc<L: BlockDevice, D: BlockDevice>(
    log_device: Arc<L>,
    data_device: Arc<D>,
    super_sector: &SuperSector,
    ring_buffer_off: u64,
    usage: &UsageHandle,
) -> Result<LsidSnapshot, RedoError> {
    run(log_device.as_ref(), data_device.as_ref(), super_sector, ring_buffer_off, usage).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::InMemoryBlockDevice;
    use crate::format::logpack::LogRecord;

    fn geo(sector_size: u32, ring_buffer_size: u64, salt: u32) -> RingGeometry {
        RingGeometry {
            ring_buffer_off: 0,
            ring_buffer_size,
            sector_size,
            log_checksum_salt: salt,
        }
    }

    #[tokio::test]
    async fn replays_a_single_pack_to_data_device() {
        let sector_size = 512u32;
        let salt = 0x1234;
        let log = InMemoryBlockDevice::new(64);
        let data = InMemoryBlockDevice::new(64);

        let payload = vec![0xA5u8; sector_size as usize];
        let record_checksum = crate::format::checksum::checksum(&payload, salt);
        let record = LogRecord {
            is_exist: true,
            is_padding: false,
            is_discard: false,
            lsid: 1,
            lsid_local: 1,
            offset: 0,
            io_size: (sector_size as u64 / LBS) as u32,
            checksum: record_checksum,
        };
        let header = LogPackHeader {
            logpack_lsid: 0,
            total_io_size: 1,
            records: vec![record],
        };
        let encoded_header = header.encode(sector_size as usize, salt);

        let g = geo(sector_size, 64, salt);
        write_physical_blocks(log.as_ref(), &g, 0, &encoded_header).await.unwrap();
        write_physical_blocks(log.as_ref(), &g, 1, &payload).await.unwrap();

        let super_sector = SuperSector::new_formatted(sector_size, 4, 64, 1 << 16, [0u8; 16], salt, "t");
        let result = run(log.as_ref(), data.as_ref(), &super_sector, 0, &UsageHandle::noop()).await.unwrap();
        assert_eq!(result.written, 2);
        assert_eq!(result.latest, 2);

        let mut read_back = vec![0u8; sector_size as usize];
        data.read_at(0, &mut read_back).await.unwrap();
        assert_eq!(read_back, payload);
    }

    /// A pack with 3 records whose 3rd payload is corrupted: redo applies
    /// the first 2, rewrites the header with `n_records` truncated to 2,
    /// and stops there.
    #[tokio::test]
    async fn truncates_a_pack_at_the_first_corrupted_record() {
        let sector_size = 512u32;
        let salt = 0x99;
        let log = InMemoryBlockDevice::new(64);
        let data = InMemoryBlockDevice::new(64);

        let payloads: Vec<Vec<u8>> = vec![vec![0x11u8; sector_size as usize], vec![0x22u8; sector_size as usize], vec![0x33u8; sector_size as usize]];
        let mut records = Vec::new();
        for (i, payload) in payloads.iter().enumerate() {
            records.push(LogRecord {
                is_exist: true,
                is_padding: false,
                is_discard: false,
                lsid: 1 + i as u64,
                lsid_local: 1 + i as u32,
                offset: i as u64 * (sector_size as u64 / LBS),
                io_size: (sector_size as u64 / LBS) as u32,
                checksum: crate::format::checksum::checksum(payload, salt),
            });
        }
        let header = LogPackHeader {
            logpack_lsid: 0,
            total_io_size: 3,
            records,
        };
        let encoded_header = header.encode(sector_size as usize, salt);

        let g = geo(sector_size, 64, salt);
        write_physical_blocks(log.as_ref(), &g, 0, &encoded_header).await.unwrap();
        for (i, payload) in payloads.iter().enumerate() {
            write_physical_blocks(log.as_ref(), &g, 1 + i as u64, payload).await.unwrap();
        }
        // Corrupt the 3rd record's payload on the log device after the
        // header (and its checksums) were already written against the
        // original bytes.
        let mut corrupted = payloads[2].clone();
        corrupted[0] ^= 0xFF;
        write_physical_blocks(log.as_ref(), &g, 3, &corrupted).await.unwrap();

        let super_sector = SuperSector::new_formatted(sector_size, 4, 64, 1 << 16, [0u8; 16], salt, "t");
        let result = run(log.as_ref(), data.as_ref(), &super_sector, 0, &UsageHandle::noop()).await.unwrap();

        // Truncated pack ends right after record 2 (lsid 1 and 2 applied, lsid 3 dropped).
        assert_eq!(result.written, 3);
        assert_eq!(result.latest, 3);

        let mut first = vec![0u8; sector_size as usize];
        data.read_at(0, &mut first).await.unwrap();
        assert_eq!(first, payloads[0]);

        let mut second = vec![0u8; sector_size as usize];
        data.read_at(sector_size as u64 / LBS, &mut second).await.unwrap();
        assert_eq!(second, payloads[1]);

        let mut third = vec![0u8; sector_size as usize];
        data.read_at(2 * (sector_size as u64 / LBS), &mut third).await.unwrap();
        assert_eq!(third, vec![0u8; sector_size as usize]); // never applied

        // The on-log header was rewritten with n_records truncated to 2.
        let rewritten = read_physical_blocks(log.as_ref(), &g, 0, 1).await.unwrap();
        let decoded = LogPackHeader::decode(&rewritten, sector_size as usize, salt, 0).unwrap();
        assert_eq!(decoded.records.len(), 2);
    }

    #[tokio::test]
    async fn stops_at_first_invalid_header() {
        let sector_size = 512u32;
        let salt = 7;
        let log = InMemoryBlockDevice::new(16);
        let data = InMemoryBlockDevice::new(16);

        let super_sector = SuperSector::new_formatted(sector_size, 4, 16, 1 << 13, [0u8; 16], salt, "t");
        let result = run(log.as_ref(), data.as_ref(), &super_sector, 0, &UsageHandle::noop()).await.unwrap();
        assert_eq!(result.written, 0);
        assert_eq!(result.latest, 0);
    }
}
