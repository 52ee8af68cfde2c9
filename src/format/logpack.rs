//! Log-pack header and record codec.
//!
//! A log pack is one header sector followed by its payload sectors. The
//! header carries up to `n_log_record_in_sector(sector_size)` records; each
//! record's payload lives at LSID `logpack_lsid + record.lsid_local`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use snafu::Snafu;

use super::checksum;
use super::constants::{n_log_record_in_sector, LOG_PACK_HEADER_FIXED_LEN, LOG_RECORD_LEN, LBS};

#[derive(Debug, Snafu)]
pub enum LogPackError {
    #[snafu(display("logpack header checksum mismatch at lsid {}", lsid))]
    HeaderChecksumMismatch { lsid: u64 },
    #[snafu(display("logpack header lsid mismatch: expected {}, found {}", expected, found))]
    HeaderLsidMismatch { expected: u64, found: u64 },
    #[snafu(display("logpack record checksum mismatch for record {} at lsid {}", index, lsid))]
    RecordChecksumMismatch { index: usize, lsid: u64 },
    #[snafu(display("logpack header declares {} records, sector only holds {}", declared, capacity))]
    TooManyRecords { declared: usize, capacity: usize },
}

const FLAG_EXIST: u8 = 1 << 0;
const FLAG_PADDING: u8 = 1 << 1;
const FLAG_DISCARD: u8 = 1 << 2;

/// One record inside a log-pack header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRecord {
    pub is_exist: bool,
    pub is_padding: bool,
    pub is_discard: bool,
    /// Absolute LSID of this record's payload (`logpack_lsid + lsid_local`).
    pub lsid: u64,
    /// Offset of this record's payload within the pack, in physical blocks.
    pub lsid_local: u32,
    /// Host-visible offset of the write this record represents, in LBS.
    pub offset: u64,
    /// Size of the write this record represents, in LBS.
    pub io_size: u32,
    /// Checksum of the record's payload bytes (0 for padding/discard).
    pub checksum: u32,
}

impl LogRecord {
    /// Size of this record's payload, in physical blocks of `sector_size`.
    pub fn io_size_in_physical_blocks(&self, sector_size: u32) -> u32 {
        if self.is_padding || self.is_discard {
            return 0;
        }
        ((self.io_size as u64 * LBS) / sector_size as u64) as u32
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.checksum);
        buf.put_u64_le(self.lsid);
        buf.put_u32_le(self.lsid_local);
        let mut flags = 0u8;
        if self.is_exist {
            flags |= FLAG_EXIST;
        }
        if self.is_padding {
            flags |= FLAG_PADDING;
        }
        if self.is_discard {
            flags |= FLAG_DISCARD;
        }
        buf.put_u8(flags);
        buf.put_bytes(0, 3);
        buf.put_u64_le(self.offset);
        buf.put_u32_le(self.io_size);
    }

    fn decode(mut cur: &[u8]) -> Self {
        let checksum = cur.get_u32_le();
        let lsid = cur.get_u64_le();
        let lsid_local = cur.get_u32_le();
        let flags = cur.get_u8();
        cur.advance(3);
        let offset = cur.get_u64_le();
        let io_size = cur.get_u32_le();

        LogRecord {
            is_exist: flags & FLAG_EXIST != 0,
            is_padding: flags & FLAG_PADDING != 0,
            is_discard: flags & FLAG_DISCARD != 0,
            lsid,
            lsid_local,
            offset,
            io_size,
            checksum,
        }
    }
}

/// A log-pack header: the pack-level fields plus its record array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPackHeader {
    pub logpack_lsid: u64,
    /// Sum of every non-padding, non-discard record's payload size, in
    /// physical blocks.
    pub total_io_size: u32,
    pub records: Vec<LogRecord>,
}

impl LogPackHeader {
    /// Total size of this pack (header + payload), in physical blocks.
    pub fn pack_size_in_blocks(&self) -> u64 {
        1 + self.total_io_size as u64
    }

    /// LSID at which the pack following this one begins.
    pub fn next_lsid(&self) -> u64 {
        self.logpack_lsid + self.pack_size_in_blocks()
    }

    /// Encodes the header into a buffer exactly `sector_size` bytes, with a
    /// freshly computed, salted checksum.
    pub fn encode(&self, sector_size: usize, salt: u32) -> Bytes {
        let capacity = n_log_record_in_sector(sector_size);
        assert!(
            self.records.len() <= capacity,
            "too many records for this sector size"
        );

        let mut body = BytesMut::with_capacity(sector_size);
        body.put_u64_le(self.logpack_lsid);
        body.put_u32_le(self.total_io_size);
        body.put_u16_le(self.records.len() as u16);
        body.put_u16_le(0); // reserved
        body.put_u32_le(0); // header_checksum placeholder
        for record in &self.records {
            record.encode(&mut body);
        }
        body.resize(sector_size, 0);

        let sum = checksum::checksum(&body, salt);
        body[LOG_PACK_HEADER_FIXED_LEN - 4..LOG_PACK_HEADER_FIXED_LEN]
            .copy_from_slice(&sum.to_le_bytes());
        body.freeze()
    }

    /// Decodes and validates a header sector, checking the header checksum
    /// and that it declares itself at the expected LSID.
    pub fn decode(
        buf: &[u8],
        sector_size: usize,
        salt: u32,
        expected_lsid: u64,
    ) -> Result<Self, LogPackError> {
        if !checksum::verify(buf, LOG_PACK_HEADER_FIXED_LEN - 4, salt) {
            return Err(LogPackError::HeaderChecksumMismatch { lsid: expected_lsid });
        }

        let mut cur = &buf[..];
        let logpack_lsid = cur.get_u64_le();
        let total_io_size = cur.get_u32_le();
        let n_records = cur.get_u16_le() as usize;
        let _reserved = cur.get_u16_le();
        let _header_checksum = cur.get_u32_le();

        if logpack_lsid != expected_lsid {
            return Err(LogPackError::HeaderLsidMismatch {
                expected: expected_lsid,
                found: logpack_lsid,
            });
        }

        let capacity = n_log_record_in_sector(sector_size);
        if n_records > capacity {
            return Err(LogPackError::TooManyRecords {
                declared: n_records,
                capacity,
            });
        }

        let mut records = Vec::with_capacity(n_records);
        for i in 0..n_records {
            let start = LOG_PACK_HEADER_FIXED_LEN + i * LOG_RECORD_LEN;
            let end = start + LOG_RECORD_LEN;
            records.push(LogRecord::decode(&buf[start..end]));
        }

        Ok(LogPackHeader {
            logpack_lsid,
            total_io_size,
            records,
        })
    }

    /// Verifies every `is_exist` record's payload checksum against the
    /// concatenated payload bytes laid out immediately after the header
    /// sector, returning the index of the first record that fails (if any).
    pub fn verify_payload_checksums(
        &self,
        payload: &[u8],
        sector_size: usize,
        salt: u32,
    ) -> Result<(), LogPackError> {
        let mut cursor = 0usize;
        for (index, record) in self.records.iter().enumerate() {
            let blocks = record.io_size_in_physical_blocks(sector_size as u32) as usize;
            if record.is_padding || record.is_discard || !record.is_exist {
                cursor += blocks * sector_size;
                continue;
            }
            let start = cursor;
            let end = start + blocks * sector_size;
            let computed = checksum::checksum(&payload[start..end], salt);
            if computed != record.checksum {
                return Err(LogPackError::RecordChecksumMismatch {
                    index,
                    lsid: record.lsid,
                });
            }
            cursor = end;
        }
        Ok(())
    }
}

/// Computes the checksum for a single record's payload bytes.
pub fn record_payload_checksum(payload: &[u8], salt: u32) -> u32 {
    checksum::checksum(payload, salt)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> LogPackHeader {
        LogPackHeader {
            logpack_lsid: 42,
            total_io_size: 8,
            records: vec![
                LogRecord {
                    is_exist: true,
                    is_padding: false,
                    is_discard: false,
                    lsid: 43,
                    lsid_local: 1,
                    offset: 0,
                    io_size: 64,
                    checksum: 0xDEAD_BEEF,
                },
                LogRecord {
                    is_exist: true,
                    is_padding: false,
                    is_discard: true,
                    lsid: 44,
                    lsid_local: 2,
                    offset: 64,
                    io_size: 16,
                    checksum: 0,
                },
            ],
        }
    }

    #[test]
    fn header_round_trips() {
        let header = sample_header();
        let encoded = header.encode(4096, 0x1234);
        let decoded = LogPackHeader::decode(&encoded, 4096, 0x1234, 42).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn detects_header_corruption() {
        let header = sample_header();
        let mut encoded = header.encode(4096, 0x1234).to_vec();
        encoded[2000] ^= 0xFF;
        assert!(matches!(
            LogPackHeader::decode(&encoded, 4096, 0x1234, 42),
            Err(LogPackError::HeaderChecksumMismatch { .. })
        ));
    }

    #[test]
    fn detects_wrong_lsid() {
        let header = sample_header();
        let encoded = header.encode(4096, 0x1234);
        assert!(matches!(
            LogPackHeader::decode(&encoded, 4096, 0x1234, 99),
            Err(LogPackError::HeaderLsidMismatch { .. })
        ));
    }

    #[test]
    fn payload_checksum_catches_corruption() {
        let mut payload = vec![0xAAu8; 4096];
        let record_checksum = record_payload_checksum(&payload[..4096], 0x1234);
        let header = LogPackHeader {
            logpack_lsid: 1,
            total_io_size: 1,
            records: vec![LogRecord {
                is_exist: true,
                is_padding: false,
                is_discard: false,
                lsid: 2,
                lsid_local: 1,
                offset: 0,
                io_size: 8,
                checksum: record_checksum,
            }],
        };
        assert!(header.verify_payload_checksums(&payload, 4096, 0x1234).is_ok());
        payload[0] ^= 1;
        assert!(header.verify_payload_checksums(&payload, 4096, 0x1234).is_err());
    }
}
