//! Snapshot sector codec: a `{checksum, bitmap}` header followed by up to
//! `max_snapshots_in_sector(sector_size)` fixed-size records.
//!
//! Bit *i* of the bitmap means slot *i* is live. Persistence always rewrites
//! the whole sector with a freshly computed checksum; a sector that fails
//! checksum validation at load time is treated as empty (bitmap zeroed)
//! rather than aborting the whole store.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::record::SnapshotRecord;
use crate::format::checksum;
use crate::format::constants::{max_snapshots_in_sector, SNAPSHOT_RECORD_LEN, SNAPSHOT_SECTOR_HEADER_LEN};

#[derive(Debug, Clone)]
pub struct SnapshotSector {
    pub bitmap: u32,
    pub slots: Vec<Option<SnapshotRecord>>,
}

impl SnapshotSector {
    pub fn empty(sector_size: usize) -> Self {
        SnapshotSector {
            bitmap: 0,
            slots: vec![None; max_snapshots_in_sector(sector_size)],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn first_free_slot(&self) -> Option<usize> {
        (0..self.slots.len()).find(|&i| self.bitmap & (1 << i) == 0)
    }

    pub fn set(&mut self, slot: usize, record: SnapshotRecord) {
        self.bitmap |= 1 << slot;
        self.slots[slot] = Some(record);
    }

    pub fn clear(&mut self, slot: usize) {
        self.bitmap &= !(1 << slot);
        self.slots[slot] = None;
    }

    pub fn encode(&self, sector_size: usize) -> Bytes {
        let mut body = BytesMut::with_capacity(sector_size);
        body.put_u32_le(0); // checksum placeholder
        body.put_u32_le(self.bitmap);
        for slot in &self.slots {
            match slot {
                Some(record) => record.encode(&mut body),
                None => body.put_bytes(0, SNAPSHOT_RECORD_LEN),
            }
        }
        body.resize(sector_size, 0);

        let sum = checksum::checksum(&body, 0);
        body[0..4].copy_from_slice(&sum.to_le_bytes());
        body.freeze()
    }

    /// Decodes a sector, treating checksum failure as an empty sector
    /// (bitmap zeroed) rather than propagating an error.
    pub fn decode(buf: &[u8], sector_size: usize) -> Self {
        if !checksum::verify(buf, 0, 0) {
            return Self::empty(sector_size);
        }

        let mut cur = &buf[4..];
        let bitmap = cur.get_u32_le();
        let capacity = max_snapshots_in_sector(sector_size);
        let mut slots = Vec::with_capacity(capacity);
        for i in 0..capacity {
            let start = SNAPSHOT_SECTOR_HEADER_LEN + i * SNAPSHOT_RECORD_LEN;
            let end = start + SNAPSHOT_RECORD_LEN;
            if bitmap & (1 << i) != 0 {
                slots.push(Some(SnapshotRecord::decode(&buf[start..end])));
            } else {
                slots.push(None);
            }
        }
        let _ = cur;

        SnapshotSector { bitmap, slots }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_round_trips_with_sparse_slots() {
        let mut sector = SnapshotSector::empty(4096);
        sector.set(
            0,
            SnapshotRecord { lsid: 1, timestamp: 10, name: "a".into() },
        );
        sector.set(
            3,
            SnapshotRecord { lsid: 2, timestamp: 20, name: "b".into() },
        );

        let encoded = sector.encode(4096);
        let decoded = SnapshotSector::decode(&encoded, 4096);
        assert_eq!(decoded.bitmap, sector.bitmap);
        assert_eq!(decoded.slots[0].as_ref().unwrap().name, "a");
        assert_eq!(decoded.slots[3].as_ref().unwrap().name, "b");
        assert!(decoded.slots[1].is_none());
    }

    #[test]
    fn corrupt_sector_decodes_empty() {
        let mut sector = SnapshotSector::empty(4096);
        sector.set(0, SnapshotRecord { lsid: 1, timestamp: 1, name: "x".into() });
        let mut encoded = sector.encode(4096).to_vec();
        encoded[500] ^= 0xFF;

        let decoded = SnapshotSector::decode(&encoded, 4096);
        assert_eq!(decoded.bitmap, 0);
    }
}
