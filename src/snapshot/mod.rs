//! The on-log snapshot store: a small array of sectors in the
//! snapshot-metadata region, backed in memory by a name index and an
//! ordered `(lsid, snapshot_id)` multi-index for range queries.

mod record;
mod sector;

pub use record::{validate_name, SnapshotRecord};
pub use sector::SnapshotSector;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use snafu::Snafu;

use crate::device::BlockDevice;
use crate::format::constants::{max_snapshots_in_sector, INVALID_LSID};

#[derive(Debug, Snafu)]
pub enum SnapshotError {
    #[snafu(display("snapshot {:?} already exists", name))]
    AlreadyExists { name: String },
    #[snafu(display("snapshot {:?} not found", name))]
    NotFound { name: String },
    #[snafu(display("no free snapshot slot remains in the metadata region"))]
    NoFreeSlot,
    #[snafu(display("snapshot name {:?} is invalid", name))]
    InvalidName { name: String },
    #[snafu(display("snapshot store I/O error: {}", source))]
    Io { source: std::io::Error },
}

/// Global, monotonically assigned identifier for a snapshot slot, stable
/// across store mutations (used by `list_from`'s pagination cursor).
type SnapshotId = u64;

struct Slot {
    sector: usize,
    index: usize,
}

/// The in-memory view of the on-log snapshot sector array.
///
/// Readers and mutators share a single read-write lock; all mutators take
/// it exclusively.
pub struct SnapshotStore<D: BlockDevice> {
    device: Arc<D>,
    sector_offset: u64,
    sector_size: usize,
    per_sector: usize,
    inner: parking_lot::RwLock<Inner>,
}

struct Inner {
    sectors: Vec<sector::SnapshotSector>,
    by_name: HashMap<String, SnapshotId>,
    by_id: HashMap<SnapshotId, Slot>,
    by_lsid: BTreeSet<(u64, SnapshotId)>,
}

impl<D: BlockDevice> SnapshotStore<D> {
    fn slot_to_id(&self, sector: usize, index: usize) -> SnapshotId {
        (sector * self.per_sector + index) as u64
    }

    fn id_to_slot(&self, id: SnapshotId) -> (usize, usize) {
        let id = id as usize;
        (id / self.per_sector, id % self.per_sector)
    }

    /// Loads the snapshot-metadata region from `device`, validating each
    /// sector's checksum and reconstructing both indices. Sectors that fail
    /// checksum decode as empty.
    pub async fn load(
        device: Arc<D>,
        sector_offset: u64,
        sector_count: u64,
        sector_size: usize,
    ) -> Result<Self, SnapshotError> {
        let per_sector = max_snapshots_in_sector(sector_size);
        let mut sectors = Vec::with_capacity(sector_count as usize);
        let mut by_name = HashMap::new();
        let mut by_id = HashMap::new();
        let mut by_lsid = BTreeSet::new();

        for sector_idx in 0..sector_count as usize {
            let lbs_per_sector = sector_size as u64 / crate::format::constants::LBS;
            let mut buf = vec![0u8; sector_size];
            device
                .read_at((sector_offset + sector_idx as u64) * lbs_per_sector, &mut buf)
                .await
                .map_err(|source| SnapshotError::Io { source })?;
            let decoded = sector::SnapshotSector::decode(&buf, sector_size);

            for (slot_idx, slot) in decoded.slots.iter().enumerate() {
                if let Some(record) = slot {
                    let id = (sector_idx * per_sector + slot_idx) as u64;
                    by_name.insert(record.name.clone(), id);
                    by_id.insert(id, Slot { sector: sector_idx, index: slot_idx });
                    by_lsid.insert((record.lsid, id));
                }
            }
            sectors.push(decoded);
        }

        Ok(SnapshotStore {
            device,
            sector_offset,
            sector_size,
            per_sector,
            inner: parking_lot::RwLock::new(Inner { sectors, by_name, by_id, by_lsid }),
        })
    }

    async fn persist_sector(&self, sector_idx: usize) -> Result<(), SnapshotError> {
        let encoded = {
            let inner = self.inner.read();
            inner.sectors[sector_idx].encode(self.sector_size)
        };
        let lbs_per_sector = self.sector_size as u64 / crate::format::constants::LBS;
        self.device
            .write_at((self.sector_offset + sector_idx as u64) * lbs_per_sector, &encoded)
            .await
            .map_err(|source| SnapshotError::Io { source })
    }

    /// Adds a new snapshot. `lsid == INVALID_LSID` substitutes
    /// `completed_lsid`.
    pub async fn add(
        &self,
        name: &str,
        lsid: u64,
        timestamp: u64,
        completed_lsid: u64,
    ) -> Result<(), SnapshotError> {
        if !record::validate_name(name) {
            return Err(SnapshotError::InvalidName { name: name.to_string() });
        }
        let lsid = if lsid == INVALID_LSID { completed_lsid } else { lsid };

        let sector_idx = {
            let inner = self.inner.read();
            if inner.by_name.contains_key(name) {
                return Err(SnapshotError::AlreadyExists { name: name.to_string() });
            }
            inner
                .sectors
                .iter()
                .position(|s| s.first_free_slot().is_some())
        };
        let Some(sector_idx) = sector_idx else {
            return Err(SnapshotError::NoFreeSlot);
        };

        {
            let mut inner = self.inner.write();
            let slot_idx = inner.sectors[sector_idx].first_free_slot().ok_or(SnapshotError::NoFreeSlot)?;
            inner.sectors[sector_idx].set(
                slot_idx,
                record::SnapshotRecord { lsid, timestamp, name: name.to_string() },
            );
            let id = (sector_idx * self.per_sector + slot_idx) as u64;
            inner.by_name.insert(name.to_string(), id);
            inner.by_id.insert(id, Slot { sector: sector_idx, index: slot_idx });
            inner.by_lsid.insert((lsid, id));
        }

        self.persist_sector(sector_idx).await
    }

    pub async fn del(&self, name: &str) -> Result<(), SnapshotError> {
        let (sector_idx, id, lsid) = {
            let inner = self.inner.read();
            let id = *inner
                .by_name
                .get(name)
                .ok_or_else(|| SnapshotError::NotFound { name: name.to_string() })?;
            let slot = &inner.by_id[&id];
            let lsid = inner.sectors[slot.sector].slots[slot.index].as_ref().unwrap().lsid;
            (slot.sector, id, lsid)
        };

        {
            let mut inner = self.inner.write();
            let slot_idx = self.id_to_slot(id).1;
            inner.sectors[sector_idx].clear(slot_idx);
            inner.by_name.remove(name);
            inner.by_id.remove(&id);
            inner.by_lsid.remove(&(lsid, id));
        }

        self.persist_sector(sector_idx).await
    }

    /// Deletes every record with `lsid0 <= record.lsid < lsid1`, returning
    /// the count removed.
    pub async fn del_range(&self, lsid0: u64, lsid1: u64) -> Result<usize, SnapshotError> {
        let victims: Vec<(u64, SnapshotId)> = {
            let inner = self.inner.read();
            inner
                .by_lsid
                .range((lsid0, u64::MIN)..(lsid1, u64::MIN))
                .copied()
                .collect()
        };

        let mut touched_sectors = BTreeSet::new();
        {
            let mut inner = self.inner.write();
            for (lsid, id) in &victims {
                let slot = inner.by_id.remove(id).unwrap();
                let name = inner.sectors[slot.sector].slots[slot.index].take().map(|r| r.name);
                inner.sectors[slot.sector].bitmap &= !(1 << slot.index);
                if let Some(name) = name {
                    inner.by_name.remove(&name);
                }
                inner.by_lsid.remove(&(*lsid, *id));
                touched_sectors.insert(slot.sector);
            }
        }

        for sector_idx in touched_sectors {
            self.persist_sector(sector_idx).await?;
        }
        Ok(victims.len())
    }

    pub fn get(&self, name: &str) -> Result<record::SnapshotRecord, SnapshotError> {
        let inner = self.inner.read();
        let id = *inner
            .by_name
            .get(name)
            .ok_or_else(|| SnapshotError::NotFound { name: name.to_string() })?;
        let slot = &inner.by_id[&id];
        Ok(inner.sectors[slot.sector].slots[slot.index].clone().unwrap())
    }

    pub fn n_records_range(&self, lsid0: u64, lsid1: u64) -> usize {
        let inner = self.inner.read();
        inner.by_lsid.range((lsid0, u64::MIN)..(lsid1, u64::MIN)).count()
    }

    /// Bounded-size pagination over `[lsid0, lsid1)`. Returns up to
    /// `buf_capacity` records and the next LSID to resume from
    /// (`INVALID_LSID` when the range is exhausted).
    pub fn list_range(
        &self,
        lsid0: u64,
        lsid1: u64,
        buf_capacity: usize,
    ) -> (Vec<record::SnapshotRecord>, u64) {
        let inner = self.inner.read();
        let mut out = Vec::with_capacity(buf_capacity);
        let mut last_lsid = None;
        for (lsid, id) in inner.by_lsid.range((lsid0, u64::MIN)..(lsid1, u64::MIN)) {
            if out.len() == buf_capacity {
                break;
            }
            let slot = &inner.by_id[id];
            out.push(inner.sectors[slot.sector].slots[slot.index].clone().unwrap());
            last_lsid = Some(*lsid);
        }
        let next = match last_lsid {
            Some(lsid) => lsid + 1,
            None => INVALID_LSID,
        };
        (out, next)
    }

    /// Bounded-size pagination by opaque snapshot id, used to resume an
    /// iteration across calls.
    pub fn list_from(
        &self,
        snapshot_id: SnapshotId,
        buf_capacity: usize,
    ) -> (Vec<record::SnapshotRecord>, SnapshotId) {
        let inner = self.inner.read();
        let mut ids: Vec<SnapshotId> = inner.by_id.keys().copied().filter(|&id| id >= snapshot_id).collect();
        ids.sort_unstable();

        let mut out = Vec::with_capacity(buf_capacity);
        let mut next = INVALID_LSID;
        for (i, id) in ids.iter().enumerate() {
            if out.len() == buf_capacity {
                next = *id;
                break;
            }
            let slot = &inner.by_id[id];
            out.push(inner.sectors[slot.sector].slots[slot.index].clone().unwrap());
            if i + 1 == ids.len() {
                next = INVALID_LSID;
            }
        }
        (out, next)
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::InMemoryBlockDevice;

    async fn fresh_store() -> SnapshotStore<InMemoryBlockDevice> {
        let device = InMemoryBlockDevice::new(1024);
        SnapshotStore::load(device, 0, 4, 4096).await.unwrap()
    }

    #[tokio::test]
    async fn add_get_del_round_trip() {
        let store = fresh_store().await;
        store.add("nightly", 10, 100, 0).await.unwrap();
        let record = store.get("nightly").unwrap();
        assert_eq!(record.lsid, 10);

        store.del("nightly").await.unwrap();
        assert!(matches!(store.get("nightly"), Err(SnapshotError::NotFound { .. })));
    }

    #[tokio::test]
    async fn add_rejects_duplicate_name() {
        let store = fresh_store().await;
        store.add("a", 1, 1, 0).await.unwrap();
        assert!(matches!(
            store.add("a", 2, 2, 0).await,
            Err(SnapshotError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn del_range_removes_matching_lsids_only() {
        let store = fresh_store().await;
        for i in 0..10u64 {
            store.add(&format!("s{i}"), i, i, 0).await.unwrap();
        }
        let removed = store.del_range(3, 7).await.unwrap();
        assert_eq!(removed, 4);
        assert_eq!(store.len(), 6);
    }

    #[tokio::test]
    async fn list_range_paginates_with_next_cursor() {
        let store = fresh_store().await;
        for i in 0..20u64 {
            store.add(&format!("s{i}"), i, i, 0).await.unwrap();
        }
        let (page, next) = store.list_range(0, 20, 5);
        assert_eq!(page.len(), 5);
        assert_eq!(next, page.last().unwrap().lsid + 1);

        let (page2, next2) = store.list_range(next, 20, 100);
        assert_eq!(page2.len(), 15);
        assert_eq!(next2, INVALID_LSID);
    }
}
