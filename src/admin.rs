//! The administrative command set: everything an operator or a management
//! sidecar can ask of an attached [`crate::engine::WalEngine`] beyond
//! ordinary reads and writes.
//!
//! One request enum, one response enum, serde-derived so the same types
//! serialize over whatever transport an embedder chooses (a CLI, a control
//! socket, an admin HTTP endpoint) without this crate picking one for them.

use serde::{Deserialize, Serialize};

/// One administrative request, dispatched through
/// [`crate::engine::WalEngine::dispatch`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdminCommand {
    GetOldestLsid,
    GetWrittenLsid,
    GetPermanentLsid,
    GetCompletedLsid,
    SetOldestLsid { lsid: u64 },
    GetLogUsage,
    GetLogCapacity,
    IsLogOverflow,
    TakeCheckpoint,
    GetCheckpointInterval,
    SetCheckpointInterval { interval_ms: u32 },
    CreateSnapshot { name: String, lsid: u64 },
    DeleteSnapshot { name: String },
    DeleteSnapshotRange { lsid0: u64, lsid1: u64 },
    GetSnapshot { name: String },
    NumSnapshotInRange { lsid0: u64, lsid1: u64 },
    ListSnapshotRange { lsid0: u64, lsid1: u64, max: usize },
    ListSnapshotFrom { snapshot_id: u64, max: usize },
    Resize { new_size_lbs: u64 },
    ClearLog,
    Freeze { timeout_sec: u32 },
    Melt,
    IsFrozen,
    Version,
    GetGeo,
}

/// A snapshot record as surfaced over the admin interface, decoupled from
/// the on-log [`crate::snapshot::SnapshotRecord`] representation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub name: String,
    pub lsid: u64,
    pub timestamp: u64,
}

impl From<crate::snapshot::SnapshotRecord> for SnapshotInfo {
    fn from(record: crate::snapshot::SnapshotRecord) -> Self {
        SnapshotInfo { name: record.name, lsid: record.lsid, timestamp: record.timestamp }
    }
}

/// Device geometry as surfaced by `GETGEO`: a fabricated cylinder/head/
/// sector triple derived from `device_size`, using a fixed
/// `heads=4, sectors=16, start=4` convention rather than anything read
/// off the underlying hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceGeo {
    pub cylinders: u64,
    pub heads: u32,
    pub sectors: u32,
    pub start: u32,
}

impl DeviceGeo {
    /// Builds the `GETGEO` response for a device of `device_size_lbs`
    /// logical blocks: `{cylinders=size>>6, heads=4, sectors=16, start=4}`.
    pub fn from_device_size(device_size_lbs: u64) -> Self {
        DeviceGeo {
            cylinders: device_size_lbs >> 6,
            heads: 4,
            sectors: 16,
            start: 4,
        }
    }
}

/// The result of dispatching one [`AdminCommand`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CtlResponse {
    Lsid(u64),
    Bool(bool),
    U32(u32),
    U64(u64),
    Unit,
    Snapshot(SnapshotInfo),
    SnapshotList { records: Vec<SnapshotInfo>, next: u64 },
    Geo(DeviceGeo),
    Version(u32),
}
