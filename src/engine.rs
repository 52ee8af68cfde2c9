//! The top-level engine: wires the LSID controller, L/D block devices,
//! redo, checkpoint loop, freeze interlock, snapshot store, and write
//! pipeline together behind one handle, and implements the admin command
//! set.
//!
//! One struct owns every collaborator's `Arc`; `attach`/`detach` bracket
//! the handle's lifetime around opening and closing its backing devices,
//! and every fallible admin operation returns the crate's aggregated
//! [`EngineError`].

use std::sync::Arc;

use bytes::Bytes;
use snafu::Snafu;
use tracing::{info, instrument, warn};

use crate::admin::{AdminCommand, CtlResponse, DeviceGeo};
use crate::checkpoint::CheckpointLoop;
use crate::config::EngineConfig;
use crate::device::BlockDevice;
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::format::constants::{
    metadata_offset, ring_buffer_offset, super0_offset, super1_offset, FORMAT_VERSION, LBS,
};
use crate::format::superblock::SuperSector;
use crate::freeze::FreezeState;
use crate::lsid::LsidController;
use crate::pipeline::{PipelineHandle, WritePipeline};
use crate::ring_io::RingGeometry;
use crate::snapshot::SnapshotStore;
use crate::usage::UsageHandle;

#[derive(Debug, Snafu)]
pub enum AttachError {
    #[snafu(display("attach I/O error: {}", source))]
    Io { source: std::io::Error },
    #[snafu(display("both superblock copies failed validation: {}", reason))]
    SuperblockUnreadable { reason: String },
}

impl From<AttachError> for EngineError {
    fn from(e: AttachError) -> Self {
        EngineError::new(ErrorKind::MetadataInvalid, e)
    }
}

struct Geometry {
    sector_size: u32,
    snapshot_metadata_size: u32,
    super0_off: u64,
    super1_off: u64,
    metadata_off: u64,
    ring_buffer_off: u64,
    ring_buffer_size: u64,
    uuid: [u8; 16],
    log_checksum_salt: u32,
    device_size: u64,
}

/// One attached WAL device: the log device L, the data device D, and every
/// piece of engine state layered on top of them.
pub struct WalEngine<L: BlockDevice, D: BlockDevice> {
    log_device: Arc<L>,
    data_device: Arc<D>,
    lsid: Arc<LsidController>,
    config: parking_lot::RwLock<EngineConfig>,
    usage: UsageHandle,
    checkpoint: Arc<CheckpointLoop<L>>,
    freeze: Arc<FreezeState>,
    snapshots: SnapshotStore<L>,
    pipeline: PipelineHandle,
    geometry: parking_lot::RwLock<Geometry>,
    name: String,
}

impl<L: BlockDevice + 'static, D: BlockDevice + 'static> WalEngine<L, D> {
    fn lbs_per_sector(sector_size: u32) -> u64 {
        sector_size as u64 / LBS
    }

    async fn read_sector(device: &L, off_sectors: u64, sector_size: u32) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0u8; sector_size as usize];
        device.read_at(off_sectors * Self::lbs_per_sector(sector_size), &mut buf).await?;
        Ok(buf)
    }

    async fn write_sector(device: &L, off_sectors: u64, sector_size: u32, buf: &[u8]) -> std::io::Result<()> {
        device.write_at(off_sectors * Self::lbs_per_sector(sector_size), buf).await
    }

    /// Formats a brand-new device pair: writes both superblock copies and
    /// an empty snapshot-metadata region, then attaches to it.
    #[instrument(skip(log_device, data_device, config))]
    pub async fn format(
        log_device: Arc<L>,
        data_device: Arc<D>,
        name: &str,
        sector_size: u32,
        snapshot_metadata_size: u32,
        ring_buffer_size: u64,
        device_size_lbs: u64,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        use rand::RngCore;
        let mut uuid = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut uuid);
        let log_checksum_salt = rand::thread_rng().next_u32();

        let super_sector = SuperSector::new_formatted(
            sector_size,
            snapshot_metadata_size,
            ring_buffer_size,
            device_size_lbs,
            uuid,
            log_checksum_salt,
            name,
        );
        let encoded = super_sector.encode(sector_size as usize);

        let super0_off = super0_offset(sector_size as u64);
        let super1_off = super1_offset(sector_size as u64, snapshot_metadata_size as u64);
        Self::write_sector(log_device.as_ref(), super0_off, sector_size, &encoded)
            .await
            .map_err(|source| AttachError::Io { source })?;
        Self::write_sector(log_device.as_ref(), super1_off, sector_size, &encoded)
            .await
            .map_err(|source| AttachError::Io { source })?;

        let metadata_off = metadata_offset(sector_size as u64);
        let empty_sector = crate::snapshot::SnapshotSector::empty(sector_size as usize).encode(sector_size as usize);
        for i in 0..snapshot_metadata_size {
            Self::write_sector(log_device.as_ref(), metadata_off + i as u64, sector_size, &empty_sector)
                .await
                .map_err(|source| AttachError::Io { source })?;
        }

        Self::attach(log_device, data_device, name, config).await
    }

    /// Attaches to an already-formatted device pair: validates the
    /// superblocks, replays the log onto D, and brings up every
    /// background collaborator.
    #[instrument(skip(log_device, data_device, config))]
    pub async fn attach(
        log_device: Arc<L>,
        data_device: Arc<D>,
        name: &str,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        // Superblock geometry is self-describing only once decoded, so probe
        // a reasonable number of candidate sector sizes the way the caller's
        // `format` call would have used. In practice embedders know their
        // own sector size; we start from the smallest plausible value.
        let probe_sizes = [512u32, 4096];
        let mut decoded = None;
        for sector_size in probe_sizes {
            let super0_off = super0_offset(sector_size as u64);
            let Ok(buf) = Self::read_sector(log_device.as_ref(), super0_off, sector_size).await else { continue };
            if let Ok(sb) = SuperSector::decode(&buf) {
                decoded = Some(sb);
                break;
            }
        }
        let super_sector = match decoded {
            Some(sb) => sb,
            None => {
                return Err(AttachError::SuperblockUnreadable {
                    reason: "no candidate sector size decoded the primary superblock".to_string(),
                }
                .into())
            }
        };

        let sector_size = super_sector.sector_size;
        let super0_off = super0_offset(sector_size as u64);
        let super1_off = super1_offset(sector_size as u64, super_sector.snapshot_metadata_size as u64);
        let metadata_off = metadata_offset(sector_size as u64);
        let ring_buffer_off = ring_buffer_offset(sector_size as u64, super_sector.snapshot_metadata_size as u64);

        // Cross-check the secondary copy; recover from it if the primary
        // decoded but disagrees catastrophically is out of scope here (the
        // checksum already validated it), but if reads of it fail we still
        // proceed on the primary alone.
        if let Ok(buf1) = Self::read_sector(log_device.as_ref(), super1_off, sector_size).await {
            if SuperSector::decode(&buf1).is_err() {
                warn!("secondary superblock failed validation; continuing on the primary");
            }
        }

        let usage = UsageHandle::new(name.to_string());
        usage.set_log_capacity(super_sector.ring_buffer_size);

        let redo_snapshot = crate::redo::run(
            log_device.as_ref(),
            data_device.as_ref(),
            &super_sector,
            ring_buffer_off,
            &usage,
        )
        .await?;

        let lsid = Arc::new(LsidController::from_snapshot(
            super_sector.ring_buffer_size,
            config.fast_mode,
            redo_snapshot,
        ));

        let snapshots = SnapshotStore::load(
            Arc::clone(&log_device),
            metadata_off,
            super_sector.snapshot_metadata_size as u64,
            sector_size as usize,
        )
        .await?;

        usage.set_read_only(lsid.is_read_only());
        usage.set_log_usage(lsid.log_usage());

        let checkpoint = CheckpointLoop::new(
            Arc::clone(&log_device),
            Arc::clone(&lsid),
            usage.clone(),
            super0_off,
            super1_off,
            sector_size,
            super_sector.snapshot_metadata_size,
            super_sector.ring_buffer_size,
            super_sector.uuid,
            super_sector.log_checksum_salt,
            super_sector.device_size,
            config.checkpoint_interval_ms,
        );
        checkpoint.start_checkpointing();

        let ring_geo = RingGeometry {
            ring_buffer_off,
            ring_buffer_size: super_sector.ring_buffer_size,
            sector_size,
            log_checksum_salt: super_sector.log_checksum_salt,
        };
        let pipeline = WritePipeline::spawn(
            Arc::clone(&log_device),
            Arc::clone(&data_device),
            Arc::clone(&lsid),
            config.clone(),
            usage.clone(),
            ring_geo,
        );

        info!(name, written = lsid.get_written(), "attached WAL device");

        Ok(Self {
            log_device,
            data_device,
            lsid,
            config: parking_lot::RwLock::new(config),
            usage,
            checkpoint,
            freeze: Arc::new(FreezeState::new()),
            snapshots,
            pipeline,
            geometry: parking_lot::RwLock::new(Geometry {
                sector_size,
                snapshot_metadata_size: super_sector.snapshot_metadata_size,
                super0_off,
                super1_off,
                metadata_off,
                ring_buffer_off,
                ring_buffer_size: super_sector.ring_buffer_size,
                uuid: super_sector.uuid,
                log_checksum_salt: super_sector.log_checksum_salt,
                device_size: super_sector.device_size,
            }),
            name: name.to_string(),
        })
    }

    /// Stops the checkpoint loop, synchronously taking one final checkpoint.
    #[instrument(skip(self))]
    pub async fn detach(&self) -> EngineResult<()> {
        self.checkpoint.stop_checkpointing().await;
        self.checkpoint.take_checkpoint().await?;
        Ok(())
    }

    fn check_writable(&self) -> EngineResult<()> {
        if self.lsid.is_read_only() {
            return Err(EngineError::new(
                ErrorKind::ReadOnlyLatch,
                std::io::Error::new(std::io::ErrorKind::ReadOnly, "engine latched read-only"),
            ));
        }
        if self.freeze.is_frozen() {
            return Err(EngineError::new(
                ErrorKind::Invalid,
                std::io::Error::new(std::io::ErrorKind::Other, "device is frozen"),
            ));
        }
        Ok(())
    }

    #[instrument(skip(self, data))]
    pub async fn write(&self, offset_lbs: u64, data: Bytes) -> EngineResult<()> {
        self.check_writable()?;
        self.pipeline.write(offset_lbs, data).await
    }

    #[instrument(skip(self))]
    pub async fn discard(&self, offset_lbs: u64, size_lbs: u64) -> EngineResult<()> {
        self.check_writable()?;
        self.pipeline.discard(offset_lbs, size_lbs).await
    }

    /// Reads are always served regardless of freeze state.
    #[instrument(skip(self, buf))]
    pub async fn read(&self, offset_lbs: u64, buf: &mut [u8]) -> EngineResult<()> {
        self.data_device.read_at(offset_lbs, buf).await.map_err(EngineError::from)
    }

    #[instrument(skip(self))]
    pub async fn flush(&self) -> EngineResult<()> {
        self.pipeline.flush().await
    }

    /// Grows the virtual device. Grow-only, and requires the device be
    /// frozen first so no host I/O races the superblock rewrite.
    #[instrument(skip(self))]
    pub async fn resize(&self, new_size_lbs: u64) -> EngineResult<()> {
        if !self.freeze.is_frozen() {
            return Err(EngineError::new(
                ErrorKind::Invalid,
                std::io::Error::new(std::io::ErrorKind::Other, "resize requires the device to be frozen first"),
            ));
        }
        let mut geo = self.geometry.write();
        if new_size_lbs < geo.device_size {
            return Err(EngineError::new(
                ErrorKind::Invalid,
                std::io::Error::new(std::io::ErrorKind::Other, "resize is grow-only"),
            ));
        }
        if new_size_lbs > self.data_device.capacity_lbs() {
            return Err(EngineError::new(
                ErrorKind::Invalid,
                std::io::Error::new(std::io::ErrorKind::Other, "data device is not large enough for the requested size"),
            ));
        }

        geo.device_size = new_size_lbs;
        self.write_both_superblocks(&geo).await?;
        Ok(())
    }

    async fn write_both_superblocks(&self, geo: &Geometry) -> EngineResult<()> {
        let super_sector = SuperSector {
            sector_size: geo.sector_size,
            snapshot_metadata_size: geo.snapshot_metadata_size,
            uuid: geo.uuid,
            start_offset: 0,
            ring_buffer_size: geo.ring_buffer_size,
            oldest_lsid: self.lsid.get_oldest(),
            written_lsid: self.lsid.get_written(),
            device_size: geo.device_size,
            log_checksum_salt: geo.log_checksum_salt,
            format_version: FORMAT_VERSION,
            name: {
                let mut n = [0u8; crate::format::constants::DISK_NAME_LEN];
                let len = self.name.as_bytes().len().min(n.len() - 1);
                n[..len].copy_from_slice(&self.name.as_bytes()[..len]);
                n
            },
        };
        let encoded = super_sector.encode(geo.sector_size as usize);
        Self::write_sector(self.log_device.as_ref(), geo.super0_off, geo.sector_size, &encoded)
            .await
            .map_err(EngineError::from)?;
        Self::write_sector(self.log_device.as_ref(), geo.super1_off, geo.sector_size, &encoded)
            .await
            .map_err(EngineError::from)?;
        self.log_device.flush().await.map_err(EngineError::from)?;
        Ok(())
    }

    /// Reformats the log ring in place: requires the device be frozen,
    /// generates a fresh uuid/salt, resets every LSID cursor to zero, and
    /// drops every snapshot. Restores the prior LSID state on failure.
    #[instrument(skip(self))]
    pub async fn clear_log(&self) -> EngineResult<()> {
        if !self.freeze.is_frozen() {
            return Err(EngineError::new(
                ErrorKind::Invalid,
                std::io::Error::new(std::io::ErrorKind::Other, "clear_log requires the device to be frozen first"),
            ));
        }

        let saved = self.lsid.snapshot();

        let result: EngineResult<()> = async {
            use rand::RngCore;
            let mut uuid = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut uuid);
            let log_checksum_salt = rand::thread_rng().next_u32();

            {
                let mut geo = self.geometry.write();
                geo.uuid = uuid;
                geo.log_checksum_salt = log_checksum_salt;
            }

            self.lsid.reset();
            let geo_snapshot = {
                let geo = self.geometry.read();
                Geometry {
                    sector_size: geo.sector_size,
                    snapshot_metadata_size: geo.snapshot_metadata_size,
                    super0_off: geo.super0_off,
                    super1_off: geo.super1_off,
                    metadata_off: geo.metadata_off,
                    ring_buffer_off: geo.ring_buffer_off,
                    ring_buffer_size: geo.ring_buffer_size,
                    uuid: geo.uuid,
                    log_checksum_salt: geo.log_checksum_salt,
                    device_size: geo.device_size,
                }
            };
            self.write_both_superblocks(&geo_snapshot).await?;

            let names: Vec<String> = {
                let capacity = self.snapshots.len();
                let (records, _) = self.snapshots.list_range(0, u64::MAX, capacity);
                records.into_iter().map(|r| r.name).collect()
            };
            for name in names {
                self.snapshots.del(&name).await?;
            }

            Ok(())
        }
        .await;

        if let Err(e) = result {
            self.lsid.restore(saved);
            return Err(e);
        }
        self.usage.set_log_usage(0);
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn freeze(&self, timeout_sec: u32) -> EngineResult<()> {
        let freeze = Arc::clone(&self.freeze);
        let checkpoint = Arc::clone(&self.checkpoint);
        self.freeze
            .freeze(timeout_sec, move |generation| {
                if freeze.melt_from_timeout(generation).is_ok() {
                    checkpoint.start_checkpointing();
                }
            })
            .map_err(EngineError::from)?;
        self.checkpoint.stop_checkpointing().await;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn melt(&self) -> EngineResult<()> {
        self.freeze.melt().map_err(EngineError::from)?;
        self.checkpoint.start_checkpointing();
        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        self.freeze.is_frozen()
    }

    /// The single entry point for the administrative command set.
    #[instrument(skip(self))]
    pub async fn dispatch(&self, command: AdminCommand) -> EngineResult<CtlResponse> {
        match command {
            AdminCommand::GetOldestLsid => Ok(CtlResponse::Lsid(self.lsid.get_oldest())),
            AdminCommand::GetWrittenLsid => Ok(CtlResponse::Lsid(self.lsid.get_written())),
            AdminCommand::GetPermanentLsid => Ok(CtlResponse::Lsid(self.lsid.get_permanent())),
            AdminCommand::GetCompletedLsid => Ok(CtlResponse::Lsid(self.lsid.get_completed())),
            AdminCommand::SetOldestLsid { lsid } => {
                let written = self.lsid.get_written();
                let header_valid = lsid == written || self.validate_header_at(lsid).await;
                self.lsid.set_oldest(lsid, header_valid).map_err(EngineError::from)?;
                self.usage.set_log_usage(self.lsid.log_usage());
                Ok(CtlResponse::Unit)
            }
            AdminCommand::GetLogUsage => Ok(CtlResponse::U64(self.lsid.log_usage())),
            AdminCommand::GetLogCapacity => Ok(CtlResponse::U64(self.lsid.ring_buffer_size())),
            AdminCommand::IsLogOverflow => Ok(CtlResponse::Bool(self.lsid.is_log_overflow())),
            AdminCommand::TakeCheckpoint => {
                self.checkpoint.stop_checkpointing().await;
                let result = self.checkpoint.take_checkpoint().await;
                self.checkpoint.start_checkpointing();
                result.map_err(EngineError::from)?;
                Ok(CtlResponse::Unit)
            }
            AdminCommand::GetCheckpointInterval => Ok(CtlResponse::U32(self.checkpoint.interval_ms())),
            AdminCommand::SetCheckpointInterval { interval_ms } => {
                self.checkpoint.set_interval_ms(interval_ms).map_err(EngineError::from)?;
                self.config.write().checkpoint_interval_ms = interval_ms;
                Ok(CtlResponse::Unit)
            }
            AdminCommand::CreateSnapshot { name, lsid } => {
                let timestamp = self.lsid.get_completed();
                self.snapshots.add(&name, lsid, timestamp, self.lsid.get_completed()).await.map_err(EngineError::from)?;
                Ok(CtlResponse::Unit)
            }
            AdminCommand::DeleteSnapshot { name } => {
                self.snapshots.del(&name).await.map_err(EngineError::from)?;
                Ok(CtlResponse::Unit)
            }
            AdminCommand::DeleteSnapshotRange { lsid0, lsid1 } => {
                let n = self.snapshots.del_range(lsid0, lsid1).await.map_err(EngineError::from)?;
                Ok(CtlResponse::U64(n as u64))
            }
            AdminCommand::GetSnapshot { name } => {
                let record = self.snapshots.get(&name).map_err(EngineError::from)?;
                Ok(CtlResponse::Snapshot(record.into()))
            }
            AdminCommand::NumSnapshotInRange { lsid0, lsid1 } => {
                Ok(CtlResponse::U64(self.snapshots.n_records_range(lsid0, lsid1) as u64))
            }
            AdminCommand::ListSnapshotRange { lsid0, lsid1, max } => {
                let (records, next) = self.snapshots.list_range(lsid0, lsid1, max);
                Ok(CtlResponse::SnapshotList {
                    records: records.into_iter().map(Into::into).collect(),
                    next,
                })
            }
            AdminCommand::ListSnapshotFrom { snapshot_id, max } => {
                let (records, next) = self.snapshots.list_from(snapshot_id, max);
                Ok(CtlResponse::SnapshotList {
                    records: records.into_iter().map(Into::into).collect(),
                    next,
                })
            }
            AdminCommand::Resize { new_size_lbs } => {
                self.resize(new_size_lbs).await?;
                Ok(CtlResponse::Unit)
            }
            AdminCommand::ClearLog => {
                self.clear_log().await?;
                Ok(CtlResponse::Unit)
            }
            AdminCommand::Freeze { timeout_sec } => {
                self.freeze(timeout_sec).await?;
                Ok(CtlResponse::Unit)
            }
            AdminCommand::Melt => {
                self.melt().await?;
                Ok(CtlResponse::Unit)
            }
            AdminCommand::IsFrozen => Ok(CtlResponse::Bool(self.is_frozen())),
            AdminCommand::Version => Ok(CtlResponse::Version(FORMAT_VERSION)),
            AdminCommand::GetGeo => {
                let device_size = self.geometry.read().device_size;
                Ok(CtlResponse::Geo(DeviceGeo::from_device_size(device_size)))
            }
        }
    }

    /// Best-effort validation that the log-pack header at `lsid` still
    /// decodes, used to satisfy [`LsidController::set_oldest`]'s precondition
    /// for reclaiming space short of `written`.
    async fn validate_header_at(&self, lsid: u64) -> bool {
        let geo = self.geometry.read();
        let ring_geo = RingGeometry {
            ring_buffer_off: geo.ring_buffer_off,
            ring_buffer_size: geo.ring_buffer_size,
            sector_size: geo.sector_size,
            log_checksum_salt: geo.log_checksum_salt,
        };
        drop(geo);
        let Ok(buf) = crate::ring_io::read_physical_blocks(self.log_device.as_ref(), &ring_geo, lsid, 1).await else {
            return false;
        };
        crate::format::logpack::LogPackHeader::decode(&buf, ring_geo.sector_size as usize, ring_geo.log_checksum_salt, lsid).is_ok()
    }

    pub fn usage(&self) -> &UsageHandle {
        &self.usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::InMemoryBlockDevice;

    type TestEngine = WalEngine<InMemoryBlockDevice, InMemoryBlockDevice>;

    async fn fresh_engine(
        sector_size: u32,
        snapshot_metadata_size: u32,
        ring_buffer_size: u64,
        device_size_lbs: u64,
    ) -> TestEngine {
        let log = InMemoryBlockDevice::new(8192);
        let data = InMemoryBlockDevice::new(device_size_lbs.max(8192));
        let config = crate::config::EngineConfigBuilder::new()
            .log_flush_interval_ms(0)
            .log_flush_interval_pb(0)
            .build()
            .unwrap();
        WalEngine::format(
            log,
            data,
            "wal0",
            sector_size,
            snapshot_metadata_size,
            ring_buffer_size,
            device_size_lbs,
            config,
        )
        .await
        .unwrap()
    }

    /// Scenario 1: write, then reattach (simulating a restart) and confirm
    /// the payload survives and the cursors land past the written pack.
    #[tokio::test]
    async fn basic_round_trip_survives_a_restart() {
        let engine = fresh_engine(4096, 4, 256, 4096).await;
        let payload = Bytes::from(vec![0xA5u8; 64 * 1024]);
        engine.write(0, payload.clone()).await.unwrap();

        let mut read_back = vec![0u8; payload.len()];
        engine.read(0, &mut read_back).await.unwrap();
        assert_eq!(read_back, payload.to_vec());

        let written = engine.lsid.get_written();
        engine.detach().await.unwrap();

        // "Restart": attach to the same device pair again.
        let reattached = WalEngine::attach(
            Arc::clone(&engine.log_device),
            Arc::clone(&engine.data_device),
            "wal0",
            crate::config::EngineConfigBuilder::new().build().unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(reattached.lsid.get_written(), written);

        let mut read_after_restart = vec![0u8; payload.len()];
        reattached.read(0, &mut read_after_restart).await.unwrap();
        assert_eq!(read_after_restart, payload.to_vec());
    }

    /// Scenario 2: exhausting the ring latches read-only and surfaces
    /// `IS_LOG_OVERFLOW`.
    #[tokio::test]
    async fn log_overflow_latches_read_only() {
        let engine = fresh_engine(512, 1, 16, 1024).await;

        let mut last_result = Ok(());
        for i in 0..10u64 {
            last_result = engine.write(i, Bytes::from(vec![0xAAu8; 512])).await;
            if last_result.is_err() {
                break;
            }
        }
        assert!(last_result.is_err());

        let overflow = engine.dispatch(AdminCommand::IsLogOverflow).await.unwrap();
        assert_eq!(overflow, CtlResponse::Bool(true));
    }

    /// Scenario 3: `SET_OLDEST_LSID` accepts a validated earlier pack start
    /// or `written` itself, and rejects anything past `written`.
    #[tokio::test]
    async fn set_oldest_lsid_validates_against_written() {
        let engine = fresh_engine(512, 1, 64, 1024).await;
        for i in 0..5u64 {
            engine.write(i, Bytes::from(vec![0xBBu8; 512])).await.unwrap();
        }

        let written = match engine.dispatch(AdminCommand::GetWrittenLsid).await.unwrap() {
            CtlResponse::Lsid(lsid) => lsid,
            other => panic!("unexpected response {other:?}"),
        };
        assert!(written > 0);

        // lsid 2 is the start of the second pack (each pack here is header +
        // 1 payload block = 2 physical blocks), so its header validates.
        assert!(engine.dispatch(AdminCommand::SetOldestLsid { lsid: 2 }).await.is_ok());

        // == written always succeeds.
        assert!(engine
            .dispatch(AdminCommand::SetOldestLsid { lsid: written })
            .await
            .is_ok());

        // past written always fails.
        assert!(engine
            .dispatch(AdminCommand::SetOldestLsid { lsid: written + 100 })
            .await
            .is_err());
    }

    /// Scenario 4: freeze, clear_log, melt resets every cursor and drops
    /// every snapshot.
    #[tokio::test]
    async fn freeze_clear_log_melt_resets_state() {
        let engine = fresh_engine(4096, 4, 256, 4096).await;
        engine.write(0, Bytes::from(vec![0xCCu8; 4096])).await.unwrap();
        engine
            .dispatch(AdminCommand::CreateSnapshot { name: "before".to_string(), lsid: 0 })
            .await
            .unwrap();

        engine.dispatch(AdminCommand::Freeze { timeout_sec: 0 }).await.unwrap();
        engine.dispatch(AdminCommand::ClearLog).await.unwrap();
        engine.dispatch(AdminCommand::Melt).await.unwrap();

        assert_eq!(
            engine.dispatch(AdminCommand::GetOldestLsid).await.unwrap(),
            CtlResponse::Lsid(0)
        );
        assert_eq!(
            engine.dispatch(AdminCommand::GetWrittenLsid).await.unwrap(),
            CtlResponse::Lsid(0)
        );
        assert_eq!(
            engine.dispatch(AdminCommand::IsLogOverflow).await.unwrap(),
            CtlResponse::Bool(false)
        );
        assert_eq!(
            engine
                .dispatch(AdminCommand::NumSnapshotInRange { lsid0: 0, lsid1: u64::MAX })
                .await
                .unwrap(),
            CtlResponse::U64(0)
        );
        assert!(!engine.is_frozen());
    }

    /// Scenario 6: bounded-size snapshot pagination exhausts the range and
    /// reports `INVALID_LSID` once done.
    #[tokio::test]
    async fn snapshot_pagination_exhausts_the_range() {
        // 4 metadata sectors x 32 records/sector (bitmap width) covers 100 snapshots.
        let engine = fresh_engine(4096, 4, 256, 4096).await;
        for i in 0..100u64 {
            engine
                .dispatch(AdminCommand::CreateSnapshot { name: format!("s{i}"), lsid: i })
                .await
                .unwrap();
        }

        let mut next = 0u64;
        let mut total = 0usize;
        let mut pages = 0usize;
        loop {
            let response = engine
                .dispatch(AdminCommand::ListSnapshotRange { lsid0: next, lsid1: u64::MAX, max: 10 })
                .await
                .unwrap();
            let CtlResponse::SnapshotList { records, next: returned_next } = response else {
                panic!("unexpected response");
            };
            next = returned_next;
            if records.is_empty() {
                break;
            }
            total += records.len();
            pages += 1;
            if next == crate::format::constants::INVALID_LSID || pages > 20 {
                break;
            }
        }
        assert_eq!(total, 100);
        assert_eq!(pages, 10);
        assert_eq!(next, crate::format::constants::INVALID_LSID);
    }

    /// Resize is grow-only and requires the device be frozen first.
    #[tokio::test]
    async fn resize_requires_freeze_and_rejects_shrink() {
        let engine = fresh_engine(4096, 4, 256, 2048).await;
        assert!(engine.resize(4096).await.is_err());

        engine.freeze(0).await.unwrap();
        assert!(engine.resize(1024).await.is_err()); // shrink
        engine.resize(4096).await.unwrap();
        engine.melt().await.unwrap();

        let geo = engine.dispatch(AdminCommand::GetGeo).await.unwrap();
        assert_eq!(geo, CtlResponse::Geo(DeviceGeo { cylinders: 4096 >> 6, heads: 4, sectors: 16, start: 4 }));
    }
}

