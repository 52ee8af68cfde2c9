//! The write pipeline: admits host writes/discards/flushes, coalesces
//! them into log packs bounded by `max_logpack_pb`, reserves their LSID
//! range, submits the pack to L and its payload writes to D, and acks the
//! host once the configured durability policy is satisfied.
//!
//! A single task owns admission order — it is the sole caller of
//! [`crate::lsid::LsidController::reserve`] — and backpressure is a bounded
//! gate the caller awaits before a write is accepted.
//!
//! Unlike a design that lets many packs be in flight at once and reorders
//! their completions, this builder processes one pack at a time end to end
//! (L write, D writes, optional flush) before pulling the next batch off the
//! admission channel. That forfeits some pipelining depth but means `written`
//! and `completed` only ever need to advance monotonically in the order
//! packs were built — no reorder buffer is needed to track out-of-order
//! completions (see DESIGN.md).

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::{instrument, warn};

use crate::config::EngineConfig;
use crate::device::BlockDevice;
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::format::constants::LBS;
use crate::format::logpack::{record_payload_checksum, LogPackHeader, LogRecord};
use crate::lsid::LsidController;
use crate::ring_io::{write_physical_blocks, RingGeometry};
use crate::usage::UsageHandle;

enum OpKind {
    Write { offset_lbs: u64, data: Bytes },
    Discard { offset_lbs: u64, size_lbs: u64 },
    Flush,
}

impl OpKind {
    /// Physical blocks this op's payload occupies in the pack (0 for
    /// discard/flush, which carry no payload sectors).
    fn payload_blocks(&self, sector_size: u32) -> u64 {
        match self {
            OpKind::Write { data, .. } => data.len() as u64 / sector_size as u64,
            OpKind::Discard { .. } | OpKind::Flush => 0,
        }
    }

    /// Size of the host-visible operation in LBS, used for pending-sector
    /// accounting.
    fn lbs_size(&self) -> u64 {
        match self {
            OpKind::Write { data, .. } => data.len() as u64 / LBS,
            OpKind::Discard { size_lbs, .. } => *size_lbs,
            OpKind::Flush => 0,
        }
    }
}

struct AdmittedOp {
    kind: OpKind,
    ack: oneshot::Sender<EngineResult<()>>,
    _pending_permit: Option<OwnedSemaphorePermit>,
}

/// A cheaply-cloneable handle for submitting host I/O through the pipeline.
///
/// Holds the sending half of the admission channel; the builder task on the
/// other end is spawned by [`WritePipeline::spawn`].
#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<AdmittedOp>,
    pending_gate: Arc<Semaphore>,
    max_pending_sectors: u64,
    queue_stop_timeout: Duration,
    usage: UsageHandle,
}

impl PipelineHandle {
    /// Submits a write, returning once it has been acknowledged per the
    /// configured `require_l_first_ack` policy.
    #[instrument(skip(self, data))]
    pub async fn write(&self, offset_lbs: u64, data: Bytes) -> EngineResult<()> {
        let lbs = (data.len() as u64 / LBS).max(1);
        let permit = self.acquire_pending_permit(lbs).await;
        self.submit(OpKind::Write { offset_lbs, data }, permit).await
    }

    #[instrument(skip(self))]
    pub async fn discard(&self, offset_lbs: u64, size_lbs: u64) -> EngineResult<()> {
        let permit = self.acquire_pending_permit(size_lbs.max(1)).await;
        self.submit(OpKind::Discard { offset_lbs, size_lbs }, permit).await
    }

    /// Requests an explicit flush barrier: the host is acked once every pack
    /// admitted before this call is durable on L (`permanent`).
    #[instrument(skip(self))]
    pub async fn flush(&self) -> EngineResult<()> {
        self.submit(OpKind::Flush, None).await
    }

    async fn acquire_pending_permit(&self, n_lbs: u64) -> Option<OwnedSemaphorePermit> {
        let n = n_lbs.clamp(1, u32::MAX as u64) as u32;
        let result = tokio::time::timeout(
            self.queue_stop_timeout,
            Arc::clone(&self.pending_gate).acquire_many_owned(n),
        )
        .await;
        let permit = match result {
            Ok(Ok(permit)) => Some(permit),
            Ok(Err(_)) => None, // gate closed (engine shutting down); proceed uncounted
            Err(_) => {
                warn!(n_lbs, "pending-sector gate timed out; admitting anyway");
                None
            }
        };
        let used = self.max_pending_sectors.saturating_sub(self.pending_gate.available_permits() as u64);
        self.usage.set_pending_sectors(used);
        permit
    }

    async fn submit(&self, kind: OpKind, permit: Option<OwnedSemaphorePermit>) -> EngineResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let op = AdmittedOp { kind, ack: ack_tx, _pending_permit: permit };
        self.tx
            .send(op)
            .await
            .map_err(|_| EngineError::new(ErrorKind::Io, std::io::Error::new(std::io::ErrorKind::BrokenPipe, "write pipeline shut down")))?;
        ack_rx
            .await
            .map_err(|_| EngineError::new(ErrorKind::Io, std::io::Error::new(std::io::ErrorKind::BrokenPipe, "write pipeline dropped the op before acking")))?
    }
}

struct Fixed {
    ring_geo: RingGeometry,
}

/// The builder task's owned state. Not `Clone`; the pipeline's public
/// surface is [`PipelineHandle`].
pub struct WritePipeline<L: BlockDevice, D: BlockDevice> {
    log_device: Arc<L>,
    data_device: Arc<D>,
    lsid: Arc<LsidController>,
    config: EngineConfig,
    usage: UsageHandle,
    fixed: Fixed,
    io_gate: Arc<Semaphore>,
}

impl<L: BlockDevice + 'static, D: BlockDevice + 'static> WritePipeline<L, D> {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        log_device: Arc<L>,
        data_device: Arc<D>,
        lsid: Arc<LsidController>,
        config: EngineConfig,
        usage: UsageHandle,
        ring_geo: RingGeometry,
    ) -> PipelineHandle {
        let pending_gate = Arc::new(Semaphore::new(config.max_pending_sectors as usize));
        let max_pending_sectors = config.max_pending_sectors;
        let io_gate = Arc::new(Semaphore::new(config.n_io_bulk));
        let queue_stop_timeout = config.queue_stop_timeout;
        let (tx, rx) = mpsc::channel(config.n_io_bulk * 4);
        let handle_usage = usage.clone();

        let pipeline = Self {
            log_device,
            data_device,
            lsid,
            config,
            usage,
            fixed: Fixed { ring_geo },
            io_gate,
        };
        tokio::spawn(pipeline.run(rx));

        PipelineHandle { tx, pending_gate, max_pending_sectors, queue_stop_timeout, usage: handle_usage }
    }

    #[instrument(skip(self, rx))]
    async fn run(self, mut rx: mpsc::Receiver<AdmittedOp>) {
        let mut blocks_since_flush: u32 = 0;

        loop {
            let first = if self.config.log_flush_interval_ms > 0 {
                match tokio::time::timeout(
                    Duration::from_millis(self.config.log_flush_interval_ms as u64),
                    rx.recv(),
                )
                .await
                {
                    Ok(next) => next,
                    Err(_) => {
                        if blocks_since_flush > 0 {
                            self.issue_flush().await;
                            blocks_since_flush = 0;
                        }
                        continue;
                    }
                }
            } else {
                rx.recv().await
            };

            let Some(first) = first else { break };

            let max_records = crate::format::constants::n_log_record_in_sector(self.fixed.ring_geo.sector_size as usize);
            let mut batch = vec![first];
            let mut batch_blocks = batch[0].kind.payload_blocks(self.fixed.ring_geo.sector_size);
            while batch_blocks < self.config.max_logpack_pb as u64 && batch.len() < max_records {
                match rx.try_recv() {
                    Ok(op) => {
                        batch_blocks += op.kind.payload_blocks(self.fixed.ring_geo.sector_size);
                        batch.push(op);
                    }
                    Err(_) => break,
                }
            }

            blocks_since_flush += batch_blocks as u32;
            self.submit_batch(batch).await;

            if self.config.log_flush_interval_pb > 0 && blocks_since_flush >= self.config.log_flush_interval_pb {
                self.issue_flush().await;
                blocks_since_flush = 0;
            }
        }
    }

    /// Builds and submits one log pack for `batch`, then acks every op in it
    /// per the configured durability policy.
    #[instrument(skip(self, batch))]
    async fn submit_batch(&self, batch: Vec<AdmittedOp>) {
        let sector_size = self.fixed.ring_geo.sector_size;

        let mut records = Vec::with_capacity(batch.len());
        let mut payloads: Vec<Bytes> = Vec::new();
        let mut flush_acks = Vec::new();
        let mut d_ops: Vec<(LogRecord, Option<Bytes>, oneshot::Sender<EngineResult<()>>)> = Vec::new();
        let mut lsid_local = 1u32; // block 0 is the header

        for op in batch {
            match op.kind {
                OpKind::Flush => {
                    flush_acks.push(op.ack);
                }
                OpKind::Write { offset_lbs, data } => {
                    let blocks = (data.len() as u64 / sector_size as u64) as u32;
                    let checksum = record_payload_checksum(&data, self.fixed.ring_geo.log_checksum_salt);
                    let record = LogRecord {
                        is_exist: true,
                        is_padding: false,
                        is_discard: false,
                        lsid: 0, // patched once logpack_lsid is known
                        lsid_local,
                        offset: offset_lbs,
                        io_size: (data.len() / LBS as usize) as u32,
                        checksum,
                    };
                    lsid_local += blocks;
                    payloads.push(data.clone());
                    records.push(record);
                    d_ops.push((record, Some(data), op.ack));
                }
                OpKind::Discard { offset_lbs, size_lbs } => {
                    let record = LogRecord {
                        is_exist: true,
                        is_padding: false,
                        is_discard: true,
                        lsid: 0,
                        lsid_local,
                        offset: offset_lbs,
                        io_size: size_lbs as u32,
                        checksum: 0,
                    };
                    records.push(record);
                    d_ops.push((record, None, op.ack));
                }
            }
        }

        if records.is_empty() {
            // a flush-only batch: just run the barrier and ack.
            self.issue_flush().await;
            for ack in flush_acks {
                let _ = ack.send(Ok(()));
            }
            return;
        }

        let total_payload_blocks: u64 = records
            .iter()
            .map(|r| r.io_size_in_physical_blocks(sector_size) as u64)
            .sum();
        let pack_blocks = 1 + total_payload_blocks;

        let logpack_lsid = match self.lsid.reserve(pack_blocks) {
            Ok(lsid) => lsid,
            Err(e) => {
                let err = EngineError::from(e);
                for (_, _, ack) in d_ops {
                    let _ = ack.send(Err(EngineError::new(err.kind(), std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))));
                }
                for ack in flush_acks {
                    let _ = ack.send(Err(EngineError::new(ErrorKind::ReadOnlyLatch, std::io::Error::new(std::io::ErrorKind::Other, "log full"))));
                }
                return;
            }
        };
        for record in &mut records {
            record.lsid = logpack_lsid + record.lsid_local as u64;
        }
        for (record, _, _) in &mut d_ops {
            record.lsid = logpack_lsid + record.lsid_local as u64;
        }

        let header = LogPackHeader {
            logpack_lsid,
            total_io_size: total_payload_blocks as u32,
            records,
        };
        let mut pack_bytes = header.encode(sector_size as usize, self.fixed.ring_geo.log_checksum_salt).to_vec();
        for payload in &payloads {
            pack_bytes.extend_from_slice(payload);
        }

        let next_lsid = header.next_lsid();

        if let Err(source) = write_physical_blocks(self.log_device.as_ref(), &self.fixed.ring_geo, logpack_lsid, &pack_bytes).await {
            self.lsid.force_read_only();
            self.usage.set_read_only(true);
            let err = EngineError::from(source);
            for (_, _, ack) in d_ops {
                let _ = ack.send(Err(EngineError::new(err.kind(), std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))));
            }
            for ack in flush_acks {
                let _ = ack.send(Err(EngineError::new(ErrorKind::Io, std::io::Error::new(std::io::ErrorKind::Other, "log write failed"))));
            }
            return;
        }
        self.usage.add_bytes_written_l(pack_bytes.len() as u64);
        // When the L-write for a pack acknowledges, advance `completed` to
        // pack end. `written` tracks D-side completion below.
        self.lsid.advance_completed(next_lsid);
        self.usage.set_log_usage(next_lsid.saturating_sub(self.lsid.get_oldest()));

        if self.config.is_sort_data_io {
            d_ops.sort_by_key(|(record, _, _)| record.offset);
        }

        let mut joins = Vec::with_capacity(d_ops.len());
        for (record, payload, ack) in d_ops {
            let data_device = Arc::clone(&self.data_device);
            let io_gate = Arc::clone(&self.io_gate);
            let usage = self.usage.clone();
            let require_l_first_ack = self.config.require_l_first_ack;
            joins.push(tokio::spawn(async move {
                let _permit = io_gate.acquire_owned().await.ok();
                let result = if record.is_discard {
                    data_device.discard(record.offset, record.io_size as u64).await
                } else if let Some(payload) = payload {
                    let result = data_device.write_at(record.offset, &payload).await;
                    if result.is_ok() {
                        usage.add_bytes_written_d(payload.len() as u64);
                    }
                    result
                } else {
                    Ok(())
                };
                if require_l_first_ack {
                    Some((ack, result))
                } else {
                    let _ = ack.send(result.map_err(EngineError::from));
                    None
                }
            }));
        }

        let mut pending_for_permanent = Vec::new();
        for join in joins {
            if let Ok(Some((ack, result))) = join.await {
                pending_for_permanent.push((ack, result));
            }
        }
        // When D-writes for a pack acknowledge, advance `written` to pack
        // end.
        self.lsid.advance_written(next_lsid);

        if self.config.require_l_first_ack {
            self.issue_flush().await;
            for (ack, result) in pending_for_permanent {
                let _ = ack.send(result.map_err(EngineError::from));
            }
            for ack in flush_acks {
                let _ = ack.send(Ok(()));
            }
        } else if !flush_acks.is_empty() {
            self.issue_flush().await;
            for ack in flush_acks {
                let _ = ack.send(Ok(()));
            }
        }
    }

    /// Issues an L durability barrier and advances `permanent` to the
    /// current `written` cursor.
    #[instrument(skip(self))]
    async fn issue_flush(&self) {
        let written = self.lsid.get_written();
        if let Err(source) = self.log_device.flush().await {
            warn!(%source, "log flush failed; latching read-only");
            self.lsid.force_read_only();
            self.usage.set_read_only(true);
            return;
        }
        self.lsid.advance_permanent(written);
        self.lsid.advance_flush(written);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::InMemoryBlockDevice;

    fn geo() -> RingGeometry {
        RingGeometry {
            ring_buffer_off: 0,
            ring_buffer_size: 4096,
            sector_size: 512,
            log_checksum_salt: 0x1357,
        }
    }

    fn handle(log: Arc<InMemoryBlockDevice>, data: Arc<InMemoryBlockDevice>) -> (PipelineHandle, Arc<LsidController>) {
        let lsid = Arc::new(LsidController::new(4096, true));
        let config = EngineConfig {
            max_logpack_pb: 32,
            max_pending_sectors: 4096,
            min_pending_sectors: 1024,
            queue_stop_timeout: Duration::from_millis(200),
            log_flush_interval_ms: 0,
            log_flush_interval_pb: 0,
            checkpoint_interval_ms: 5000,
            n_io_bulk: 4,
            is_sort_data_io: false,
            fast_mode: true,
            require_l_first_ack: false,
        };
        let usage = UsageHandle::noop();
        let h = WritePipeline::spawn(log, data, Arc::clone(&lsid), config, usage, geo());
        (h, lsid)
    }

    #[tokio::test]
    async fn write_then_flush_round_trips_to_data_device() {
        let log = InMemoryBlockDevice::new(8192);
        let data = InMemoryBlockDevice::new(8192);
        let (pipeline, lsid) = handle(log, data.clone());

        let payload = Bytes::from(vec![0x77u8; 512]);
        pipeline.write(10, payload.clone()).await.unwrap();
        pipeline.flush().await.unwrap();

        assert!(lsid.get_written() > 0);
        let mut read_back = vec![0u8; 512];
        data.read_at(10, &mut read_back).await.unwrap();
        assert_eq!(read_back, payload.to_vec());
    }

    #[tokio::test]
    async fn discard_zeroes_data_device() {
        let log = InMemoryBlockDevice::new(8192);
        let data = InMemoryBlockDevice::new(8192);
        data.write_at(0, &[0xFFu8; 512]).await.unwrap();
        let (pipeline, _lsid) = handle(log, data.clone());

        pipeline.discard(0, 1).await.unwrap();

        let mut read_back = vec![0u8; 512];
        data.read_at(0, &mut read_back).await.unwrap();
        assert_eq!(read_back, vec![0u8; 512]);
    }

    #[tokio::test]
    async fn require_l_first_ack_waits_for_permanent() {
        let log = InMemoryBlockDevice::new(8192);
        let data = InMemoryBlockDevice::new(8192);
        let lsid = Arc::new(LsidController::new(4096, true));
        let config = EngineConfig {
            max_logpack_pb: 32,
            max_pending_sectors: 4096,
            min_pending_sectors: 1024,
            queue_stop_timeout: Duration::from_millis(200),
            log_flush_interval_ms: 0,
            log_flush_interval_pb: 0,
            checkpoint_interval_ms: 5000,
            n_io_bulk: 4,
            is_sort_data_io: false,
            fast_mode: true,
            require_l_first_ack: true,
        };
        let pipeline = WritePipeline::spawn(log, data.clone(), Arc::clone(&lsid), config, UsageHandle::noop(), geo());

        let payload = Bytes::from(vec![0x11u8; 512]);
        pipeline.write(0, payload.clone()).await.unwrap();
        assert!(lsid.get_permanent() > 0);
    }
}
