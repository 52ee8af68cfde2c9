//! The checkpoint loop: a cooperative periodic task that snapshots
//! `written` into both superblock copies so redo has a recent starting
//! point after a crash.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use snafu::Snafu;
use tokio::sync::Notify;
use tracing::{debug, instrument, warn};

use crate::device::BlockDevice;
use crate::format::superblock::SuperSector;
use crate::lsid::LsidController;
use crate::usage::UsageHandle;

#[derive(Debug, Snafu)]
pub enum CheckpointError {
    #[snafu(display("checkpoint superblock write failed: {}", source))]
    SuperblockWrite { source: std::io::Error },
    #[snafu(display("requested interval {}ms exceeds the maximum of {}ms", requested_ms, max_ms))]
    IntervalTooLarge { requested_ms: u32, max_ms: u32 },
}

/// Upper bound on the checkpoint interval accepted by `SET_CHECKPOINT_INTERVAL`.
pub const WALB_MAX_CHECKPOINT_INTERVAL_MS: u32 = 3_600_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Running,
    Stopping,
    Stopped,
    Waiting,
}

struct Fixed {
    /// Offsets of the primary/secondary superblock, in sectors (physical
    /// blocks) — converted to the LBS offsets [`BlockDevice`] expects at
    /// the point of each write, the same way [`crate::engine::WalEngine`]'s
    /// own `write_sector` helper does.
    super0_sectors: u64,
    super1_sectors: u64,
    sector_size: u32,
    snapshot_metadata_size: u32,
    ring_buffer_size: u64,
    uuid: [u8; 16],
    log_checksum_salt: u32,
    device_size: u64,
}

/// Drives the periodic superblock sync.
pub struct CheckpointLoop<D: BlockDevice> {
    device: Arc<D>,
    lsid: Arc<LsidController>,
    usage: UsageHandle,
    fixed: Fixed,
    interval_ms: AtomicU32,
    state: parking_lot::Mutex<State>,
    tick_done: Notify,
    wake: Notify,
}

impl<D: BlockDevice> CheckpointLoop<D> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: Arc<D>,
        lsid: Arc<LsidController>,
        usage: UsageHandle,
        super0_sectors: u64,
        super1_sectors: u64,
        sector_size: u32,
        snapshot_metadata_size: u32,
        ring_buffer_size: u64,
        uuid: [u8; 16],
        log_checksum_salt: u32,
        device_size: u64,
        interval_ms: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            device,
            lsid,
            usage,
            fixed: Fixed {
                super0_sectors,
                super1_sectors,
                sector_size,
                snapshot_metadata_size,
                ring_buffer_size,
                uuid,
                log_checksum_salt,
                device_size,
            },
            interval_ms: AtomicU32::new(interval_ms),
            state: parking_lot::Mutex::new(State::Stopped),
            tick_done: Notify::new(),
            wake: Notify::new(),
        })
    }

    pub fn interval_ms(&self) -> u32 {
        self.interval_ms.load(Ordering::Acquire)
    }

    pub fn set_interval_ms(&self, interval_ms: u32) -> Result<(), CheckpointError> {
        if interval_ms > WALB_MAX_CHECKPOINT_INTERVAL_MS {
            return Err(CheckpointError::IntervalTooLarge {
                requested_ms: interval_ms,
                max_ms: WALB_MAX_CHECKPOINT_INTERVAL_MS,
            });
        }
        self.interval_ms.store(interval_ms, Ordering::Release);
        self.wake.notify_one();
        Ok(())
    }

    /// One checkpoint tick: capture `written`, write both superblocks,
    /// advance `prev_written`. A failed write latches the LSID controller
    /// read-only.
    #[instrument(skip(self))]
    async fn tick(&self) -> Result<(), CheckpointError> {
        let written = self.lsid.get_written();
        let oldest = self.lsid.get_oldest();

        let super_sector = SuperSector {
            sector_size: self.fixed.sector_size,
            snapshot_metadata_size: self.fixed.snapshot_metadata_size,
            uuid: self.fixed.uuid,
            start_offset: 0,
            ring_buffer_size: self.fixed.ring_buffer_size,
            oldest_lsid: oldest,
            written_lsid: written,
            device_size: self.fixed.device_size,
            log_checksum_salt: self.fixed.log_checksum_salt,
            format_version: crate::format::constants::FORMAT_VERSION,
            name: [0u8; crate::format::constants::DISK_NAME_LEN],
        };
        let encoded = super_sector.encode(self.fixed.sector_size as usize);
        let lbs_per_sector = self.fixed.sector_size as u64 / crate::format::constants::LBS;

        if let Err(source) = self
            .device
            .write_at(self.fixed.super0_sectors * lbs_per_sector, &encoded)
            .await
        {
            self.lsid.force_read_only();
            return Err(CheckpointError::SuperblockWrite { source });
        }
        if let Err(source) = self
            .device
            .write_at(self.fixed.super1_sectors * lbs_per_sector, &encoded)
            .await
        {
            self.lsid.force_read_only();
            return Err(CheckpointError::SuperblockWrite { source });
        }
        if let Err(source) = self.device.flush().await {
            self.lsid.force_read_only();
            return Err(CheckpointError::SuperblockWrite { source });
        }

        self.lsid.mark_checkpoint_synced();
        self.usage.add_checkpoint_tick();
        debug!(written, "checkpoint synced");
        Ok(())
    }

    /// Runs [`Self::tick`] synchronously, asserting the loop is currently
    /// `STOPPED` around it (`TAKE_CHECKPOINT`).
    pub async fn take_checkpoint(&self) -> Result<(), CheckpointError> {
        {
            let state = self.state.lock();
            assert_eq!(*state, State::Stopped, "take_checkpoint requires the loop to be stopped");
        }
        self.tick().await
    }

    /// Spawns the periodic background task, transitioning `STOPPED ->
    /// RUNNING`.
    pub fn start_checkpointing(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if !matches!(*state, State::Stopped) {
                return;
            }
            *state = State::Running;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move { this.run().await });
    }

    async fn run(self: Arc<Self>) {
        loop {
            {
                let mut state = self.state.lock();
                match *state {
                    State::Stopping => {
                        *state = State::Stopped;
                        drop(state);
                        self.tick_done.notify_waiters();
                        return;
                    }
                    State::Stopped => return,
                    State::Running | State::Waiting => *state = State::Waiting,
                }
            }

            let interval = self.interval_ms();
            if interval == 0 {
                // Timer disabled: idle until stopped or re-armed with a
                // nonzero interval, rather than exiting the task — exiting
                // here would leave `state` stuck at `Waiting` forever and
                // deadlock a future `stop_checkpointing` on `tick_done`.
                self.wake.notified().await;
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(interval as u64)) => {}
                _ = self.wake.notified() => continue,
            }

            {
                let mut state = self.state.lock();
                if matches!(*state, State::Stopping) {
                    *state = State::Stopped;
                    drop(state);
                    self.tick_done.notify_waiters();
                    return;
                }
                *state = State::Running;
            }

            if let Err(error) = self.tick().await {
                warn!(%error, "checkpoint tick failed, engine latched read-only");
                let mut state = self.state.lock();
                *state = State::Stopped;
                drop(state);
                self.tick_done.notify_waiters();
                return;
            }
        }
    }

    /// Blocks until the in-flight tick (if any) finishes, then transitions
    /// to `STOPPED`.
    pub async fn stop_checkpointing(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                State::Stopped => return,
                State::Running | State::Stopping | State::Waiting => *state = State::Stopping,
            }
        }
        // Wake a sleeping tick loop immediately rather than waiting out the
        // rest of its interval; `run`'s post-select check then observes
        // `Stopping`, transitions to `Stopped`, and notifies `tick_done`.
        // `notify_one` (not `notify_waiters`) buffers a permit if `run` is
        // between dropping the state lock and registering its `notified()`
        // wait, so this wakeup can never be lost in that window.
        self.wake.notify_one();
        self.tick_done.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::InMemoryBlockDevice;

    fn make_loop(device: Arc<InMemoryBlockDevice>) -> Arc<CheckpointLoop<InMemoryBlockDevice>> {
        let lsid = Arc::new(LsidController::new(1024, true));
        // super0 at sector 1, super1 at sector 2, sector_size 4096.
        CheckpointLoop::new(device, lsid, UsageHandle::noop(), 1, 2, 4096, 16, 1024, [1u8; 16], 0xABCD, 1 << 20, 0)
    }

    #[tokio::test]
    async fn take_checkpoint_writes_both_superblocks() {
        let device = InMemoryBlockDevice::new(4096);
        let loop_ = make_loop(device.clone());
        loop_.lsid.reserve(100).unwrap();
        loop_.lsid.advance_written(100);

        loop_.take_checkpoint().await.unwrap();

        let snapshot = device.snapshot();
        let sector_size = 4096usize;
        let super0 = &snapshot[1 * sector_size..1 * sector_size + sector_size];
        let super1 = &snapshot[2 * sector_size..2 * sector_size + sector_size];
        assert_eq!(super0, super1);
        let decoded = SuperSector::decode(super0).unwrap();
        assert_eq!(decoded.written_lsid, 100);
    }

    #[tokio::test]
    async fn set_interval_rejects_above_max() {
        let device = InMemoryBlockDevice::new(4096);
        let loop_ = make_loop(device);
        assert!(matches!(
            loop_.set_interval_ms(WALB_MAX_CHECKPOINT_INTERVAL_MS + 1),
            Err(CheckpointError::IntervalTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn start_then_stop_checkpointing_returns_to_stopped() {
        let device = InMemoryBlockDevice::new(4096);
        let loop_ = make_loop(device);
        loop_.set_interval_ms(20).unwrap();
        loop_.start_checkpointing();
        tokio::time::sleep(Duration::from_millis(5)).await;
        loop_.stop_checkpointing().await;
    }

    /// `interval_ms == 0` disables the periodic tick entirely; the loop must
    /// still be stoppable rather than leaving `stop_checkpointing` waiting
    /// on a `tick_done` notification nobody will ever send.
    #[tokio::test]
    async fn stop_checkpointing_with_a_zero_interval_does_not_hang() {
        let device = InMemoryBlockDevice::new(4096);
        let loop_ = make_loop(device); // interval_ms defaults to 0 here.
        loop_.start_checkpointing();
        tokio::time::timeout(Duration::from_millis(500), loop_.stop_checkpointing())
            .await
            .expect("stop_checkpointing must not hang when the timer is disabled");
    }
}
