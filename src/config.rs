//! Engine configuration and its builder.
//!
//! Every tunable has a documented default, the builder only materializes a
//! config through `build()`, and `build()` is where cross-field validation
//! lives rather than scattering `assert!`s through the engine itself.

use std::time::Duration;

use snafu::Snafu;

use crate::checkpoint::WALB_MAX_CHECKPOINT_INTERVAL_MS;
use crate::format::constants::MAX_TOTAL_IO_SIZE_IN_LOGPACK_HEADER;

pub const DEFAULT_MAX_LOGPACK_PB: u32 = 32;
pub const DEFAULT_MAX_PENDING_SECTORS: u64 = 4096;
pub const DEFAULT_MIN_PENDING_SECTORS: u64 = 1024;
pub const DEFAULT_QUEUE_STOP_TIMEOUT: Duration = Duration::from_millis(1000);
pub const DEFAULT_LOG_FLUSH_INTERVAL_MS: u32 = 100;
pub const DEFAULT_LOG_FLUSH_INTERVAL_PB: u32 = 256;
pub const DEFAULT_CHECKPOINT_INTERVAL_MS: u32 = 5000;
pub const DEFAULT_N_IO_BULK: usize = 16;

#[derive(Debug, Snafu)]
pub enum BuildError {
    #[snafu(display("parameter '{}' was invalid: {}", param_name, reason))]
    InvalidParameter {
        param_name: &'static str,
        reason: String,
    },
}

/// Runtime configuration for one attached [`crate::engine::WalEngine`].
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct EngineConfig {
    /// Maximum physical blocks coalesced into a single log pack, bounded by
    /// `MAX_TOTAL_IO_SIZE_IN_LOGPACK_HEADER`.
    pub max_logpack_pb: u32,

    /// Pending-sector backpressure ceiling: admission stops once unacked
    /// D-writes exceed this many LBS.
    pub max_pending_sectors: u64,

    /// Admission resumes once the pending-sector counter falls below this
    /// threshold.
    pub min_pending_sectors: u64,

    /// Upper bound on how long admission waits for backpressure to clear
    /// before resuming regardless.
    #[serde(with = "duration_millis")]
    pub queue_stop_timeout: Duration,

    /// Issue an L-flush at least this often, regardless of traffic.
    /// `0` disables the timer.
    pub log_flush_interval_ms: u32,

    /// Issue an L-flush after this many physical blocks of unflushed
    /// traffic, whichever comes first.
    pub log_flush_interval_pb: u32,

    /// Default interval for the checkpoint loop (`GET/SET_CHECKPOINT_INTERVAL`).
    pub checkpoint_interval_ms: u32,

    /// Number of D-submissions batched together before an optional
    /// offset-sort pass (`is_sort_data_io`/`n_io_bulk`).
    pub n_io_bulk: usize,

    /// Sorts D-submissions within a bulk of `n_io_bulk` by offset to
    /// exploit sequential throughput; never reorders across flush
    /// barriers.
    pub is_sort_data_io: bool,

    /// Enables the `completed` cursor as a distinct tracking point from
    /// `written`, rather than aliasing `completed := written`.
    pub fast_mode: bool,

    /// Host acknowledgment policy: if true, a host write is only acked once
    /// `permanent` has reached the write's end LSID; if false, the host may
    /// be acked after L-submission accept and D-completion.
    pub require_l_first_ack: bool,
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Builder for [`EngineConfig`].
#[derive(Clone, Debug, Default)]
pub struct EngineConfigBuilder {
    max_logpack_pb: Option<u32>,
    max_pending_sectors: Option<u64>,
    min_pending_sectors: Option<u64>,
    queue_stop_timeout: Option<Duration>,
    log_flush_interval_ms: Option<u32>,
    log_flush_interval_pb: Option<u32>,
    checkpoint_interval_ms: Option<u32>,
    n_io_bulk: Option<usize>,
    is_sort_data_io: Option<bool>,
    fast_mode: Option<bool>,
    require_l_first_ack: Option<bool>,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_logpack_pb(mut self, v: u32) -> Self {
        self.max_logpack_pb = Some(v);
        self
    }

    pub fn max_pending_sectors(mut self, v: u64) -> Self {
        self.max_pending_sectors = Some(v);
        self
    }

    pub fn min_pending_sectors(mut self, v: u64) -> Self {
        self.min_pending_sectors = Some(v);
        self
    }

    pub fn queue_stop_timeout(mut self, v: Duration) -> Self {
        self.queue_stop_timeout = Some(v);
        self
    }

    pub fn log_flush_interval_ms(mut self, v: u32) -> Self {
        self.log_flush_interval_ms = Some(v);
        self
    }

    pub fn log_flush_interval_pb(mut self, v: u32) -> Self {
        self.log_flush_interval_pb = Some(v);
        self
    }

    pub fn checkpoint_interval_ms(mut self, v: u32) -> Self {
        self.checkpoint_interval_ms = Some(v);
        self
    }

    pub fn n_io_bulk(mut self, v: usize) -> Self {
        self.n_io_bulk = Some(v);
        self
    }

    pub fn is_sort_data_io(mut self, v: bool) -> Self {
        self.is_sort_data_io = Some(v);
        self
    }

    pub fn fast_mode(mut self, v: bool) -> Self {
        self.fast_mode = Some(v);
        self
    }

    pub fn require_l_first_ack(mut self, v: bool) -> Self {
        self.require_l_first_ack = Some(v);
        self
    }

    pub fn build(self) -> Result<EngineConfig, BuildError> {
        let max_logpack_pb = self.max_logpack_pb.unwrap_or(DEFAULT_MAX_LOGPACK_PB);
        let max_pending_sectors = self.max_pending_sectors.unwrap_or(DEFAULT_MAX_PENDING_SECTORS);
        let min_pending_sectors = self.min_pending_sectors.unwrap_or(DEFAULT_MIN_PENDING_SECTORS);
        let queue_stop_timeout = self.queue_stop_timeout.unwrap_or(DEFAULT_QUEUE_STOP_TIMEOUT);
        let log_flush_interval_ms = self.log_flush_interval_ms.unwrap_or(DEFAULT_LOG_FLUSH_INTERVAL_MS);
        let log_flush_interval_pb = self.log_flush_interval_pb.unwrap_or(DEFAULT_LOG_FLUSH_INTERVAL_PB);
        let checkpoint_interval_ms = self.checkpoint_interval_ms.unwrap_or(DEFAULT_CHECKPOINT_INTERVAL_MS);
        let n_io_bulk = self.n_io_bulk.unwrap_or(DEFAULT_N_IO_BULK);
        let is_sort_data_io = self.is_sort_data_io.unwrap_or(false);
        let fast_mode = self.fast_mode.unwrap_or(true);
        let require_l_first_ack = self.require_l_first_ack.unwrap_or(false);

        if max_logpack_pb == 0 {
            return Err(BuildError::InvalidParameter {
                param_name: "max_logpack_pb",
                reason: "cannot be zero".to_string(),
            });
        }
        if max_logpack_pb > MAX_TOTAL_IO_SIZE_IN_LOGPACK_HEADER {
            return Err(BuildError::InvalidParameter {
                param_name: "max_logpack_pb",
                reason: format!("must be <= {}", MAX_TOTAL_IO_SIZE_IN_LOGPACK_HEADER),
            });
        }
        if min_pending_sectors >= max_pending_sectors {
            return Err(BuildError::InvalidParameter {
                param_name: "min_pending_sectors",
                reason: "must be strictly less than max_pending_sectors".to_string(),
            });
        }
        if n_io_bulk == 0 {
            return Err(BuildError::InvalidParameter {
                param_name: "n_io_bulk",
                reason: "cannot be zero".to_string(),
            });
        }
        if checkpoint_interval_ms > WALB_MAX_CHECKPOINT_INTERVAL_MS {
            return Err(BuildError::InvalidParameter {
                param_name: "checkpoint_interval_ms",
                reason: format!("must be <= {}", WALB_MAX_CHECKPOINT_INTERVAL_MS),
            });
        }

        Ok(EngineConfig {
            max_logpack_pb,
            max_pending_sectors,
            min_pending_sectors,
            queue_stop_timeout,
            log_flush_interval_ms,
            log_flush_interval_pb,
            checkpoint_interval_ms,
            n_io_bulk,
            is_sort_data_io,
            fast_mode,
            require_l_first_ack,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build_successfully() {
        let config = EngineConfigBuilder::new().build().unwrap();
        assert_eq!(config.max_logpack_pb, DEFAULT_MAX_LOGPACK_PB);
        assert!(config.fast_mode);
    }

    #[test]
    fn rejects_inverted_pending_sector_bounds() {
        let result = EngineConfigBuilder::new()
            .min_pending_sectors(100)
            .max_pending_sectors(50)
            .build();
        assert!(matches!(
            result,
            Err(BuildError::InvalidParameter { param_name: "min_pending_sectors", .. })
        ));
    }

    #[test]
    fn rejects_checkpoint_interval_above_max() {
        let result = EngineConfigBuilder::new()
            .checkpoint_interval_ms(WALB_MAX_CHECKPOINT_INTERVAL_MS + 1)
            .build();
        assert!(result.is_err());
    }
}
