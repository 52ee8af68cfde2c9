//! `walb_engine`: a block-level write-ahead-log engine that interposes
//! between a host and a pair of backing block devices — a log device L
//! holding an append-only ring of log packs, and a data device D holding
//! the live volume content.
//!
//! A write is durably recorded to L before it is lazily mirrored to D; on
//! restart, a redo pass replays log packs from the last checkpoint to bring
//! D back in line with every acknowledged write. Each module below
//! corresponds to one component of that design.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::type_complexity)]
#![allow(clippy::must_use_candidate)]

#[macro_use]
extern crate tracing;

pub mod admin;
pub mod checkpoint;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod format;
pub mod freeze;
pub mod lsid;
pub mod pipeline;
pub mod redo;
pub mod ring_io;
pub mod snapshot;
pub mod usage;

pub use admin::{AdminCommand, CtlResponse, DeviceGeo, SnapshotInfo};
pub use config::{EngineConfig, EngineConfigBuilder};
pub use device::{BlockDevice, FileBlockDevice, InMemoryBlockDevice};
pub use engine::{AttachError, WalEngine};
pub use error::{EngineError, EngineResult, ErrorKind};
