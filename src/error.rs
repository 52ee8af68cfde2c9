//! Crate-wide error aggregation.
//!
//! Each module defines its own `#[derive(Snafu)]` error enum scoped to its
//! own failure modes (see `format::superblock::SuperblockError`,
//! `lsid::LsidError`, `redo::RedoError`, `snapshot::SnapshotError`,
//! `freeze::FreezeError`, `checkpoint::CheckpointError`). [`EngineError`]
//! aggregates all of them behind one type so that `WalEngine`'s public API
//! has a single `Result` alias, while [`ErrorKind`] gives embedders a
//! stable classification to map onto their own status codes without
//! matching on display strings.

use std::fmt;

use crate::checkpoint::CheckpointError;
use crate::freeze::FreezeError;
use crate::format::logpack::LogPackError;
use crate::format::superblock::SuperblockError;
use crate::lsid::LsidError;
use crate::redo::RedoError;
use crate::snapshot::SnapshotError;

/// Stable classification of an [`EngineError`] by behavioral kind, so
/// callers can branch on "is this retryable / read-only / not-found"
/// without matching on display strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The engine has latched read-only; no further admissions are possible.
    ReadOnlyLatch,
    /// A general I/O error against L or D.
    Io,
    /// A request was structurally invalid (bad name, bad range, bad size).
    Invalid,
    /// The requested entity (snapshot name, LSID) does not exist.
    NotFound,
    /// The requested entity already exists.
    Exists,
    /// Superblock or log-pack metadata failed validation.
    MetadataInvalid,
    /// A state transition lost a race (e.g. freeze/melt vs. a firing timeout).
    Race,
}

/// Top-level error type returned from [`crate::WalEngine`]'s public API.
#[derive(Debug)]
pub struct EngineError {
    kind: ErrorKind,
    source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl EngineError {
    pub fn new(
        kind: ErrorKind,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            source: Box::new(source),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.source)
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

impl From<SuperblockError> for EngineError {
    fn from(e: SuperblockError) -> Self {
        let kind = match e {
            SuperblockError::ChecksumMismatch { .. } => ErrorKind::MetadataInvalid,
            SuperblockError::Io { .. } => ErrorKind::Io,
        };
        EngineError::new(kind, e)
    }
}

impl From<LogPackError> for EngineError {
    fn from(e: LogPackError) -> Self {
        EngineError::new(ErrorKind::MetadataInvalid, e)
    }
}

impl From<LsidError> for EngineError {
    fn from(e: LsidError) -> Self {
        let kind = match e {
            LsidError::Overflow { .. } => ErrorKind::ReadOnlyLatch,
            LsidError::ReadOnly => ErrorKind::ReadOnlyLatch,
            LsidError::InvalidOldest { .. } => ErrorKind::Invalid,
        };
        EngineError::new(kind, e)
    }
}

impl From<RedoError> for EngineError {
    fn from(e: RedoError) -> Self {
        EngineError::new(ErrorKind::Io, e)
    }
}

impl From<SnapshotError> for EngineError {
    fn from(e: SnapshotError) -> Self {
        let kind = match e {
            SnapshotError::AlreadyExists { .. } => ErrorKind::Exists,
            SnapshotError::NotFound { .. } => ErrorKind::NotFound,
            SnapshotError::NoFreeSlot => ErrorKind::Invalid,
            SnapshotError::InvalidName { .. } => ErrorKind::Invalid,
            SnapshotError::Io { .. } => ErrorKind::Io,
        };
        EngineError::new(kind, e)
    }
}

impl From<FreezeError> for EngineError {
    fn from(e: FreezeError) -> Self {
        let kind = match e {
            FreezeError::Race => ErrorKind::Race,
            FreezeError::NotFrozen | FreezeError::AlreadyFrozen => ErrorKind::Invalid,
            FreezeError::Io { .. } => ErrorKind::Io,
        };
        EngineError::new(kind, e)
    }
}

impl From<CheckpointError> for EngineError {
    fn from(e: CheckpointError) -> Self {
        EngineError::new(ErrorKind::Io, e)
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::new(ErrorKind::Io, e)
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
