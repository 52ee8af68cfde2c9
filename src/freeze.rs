//! The freeze/melt administrative interlock.
//!
//! A three-state machine — `MELTED`, `FREEZED`, `FREEZED_WITH_TIMEOUT` —
//! that admission, the checkpoint loop, and `clear_log`/`resize` all
//! consult before mutating shared state. Melting on timeout races against
//! an explicit `melt()` call; the loser gets [`FreezeError::Race`].

use std::time::Duration;

use snafu::Snafu;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::sleep;

#[derive(Debug, Snafu)]
pub enum FreezeError {
    #[snafu(display("lost the race between an explicit melt and the freeze timeout"))]
    Race,
    #[snafu(display("the device is not frozen"))]
    NotFrozen,
    #[snafu(display("the device is already frozen"))]
    AlreadyFrozen,
    #[snafu(display("freeze/melt I/O error: {}", source))]
    Io { source: std::io::Error },
}

/// Maximum `timeout_sec` accepted by [`FreezeState::freeze`], clamped to
/// 86400 (24 hours).
pub const MAX_FREEZE_TIMEOUT_SEC: u32 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Melted,
    Freezed,
    FreezedWithTimeout,
}

struct Inner {
    state: State,
    /// Monotonically bumped on every state transition; the scheduled melt
    /// task captures the generation it was armed under and no-ops if it has
    /// since changed, so an explicit `melt()` always wins a concurrent race.
    generation: u64,
    timeout_task: Option<JoinHandle<()>>,
}

/// The freeze/melt interlock for one attached device.
///
/// Admission checks [`FreezeState::is_frozen`] before admitting writes;
/// reads are always served regardless of freeze state.
pub struct FreezeState {
    inner: parking_lot::Mutex<Inner>,
    melted_notify: Notify,
}

impl FreezeState {
    pub fn new() -> Self {
        Self {
            inner: parking_lot::Mutex::new(Inner {
                state: State::Melted,
                generation: 0,
                timeout_task: None,
            }),
            melted_notify: Notify::new(),
        }
    }

    pub fn is_frozen(&self) -> bool {
        !matches!(self.inner.lock().state, State::Melted)
    }

    /// Freezes the device. `timeout_sec == 0` means manual melt only;
    /// otherwise a melt is scheduled after `timeout_sec` (clamped to
    /// [`MAX_FREEZE_TIMEOUT_SEC`]).
    ///
    /// `on_timeout` is invoked from the scheduled task with the generation
    /// this freeze was armed under; it should call
    /// [`FreezeState::melt_from_timeout`] with that generation and, only if
    /// that succeeds, perform the checkpoint-restart/admission-resume side
    /// effects that `melt()` itself would.
    pub fn freeze<F>(&self, timeout_sec: u32, on_timeout: F) -> Result<(), FreezeError>
    where
        F: Fn(u64) + Send + 'static,
    {
        let mut inner = self.inner.lock();
        if !matches!(inner.state, State::Melted) {
            return Err(FreezeError::AlreadyFrozen);
        }

        inner.generation += 1;
        let generation = inner.generation;

        if timeout_sec == 0 {
            inner.state = State::Freezed;
            return Ok(());
        }

        let clamped = timeout_sec.min(MAX_FREEZE_TIMEOUT_SEC);
        inner.state = State::FreezedWithTimeout;
        drop(inner);
        let handle = tokio::spawn(Self::run_timeout(generation, clamped, on_timeout));
        let mut inner = self.inner.lock();
        inner.timeout_task = Some(handle);
        Ok(())
    }

    async fn run_timeout(generation: u64, timeout_sec: u32, on_timeout: impl Fn(u64) + Send + 'static) {
        sleep(Duration::from_secs(timeout_sec as u64)).await;
        on_timeout(generation);
    }

    /// Melts the device, cancelling any pending timeout task. Fails with
    /// [`FreezeError::Race`] if a concurrent timeout has already melted it
    /// (generation mismatch), or [`FreezeError::NotFrozen`] if it was never
    /// frozen.
    pub fn melt(&self) -> Result<(), FreezeError> {
        let mut inner = self.inner.lock();
        match inner.state {
            State::Melted => return Err(FreezeError::NotFrozen),
            State::Freezed | State::FreezedWithTimeout => {}
        }

        if let Some(task) = inner.timeout_task.take() {
            task.abort();
        }
        inner.state = State::Melted;
        inner.generation += 1;
        drop(inner);
        self.melted_notify.notify_waiters();
        Ok(())
    }

    /// Called by the timeout side effect registered in [`Self::freeze`]
    /// once its sleep elapses, transitioning `FREEZED_WITH_TIMEOUT` back to
    /// `MELTED` unless an explicit `melt()` already won the race.
    pub fn melt_from_timeout(&self, generation: u64) -> Result<(), FreezeError> {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return Err(FreezeError::Race);
        }
        inner.state = State::Melted;
        inner.timeout_task = None;
        drop(inner);
        self.melted_notify.notify_waiters();
        Ok(())
    }
}

impl Default for FreezeState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn freeze_then_melt_round_trips() {
        let freeze = FreezeState::new();
        freeze.freeze(0, |_| {}).unwrap();
        assert!(freeze.is_frozen());
        freeze.melt().unwrap();
        assert!(!freeze.is_frozen());
    }

    #[test]
    fn double_freeze_rejected() {
        let freeze = FreezeState::new();
        freeze.freeze(0, |_| {}).unwrap();
        assert!(matches!(freeze.freeze(0, |_| {}), Err(FreezeError::AlreadyFrozen)));
    }

    #[test]
    fn melt_without_freeze_rejected() {
        let freeze = FreezeState::new();
        assert!(matches!(freeze.melt(), Err(FreezeError::NotFrozen)));
    }

    #[tokio::test]
    async fn explicit_melt_wins_race_against_timeout() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let freeze = Arc::new(FreezeState::new());
        freeze
            .freeze(3600, move |_generation| { calls2.fetch_add(1, Ordering::SeqCst); })
            .unwrap();
        freeze.melt().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
