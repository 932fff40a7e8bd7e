//! Process-wide critical sections for runtimes that are not safe even with
//! per-session thread affinity.
//!
//! Some native extensions keep process-global state and corrupt it when two
//! embedded contexts touch them at the same time, even from different
//! worker threads. For those, an entire initialize, execute, release unit
//! runs under one process-wide lock.

use std::{cell::Cell, fmt, marker::PhantomData};

use parking_lot::Mutex;
use tracing::{error, trace};

use crate::error::SessionError;

static GLOBAL_LOCK: Mutex<()> = Mutex::new(());

thread_local! {
    static HELD_BY_THIS_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Runs `initialize`, `execute` and `release` in order while holding the
/// process-wide lock.
///
/// `execute` is skipped when `initialize` fails. `release` always runs, also
/// when an earlier phase failed or panicked. The first error wins; a
/// `release` error is only returned if the earlier phases succeeded.
///
/// # Errors
///
/// Returns the first error produced by a phase, or
/// [`SessionError::ReentrantCall`] (converted into `E`) if the current
/// thread already holds the lock.
pub fn run_exclusive<T, E>(
    initialize: impl FnOnce() -> Result<(), E>,
    execute: impl FnOnce() -> Result<T, E>,
    release: impl FnOnce() -> Result<(), E>,
) -> Result<T, E>
where
    E: From<SessionError> + fmt::Display,
{
    if is_held_by_current_thread() {
        return Err(SessionError::ReentrantCall {
            target: "the global lock".to_string(),
        }
        .into());
    }
    let _guard = GLOBAL_LOCK.lock();
    let _marker = HeldMarker::set();
    trace!("Entered global critical section");

    let mut release = ReleaseOnUnwind::new(release);
    let outcome = initialize().and_then(|()| execute());
    let released = release.run();

    trace!("Leaving global critical section");
    match (outcome, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(err)) => Err(err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(release_err)) => {
            error!(error = %release_err, "Release phase failed after an earlier failure");
            Err(err)
        }
    }
}

/// Whether the calling thread is currently inside [`run_exclusive`].
pub fn is_held_by_current_thread() -> bool {
    HELD_BY_THIS_THREAD.with(Cell::get)
}

struct HeldMarker;

impl HeldMarker {
    fn set() -> Self {
        HELD_BY_THIS_THREAD.with(|held| held.set(true));
        Self
    }
}

impl Drop for HeldMarker {
    fn drop(&mut self) {
        HELD_BY_THIS_THREAD.with(|held| held.set(false));
    }
}

/// Runs the release phase on unwind if the normal path never reached it.
struct ReleaseOnUnwind<R, E>
where
    R: FnOnce() -> Result<(), E>,
    E: fmt::Display,
{
    release: Option<R>,
    _error: PhantomData<fn() -> E>,
}

impl<R, E> ReleaseOnUnwind<R, E>
where
    R: FnOnce() -> Result<(), E>,
    E: fmt::Display,
{
    fn new(release: R) -> Self {
        Self {
            release: Some(release),
            _error: PhantomData,
        }
    }

    fn run(&mut self) -> Result<(), E> {
        match self.release.take() {
            Some(release) => release(),
            None => Ok(()),
        }
    }
}

impl<R, E> Drop for ReleaseOnUnwind<R, E>
where
    R: FnOnce() -> Result<(), E>,
    E: fmt::Display,
{
    fn drop(&mut self) {
        let Some(release) = self.release.take() else {
            return;
        };
        error!("Global critical section unwound, running release phase");
        if let Err(err) = release() {
            error!(error = %err, "Release phase failed while unwinding");
        }
    }
}
