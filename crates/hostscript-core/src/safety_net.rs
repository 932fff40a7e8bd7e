//! Best-effort cleanup of sessions that were dropped without being closed.
//!
//! A [`Session`](crate::Session) that goes out of scope while still open
//! hands its shared state to a single background reaper thread. The reaper
//! runs the normal shutdown sequence with [`CloseReason::Leaked`] and logs a
//! warning, so the forgotten `close()` stays visible. Dropping never blocks
//! on the worker thread and nothing on this path ever panics or returns an
//! error to a caller.
//!
//! [`CloseReason::Leaked`]: crate::CloseReason::Leaked

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        LazyLock,
        atomic::{AtomicUsize, Ordering},
        mpsc as std_mpsc,
    },
    thread,
};

use tokio::sync::mpsc;
use tracing::{error, trace};

static RECLAIMED: AtomicUsize = AtomicUsize::new(0);

static REAPER: LazyLock<Option<mpsc::UnboundedSender<Request>>> = LazyLock::new(spawn_reaper);

/// Something the reaper can shut down.
pub(crate) trait Reclaim: Send {
    /// Diagnostic name of the leaked resource.
    fn name(&self) -> &str;

    /// Shuts the resource down. Errors are reported through logs only.
    fn reclaim(self: Box<Self>);
}

enum Request {
    Reclaim(Box<dyn Reclaim>),
    Flush(std_mpsc::Sender<()>),
}

/// Number of leaked sessions closed by the safety net since process start.
pub fn reclaimed_count() -> usize {
    RECLAIMED.load(Ordering::Acquire)
}

/// Blocks until every session handed to the safety net before this call has
/// been closed.
pub fn flush() {
    let Some(reaper) = REAPER.as_ref() else {
        return;
    };
    let (done_tx, done_rx) = std_mpsc::channel();
    if reaper.send(Request::Flush(done_tx)).is_err() {
        return;
    }
    // A closed channel means the reaper is gone; nothing is pending then.
    let _ = done_rx.recv();
}

/// Queues `leaked` for cleanup on the reaper thread, or cleans it up inline
/// when no reaper is available.
pub(crate) fn hand_over(leaked: Box<dyn Reclaim>) {
    trace!(session = %leaked.name(), "Handing leaked session to the safety net");
    let Some(reaper) = REAPER.as_ref() else {
        reclaim(leaked);
        return;
    };
    if let Err(err) = reaper.send(Request::Reclaim(leaked))
        && let Request::Reclaim(leaked) = err.0
    {
        reclaim(leaked);
    }
}

fn spawn_reaper() -> Option<mpsc::UnboundedSender<Request>> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Request>();
    let spawned = thread::Builder::new()
        .name("hostscript-safety-net".to_string())
        .spawn(move || {
            while let Some(request) = rx.blocking_recv() {
                match request {
                    Request::Reclaim(leaked) => reclaim(leaked),
                    Request::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
    match spawned {
        Ok(_) => Some(tx),
        Err(err) => {
            error!(error = %err, "Cannot start safety net thread, leaked sessions are closed inline");
            None
        }
    }
}

fn reclaim(leaked: Box<dyn Reclaim>) {
    let name = leaked.name().to_string();
    if catch_unwind(AssertUnwindSafe(|| leaked.reclaim())).is_err() {
        error!(session = %name, "Safety net cleanup panicked");
    }
    RECLAIMED.fetch_add(1, Ordering::AcqRel);
}
