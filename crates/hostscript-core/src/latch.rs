//! First-writer-wins configuration gate.
//!
//! Some runtimes accept process-wide initialization parameters only before
//! their first instantiation. A [`ConfigurationLatch`] records the first
//! configuration offered and silently ignores every later one.
//!
//! [`set_once_then`](ConfigurationLatch::set_once_then) also applies the
//! winning value while the latch is being set. Callers arriving during that
//! time block until it finishes, so nobody observes a latched value that has
//! not reached the runtime yet.

use std::{fmt, sync::OnceLock};

use tracing::debug;

use crate::handle::ForeignError;

/// A value that can be set at most once.
pub struct ConfigurationLatch<C> {
    label: &'static str,
    cell: OnceLock<Latched<C>>,
}

struct Latched<C> {
    value: C,
    applied: Result<(), ForeignError>,
}

impl<C> ConfigurationLatch<C> {
    /// Creates an open latch. `label` only appears in logs.
    pub const fn new(label: &'static str) -> Self {
        Self {
            label,
            cell: OnceLock::new(),
        }
    }

    /// Offers `value`; returns `true` if this call set the latch.
    ///
    /// Later offers are no-ops and leave the first value in place.
    pub fn set_once(&self, value: C) -> bool {
        self.set_once_with(|| value)
    }

    /// Like [`set_once`](Self::set_once), building the value only if the
    /// latch is still open.
    pub fn set_once_with(&self, make: impl FnOnce() -> C) -> bool {
        self.offer(make, |_| Ok(()))
    }

    /// Builds the value and hands it to `apply` if the latch is still open.
    ///
    /// Returns `Ok(true)` if this call set the latch, `Ok(false)` if an
    /// earlier call did. `apply` must not use this latch.
    ///
    /// # Errors
    ///
    /// Returns the error of the winning `apply`, to the winner and to every
    /// later caller alike.
    pub fn set_once_then(
        &self,
        make: impl FnOnce() -> C,
        apply: impl FnOnce(&C) -> Result<(), ForeignError>,
    ) -> Result<bool, ForeignError> {
        let won = self.offer(make, apply);
        match self.cell.get() {
            Some(Latched {
                applied: Err(err), ..
            }) => Err(err.clone()),
            _ => Ok(won),
        }
    }

    fn offer(
        &self,
        make: impl FnOnce() -> C,
        apply: impl FnOnce(&C) -> Result<(), ForeignError>,
    ) -> bool {
        let mut won = false;
        self.cell.get_or_init(|| {
            won = true;
            let value = make();
            let applied = apply(&value);
            Latched { value, applied }
        });
        if won {
            debug!(latch = self.label, "Configuration latched");
        } else {
            debug!(latch = self.label, "Configuration already latched, ignoring");
        }
        won
    }

    /// The latched value, if any.
    pub fn get(&self) -> Option<&C> {
        self.cell.get().map(|latched| &latched.value)
    }

    pub fn is_latched(&self) -> bool {
        self.cell.get().is_some()
    }
}

impl<C: fmt::Debug> fmt::Debug for ConfigurationLatch<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigurationLatch")
            .field("label", &self.label)
            .field("value", &self.get())
            .field(
                "applied",
                &self.cell.get().map(|latched| latched.applied.is_ok()),
            )
            .finish()
    }
}
