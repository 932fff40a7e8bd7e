//! Instancing policies.
//!
//! The three kinds share one interface and differ only in the strategy
//! object behind them:
//!
//! | kind     | handle                  | configuration latch | global lock |
//! |----------|-------------------------|---------------------|-------------|
//! | `local`  | private, isolated       | no                  | no          |
//! | `shared` | on the shared runtime   | yes                 | no          |
//! | `global` | on the shared runtime   | yes                 | yes         |

use std::{fmt, str::FromStr};

use hostscript_core::{ForeignError, StartupConfig};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::ScriptEngine;

/// How sessions of a container get their handles.
///
/// Defaults to [`Shared`](Self::Shared) when a configuration names no kind.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// A private handle per session.
    Local,
    /// A handle on the process-wide shared runtime.
    #[default]
    Shared,
    /// Like [`Shared`](Self::Shared), but every use runs under the global
    /// lock.
    Global,
}

/// Error returned when parsing an unknown kind name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown session kind \"{0}\" (expected one of: local, shared, global)")]
pub struct ParseKindError(String);

impl SessionKind {
    pub const ALL: [Self; 3] = [Self::Local, Self::Shared, Self::Global];

    /// Stable machine name, as used in configuration files.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Shared => "shared",
            Self::Global => "global",
        }
    }

    /// Name for humans.
    pub const fn pretty_name(self) -> &'static str {
        match self {
            Self::Local => "local (isolated)",
            Self::Shared => "shared",
            Self::Global => "process-global",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    pub const fn is_globally_locked(self) -> bool {
        matches!(self, Self::Global)
    }

    /// Strategy implementing this kind for `E`.
    pub fn policy<E: ScriptEngine>(self) -> &'static dyn KindPolicy<E> {
        match self {
            Self::Local => &LocalPolicy,
            Self::Shared => &SharedPolicy,
            Self::Global => &GlobalPolicy,
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SessionKind {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| ParseKindError(s.to_string()))
    }
}

/// Per-kind behaviour.
pub trait KindPolicy<E: ScriptEngine>: Send + Sync {
    /// Runs on the requesting thread before the worker thread is spawned.
    ///
    /// # Errors
    ///
    /// Returns the runtime's error if process-wide setup failed.
    fn prepare(&self, _engine: &E) -> Result<(), ForeignError> {
        Ok(())
    }

    /// Builds the handle. Runs on the new session's worker thread.
    ///
    /// # Errors
    ///
    /// Returns the engine's error.
    fn create_handle(
        &self,
        engine: &E,
        startup: &StartupConfig,
    ) -> Result<E::Handle, ForeignError>;

    fn is_globally_locked(&self) -> bool {
        false
    }
}

struct LocalPolicy;
struct SharedPolicy;
struct GlobalPolicy;

impl<E: ScriptEngine> KindPolicy<E> for LocalPolicy {
    fn create_handle(
        &self,
        engine: &E,
        startup: &StartupConfig,
    ) -> Result<E::Handle, ForeignError> {
        engine.create_isolated(startup)
    }
}

impl<E: ScriptEngine> KindPolicy<E> for SharedPolicy {
    fn prepare(&self, engine: &E) -> Result<(), ForeignError> {
        latch_shared_configuration(engine)
    }

    fn create_handle(
        &self,
        engine: &E,
        startup: &StartupConfig,
    ) -> Result<E::Handle, ForeignError> {
        engine.create_shared(startup)
    }
}

impl<E: ScriptEngine> KindPolicy<E> for GlobalPolicy {
    fn prepare(&self, engine: &E) -> Result<(), ForeignError> {
        latch_shared_configuration(engine)
    }

    fn create_handle(
        &self,
        engine: &E,
        startup: &StartupConfig,
    ) -> Result<E::Handle, ForeignError> {
        engine.create_shared(startup)
    }

    fn is_globally_locked(&self) -> bool {
        true
    }
}

/// Offers the engine's configuration to its shared latch and applies it if
/// this call won. Later calls wait for that application to finish and then
/// return its outcome.
fn latch_shared_configuration<E: ScriptEngine>(engine: &E) -> Result<(), ForeignError> {
    engine.shared_latch().set_once_then(
        || engine.configuration(),
        |configuration| {
            debug!(
                runtime = %engine.descriptor().runtime_name,
                configuration = ?configuration,
                "Applying shared runtime configuration"
            );
            engine.apply_shared_configuration(configuration)
        },
    )?;
    Ok(())
}
