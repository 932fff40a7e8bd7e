//! Error taxonomy of the session manager.

use crate::handle::ForeignError;

/// Boxed cause of a creation failure.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by sessions and the components around them.
///
/// A runtime that is not installed surfaces as
/// [`SessionError::CreationFailure`], a missing extension package as
/// [`SessionError::StartupCodeFailure`] and an error raised by user code as
/// [`SessionError::ForeignRuntimeFailure`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SessionError {
    /// The native handle could not be built, or its worker thread could not
    /// be started. The message carries the home-directory diagnosis.
    #[error("{message}")]
    CreationFailure {
        message: String,
        #[source]
        source: BoxError,
    },

    /// A one-time startup snippet failed.
    #[error("{message}")]
    StartupCodeFailure {
        message: String,
        /// The snippet that failed, trimmed.
        snippet: String,
        #[source]
        source: ForeignError,
    },

    /// The runtime reported an internal state conflict. Displays the
    /// original message verbatim.
    #[error("{0}")]
    RuntimeStateConflict(ForeignError),

    /// The caller stopped waiting before the task completed.
    #[error("interrupted while waiting for {session}")]
    InterruptedOperation { session: String },

    /// The session was closed, or was being closed, when the call arrived.
    #[error("cannot use {session}: the session is closed")]
    UseAfterClose { session: String },

    /// A call failed inside the foreign runtime.
    #[error("{message}")]
    ForeignRuntimeFailure {
        message: String,
        #[source]
        source: Option<ForeignError>,
    },

    /// An internal invariant of the session manager was violated.
    #[error("impossible state: {0}")]
    ImpossibleState(String),

    /// A thread tried to block on a resource it already owns: a task
    /// calling back into its own session, or a nested global critical
    /// section.
    #[error("re-entrant use of {target} would deadlock")]
    ReentrantCall { target: String },

    /// A foreign value could not be converted to the requested type.
    #[error("value \"{name}\" cannot be converted: {source}")]
    ValueConversion {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

impl SessionError {
    /// Returns `true` for errors that indicate a broken process state and
    /// must never be swallowed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ImpossibleState(_) | Self::RuntimeStateConflict(_)
        )
    }

    pub fn is_use_after_close(&self) -> bool {
        matches!(self, Self::UseAfterClose { .. })
    }

    /// The foreign error behind this failure, if there is one.
    pub fn foreign_cause(&self) -> Option<&ForeignError> {
        match self {
            Self::StartupCodeFailure { source, .. } | Self::RuntimeStateConflict(source) => {
                Some(source)
            }
            Self::ForeignRuntimeFailure { source, .. } => source.as_ref(),
            Self::CreationFailure { source, .. } => source.downcast_ref::<ForeignError>(),
            _ => None,
        }
    }
}
