//! One-time setup executed right after a handle is created.

use std::{fmt, path::PathBuf, sync::Arc};

use tracing::trace;

use crate::{
    diagnostics::{self, RuntimeDescriptor},
    error::SessionError,
    handle::{ForeignError, ForeignHandle, Value},
};

/// Hook run once after the startup code, with the live handle.
///
/// Returning an error aborts session creation. The returned value, if any,
/// is kept as the session's verification status.
pub trait Verifier: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when the runtime is unusable for this session.
    fn verify(
        &self,
        handle: &mut dyn ForeignHandle,
        config: &StartupConfig,
    ) -> Result<Option<Value>, ForeignError>;
}

impl<F> Verifier for F
where
    F: Fn(&mut dyn ForeignHandle, &StartupConfig) -> Result<Option<Value>, ForeignError>
        + Send
        + Sync,
{
    fn verify(
        &self,
        handle: &mut dyn ForeignHandle,
        config: &StartupConfig,
    ) -> Result<Option<Value>, ForeignError> {
        self(handle, config)
    }
}

/// Per-session setup: snippets, include paths and an optional verifier.
#[derive(Clone, Default)]
pub struct StartupConfig {
    startup_code: Vec<String>,
    include_paths: Vec<PathBuf>,
    verifier: Option<Arc<dyn Verifier>>,
}

impl StartupConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snippets executed in order before the session becomes visible.
    #[must_use]
    pub fn with_startup_code<I, S>(mut self, code: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.startup_code = code.into_iter().map(Into::into).collect();
        self
    }

    /// Module search paths handed to the engine when it builds a handle.
    #[must_use]
    pub fn with_include_paths<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.include_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_verifier(mut self, verifier: impl Verifier + 'static) -> Self {
        self.verifier = Some(Arc::new(verifier));
        self
    }

    pub fn startup_code(&self) -> &[String] {
        &self.startup_code
    }

    pub fn include_paths(&self) -> &[PathBuf] {
        &self.include_paths
    }

    pub fn has_verifier(&self) -> bool {
        self.verifier.is_some()
    }

    /// Runs the startup code and the verifier against a freshly created
    /// handle. Must be called on the handle's home thread.
    ///
    /// # Errors
    ///
    /// - [`SessionError::RuntimeStateConflict`] if a snippet failed with the
    ///   state-conflict marker; the message is kept verbatim.
    /// - [`SessionError::StartupCodeFailure`] for any other snippet failure.
    /// - [`SessionError::ForeignRuntimeFailure`] if the verifier rejected the
    ///   handle.
    pub fn apply(
        &self,
        handle: &mut dyn ForeignHandle,
        descriptor: &RuntimeDescriptor,
        session: &str,
    ) -> Result<Option<Value>, SessionError> {
        for snippet in &self.startup_code {
            trace!(session = %session, snippet = %snippet.trim(), "Executing startup code");
            handle
                .exec(snippet)
                .map_err(|err| diagnostics::startup_failure(descriptor, snippet, err))?;
        }
        let Some(verifier) = &self.verifier else {
            return Ok(None);
        };
        verifier
            .verify(handle, self)
            .map_err(|err| SessionError::ForeignRuntimeFailure {
                message: format!("verification of {session} failed: {}", err.message()),
                source: Some(err),
            })
    }
}

impl fmt::Debug for StartupConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartupConfig")
            .field("startup_code", &self.startup_code)
            .field("include_paths", &self.include_paths)
            .field("has_verifier", &self.verifier.is_some())
            .finish()
    }
}
