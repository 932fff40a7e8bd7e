//! Turning low-level failures into explainable errors.
//!
//! Three kinds of input reach this module:
//!
//! - failures observed while waiting on a worker thread, which
//!   [`translate`] maps onto [`SessionError`];
//! - a handle factory that could not load its native library, which
//!   [`diagnose_creation_failure`] explains in terms of the runtime's home
//!   directory;
//! - a startup snippet that failed, which
//!   [`diagnose_startup_code_failure`] explains in terms of the package it
//!   probably tried to import.

use std::{
    path::{Path, PathBuf},
    sync::LazyLock,
};

use regex::Regex;
use tracing::debug;

use crate::{error::SessionError, handle::ForeignError};

/// Substring identifying a runtime-internal state conflict.
///
/// Messages containing it (case-insensitively) are re-raised verbatim and
/// never disguised as a missing-dependency problem.
pub const STATE_CONFLICT_MARKER: &str = "interpreter change detected";

static IMPORT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*import\s+(\w+)").expect("import pattern is valid")
});

/// Names and hints describing one kind of embedded runtime.
///
/// Only used to phrase diagnostics; nothing here is consulted on the call
/// path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeDescriptor {
    /// Human name of the runtime, e.g. `Python`.
    pub runtime_name: String,
    /// Name of the native bridge module that must be loadable.
    pub bridge_module: String,
    /// Name of the configuration setting holding the home directory.
    pub home_setting: String,
    /// Environment variable consulted when no home is configured.
    pub home_env_var: String,
    /// Installation instructions appended to "not installed" diagnoses.
    pub install_hints: String,
}

impl RuntimeDescriptor {
    /// Descriptor of a Python-compatible runtime.
    #[must_use]
    pub fn python() -> Self {
        Self {
            runtime_name: "Python".to_string(),
            bridge_module: "hostscript_bridge".to_string(),
            home_setting: "python.home".to_string(),
            home_env_var: "PYTHONHOME".to_string(),
            install_hints: "To install the bridge with all required packages, use:\n   \
                 python -m pip install --upgrade setuptools wheel numpy\n   \
                 python -m pip install --no-cache-dir --force-reinstall --no-build-isolation hostscript_bridge\n\
                 Note that \"numpy\" must be installed BEFORE the bridge for correct integration."
                .to_string(),
        }
    }

    /// Descriptor of a JavaScript-compatible runtime.
    #[must_use]
    pub fn javascript() -> Self {
        Self {
            runtime_name: "JavaScript".to_string(),
            bridge_module: "js engine".to_string(),
            home_setting: "javascript.home".to_string(),
            home_env_var: "JS_ENGINE_HOME".to_string(),
            install_hints: "Make sure the JavaScript engine library is installed \
                 and visible to the dynamic linker."
                .to_string(),
        }
    }
}

/// What is known about the runtime's home directory at the moment a
/// creation failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HomeInfo {
    /// The home directory, if any is known.
    pub home: Option<PathBuf>,
    /// Whether the home came from an applied configuration rather than the
    /// environment.
    pub configured: bool,
    /// Whether the configuration forbids consulting the environment.
    pub environment_disabled: bool,
}

impl HomeInfo {
    /// Home taken from the environment (or absent).
    pub fn from_environment(home: Option<PathBuf>) -> Self {
        Self {
            home,
            configured: false,
            environment_disabled: false,
        }
    }

    /// Home taken from an applied configuration.
    pub fn from_configuration(home: Option<PathBuf>, environment_disabled: bool) -> Self {
        Self {
            home,
            configured: true,
            environment_disabled,
        }
    }

    /// Reads the descriptor's home environment variable.
    #[must_use]
    pub fn detect(descriptor: &RuntimeDescriptor) -> Self {
        let home = std::env::var_os(&descriptor.home_env_var)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);
        Self::from_environment(home)
    }

    pub fn unknown(&self) -> bool {
        self.home.is_none()
    }

    pub fn exists(&self) -> bool {
        self.home.as_deref().is_some_and(Path::exists)
    }

    /// Whether the home value originates from the environment variable.
    pub fn environment_used(&self) -> bool {
        !self.configured || self.home.is_none()
    }
}

/// How a task ended on the worker thread, when it did not succeed.
#[derive(Debug)]
pub enum TaskFailure {
    /// The handle reported an error.
    Foreign(ForeignError),
    /// The task panicked; carries the panic message.
    Panic(String),
}

/// A failure observed by a caller waiting on a worker thread.
#[derive(Debug)]
pub enum WorkerFailure {
    /// The caller gave up waiting.
    Interrupted,
    /// The task ran and failed.
    Execution(TaskFailure),
    /// The task was discarded because the session closed first.
    Abandoned,
    /// Something the worker protocol does not allow happened.
    Unexpected(String),
}

/// Maps a worker-side failure of `session` onto the error taxonomy.
///
/// A failed caller wait becomes [`SessionError::InterruptedOperation`]. A
/// task failure becomes [`SessionError::ForeignRuntimeFailure`]: errors the
/// runtime reported keep their message and are attached as the source,
/// panics are reported as an exception in the worker thread. Anything the
/// protocol forbids becomes [`SessionError::ImpossibleState`].
pub fn translate(failure: WorkerFailure, session: &str) -> SessionError {
    match failure {
        WorkerFailure::Interrupted => {
            debug!(session = %session, "Caller interrupted while waiting for worker thread");
            SessionError::InterruptedOperation {
                session: session.to_string(),
            }
        }
        WorkerFailure::Execution(TaskFailure::Foreign(err)) => {
            SessionError::ForeignRuntimeFailure {
                message: err.message().to_string(),
                source: Some(err),
            }
        }
        WorkerFailure::Execution(TaskFailure::Panic(message)) => {
            SessionError::ForeignRuntimeFailure {
                message: format!("exception in worker thread of {session}: {message}"),
                source: None,
            }
        }
        WorkerFailure::Abandoned => SessionError::UseAfterClose {
            session: session.to_string(),
        },
        WorkerFailure::Unexpected(message) => SessionError::ImpossibleState(message),
    }
}

/// Explains why the runtime's native library could not be loaded.
///
/// Produces one of three messages depending on whether the home directory
/// is unknown, configured but missing, or present while the runtime still
/// fails to load.
pub fn diagnose_creation_failure(descriptor: &RuntimeDescriptor, home: &HomeInfo) -> String {
    let runtime = &descriptor.runtime_name;
    let Some(path) = home.home.as_deref() else {
        return if home.environment_disabled {
            format!(
                "usage of the {} environment variable is disabled, \
                 and the {runtime} home directory is not set (setting \"{}\")",
                descriptor.home_env_var, descriptor.home_setting
            )
        } else {
            format!(
                "{runtime} home directory is not set: {runtime} is not installed, \
                 or the path to your {runtime} installation is not specified\n\
                 (for example via the {} environment variable)",
                descriptor.home_env_var
            )
        };
    };
    let origin = if home.environment_used() {
        format!(" (value of {} environment variable)", descriptor.home_env_var)
    } else {
        String::new()
    };
    if home.exists() {
        format!(
            "{runtime} is not correctly installed at \"{}\"{origin}, \
             or the \"{}\" module is not properly installed.\n{}",
            path.display(),
            descriptor.bridge_module,
            descriptor.install_hints
        )
    } else {
        format!(
            "{runtime} home \"{}\"{origin} is not an existing {runtime} directory",
            path.display()
        )
    }
}

/// Full message of a creation failure caused by a library load error.
pub fn creation_failure_message(
    descriptor: &RuntimeDescriptor,
    home: &HomeInfo,
    cause: &ForeignError,
) -> String {
    format!(
        "Cannot find {}: the \"{}\" module is not properly loaded ({}).\nProbably {}",
        descriptor.runtime_name,
        descriptor.bridge_module,
        cause.message(),
        diagnose_creation_failure(descriptor, home)
    )
}

/// Explains a failed startup snippet, naming the package it most likely
/// needed.
///
/// When the snippet imports nothing, the raw message is only prefixed with
/// the failing snippet.
pub fn diagnose_startup_code_failure(
    descriptor: &RuntimeDescriptor,
    code: &str,
    raw_message: &str,
) -> String {
    let snippet = code.trim();
    match imported_module(snippet) {
        Some(module) => format!(
            "cannot execute startup {} code: \"{snippet}\".\n\
             The necessary package \"{module}\" was probably not installed correctly\n\
             ({} error message: {raw_message}).\n{}",
            descriptor.runtime_name, descriptor.runtime_name, descriptor.install_hints
        ),
        None => format!(
            "cannot execute startup {} code: \"{snippet}\" ({raw_message})",
            descriptor.runtime_name
        ),
    }
}

/// The first module named by an `import <name>` line of `code`.
pub fn imported_module(code: &str) -> Option<&str> {
    IMPORT_PATTERN
        .captures(code)
        .and_then(|captures| captures.get(1))
        .map(|name| name.as_str())
}

/// Whether `message` signals a runtime-internal state conflict.
pub fn is_state_conflict(message: &str) -> bool {
    message.to_lowercase().contains(STATE_CONFLICT_MARKER)
}

/// Classifies a failed startup snippet.
pub(crate) fn startup_failure(
    descriptor: &RuntimeDescriptor,
    code: &str,
    err: ForeignError,
) -> SessionError {
    if is_state_conflict(err.message()) {
        return SessionError::RuntimeStateConflict(err);
    }
    SessionError::StartupCodeFailure {
        message: diagnose_startup_code_failure(descriptor, code, err.message()),
        snippet: code.trim().to_string(),
        source: err,
    }
}
