//! The contract every embedded runtime instance must fulfil.
//!
//! A [`ForeignHandle`] is an opaque, expensive, thread-affine object: once
//! created on a thread it must only ever be touched from that thread. The
//! trait therefore does not require `Send`; the session layer guarantees
//! that a handle never leaves the worker thread it was built on.
//!
//! Values crossing the boundary are represented as [`serde_json::Value`].
//! Marshalling richer types (matrices, scalars with units) is the business of
//! the pipeline layer, not of this crate.

use std::{fmt, path::Path};

/// Dynamically typed value exchanged with a foreign runtime.
pub type Value = serde_json::Value;

/// Keyword arguments for [`ForeignHandle::invoke`].
pub type NamedArgs = serde_json::Map<String, Value>;

/// Classification of a failure reported by a foreign runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ForeignErrorKind {
    /// The native library backing the runtime could not be located or
    /// loaded.
    LibraryLoad,
    /// The runtime executed user code and that code raised an error.
    Script,
    /// Any other failure reported by the runtime.
    Other,
}

/// Error raised by a foreign handle.
///
/// Displays as the raw runtime message, so that fatal messages can be
/// re-raised verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ForeignError {
    kind: ForeignErrorKind,
    message: String,
}

impl ForeignError {
    /// Creates an error of the given kind.
    pub fn new(kind: ForeignErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The native library could not be located or loaded.
    pub fn library_load(message: impl Into<String>) -> Self {
        Self::new(ForeignErrorKind::LibraryLoad, message)
    }

    /// User code raised an error inside the runtime.
    pub fn script(message: impl Into<String>) -> Self {
        Self::new(ForeignErrorKind::Script, message)
    }

    /// Any other runtime failure.
    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ForeignErrorKind::Other, message)
    }

    #[must_use]
    pub fn kind(&self) -> ForeignErrorKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn is_library_load(&self) -> bool {
        self.kind == ForeignErrorKind::LibraryLoad
    }
}

/// A piece of source text prepared for evaluation.
///
/// Produced by script-source containers; engines that distinguish module
/// code from plain scripts can inspect [`ScriptText::mime_type`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptText {
    /// Language identifier, e.g. `python` or `js`.
    pub language: String,
    /// Optional diagnostic name (file name or module name).
    pub name: Option<String>,
    /// Optional mime type overriding the language default.
    pub mime_type: Option<String>,
    /// The source code itself.
    pub text: String,
}

impl ScriptText {
    pub fn new(language: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            name: None,
            mime_type: None,
            text: text.into(),
        }
    }
}

/// Operations on one embedded runtime instance.
///
/// Every method is a blocking call that must run on the handle's home
/// thread. Implementations may assume exclusive access through `&mut self`.
pub trait ForeignHandle: 'static {
    /// Calls a named function with positional and keyword arguments.
    ///
    /// # Errors
    ///
    /// Returns the runtime's error if the function is missing or raises.
    fn invoke(
        &mut self,
        name: &str,
        args: &[Value],
        kwargs: &NamedArgs,
    ) -> Result<Value, ForeignError>;

    /// Evaluates a snippet, reporting whether it produced a truthy result.
    ///
    /// # Errors
    ///
    /// Returns the runtime's error if evaluation fails.
    fn eval(&mut self, source: &str) -> Result<bool, ForeignError>;

    /// Executes a snippet for its side effects.
    ///
    /// # Errors
    ///
    /// Returns the runtime's error if execution fails.
    fn exec(&mut self, source: &str) -> Result<(), ForeignError>;

    /// Executes a file-resident script.
    ///
    /// # Errors
    ///
    /// Returns the runtime's error if the script cannot be read or fails.
    fn run_script(&mut self, path: &Path) -> Result<(), ForeignError>;

    /// Reads a global variable.
    ///
    /// # Errors
    ///
    /// Returns the runtime's error if the variable does not exist.
    fn get_value(&mut self, name: &str) -> Result<Value, ForeignError>;

    /// Assigns a global variable.
    ///
    /// # Errors
    ///
    /// Returns the runtime's error if the value cannot be stored.
    fn set_value(&mut self, name: &str, value: Value) -> Result<(), ForeignError>;

    /// Evaluates a prepared source, returning its completion value.
    ///
    /// The default executes the text and yields `null`.
    ///
    /// # Errors
    ///
    /// Returns the runtime's error if execution fails.
    fn eval_source(&mut self, source: &ScriptText) -> Result<Value, ForeignError> {
        self.exec(&source.text).map(|()| Value::Null)
    }

    /// Releases the runtime instance. Called exactly once, on the home
    /// thread, right before the handle is dropped.
    ///
    /// # Errors
    ///
    /// Returns the runtime's error if the instance cannot be torn down
    /// cleanly.
    fn close(&mut self) -> Result<(), ForeignError> {
        Ok(())
    }
}

impl fmt::Display for ForeignErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LibraryLoad => "library load",
            Self::Script => "script",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}
