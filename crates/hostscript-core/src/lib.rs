//! Thread-affine session management for embedded scripting runtimes.
//!
//! Embedded interpreters are awkward residents of a multi-threaded host: an
//! instance may only ever be touched from the thread that created it, it is
//! expensive to build, and some runtimes accept process-wide settings only
//! before their first instantiation. This crate turns such a handle into a
//! [`Session`] that can be shared freely between threads and that is always
//! released, even when its owner forgets to.
//!
//! # Key Components
//!
//! - **Sessions**: [`Session`] owns one [`ForeignHandle`] and the worker
//!   thread it lives on; calls are queued in FIFO order
//! - **Safety net**: open sessions that are dropped are closed in the
//!   background with a warning ([`safety_net`])
//! - **Configuration latch**: first-writer-wins process-wide settings
//!   ([`ConfigurationLatch`])
//! - **Global lock**: one process-wide critical section for runtimes that
//!   are not safe even with thread affinity ([`global_lock`])
//! - **Diagnostics**: explanations for missing runtimes and missing packages
//!   ([`diagnostics`])
//!
//! # Example
//!
//! ```ignore
//! use hostscript_core::{Session, StartupConfig, SessionBuilder};
//!
//! # fn example() -> Result<(), hostscript_core::SessionError> {
//! let session = SessionBuilder::new("python session")
//!     .startup(StartupConfig::new().with_startup_code(["import math"]))
//!     .spawn(|| my_bridge::Interpreter::new())?;
//!
//! let value = session.invoke("compute", vec![1.into(), 2.into()])?;
//! session.close()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod diagnostics;
mod error;
pub mod global_lock;
mod handle;
pub mod latch;
pub mod safety_net;
mod session;
mod startup;

/// Configuration file and runtime initialization parameters.
pub use config::{Config, ConfigError, ResolvedConfig, RuntimeConfiguration, RuntimeSection};
/// Diagnostic inputs.
pub use diagnostics::{HomeInfo, RuntimeDescriptor};
/// Error taxonomy.
pub use error::{BoxError, SessionError};
/// Foreign handle contract.
pub use handle::{ForeignError, ForeignErrorKind, ForeignHandle, NamedArgs, ScriptText, Value};
pub use latch::ConfigurationLatch;
/// Worker thread sessions.
pub use session::{CloseReason, Session, SessionBuilder, SessionStatus};
/// Per-session startup code and verification.
pub use startup::{StartupConfig, Verifier};
