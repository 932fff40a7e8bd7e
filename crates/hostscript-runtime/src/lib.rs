//! Session containers for embedded scripting runtimes.
//!
//! This crate builds on [`hostscript_core`] and adds the pieces a host needs
//! to run many scripts against one runtime:
//!
//! - [`ScriptEngine`]: the factory contract a runtime binding implements
//! - [`SessionKind`]: the local, shared and global instancing policies
//! - [`SessionContainer`]: a lazy cache of sessions keyed by kind and
//!   context id
//! - [`ScriptSource`]: a change-tracking description of a script
//!
//! # Example
//!
//! ```ignore
//! use hostscript_runtime::{SessionContainer, SessionKind};
//!
//! let container = SessionContainer::new(PythonEngine, SessionKind::Shared);
//! let session = container.session("report-job")?;
//! session.exec("total = 40 + 2")?;
//! let total: i64 = session.get_value_as("total")?;
//!
//! let value = container.run_global("legacy-job", |session| {
//!     Ok(session.invoke("main", Vec::new())?)
//! })?;
//! ```

pub mod container;
pub mod engine;
pub mod kind;
pub mod source;

pub use container::{
    ContainerError, ContextSwitch, HandleFactory, SessionContainer, StartupSupplier,
};
pub use engine::ScriptEngine;
pub use kind::{KindPolicy, ParseKindError, SessionKind};
pub use source::{JsFlavor, ScriptSource, SourceError, SourceOrigin};
