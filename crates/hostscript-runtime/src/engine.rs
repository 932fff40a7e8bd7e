//! The factory contract a scripting runtime implements.

use hostscript_core::{
    ConfigurationLatch, ForeignError, ForeignHandle, RuntimeConfiguration, RuntimeDescriptor,
    StartupConfig,
};

/// Builds handles of one embedded runtime.
///
/// An engine is shared by every session of a container and called from the
/// sessions' worker threads, so it must be `Send + Sync`. The `create_*`
/// methods run on the thread the new handle will live on.
///
/// # Example
///
/// ```ignore
/// static PYTHON_LATCH: ConfigurationLatch<RuntimeConfiguration> =
///     ConfigurationLatch::new("python");
///
/// impl ScriptEngine for PythonEngine {
///     type Handle = Interpreter;
///
///     fn descriptor(&self) -> RuntimeDescriptor {
///         RuntimeDescriptor::python()
///     }
///
///     fn shared_latch(&self) -> &ConfigurationLatch<RuntimeConfiguration> {
///         &PYTHON_LATCH
///     }
///
///     fn create_isolated(&self, startup: &StartupConfig) -> Result<Interpreter, ForeignError> {
///         Interpreter::sub_interpreter(startup.include_paths())
///     }
///
///     fn create_shared(&self, startup: &StartupConfig) -> Result<Interpreter, ForeignError> {
///         Interpreter::shared(startup.include_paths())
///     }
/// }
/// ```
pub trait ScriptEngine: Send + Sync + 'static {
    /// Handle type produced by this engine.
    type Handle: ForeignHandle;

    /// Names and hints used in diagnostics.
    fn descriptor(&self) -> RuntimeDescriptor;

    /// Process-wide parameters offered to the shared runtime when the first
    /// shared session is created.
    fn configuration(&self) -> RuntimeConfiguration {
        RuntimeConfiguration::from_env(&self.descriptor())
    }

    /// Latch recording the parameters the shared runtime was initialized
    /// with. Usually a `static`, since the shared runtime is per process.
    fn shared_latch(&self) -> &ConfigurationLatch<RuntimeConfiguration>;

    /// Hands process-wide parameters to the runtime. Called at most once per
    /// latch, before the first shared handle is created.
    ///
    /// # Errors
    ///
    /// Returns the runtime's error if the parameters were rejected.
    fn apply_shared_configuration(
        &self,
        _configuration: &RuntimeConfiguration,
    ) -> Result<(), ForeignError> {
        Ok(())
    }

    /// Creates a private handle that shares no state with other handles.
    ///
    /// # Errors
    ///
    /// Returns a [`ForeignError`] if the runtime cannot be instantiated; a
    /// [`LibraryLoad`](hostscript_core::ForeignErrorKind::LibraryLoad) error
    /// is explained in terms of the runtime's home directory.
    fn create_isolated(&self, startup: &StartupConfig) -> Result<Self::Handle, ForeignError>;

    /// Creates a handle on the process-wide shared runtime.
    ///
    /// # Errors
    ///
    /// Same as [`create_isolated`](Self::create_isolated).
    fn create_shared(&self, startup: &StartupConfig) -> Result<Self::Handle, ForeignError>;
}
