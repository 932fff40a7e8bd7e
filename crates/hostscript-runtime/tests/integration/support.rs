//! Stub runtime that records what happens to its handles.

use std::{
    io,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread::{self, ThreadId},
    time::Duration,
};

use hostscript_core::{
    ConfigurationLatch, ForeignError, ForeignHandle, NamedArgs, RuntimeConfiguration,
    RuntimeDescriptor, StartupConfig, Value,
};
use hostscript_runtime::ScriptEngine;
use parking_lot::Mutex;
use serde_json::json;

pub type Log = Arc<Mutex<Vec<String>>>;

/// What a test can observe about a handle after it was handed to a session.
#[derive(Clone)]
pub struct Probe {
    pub id: usize,
    pub shared: bool,
    pub closed: Arc<AtomicBool>,
    pub log: Log,
}

impl Probe {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            shared: false,
            closed: Arc::new(AtomicBool::new(false)),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn entries(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.log.lock().iter().filter(|entry| *entry == "close").count()
    }
}

/// Handle answering `greet`, recording `exec` sources and failing startup
/// snippets that mention a missing package or carry `raise:`.
pub struct StubHandle {
    id: usize,
    home: ThreadId,
    log: Log,
    closed: Arc<AtomicBool>,
    values: serde_json::Map<String, Value>,
}

impl StubHandle {
    /// Builds a handle reporting to `probe`, homed on the calling thread.
    pub fn attached(probe: &Probe) -> Self {
        Self {
            id: probe.id,
            home: thread::current().id(),
            log: Arc::clone(&probe.log),
            closed: Arc::clone(&probe.closed),
            values: serde_json::Map::new(),
        }
    }

    fn record(&self, entry: String) {
        assert_eq!(thread::current().id(), self.home, "handle used off its home thread");
        self.log.lock().push(entry);
    }
}

impl ForeignHandle for StubHandle {
    fn invoke(
        &mut self,
        name: &str,
        args: &[Value],
        _kwargs: &NamedArgs,
    ) -> Result<Value, ForeignError> {
        self.record(format!("invoke {name}"));
        match name {
            "greet" => Ok(json!("hello")),
            "id" => Ok(json!(self.id)),
            "echo" => Ok(Value::Array(args.to_vec())),
            other => Err(ForeignError::script(format!("NameError: name '{other}' is not defined"))),
        }
    }

    fn eval(&mut self, source: &str) -> Result<bool, ForeignError> {
        self.record(format!("eval {source}"));
        Ok(source == "True")
    }

    fn exec(&mut self, source: &str) -> Result<(), ForeignError> {
        self.record(source.to_string());
        if let Some(message) = source.strip_prefix("raise:") {
            return Err(ForeignError::script(message.trim()));
        }
        if let Some(package) = source.trim().strip_prefix("import missing") {
            return Err(ForeignError::script(format!(
                "ModuleNotFoundError: No module named 'missing{package}'"
            )));
        }
        Ok(())
    }

    fn run_script(&mut self, path: &Path) -> Result<(), ForeignError> {
        self.record(format!("run {}", path.display()));
        Ok(())
    }

    fn get_value(&mut self, name: &str) -> Result<Value, ForeignError> {
        self.values
            .get(name)
            .cloned()
            .ok_or_else(|| ForeignError::script(format!("NameError: name '{name}' is not defined")))
    }

    fn set_value(&mut self, name: &str, value: Value) -> Result<(), ForeignError> {
        self.values.insert(name.to_string(), value);
        Ok(())
    }

    fn close(&mut self) -> Result<(), ForeignError> {
        self.record("close".to_string());
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Engine building [`StubHandle`]s and remembering every one of them.
pub struct StubEngine {
    latch: ConfigurationLatch<RuntimeConfiguration>,
    configuration: Mutex<RuntimeConfiguration>,
    applied: Mutex<Vec<RuntimeConfiguration>>,
    reject_configuration: AtomicBool,
    creation_error: Mutex<Option<ForeignError>>,
    configuration_delay: Mutex<Duration>,
    creation_delay: Mutex<Duration>,
    events: Log,
    next_id: AtomicUsize,
    probes: Mutex<Vec<Probe>>,
}

impl StubEngine {
    pub fn new() -> Self {
        Self {
            latch: ConfigurationLatch::new("stub"),
            configuration: Mutex::new(RuntimeConfiguration::default()),
            applied: Mutex::new(Vec::new()),
            reject_configuration: AtomicBool::new(false),
            creation_error: Mutex::new(None),
            configuration_delay: Mutex::new(Duration::ZERO),
            creation_delay: Mutex::new(Duration::ZERO),
            events: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicUsize::new(1),
            probes: Mutex::new(Vec::new()),
        }
    }

    pub fn set_configuration(&self, configuration: RuntimeConfiguration) {
        *self.configuration.lock() = configuration;
    }

    pub fn reject_configuration(&self) {
        self.reject_configuration.store(true, Ordering::SeqCst);
    }

    pub fn fail_creation(&self, err: ForeignError) {
        *self.creation_error.lock() = Some(err);
    }

    /// Makes applying the shared configuration take `delay`.
    pub fn slow_configuration(&self, delay: Duration) {
        *self.configuration_delay.lock() = delay;
    }

    /// Makes building a handle take `delay`.
    pub fn slow_creation(&self, delay: Duration) {
        *self.creation_delay.lock() = delay;
    }

    /// Configuration and creation steps in the order they happened.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn applied(&self) -> Vec<RuntimeConfiguration> {
        self.applied.lock().clone()
    }

    pub fn probes(&self) -> Vec<Probe> {
        self.probes.lock().clone()
    }

    pub fn created(&self) -> usize {
        self.probes.lock().len()
    }

    fn create(&self, shared: bool, startup: &StartupConfig) -> Result<StubHandle, ForeignError> {
        if let Some(err) = self.creation_error.lock().clone() {
            return Err(err);
        }
        let delay = *self.creation_delay.lock();
        thread::sleep(delay);
        let event = if shared { "create shared" } else { "create isolated" };
        self.events.lock().push(event.to_string());
        let mut probe = Probe::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        probe.shared = shared;
        for path in startup.include_paths() {
            probe.log.lock().push(format!("include {}", path.display()));
        }
        let handle = StubHandle::attached(&probe);
        self.probes.lock().push(probe);
        Ok(handle)
    }
}

impl ScriptEngine for StubEngine {
    type Handle = StubHandle;

    fn descriptor(&self) -> RuntimeDescriptor {
        RuntimeDescriptor::python()
    }

    fn configuration(&self) -> RuntimeConfiguration {
        self.configuration.lock().clone()
    }

    fn shared_latch(&self) -> &ConfigurationLatch<RuntimeConfiguration> {
        &self.latch
    }

    fn apply_shared_configuration(
        &self,
        configuration: &RuntimeConfiguration,
    ) -> Result<(), ForeignError> {
        if self.reject_configuration.load(Ordering::SeqCst) {
            return Err(ForeignError::other("runtime already initialized"));
        }
        self.events.lock().push("apply start".to_string());
        let delay = *self.configuration_delay.lock();
        thread::sleep(delay);
        self.applied.lock().push(configuration.clone());
        self.events.lock().push("apply done".to_string());
        Ok(())
    }

    fn create_isolated(&self, startup: &StartupConfig) -> Result<StubHandle, ForeignError> {
        self.create(false, startup)
    }

    fn create_shared(&self, startup: &StartupConfig) -> Result<StubHandle, ForeignError> {
        self.create(true, startup)
    }
}

/// In-memory sink for formatted log output.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Routes every thread's log output into one shared buffer for the rest of
/// the test process.
pub fn capture_logs() -> CapturedLogs {
    static CAPTURED: std::sync::OnceLock<CapturedLogs> = std::sync::OnceLock::new();
    CAPTURED
        .get_or_init(|| {
            let logs = CapturedLogs::default();
            let writer = logs.clone();
            let subscriber = tracing_subscriber::fmt()
                .with_ansi(false)
                .with_max_level(tracing::Level::DEBUG)
                .with_writer(move || writer.clone())
                .finish();
            tracing::subscriber::set_global_default(subscriber).unwrap();
            logs
        })
        .clone()
}
