//! Worker thread sessions.
//!
//! A [`Session`] owns one foreign handle and the single OS thread that handle
//! lives on. The handle is created on that thread, every call is shipped to
//! it through a FIFO queue, and it is destroyed there as well. Callers only
//! ever see values and [`SessionError`]s.
//!
//! # Lifecycle
//!
//! ```text
//! SessionBuilder::spawn ──> Open ──close()──> Closed (CloseReason::Normal)
//!                             │
//!                             └──dropped while open──> safety net ──> Closed (CloseReason::Leaked)
//! ```

use std::{
    any::Any,
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    path::PathBuf,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        mpsc as std_mpsc,
    },
    thread::{self, JoinHandle, ThreadId},
    time::Duration,
};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace, warn};

use crate::{
    diagnostics::{self, HomeInfo, RuntimeDescriptor, TaskFailure, WorkerFailure},
    error::SessionError,
    handle::{ForeignError, ForeignHandle, NamedArgs, ScriptText, Value},
    safety_net::{self, Reclaim},
    startup::StartupConfig,
};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);
static OPEN_SESSIONS: AtomicUsize = AtomicUsize::new(0);

/// Whether a session still accepts calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Open,
    Closed,
}

/// How a session was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// [`Session::close`] was called.
    Normal,
    /// The session was dropped while open and closed by the safety net.
    Leaked,
}

type Job<H> = Box<dyn FnOnce(&mut H) + Send>;

enum Command<H> {
    Run(Job<H>),
    Close {
        reply: std_mpsc::Sender<Result<(), TaskFailure>>,
    },
}

struct WorkerState<H> {
    sender: Option<mpsc::UnboundedSender<Command<H>>>,
    worker: Option<JoinHandle<()>>,
}

struct Shared<H> {
    name: String,
    worker_id: ThreadId,
    /// Set before the close command is queued; the worker skips every job it
    /// sees afterwards.
    closed: Arc<AtomicBool>,
    state: Mutex<WorkerState<H>>,
    close_reason: OnceLock<CloseReason>,
    verification_status: Option<Value>,
}

impl<H: ForeignHandle> Shared<H> {
    fn enqueue(&self, job: Job<H>) -> Result<(), SessionError> {
        if thread::current().id() == self.worker_id {
            return Err(SessionError::ReentrantCall {
                target: self.name.clone(),
            });
        }
        let state = self.state.lock();
        let sender = match &state.sender {
            Some(sender) if !self.closed.load(Ordering::Acquire) => sender,
            _ => return Err(self.use_after_close()),
        };
        sender
            .send(Command::Run(job))
            .map_err(|_| self.use_after_close())
    }

    fn use_after_close(&self) -> SessionError {
        SessionError::UseAfterClose {
            session: self.name.clone(),
        }
    }

    /// Closes the handle on its worker thread and stops the thread. Only the
    /// first call does anything.
    fn shutdown(&self, reason: CloseReason) -> Result<(), SessionError> {
        let (sender, worker) = {
            let mut state = self.state.lock();
            let Some(sender) = state.sender.take() else {
                return Ok(());
            };
            self.closed.store(true, Ordering::Release);
            (sender, state.worker.take())
        };
        let _ = self.close_reason.set(reason);
        OPEN_SESSIONS.fetch_sub(1, Ordering::AcqRel);

        let (reply_tx, reply_rx) = std_mpsc::channel();
        let queued = sender.send(Command::Close { reply: reply_tx });
        drop(sender);
        if queued.is_err() {
            return Err(SessionError::ImpossibleState(format!(
                "worker thread of {} exited before it was closed",
                self.name
            )));
        }

        if thread::current().id() == self.worker_id {
            // The close command runs once the current job returns.
            debug!(session = %self.name, "Session closed from its own worker thread");
            return Ok(());
        }

        let closed = reply_rx.recv();
        if let Some(worker) = worker
            && worker.join().is_err()
        {
            error!(session = %self.name, "Worker thread panicked while shutting down");
        }
        match closed {
            Ok(Ok(())) => {
                trace!(session = %self.name, close_reason = ?reason, "Session closed");
                Ok(())
            }
            Ok(Err(failure)) => Err(diagnostics::translate(
                WorkerFailure::Execution(failure),
                &self.name,
            )),
            Err(_) => Err(diagnostics::translate(
                WorkerFailure::Unexpected(format!(
                    "worker thread of {} stopped without acknowledging close",
                    self.name
                )),
                &self.name,
            )),
        }
    }
}

impl<H: ForeignHandle> Reclaim for Arc<Shared<H>> {
    fn name(&self) -> &str {
        &self.name
    }

    fn reclaim(self: Box<Self>) {
        warn!(
            session = %self.name,
            close_reason = ?CloseReason::Leaked,
            "Closing forgotten session that was dropped without close()"
        );
        if let Err(err) = self.shutdown(CloseReason::Leaked) {
            error!(session = %self.name, error = %err, "Safety net could not close session");
        }
    }
}

/// Configures and starts a [`Session`].
#[derive(Debug, Clone)]
pub struct SessionBuilder {
    name: String,
    descriptor: RuntimeDescriptor,
    home: Option<HomeInfo>,
    startup: StartupConfig,
}

impl SessionBuilder {
    /// Starts a builder for a session labelled `name` in logs and errors.
    ///
    /// Creation failures are diagnosed as a Python-compatible runtime unless
    /// [`descriptor`](Self::descriptor) says otherwise.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            descriptor: RuntimeDescriptor::python(),
            home: None,
            startup: StartupConfig::default(),
        }
    }

    /// Runtime the handle belongs to, used to phrase diagnostics.
    #[must_use]
    pub fn descriptor(mut self, descriptor: RuntimeDescriptor) -> Self {
        self.descriptor = descriptor;
        self
    }

    /// Home directory information used to diagnose a library load failure.
    ///
    /// Without it, the runtime's home environment variable is consulted when
    /// a failure actually needs explaining.
    #[must_use]
    pub fn home_info(mut self, home: HomeInfo) -> Self {
        self.home = Some(home);
        self
    }

    #[must_use]
    pub fn startup(mut self, startup: StartupConfig) -> Self {
        self.startup = startup;
        self
    }

    /// Spawns the worker thread, builds the handle on it with `factory` and
    /// runs the startup configuration.
    ///
    /// Returns only once the handle is ready or creation has failed; on
    /// failure the handle is closed and the worker thread joined before the
    /// error is returned.
    ///
    /// # Errors
    ///
    /// - [`SessionError::CreationFailure`] if the worker thread cannot be
    ///   started, or the factory reports a library load failure. The message
    ///   carries the home-directory diagnosis.
    /// - [`SessionError::ForeignRuntimeFailure`] if the factory fails for
    ///   another reason or panics.
    /// - Any error of [`StartupConfig::apply`].
    pub fn spawn<H, F>(self, factory: F) -> Result<Session<H>, SessionError>
    where
        H: ForeignHandle,
        F: FnOnce() -> Result<H, ForeignError> + Send + 'static,
    {
        let Self {
            name,
            descriptor,
            home,
            startup,
        } = self;
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let closed = Arc::new(AtomicBool::new(false));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Command<H>>();
        let (ready_tx, ready_rx) = std_mpsc::channel();

        let worker = {
            let name = name.clone();
            let closed = Arc::clone(&closed);
            thread::Builder::new()
                .name(format!("hostscript {name} worker #{id}"))
                .spawn(move || {
                    let created = create_handle(factory, &startup, &descriptor, home, &name);
                    let handle = match created {
                        Ok((handle, status)) => {
                            if ready_tx.send(Ok(status)).is_err() {
                                release_handle(handle, &name);
                                return;
                            }
                            handle
                        }
                        Err(err) => {
                            let _ = ready_tx.send(Err(err));
                            return;
                        }
                    };
                    serve(handle, cmd_rx, &closed, &name);
                })
        };
        let worker = match worker {
            Ok(worker) => worker,
            Err(err) => {
                return Err(SessionError::CreationFailure {
                    message: format!("cannot start worker thread of {name}: {err}"),
                    source: Box::new(err),
                });
            }
        };
        trace!(session = %name, "Spawned worker thread");

        let verification_status = match ready_rx.recv() {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => {
                join_quietly(worker, &name);
                return Err(err);
            }
            Err(_) => {
                join_quietly(worker, &name);
                return Err(SessionError::ImpossibleState(format!(
                    "worker thread of {name} exited during creation"
                )));
            }
        };

        OPEN_SESSIONS.fetch_add(1, Ordering::AcqRel);
        debug!(session = %name, "Session created");
        Ok(Session {
            shared: Arc::new(Shared {
                worker_id: worker.thread().id(),
                name,
                closed,
                state: Mutex::new(WorkerState {
                    sender: Some(cmd_tx),
                    worker: Some(worker),
                }),
                close_reason: OnceLock::new(),
                verification_status,
            }),
        })
    }
}

/// One foreign handle bound to its own worker thread.
///
/// Calls from any number of threads are executed one at a time, in
/// submission order, on the worker thread. The session is `Send + Sync`
/// even when the handle itself is not.
///
/// Dropping an open session does not block: the safety net closes it in the
/// background and logs a warning. Call [`close`](Self::close) to release it
/// deterministically.
pub struct Session<H: ForeignHandle> {
    shared: Arc<Shared<H>>,
}

impl<H: ForeignHandle> Session<H> {
    /// Creates a session with default settings. See [`SessionBuilder::spawn`].
    ///
    /// # Errors
    ///
    /// Same as [`SessionBuilder::spawn`].
    pub fn create<F>(factory: F, name: impl Into<String>) -> Result<Self, SessionError>
    where
        F: FnOnce() -> Result<H, ForeignError> + Send + 'static,
    {
        SessionBuilder::new(name).spawn(factory)
    }

    /// Number of sessions currently open in this process.
    pub fn open_sessions() -> usize {
        OPEN_SESSIONS.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn status(&self) -> SessionStatus {
        if self.is_closed() {
            SessionStatus::Closed
        } else {
            SessionStatus::Open
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// How the session was closed; `None` while it is open.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.close_reason.get().copied()
    }

    /// Value returned by the startup verifier, if one ran and returned
    /// something.
    pub fn verification_status(&self) -> Option<&Value> {
        self.shared.verification_status.as_ref()
    }

    /// Runs `task` on the worker thread and blocks until it completes.
    ///
    /// Does not need a tokio runtime; from async code prefer
    /// [`call_async`](Self::call_async).
    ///
    /// # Errors
    ///
    /// - [`SessionError::UseAfterClose`] if the session is closed, or closes
    ///   before the task starts.
    /// - [`SessionError::ReentrantCall`] if called from the session's own
    ///   worker thread.
    /// - [`SessionError::ForeignRuntimeFailure`] if the task fails or panics.
    pub fn call<T, F>(&self, task: F) -> Result<T, SessionError>
    where
        T: Send + 'static,
        F: FnOnce(&mut H) -> Result<T, ForeignError> + Send + 'static,
    {
        let (reply_tx, reply_rx) = std_mpsc::channel();
        self.shared.enqueue(Box::new(move |handle: &mut H| {
            let _ = reply_tx.send(run_task(task, handle));
        }))?;
        self.settle(reply_rx.recv().ok())
    }

    /// Async variant of [`call`](Self::call).
    ///
    /// # Errors
    ///
    /// Same as [`call`](Self::call).
    pub async fn call_async<T, F>(&self, task: F) -> Result<T, SessionError>
    where
        T: Send + 'static,
        F: FnOnce(&mut H) -> Result<T, ForeignError> + Send + 'static,
    {
        let reply_rx = self.submit(task)?;
        self.settle(reply_rx.await.ok())
    }

    /// Like [`call_async`](Self::call_async), but stops waiting after
    /// `timeout`.
    ///
    /// The task itself is not cancelled. It keeps the handle until it
    /// finishes and its result is discarded; later calls queue behind it.
    ///
    /// # Errors
    ///
    /// [`SessionError::InterruptedOperation`] when the deadline passes,
    /// otherwise the same as [`call`](Self::call).
    pub async fn call_with_timeout<T, F>(
        &self,
        timeout: Duration,
        task: F,
    ) -> Result<T, SessionError>
    where
        T: Send + 'static,
        F: FnOnce(&mut H) -> Result<T, ForeignError> + Send + 'static,
    {
        let reply_rx = self.submit(task)?;
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(reply) => self.settle(reply.ok()),
            Err(_) => Err(diagnostics::translate(
                WorkerFailure::Interrupted,
                &self.shared.name,
            )),
        }
    }

    fn submit<T, F>(
        &self,
        task: F,
    ) -> Result<oneshot::Receiver<Result<T, TaskFailure>>, SessionError>
    where
        T: Send + 'static,
        F: FnOnce(&mut H) -> Result<T, ForeignError> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared.enqueue(Box::new(move |handle: &mut H| {
            let _ = reply_tx.send(run_task(task, handle));
        }))?;
        Ok(reply_rx)
    }

    /// Maps a task outcome onto the caller's result. `None` means the job
    /// was dropped without running.
    fn settle<T>(&self, reply: Option<Result<T, TaskFailure>>) -> Result<T, SessionError> {
        let failure = match reply {
            Some(Ok(value)) => return Ok(value),
            Some(Err(failure)) => WorkerFailure::Execution(failure),
            None => WorkerFailure::Abandoned,
        };
        Err(diagnostics::translate(failure, &self.shared.name))
    }

    /// Calls a function with positional arguments.
    ///
    /// # Errors
    ///
    /// See [`call`](Self::call).
    pub fn invoke(&self, name: &str, args: Vec<Value>) -> Result<Value, SessionError> {
        self.invoke_with(name, args, NamedArgs::new())
    }

    /// Calls a function with keyword arguments.
    ///
    /// # Errors
    ///
    /// See [`call`](Self::call).
    pub fn invoke_named(&self, name: &str, kwargs: NamedArgs) -> Result<Value, SessionError> {
        self.invoke_with(name, Vec::new(), kwargs)
    }

    /// Calls a function with positional and keyword arguments.
    ///
    /// # Errors
    ///
    /// See [`call`](Self::call).
    pub fn invoke_with(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: NamedArgs,
    ) -> Result<Value, SessionError> {
        let name = name.to_string();
        self.call(move |handle| handle.invoke(&name, &args, &kwargs))
    }

    /// # Errors
    ///
    /// See [`call`](Self::call).
    pub fn eval(&self, source: impl Into<String>) -> Result<bool, SessionError> {
        let source = source.into();
        self.call(move |handle| handle.eval(&source))
    }

    /// # Errors
    ///
    /// See [`call`](Self::call).
    pub fn exec(&self, source: impl Into<String>) -> Result<(), SessionError> {
        let source = source.into();
        self.call(move |handle| handle.exec(&source))
    }

    /// # Errors
    ///
    /// See [`call`](Self::call).
    pub fn run_script(&self, path: impl Into<PathBuf>) -> Result<(), SessionError> {
        let path = path.into();
        self.call(move |handle| handle.run_script(&path))
    }

    /// # Errors
    ///
    /// See [`call`](Self::call).
    pub fn get_value(&self, name: &str) -> Result<Value, SessionError> {
        let name = name.to_string();
        self.call(move |handle| handle.get_value(&name))
    }

    /// Reads a variable and converts it into `T`.
    ///
    /// # Errors
    ///
    /// [`SessionError::ValueConversion`] if the value does not fit `T`,
    /// otherwise see [`call`](Self::call).
    pub fn get_value_as<T: DeserializeOwned>(&self, name: &str) -> Result<T, SessionError> {
        let value = self.get_value(name)?;
        serde_json::from_value(value).map_err(|source| SessionError::ValueConversion {
            name: name.to_string(),
            source,
        })
    }

    /// # Errors
    ///
    /// See [`call`](Self::call).
    pub fn set_value(&self, name: &str, value: impl Into<Value>) -> Result<(), SessionError> {
        let name = name.to_string();
        let value = value.into();
        self.call(move |handle| handle.set_value(&name, value))
    }

    /// Evaluates a prepared script source and returns its completion value.
    ///
    /// # Errors
    ///
    /// See [`call`](Self::call).
    pub fn eval_source(&self, source: ScriptText) -> Result<Value, SessionError> {
        self.call(move |handle| handle.eval_source(&source))
    }

    /// Closes the handle on its worker thread and stops the thread.
    ///
    /// Idempotent. Tasks still queued behind the close request are abandoned
    /// and their callers get [`SessionError::UseAfterClose`].
    ///
    /// # Errors
    ///
    /// Returns a [`SessionError::ForeignRuntimeFailure`] if the handle failed
    /// to close. The session is closed regardless.
    pub fn close(&self) -> Result<(), SessionError> {
        self.shared.shutdown(CloseReason::Normal)
    }
}

impl<H: ForeignHandle> Drop for Session<H> {
    fn drop(&mut self) {
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }
        safety_net::hand_over(Box::new(Arc::clone(&self.shared)));
    }
}

impl<H: ForeignHandle> fmt::Debug for Session<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.shared.name)
            .field("status", &self.status())
            .field("close_reason", &self.close_reason())
            .finish_non_exhaustive()
    }
}

fn create_handle<H, F>(
    factory: F,
    startup: &StartupConfig,
    descriptor: &RuntimeDescriptor,
    home: Option<HomeInfo>,
    name: &str,
) -> Result<(H, Option<Value>), SessionError>
where
    H: ForeignHandle,
    F: FnOnce() -> Result<H, ForeignError>,
{
    let mut handle = match catch_unwind(AssertUnwindSafe(factory)) {
        Ok(Ok(handle)) => handle,
        Ok(Err(err)) if err.is_library_load() => {
            let home = home.unwrap_or_else(|| HomeInfo::detect(descriptor));
            return Err(SessionError::CreationFailure {
                message: diagnostics::creation_failure_message(descriptor, &home, &err),
                source: Box::new(err),
            });
        }
        Ok(Err(err)) => {
            return Err(diagnostics::translate(
                WorkerFailure::Execution(TaskFailure::Foreign(err)),
                name,
            ));
        }
        Err(panic) => {
            return Err(diagnostics::translate(
                WorkerFailure::Execution(TaskFailure::Panic(panic_message(panic.as_ref()))),
                name,
            ));
        }
    };

    let applied = catch_unwind(AssertUnwindSafe(|| {
        startup.apply(&mut handle, descriptor, name)
    }));
    let status = match applied {
        Ok(Ok(status)) => status,
        Ok(Err(err)) => {
            release_handle(handle, name);
            return Err(err);
        }
        Err(panic) => {
            release_handle(handle, name);
            return Err(diagnostics::translate(
                WorkerFailure::Execution(TaskFailure::Panic(panic_message(panic.as_ref()))),
                name,
            ));
        }
    };
    Ok((handle, status))
}

/// Worker thread main loop.
fn serve<H: ForeignHandle>(
    mut handle: H,
    mut commands: mpsc::UnboundedReceiver<Command<H>>,
    closed: &AtomicBool,
    name: &str,
) {
    while let Some(command) = commands.blocking_recv() {
        match command {
            Command::Run(job) => {
                if closed.load(Ordering::Acquire) {
                    // Dropping the job drops its reply channel; the caller
                    // sees the session as closed.
                    continue;
                }
                job(&mut handle);
            }
            Command::Close { reply } => {
                let _ = reply.send(release_handle(handle, name));
                return;
            }
        }
    }
    let _ = release_handle(handle, name);
}

/// Closes and drops `handle` on the current thread.
fn release_handle<H: ForeignHandle>(mut handle: H, name: &str) -> Result<(), TaskFailure> {
    let closed = match catch_unwind(AssertUnwindSafe(|| handle.close())) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(TaskFailure::Foreign(err)),
        Err(panic) => Err(TaskFailure::Panic(panic_message(panic.as_ref()))),
    };
    if let Err(failure) = &closed {
        debug!(session = %name, failure = ?failure, "Handle did not close cleanly");
    }
    if catch_unwind(AssertUnwindSafe(move || drop(handle))).is_err() {
        error!(session = %name, "Dropping the handle panicked");
    }
    closed
}

fn run_task<H, T, F>(task: F, handle: &mut H) -> Result<T, TaskFailure>
where
    F: FnOnce(&mut H) -> Result<T, ForeignError>,
{
    match catch_unwind(AssertUnwindSafe(|| task(handle))) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(TaskFailure::Foreign(err)),
        Err(panic) => Err(TaskFailure::Panic(panic_message(panic.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn join_quietly(worker: JoinHandle<()>, name: &str) {
    if worker.join().is_err() {
        error!(session = %name, "Worker thread panicked during creation");
    }
}
