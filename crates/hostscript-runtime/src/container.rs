//! Lazy, keyed cache of sessions.
//!
//! A [`SessionContainer`] hands out one [`Session`] per `(kind, context id)`
//! pair and keeps it alive across repeated executions of the same logical
//! script context. Sessions are created on first access, closed when their
//! kind is invalidated, and closed explicitly when the container is dropped.
//!
//! # Thread Safety
//!
//! All methods take `&self`. Concurrent first access to the same key creates
//! exactly one session: callers racing for a key wait on that key's slot
//! while the winner builds the session. Different keys never wait on each
//! other except for the short map lookup.

use std::{
    cell::OnceCell,
    collections::HashMap,
    fmt,
    sync::Arc,
};

use hostscript_core::{
    ForeignError, ForeignHandle, HomeInfo, RuntimeDescriptor, Session, SessionBuilder,
    SessionError, StartupConfig, diagnostics, global_lock,
};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::{engine::ScriptEngine, kind::SessionKind};

/// Custom handle constructor replacing the kind's strategy.
pub type HandleFactory<H> = Arc<dyn Fn(&StartupConfig) -> Result<H, ForeignError> + Send + Sync>;

/// Lazily evaluated startup configuration.
pub type StartupSupplier = Arc<dyn Fn() -> StartupConfig + Send + Sync>;

type Slot<H> = Arc<Mutex<SlotState<H>>>;

/// Contents of one cache entry. A retired slot has been removed from the
/// map by an invalidation and must not be filled again.
struct SlotState<H: ForeignHandle> {
    session: Option<Arc<Session<H>>>,
    retired: bool,
}

impl<H: ForeignHandle> Default for SlotState<H> {
    fn default() -> Self {
        Self {
            session: None,
            retired: false,
        }
    }
}

/// What to do when a kind is asked for a context while sessions of other
/// contexts of the same kind are cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContextSwitch {
    /// Keep all contexts side by side.
    #[default]
    Keep,
    /// Close the sessions of the other contexts first.
    ClosePrevious,
    /// Fail with [`ContainerError::ContextConflict`].
    Reject,
}

/// Errors produced by a [`SessionContainer`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ContainerError {
    /// Creating, using or closing a session failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Another context of the same kind is active and the container rejects
    /// context switches.
    #[error(
        "cannot open a {kind} session for context \"{requested}\": \
         context \"{existing}\" is still active"
    )]
    ContextConflict {
        kind: SessionKind,
        existing: String,
        requested: String,
    },

    /// A globally locked kind was requested outside the global lock.
    #[error("{kind} sessions can only be used inside SessionContainer::run_global")]
    GlobalLockRequired { kind: SessionKind },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    kind: SessionKind,
    context_id: String,
}

struct CustomFactory<H> {
    name: String,
    create: HandleFactory<H>,
}

/// Keyed cache of sessions built by one [`ScriptEngine`].
pub struct SessionContainer<E: ScriptEngine> {
    engine: Arc<E>,
    kind: Mutex<SessionKind>,
    context_switch: ContextSwitch,
    factory: Option<CustomFactory<E::Handle>>,
    startup: Option<StartupSupplier>,
    slots: Mutex<HashMap<SessionKey, Slot<E::Handle>>>,
}

impl<E: ScriptEngine> SessionContainer<E> {
    /// Creates an empty container whose current kind is `kind`.
    pub fn new(engine: E, kind: SessionKind) -> Self {
        Self {
            engine: Arc::new(engine),
            kind: Mutex::new(kind),
            context_switch: ContextSwitch::default(),
            factory: None,
            startup: None,
            slots: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_context_switch(mut self, context_switch: ContextSwitch) -> Self {
        self.context_switch = context_switch;
        self
    }

    /// Builds handles with `create` instead of the kind's strategy. `name`
    /// replaces the runtime and kind in session names.
    #[must_use]
    pub fn with_factory(
        mut self,
        name: impl Into<String>,
        create: impl Fn(&StartupConfig) -> Result<E::Handle, ForeignError> + Send + Sync + 'static,
    ) -> Self {
        self.factory = Some(CustomFactory {
            name: name.into(),
            create: Arc::new(create),
        });
        self
    }

    /// Startup configuration for new sessions. `supply` is only called when
    /// a session is actually created.
    #[must_use]
    pub fn with_startup(
        mut self,
        supply: impl Fn() -> StartupConfig + Send + Sync + 'static,
    ) -> Self {
        self.startup = Some(Arc::new(supply));
        self
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// The kind used by [`session`](Self::session).
    pub fn kind(&self) -> SessionKind {
        *self.kind.lock()
    }

    /// Switches the current kind. When it actually changes, every cached
    /// session is closed first so that no session created under the old
    /// kind is handed out afterwards.
    ///
    /// # Errors
    ///
    /// Returns the first error raised while closing the cached sessions. The
    /// kind is switched regardless.
    pub fn set_kind(&self, kind: SessionKind) -> Result<(), ContainerError> {
        let previous = std::mem::replace(&mut *self.kind.lock(), kind);
        if previous == kind {
            return Ok(());
        }
        info!(from = %previous, to = %kind, "Switching session kind");
        self.invalidate_all()
    }

    /// Session of the current kind for `context_id`. See [`get`](Self::get).
    ///
    /// # Errors
    ///
    /// Same as [`get`](Self::get).
    pub fn session(&self, context_id: &str) -> Result<Arc<Session<E::Handle>>, ContainerError> {
        self.get(self.kind(), context_id)
    }

    /// Returns the cached session for `(kind, context_id)`, creating it on
    /// first access. A cached session that has been closed is replaced by a
    /// new one. If the key is invalidated while this call waits for it, the
    /// lookup starts over so the session always ends up in the cache.
    ///
    /// # Errors
    ///
    /// - [`ContainerError::GlobalLockRequired`] if `kind` is globally locked
    ///   and the caller is not inside [`run_global`](Self::run_global).
    /// - [`ContainerError::ContextConflict`] if the container rejects context
    ///   switches and another context of `kind` is active.
    /// - [`ContainerError::Session`] if the session could not be created.
    pub fn get(
        &self,
        kind: SessionKind,
        context_id: &str,
    ) -> Result<Arc<Session<E::Handle>>, ContainerError> {
        if kind.policy::<E>().is_globally_locked() && !global_lock::is_held_by_current_thread() {
            return Err(ContainerError::GlobalLockRequired { kind });
        }
        loop {
            let (slot, displaced) = self.slot_for(kind, context_id)?;
            close_slots(displaced)?;
            if let Some(session) = self.fill(&slot, kind, context_id)? {
                return Ok(session);
            }
            debug!(kind = %kind, context = context_id, "Session slot was invalidated, retrying");
        }
    }

    /// Runs `execute` with the globally locked session of `context_id` as
    /// one critical section: the session is created, used and closed while
    /// the process-wide lock is held.
    ///
    /// # Errors
    ///
    /// Returns the first error of creation, `execute` or closing. Closing is
    /// attempted even if an earlier step failed.
    pub fn run_global<T>(
        &self,
        context_id: &str,
        execute: impl FnOnce(&Session<E::Handle>) -> Result<T, ContainerError>,
    ) -> Result<T, ContainerError> {
        let kind = SessionKind::Global;
        let session = OnceCell::new();
        global_lock::run_exclusive(
            || {
                let _ = session.set(self.get(kind, context_id)?);
                Ok(())
            },
            || match session.get() {
                Some(session) => execute(session),
                None => Err(SessionError::ImpossibleState(
                    "global session missing after initialization".to_string(),
                )
                .into()),
            },
            || self.evict(kind, context_id),
        )
    }

    /// Closes and forgets every session of `kind`. Does nothing if there
    /// are none.
    ///
    /// # Errors
    ///
    /// Returns the first error raised while closing; the remaining sessions
    /// are still closed.
    pub fn invalidate(&self, kind: SessionKind) -> Result<(), ContainerError> {
        let mut removed = Vec::new();
        self.slots.lock().retain(|key, slot| {
            if key.kind == kind {
                removed.push(Arc::clone(slot));
                false
            } else {
                true
            }
        });
        close_slots(removed)
    }

    /// Closes and forgets every session.
    ///
    /// # Errors
    ///
    /// Same as [`invalidate`](Self::invalidate).
    pub fn invalidate_all(&self) -> Result<(), ContainerError> {
        let removed = self
            .slots
            .lock()
            .drain()
            .map(|(_, slot)| slot)
            .collect();
        close_slots(removed)
    }

    /// Number of cached sessions that are still open.
    pub fn open_sessions(&self) -> usize {
        let slots: Vec<Slot<E::Handle>> = self.slots.lock().values().cloned().collect();
        slots
            .iter()
            .filter(|slot| {
                slot.lock()
                    .session
                    .as_ref()
                    .is_some_and(|session| !session.is_closed())
            })
            .count()
    }

    /// Finds or inserts the slot for a key and applies the context switch
    /// policy. Displaced slots are returned so they can be closed outside
    /// the map lock.
    fn slot_for(
        &self,
        kind: SessionKind,
        context_id: &str,
    ) -> Result<(Slot<E::Handle>, Vec<Slot<E::Handle>>), ContainerError> {
        let key = SessionKey {
            kind,
            context_id: context_id.to_string(),
        };
        let mut slots = self.slots.lock();
        let mut displaced = Vec::new();
        if !slots.contains_key(&key) {
            match self.context_switch {
                ContextSwitch::Keep => {}
                ContextSwitch::ClosePrevious => slots.retain(|other, slot| {
                    if other.kind == kind {
                        displaced.push(Arc::clone(slot));
                        false
                    } else {
                        true
                    }
                }),
                ContextSwitch::Reject => {
                    let active = slots
                        .iter()
                        .find(|(other, slot)| other.kind == kind && is_active(slot));
                    if let Some((other, _)) = active {
                        return Err(ContainerError::ContextConflict {
                            kind,
                            existing: other.context_id.clone(),
                            requested: key.context_id,
                        });
                    }
                }
            }
        }
        let slot = Arc::clone(slots.entry(key).or_default());
        Ok((slot, displaced))
    }

    /// Returns the open session held by `slot`, creating it if needed.
    /// `None` means the slot was retired after it was looked up.
    fn fill(
        &self,
        slot: &Slot<E::Handle>,
        kind: SessionKind,
        context_id: &str,
    ) -> Result<Option<Arc<Session<E::Handle>>>, SessionError> {
        let mut state = slot.lock();
        if state.retired {
            return Ok(None);
        }
        if let Some(session) = state.session.as_ref() {
            if !session.is_closed() {
                return Ok(Some(Arc::clone(session)));
            }
            debug!(session = %session.name(), "Cached session was closed, creating a new one");
        }
        let session = Arc::new(self.create_session(kind, context_id)?);
        state.session = Some(Arc::clone(&session));
        Ok(Some(session))
    }

    fn create_session(
        &self,
        kind: SessionKind,
        context_id: &str,
    ) -> Result<Session<E::Handle>, SessionError> {
        let descriptor = self.engine.descriptor();
        let policy = kind.policy::<E>();
        policy
            .prepare(&self.engine)
            .map_err(|err| self.configuration_failure(kind, &descriptor, err))?;

        let name = match &self.factory {
            Some(factory) => format!("{} session \"{context_id}\"", factory.name),
            None => format!(
                "{} {} session \"{context_id}\"",
                descriptor.runtime_name,
                kind.pretty_name()
            ),
        };
        let startup = self
            .startup
            .as_ref()
            .map_or_else(StartupConfig::default, |supply| supply());
        let home = self.home_info(kind, &descriptor);

        let engine = Arc::clone(&self.engine);
        let custom = self.factory.as_ref().map(|factory| Arc::clone(&factory.create));
        let handle_startup = startup.clone();
        let session = SessionBuilder::new(name)
            .descriptor(descriptor)
            .home_info(home)
            .startup(startup)
            .spawn(move || match custom {
                Some(create) => create(&handle_startup),
                None => kind.policy::<E>().create_handle(&engine, &handle_startup),
            })?;

        if kind == SessionKind::Local {
            debug!(session = %session.name(), kind = %kind, "Created session");
        } else {
            info!(session = %session.name(), kind = %kind, "Created session");
        }
        Ok(session)
    }

    /// Home directory information matching how `kind` configures the
    /// runtime.
    fn home_info(&self, kind: SessionKind, descriptor: &RuntimeDescriptor) -> HomeInfo {
        let lookup = |key: &str| std::env::var(key).ok();
        match self.engine.shared_latch().get() {
            Some(applied) if kind != SessionKind::Local => {
                applied.home_info(descriptor, true, lookup)
            }
            _ => self.engine.configuration().home_info(descriptor, false, lookup),
        }
    }

    fn configuration_failure(
        &self,
        kind: SessionKind,
        descriptor: &RuntimeDescriptor,
        err: ForeignError,
    ) -> SessionError {
        let message = if err.is_library_load() {
            diagnostics::creation_failure_message(
                descriptor,
                &self.home_info(kind, descriptor),
                &err,
            )
        } else {
            format!(
                "cannot configure the shared {} runtime: {}",
                descriptor.runtime_name,
                err.message()
            )
        };
        SessionError::CreationFailure {
            message,
            source: Box::new(err),
        }
    }

    fn evict(&self, kind: SessionKind, context_id: &str) -> Result<(), ContainerError> {
        let key = SessionKey {
            kind,
            context_id: context_id.to_string(),
        };
        let removed = self.slots.lock().remove(&key);
        close_slots(removed.into_iter().collect())
    }
}

impl<E: ScriptEngine> Drop for SessionContainer<E> {
    fn drop(&mut self) {
        if let Err(err) = self.invalidate_all() {
            error!(error = %err, "Failed to close sessions of dropped container");
        }
    }
}

impl<E: ScriptEngine> fmt::Debug for SessionContainer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContainer")
            .field("kind", &self.kind())
            .field("context_switch", &self.context_switch)
            .field("factory", &self.factory.as_ref().map(|factory| &factory.name))
            .field("slots", &self.slots.lock().len())
            .finish_non_exhaustive()
    }
}

/// Whether a slot holds an open session or is being filled right now.
fn is_active<H: ForeignHandle>(slot: &Slot<H>) -> bool {
    match slot.try_lock() {
        Some(state) => state
            .session
            .as_ref()
            .is_some_and(|session| !session.is_closed()),
        None => true,
    }
}

/// Retires `slots` and closes their sessions, waiting for any creation in
/// progress.
fn close_slots<H: ForeignHandle>(slots: Vec<Slot<H>>) -> Result<(), ContainerError> {
    let mut first_error = None;
    for slot in slots {
        let session = {
            let mut state = slot.lock();
            state.retired = true;
            state.session.take()
        };
        let Some(session) = session else {
            continue;
        };
        debug!(session = %session.name(), "Evicting session");
        if let Err(err) = session.close() {
            warn!(session = %session.name(), error = %err, "Failed to close evicted session");
            if first_error.is_none() {
                first_error = Some(err);
            }
        }
    }
    match first_error {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}
