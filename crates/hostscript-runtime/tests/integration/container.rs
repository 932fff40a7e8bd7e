//! Caching, invalidation and kind policies of the session container.

use std::{
    sync::{
        Arc, Barrier,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

use hostscript_core::{
    CloseReason, ForeignError, RuntimeConfiguration, SessionError, StartupConfig,
};
use hostscript_runtime::{
    ContainerError, ContextSwitch, ScriptEngine, SessionContainer, SessionKind,
};
use serde_json::json;
use tempfile::TempDir;

use crate::support::{Probe, StubEngine, StubHandle};

fn container(kind: SessionKind) -> SessionContainer<StubEngine> {
    SessionContainer::new(StubEngine::new(), kind)
}

#[test]
fn test_concurrent_first_access_creates_one_session() {
    // Arrange
    let container = Arc::new(container(SessionKind::Shared));
    let barrier = Arc::new(Barrier::new(8));

    // Act
    let workers: Vec<_> = (0..8)
        .map(|_| {
            let container = Arc::clone(&container);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                container.session("race").unwrap()
            })
        })
        .collect();
    let sessions: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    // Assert
    assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
    assert_eq!(container.engine().created(), 1);
    assert_eq!(container.open_sessions(), 1);
}

#[test]
fn test_kinds_use_their_own_handles() {
    let container = container(SessionKind::Local);

    let local = container.get(SessionKind::Local, "job").unwrap();
    let shared = container.get(SessionKind::Shared, "job").unwrap();
    let local_again = container.session("job").unwrap();

    assert!(!Arc::ptr_eq(&local, &shared));
    assert!(Arc::ptr_eq(&local, &local_again));
    let flags: Vec<bool> = container.engine().probes().iter().map(|p| p.shared).collect();
    assert_eq!(flags, vec![false, true]);
    assert_eq!(local.name(), "Python local (isolated) session \"job\"");
    assert_eq!(shared.name(), "Python shared session \"job\"");
}

#[test]
fn test_invalidate_without_sessions_is_a_no_op() {
    let container = container(SessionKind::Shared);

    container.invalidate(SessionKind::Shared).unwrap();
    container.invalidate_all().unwrap();

    assert_eq!(container.open_sessions(), 0);
    assert_eq!(container.engine().created(), 0);
}

#[test]
fn test_invalidate_closes_only_the_given_kind() {
    // Arrange
    let container = container(SessionKind::Local);
    let local = container.get(SessionKind::Local, "a").unwrap();
    let shared = container.get(SessionKind::Shared, "a").unwrap();

    // Act
    container.invalidate(SessionKind::Local).unwrap();

    // Assert
    assert!(local.is_closed());
    assert_eq!(local.close_reason(), Some(CloseReason::Normal));
    assert!(!shared.is_closed());
    assert_eq!(container.open_sessions(), 1);
}

#[test]
fn test_switching_kind_never_returns_a_stale_handle() {
    // Arrange
    let container = container(SessionKind::Local);
    let before = container.session("ctx").unwrap();
    let before_id = before.invoke("id", Vec::new()).unwrap();

    // Act
    container.set_kind(SessionKind::Shared).unwrap();
    let after = container.session("ctx").unwrap();
    let after_id = after.invoke("id", Vec::new()).unwrap();

    // Assert
    assert!(before.is_closed());
    assert!(after_id.as_u64() > before_id.as_u64());
    assert_eq!(container.kind(), SessionKind::Shared);
    assert!(container.engine().probes()[0].is_closed());
}

#[test]
fn test_setting_the_same_kind_keeps_sessions() {
    let container = container(SessionKind::Shared);
    let session = container.session("ctx").unwrap();

    container.set_kind(SessionKind::Shared).unwrap();

    assert!(!session.is_closed());
    assert!(Arc::ptr_eq(&session, &container.session("ctx").unwrap()));
}

#[test]
fn test_session_closed_elsewhere_is_replaced() {
    let container = container(SessionKind::Local);
    let first = container.session("ctx").unwrap();

    first.close().unwrap();
    let second = container.session("ctx").unwrap();

    assert!(!Arc::ptr_eq(&first, &second));
    assert!(!second.is_closed());
    assert_eq!(container.engine().created(), 2);
}

#[test]
fn test_context_switch_reject() {
    let container = container(SessionKind::Shared).with_context_switch(ContextSwitch::Reject);
    let first = container.session("first").unwrap();

    let Err(err) = container.session("second") else {
        panic!("expected context conflict");
    };

    assert!(matches!(
        &err,
        ContainerError::ContextConflict { existing, requested, .. }
            if existing == "first" && requested == "second"
    ));
    first.close().unwrap();
    assert!(container.session("second").is_ok());
}

#[test]
fn test_context_switch_close_previous() {
    let container =
        container(SessionKind::Local).with_context_switch(ContextSwitch::ClosePrevious);
    let first = container.session("first").unwrap();
    let other_kind = container.get(SessionKind::Shared, "first").unwrap();

    let second = container.session("second").unwrap();

    assert!(first.is_closed());
    assert!(!second.is_closed());
    assert!(!other_kind.is_closed());
}

#[test]
fn test_global_kind_requires_the_global_lock() {
    let container = container(SessionKind::Global);

    let Err(err) = container.session("ctx") else {
        panic!("expected lock requirement");
    };

    assert!(matches!(
        err,
        ContainerError::GlobalLockRequired {
            kind: SessionKind::Global
        }
    ));
    assert_eq!(container.engine().created(), 0);
}

#[test]
fn test_run_global_creates_executes_and_closes() {
    // Arrange
    let container = container(SessionKind::Global);

    // Act
    let greeting = container
        .run_global("ctx", |session| Ok(session.invoke("greet", Vec::new())?))
        .unwrap();

    // Assert
    assert_eq!(greeting, json!("hello"));
    let probes = container.engine().probes();
    assert_eq!(probes.len(), 1);
    assert!(probes[0].shared);
    assert_eq!(probes[0].entries(), vec!["invoke greet", "close"]);
    assert_eq!(container.open_sessions(), 0);
}

#[test]
fn test_run_global_closes_the_session_when_execute_fails() {
    let container = container(SessionKind::Global);

    let result: Result<(), _> = container.run_global("ctx", |session| {
        session.invoke("undefined", Vec::new())?;
        Ok(())
    });

    assert!(matches!(
        result,
        Err(ContainerError::Session(SessionError::ForeignRuntimeFailure { .. }))
    ));
    assert!(container.engine().probes()[0].is_closed());
}

#[test]
fn test_custom_factory_and_lazy_startup() {
    // Arrange
    let supplied = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&supplied);
    let probe = Probe::new(99);
    let attached = probe.clone();
    let container = container(SessionKind::Local)
        .with_factory("custom stub", move |_startup| {
            Ok(StubHandle::attached(&attached))
        })
        .with_startup(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            StartupConfig::new().with_startup_code(["x = 1"])
        });
    assert_eq!(supplied.load(Ordering::SeqCst), 0);

    // Act
    let session = container.session("ctx").unwrap();
    let id = session.invoke("id", Vec::new()).unwrap();

    // Assert
    assert_eq!(supplied.load(Ordering::SeqCst), 1);
    assert_eq!(session.name(), "custom stub session \"ctx\"");
    assert_eq!(id, json!(99));
    assert_eq!(probe.entries(), vec!["x = 1", "invoke id"]);
    assert_eq!(container.engine().created(), 0);
}

#[test]
fn test_startup_include_paths_reach_the_engine() {
    let container = container(SessionKind::Shared)
        .with_startup(|| StartupConfig::new().with_include_paths(["/opt/scripts"]));

    container.session("ctx").unwrap();

    assert_eq!(
        container.engine().probes()[0].entries(),
        vec!["include /opt/scripts"]
    );
}

#[test]
fn test_shared_configuration_is_latched_by_the_first_session() {
    // Arrange
    let first = RuntimeConfiguration {
        verbose: Some(1),
        ..RuntimeConfiguration::default()
    };
    let engine = StubEngine::new();
    engine.set_configuration(first.clone());
    let container = SessionContainer::new(engine, SessionKind::Shared);

    // Act
    container.session("a").unwrap();
    container.engine().set_configuration(RuntimeConfiguration {
        verbose: Some(2),
        ..RuntimeConfiguration::default()
    });
    container.invalidate_all().unwrap();
    container.session("b").unwrap();
    container.run_global("c", |_| Ok(())).unwrap();

    // Assert
    assert_eq!(container.engine().applied(), vec![first.clone()]);
    assert_eq!(container.engine().shared_latch().get(), Some(&first));
}

#[test]
fn test_local_sessions_do_not_latch_configuration() {
    let container = container(SessionKind::Local);

    container.session("ctx").unwrap();

    assert!(!container.engine().shared_latch().is_latched());
    assert!(container.engine().applied().is_empty());
}

#[test]
fn test_rejected_shared_configuration_is_a_creation_failure() {
    let container = container(SessionKind::Shared);
    container.engine().reject_configuration();

    let Err(err) = container.session("ctx") else {
        panic!("expected creation failure");
    };

    assert!(matches!(
        err,
        ContainerError::Session(SessionError::CreationFailure { .. })
    ));
    assert!(
        err.to_string()
            .starts_with("cannot configure the shared Python runtime"),
        "{err}"
    );
    assert_eq!(container.engine().created(), 0);
}

#[test]
fn test_missing_library_is_diagnosed_with_configured_home() {
    // Arrange
    let temp = TempDir::new().unwrap();
    let home = temp.path().join("missing-python");
    let engine = StubEngine::new();
    engine.set_configuration(RuntimeConfiguration {
        home: Some(home.clone()),
        ..RuntimeConfiguration::default()
    });
    engine.fail_creation(ForeignError::library_load("libpython3.so: cannot open"));
    let container = SessionContainer::new(engine, SessionKind::Shared);

    // Act
    let Err(err) = container.session("ctx") else {
        panic!("expected creation failure");
    };

    // Assert
    let message = err.to_string();
    assert!(message.contains("libpython3.so: cannot open"), "{message}");
    assert!(
        message.contains(&format!(
            "home \"{}\" is not an existing Python directory",
            home.display()
        )),
        "{message}"
    );
}

#[test]
fn test_dropping_the_container_closes_its_sessions() {
    let container = container(SessionKind::Shared);
    let session = container.session("ctx").unwrap();
    let probe = container.engine().probes()[0].clone();

    drop(container);

    assert!(session.is_closed());
    assert_eq!(session.close_reason(), Some(CloseReason::Normal));
    assert_eq!(probe.close_count(), 1);
}
