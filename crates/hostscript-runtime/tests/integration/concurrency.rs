//! Ordering, close races and global exclusion under concurrent callers.

use std::{
    sync::{Arc, Barrier, mpsc},
    thread,
    time::{Duration, Instant},
};

use hostscript_core::{CloseReason, ForeignHandle, Session, SessionError};
use hostscript_runtime::{ContainerError, SessionContainer, SessionKind};
use parking_lot::Mutex;
use serde_json::json;

use crate::support::{Probe, StubEngine, StubHandle};

fn shared_session(name: &str) -> (Arc<Session<StubHandle>>, Probe) {
    let probe = Probe::new(1);
    let attached = probe.clone();
    let session = Session::create(move || Ok(StubHandle::attached(&attached)), name).unwrap();
    (Arc::new(session), probe)
}

#[tokio::test]
async fn test_queued_tasks_run_in_submission_order() {
    // Arrange: park the worker so every task below queues up behind it.
    let (session, probe) = shared_session("fifo");
    let (started_tx, started_rx) = mpsc::channel();
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    let parked = {
        let session = Arc::clone(&session);
        thread::spawn(move || {
            session.call(move |_| {
                started_tx.send(()).unwrap();
                gate_rx.recv().unwrap();
                Ok(())
            })
        })
    };
    started_rx.recv().unwrap();

    // Act
    for i in 0..20 {
        let waited = session
            .call_with_timeout(Duration::from_millis(1), move |handle| {
                handle.exec(&format!("task {i}"))
            })
            .await;
        assert!(matches!(
            waited,
            Err(SessionError::InterruptedOperation { .. })
        ));
    }
    gate_tx.send(()).unwrap();
    parked.join().unwrap().unwrap();
    session.call(|_| Ok(())).unwrap();

    // Assert
    let expected: Vec<String> = (0..20).map(|i| format!("task {i}")).collect();
    assert_eq!(probe.entries(), expected);
    session.close().unwrap();
}

#[test]
fn test_tasks_from_many_threads_never_interleave() {
    // Arrange
    let (session, _) = shared_session("interleave");
    let trace = Arc::new(Mutex::new(Vec::new()));
    let barrier = Arc::new(Barrier::new(4));

    // Act
    let callers: Vec<_> = (0..4)
        .map(|caller| {
            let session = Arc::clone(&session);
            let trace = Arc::clone(&trace);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for step in 0..25 {
                    let trace = Arc::clone(&trace);
                    session
                        .call(move |_| {
                            trace.lock().push((caller, step, "enter"));
                            thread::yield_now();
                            trace.lock().push((caller, step, "exit"));
                            Ok(())
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for caller in callers {
        caller.join().unwrap();
    }

    // Assert
    let trace = trace.lock();
    assert_eq!(trace.len(), 200);
    for pair in trace.chunks(2) {
        assert_eq!((pair[0].0, pair[0].1), (pair[1].0, pair[1].1));
        assert_eq!((pair[0].2, pair[1].2), ("enter", "exit"));
    }
    for caller in 0..4 {
        let steps: Vec<_> = trace
            .iter()
            .filter(|entry| entry.0 == caller && entry.2 == "enter")
            .map(|entry| entry.1)
            .collect();
        assert_eq!(steps, (0..25).collect::<Vec<_>>());
    }
    session.close().unwrap();
}

#[test]
fn test_concurrent_close_destroys_the_handle_once() {
    let (session, probe) = shared_session("double close");
    let barrier = Arc::new(Barrier::new(4));

    let closers: Vec<_> = (0..4)
        .map(|_| {
            let session = Arc::clone(&session);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                session.close()
            })
        })
        .collect();
    for closer in closers {
        closer.join().unwrap().unwrap();
    }
    session.close().unwrap();

    assert_eq!(probe.close_count(), 1);
    assert!(session.is_closed());
}

#[test]
fn test_calls_racing_close_succeed_or_fail_with_use_after_close() {
    // Arrange
    let (session, probe) = shared_session("close race");
    let barrier = Arc::new(Barrier::new(5));
    let callers: Vec<_> = (0..4)
        .map(|_| {
            let session = Arc::clone(&session);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut served = 0_usize;
                loop {
                    match session.invoke("greet", Vec::new()) {
                        Ok(value) => {
                            assert_eq!(value, json!("hello"));
                            served += 1;
                        }
                        Err(SessionError::UseAfterClose { .. }) => return served,
                        Err(other) => panic!("unexpected error: {other}"),
                    }
                }
            })
        })
        .collect();

    // Act
    barrier.wait();
    thread::sleep(Duration::from_millis(5));
    session.close().unwrap();
    let served: usize = callers.into_iter().map(|c| c.join().unwrap()).sum();

    // Assert
    let entries = probe.entries();
    assert_eq!(entries.last().map(String::as_str), Some("close"));
    assert_eq!(entries.len(), served + 1);
    assert!(matches!(
        session.invoke("greet", Vec::new()),
        Err(SessionError::UseAfterClose { .. })
    ));
}

#[test]
fn test_global_critical_sections_never_overlap() {
    // Arrange
    let intervals = Arc::new(Mutex::new(Vec::<(Instant, Instant)>::new()));
    let barrier = Arc::new(Barrier::new(2));

    // Act
    let runners: Vec<_> = ["left", "right"]
        .into_iter()
        .map(|context| {
            let intervals = Arc::clone(&intervals);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let container = SessionContainer::new(StubEngine::new(), SessionKind::Global);
                barrier.wait();
                for _ in 0..5 {
                    container
                        .run_global(context, |session| {
                            let entered = Instant::now();
                            session.call(|_| {
                                thread::sleep(Duration::from_millis(5));
                                Ok(())
                            })?;
                            intervals.lock().push((entered, Instant::now()));
                            Ok(())
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for runner in runners {
        runner.join().unwrap();
    }

    // Assert
    let mut intervals = intervals.lock().clone();
    intervals.sort_by_key(|interval| interval.0);
    assert_eq!(intervals.len(), 10);
    for window in intervals.windows(2) {
        assert!(window[0].1 <= window[1].0, "critical sections overlap");
    }
}

#[tokio::test]
async fn test_async_calls_share_the_queue() {
    let (session, _) = shared_session("async");

    let greeting = session
        .call_async(|handle| handle.invoke("greet", &[], &serde_json::Map::new()))
        .await
        .unwrap();

    assert_eq!(greeting, json!("hello"));
    session.close().unwrap();
}

fn open_in_background(
    container: &Arc<SessionContainer<StubEngine>>,
    context: &'static str,
) -> thread::JoinHandle<Result<Arc<Session<StubHandle>>, ContainerError>> {
    let container = Arc::clone(container);
    thread::spawn(move || container.session(context))
}

#[test]
fn test_shared_runtime_is_created_only_after_its_configuration_is_applied() {
    // Arrange
    let engine = StubEngine::new();
    engine.slow_configuration(Duration::from_millis(300));
    let container = Arc::new(SessionContainer::new(engine, SessionKind::Shared));

    // Act: the second context asks while the first one is still configuring.
    let first = open_in_background(&container, "a");
    thread::sleep(Duration::from_millis(50));
    let second = open_in_background(&container, "b");
    let first = first.join().unwrap().unwrap();
    let second = second.join().unwrap().unwrap();

    // Assert
    assert_eq!(
        container.engine().events(),
        vec!["apply start", "apply done", "create shared", "create shared"]
    );
    assert_eq!(container.engine().applied().len(), 1);
    assert!(!Arc::ptr_eq(&first, &second));
}

#[test]
fn test_rejected_configuration_fails_every_concurrent_shared_request() {
    let engine = StubEngine::new();
    engine.reject_configuration();
    let container = Arc::new(SessionContainer::new(engine, SessionKind::Shared));

    let requests: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|context| open_in_background(&container, context))
        .collect();

    for request in requests {
        let result = request.join().unwrap();
        let Err(err) = result else {
            panic!("expected creation failure");
        };
        assert!(
            err.to_string()
                .starts_with("cannot configure the shared Python runtime"),
            "{err}"
        );
    }
    assert_eq!(container.engine().created(), 0);
}

#[test]
fn test_session_handed_out_across_invalidation_is_closed_by_drop() {
    // Arrange: the first session is still being built while a second caller
    // for the same key and an invalidation queue up behind it.
    let engine = StubEngine::new();
    engine.slow_creation(Duration::from_millis(200));
    let container = Arc::new(SessionContainer::new(engine, SessionKind::Shared));
    let builder = open_in_background(&container, "ctx");
    thread::sleep(Duration::from_millis(50));
    let waiter = open_in_background(&container, "ctx");
    thread::sleep(Duration::from_millis(50));

    // Act
    container.invalidate_all().unwrap();
    let built = builder.join().unwrap().unwrap();
    let waited = waiter.join().unwrap().unwrap();
    let probes = container.engine().probes();
    drop(container);

    // Assert
    assert!(built.is_closed());
    assert!(waited.is_closed());
    assert_eq!(waited.close_reason(), Some(CloseReason::Normal));
    for probe in probes {
        assert_eq!(probe.close_count(), 1);
    }
}
