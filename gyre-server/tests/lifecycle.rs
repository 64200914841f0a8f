//! Server lifecycle: configuration freeze, startup and shutdown ordering,
//! worker stop semantics, reload and crash recovery

mod common;

use common::*;
use gyre_core::transport::mock::MockTransport;
use gyre_server::prelude::*;
use gyre_server::{ConfigError, WorkerError};
use serde_json::json;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

fn echo(server: &Server) {
    server
        .on(|event: &mut ReceiveEvent, ctx: &mut Context<'_>| {
            ctx.send(event.conn.connection_id, event.data.clone())?;
            Ok(())
        })
        .unwrap();
}

async fn roundtrip(stream: &mut tokio::io::DuplexStream, payload: &[u8]) {
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    tokio::time::timeout(TIMEOUT, stream.read_exact(&mut buf))
        .await
        .expect("no echo")
        .unwrap();
    assert_eq!(buf, payload);
}

/// Configuration and subscriptions are frozen once listen is called
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_configure_after_listen_fails() {
    let transport = MockTransport::new();
    let server = builder(&transport).build().unwrap();
    let (task, _) = start(&server).await;

    assert!(matches!(
        server.configure(&json!({ "worker_num": 8 })),
        Err(ServerError::Config(ConfigError::AlreadyStarted))
    ));
    assert!(matches!(
        server.on(|_: &mut ConnectEvent, _: &mut Context<'_>| Ok(())),
        Err(ServerError::Config(ConfigError::AlreadyStarted))
    ));
    assert!(matches!(
        server.listen().await,
        Err(ServerError::Config(ConfigError::AlreadyStarted))
    ));

    shutdown(&server, task).await;
}

/// Lifecycle events arrive in order: Start first, Shutdown last
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lifecycle_event_order() {
    let transport = MockTransport::new();
    let server = builder(&transport).worker_num(2).build().unwrap();
    let (kinds_tx, mut kinds) = mpsc::unbounded_channel();

    macro_rules! record {
        ($($payload:ty),+) => {
            $(
                let tx = kinds_tx.clone();
                server
                    .on(move |_: &mut $payload, _: &mut Context<'_>| {
                        let _ = tx.send(<$payload as ServerEvent>::KIND);
                        Ok(())
                    })
                    .unwrap();
            )+
        };
    }
    record!(
        StartEvent,
        ManagerStartEvent,
        WorkerStartEvent,
        WorkerExitEvent,
        WorkerStopEvent,
        ManagerStopEvent,
        BeforeShutdownEvent,
        ShutdownEvent
    );
    drop(kinds_tx);

    let (task, _) = start(&server).await;
    shutdown(&server, task).await;

    // every handler has run by the time listen returns
    let mut seen = Vec::new();
    while let Ok(kind) = kinds.try_recv() {
        seen.push(kind);
    }
    let position = |kind| seen.iter().position(|k| *k == kind).unwrap();
    let count = |kind| seen.iter().filter(|k| **k == kind).count();

    assert_eq!(seen.first(), Some(&EventKind::Start));
    assert_eq!(seen.last(), Some(&EventKind::Shutdown));
    assert!(position(EventKind::ManagerStart) < position(EventKind::WorkerStart));
    assert!(position(EventKind::BeforeShutdown) < position(EventKind::WorkerStop));
    assert!(position(EventKind::WorkerStop) < position(EventKind::ManagerStop));
    assert_eq!(count(EventKind::WorkerStart), 2);
    assert_eq!(count(EventKind::WorkerExit), 2);
    assert_eq!(count(EventKind::WorkerStop), 2);
}

/// A failing handler closes its own connection and nothing else
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handler_error_is_isolated() {
    let transport = MockTransport::new();
    let server = builder(&transport).worker_num(1).build().unwrap();
    server
        .on(|event: &mut ReceiveEvent, ctx: &mut Context<'_>| {
            if event.data.starts_with(b"bad") {
                return Err(HandlerError::msg("rejected input"));
            }
            ctx.send(event.conn.connection_id, event.data.clone())?;
            Ok(())
        })
        .unwrap();
    let (closed_tx, mut closed) = mpsc::unbounded_channel();
    server
        .on(move |event: &mut CloseEvent, _: &mut Context<'_>| {
            let _ = closed_tx.send((event.conn.connection_id, event.reason));
            Ok(())
        })
        .unwrap();

    let (task, addrs) = start(&server).await;
    let mut good = transport.connect(addrs[0]).unwrap();
    let mut bad = transport.connect(addrs[0]).unwrap();
    roundtrip(&mut good, b"before").await;

    bad.write_all(b"bad").await.unwrap();
    read_to_close(&mut bad).await;
    let (_, reason) = next(&mut closed).await;
    assert_eq!(reason, CloseReason::HandlerError);

    roundtrip(&mut good, b"after").await;
    shutdown(&server, task).await;
}

/// Connection ids are unique across workers
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connection_ids_are_unique() {
    let transport = MockTransport::new();
    let server = builder(&transport).worker_num(3).build().unwrap();
    let (ids_tx, mut ids) = mpsc::unbounded_channel();
    server
        .on(move |event: &mut ConnectEvent, _: &mut Context<'_>| {
            let _ = ids_tx.send((event.conn.connection_id, event.conn.reactor_id));
            Ok(())
        })
        .unwrap();

    let (task, addrs) = start(&server).await;
    let mut clients = Vec::new();
    for _ in 0..30 {
        clients.push(transport.connect(addrs[0]).unwrap());
    }
    let mut seen = HashSet::new();
    let mut workers = HashSet::new();
    for _ in 0..30 {
        let (id, worker) = next(&mut ids).await;
        assert!(seen.insert(id), "connection id {id} reused");
        workers.insert(worker);
    }
    // round robin spreads the connections over every worker
    assert_eq!(workers.len(), 3);

    drop(clients);
    shutdown(&server, task).await;
}

fn blocking_server(transport: &MockTransport, started: mpsc::UnboundedSender<()>) -> Server {
    let server = builder(transport)
        .worker_num(1)
        .stop_grace(Duration::from_millis(200))
        .build()
        .unwrap();
    server
        .on(move |_: &mut ReceiveEvent, _: &mut Context<'_>| {
            let _ = started.send(());
            std::thread::sleep(Duration::from_millis(1200));
            Ok(())
        })
        .unwrap();
    server
}

/// Stopping with wait lets the in-flight handler finish
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_with_wait_lets_work_finish() {
    let transport = MockTransport::new();
    let (started_tx, mut started) = mpsc::unbounded_channel();
    let server = blocking_server(&transport, started_tx);
    let (task, addrs) = start(&server).await;

    let mut client = transport.connect(addrs[0]).unwrap();
    client.write_all(b"work").await.unwrap();
    next(&mut started).await;

    let began = Instant::now();
    server.handle().stop(None, true).await.unwrap();
    assert!(began.elapsed() >= Duration::from_millis(800));
    task.await.unwrap().unwrap();
}

/// Stopping without wait is bounded by the grace period
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_without_wait_is_bounded() {
    let transport = MockTransport::new();
    let (started_tx, mut started) = mpsc::unbounded_channel();
    let server = blocking_server(&transport, started_tx);
    let (task, addrs) = start(&server).await;

    let mut client = transport.connect(addrs[0]).unwrap();
    client.write_all(b"work").await.unwrap();
    next(&mut started).await;

    let began = Instant::now();
    server.handle().stop(None, false).await.unwrap();
    assert!(began.elapsed() < Duration::from_millis(900));
    task.await.unwrap().unwrap();
}

/// Stopping one worker leaves the rest serving; the policy replaces it
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_single_worker() {
    let transport = MockTransport::new();
    let server = builder(&transport).worker_num(2).build().unwrap();
    let (starts_tx, mut starts) = mpsc::unbounded_channel();
    server
        .on(move |event: &mut WorkerStartEvent, _: &mut Context<'_>| {
            let _ = starts_tx.send(event.worker.worker_id);
            Ok(())
        })
        .unwrap();
    let (stops_tx, mut stops) = mpsc::unbounded_channel();
    server
        .on(move |event: &mut WorkerStopEvent, _: &mut Context<'_>| {
            let _ = stops_tx.send(event.worker.worker_id);
            Ok(())
        })
        .unwrap();

    let (task, _) = start(&server).await;
    next(&mut starts).await;
    next(&mut starts).await;

    let handle = server.handle();
    handle.stop(Some(1), true).await.unwrap();
    assert_eq!(next(&mut stops).await, 1);
    assert_eq!(next(&mut starts).await, 1);

    assert!(matches!(
        handle.stop(Some(42), true).await,
        Err(ServerError::Worker(WorkerError::NotFound(42)))
    ));

    shutdown(&server, task).await;
}

/// A fatal handler error ends the worker; it is reported and replaced
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_crash_is_reported_and_respawned() {
    let transport = MockTransport::new();
    let server = builder(&transport).worker_num(1).build().unwrap();
    server
        .on(|event: &mut ReceiveEvent, ctx: &mut Context<'_>| {
            if event.data.starts_with(b"die") {
                return Err(HandlerError::Fatal("asked to die".into()));
            }
            ctx.send(event.conn.connection_id, event.data.clone())?;
            Ok(())
        })
        .unwrap();
    let (errors_tx, mut errors) = mpsc::unbounded_channel();
    server
        .on(move |event: &mut WorkerErrorEvent, _: &mut Context<'_>| {
            let _ = errors_tx.send((event.worker, event.exit_code));
            Ok(())
        })
        .unwrap();

    let (starts_tx, mut starts) = mpsc::unbounded_channel();
    server
        .on(move |event: &mut WorkerStartEvent, _: &mut Context<'_>| {
            let _ = starts_tx.send(event.worker.worker_id);
            Ok(())
        })
        .unwrap();

    let (task, addrs) = start(&server).await;
    assert_eq!(next(&mut starts).await, 0);
    let mut victim = transport.connect(addrs[0]).unwrap();
    victim.write_all(b"die").await.unwrap();

    let (worker, exit_code) = next(&mut errors).await;
    assert_eq!(worker.worker_id, 0);
    assert!(!worker.task_worker);
    assert_eq!(exit_code, 1);
    read_to_close(&mut victim).await;

    // the replacement keeps the crashed worker's id
    assert_eq!(next(&mut starts).await, 0);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut survivor = transport.connect(addrs[0]).unwrap();
    roundtrip(&mut survivor, b"still here").await;

    shutdown(&server, task).await;
}

/// Reload replaces the workers; raw TCP connections survive the hand-off
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reload_keeps_tcp_connections() {
    let transport = MockTransport::new();
    let server = builder(&transport).worker_num(2).build().unwrap();
    echo(&server);
    let (phases_tx, mut phases) = mpsc::unbounded_channel();
    let before = phases_tx.clone();
    server
        .on(move |_: &mut BeforeReloadEvent, _: &mut Context<'_>| {
            let _ = before.send("before");
            Ok(())
        })
        .unwrap();
    server
        .on(move |_: &mut AfterReloadEvent, _: &mut Context<'_>| {
            let _ = phases_tx.send("after");
            Ok(())
        })
        .unwrap();
    let (closed_tx, mut closed) = mpsc::unbounded_channel();
    server
        .on(move |event: &mut CloseEvent, _: &mut Context<'_>| {
            let _ = closed_tx.send(event.reason);
            Ok(())
        })
        .unwrap();

    let (task, addrs) = start(&server).await;
    let mut client = transport.connect(addrs[0]).unwrap();
    roundtrip(&mut client, b"one").await;

    server.handle().reload().await.unwrap();
    assert_eq!(next(&mut phases).await, "before");
    assert_eq!(next(&mut phases).await, "after");

    roundtrip(&mut client, b"two").await;
    assert!(quiet(&mut closed, Duration::from_millis(50)).await);

    shutdown(&server, task).await;
}

/// Connections over the limit are refused until a slot frees up
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connection_limit() {
    let transport = MockTransport::new();
    let server = builder(&transport).worker_num(1).max_connections(1).build().unwrap();
    echo(&server);
    let (closed_tx, mut closed) = mpsc::unbounded_channel();
    server
        .on(move |event: &mut CloseEvent, _: &mut Context<'_>| {
            let _ = closed_tx.send(event.conn.connection_id);
            Ok(())
        })
        .unwrap();

    let (task, addrs) = start(&server).await;
    let mut first = transport.connect(addrs[0]).unwrap();
    roundtrip(&mut first, b"hi").await;

    let mut refused = transport.connect(addrs[0]).unwrap();
    read_to_close(&mut refused).await;

    drop(first);
    next(&mut closed).await;
    let mut third = transport.connect(addrs[0]).unwrap();
    roundtrip(&mut third, b"welcome").await;

    shutdown(&server, task).await;
}

/// In per-connection mode each connection gets its own worker
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_per_connection_workers() {
    let transport = MockTransport::new();
    let server = builder(&transport).mode(ServerMode::PerConnection).build().unwrap();
    echo(&server);
    let (connects_tx, mut connects) = mpsc::unbounded_channel();
    server
        .on(move |event: &mut ConnectEvent, _: &mut Context<'_>| {
            let _ = connects_tx.send(event.conn.reactor_id);
            Ok(())
        })
        .unwrap();
    let (stops_tx, mut stops) = mpsc::unbounded_channel();
    server
        .on(move |event: &mut WorkerStopEvent, _: &mut Context<'_>| {
            let _ = stops_tx.send(event.worker.worker_id);
            Ok(())
        })
        .unwrap();

    let (task, addrs) = start(&server).await;
    let mut a = transport.connect(addrs[0]).unwrap();
    let mut b = transport.connect(addrs[0]).unwrap();
    roundtrip(&mut a, b"a").await;
    roundtrip(&mut b, b"b").await;
    let first = next(&mut connects).await;
    let second = next(&mut connects).await;
    assert_ne!(first, second);

    drop(a);
    let stopped = next(&mut stops).await;
    assert!(stopped == first || stopped == second);

    shutdown(&server, task).await;
}
