//! Task offloading: dispatch from event workers, Finish delivery, crashes

mod common;

use base64::{engine::general_purpose, Engine as _};
use common::*;
use gyre_core::transport::mock::MockTransport;
use gyre_server::prelude::*;
use serde_json::{json, Value};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

fn task_server(transport: &MockTransport, task_workers: usize) -> Server {
    builder(transport)
        .worker_num(2)
        .task_worker_num(task_workers)
        .build()
        .unwrap()
}

/// Every dispatched task yields exactly one Finish on the dispatching worker
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tasks_pair_with_finish_events() {
    const TASKS: u64 = 40;
    let transport = MockTransport::new();
    let server = task_server(&transport, 3);

    let dispatched: Arc<Mutex<HashMap<TaskId, (u64, usize)>>> = Arc::default();
    let record = Arc::clone(&dispatched);
    server
        .on(move |_: &mut ReceiveEvent, ctx: &mut Context<'_>| {
            let worker_id = ctx.worker_id().unwrap_or_default();
            for n in 0..TASKS {
                let task_id = ctx.task(json!({ "n": n }))?;
                record.lock().unwrap().insert(task_id, (n, worker_id));
            }
            Ok(())
        })
        .unwrap();
    server
        .on(|event: &mut TaskEvent, _: &mut Context<'_>| {
            let n = event.data["n"].as_u64().unwrap_or_default();
            event.finish(json!({ "n": n, "square": n * n }));
            Ok(())
        })
        .unwrap();
    let (finished_tx, mut finished) = mpsc::unbounded_channel();
    server
        .on(move |event: &mut FinishEvent, _: &mut Context<'_>| {
            let _ = finished_tx.send((event.task_id, event.worker.worker_id, event.data.clone()));
            Ok(())
        })
        .unwrap();

    let (task, addrs) = start(&server).await;
    let mut client = transport.connect(addrs[0]).unwrap();
    client.write_all(b"go").await.unwrap();

    let mut seen = HashMap::new();
    for _ in 0..TASKS {
        let (task_id, worker_id, data) = next(&mut finished).await;
        assert!(seen.insert(task_id, data.clone()).is_none(), "task {task_id} finished twice");
        let (n, origin) = dispatched.lock().unwrap()[&task_id];
        assert_eq!(worker_id, origin);
        assert_eq!(data, json!({ "n": n, "square": n * n }));
    }
    assert!(quiet(&mut finished, Duration::from_millis(100)).await);
    assert_eq!(seen.len() as u64, TASKS);

    shutdown(&server, task).await;
}

/// A hashing task computes the digest off the event worker
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hash_task_finishes_once() {
    let transport = MockTransport::new();
    let server = task_server(&transport, 1);
    server
        .on(|event: &mut ReceiveEvent, ctx: &mut Context<'_>| {
            let text = String::from_utf8_lossy(&event.data).into_owned();
            ctx.task(Value::String(text))?;
            Ok(())
        })
        .unwrap();
    server
        .on(|event: &mut TaskEvent, _: &mut Context<'_>| {
            let input = event.data.as_str().unwrap_or_default().to_string();
            let digest = general_purpose::STANDARD.encode(Sha1::digest(input.as_bytes()));
            event.finish(digest);
            Ok(())
        })
        .unwrap();
    let (finished_tx, mut finished) = mpsc::unbounded_channel();
    server
        .on(move |event: &mut FinishEvent, _: &mut Context<'_>| {
            let _ = finished_tx.send(event.data.clone());
            Ok(())
        })
        .unwrap();

    let (task, addrs) = start(&server).await;
    let mut client = transport.connect(addrs[0]).unwrap();
    client.write_all(b"hash me").await.unwrap();

    let expected = general_purpose::STANDARD.encode(Sha1::digest(b"hash me"));
    assert_eq!(next(&mut finished).await, Value::String(expected));
    assert!(quiet(&mut finished, Duration::from_millis(150)).await);

    shutdown(&server, task).await;
}

/// A task whose handler sets no result raises no Finish
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_task_without_result_has_no_finish() {
    let transport = MockTransport::new();
    let server = task_server(&transport, 1);
    server
        .on(|_: &mut ReceiveEvent, ctx: &mut Context<'_>| {
            ctx.task(json!("fire and forget"))?;
            Ok(())
        })
        .unwrap();
    let (ran_tx, mut ran) = mpsc::unbounded_channel();
    server
        .on(move |event: &mut TaskEvent, _: &mut Context<'_>| {
            let _ = ran_tx.send(event.task_id);
            Ok(())
        })
        .unwrap();
    let (finished_tx, mut finished) = mpsc::unbounded_channel::<TaskId>();
    server
        .on(move |event: &mut FinishEvent, _: &mut Context<'_>| {
            let _ = finished_tx.send(event.task_id);
            Ok(())
        })
        .unwrap();

    let (task, addrs) = start(&server).await;
    let mut client = transport.connect(addrs[0]).unwrap();
    client.write_all(b"x").await.unwrap();

    next(&mut ran).await;
    assert!(quiet(&mut finished, Duration::from_millis(150)).await);
    shutdown(&server, task).await;
}

/// A panicking task worker is reported and replaced
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_task_worker_crash_is_reported_and_respawned() {
    let transport = MockTransport::new();
    let server = task_server(&transport, 1);
    server
        .on(|event: &mut ReceiveEvent, ctx: &mut Context<'_>| {
            ctx.task(json!(String::from_utf8_lossy(&event.data)))?;
            Ok(())
        })
        .unwrap();
    server
        .on(|event: &mut TaskEvent, _: &mut Context<'_>| {
            if event.data == json!("crash") {
                panic!("task blew up");
            }
            event.finish(json!("done"));
            Ok(())
        })
        .unwrap();
    let (errors_tx, mut errors) = mpsc::unbounded_channel();
    server
        .on(move |event: &mut WorkerErrorEvent, _: &mut Context<'_>| {
            let _ = errors_tx.send((event.worker, event.exit_code, event.signal));
            Ok(())
        })
        .unwrap();
    let (finished_tx, mut finished) = mpsc::unbounded_channel();
    server
        .on(move |event: &mut FinishEvent, _: &mut Context<'_>| {
            let _ = finished_tx.send(event.data.clone());
            Ok(())
        })
        .unwrap();

    let (task, addrs) = start(&server).await;
    let mut client = transport.connect(addrs[0]).unwrap();
    client.write_all(b"crash").await.unwrap();

    let (worker, exit_code, signal) = next(&mut errors).await;
    assert!(worker.task_worker);
    assert_eq!(worker.worker_id, 2);
    assert_ne!((exit_code, signal), (0, 0));

    // the replacement picks up new work
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.write_all(b"again").await.unwrap();
    assert_eq!(next(&mut finished).await, json!("done"));

    shutdown(&server, task).await;
}

/// Dispatch fails cleanly when no task workers are configured
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_task_without_pool_is_an_error() {
    let transport = MockTransport::new();
    let server = task_server(&transport, 0);
    let (results_tx, mut results) = mpsc::unbounded_channel();
    server
        .on(move |_: &mut ReceiveEvent, ctx: &mut Context<'_>| {
            let outcome = ctx.task(json!(1));
            let _ = results_tx.send(matches!(
                outcome,
                Err(ServerError::Task(gyre_server::TaskError::NoTaskWorkers))
            ));
            Ok(())
        })
        .unwrap();

    let (task, addrs) = start(&server).await;
    let mut client = transport.connect(addrs[0]).unwrap();
    client.write_all(b"x").await.unwrap();
    assert!(next(&mut results).await);

    shutdown(&server, task).await;
}

/// Event workers can message each other
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pipe_message_between_workers() {
    let transport = MockTransport::new();
    let server = task_server(&transport, 0);
    server
        .on(|_: &mut ReceiveEvent, ctx: &mut Context<'_>| {
            let me = ctx.worker_id().unwrap_or_default();
            ctx.send_message(1 - me, json!({ "from": me }))?;
            Ok(())
        })
        .unwrap();
    let (pipes_tx, mut pipes) = mpsc::unbounded_channel();
    server
        .on(move |event: &mut PipeMessageEvent, _: &mut Context<'_>| {
            let _ = pipes_tx.send((event.worker.worker_id, event.src_worker_id, event.message.clone()));
            Ok(())
        })
        .unwrap();

    let (task, addrs) = start(&server).await;
    let mut client = transport.connect(addrs[0]).unwrap();
    client.write_all(b"x").await.unwrap();

    let (dst, src, message) = next(&mut pipes).await;
    assert_ne!(dst, src);
    assert_eq!(message, json!({ "from": src }));

    shutdown(&server, task).await;
}
