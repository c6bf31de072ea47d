// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pause, play, and kill against live processes on a worker, including
//! the kill cascade into running children.

mod common;

use common::*;
use provena_engine::controller::Worker;
use provena_engine::process::attrs;
use provena_engine::state::ProcessState;
use provena_store::{EntityStore, LinkType};
use serde_json::json;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pause_and_play_a_waiting_workchain() {
    let ctx = TestContext::new();
    let worker = Worker::spawn(ctx.shared.clone());

    // The scripted scheduler keeps the child job queued forever, so the
    // parent parks in WAITING.
    let pk = ctx
        .runner
        .submit("flow.wait_child", &json!({"text": "hello"}))
        .await
        .unwrap();
    ctx.await_state(pk, ProcessState::Waiting).await;

    assert!(ctx.controller.pause_process(pk, "inspection").await.unwrap());
    // Pausing twice changes nothing.
    assert!(!ctx.controller.pause_process(pk, "again").await.unwrap());

    let node = ctx.store.load_node(pk).await.unwrap();
    assert_eq!(node.attribute(attrs::PAUSED), Some(&json!(true)));
    assert_eq!(
        node.attribute(attrs::PROCESS_STATUS),
        Some(&json!("paused: inspection"))
    );
    // The lifecycle state is untouched by pausing.
    assert_eq!(ctx.controller.status(pk).await.unwrap(), "waiting");

    assert!(ctx.controller.play_process(pk).await.unwrap());
    assert!(!ctx.controller.play_process(pk).await.unwrap());
    let node = ctx.store.load_node(pk).await.unwrap();
    assert_eq!(node.attribute(attrs::PAUSED), Some(&json!(false)));

    // Cleanup: kill the parked tree.
    ctx.controller.kill_process(pk, None).await.unwrap();
    ctx.await_state(pk, ProcessState::Killed).await;
    worker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_kill_cascades_into_running_children() {
    let ctx = TestContext::new();
    let worker = Worker::spawn(ctx.shared.clone());

    let pk = ctx
        .runner
        .submit("flow.wait_child", &json!({"text": "doomed"}))
        .await
        .unwrap();
    ctx.await_state(pk, ProcessState::Waiting).await;

    let calls = ctx.store.outgoing(pk, Some(LinkType::CallCalc)).await.unwrap();
    assert_eq!(calls.len(), 1);
    let child_pk = calls[0].target;

    assert!(ctx
        .controller
        .kill_process(pk, Some("operator request".to_string()))
        .await
        .unwrap());
    ctx.await_state(pk, ProcessState::Killed).await;

    let parent = ctx.store.load_node(pk).await.unwrap();
    assert!(parent.sealed);
    assert_eq!(
        parent.attribute(attrs::PROCESS_STATUS),
        Some(&json!("killed: operator request"))
    );
    assert!(parent.attribute(attrs::CHECKPOINT).is_none());

    // The child went down with the parent.
    let child = ctx.store.load_node(child_pk).await.unwrap();
    assert!(child.sealed);
    assert_eq!(child.attribute(attrs::PROCESS_STATE), Some(&json!("killed")));

    // Verbs stay total on the corpse.
    assert!(!ctx.controller.kill_process(pk, None).await.unwrap());
    assert!(!ctx.controller.pause_process(pk, "late").await.unwrap());
    assert_eq!(ctx.controller.status(pk).await.unwrap(), "killed");

    worker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_kill_overrides_pause() {
    let ctx = TestContext::new();
    let worker = Worker::spawn(ctx.shared.clone());

    let pk = ctx
        .runner
        .submit("flow.wait_child", &json!({"text": "paused"}))
        .await
        .unwrap();
    ctx.await_state(pk, ProcessState::Waiting).await;

    assert!(ctx.controller.pause_process(pk, "hold").await.unwrap());
    // A paused process still honors kill.
    assert!(ctx.controller.kill_process(pk, None).await.unwrap());
    ctx.await_state(pk, ProcessState::Killed).await;

    worker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wait_terminal_observes_a_killed_process() {
    let ctx = TestContext::new();
    let worker = Worker::spawn(ctx.shared.clone());

    let pk = ctx
        .runner
        .submit("flow.wait_child", &json!({"text": "watched"}))
        .await
        .unwrap();
    ctx.await_state(pk, ProcessState::Waiting).await;

    let waiter = ctx.runner.wait_terminal(pk);
    ctx.controller
        .kill_process(pk, Some("cut".to_string()))
        .await
        .unwrap();

    let info = waiter.await.unwrap();
    assert_eq!(info.state, ProcessState::Killed);
    assert_eq!(info.message.as_deref(), Some("killed: cut"));

    worker.shutdown().await;
}
