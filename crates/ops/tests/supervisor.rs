#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use lmesh_component::RuntimeParams;
use lmesh_ops::memory::MemoryEngine;
use lmesh_ops::{ContainerStatus, ReadyOptions, Supervisor};
use tokio_util::sync::CancellationToken;

fn fast() -> ReadyOptions {
    ReadyOptions { poll: Duration::from_millis(10), timeout: Duration::from_millis(300) }
}

fn params() -> RuntimeParams {
    let mut p = RuntimeParams::new("lmesh/pingsource-adapter:v1");
    p.env.push("SCHEDULE=@hourly".into());
    p
}

#[tokio::test]
async fn start_is_idempotent_without_restart() {
    let engine = Arc::new(MemoryEngine::new());
    let sup = Supervisor::new(engine.clone()).with_ready_options(fast());
    let cancel = CancellationToken::new();

    let first = sup.start(&params(), "demo-pingsource", false, &cancel).await.unwrap();
    assert!(first.created);
    assert_eq!(engine.pulls(), vec!["lmesh/pingsource-adapter:v1".to_string()]);

    let second = sup.start(&params(), "demo-pingsource", false, &cancel).await.unwrap();
    assert!(!second.created);
    assert_eq!(second.host_port, first.host_port);
    assert_eq!(engine.creates(), 1);
    assert_eq!(engine.removes(), 0);
}

#[tokio::test]
async fn restart_recreates_exactly_one_container() {
    let engine = Arc::new(MemoryEngine::new());
    let sup = Supervisor::new(engine.clone()).with_ready_options(fast());
    let cancel = CancellationToken::new();

    sup.start(&params(), "demo-pingsource", false, &cancel).await.unwrap();
    let again = sup.start(&params(), "demo-pingsource", true, &cancel).await.unwrap();
    assert!(again.created);
    assert_eq!(engine.creates(), 2);
    assert_eq!(engine.removes(), 1);
    assert_eq!(engine.names(), vec!["demo-pingsource".to_string()]);
    // Only the first creation pulls
    assert_eq!(engine.pulls().len(), 1);
}

#[tokio::test]
async fn exited_containers_are_recreated() {
    let engine = Arc::new(MemoryEngine::new());
    let sup = Supervisor::new(engine.clone()).with_ready_options(fast());
    let cancel = CancellationToken::new();

    sup.start(&params(), "c", false, &cancel).await.unwrap();
    engine.set_status("c", ContainerStatus::Exited);
    let h = sup.start(&params(), "c", false, &cancel).await.unwrap();
    assert!(h.created);
    assert_eq!(engine.creates(), 2);
    assert_eq!(sup.info("c").await.unwrap().status, ContainerStatus::Running);
}

#[tokio::test]
async fn readiness_timeout_fails_and_keeps_container() {
    let engine = Arc::new(MemoryEngine::without_listeners());
    let sup = Supervisor::new(engine.clone()).with_ready_options(fast());
    let err = sup.start(&params(), "slow", false, &CancellationToken::new()).await.unwrap_err();
    assert!(format!("{:#}", err).contains("did not accept connections"), "{:#}", err);
    // Left for a later stop or restart to clean up
    assert_eq!(engine.names(), vec!["slow".to_string()]);
}

#[tokio::test]
async fn cancelled_start_does_not_create() {
    let engine = Arc::new(MemoryEngine::new());
    let sup = Supervisor::new(engine.clone()).with_ready_options(fast());
    let cancel = CancellationToken::new();
    cancel.cancel();
    assert!(sup.start(&params(), "c", false, &cancel).await.is_err());
    assert_eq!(engine.creates(), 0);
}

#[tokio::test]
async fn stop_info_and_logs() {
    let engine = Arc::new(MemoryEngine::new());
    let sup = Supervisor::new(engine.clone()).with_ready_options(fast());
    let h = sup.start(&params(), "c", false, &CancellationToken::new()).await.unwrap();

    let info = sup.info("c").await.unwrap();
    assert_eq!(info.host_port, Some(h.host_port));

    engine.push_log("c", "first");
    engine.push_log("c", "second");
    let mut stream = sup.logs("c", false).await.unwrap();
    let mut lines = Vec::new();
    while let Some(chunk) = stream.rx.recv().await { lines.push(chunk.line); }
    assert_eq!(lines, vec!["first", "second"]);
    stream.cancel.cancel();

    assert!(sup.stop("c").await.unwrap());
    assert!(!sup.stop("c").await.unwrap());
    let info = sup.info("c").await.unwrap();
    assert_eq!(info.status, ContainerStatus::NotFound);
    assert_eq!(info.host_port, None);
    assert!(sup.logs("c", true).await.is_err());
}

#[tokio::test]
async fn one_shot_logs_wait_for_a_slow_reader() {
    let engine = Arc::new(MemoryEngine::new());
    let sup = Supervisor::new(engine.clone()).with_ready_options(fast());
    sup.start(&params(), "chatty", false, &CancellationToken::new()).await.unwrap();
    for i in 0..3000 {
        engine.push_log("chatty", &format!("line {}", i));
    }

    let mut stream = sup.logs("chatty", false).await.unwrap();
    // Let the pump run far ahead of the reader
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut lines = Vec::new();
    while let Some(chunk) = stream.rx.recv().await { lines.push(chunk.line); }
    stream.cancel.cancel();
    assert_eq!(lines.len(), 3000);
    assert_eq!(lines.last().map(String::as_str), Some("line 2999"));
}

#[tokio::test]
async fn never_ready_applies_to_one_name_only() {
    let engine = Arc::new(MemoryEngine::new());
    engine.never_ready("stuck");
    let sup = Supervisor::new(engine.clone()).with_ready_options(fast());
    let cancel = CancellationToken::new();
    assert!(sup.start(&params(), "fine", false, &cancel).await.is_ok());
    assert!(sup.start(&params(), "stuck", false, &cancel).await.is_err());
}
