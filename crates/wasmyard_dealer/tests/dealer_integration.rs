use std::time::Duration;

use wasmyard_dealer::proto::{CreateTaskRequest, TaskStatus, UpdateTaskRequest};
use wasmyard_dealer::testing::{FakeRuntime, start_test_dealer_server};
use wasmyard_dealer::{DealerClient, DealerError};

const SIGKILL: u32 = 9;

fn spec_with_args(args: &[&str]) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "ociVersion": "1.0.2",
        "process": { "args": args, "cwd": "/" },
        "root": { "path": "rootfs" },
    }))
    .unwrap()
}

fn create_request(td: &tempfile::TempDir, wasm_id: &str, args: &[&str]) -> CreateTaskRequest {
    let image_path = td.path().join("app.wasm");
    std::fs::write(&image_path, b"\0asm").unwrap();

    CreateTaskRequest {
        wasm_id: wasm_id.to_string(),
        image_path: image_path.to_string_lossy().into_owned(),
        spec: spec_with_args(args),
        stdin: String::new(),
        stdout: String::new(),
        stderr: String::new(),
        runtime: "io.wasmyard.wasmtime.v1".to_string(),
        runtime_options: vec![],
        task_options: vec![],
    }
}

#[tokio::test]
async fn task_lifecycle_over_grpc() -> anyhow::Result<()> {
    let td = tempfile::tempdir()?;
    let runtime = FakeRuntime::new();
    let server = start_test_dealer_server(runtime).await?;
    let client = DealerClient::connect(server.endpoint()).await?;

    let created = client
        .create(create_request(&td, "task-1", &["app.wasm"]))
        .await?;
    assert_eq!(created.wasm_id, "task-1");
    assert!(created.pid > 0);

    // Duplicate creation is rejected.
    let err = client
        .create(create_request(&td, "task-1", &["app.wasm"]))
        .await
        .unwrap_err();
    assert!(err.is_already_exists(), "unexpected error: {err}");

    client.start("task-1").await?;
    let process = client.get("task-1").await?.process.unwrap();
    assert_eq!(process.status, TaskStatus::Running as i32);

    // Wait resolves once the task is killed.
    let wait_client = client.clone();
    let waiter = tokio::spawn(async move { wait_client.wait("task-1").await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.kill("task-1", SIGKILL, false).await?;

    let exit = waiter.await??;
    assert_eq!(exit.exit_status, 137);
    assert!(exit.exited_at.is_some());

    let deleted = client.delete("task-1").await?;
    assert_eq!(deleted.exit_status, 137);

    let err = client.get("task-1").await.unwrap_err();
    assert!(err.is_not_found(), "unexpected error: {err}");

    server.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn start_fails_when_argv0_missing() -> anyhow::Result<()> {
    let td = tempfile::tempdir()?;
    let runtime = FakeRuntime::new();
    let server = start_test_dealer_server(runtime).await?;
    let client = DealerClient::connect(server.endpoint()).await?;

    client
        .create(create_request(&td, "task-2", &["does-not-exist"]))
        .await?;
    let err = client.start("task-2").await.unwrap_err();
    match err {
        DealerError::Rpc(status) => {
            assert!(status.message().contains("not found in module mount"));
        }
        other => panic!("unexpected error: {other}"),
    }

    server.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn pause_resume_and_pid_listing() -> anyhow::Result<()> {
    let td = tempfile::tempdir()?;
    let runtime = FakeRuntime::new();
    let server = start_test_dealer_server(runtime).await?;
    let client = DealerClient::connect(server.endpoint()).await?;

    let created = client
        .create(create_request(&td, "task-4", &["app.wasm"]))
        .await?;
    client.start("task-4").await?;

    client.pause("task-4").await?;
    let process = client.get("task-4").await?.process.unwrap();
    assert_eq!(process.status, TaskStatus::Paused as i32);

    // A paused task cannot be paused again.
    let err = client.pause("task-4").await.unwrap_err();
    assert!(matches!(err, DealerError::FailedPrecondition(_)));

    client.resume("task-4").await?;
    let pids = client.list_pids("task-4").await?;
    assert_eq!(pids.processes.len(), 1);
    assert_eq!(pids.processes[0].pid, created.pid);

    let tasks = client.list().await?.tasks;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, "task-4");

    client
        .update(UpdateTaskRequest {
            wasm_id: "task-4".to_string(),
            resources: vec![],
            annotations: Default::default(),
        })
        .await?;

    // Exec processes do not exist for wasm tasks.
    let err = client.delete_process("task-4", "exec-1").await.unwrap_err();
    assert!(err.is_not_found(), "unexpected error: {err}");

    server.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn delete_of_running_task_is_rejected() -> anyhow::Result<()> {
    let td = tempfile::tempdir()?;
    let runtime = FakeRuntime::new();
    let server = start_test_dealer_server(runtime).await?;
    let client = DealerClient::connect(server.endpoint()).await?;

    client
        .create(create_request(&td, "task-3", &["app.wasm"]))
        .await?;
    client.start("task-3").await?;

    let err = client.delete("task-3").await.unwrap_err();
    match err {
        DealerError::FailedPrecondition(msg) => assert!(msg.contains("still running")),
        other => panic!("unexpected error: {other}"),
    }

    server.shutdown().await?;
    Ok(())
}
