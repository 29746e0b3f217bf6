//! End-to-end scenarios against the in-process CRI server backed by the
//! fake wasm runtime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tonic::transport::Channel;
use wasmyard_config::YardConfig;
use wasmyard_dealer::testing::FakeRuntime;
use wasmyard_serve::cri_proto::image_service_client::ImageServiceClient;
use wasmyard_serve::cri_proto::runtime_service_client::RuntimeServiceClient;
use wasmyard_serve::cri_proto::{
    ContainerConfig, ContainerMetadata, ContainerState, ContainerStatusRequest,
    CreateContainerRequest, ImageSpec, ImageStatusRequest, ListContainersRequest,
    ListImagesRequest, PodSandboxConfig, PodSandboxMetadata, PullImageRequest,
    RemoveContainerRequest, RunPodSandboxRequest, StartContainerRequest, StopContainerRequest,
};
use wasmyard_serve::testing::{TestServerHandle, health_check, start_test_cri_server};

const SIGTERM: u32 = 15;

const MODULE_NAME: &str = "wasi_example_main";
const MODULE_FILENAME: &str = "wasi_example_main.wasm";
const MODULE_BYTES: &[u8] = b"\0asm\x01\0\0\0fake-wasi-example-main";

struct TestEnv {
    server: TestServerHandle,
    runtime_client: RuntimeServiceClient<Channel>,
    image_client: ImageServiceClient<Channel>,
    module_url: String,
    _module_server: tokio::task::JoinHandle<()>,
    base_dir: tempfile::TempDir,
}

/// Serves the module bytes over plain HTTP for the pull pipeline.
async fn start_module_http_server() -> anyhow::Result<(String, tokio::task::JoinHandle<()>)> {
    let app = axum::Router::new().route(
        "/wasi_example_main.wasm",
        axum::routing::get(|| async { MODULE_BYTES.to_vec() }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let join = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}/wasi_example_main.wasm"), join))
}

async fn wait_until_serving(endpoint: &str) -> anyhow::Result<()> {
    const TOTAL: Duration = Duration::from_secs(2);
    const STEP: Duration = Duration::from_millis(25);

    let start = tokio::time::Instant::now();
    loop {
        if matches!(
            health_check(endpoint).await,
            Ok(tonic_health::ServingStatus::Serving)
        ) {
            return Ok(());
        }
        if start.elapsed() >= TOTAL {
            anyhow::bail!("server did not become SERVING within {TOTAL:?}");
        }
        tokio::time::sleep(STEP).await;
    }
}

async fn setup(runtime: Arc<FakeRuntime>) -> anyhow::Result<TestEnv> {
    let base_dir = tempfile::tempdir()?;
    let config = Arc::new(YardConfig::with_base_dir(
        "test-yard",
        "io.wasmyard.wasmtime.v1",
        base_dir.path(),
    ));
    let server = start_test_cri_server(config, runtime)
        .await
        .map_err(|e| anyhow::anyhow!("failed to start test server: {e}"))?;
    wait_until_serving(&server.endpoint()).await?;

    let channel = tonic::transport::Endpoint::from_shared(server.endpoint())?
        .connect_timeout(Duration::from_secs(2))
        .connect()
        .await?;
    let runtime_client = RuntimeServiceClient::new(channel.clone());
    let image_client = ImageServiceClient::new(channel);

    let (module_url, module_server) = start_module_http_server().await?;

    Ok(TestEnv {
        server,
        runtime_client,
        image_client,
        module_url,
        _module_server: module_server,
        base_dir,
    })
}

fn wasm_image_spec(env: &TestEnv, stop_signal: Option<&str>) -> ImageSpec {
    let mut annotations = HashMap::from([
        ("wasm.module.url".to_string(), env.module_url.clone()),
        (
            "wasm.module.filename".to_string(),
            MODULE_FILENAME.to_string(),
        ),
    ]);
    if let Some(signal) = stop_signal {
        annotations.insert("wasm.module.stopSignal".to_string(), signal.to_string());
    }
    ImageSpec {
        image: MODULE_NAME.to_string(),
        annotations,
    }
}

async fn pull_module(env: &mut TestEnv, stop_signal: Option<&str>) -> anyhow::Result<String> {
    let image = wasm_image_spec(env, stop_signal);
    let response = env
        .image_client
        .pull_image(PullImageRequest { image: Some(image) })
        .await?
        .into_inner();
    Ok(response.image_ref)
}

fn sandbox_config(name: &str) -> PodSandboxConfig {
    PodSandboxConfig {
        metadata: Some(PodSandboxMetadata {
            name: name.to_string(),
            uid: format!("uid-{name}"),
            namespace: "default".to_string(),
            attempt: 0,
        }),
        hostname: String::new(),
        log_directory: String::new(),
        labels: HashMap::new(),
        annotations: HashMap::new(),
    }
}

async fn run_sandbox(env: &mut TestEnv, name: &str) -> anyhow::Result<String> {
    let response = env
        .runtime_client
        .run_pod_sandbox(RunPodSandboxRequest {
            config: Some(sandbox_config(name)),
            runtime_handler: String::new(),
        })
        .await?
        .into_inner();
    Ok(response.pod_sandbox_id)
}

async fn create_instance(
    env: &mut TestEnv,
    sandbox_id: &str,
    sandbox_name: &str,
    command: Vec<String>,
    attempt: u32,
) -> anyhow::Result<String> {
    // The kubelet forwards the same wasm annotations it pulled with, so the
    // dispatcher can route even before the module store has an entry.
    let config = ContainerConfig {
        metadata: Some(ContainerMetadata {
            name: "app".to_string(),
            attempt,
        }),
        image: Some(ImageSpec {
            image: MODULE_NAME.to_string(),
            annotations: HashMap::from([(
                "wasm.module.url".to_string(),
                env.module_url.clone(),
            )]),
        }),
        command,
        ..ContainerConfig::default()
    };
    let response = env
        .runtime_client
        .create_container(CreateContainerRequest {
            pod_sandbox_id: sandbox_id.to_string(),
            config: Some(config),
            sandbox_config: Some(sandbox_config(sandbox_name)),
        })
        .await?
        .into_inner();
    Ok(response.container_id)
}

async fn instance_state(env: &mut TestEnv, id: &str) -> anyhow::Result<ContainerState> {
    let response = env
        .runtime_client
        .container_status(ContainerStatusRequest {
            container_id: id.to_string(),
            verbose: false,
        })
        .await?
        .into_inner();
    let status = response
        .status
        .ok_or_else(|| anyhow::anyhow!("no status for {id}"))?;
    Ok(ContainerState::try_from(status.state).unwrap_or(ContainerState::ContainerUnknown))
}

async fn wait_for_state(
    env: &mut TestEnv,
    id: &str,
    wanted: ContainerState,
) -> anyhow::Result<()> {
    const TOTAL: Duration = Duration::from_secs(2);
    const STEP: Duration = Duration::from_millis(25);

    let start = tokio::time::Instant::now();
    loop {
        let state = instance_state(env, id).await?;
        if state == wanted {
            return Ok(());
        }
        if start.elapsed() >= TOTAL {
            anyhow::bail!("instance {id} did not reach {wanted:?} (still {state:?})");
        }
        tokio::time::sleep(STEP).await;
    }
}

#[tokio::test]
async fn happy_path_pull_create_start_stop_remove() -> anyhow::Result<()> {
    let mut env = setup(FakeRuntime::new()).await?;

    // Pull: the image ref is the 44-char base64url sha256 of the module.
    let image_ref = pull_module(&mut env, None).await?;
    assert_eq!(image_ref.len(), 44);
    {
        use base64::Engine as _;
        use sha2::Digest as _;
        let expected =
            base64::engine::general_purpose::URL_SAFE.encode(sha2::Sha256::digest(MODULE_BYTES));
        assert_eq!(image_ref, expected);
    }

    let status = env
        .image_client
        .image_status(ImageStatusRequest {
            image: Some(ImageSpec {
                image: image_ref.clone(),
                annotations: HashMap::new(),
            }),
            verbose: false,
        })
        .await?
        .into_inner();
    let image = status.image.expect("module should be resolvable by id");
    assert_eq!(image.id, image_ref);
    assert_eq!(image.repo_tags, vec![MODULE_NAME.to_string()]);
    assert_eq!(image.size, MODULE_BYTES.len() as u64);

    let sandbox_id = run_sandbox(&mut env, "sandbox1").await?;
    let id = create_instance(
        &mut env,
        &sandbox_id,
        "sandbox1",
        vec![MODULE_FILENAME.to_string(), "test".to_string()],
        0,
    )
    .await?;
    assert!(!id.is_empty());
    assert_eq!(instance_state(&mut env, &id).await?, ContainerState::ContainerCreated);

    env.runtime_client
        .start_container(StartContainerRequest {
            container_id: id.clone(),
        })
        .await?;
    wait_for_state(&mut env, &id, ContainerState::ContainerRunning).await?;
    let pid = env.server.runtime().task_pid(&id);
    assert!(pid.is_some_and(|pid| pid > 0), "expected a live pid, got {pid:?}");

    tokio::time::sleep(Duration::from_millis(100)).await;
    env.runtime_client
        .stop_container(StopContainerRequest {
            container_id: id.clone(),
            timeout: 1,
        })
        .await?;
    wait_for_state(&mut env, &id, ContainerState::ContainerExited).await?;

    let status = env
        .runtime_client
        .container_status(ContainerStatusRequest {
            container_id: id.clone(),
            verbose: false,
        })
        .await?
        .into_inner()
        .status
        .unwrap();
    // The unannotated module stops with SIGKILL.
    assert_eq!(status.exit_code, 137);
    assert!(status.finished_at > 0);

    env.runtime_client
        .remove_container(RemoveContainerRequest {
            container_id: id.clone(),
        })
        .await?;
    let listed = env
        .runtime_client
        .list_containers(ListContainersRequest { filter: None })
        .await?
        .into_inner();
    assert!(listed.containers.iter().all(|c| c.id != id));

    env.server.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn restart_same_config_reaches_running_twice() -> anyhow::Result<()> {
    let mut env = setup(FakeRuntime::new()).await?;
    pull_module(&mut env, None).await?;
    let sandbox_id = run_sandbox(&mut env, "sandbox1").await?;

    for _run in 0..2 {
        let id = create_instance(
            &mut env,
            &sandbox_id,
            "sandbox1",
            vec![MODULE_FILENAME.to_string()],
            0,
        )
        .await?;
        env.runtime_client
            .start_container(StartContainerRequest {
                container_id: id.clone(),
            })
            .await?;
        wait_for_state(&mut env, &id, ContainerState::ContainerRunning).await?;

        env.runtime_client
            .stop_container(StopContainerRequest {
                container_id: id.clone(),
                timeout: 1,
            })
            .await?;
        wait_for_state(&mut env, &id, ContainerState::ContainerExited).await?;

        env.runtime_client
            .remove_container(RemoveContainerRequest {
                container_id: id.clone(),
            })
            .await?;
    }

    env.server.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn natural_exit_is_reconciled_by_the_monitor() -> anyhow::Result<()> {
    let mut env = setup(FakeRuntime::with_auto_exit(Duration::from_millis(50))).await?;
    pull_module(&mut env, None).await?;
    let sandbox_id = run_sandbox(&mut env, "sandbox1").await?;

    let id = create_instance(
        &mut env,
        &sandbox_id,
        "sandbox1",
        vec![MODULE_FILENAME.to_string()],
        0,
    )
    .await?;
    env.runtime_client
        .start_container(StartContainerRequest {
            container_id: id.clone(),
        })
        .await?;

    // Nobody calls stop; the exit monitor alone must observe the exit.
    wait_for_state(&mut env, &id, ContainerState::ContainerExited).await?;

    let status = env
        .runtime_client
        .container_status(ContainerStatusRequest {
            container_id: id.clone(),
            verbose: false,
        })
        .await?
        .into_inner()
        .status
        .unwrap();
    assert_eq!(status.exit_code, 0);
    assert_eq!(status.reason, "Completed");

    // The terminal transition was checkpointed before it became visible.
    let instance_root = env
        .base_dir
        .path()
        .join("root")
        .join("wasminstances")
        .join(&id);
    let on_disk = wasmyard_serve::load_status(&instance_root, &id)
        .map_err(|e| anyhow::anyhow!("failed to load checkpoint: {e}"))?;
    assert!(on_disk.finished_at > 0);
    assert_eq!(on_disk.exit_code, 0);

    // Stopping an already-exited instance is a no-op and signals nothing.
    env.runtime_client
        .stop_container(StopContainerRequest {
            container_id: id.clone(),
            timeout: 1,
        })
        .await?;
    assert!(env.server.runtime().delivered_signals(&id).is_empty());

    env.server.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn failed_start_marks_instance_exited_and_removable() -> anyhow::Result<()> {
    let mut env = setup(FakeRuntime::new()).await?;
    pull_module(&mut env, None).await?;
    let sandbox_id = run_sandbox(&mut env, "sandbox1").await?;

    let id = create_instance(
        &mut env,
        &sandbox_id,
        "sandbox1",
        vec!["something-that-doesnt-exist".to_string()],
        0,
    )
    .await?;

    let err = env
        .runtime_client
        .start_container(StartContainerRequest {
            container_id: id.clone(),
        })
        .await
        .unwrap_err();
    assert!(
        err.message().contains("failed to start"),
        "unexpected error: {err}"
    );

    let status = env
        .runtime_client
        .container_status(ContainerStatusRequest {
            container_id: id.clone(),
            verbose: false,
        })
        .await?
        .into_inner()
        .status
        .unwrap();
    assert_eq!(status.state, ContainerState::ContainerExited as i32);
    assert_ne!(status.exit_code, 0);
    assert_eq!(status.reason, "StartError");

    env.runtime_client
        .remove_container(RemoveContainerRequest {
            container_id: id.clone(),
        })
        .await?;

    env.server.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn pulling_twice_deduplicates_the_module() -> anyhow::Result<()> {
    let mut env = setup(FakeRuntime::new()).await?;

    let first = pull_module(&mut env, None).await?;
    let second = pull_module(&mut env, None).await?;
    assert_eq!(first, second);

    let images = env
        .image_client
        .list_images(ListImagesRequest { filter: None })
        .await?
        .into_inner()
        .images;
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].id, first);

    env.server.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn concurrent_stops_deliver_the_timed_signal_once() -> anyhow::Result<()> {
    let mut env = setup(FakeRuntime::new()).await?;
    pull_module(&mut env, Some("SIGTERM")).await?;
    let sandbox_id = run_sandbox(&mut env, "sandbox1").await?;

    let id = create_instance(
        &mut env,
        &sandbox_id,
        "sandbox1",
        vec![MODULE_FILENAME.to_string()],
        0,
    )
    .await?;
    env.runtime_client
        .start_container(StartContainerRequest {
            container_id: id.clone(),
        })
        .await?;
    wait_for_state(&mut env, &id, ContainerState::ContainerRunning).await?;

    let mut stop_a = env.runtime_client.clone();
    let mut stop_b = env.runtime_client.clone();
    let request = StopContainerRequest {
        container_id: id.clone(),
        timeout: 10,
    };
    let (res_a, res_b) = tokio::join!(
        stop_a.stop_container(request.clone()),
        stop_b.stop_container(request),
    );
    res_a?;
    res_b?;

    wait_for_state(&mut env, &id, ContainerState::ContainerExited).await?;

    let sigterms = env
        .server
        .runtime()
        .delivered_signals(&id)
        .into_iter()
        .filter(|signal| *signal == SIGTERM)
        .count();
    assert_eq!(sigterms, 1, "timed stop signal must be delivered exactly once");

    env.server.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn failed_create_releases_the_name_reservation() -> anyhow::Result<()> {
    let mut env = setup(FakeRuntime::new()).await?;
    let sandbox_id = run_sandbox(&mut env, "sandbox1").await?;

    // The module was never pulled, so creation fails after the name was
    // reserved.
    let err = create_instance(
        &mut env,
        &sandbox_id,
        "sandbox1",
        vec![MODULE_FILENAME.to_string()],
        0,
    )
    .await
    .unwrap_err();
    assert!(
        err.to_string().contains("failed to find wasm module"),
        "unexpected error: {err}"
    );

    // The same composite name is free again once the module exists.
    pull_module(&mut env, None).await?;
    let id = create_instance(
        &mut env,
        &sandbox_id,
        "sandbox1",
        vec![MODULE_FILENAME.to_string()],
        0,
    )
    .await?;
    assert!(!id.is_empty());

    env.server.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn failed_disk_write_rolls_back_the_store_insert() -> anyhow::Result<()> {
    let mut env = setup(FakeRuntime::new()).await?;

    // Replace the module directory with a regular file so the payload write
    // fails after the store insert.
    let module_dir = env.base_dir.path().join("root").join("wasmmodules");
    std::fs::remove_dir_all(&module_dir)?;
    std::fs::write(&module_dir, b"not a directory")?;

    let err = pull_module(&mut env, None).await.unwrap_err();
    assert!(
        err.to_string().contains("failed to save wasm module"),
        "unexpected error: {err}"
    );

    // Nothing persisted: the store entry was rolled back.
    let images = env
        .image_client
        .list_images(ListImagesRequest { filter: None })
        .await?
        .into_inner()
        .images;
    assert!(images.is_empty());

    // With the directory restored, the same pull inserts cleanly.
    std::fs::remove_file(&module_dir)?;
    std::fs::create_dir_all(&module_dir)?;
    let image_ref = pull_module(&mut env, None).await?;
    assert_eq!(image_ref.len(), 44);

    env.server.shutdown().await?;
    Ok(())
}
