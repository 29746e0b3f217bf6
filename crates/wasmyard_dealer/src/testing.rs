//! Test utilities for the wasmdealer.
//!
//! NOTE: This module is part of the public API so downstream crates can run
//! an in-process dealer against a fake runtime in their integration tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tonic::transport::Server;

use crate::error::{DealerError, DealerResult};
use crate::local::LocalDealer;
use crate::monitor::NoopMonitor;
use crate::platform::{
    CreateOpts, ExitRecord, PlatformRuntime, PlatformTask, ProcessState, TaskState,
};
use crate::proto::wasmdealer_server::WasmdealerServer;

const SIGKILL: u32 = 9;

/// In-memory wasm runtime driven by the tokio clock.
///
/// Tasks validate that the process argv resolves to a file next to the
/// module image, exit when killed (SIGKILL yields 137, anything else 0), and
/// optionally exit on their own after `auto_exit`. Delivered signals are
/// recorded per task id and survive task deletion.
pub struct FakeRuntime {
    tasks: Mutex<HashMap<String, Arc<FakeTask>>>,
    signal_log: Arc<Mutex<HashMap<String, Vec<u32>>>>,
    next_pid: AtomicU32,
    auto_exit: Option<Duration>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tasks: Mutex::new(HashMap::new()),
            signal_log: Arc::new(Mutex::new(HashMap::new())),
            next_pid: AtomicU32::new(1000),
            auto_exit: None,
        })
    }

    /// Tasks exit with status 0 on their own after `delay` unless killed first.
    pub fn with_auto_exit(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            tasks: Mutex::new(HashMap::new()),
            signal_log: Arc::new(Mutex::new(HashMap::new())),
            next_pid: AtomicU32::new(1000),
            auto_exit: Some(delay),
        })
    }

    /// Signals delivered to the task over its lifetime, oldest first.
    /// Recorded entries survive task deletion.
    pub fn delivered_signals(&self, id: &str) -> Vec<u32> {
        self.signal_log
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// Pid of a live task, if the runtime still knows it.
    pub fn task_pid(&self, id: &str) -> Option<u32> {
        self.tasks.lock().unwrap().get(id).map(|task| task.pid)
    }
}

#[async_trait]
impl PlatformRuntime for FakeRuntime {
    async fn create(&self, id: &str, opts: CreateOpts) -> DealerResult<Arc<dyn PlatformTask>> {
        let mut tasks = self.tasks.lock().unwrap();
        if tasks.contains_key(id) {
            return Err(DealerError::AlreadyExists(format!(
                "task {id} already exists"
            )));
        }

        // Resolve argv[0] the way a shim would: against the directory that
        // holds the module image. A missing executable fails at start, not
        // at create.
        let start_error = argv0_of(&opts.spec).and_then(|argv0| {
            let dir = opts.image_path.parent()?;
            if dir.join(&argv0).exists() {
                None
            } else {
                Some(format!("executable {argv0:?} not found in module mount"))
            }
        });

        let task = Arc::new(FakeTask {
            id: id.to_string(),
            pid: self.next_pid.fetch_add(1, Ordering::Relaxed),
            io: opts.io,
            state: Arc::new(Mutex::new(TaskState::Created)),
            exit: watch::channel(None).0,
            signal_log: Arc::clone(&self.signal_log),
            start_error,
            auto_exit: self.auto_exit,
        });
        tasks.insert(id.to_string(), Arc::clone(&task));
        Ok(task)
    }

    async fn get(&self, id: &str) -> DealerResult<Arc<dyn PlatformTask>> {
        self.tasks
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .map(|t| t as Arc<dyn PlatformTask>)
            .ok_or_else(|| DealerError::NotFound(format!("task {id} not found")))
    }

    async fn tasks(&self) -> DealerResult<Vec<Arc<dyn PlatformTask>>> {
        Ok(self
            .tasks
            .lock()
            .unwrap()
            .values()
            .cloned()
            .map(|t| t as Arc<dyn PlatformTask>)
            .collect())
    }

    async fn delete(&self, id: &str) -> DealerResult<ExitRecord> {
        let task = {
            let tasks = self.tasks.lock().unwrap();
            tasks
                .get(id)
                .cloned()
                .ok_or_else(|| DealerError::NotFound(format!("task {id} not found")))?
        };

        let state = *task.state.lock().unwrap();
        if state == TaskState::Running {
            return Err(DealerError::FailedPrecondition(format!(
                "task {id} is still running"
            )));
        }

        self.tasks.lock().unwrap().remove(id);
        let exit = task.exit.borrow().unwrap_or(ExitRecord {
            pid: task.pid,
            exit_status: 0,
            exited_at: Utc::now(),
        });
        Ok(exit)
    }
}

struct FakeTask {
    id: String,
    pid: u32,
    io: crate::platform::IoStreams,
    state: Arc<Mutex<TaskState>>,
    exit: watch::Sender<Option<ExitRecord>>,
    signal_log: Arc<Mutex<HashMap<String, Vec<u32>>>>,
    start_error: Option<String>,
    auto_exit: Option<Duration>,
}

impl FakeTask {
    fn finish(&self, exit_status: u32) {
        finish_task(&self.state, &self.exit, self.pid, exit_status);
    }
}

fn finish_task(
    state: &Mutex<TaskState>,
    exit: &watch::Sender<Option<ExitRecord>>,
    pid: u32,
    exit_status: u32,
) {
    let mut state = state.lock().unwrap();
    if *state == TaskState::Stopped {
        return;
    }
    *state = TaskState::Stopped;
    let _ = exit.send(Some(ExitRecord {
        pid,
        exit_status,
        exited_at: Utc::now(),
    }));
}

#[async_trait]
impl PlatformTask for FakeTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    async fn start(&self) -> DealerResult<()> {
        if let Some(msg) = &self.start_error {
            self.finish(127);
            return Err(DealerError::Internal(msg.clone()));
        }
        {
            let mut state = self.state.lock().unwrap();
            if *state != TaskState::Created {
                return Err(DealerError::FailedPrecondition(format!(
                    "task {} cannot be started in state {:?}",
                    self.id, *state
                )));
            }
            *state = TaskState::Running;
        }

        if let Some(delay) = self.auto_exit {
            let state = Arc::clone(&self.state);
            let exit = self.exit.clone();
            let pid = self.pid;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                finish_task(&state, &exit, pid, 0);
            });
        }
        Ok(())
    }

    async fn kill(&self, signal: u32, _all: bool) -> DealerResult<()> {
        self.signal_log
            .lock()
            .unwrap()
            .entry(self.id.clone())
            .or_default()
            .push(signal);

        let state = *self.state.lock().unwrap();
        match state {
            TaskState::Running | TaskState::Created | TaskState::Paused => {
                let exit_status = if signal == SIGKILL { 137 } else { 0 };
                self.finish(exit_status);
                Ok(())
            }
            TaskState::Stopped => Err(DealerError::NotFound(format!(
                "process {} already finished",
                self.id
            ))),
            other => Err(DealerError::FailedPrecondition(format!(
                "cannot signal task {} in state {other:?}",
                self.id
            ))),
        }
    }

    async fn wait(&self) -> DealerResult<ExitRecord> {
        let mut rx = self.exit.subscribe();
        loop {
            if let Some(exit) = *rx.borrow() {
                return Ok(exit);
            }
            if rx.changed().await.is_err() {
                return Err(DealerError::Internal(format!(
                    "task {} dropped without exiting",
                    self.id
                )));
            }
        }
    }

    async fn state(&self) -> DealerResult<ProcessState> {
        let state = *self.state.lock().unwrap();
        let exit = *self.exit.borrow();
        Ok(ProcessState {
            id: self.id.clone(),
            pid: self.pid,
            status: state,
            stdin: self.io.stdin.clone(),
            stdout: self.io.stdout.clone(),
            stderr: self.io.stderr.clone(),
            terminal: self.io.terminal,
            exit_status: exit.map(|e| e.exit_status).unwrap_or_default(),
            exited_at: exit.map(|e| e.exited_at),
        })
    }

    async fn pause(&self) -> DealerResult<()> {
        let mut state = self.state.lock().unwrap();
        if *state != TaskState::Running {
            return Err(DealerError::FailedPrecondition(format!(
                "task {} is not running",
                self.id
            )));
        }
        *state = TaskState::Paused;
        Ok(())
    }

    async fn resume(&self) -> DealerResult<()> {
        let mut state = self.state.lock().unwrap();
        if *state != TaskState::Paused {
            return Err(DealerError::FailedPrecondition(format!(
                "task {} is not paused",
                self.id
            )));
        }
        *state = TaskState::Running;
        Ok(())
    }

    async fn pids(&self) -> DealerResult<Vec<u32>> {
        Ok(vec![self.pid])
    }

    async fn update(
        &self,
        _resources: &[u8],
        _annotations: &HashMap<String, String>,
    ) -> DealerResult<()> {
        Ok(())
    }
}

fn argv0_of(spec: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(spec).ok()?;
    value
        .get("process")?
        .get("args")?
        .get(0)?
        .as_str()
        .map(str::to_string)
}

/// Handle for a running in-process dealer server.
pub struct TestDealerHandle {
    addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    join: JoinHandle<Result<(), tonic::transport::Error>>,
}

impl TestDealerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn shutdown(self) -> DealerResult<()> {
        let _ = self.shutdown_tx.send(());
        match self.join.await {
            Ok(result) => result.map_err(DealerError::Transport),
            Err(e) => Err(DealerError::Internal(format!(
                "dealer server task join failed: {e}"
            ))),
        }
    }
}

/// Starts a dealer gRPC server bound to `127.0.0.1:0` over the given runtime.
pub async fn start_test_dealer_server(
    runtime: Arc<dyn PlatformRuntime>,
) -> DealerResult<TestDealerHandle> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| DealerError::Internal(format!("failed to bind test listener: {e}")))?;
    let addr = listener
        .local_addr()
        .map_err(|e| DealerError::Internal(format!("failed to get local_addr: {e}")))?;

    let (shutdown_tx, _shutdown_rx) = broadcast::channel::<()>(16);
    let mut server_shutdown_rx = shutdown_tx.subscribe();

    let service = LocalDealer::new(runtime, Arc::new(NoopMonitor));
    let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);

    let join = tokio::spawn(async move {
        Server::builder()
            .add_service(WasmdealerServer::new(service))
            .serve_with_incoming_shutdown(incoming, async move {
                let _ = server_shutdown_rx.recv().await;
            })
            .await
    });

    Ok(TestDealerHandle {
        addr,
        shutdown_tx,
        join,
    })
}
