//! Runtime-platform seam behind the wasmdealer service.
//!
//! The dealer itself never executes wasm. It drives an injected
//! [`PlatformRuntime`] that fronts a runtime shim capable of running a module
//! from its on-disk path. Implementations are registered explicitly at
//! service construction; there is no process-global registry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DealerResult;

/// Lifecycle state of a wasm task process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Unknown,
    Created,
    Running,
    Stopped,
    Paused,
    Pausing,
}

/// Stdio paths handed to the runtime at task creation.
#[derive(Debug, Clone, Default)]
pub struct IoStreams {
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
    pub terminal: bool,
}

/// Everything a runtime needs to create a wasm task.
#[derive(Debug, Clone)]
pub struct CreateOpts {
    /// Absolute path of the wasm module file. The runtime loads the bytes
    /// itself; the control plane never ships them over the wire.
    pub image_path: PathBuf,
    /// Serialized runtime spec.
    pub spec: Vec<u8>,
    pub io: IoStreams,
    pub runtime: String,
    pub runtime_options: Vec<u8>,
    pub task_options: Vec<u8>,
}

/// Result of a task reaching (or being forced into) a terminal state.
#[derive(Debug, Clone, Copy)]
pub struct ExitRecord {
    pub pid: u32,
    pub exit_status: u32,
    pub exited_at: DateTime<Utc>,
}

/// Point-in-time process snapshot, as reported over the Get/List RPCs.
#[derive(Debug, Clone)]
pub struct ProcessState {
    pub id: String,
    pub pid: u32,
    pub status: TaskState,
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
    pub terminal: bool,
    pub exit_status: u32,
    pub exited_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait PlatformTask: Send + Sync {
    fn id(&self) -> &str;

    fn pid(&self) -> u32;

    async fn start(&self) -> DealerResult<()>;

    async fn kill(&self, signal: u32, all: bool) -> DealerResult<()>;

    /// Resolves when the task reaches a terminal state. Long-running; callers
    /// are expected to drive this from a detached context.
    async fn wait(&self) -> DealerResult<ExitRecord>;

    async fn state(&self) -> DealerResult<ProcessState>;

    async fn pause(&self) -> DealerResult<()>;

    async fn resume(&self) -> DealerResult<()>;

    async fn pids(&self) -> DealerResult<Vec<u32>>;

    async fn update(
        &self,
        resources: &[u8],
        annotations: &HashMap<String, String>,
    ) -> DealerResult<()>;
}

#[async_trait]
pub trait PlatformRuntime: Send + Sync {
    async fn create(&self, id: &str, opts: CreateOpts) -> DealerResult<Arc<dyn PlatformTask>>;

    async fn get(&self, id: &str) -> DealerResult<Arc<dyn PlatformTask>>;

    async fn tasks(&self) -> DealerResult<Vec<Arc<dyn PlatformTask>>>;

    /// Removes runtime state for a terminal task and returns its exit record.
    async fn delete(&self, id: &str) -> DealerResult<ExitRecord>;
}
