//! Client-side handle for a wasm task living in the wasmdealer.

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use wasmyard_dealer::{DealerClient, TaskState, from_timestamp};

use crate::constants::UNKNOWN_EXIT_CODE;
use crate::error::{YardError, YardResult};

const SIGKILL: u32 = 9;

/// Outcome delivered by a task's wait future. `error` is set when the wait
/// itself failed and the exit data is synthesized.
#[derive(Debug, Clone)]
pub struct ExitOutcome {
    pub exit_status: u32,
    pub exited_at: DateTime<Utc>,
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct WasmTask {
    dealer: DealerClient,
    id: String,
    pid: u32,
}

impl WasmTask {
    pub fn new(dealer: DealerClient, id: String, pid: u32) -> Self {
        Self { dealer, id, pid }
    }

    /// Looks the task up in the wasmdealer.
    pub async fn lookup(dealer: &DealerClient, id: &str) -> YardResult<Self> {
        let response = dealer.get(id).await.map_err(YardError::from)?;
        let process = response
            .process
            .ok_or_else(|| YardError::internal(format!("no process reported for task {id:?}")))?;
        Ok(Self {
            dealer: dealer.clone(),
            id: id.to_string(),
            pid: process.pid,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Installs the long-running wait. The returned receiver resolves when
    /// the task exits; a failed wait is reported as a synthetic unknown exit
    /// so monitors always observe a terminal event.
    pub fn wait(&self) -> oneshot::Receiver<ExitOutcome> {
        let (tx, rx) = oneshot::channel();
        let dealer = self.dealer.clone();
        let id = self.id.clone();
        tokio::spawn(async move {
            let outcome = match dealer.wait(&id).await {
                Ok(response) => ExitOutcome {
                    exit_status: response.exit_status,
                    exited_at: response
                        .exited_at
                        .as_ref()
                        .map(from_timestamp)
                        .unwrap_or_else(Utc::now),
                    error: None,
                },
                Err(e) => ExitOutcome {
                    exit_status: UNKNOWN_EXIT_CODE,
                    exited_at: Utc::now(),
                    error: Some(e.to_string()),
                },
            };
            let _ = tx.send(outcome);
        });
        rx
    }

    pub async fn kill(&self, signal: u32, all: bool) -> YardResult<()> {
        self.dealer
            .kill(&self.id, signal, all)
            .await
            .map_err(YardError::from)
    }

    pub async fn state(&self) -> YardResult<TaskState> {
        let response = self.dealer.get(&self.id).await.map_err(YardError::from)?;
        Ok(response
            .process
            .map(|p| p.task_state())
            .unwrap_or(TaskState::Unknown))
    }

    /// Deletes the task and flushes its runtime state, returning the exit
    /// status when one is known.
    ///
    /// With `force_kill` the process is killed first. Deletion requires a
    /// terminal task; a created task with pid 0 is also accepted.
    pub async fn delete(&self, force_kill: bool) -> YardResult<Option<(u32, DateTime<Utc>)>> {
        if force_kill {
            match self.kill(SIGKILL, true).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.context(format!("failed to kill task {:?}", self.id))),
            }
        }

        let state = self.state().await?;
        match state {
            TaskState::Stopped | TaskState::Unknown => {}
            // Created tasks that never got a process can be deleted directly.
            TaskState::Created if self.pid == 0 => {}
            other => {
                return Err(YardError::failed_precondition(format!(
                    "task must be stopped before deletion: {other:?}"
                )));
            }
        }

        let response = self.dealer.delete(&self.id).await.map_err(YardError::from)?;
        let exited_at = response
            .exited_at
            .as_ref()
            .map(from_timestamp)
            .unwrap_or_else(Utc::now);
        Ok(Some((response.exit_status, exited_at)))
    }
}
