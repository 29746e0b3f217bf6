//! Wasm instance start.

use chrono::Utc;
use wasmyard_dealer::proto::CreateTaskRequest;

use crate::constants::{ERROR_START_EXIT_CODE, ERROR_START_REASON};
use crate::cri::CriService;
use crate::error::{YardError, YardResult};
use crate::grpc::cri_proto::StartContainerResponse;
use crate::store::instance::WasmInstance;
use crate::store::sandbox::SandboxState;
use crate::store::status::InstanceState;
use crate::task::WasmTask;

impl CriService {
    pub(crate) async fn start_wasm_instance(
        &self,
        instance: &WasmInstance,
    ) -> YardResult<StartContainerResponse> {
        let id = instance.id().to_string();

        // The starting flag bars concurrent start/remove against this
        // instance until we are done.
        set_wasm_instance_starting(instance)
            .map_err(|e| e.context(format!("failed to set starting state for {id:?}")))?;

        let result = self.try_start_wasm_instance(instance).await;

        if let Err(err) = &result {
            // Mark the instance exited so it can still be removed.
            if let Err(e) = instance.status.update_sync(|mut status| {
                status.pid = 0;
                status.finished_at = Utc::now().timestamp_nanos_opt().unwrap_or_default();
                status.exit_code = ERROR_START_EXIT_CODE;
                status.reason = ERROR_START_REASON.to_string();
                status.message = err.to_string();
                Ok(status)
            }) {
                tracing::error!("Failed to set start failure state for {id:?}: {e}");
            }
        }
        if let Err(e) = reset_wasm_instance_starting(instance) {
            tracing::error!("Failed to reset starting state for {id:?}: {e}");
        }

        result
    }

    async fn try_start_wasm_instance(
        &self,
        instance: &WasmInstance,
    ) -> YardResult<StartContainerResponse> {
        let id = instance.id().to_string();
        let meta = &instance.metadata;

        let sandbox = self
            .sandbox_store
            .get(&meta.sandbox_id)
            .map_err(|e| e.context(format!("sandbox {:?} not found", meta.sandbox_id)))?;
        if sandbox.state != SandboxState::Ready {
            return Err(YardError::failed_precondition(format!(
                "sandbox {:?} is not running",
                meta.sandbox_id
            )));
        }

        let io = instance
            .io
            .as_ref()
            .ok_or_else(|| YardError::failed_precondition(format!("no IO for {id:?}")))?;
        if !meta.log_path.is_empty() {
            io.start_log_forwarder(std::path::Path::new(&meta.log_path))
                .map_err(|e| e.context(format!("failed to create wasm instance loggers {id:?}")))?;
        }

        let created = self
            .dealer
            .create(CreateTaskRequest {
                wasm_id: id.clone(),
                image_path: self
                    .module_store
                    .get(&meta.wasm_module_name)
                    .map(|m| m.filepath.to_string_lossy().into_owned())
                    .map_err(|e| e.context("failed to resolve wasm module for task"))?,
                spec: meta.spec.clone(),
                stdin: io.stdin_path(),
                stdout: io.stdout_path(),
                stderr: io.stderr_path(),
                runtime: meta.runtime.name.clone(),
                runtime_options: meta.runtime.options.clone(),
                task_options: vec![],
            })
            .await
            .map_err(|e| {
                YardError::from(e).context(format!("failed to create wasm instance task {id:?}"))
            })?;

        let task = WasmTask::new(self.dealer.clone(), id.clone(), created.pid);

        // Wait is long-running; install it before starting so no exit can be
        // missed.
        let exit_rx = task.wait();

        let start_result = async {
            self.dealer.start(&id).await.map_err(|e| {
                YardError::from(e).context(format!("failed to start wasm instance task {id:?}"))
            })?;

            instance
                .status
                .update(|mut status| {
                    status.pid = task.pid();
                    status.started_at = Utc::now().timestamp_nanos_opt().unwrap_or_default();
                    Ok(status)
                })
                .map_err(|e| e.context(format!("failed to update wasm instance {id:?} state")))?;

            Ok(StartContainerResponse {})
        }
        .await;

        if start_result.is_err() {
            // The task may already have been reaped by the exit monitor.
            if let Err(e) = task.delete(true).await {
                if !e.is_not_found() {
                    tracing::error!("Failed to delete wasm task {id:?}: {e}");
                }
            }
            return start_result;
        }

        self.event_monitor
            .start_exit_monitor(id, task.pid(), exit_rx, None);

        start_result
    }
}

fn set_wasm_instance_starting(instance: &WasmInstance) -> YardResult<()> {
    instance.status.update(|mut status| {
        let state = status.state();
        if state != InstanceState::Created {
            return Err(YardError::failed_precondition(format!(
                "wasm instance is in {} state",
                state.as_str()
            )));
        }
        if status.removing {
            return Err(YardError::failed_precondition(
                "wasm instance is in removing state, can't be started",
            ));
        }
        if status.starting {
            return Err(YardError::failed_precondition(
                "wasm instance is already in starting state",
            ));
        }
        status.starting = true;
        Ok(status)
    })
}

/// Clears the starting flag so a failed instance can still be removed.
fn reset_wasm_instance_starting(instance: &WasmInstance) -> YardResult<()> {
    instance.status.update(|mut status| {
        status.starting = false;
        Ok(status)
    })
}
