//! Wasm instance removal.

use std::time::Duration;

use crate::cri::CriService;
use crate::error::{YardError, YardResult};
use crate::grpc::cri_proto::RemoveContainerResponse;
use crate::store::instance::WasmInstance;
use crate::store::status::InstanceState;
use crate::task::WasmTask;

const REMOVE_RETRY_DELAY: Duration = Duration::from_millis(100);
const REMOVE_RETRY_MAX: usize = 50;

impl CriService {
    pub(crate) async fn remove_wasm_instance(
        &self,
        instance: &WasmInstance,
    ) -> YardResult<RemoveContainerResponse> {
        let id = instance.id().to_string();

        // Forcibly stop running or unknown instances first.
        let state = instance.status.get().state();
        if state == InstanceState::Running || state == InstanceState::Unknown {
            tracing::info!("Forcibly stopping wasm instance {id:?}");
            self.stop_wasm_instance(instance, Duration::ZERO)
                .await
                .map_err(|e| e.context(format!("failed to forcibly stop wasm instance {id:?}")))?;
        }

        // The removing flag bars concurrent start/remove until we are done.
        set_wasm_instance_removing(instance)
            .map_err(|e| e.context(format!("failed to set removing state for {id:?}")))?;

        // Flush any remaining runtime task state.
        match WasmTask::lookup(&self.dealer, &id).await {
            Ok(task) => match task.delete(false).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    return Err(e.context(format!("failed to delete wasm instance {id:?}")));
                }
            },
            Err(e) if e.is_not_found() => {
                tracing::trace!("Remove called for wasm instance {id:?} with no task");
            }
            Err(e) => return Err(e.context(format!("failed to get task for {id:?}"))),
        }

        instance
            .delete_checkpoint()
            .map_err(|e| e.context(format!("failed to delete checkpoint for {id:?}")))?;

        if let Some(io) = &instance.io {
            io.close();
        }

        ensure_remove_all(&instance.metadata.root_dir)
            .await
            .map_err(|e| e.context(format!("failed to remove root dir for {id:?}")))?;
        ensure_remove_all(&instance.metadata.volatile_root_dir)
            .await
            .map_err(|e| e.context(format!("failed to remove volatile root dir for {id:?}")))?;

        self.instance_store.delete(&id);
        self.name_index.release_by_key(&id);

        Ok(RemoveContainerResponse {})
    }
}

/// In removing state the instance can be neither started nor removed again.
fn set_wasm_instance_removing(instance: &WasmInstance) -> YardResult<()> {
    instance.status.update(|mut status| {
        match status.state() {
            InstanceState::Running => {
                return Err(YardError::failed_precondition(
                    "wasm instance is still running, stop it first",
                ));
            }
            InstanceState::Unknown => {
                return Err(YardError::failed_precondition(
                    "wasm instance is in unknown state, stop it first",
                ));
            }
            _ => {}
        }
        if status.starting {
            return Err(YardError::failed_precondition(
                "wasm instance is in starting state, can't be removed",
            ));
        }
        if status.removing {
            return Err(YardError::failed_precondition(
                "wasm instance is already in removing state",
            ));
        }
        status.removing = true;
        Ok(status)
    })
}

/// Directory removal with retry while the kernel still considers the mount
/// busy.
async fn ensure_remove_all(path: &std::path::Path) -> YardResult<()> {
    for attempt in 0.. {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) if e.raw_os_error() == Some(nix::libc::EBUSY) && attempt < REMOVE_RETRY_MAX => {
                tokio::time::sleep(REMOVE_RETRY_DELAY).await;
            }
            Err(e) => {
                return Err(YardError::internal(format!(
                    "failed to remove {}: {e}",
                    path.display()
                )));
            }
        }
    }
    unreachable!()
}
