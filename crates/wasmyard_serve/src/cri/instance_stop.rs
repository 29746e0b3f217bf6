//! Wasm instance stop.

use std::str::FromStr as _;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use crate::constants::{FALLBACK_STOP_SIGNAL, UNKNOWN_EXIT_CODE};
use crate::cri::CriService;
use crate::error::{YardError, YardResult};
use crate::events::{WasmTaskExit, handle_wasm_instance_exit};
use crate::store::instance::WasmInstance;
use crate::store::status::InstanceState;
use crate::task::WasmTask;

const SIGKILL: u32 = 9;

impl CriService {
    /// Stops a wasm instance, giving it `timeout` to exit on the resolved
    /// stop signal before SIGKILL. Idempotent for instances that are not
    /// running.
    pub(crate) async fn stop_wasm_instance(
        &self,
        instance: &WasmInstance,
        timeout: Duration,
    ) -> YardResult<()> {
        let id = instance.id().to_string();

        // Stop only takes real action after the instance has started.
        let state = instance.status.get().state();
        if state != InstanceState::Running && state != InstanceState::Unknown {
            tracing::info!(
                "Wasm instance to stop {id:?} must be in running or unknown state, current state {}",
                state.as_str()
            );
            return Ok(());
        }

        let task = match WasmTask::lookup(&self.dealer, &id).await {
            Ok(task) => task,
            Err(e) if e.is_not_found() => {
                // Unknown instances still need their cleanup.
                if state == InstanceState::Unknown {
                    return self.cleanup_unknown_wasm_instance(instance).await;
                }
                return Ok(());
            }
            Err(e) => return Err(e.context(format!("failed to get task for {id:?}"))),
        };

        // For unknown state, install a temporary exit monitor on a
        // cancellable wait so cancelling it cannot synthesize an exit event.
        let mut scoped_monitor = None;
        if state == InstanceState::Unknown {
            let exit_rx = task.wait();
            let (cancel_tx, cancel_rx) = watch::channel(false);
            let done_rx = self.event_monitor.start_exit_monitor(
                id.clone(),
                task.pid(),
                exit_rx,
                Some(cancel_rx),
            );
            scoped_monitor = Some((cancel_tx, done_rx));
        }

        let result = self.kill_and_wait(instance, &task, timeout).await;

        if let Some((cancel_tx, done_rx)) = scoped_monitor {
            // Stop the monitor before the wait future is dropped so the
            // cancellation cannot be mistaken for an exit.
            let _ = cancel_tx.send(true);
            let _ = done_rx.await;
        }

        result
    }

    async fn kill_and_wait(
        &self,
        instance: &WasmInstance,
        task: &WasmTask,
        timeout: Duration,
    ) -> YardResult<()> {
        let id = instance.id();

        // Only kill the task here; the exit monitor deletes it once the
        // Exited event is handled.
        if timeout > Duration::ZERO {
            let stop_signal = self.resolve_stop_signal(instance)?;
            let signal = parse_signal(&stop_signal)?;

            let first = instance
                .stop_signaled
                .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok();
            if first {
                tracing::info!("Stop wasm instance {id:?} with signal {stop_signal}");
                match task.kill(signal, false).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e.context(format!("failed to stop wasm instance {id:?}"))),
                }
            } else {
                tracing::info!(
                    "Skipping signal {stop_signal} for wasm instance {id:?}: a prior stop with \
                     timeout already sent it"
                );
            }

            if tokio::time::timeout(timeout, instance.stopped()).await.is_ok() {
                // Stopped on the first signal, no need for SIGKILL.
                return Ok(());
            }
            tracing::debug!("Stop wasm instance {id:?} with signal {stop_signal} timed out");
        }

        tracing::info!("Kill wasm instance {id:?}");
        match task.kill(SIGKILL, true).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.context(format!("failed to kill wasm instance {id:?}"))),
        }

        // Wait until the stop is observed by the exit monitor; bounded only
        // by the caller's deadline.
        instance.stopped().await;
        Ok(())
    }

    /// Preference order: signal copied onto the instance, then the module
    /// record, then the fallback. The module may have been deleted; older
    /// instances predating the copied signal still resolve through it.
    fn resolve_stop_signal(&self, instance: &WasmInstance) -> YardResult<String> {
        if !instance.metadata.stop_signal.is_empty() {
            return Ok(instance.metadata.stop_signal.clone());
        }

        let module_name = &instance.metadata.wasm_module_name;
        match self.module_store.get(module_name) {
            Ok(module) if !module.spec.stop_signal.is_empty() => Ok(module.spec.stop_signal),
            Ok(_) => Ok(FALLBACK_STOP_SIGNAL.to_string()),
            Err(e) if e.is_not_found() => {
                tracing::warn!(
                    "Wasm module {module_name:?} not found, stopping with {FALLBACK_STOP_SIGNAL}"
                );
                Ok(FALLBACK_STOP_SIGNAL.to_string())
            }
            Err(e) => Err(e.context(format!("failed to get wasm module {module_name:?}"))),
        }
    }

    /// Cleans up a stopped wasm instance in unknown state by synthesizing
    /// its exit event.
    pub(crate) async fn cleanup_unknown_wasm_instance(
        &self,
        instance: &WasmInstance,
    ) -> YardResult<()> {
        let id = instance.id().to_string();
        handle_wasm_instance_exit(
            &self.dealer,
            &WasmTaskExit {
                wasm_instance_id: id.clone(),
                id,
                pid: 0,
                exit_status: UNKNOWN_EXIT_CODE,
                exited_at: Utc::now(),
            },
            instance,
        )
        .await
    }
}

fn parse_signal(name: &str) -> YardResult<u32> {
    let signal = nix::sys::signal::Signal::from_str(name)
        .map_err(|e| YardError::invalid_argument(format!("failed to parse signal {name:?}: {e}")))?;
    Ok(signal as i32 as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_names_parse_to_numbers() {
        assert_eq!(parse_signal("SIGKILL").unwrap(), 9);
        assert_eq!(parse_signal("SIGTERM").unwrap(), 15);
        assert!(parse_signal("SIGBOGUS").is_err());
    }
}
