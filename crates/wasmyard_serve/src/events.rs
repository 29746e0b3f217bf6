//! Exit monitoring for wasm instances.
//!
//! Every started instance gets one watcher blocking on its wait future.
//! When the task exits, the watcher flushes runtime state, checkpoints the
//! status transition, and closes the instance's stop channel. A failed
//! handler pushes the event into a global back-off queue; a background
//! worker retries with exponential delay.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use wasmyard_dealer::DealerClient;

use crate::constants::UNKNOWN_EXIT_CODE;
use crate::error::YardResult;
use crate::store::instance::{InstanceStore, WasmInstance};
use crate::task::{ExitOutcome, WasmTask};

const BACKOFF_TICK: Duration = Duration::from_secs(1);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Internal exit event for a wasm task.
#[derive(Debug, Clone)]
pub struct WasmTaskExit {
    pub wasm_instance_id: String,
    pub id: String,
    pub pid: u32,
    pub exit_status: u32,
    pub exited_at: DateTime<Utc>,
}

pub struct EventMonitor {
    instance_store: Arc<InstanceStore>,
    dealer: DealerClient,
    backoff_tx: mpsc::UnboundedSender<WasmTaskExit>,
}

impl EventMonitor {
    /// Creates the monitor and spawns its back-off worker.
    pub fn start(instance_store: Arc<InstanceStore>, dealer: DealerClient) -> Arc<Self> {
        let (backoff_tx, backoff_rx) = mpsc::unbounded_channel();
        let monitor = Arc::new(Self {
            instance_store: Arc::clone(&instance_store),
            dealer: dealer.clone(),
            backoff_tx,
        });
        tokio::spawn(run_backoff_worker(backoff_rx, instance_store, dealer));
        monitor
    }

    /// Spawns a watcher for one instance.
    ///
    /// With `cancel` set, the watcher stops without generating an event when
    /// the channel fires; the returned receiver closes when the watcher is
    /// done either way. Detached monitors (the start path) pass `None`.
    pub fn start_exit_monitor(
        self: &Arc<Self>,
        id: String,
        pid: u32,
        exit_rx: oneshot::Receiver<ExitOutcome>,
        cancel: Option<watch::Receiver<bool>>,
    ) -> oneshot::Receiver<()> {
        let (done_tx, done_rx) = oneshot::channel();
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = match cancel {
                Some(mut cancel_rx) => {
                    tokio::select! {
                        outcome = exit_rx => Some(outcome),
                        _ = cancel_rx.changed() => None,
                    }
                }
                None => Some(exit_rx.await),
            };

            if let Some(outcome) = outcome {
                let (exit_status, exited_at) = match outcome {
                    Ok(outcome) => {
                        if let Some(err) = outcome.error {
                            tracing::error!("Failed to get task exit status for {id:?}: {err}");
                            (UNKNOWN_EXIT_CODE, Utc::now())
                        } else {
                            (outcome.exit_status, outcome.exited_at)
                        }
                    }
                    Err(_) => (UNKNOWN_EXIT_CODE, Utc::now()),
                };

                let event = WasmTaskExit {
                    wasm_instance_id: id.clone(),
                    id: id.clone(),
                    pid,
                    exit_status,
                    exited_at,
                };
                tracing::debug!("WasmTaskExit event: {event:?}");
                monitor.dispatch_exit(event).await;
            }
            drop(done_tx);
        });
        done_rx
    }

    async fn dispatch_exit(&self, event: WasmTaskExit) {
        match self.instance_store.get(&event.wasm_instance_id) {
            Ok(instance) => {
                if let Err(e) =
                    handle_wasm_instance_exit(&self.dealer, &event, &instance).await
                {
                    tracing::error!("Failed to handle WasmTaskExit event {event:?}: {e}");
                    let _ = self.backoff_tx.send(event);
                }
            }
            // The instance may already be gone; nothing to reconcile.
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                tracing::error!("Failed to get wasm instance {:?}: {e}", event.id);
                let _ = self.backoff_tx.send(event);
            }
        }
    }
}

/// Applies an exit event to the instance: flush runtime state, checkpoint
/// the terminal status, and wake stop waiters.
pub async fn handle_wasm_instance_exit(
    dealer: &DealerClient,
    event: &WasmTaskExit,
    instance: &WasmInstance,
) -> YardResult<()> {
    let task = WasmTask::new(dealer.clone(), event.id.clone(), event.pid);
    match task.delete(true).await {
        Ok(_) => {}
        Err(e) if e.is_not_found() => {
            // Already flushed; move on so the status still gets updated.
        }
        Err(e) => return Err(e.context("failed to flush wasm task state")),
    }

    instance
        .status
        .update_sync(|mut status| {
            if status.finished_at == 0 {
                status.pid = 0;
                status.finished_at = event
                    .exited_at
                    .timestamp_nanos_opt()
                    .unwrap_or_default();
                status.exit_code = event.exit_status as i32;
            }
            // Unknown can only transition to EXITED.
            if status.unknown {
                tracing::debug!(
                    "Wasm instance {:?} transitioned from UNKNOWN to EXITED",
                    instance.id()
                );
                status.unknown = false;
            }
            Ok(status)
        })
        .map_err(|e| e.context("failed to update wasm instance state"))?;

    if let Some(io) = &instance.io {
        io.close();
    }

    instance.stop_ch.stop();
    Ok(())
}

struct BackoffEntry {
    event: WasmTaskExit,
    delay: Duration,
    deadline: tokio::time::Instant,
}

async fn run_backoff_worker(
    mut rx: mpsc::UnboundedReceiver<WasmTaskExit>,
    instance_store: Arc<InstanceStore>,
    dealer: DealerClient,
) {
    let mut pending: HashMap<String, BackoffEntry> = HashMap::new();
    let mut ticker = tokio::time::interval(BACKOFF_TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else {
                    // All senders gone; the monitor is shutting down.
                    return;
                };
                let delay = pending
                    .get(&event.id)
                    .map(|entry| entry.delay)
                    .unwrap_or(INITIAL_BACKOFF);
                pending.insert(event.id.clone(), BackoffEntry {
                    event,
                    delay,
                    deadline: tokio::time::Instant::now() + delay,
                });
            }
            _ = ticker.tick() => {}
        }

        let now = tokio::time::Instant::now();
        let due: Vec<String> = pending
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in due {
            let Some(entry) = pending.remove(&id) else {
                continue;
            };
            let instance = match instance_store.get(&id) {
                Ok(instance) => instance,
                Err(e) if e.is_not_found() => continue,
                Err(e) => {
                    tracing::error!("Back-off retry failed to get instance {id:?}: {e}");
                    requeue(&mut pending, entry);
                    continue;
                }
            };
            if let Err(e) = handle_wasm_instance_exit(&dealer, &entry.event, &instance).await {
                tracing::error!("Back-off retry failed for instance {id:?}: {e}");
                requeue(&mut pending, entry);
            }
        }
    }
}

fn requeue(pending: &mut HashMap<String, BackoffEntry>, entry: BackoffEntry) {
    let delay = std::cmp::min(entry.delay * 2, MAX_BACKOFF);
    pending.insert(
        entry.event.id.clone(),
        BackoffEntry {
            deadline: tokio::time::Instant::now() + delay,
            delay,
            event: entry.event,
        },
    );
}
