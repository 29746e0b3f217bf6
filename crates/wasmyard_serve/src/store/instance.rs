//! Registry of live wasm instances.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, RwLock};

use tokio::sync::watch;

use crate::error::{YardError, YardResult};
use crate::grpc::cri_proto::ContainerConfig;
use crate::io::InstanceIo;
use crate::store::status::StatusStorage;

/// Runtime selection recorded on the instance: handler name plus an opaque
/// options blob forwarded to the wasmdealer.
#[derive(Debug, Clone, Default)]
pub struct RuntimeInfo {
    pub name: String,
    pub options: Vec<u8>,
}

/// Immutable part of a wasm instance, fixed at creation.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    /// Generated unique id.
    pub id: String,
    /// Composite name, unique across the global name index.
    pub name: String,
    /// Parent pod sandbox.
    pub sandbox_id: String,
    /// CRI container config the instance was created from.
    pub config: ContainerConfig,
    /// Back-reference to the module by name.
    pub wasm_module_name: String,
    /// Module id, surfaced as the CRI image ref.
    pub module_ref: String,
    /// Stop signal copied from the module at create time, so stop still
    /// resolves after the module is deleted.
    pub stop_signal: String,
    /// Absolute path of the combined stdout/stderr log; empty disables
    /// logging.
    pub log_path: String,
    pub runtime: RuntimeInfo,
    /// Serialized runtime spec handed to the wasmdealer.
    pub spec: Vec<u8>,
    /// Labels attached to the instance, tagged with the workload kind.
    pub labels: HashMap<String, String>,
    pub root_dir: PathBuf,
    pub volatile_root_dir: PathBuf,
}

/// One-shot broadcast closed when the instance reaches a terminal state.
#[derive(Clone)]
pub struct StopCh {
    tx: Arc<watch::Sender<bool>>,
}

impl StopCh {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Marks the instance stopped, waking all waiters. Idempotent.
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    /// Resolves once the instance has stopped.
    pub async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            // The sender lives inside this StopCh, so changed() only fails
            // if every clone was dropped, and then no stop can arrive.
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for StopCh {
    fn default() -> Self {
        Self::new()
    }
}

/// A live wasm instance. Cheap to clone; status, IO, and the stop channel
/// are shared.
#[derive(Clone)]
pub struct WasmInstance {
    pub metadata: Metadata,
    pub status: Arc<StatusStorage>,
    /// IO is absent only for instances in unknown state.
    pub io: Option<Arc<InstanceIo>>,
    pub stop_ch: StopCh,
    /// Flipped 0 -> 1 by the first timed stop so the signal is delivered at
    /// most once across concurrent stops.
    pub stop_signaled: Arc<AtomicU32>,
}

impl WasmInstance {
    pub fn new(metadata: Metadata, status: StatusStorage, io: Option<InstanceIo>) -> Self {
        Self {
            metadata,
            status: Arc::new(status),
            io: io.map(Arc::new),
            stop_ch: StopCh::new(),
            stop_signaled: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    /// Waits until the instance reaches a terminal state.
    pub async fn stopped(&self) {
        self.stop_ch.stopped().await
    }

    /// Deletes the status checkpoint.
    pub fn delete_checkpoint(&self) -> YardResult<()> {
        self.status.delete()
    }
}

/// Store of all wasm instances, indexed by id.
pub struct InstanceStore {
    instances: RwLock<HashMap<String, WasmInstance>>,
}

impl InstanceStore {
    pub fn new() -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
        }
    }

    pub fn add(&self, instance: WasmInstance) -> YardResult<()> {
        let mut instances = self.instances.write().unwrap();
        if instances.contains_key(instance.id()) {
            return Err(YardError::already_exists(format!(
                "wasm instance {:?}",
                instance.id()
            )));
        }
        instances.insert(instance.id().to_string(), instance);
        Ok(())
    }

    pub fn get(&self, id: &str) -> YardResult<WasmInstance> {
        self.instances
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| YardError::not_found(format!("wasm instance {id:?}")))
    }

    pub fn delete(&self, id: &str) {
        self.instances.write().unwrap().remove(id);
    }

    pub fn list(&self) -> Vec<WasmInstance> {
        self.instances.read().unwrap().values().cloned().collect()
    }
}

impl Default for InstanceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::status::{Status, store_status};

    fn instance(id: &str, root: &std::path::Path) -> WasmInstance {
        let status = store_status(
            root,
            id,
            Status {
                created_at: 1,
                ..Status::default()
            },
        )
        .unwrap();
        WasmInstance::new(
            Metadata {
                id: id.to_string(),
                name: format!("name-{id}"),
                ..Metadata::default()
            },
            status,
            None,
        )
    }

    #[test]
    fn add_get_delete() {
        let td = tempfile::tempdir().unwrap();
        let store = InstanceStore::new();
        store.add(instance("a", td.path())).unwrap();

        assert_eq!(store.get("a").unwrap().id(), "a");
        let err = store.add(instance("a", td.path())).unwrap_err();
        assert!(matches!(err, YardError::AlreadyExists(_)));

        store.delete("a");
        assert!(store.get("a").is_err());
    }

    #[tokio::test]
    async fn stop_ch_wakes_existing_and_late_waiters() {
        let stop_ch = StopCh::new();
        let waiter = {
            let stop_ch = stop_ch.clone();
            tokio::spawn(async move { stop_ch.stopped().await })
        };

        stop_ch.stop();
        waiter.await.unwrap();

        // Waiting after the stop returns immediately.
        stop_ch.stopped().await;
    }
}
