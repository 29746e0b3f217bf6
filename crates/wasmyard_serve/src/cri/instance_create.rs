//! Wasm instance creation.

use chrono::Utc;

use crate::cri::CriService;
use crate::cri::helpers::{build_labels, make_instance_name};
use crate::error::{YardError, YardResult};
use crate::grpc::cri_proto::{CreateContainerRequest, CreateContainerResponse};
use crate::io::InstanceIo;
use crate::oci::{build_wasm_spec, resources_from_config};
use crate::store::instance::{Metadata, RuntimeInfo, WasmInstance};
use crate::store::name_index::WorkloadKind;
use crate::store::status::{Status, store_status};

impl CriService {
    /// Creates a wasm instance in the parent sandbox.
    ///
    /// Side effects are rolled back in reverse order when any step fails:
    /// checkpoint, IO, volatile directory, root directory, name reservation.
    pub(crate) async fn create_wasm_instance(
        &self,
        r: CreateContainerRequest,
    ) -> YardResult<CreateContainerResponse> {
        let config = r
            .config
            .ok_or_else(|| YardError::invalid_argument("container config is required"))?;
        let sandbox_config = r
            .sandbox_config
            .ok_or_else(|| YardError::invalid_argument("sandbox config is required"))?;
        let sandbox = self
            .sandbox_store
            .get(&r.pod_sandbox_id)
            .map_err(|e| e.context(format!("failed to find sandbox {:?}", r.pod_sandbox_id)))?;

        // Generate a unique id and reserve the composite name so concurrent
        // CreateContainer requests cannot race on the same workload.
        let id = uuid::Uuid::new_v4().simple().to_string();
        let metadata = config
            .metadata
            .clone()
            .ok_or_else(|| YardError::invalid_argument("container config must include metadata"))?;
        let sandbox_metadata = sandbox_config.metadata.clone().unwrap_or_default();
        let name = make_instance_name(&metadata, &sandbox_metadata);
        tracing::debug!("Generated id {id:?} for wasm instance {name:?}");
        self.name_index
            .reserve(&name, &id, WorkloadKind::WasmInstance)
            .map_err(|e| e.context(format!("failed to reserve wasm instance name {name:?}")))?;

        let mut created_root = false;
        let mut created_volatile = false;
        let mut instance_out: Option<WasmInstance> = None;

        let root_dir = self.config.instance_root_dir(&id);
        let volatile_root_dir = self.config.volatile_instance_root_dir(&id);

        let result: YardResult<CreateContainerResponse> = async {
            let module = self
                .module_store
                .get(&config.image.as_ref().map(|i| i.image.clone()).unwrap_or_default())
                .map_err(|e| e.context("failed to find wasm module"))?;

            std::fs::create_dir_all(&root_dir).map_err(|e| {
                YardError::internal(format!(
                    "failed to create wasm instance root directory {}: {e}",
                    root_dir.display()
                ))
            })?;
            created_root = true;

            std::fs::create_dir_all(&volatile_root_dir).map_err(|e| {
                YardError::internal(format!(
                    "failed to create volatile wasm instance root directory {}: {e}",
                    volatile_root_dir.display()
                ))
            })?;
            created_volatile = true;

            let hostname = nix::unistd::gethostname()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_default();
            let spec = build_wasm_spec(&id, &module, &config, &sandbox_config, &hostname)
                .map_err(|e| e.context(format!("failed to generate wasm spec for {id:?}")))?;
            let spec_bytes = serde_json::to_vec(&spec)?;

            // Compose the full log path; empty components disable logging.
            let log_path = if !sandbox_config.log_directory.is_empty() && !config.log_path.is_empty()
            {
                std::path::Path::new(&sandbox_config.log_directory)
                    .join(&config.log_path)
                    .to_string_lossy()
                    .into_owned()
            } else {
                tracing::info!(
                    "Logging disabled for wasm instance {id:?} due to empty log paths"
                );
                String::new()
            };

            let io = InstanceIo::new(&id, &volatile_root_dir, config.tty, config.stdin)
                .map_err(|e| e.context(format!("failed to create wasm instance IO {id:?}")))?;

            let runtime_name = if sandbox.runtime_handler.is_empty() {
                self.config.runtime.name.clone()
            } else {
                sandbox.runtime_handler.clone()
            };
            let runtime_options = serde_json::to_vec(&self.config.runtime.options)?;

            let labels = build_labels(&config.labels);
            let status = Status {
                created_at: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
                resources: resources_from_config(&config),
                ..Status::default()
            };

            let meta = Metadata {
                id: id.clone(),
                name: name.clone(),
                sandbox_id: sandbox.id.clone(),
                config: config.clone(),
                wasm_module_name: module.name.clone(),
                module_ref: module.id.clone(),
                stop_signal: module.spec.stop_signal.clone(),
                log_path,
                runtime: RuntimeInfo {
                    name: runtime_name,
                    options: runtime_options,
                },
                spec: spec_bytes,
                labels,
                root_dir: root_dir.clone(),
                volatile_root_dir: volatile_root_dir.clone(),
            };

            // A failure before the instance exists drops `io`, whose Drop
            // removes the FIFO set.
            let storage = store_status(&root_dir, &id, status)
                .map_err(|e| e.context(format!("failed to checkpoint status for {id:?}")))?;

            let instance = WasmInstance::new(meta, storage, Some(io));
            instance_out = Some(instance.clone());

            self.instance_store
                .add(instance)
                .map_err(|e| e.context(format!("failed to add wasm instance {id:?} into store")))?;

            Ok(CreateContainerResponse { container_id: id.clone() })
        }
        .await;

        if result.is_err() {
            // Reverse-order cleanup; each step is best-effort.
            if let Some(instance) = &instance_out {
                if let Err(e) = instance.delete_checkpoint() {
                    tracing::error!("Failed to clean up checkpoint for {id:?}: {e}");
                }
                if let Some(io) = &instance.io {
                    io.close();
                }
            }
            if created_volatile {
                if let Err(e) = std::fs::remove_dir_all(&volatile_root_dir) {
                    tracing::error!(
                        "Failed to remove volatile wasm instance root directory {}: {e}",
                        volatile_root_dir.display()
                    );
                }
            }
            if created_root {
                if let Err(e) = std::fs::remove_dir_all(&root_dir) {
                    tracing::error!(
                        "Failed to remove wasm instance root directory {}: {e}",
                        root_dir.display()
                    );
                }
            }
            self.name_index.release_by_name(&name);
        }

        result
    }
}
