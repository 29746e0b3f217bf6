//! CRI entry points.
//!
//! Every RPC is de-muxed once: image operations branch on the wasm module
//! annotation (or a module-store hit), container operations on the workload
//! kind behind the id. Non-wasm requests answer UNIMPLEMENTED; they belong
//! to the container pipeline of the embedding service.

pub(crate) mod helpers;

mod image_ops;
mod image_pull;
mod instance_create;
mod instance_remove;
mod instance_start;
mod instance_stop;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tonic::{Request, Response, Status};
use wasmyard_config::YardConfig;
use wasmyard_dealer::DealerClient;

use crate::error::{YardError, YardResult};
use crate::events::EventMonitor;
use crate::grpc::cri_proto::{
    Container, ContainerFilter, ContainerStatusRequest, ContainerStatusResponse,
    CreateContainerRequest, CreateContainerResponse, ImageStatusRequest, ImageStatusResponse,
    ListContainersRequest, ListContainersResponse, ListImagesRequest, ListImagesResponse,
    ListPodSandboxRequest, ListPodSandboxResponse, PodSandbox, PodSandboxState, PullImageRequest,
    PullImageResponse, RemoveContainerRequest, RemoveContainerResponse, RemoveImageRequest,
    RemoveImageResponse, RemovePodSandboxRequest, RemovePodSandboxResponse, RunPodSandboxRequest,
    RunPodSandboxResponse, StartContainerRequest, StartContainerResponse, StopContainerRequest,
    StopContainerResponse, StopPodSandboxRequest, StopPodSandboxResponse,
    image_service_server::ImageService, runtime_service_server::RuntimeService,
};
use crate::store::instance::{InstanceStore, WasmInstance};
use crate::store::module::ModuleStore;
use crate::store::name_index::{NameIndex, WorkloadKind};
use crate::store::sandbox::{Sandbox, SandboxState, SandboxStore};

use helpers::{is_wasm_image, wasm_to_cri_container, wasm_to_cri_container_status};

/// Uniform view over a workload registry so CRI listings can concatenate
/// every pipeline's entries without knowing their internals.
pub trait WorkloadStore: Send + Sync {
    fn kind(&self) -> WorkloadKind;

    fn contains(&self, id: &str) -> bool;

    /// Projects every workload onto the CRI container shape.
    fn project(&self) -> Vec<Container>;
}

impl WorkloadStore for InstanceStore {
    fn kind(&self) -> WorkloadKind {
        WorkloadKind::WasmInstance
    }

    fn contains(&self, id: &str) -> bool {
        self.get(id).is_ok()
    }

    fn project(&self) -> Vec<Container> {
        self.list().iter().map(wasm_to_cri_container).collect()
    }
}

#[derive(Clone)]
pub struct CriService {
    pub(crate) config: Arc<YardConfig>,
    pub(crate) dealer: DealerClient,
    pub(crate) module_store: Arc<ModuleStore>,
    pub(crate) instance_store: Arc<InstanceStore>,
    pub(crate) sandbox_store: Arc<SandboxStore>,
    pub(crate) name_index: Arc<NameIndex>,
    pub(crate) event_monitor: Arc<EventMonitor>,
    workload_stores: Vec<Arc<dyn WorkloadStore>>,
}

impl CriService {
    /// Builds the service, preparing the on-disk layout and rebuilding the
    /// module index from it.
    pub fn new(config: Arc<YardConfig>, dealer: DealerClient) -> YardResult<Self> {
        for dir in [
            config.root_dir(),
            config.state_dir(),
            config.module_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                YardError::internal(format!("failed to create {}: {e}", dir.display()))
            })?;
        }

        let module_store = Arc::new(ModuleStore::new());
        let loaded = module_store
            .reload(&config.module_dir())
            .map_err(|e| e.context("failed to reload module store"))?;
        if loaded > 0 {
            tracing::info!("Reloaded {loaded} wasm modules from {}", config.module_dir().display());
        }

        let instance_store = Arc::new(InstanceStore::new());
        let event_monitor = EventMonitor::start(Arc::clone(&instance_store), dealer.clone());

        Ok(Self {
            config,
            dealer,
            module_store,
            instance_store: Arc::clone(&instance_store),
            sandbox_store: Arc::new(SandboxStore::new()),
            name_index: Arc::new(NameIndex::new()),
            event_monitor,
            workload_stores: vec![instance_store as Arc<dyn WorkloadStore>],
        })
    }

    fn find_wasm_instance(&self, id: &str) -> YardResult<WasmInstance> {
        self.instance_store.get(id)
    }

    /// The workload kind behind a container id, when any pipeline knows it.
    fn workload_kind(&self, id: &str) -> Option<WorkloadKind> {
        self.workload_stores
            .iter()
            .find(|store| store.contains(id))
            .map(|store| store.kind())
    }

    /// An image reference belongs to the wasm pipeline when it carries the
    /// module annotation or already resolves through the module store.
    fn routes_to_wasm_image(
        &self,
        image: Option<&crate::grpc::cri_proto::ImageSpec>,
    ) -> bool {
        match image {
            Some(image) => is_wasm_image(image) || self.module_store.get(&image.image).is_ok(),
            // Malformed requests stay in the wasm pipeline, which rejects
            // them with a precise error.
            None => true,
        }
    }
}

fn container_pipeline_unimplemented(op: &str) -> Status {
    Status::unimplemented(format!(
        "{op}: non-wasm workloads are handled by the container pipeline"
    ))
}

#[tonic::async_trait]
impl RuntimeService for CriService {
    async fn run_pod_sandbox(
        &self,
        request: Request<RunPodSandboxRequest>,
    ) -> Result<Response<RunPodSandboxResponse>, Status> {
        let request = request.into_inner();
        let config = request
            .config
            .ok_or_else(|| Status::invalid_argument("sandbox config is required"))?;

        let id = uuid::Uuid::new_v4().simple().to_string();
        self.sandbox_store
            .add(Sandbox {
                id: id.clone(),
                config,
                runtime_handler: request.runtime_handler,
                state: SandboxState::Ready,
                created_at: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            })
            .map_err(Status::from)?;

        Ok(Response::new(RunPodSandboxResponse { pod_sandbox_id: id }))
    }

    async fn stop_pod_sandbox(
        &self,
        request: Request<StopPodSandboxRequest>,
    ) -> Result<Response<StopPodSandboxResponse>, Status> {
        let request = request.into_inner();
        self.sandbox_store
            .set_state(&request.pod_sandbox_id, SandboxState::NotReady)
            .map_err(Status::from)?;
        Ok(Response::new(StopPodSandboxResponse {}))
    }

    async fn remove_pod_sandbox(
        &self,
        request: Request<RemovePodSandboxRequest>,
    ) -> Result<Response<RemovePodSandboxResponse>, Status> {
        let request = request.into_inner();
        self.sandbox_store.delete(&request.pod_sandbox_id);
        Ok(Response::new(RemovePodSandboxResponse {}))
    }

    async fn list_pod_sandbox(
        &self,
        _request: Request<ListPodSandboxRequest>,
    ) -> Result<Response<ListPodSandboxResponse>, Status> {
        let items = self
            .sandbox_store
            .list()
            .into_iter()
            .map(|sandbox| PodSandbox {
                id: sandbox.id,
                metadata: sandbox.config.metadata.clone(),
                state: match sandbox.state {
                    SandboxState::Ready => PodSandboxState::SandboxReady,
                    SandboxState::NotReady => PodSandboxState::SandboxNotready,
                } as i32,
                created_at: sandbox.created_at,
                labels: sandbox.config.labels.clone(),
                annotations: sandbox.config.annotations.clone(),
            })
            .collect();
        Ok(Response::new(ListPodSandboxResponse { items }))
    }

    async fn create_container(
        &self,
        request: Request<CreateContainerRequest>,
    ) -> Result<Response<CreateContainerResponse>, Status> {
        let request = request.into_inner();

        // The image argument resolves through the module store first; a hit
        // (or the wasm annotation) routes to the wasm pipeline.
        let image = request
            .config
            .as_ref()
            .and_then(|config| config.image.as_ref());
        let routes_to_wasm = match image {
            Some(image) => {
                self.module_store.get(&image.image).is_ok() || is_wasm_image(image)
            }
            None => false,
        };
        if !routes_to_wasm {
            return Err(container_pipeline_unimplemented("CreateContainer"));
        }

        let response = self.create_wasm_instance(request).await.map_err(Status::from)?;
        Ok(Response::new(response))
    }

    async fn start_container(
        &self,
        request: Request<StartContainerRequest>,
    ) -> Result<Response<StartContainerResponse>, Status> {
        let request = request.into_inner();
        let instance = self
            .find_wasm_instance(&request.container_id)
            .map_err(Status::from)?;
        let response = self.start_wasm_instance(&instance).await.map_err(Status::from)?;
        Ok(Response::new(response))
    }

    async fn stop_container(
        &self,
        request: Request<StopContainerRequest>,
    ) -> Result<Response<StopContainerResponse>, Status> {
        let request = request.into_inner();
        let instance = self
            .find_wasm_instance(&request.container_id)
            .map_err(Status::from)?;
        self.stop_wasm_instance(&instance, Duration::from_secs(request.timeout.max(0) as u64))
            .await
            .map_err(Status::from)?;
        Ok(Response::new(StopContainerResponse {}))
    }

    async fn remove_container(
        &self,
        request: Request<RemoveContainerRequest>,
    ) -> Result<Response<RemoveContainerResponse>, Status> {
        let request = request.into_inner();
        let instance = match self.find_wasm_instance(&request.container_id) {
            Ok(instance) => instance,
            // Removal of an absent workload succeeds per CRI semantics.
            Err(e) if e.is_not_found() => {
                return Ok(Response::new(RemoveContainerResponse {}));
            }
            Err(e) => return Err(e.into()),
        };
        let response = self.remove_wasm_instance(&instance).await.map_err(Status::from)?;
        Ok(Response::new(response))
    }

    async fn list_containers(
        &self,
        request: Request<ListContainersRequest>,
    ) -> Result<Response<ListContainersResponse>, Status> {
        let request = request.into_inner();

        // Concatenate the uniform projections of every workload pipeline.
        let mut containers: Vec<Container> = self
            .workload_stores
            .iter()
            .flat_map(|store| store.project())
            .collect();
        if let Some(filter) = &request.filter {
            containers.retain(|container| matches_filter(container, filter));
        }

        Ok(Response::new(ListContainersResponse { containers }))
    }

    async fn container_status(
        &self,
        request: Request<ContainerStatusRequest>,
    ) -> Result<Response<ContainerStatusResponse>, Status> {
        let request = request.into_inner();
        match self.workload_kind(&request.container_id) {
            Some(WorkloadKind::WasmInstance) => {}
            Some(WorkloadKind::Container) => {
                return Err(container_pipeline_unimplemented("ContainerStatus"));
            }
            None => {
                return Err(Status::not_found(format!(
                    "wasm instance {:?} not found",
                    request.container_id
                )));
            }
        }

        let instance = self
            .find_wasm_instance(&request.container_id)
            .map_err(Status::from)?;
        Ok(Response::new(ContainerStatusResponse {
            status: Some(wasm_to_cri_container_status(&instance)),
            info: Default::default(),
        }))
    }
}

fn matches_filter(container: &Container, filter: &ContainerFilter) -> bool {
    if !filter.id.is_empty() && filter.id != container.id {
        return false;
    }
    if !filter.pod_sandbox_id.is_empty() && filter.pod_sandbox_id != container.pod_sandbox_id {
        return false;
    }
    if let Some(state) = &filter.state {
        if state.state != container.state {
            return false;
        }
    }
    true
}

#[tonic::async_trait]
impl ImageService for CriService {
    async fn pull_image(
        &self,
        request: Request<PullImageRequest>,
    ) -> Result<Response<PullImageResponse>, Status> {
        let request = request.into_inner();
        let Some(image) = &request.image else {
            return Err(Status::invalid_argument("image spec is required"));
        };
        if !is_wasm_image(image) {
            return Err(container_pipeline_unimplemented("PullImage"));
        }

        let response = self.pull_wasm_module(request).await.map_err(Status::from)?;
        Ok(Response::new(response))
    }

    async fn image_status(
        &self,
        request: Request<ImageStatusRequest>,
    ) -> Result<Response<ImageStatusResponse>, Status> {
        let request = request.into_inner();
        if !self.routes_to_wasm_image(request.image.as_ref()) {
            return Err(container_pipeline_unimplemented("ImageStatus"));
        }
        let response = self.wasm_image_status(request).map_err(Status::from)?;
        Ok(Response::new(response))
    }

    async fn remove_image(
        &self,
        request: Request<RemoveImageRequest>,
    ) -> Result<Response<RemoveImageResponse>, Status> {
        let request = request.into_inner();
        if !self.routes_to_wasm_image(request.image.as_ref()) {
            return Err(container_pipeline_unimplemented("RemoveImage"));
        }
        let response = self.remove_wasm_module(request).map_err(Status::from)?;
        Ok(Response::new(response))
    }

    async fn list_images(
        &self,
        request: Request<ListImagesRequest>,
    ) -> Result<Response<ListImagesResponse>, Status> {
        Ok(Response::new(self.list_wasm_images(request.into_inner())))
    }
}
