//! Server side of the wasmdealer task service.
//!
//! Each RPC resolves the task through the injected [`PlatformRuntime`] and
//! translates the result onto the wire. The task monitor is informed on
//! Create and Delete so live wasm tasks share resource bookkeeping with
//! ordinary container tasks.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::convert::to_timestamp;
use crate::monitor::TaskMonitor;
use crate::platform::{CreateOpts, IoStreams, PlatformRuntime, PlatformTask};
use crate::proto::{
    self, CreateTaskRequest, CreateTaskResponse, DeleteProcessRequest, DeleteResponse,
    DeleteTaskRequest, GetRequest, GetResponse, KillRequest, KillResponse, ListPidsRequest,
    ListPidsResponse, ListTasksRequest, ListTasksResponse, PauseTaskRequest, PauseTaskResponse,
    ProcessInfo, ResumeTaskRequest, ResumeTaskResponse, StartRequest, StartResponse,
    UpdateTaskRequest, UpdateTaskResponse, WaitRequest, WaitResponse,
    wasmdealer_server::Wasmdealer,
};

pub struct LocalDealer {
    runtime: Arc<dyn PlatformRuntime>,
    monitor: Arc<dyn TaskMonitor>,
}

impl LocalDealer {
    pub fn new(runtime: Arc<dyn PlatformRuntime>, monitor: Arc<dyn TaskMonitor>) -> Self {
        Self { runtime, monitor }
    }

    async fn task(&self, wasm_id: &str) -> Result<Arc<dyn PlatformTask>, Status> {
        self.runtime.get(wasm_id).await.map_err(Status::from)
    }
}

#[tonic::async_trait]
impl Wasmdealer for LocalDealer {
    async fn create(
        &self,
        request: Request<CreateTaskRequest>,
    ) -> Result<Response<CreateTaskResponse>, Status> {
        let request = request.into_inner();

        match self.runtime.get(&request.wasm_id).await {
            Ok(_) => {
                return Err(Status::already_exists(format!(
                    "task {} already exists",
                    request.wasm_id
                )));
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let opts = CreateOpts {
            image_path: PathBuf::from(&request.image_path),
            spec: request.spec,
            io: IoStreams {
                stdin: request.stdin,
                stdout: request.stdout,
                stderr: request.stderr,
                terminal: false,
            },
            runtime: request.runtime.clone(),
            runtime_options: request.runtime_options,
            task_options: request.task_options,
        };

        let task = self
            .runtime
            .create(&request.wasm_id, opts)
            .await
            .map_err(Status::from)?;

        let labels = HashMap::from([("runtime".to_string(), request.runtime)]);
        if let Err(e) = self.monitor.monitor(Arc::clone(&task), labels).await {
            return Err(Status::internal(format!("monitor task: {e}")));
        }

        Ok(Response::new(CreateTaskResponse {
            wasm_id: request.wasm_id,
            pid: task.pid(),
        }))
    }

    async fn start(
        &self,
        request: Request<StartRequest>,
    ) -> Result<Response<StartResponse>, Status> {
        let request = request.into_inner();
        let task = self.task(&request.wasm_id).await?;
        task.start().await.map_err(Status::from)?;
        let state = task.state().await.map_err(Status::from)?;
        Ok(Response::new(StartResponse { pid: state.pid }))
    }

    async fn delete(
        &self,
        request: Request<DeleteTaskRequest>,
    ) -> Result<Response<DeleteResponse>, Status> {
        let request = request.into_inner();
        let task = self.task(&request.wasm_id).await?;
        if let Err(e) = self.monitor.stop(task.id()).await {
            return Err(Status::internal(format!("stop task monitor: {e}")));
        }

        let exit = self
            .runtime
            .delete(&request.wasm_id)
            .await
            .map_err(Status::from)?;

        Ok(Response::new(DeleteResponse {
            id: request.wasm_id,
            pid: exit.pid,
            exit_status: exit.exit_status,
            exited_at: Some(to_timestamp(exit.exited_at)),
        }))
    }

    async fn delete_process(
        &self,
        request: Request<DeleteProcessRequest>,
    ) -> Result<Response<DeleteResponse>, Status> {
        let request = request.into_inner();
        // Wasm tasks have a single process; exec processes are not supported,
        // so this degenerates to deleting the init process.
        if !request.exec_id.is_empty() {
            return Err(Status::not_found(format!(
                "exec process {} not found",
                request.exec_id
            )));
        }
        let exit = self
            .runtime
            .delete(&request.wasm_id)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(DeleteResponse {
            id: request.wasm_id,
            pid: exit.pid,
            exit_status: exit.exit_status,
            exited_at: Some(to_timestamp(exit.exited_at)),
        }))
    }

    async fn get(&self, request: Request<GetRequest>) -> Result<Response<GetResponse>, Status> {
        let request = request.into_inner();
        let task = self.task(&request.wasm_id).await?;
        let state = task.state().await.map_err(Status::from)?;
        Ok(Response::new(GetResponse {
            process: Some(state.into()),
        }))
    }

    async fn list(
        &self,
        _request: Request<ListTasksRequest>,
    ) -> Result<Response<ListTasksResponse>, Status> {
        let tasks = self.runtime.tasks().await.map_err(Status::from)?;
        let mut out = Vec::with_capacity(tasks.len());
        for task in tasks {
            match task.state().await {
                Ok(state) => out.push(proto::TaskProcess::from(state)),
                // Tolerate the race with deletion.
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    tracing::error!("failed to get state for task {}: {}", task.id(), e);
                }
            }
        }
        Ok(Response::new(ListTasksResponse { tasks: out }))
    }

    async fn kill(&self, request: Request<KillRequest>) -> Result<Response<KillResponse>, Status> {
        let request = request.into_inner();
        let task = self.task(&request.wasm_id).await?;
        task.kill(request.signal, request.all)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(KillResponse {}))
    }

    async fn pause(
        &self,
        request: Request<PauseTaskRequest>,
    ) -> Result<Response<PauseTaskResponse>, Status> {
        let request = request.into_inner();
        let task = self.task(&request.wasm_id).await?;
        task.pause().await.map_err(Status::from)?;
        Ok(Response::new(PauseTaskResponse {}))
    }

    async fn resume(
        &self,
        request: Request<ResumeTaskRequest>,
    ) -> Result<Response<ResumeTaskResponse>, Status> {
        let request = request.into_inner();
        let task = self.task(&request.wasm_id).await?;
        task.resume().await.map_err(Status::from)?;
        Ok(Response::new(ResumeTaskResponse {}))
    }

    async fn list_pids(
        &self,
        request: Request<ListPidsRequest>,
    ) -> Result<Response<ListPidsResponse>, Status> {
        let request = request.into_inner();
        let task = self.task(&request.wasm_id).await?;
        let pids = task.pids().await.map_err(Status::from)?;
        Ok(Response::new(ListPidsResponse {
            processes: pids
                .into_iter()
                .map(|pid| ProcessInfo { pid, info: vec![] })
                .collect(),
        }))
    }

    async fn update(
        &self,
        request: Request<UpdateTaskRequest>,
    ) -> Result<Response<UpdateTaskResponse>, Status> {
        let request = request.into_inner();
        let task = self.task(&request.wasm_id).await?;
        task.update(&request.resources, &request.annotations)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(UpdateTaskResponse {}))
    }

    async fn wait(&self, request: Request<WaitRequest>) -> Result<Response<WaitResponse>, Status> {
        let request = request.into_inner();
        let task = self.task(&request.wasm_id).await?;
        let exit = task.wait().await.map_err(Status::from)?;
        Ok(Response::new(WaitResponse {
            exit_status: exit.exit_status,
            exited_at: Some(to_timestamp(exit.exited_at)),
        }))
    }
}
