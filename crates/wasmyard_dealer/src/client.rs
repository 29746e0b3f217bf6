use std::time::Duration;

use tokio::time::timeout;
use tonic::transport::{Channel, Endpoint};

use crate::error::{DealerError, DealerResult};
use crate::proto::{
    CreateTaskRequest, CreateTaskResponse, DeleteProcessRequest, DeleteResponse, DeleteTaskRequest,
    GetRequest, GetResponse, KillRequest, ListPidsRequest, ListPidsResponse, ListTasksRequest,
    ListTasksResponse, PauseTaskRequest, ResumeTaskRequest, StartRequest, StartResponse,
    UpdateTaskRequest, WaitRequest, WaitResponse, wasmdealer_client::WasmdealerClient,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Typed client for the wasmdealer task service.
///
/// Unary calls are bounded by [`RPC_TIMEOUT`]. `wait` is exempt: it resolves
/// only when the task exits and is driven from detached contexts.
#[derive(Clone)]
pub struct DealerClient {
    channel: Channel,
}

impl DealerClient {
    /// Connects eagerly, failing if the dealer is unreachable.
    pub async fn connect(endpoint: impl Into<String>) -> DealerResult<Self> {
        let endpoint = Endpoint::from_shared(endpoint.into())
            .map_err(|e| DealerError::InvalidArgument(format!("invalid dealer endpoint: {e}")))?
            .connect_timeout(CONNECT_TIMEOUT)
            .tcp_keepalive(Some(Duration::from_secs(30)));

        match timeout(CONNECT_TIMEOUT, endpoint.connect()).await {
            Ok(Ok(channel)) => Ok(Self { channel }),
            Ok(Err(e)) => Err(DealerError::Transport(e)),
            Err(_) => Err(DealerError::Rpc(tonic::Status::deadline_exceeded(
                "wasmdealer connect timeout",
            ))),
        }
    }

    /// Creates a client that connects on first use. The dealer may come up
    /// after the control plane.
    pub fn connect_lazy(endpoint: impl Into<String>) -> DealerResult<Self> {
        let endpoint = Endpoint::from_shared(endpoint.into())
            .map_err(|e| DealerError::InvalidArgument(format!("invalid dealer endpoint: {e}")))?
            .connect_timeout(CONNECT_TIMEOUT)
            .tcp_keepalive(Some(Duration::from_secs(30)));
        Ok(Self {
            channel: endpoint.connect_lazy(),
        })
    }

    fn client(&self) -> WasmdealerClient<Channel> {
        WasmdealerClient::new(self.channel.clone())
    }

    async fn unary<T>(
        &self,
        fut: impl Future<Output = Result<tonic::Response<T>, tonic::Status>>,
    ) -> DealerResult<T> {
        match timeout(RPC_TIMEOUT, fut).await {
            Ok(Ok(response)) => Ok(response.into_inner()),
            Ok(Err(status)) => Err(DealerError::from_status(status)),
            Err(_) => Err(DealerError::Rpc(tonic::Status::deadline_exceeded(
                "wasmdealer rpc timeout",
            ))),
        }
    }

    pub async fn create(&self, request: CreateTaskRequest) -> DealerResult<CreateTaskResponse> {
        let mut client = self.client();
        self.unary(client.create(request)).await
    }

    pub async fn start(&self, wasm_id: &str) -> DealerResult<StartResponse> {
        let mut client = self.client();
        self.unary(client.start(StartRequest {
            wasm_id: wasm_id.to_string(),
            exec_id: String::new(),
        }))
        .await
    }

    pub async fn get(&self, wasm_id: &str) -> DealerResult<GetResponse> {
        let mut client = self.client();
        self.unary(client.get(GetRequest {
            wasm_id: wasm_id.to_string(),
            exec_id: String::new(),
        }))
        .await
    }

    pub async fn list(&self) -> DealerResult<ListTasksResponse> {
        let mut client = self.client();
        self.unary(client.list(ListTasksRequest {
            filter: String::new(),
        }))
        .await
    }

    pub async fn kill(&self, wasm_id: &str, signal: u32, all: bool) -> DealerResult<()> {
        let mut client = self.client();
        self.unary(client.kill(KillRequest {
            wasm_id: wasm_id.to_string(),
            exec_id: String::new(),
            signal,
            all,
        }))
        .await
        .map(|_| ())
    }

    pub async fn pause(&self, wasm_id: &str) -> DealerResult<()> {
        let mut client = self.client();
        self.unary(client.pause(PauseTaskRequest {
            wasm_id: wasm_id.to_string(),
        }))
        .await
        .map(|_| ())
    }

    pub async fn resume(&self, wasm_id: &str) -> DealerResult<()> {
        let mut client = self.client();
        self.unary(client.resume(ResumeTaskRequest {
            wasm_id: wasm_id.to_string(),
        }))
        .await
        .map(|_| ())
    }

    pub async fn delete(&self, wasm_id: &str) -> DealerResult<DeleteResponse> {
        let mut client = self.client();
        self.unary(client.delete(DeleteTaskRequest {
            wasm_id: wasm_id.to_string(),
        }))
        .await
    }

    pub async fn delete_process(&self, wasm_id: &str, exec_id: &str) -> DealerResult<DeleteResponse> {
        let mut client = self.client();
        self.unary(client.delete_process(DeleteProcessRequest {
            wasm_id: wasm_id.to_string(),
            exec_id: exec_id.to_string(),
        }))
        .await
    }

    pub async fn list_pids(&self, wasm_id: &str) -> DealerResult<ListPidsResponse> {
        let mut client = self.client();
        self.unary(client.list_pids(ListPidsRequest {
            wasm_id: wasm_id.to_string(),
        }))
        .await
    }

    pub async fn update(&self, request: UpdateTaskRequest) -> DealerResult<()> {
        let mut client = self.client();
        self.unary(client.update(request)).await.map(|_| ())
    }

    /// Blocks until the task exits. No RPC timeout; cancellation happens by
    /// dropping the future.
    pub async fn wait(&self, wasm_id: &str) -> DealerResult<WaitResponse> {
        let mut client = self.client();
        match client
            .wait(WaitRequest {
                wasm_id: wasm_id.to_string(),
                exec_id: String::new(),
            })
            .await
        {
            Ok(response) => Ok(response.into_inner()),
            Err(status) => Err(DealerError::from_status(status)),
        }
    }
}
