//! Test utilities for the CRI control plane.
//!
//! NOTE: This module is part of the public API to support integration tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tonic::transport::Server;
use tonic_health::ServingStatus;
use tonic_health::pb::HealthCheckRequest;
use tonic_health::pb::health_client::HealthClient;
use wasmyard_config::YardConfig;
use wasmyard_dealer::testing::{FakeRuntime, TestDealerHandle, start_test_dealer_server};
use wasmyard_dealer::{DealerClient, PlatformRuntime};

use crate::constants;
use crate::cri::CriService;
use crate::error::{YardError, YardResult};
use crate::grpc::cri_proto::image_service_server::ImageServiceServer;
use crate::grpc::cri_proto::runtime_service_server::RuntimeServiceServer;

/// Handle for a running in-process CRI server plus its backing dealer.
pub struct TestServerHandle {
    addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    join: JoinHandle<Result<(), tonic::transport::Error>>,
    dealer: TestDealerHandle,
    runtime: Arc<FakeRuntime>,
    service: CriService,
}

impl TestServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// CRI endpoint URL (e.g. `http://127.0.0.1:12345`).
    pub fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// The fake runtime backing the dealer, for signal assertions.
    pub fn runtime(&self) -> &Arc<FakeRuntime> {
        &self.runtime
    }

    /// Direct access to the service, for poking stores in tests.
    pub fn service(&self) -> &CriService {
        &self.service
    }

    /// Requests server shutdown and waits for both servers to stop.
    pub async fn shutdown(self) -> YardResult<()> {
        let _ = self.shutdown_tx.send(());
        match self.join.await {
            Ok(result) => {
                result.map_err(|e| YardError::internal(format!("CRI server exited: {e}")))?
            }
            Err(e) => {
                return Err(YardError::internal(format!(
                    "CRI server task join failed: {e}"
                )));
            }
        }
        self.dealer
            .shutdown()
            .await
            .map_err(|e| YardError::internal(format!("dealer shutdown failed: {e}")))?;
        Ok(())
    }
}

/// Starts an in-process dealer over the given fake runtime and a CRI server
/// bound to `127.0.0.1:0`. The caller owns the lifetime of the directories
/// named by `config`.
pub async fn start_test_cri_server(
    config: Arc<YardConfig>,
    runtime: Arc<FakeRuntime>,
) -> YardResult<TestServerHandle> {
    let dealer_handle =
        start_test_dealer_server(Arc::clone(&runtime) as Arc<dyn PlatformRuntime>)
            .await
            .map_err(|e| YardError::internal(format!("failed to start test dealer: {e}")))?;

    let dealer = DealerClient::connect(dealer_handle.endpoint())
        .await
        .map_err(|e| YardError::internal(format!("failed to connect to test dealer: {e}")))?;

    let service = CriService::new(config, dealer)?;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| YardError::internal(format!("failed to bind test listener: {e}")))?;
    let addr = listener
        .local_addr()
        .map_err(|e| YardError::internal(format!("failed to get local_addr: {e}")))?;

    let (shutdown_tx, _shutdown_rx) = broadcast::channel::<()>(16);
    let mut server_shutdown_rx = shutdown_tx.subscribe();

    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<RuntimeServiceServer<CriService>>()
        .await;
    health_reporter
        .set_serving::<ImageServiceServer<CriService>>()
        .await;

    let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);
    let runtime_service = RuntimeServiceServer::new(service.clone())
        .max_decoding_message_size(constants::MAX_MESSAGE_SIZE)
        .max_encoding_message_size(constants::MAX_MESSAGE_SIZE);
    let image_service = ImageServiceServer::new(service.clone())
        .max_decoding_message_size(constants::MAX_MESSAGE_SIZE)
        .max_encoding_message_size(constants::MAX_MESSAGE_SIZE);

    let join: JoinHandle<Result<(), tonic::transport::Error>> = tokio::spawn(async move {
        Server::builder()
            .add_service(health_service)
            .add_service(runtime_service)
            .add_service(image_service)
            .serve_with_incoming_shutdown(incoming, async move {
                let _ = server_shutdown_rx.recv().await;
            })
            .await
    });

    // Give the accept loop a moment to start to reduce flakiness on slow CI.
    tokio::time::sleep(Duration::from_millis(10)).await;

    Ok(TestServerHandle {
        addr,
        shutdown_tx,
        join,
        dealer: dealer_handle,
        runtime,
        service,
    })
}

/// Queries the server's health service for the CRI runtime service status.
pub async fn health_check(endpoint: impl Into<String>) -> YardResult<ServingStatus> {
    let endpoint = tonic::transport::Endpoint::from_shared(endpoint.into())
        .map_err(|e| YardError::internal(format!("invalid endpoint: {e}")))?
        .connect_timeout(Duration::from_secs(1))
        .timeout(Duration::from_secs(1));
    let conn = endpoint
        .connect()
        .await
        .map_err(|e| YardError::internal(format!("failed to connect: {e}")))?;
    let mut client = HealthClient::new(conn);
    let response = client
        .check(HealthCheckRequest {
            service: "cri.v1.RuntimeService".to_string(),
        })
        .await
        .map_err(|e| YardError::internal(format!("health check failed: {e}")))?;
    match response.into_inner().status {
        0 => Ok(ServingStatus::Unknown),
        1 => Ok(ServingStatus::Serving),
        2 => Ok(ServingStatus::NotServing),
        other => Err(YardError::internal(format!(
            "invalid status code {other} returned from health check"
        ))),
    }
}
