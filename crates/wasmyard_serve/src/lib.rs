//! CRI-facing control plane for wasm workloads.
//!
//! This crate is primarily a binary, but exposing a small library surface
//! makes it easier to write integration tests without spawning an external
//! process.

mod cli;
mod constants;
mod cri;
mod error;
mod events;
mod grpc;
mod io;
mod oci;
mod store;
mod task;

pub mod testing;

// Public surface: the service, its errors, the wire types, and the store
// types an embedding runtime composes.
pub use cri::{CriService, WorkloadStore};
pub use error::{YardError, YardResult};
pub use grpc::cri_proto;
pub use io::InstanceIo;
pub use store::instance::{InstanceStore, Metadata, RuntimeInfo, StopCh, WasmInstance};
pub use store::module::{ModuleStore, WasmModule, WasmModuleSpec};
pub use store::name_index::{NameIndex, WorkloadKind};
pub use store::sandbox::{Sandbox, SandboxState, SandboxStore};
pub use store::status::{
    InstanceState, Resources, Status, StatusStorage, load_status, store_status,
};

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser as _;
use tokio::sync::broadcast;
use tonic::transport::Server;
use tonic_health::server::health_reporter;
use wasmyard_config::YardConfig;
use wasmyard_dealer::DealerClient;

use crate::cli::Cli;
use crate::grpc::cri_proto::image_service_server::ImageServiceServer;
use crate::grpc::cri_proto::runtime_service_server::RuntimeServiceServer;

/// Runs the control plane binary logic.
///
/// Keeping the main logic in the library allows integration tests to call it
/// directly, while the actual binary stays a thin wrapper.
pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = Arc::new(YardConfig::load(&cli.config)?);

    let bind_address: SocketAddr =
        format!("{}:{}", config.server.address, config.server.port).parse()?;

    let dealer = DealerClient::connect_lazy(config.dealer_endpoint())
        .map_err(|e| format!("failed to set up dealer client: {e}"))?;
    let service = CriService::new(Arc::clone(&config), dealer)?;

    let (shutdown_tx, _shutdown_rx) = broadcast::channel::<()>(16);
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received interrupt, shutting down");
                let _ = shutdown_tx.send(());
            }
        });
    }

    let (reporter, health_service) = health_reporter();
    reporter
        .set_serving::<RuntimeServiceServer<CriService>>()
        .await;
    reporter
        .set_serving::<ImageServiceServer<CriService>>()
        .await;

    tracing::info!("{}: CRI server is listening on {}", config.name, bind_address);

    let mut server_shutdown_rx = shutdown_tx.subscribe();
    Server::builder()
        .add_service(health_service)
        .add_service(
            RuntimeServiceServer::new(service.clone())
                .max_decoding_message_size(constants::MAX_MESSAGE_SIZE)
                .max_encoding_message_size(constants::MAX_MESSAGE_SIZE),
        )
        .add_service(
            ImageServiceServer::new(service)
                .max_decoding_message_size(constants::MAX_MESSAGE_SIZE)
                .max_encoding_message_size(constants::MAX_MESSAGE_SIZE),
        )
        .serve_with_shutdown(bind_address, async move {
            let _ = server_shutdown_rx.recv().await;
        })
        .await?;

    Ok(())
}
