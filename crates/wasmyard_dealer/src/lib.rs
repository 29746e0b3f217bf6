//! Wasmdealer: the task service for wasm workloads.
//!
//! This crate carries the wire protocol, the server implementation over an
//! injected [`platform::PlatformRuntime`], and the typed client used by the
//! CRI-facing control plane.

mod client;
mod convert;
mod error;
mod local;
mod monitor;
mod platform;

pub mod testing;

pub mod proto {
    tonic::include_proto!("wasmdealer.v1");
}

pub use client::DealerClient;
pub use convert::{from_timestamp, to_timestamp};
pub use error::{DealerError, DealerResult};
pub use local::LocalDealer;
pub use monitor::{NoopMonitor, TaskMonitor};
pub use platform::{
    CreateOpts, ExitRecord, IoStreams, PlatformRuntime, PlatformTask, ProcessState, TaskState,
};
pub use proto::wasmdealer_server::WasmdealerServer;
