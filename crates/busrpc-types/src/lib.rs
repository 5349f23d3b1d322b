//! Core types for busrpc.
//!
//! This crate defines the error taxonomy and configuration structures shared
//! by the wire layer, the kernel and the CLI. It contains no business logic.

pub mod config;
pub mod error;

pub use config::{BusrpcConfig, IpcConfig, RelayConfig};
pub use error::{RpcError, RpcResult};
