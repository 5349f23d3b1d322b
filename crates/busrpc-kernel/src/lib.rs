//! busrpc kernel: the participating process.
//!
//! An [`Ipc`] joins the bus through a [`Broker`](busrpc_wire::Broker),
//! discovers its peers, exposes declared methods and forwards named events.
//! Peers are reached through [`RemoteNode`] proxies.

pub mod config;
pub mod correlator;
pub mod events;
pub mod ipc;
pub mod methods;
pub mod node;

pub use events::{Disposer, EventHub, CONNECT_EVENT, DISCONNECT_EVENT};
pub use ipc::Ipc;
pub use methods::{MethodRegistry, RESERVED_METHODS};
pub use node::{NodeRegistry, RemoteNode};
