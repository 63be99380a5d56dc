//! # kmux-client
//!
//! Deferred kernel I/O on top of a shared, multiplexed transport.
//!
//! - [`io`]: [`Action`], [`bind`], ambient context and client
//! - [`request`]: issuing requests and correlating their replies
//! - [`connection`]: one transport per endpoint, shared by all kernels on it
//! - [`comm`]: a kernel's view of a connection
//! - [`manager`]: kernel lifecycle and client handles
//! - [`registry`]: endpoint to connection map

pub mod client;
pub mod comm;
pub mod config;
pub mod connection;
pub mod io;
pub mod manager;
pub mod registry;
pub mod request;

#[cfg(test)]
mod fake;

pub use client::KernelClient;
pub use comm::{CommState, KernelCommFilter};
pub use config::ClientConfig;
pub use connection::ServerConnection;
pub use io::{
    Action, Bindable, Binding, IoContext, bind, current_client, current_context, pure,
    run_with_context, sequence, with_client, with_context,
};
pub use manager::{KernelManager, KernelTarget};
pub use registry::{ConnectionRegistry, RegistryBuilder};
pub use request::{Request, issue, issue_and_wait, resolve, wait_until_idle};
