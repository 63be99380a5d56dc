//! Boundary ports between the kmux core and its external collaborators.
//!
//! These traits are the only contact points with the websocket transport,
//! the HTTP lifecycle API, and the auth/cookie store.
//!
//! Object-safety note:
//! - Traits use `async-trait` for async dyn-dispatch.
//! - Transport events arrive on a `tokio::sync::mpsc` receiver handed out
//!   at launch.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ClientResult;
use crate::ids::KernelId;
use crate::kernelspec::{KernelRecord, KernelSpec};
use crate::transport::{Endpoint, TransportCommand, TransportConfig, TransportEvent};

/// A running multiplexing transport for one endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, command: TransportCommand) -> ClientResult<()>;
    fn is_alive(&self) -> bool;
    async fn stop(&self) -> ClientResult<()>;
}

/// A launched transport together with the events it produces.
pub struct LaunchedTransport {
    pub transport: Arc<dyn Transport>,
    pub events: mpsc::Receiver<TransportEvent>,
}

#[async_trait]
pub trait TransportLauncher: Send + Sync {
    async fn launch(&self, config: TransportConfig) -> ClientResult<LaunchedTransport>;
}

/// Kernel lifecycle operations exposed by an endpoint.
#[async_trait]
pub trait LifecycleApi: Send + Sync {
    async fn kernelspecs(&self) -> ClientResult<Vec<KernelSpec>>;
    async fn kernels(&self) -> ClientResult<Vec<KernelRecord>>;
    async fn get_kernel(&self, id: &KernelId) -> ClientResult<Option<KernelRecord>>;
    async fn create_kernel(&self, spec: &KernelSpec) -> ClientResult<KernelRecord>;
    async fn interrupt_kernel(&self, id: &KernelId) -> ClientResult<()>;
    async fn restart_kernel(&self, id: &KernelId) -> ClientResult<KernelRecord>;
    async fn shutdown_kernel(&self, id: &KernelId) -> ClientResult<()>;
}

/// Supplies authentication headers for an endpoint's transport.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Flush any externally managed auth state (cookies, tokens) before a
    /// transport process that reads it is spawned.
    async fn persist(&self) -> ClientResult<()> {
        Ok(())
    }

    async fn headers(&self, endpoint: &Endpoint) -> ClientResult<BTreeMap<String, String>>;
}

#[derive(Debug, Clone, Default)]
pub struct NoAuth;

#[async_trait]
impl AuthProvider for NoAuth {
    async fn headers(&self, _endpoint: &Endpoint) -> ClientResult<BTreeMap<String, String>> {
        Ok(BTreeMap::new())
    }
}

/// Fixed headers, e.g. `Authorization: token ...`.
#[derive(Debug, Clone, Default)]
pub struct StaticHeaders {
    headers: BTreeMap<String, String>,
}

impl StaticHeaders {
    pub fn new(headers: BTreeMap<String, String>) -> Self {
        Self { headers }
    }

    pub fn token(token: impl AsRef<str>) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert(
            "Authorization".to_owned(),
            format!("token {}", token.as_ref()),
        );
        Self { headers }
    }
}

#[async_trait]
impl AuthProvider for StaticHeaders {
    async fn headers(&self, _endpoint: &Endpoint) -> ClientResult<BTreeMap<String, String>> {
        Ok(self.headers.clone())
    }
}
