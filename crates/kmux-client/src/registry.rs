use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use kmux_protocol::{AuthProvider, ClientResult, Endpoint, LifecycleApi, NoAuth, TransportLauncher};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::connection::ServerConnection;
use crate::manager::{KernelManager, KernelTarget};

pub struct RegistryBuilder {
    launcher: Arc<dyn TransportLauncher>,
    auth: Arc<dyn AuthProvider>,
    config: ClientConfig,
}

impl RegistryBuilder {
    pub fn new(launcher: Arc<dyn TransportLauncher>) -> Self {
        Self {
            launcher,
            auth: Arc::new(NoAuth),
            config: ClientConfig::default(),
        }
    }

    pub fn auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = auth;
        self
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> ConnectionRegistry {
        ConnectionRegistry {
            inner: Arc::new(RegistryInner {
                launcher: self.launcher,
                auth: self.auth,
                config: self.config,
                connections: Mutex::new(HashMap::new()),
            }),
        }
    }
}

struct RegistryInner {
    launcher: Arc<dyn TransportLauncher>,
    auth: Arc<dyn AuthProvider>,
    config: ClientConfig,
    connections: Mutex<HashMap<Endpoint, Arc<ServerConnection>>>,
}

/// One [`ServerConnection`] per endpoint, shared by every manager and
/// client of that endpoint.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn builder(launcher: Arc<dyn TransportLauncher>) -> RegistryBuilder {
        RegistryBuilder::new(launcher)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// The open connection for `endpoint`, created on first use. A
    /// connection that was shut down is replaced.
    pub fn connection(&self, endpoint: &Endpoint) -> Arc<ServerConnection> {
        let mut connections = self.inner.connections.lock();
        if let Some(existing) = connections.get(endpoint) {
            if !existing.is_closed() {
                return Arc::clone(existing);
            }
            debug!(%endpoint, "replacing closed connection");
        }
        let connection = ServerConnection::new(
            endpoint.clone(),
            Arc::clone(&self.inner.launcher),
            Arc::clone(&self.inner.auth),
            self.inner.config.clone(),
        );
        connections.insert(endpoint.clone(), Arc::clone(&connection));
        connection
    }

    pub fn get(&self, endpoint: &Endpoint) -> Option<Arc<ServerConnection>> {
        self.inner.connections.lock().get(endpoint).cloned()
    }

    /// Forgets the connection without stopping it.
    pub fn unregister(&self, endpoint: &Endpoint) -> Option<Arc<ServerConnection>> {
        self.inner.connections.lock().remove(endpoint)
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<_> = self.inner.connections.lock().keys().cloned().collect();
        endpoints.sort();
        endpoints
    }

    pub fn manager(
        &self,
        endpoint: &Endpoint,
        api: Arc<dyn LifecycleApi>,
        target: KernelTarget,
    ) -> KernelManager {
        KernelManager::new(self.connection(endpoint), api, target)
    }

    /// Shuts down and forgets every connection. Every connection is
    /// attempted; the first failure is returned.
    pub async fn shutdown_all(&self) -> ClientResult<()> {
        let connections: Vec<_> = self.inner.connections.lock().drain().map(|(_, c)| c).collect();
        let mut first_error = None;
        for connection in connections {
            if let Err(error) = connection.shutdown().await {
                warn!(endpoint = %connection.endpoint(), %error, "connection shutdown failed");
                first_error.get_or_insert(error);
            }
        }
        info!("all connections shut down");
        first_error.map_or(Ok(()), Err)
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("endpoints", &self.endpoints())
            .field("config", &self.inner.config)
            .finish()
    }
}
