//! Kernel lifecycle management.

use std::fmt;
use std::sync::Arc;

use kmux_protocol::{
    ClientError, ClientResult, Directive, KernelId, KernelSpec, LifecycleApi, TransportCommand,
};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::client::KernelClient;
use crate::comm::{CommState, KernelCommFilter};
use crate::connection::ServerConnection;

/// Which kernel a manager drives.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelTarget {
    /// Start a new kernel from a kernelspec.
    Spawn(KernelSpec),
    /// Attach to a kernel that is already running on the endpoint.
    Existing(KernelId),
}

/// Starts, probes, interrupts, restarts and shuts down one kernel, and hands
/// out client handles sharing a single comm filter.
pub struct KernelManager {
    connection: Arc<ServerConnection>,
    api: Arc<dyn LifecycleApi>,
    target: KernelTarget,
    kernel_id: Mutex<Option<KernelId>>,
    comm: tokio::sync::Mutex<Option<Arc<KernelCommFilter>>>,
}

impl KernelManager {
    pub fn new(
        connection: Arc<ServerConnection>,
        api: Arc<dyn LifecycleApi>,
        target: KernelTarget,
    ) -> Self {
        Self {
            connection,
            api,
            target,
            kernel_id: Mutex::new(None),
            comm: tokio::sync::Mutex::new(None),
        }
    }

    pub fn connection(&self) -> &Arc<ServerConnection> {
        &self.connection
    }

    pub fn target(&self) -> &KernelTarget {
        &self.target
    }

    pub fn kernel_id(&self) -> Option<KernelId> {
        self.kernel_id.lock().clone()
    }

    fn require_kernel_id(&self) -> ClientResult<KernelId> {
        self.kernel_id().ok_or(ClientError::KernelNotStarted)
    }

    /// Creates the kernel, or checks that the existing one is there.
    /// Returns the kernel id the manager now drives.
    #[instrument(skip(self), fields(endpoint = %self.connection.endpoint()))]
    pub async fn start(&self) -> ClientResult<KernelId> {
        let kernel_id = match &self.target {
            KernelTarget::Spawn(spec) => {
                let advertised = self.api.kernelspecs().await?;
                if !advertised.iter().any(|candidate| spec.is_compatible_with(candidate)) {
                    return Err(ClientError::KernelspecMismatch {
                        endpoint: self.connection.endpoint().base_url.clone(),
                        name: spec.name.clone(),
                    });
                }
                let record = self.api.create_kernel(spec).await?;
                info!(kernel = %record.id.display_id(), spec = %spec.name, "kernel created");
                record.id
            }
            KernelTarget::Existing(id) => match self.api.get_kernel(id).await? {
                Some(record) => {
                    debug!(
                        kernel = %id.display_id(),
                        state = ?record.execution_state,
                        "using existing kernel"
                    );
                    record.id
                }
                None => return Err(ClientError::KernelNotFound(id.clone())),
            },
        };
        *self.kernel_id.lock() = Some(kernel_id.clone());
        Ok(kernel_id)
    }

    /// Whether the endpoint still reports the kernel. Probe failures count
    /// as not alive.
    pub async fn is_alive(&self) -> bool {
        let Some(kernel_id) = self.kernel_id() else {
            return false;
        };
        match self.api.get_kernel(&kernel_id).await {
            Ok(record) => record.is_some(),
            Err(error) => {
                warn!(kernel = %kernel_id.display_id(), %error, "kernel liveness probe failed");
                false
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn interrupt(&self) -> ClientResult<()> {
        let kernel_id = self.require_kernel_id()?;
        self.api.interrupt_kernel(&kernel_id).await?;
        info!(kernel = %kernel_id.display_id(), "kernel interrupted");
        Ok(())
    }

    /// Restarts the kernel when `restart` is set, otherwise shuts it down.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, restart: bool) -> ClientResult<()> {
        let kernel_id = self.require_kernel_id()?;
        if restart {
            return self.restart(kernel_id).await;
        }

        if self.connection.is_alive() {
            let command = TransportCommand {
                kernel_id: kernel_id.clone(),
                directive: Directive::DisconnectChannels,
            };
            if let Err(error) = self.connection.send(command).await {
                warn!(kernel = %kernel_id.display_id(), %error, "failed to disconnect channels");
            }
        }
        if self.is_alive().await {
            self.api.shutdown_kernel(&kernel_id).await?;
            info!(kernel = %kernel_id.display_id(), "kernel shut down");
        }

        self.kernel_id.lock().take();
        if let Some(comm) = self.comm.lock().await.take() {
            comm.stop();
        }
        Ok(())
    }

    async fn restart(&self, kernel_id: KernelId) -> ClientResult<()> {
        let record = self.api.restart_kernel(&kernel_id).await?;
        if record.id != kernel_id {
            warn!(
                previous = %kernel_id.display_id(),
                current = %record.id.display_id(),
                "kernel id changed across restart"
            );
            *self.kernel_id.lock() = Some(record.id.clone());
            if let Some(comm) = self.comm.lock().await.take() {
                comm.stop();
            }
        }
        if self.api.get_kernel(&record.id).await?.is_none() {
            return Err(ClientError::Lifecycle(format!(
                "kernel {} is gone after restart",
                record.id
            )));
        }
        info!(kernel = %record.id.display_id(), "kernel restarted");
        Ok(())
    }

    /// A new client handle on the manager's shared comm filter.
    ///
    /// The first call creates and starts the filter. A filter that was
    /// stopped since, by a disconnect or a transport exit, is started again.
    #[instrument(skip(self))]
    pub async fn make_client(&self) -> ClientResult<KernelClient> {
        let kernel_id = self.require_kernel_id()?;
        let mut slot = self.comm.lock().await;
        let comm = match slot.as_ref() {
            Some(comm) if comm.kernel_id() == &kernel_id => Arc::clone(comm),
            _ => {
                let comm = KernelCommFilter::new(Arc::clone(&self.connection), kernel_id);
                *slot = Some(Arc::clone(&comm));
                comm
            }
        };
        if comm.state() == CommState::Stopped {
            comm.start().await?;
        }
        Ok(KernelClient::new(comm))
    }
}

impl fmt::Debug for KernelManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelManager")
            .field("endpoint", self.connection.endpoint())
            .field("target", &self.target)
            .field("kernel_id", &self.kernel_id())
            .finish()
    }
}
