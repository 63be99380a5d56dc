use std::fmt;
use std::sync::Arc;

use kmux_bus::Publisher;
use kmux_protocol::{
    ClientError, ClientResult, CommEvent, CommId, Directive, KernelId, KernelMessage,
    TransportCommand,
};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::connection::ServerConnection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommState {
    Stopped,
    Starting,
    Started,
}

/// One kernel's view of a shared [`ServerConnection`].
pub struct KernelCommFilter {
    id: CommId,
    connection: Arc<ServerConnection>,
    kernel_id: KernelId,
    state: Mutex<CommState>,
    events: Publisher<CommEvent>,
    messages: Publisher<KernelMessage>,
}

impl KernelCommFilter {
    pub fn new(connection: Arc<ServerConnection>, kernel_id: KernelId) -> Arc<Self> {
        Arc::new(Self {
            id: CommId::new_uuid(),
            connection,
            kernel_id,
            state: Mutex::new(CommState::Stopped),
            events: Publisher::passthrough(),
            messages: Publisher::passthrough(),
        })
    }

    pub fn id(&self) -> &CommId {
        &self.id
    }

    pub fn kernel_id(&self) -> &KernelId {
        &self.kernel_id
    }

    pub fn display_id(&self) -> &str {
        self.kernel_id.display_id()
    }

    pub fn connection(&self) -> &Arc<ServerConnection> {
        &self.connection
    }

    pub fn state(&self) -> CommState {
        *self.state.lock()
    }

    /// Every event forwarded for this kernel, including error statuses.
    pub fn events(&self) -> &Publisher<CommEvent> {
        &self.events
    }

    pub fn messages(&self) -> &Publisher<KernelMessage> {
        &self.messages
    }

    #[instrument(skip(self), fields(kernel = %self.display_id()))]
    pub async fn start(self: &Arc<Self>) -> ClientResult<()> {
        {
            let mut state = self.state.lock();
            if *state != CommState::Stopped {
                return Ok(());
            }
            *state = CommState::Starting;
        }

        let result = match self.connection.start().await {
            Ok(()) => self.connection.connect_client(self).await,
            Err(error) => Err(error),
        };
        let result = result.and_then(|()| self.confirm_started());
        match result {
            Ok(()) => {
                info!("comm started");
                Ok(())
            }
            Err(error) => {
                *self.state.lock() = CommState::Stopped;
                warn!(%error, "comm failed to start");
                Err(error)
            }
        }
    }

    /// `Starting` becomes `Started` only if nothing stopped the filter while
    /// it waited for its channels.
    fn confirm_started(&self) -> ClientResult<()> {
        let mut state = self.state.lock();
        if *state == CommState::Starting && self.connection.is_attached(&self.id) {
            *state = CommState::Started;
            return Ok(());
        }
        drop(state);
        self.connection.disconnect_client(&self.id);
        Err(ClientError::ConnectionUnavailable(format!(
            "kernel {} was disconnected while connecting",
            self.kernel_id
        )))
    }

    pub fn stop(&self) {
        self.connection.disconnect_client(&self.id);
        let previous = std::mem::replace(&mut *self.state.lock(), CommState::Stopped);
        if previous != CommState::Stopped {
            debug!(kernel = %self.display_id(), "comm stopped");
        }
    }

    /// Connected on the server side and attached locally. Both are checked
    /// because the two can disagree briefly.
    pub fn alive(&self) -> bool {
        self.connection.is_kernel_connected(&self.kernel_id)
            && self.connection.is_attached(&self.id)
    }

    pub async fn send(&self, directive: Directive) -> ClientResult<()> {
        self.connection
            .send(TransportCommand {
                kernel_id: self.kernel_id.clone(),
                directive,
            })
            .await
    }

    pub(crate) fn handle_event(&self, event: CommEvent) {
        if let CommEvent::Error { status, reason } = &event {
            warn!(kernel = %self.display_id(), status, %reason, "transport reported an error");
        }
        self.events.publish(event.clone());
        if let CommEvent::Message(message) = event {
            self.messages.publish(message);
        }
    }
}

impl fmt::Debug for KernelCommFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelCommFilter")
            .field("id", &self.id)
            .field("kernel", &self.display_id())
            .field("state", &self.state())
            .finish()
    }
}
