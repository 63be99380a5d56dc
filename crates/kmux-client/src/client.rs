use std::fmt;
use std::sync::Arc;

use kmux_bus::Publisher;
use kmux_protocol::{ClientId, ClientResult, KernelId, KernelMessage};
use serde_json::Value;

use crate::comm::KernelCommFilter;
use crate::io::{Action, Bindable, IoContext, run_with_context, with_client};
use crate::request::{Request, issue, issue_and_wait};

/// A client handle attached to a kernel through a shared comm filter.
///
/// Handles are cheap to clone. Every handle created by one manager shares
/// the same [`KernelCommFilter`].
#[derive(Clone)]
pub struct KernelClient {
    id: ClientId,
    comm: Arc<KernelCommFilter>,
}

impl KernelClient {
    pub fn new(comm: Arc<KernelCommFilter>) -> Self {
        Self {
            id: ClientId::new_uuid(),
            comm,
        }
    }

    pub fn id(&self) -> &ClientId {
        &self.id
    }

    pub fn comm(&self) -> &Arc<KernelCommFilter> {
        &self.comm
    }

    pub fn kernel_id(&self) -> &KernelId {
        self.comm.kernel_id()
    }

    pub fn alive(&self) -> bool {
        self.comm.alive()
    }

    /// Every message the kernel sends, correlated or not.
    pub fn messages(&self) -> &Publisher<KernelMessage> {
        self.comm.messages()
    }

    /// Context routing directives through this client's comm filter.
    pub fn io(&self) -> IoContext {
        let comm = Arc::clone(&self.comm);
        IoContext::new(
            move |directive| {
                let comm = Arc::clone(&comm);
                async move { comm.send(directive).await }
            },
            self.comm.messages().clone(),
        )
    }

    /// Evaluates `action` with this client ambient and its context installed.
    pub async fn run<T>(&self, action: Action<T>) -> ClientResult<T>
    where
        T: Bindable + Send + 'static,
    {
        run_with_context(self.io(), with_client(self.clone(), action)).await
    }

    pub async fn send_request(
        &self,
        msg_type: impl Into<String>,
        content: Value,
    ) -> ClientResult<(Request, Publisher<KernelMessage>)> {
        self.run(issue(msg_type, content)).await
    }

    /// Sends a request and waits for it to go idle within the connection's
    /// configured request timeout.
    pub async fn request(
        &self,
        msg_type: impl Into<String>,
        content: Value,
    ) -> ClientResult<Request> {
        let limit = self.comm.connection().config().request_timeout;
        self.run(issue_and_wait(msg_type, content, limit)).await
    }
}

impl PartialEq for KernelClient {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl fmt::Debug for KernelClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelClient")
            .field("id", &self.id)
            .field("kernel", &self.comm.display_id())
            .finish()
    }
}
