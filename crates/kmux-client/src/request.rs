//! Request correlation.
//!
//! Every issued request gets a private publisher subscribed to the context's
//! message publisher. It only passes messages whose parent id is the
//! request's id, records them on the [`Request`], and cancels itself once the
//! kernel reports it went idle for that request. A request that timed out
//! cancels its correlator on the next message the context publishes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use kmux_bus::{Publisher, Transformed, filter_content};
use kmux_protocol::{Channel, ClientResult, Directive, KernelMessage, MsgId};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::client::KernelClient;
use crate::io::{Action, Bindable, Binding, bind, current_client, current_context};

struct RequestInner {
    id: MsgId,
    client: Option<KernelClient>,
    msg_type: String,
    content: Value,
    messages: Mutex<Vec<KernelMessage>>,
    idle: watch::Sender<bool>,
    timed_out: Mutex<Option<Duration>>,
}

/// An issued request and the replies correlated to it so far.
#[derive(Clone)]
pub struct Request {
    inner: Arc<RequestInner>,
}

impl Request {
    fn new(
        id: MsgId,
        client: Option<KernelClient>,
        msg_type: String,
        content: Value,
    ) -> Self {
        let (idle, _) = watch::channel(false);
        Self {
            inner: Arc::new(RequestInner {
                id,
                client,
                msg_type,
                content,
                messages: Mutex::new(Vec::new()),
                idle,
                timed_out: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &MsgId {
        &self.inner.id
    }

    pub fn client(&self) -> Option<&KernelClient> {
        self.inner.client.as_ref()
    }

    pub fn msg_type(&self) -> &str {
        &self.inner.msg_type
    }

    pub fn content(&self) -> &Value {
        &self.inner.content
    }

    /// Correlated messages in arrival order.
    pub fn messages(&self) -> Vec<KernelMessage> {
        self.inner.messages.lock().clone()
    }

    pub fn message_count(&self) -> usize {
        self.inner.messages.lock().len()
    }

    /// First shell-channel `*_reply` correlated to this request.
    pub fn reply(&self) -> Option<KernelMessage> {
        self.inner
            .messages
            .lock()
            .iter()
            .find(|message| {
                message.channel == Channel::Shell && message.msg_type.ends_with("_reply")
            })
            .cloned()
    }

    pub fn is_idle(&self) -> bool {
        *self.inner.idle.borrow()
    }

    pub fn is_timed_out(&self) -> bool {
        self.inner.timed_out.lock().is_some()
    }

    fn correlate(&self, message: KernelMessage) -> Transformed<KernelMessage> {
        if self.is_idle() || self.is_timed_out() {
            return Transformed::Unsubscribe;
        }
        if message.parent_id() != Some(&self.inner.id) {
            return Transformed::Skip;
        }

        self.inner.messages.lock().push(message.clone());
        if message.is_status_idle() {
            self.inner.idle.send_replace(true);
            debug!(request_id = %self.inner.id, msg_type = %self.inner.msg_type, "request idle");
            Transformed::EmitAndUnsubscribe(message)
        } else {
            Transformed::Emit(message)
        }
    }

    async fn wait_idle(&self, limit: Duration) -> bool {
        let mut idle = self.inner.idle.subscribe();
        matches!(
            timeout(limit, async move { idle.wait_for(|idle| *idle).await.is_ok() }).await,
            Ok(true)
        )
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.inner.id)
            .field("msg_type", &self.inner.msg_type)
            .field("messages", &self.message_count())
            .field("idle", &self.is_idle())
            .finish()
    }
}

impl Bindable for Request {
    fn binding(&self) -> Binding {
        if let Some(waited) = *self.inner.timed_out.lock() {
            return Binding::TimedOut {
                subject: format!("{} {} to become idle", self.inner.msg_type, self.inner.id),
                waited,
                request_id: self.inner.id.clone(),
            };
        }
        match &self.inner.client {
            Some(client) => Binding::Client(client.clone()),
            None => Binding::Value,
        }
    }
}

impl Bindable for (Request, Publisher<KernelMessage>) {
    fn binding(&self) -> Binding {
        self.0.binding()
    }
}

/// Sends a `msg_type` request through the current context.
///
/// The correlating publisher is subscribed before the request is sent, so
/// no reply can be missed, and removed again if sending fails. The action
/// yields the request together with the publisher of its replies.
pub fn issue(
    msg_type: impl Into<String>,
    content: Value,
) -> Action<(Request, Publisher<KernelMessage>)> {
    let msg_type = msg_type.into();
    Action::new(move || {
        let msg_type = msg_type.clone();
        let content = content.clone();
        async move {
            let context = current_context()?;
            let request = Request::new(
                MsgId::new_uuid(),
                current_client(),
                msg_type.clone(),
                content.clone(),
            );

            let correlated = request.clone();
            let replies = filter_content(context.messages(), move |message| {
                correlated.correlate(message)
            });

            let channel = Channel::for_request(&msg_type);
            debug!(request_id = %request.id(), %channel, %msg_type, "issuing request");
            let sent = context
                .handle(Directive::Send {
                    channel,
                    msg_type,
                    content,
                    msg_id: request.id().clone(),
                })
                .await;
            if let Err(error) = sent {
                context.messages().remove_publisher(&replies);
                debug!(request_id = %request.id(), %error, "request not sent");
                return Err(error);
            }
            Ok((request, replies))
        }
    })
}

/// Waits until `request` goes idle, at most `limit`.
///
/// Expiry is not an error here: the request is marked timed out and any
/// later [`bind`] on it fails with `ProtocolTimeout`. Replies arriving after
/// that are dropped.
pub fn wait_until_idle(request: Request, limit: Duration) -> Action<Request> {
    Action::new(move || {
        let request = request.clone();
        async move {
            if !request.wait_idle(limit).await {
                warn!(
                    request_id = %request.id(),
                    msg_type = %request.msg_type(),
                    waited = ?limit,
                    "request did not become idle"
                );
                *request.inner.timed_out.lock() = Some(limit);
            }
            Ok(request)
        }
    })
}

/// [`issue`] followed by [`wait_until_idle`].
pub fn issue_and_wait(
    msg_type: impl Into<String>,
    content: Value,
    limit: Duration,
) -> Action<Request> {
    bind(issue(msg_type, content), move |(request, _replies)| {
        wait_until_idle(request, limit)
    })
}

/// Runs `action` and fails if it yields a timed-out request.
pub async fn resolve(action: Action<Request>) -> ClientResult<Request> {
    bind(action, Action::once).run().await
}
