//! Deferred kernel I/O.
//!
//! An [`Action`] is a suspended computation. Building one performs no I/O;
//! only [`Action::run`] invokes its thunk, once per run. Actions are
//! composed with [`bind`] and [`sequence`] and evaluated against an
//! [`IoContext`] installed by [`with_context`].
//!
//! The ambient context and the ambient client live in task-local slots.
//! Each is installed for the extent of one future and restored when that
//! future completes or is dropped.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use kmux_bus::Publisher;
use kmux_protocol::{
    ClientError, ClientResult, Directive, KernelId, KernelMessage, KernelRecord, MsgId,
};
use parking_lot::Mutex;

use crate::client::KernelClient;

tokio::task_local! {
    static CURRENT_CONTEXT: IoContext;
    static CURRENT_CLIENT: Option<KernelClient>;
}

type Thunk<T> = dyn Fn() -> BoxFuture<'static, ClientResult<T>> + Send + Sync;

pub struct Action<T> {
    thunk: Arc<Thunk<T>>,
}

impl<T> Clone for Action<T> {
    fn clone(&self) -> Self {
        Self {
            thunk: Arc::clone(&self.thunk),
        }
    }
}

impl<T> fmt::Debug for Action<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action").finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Action<T> {
    pub fn new<F, Fut>(thunk: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ClientResult<T>> + Send + 'static,
    {
        Self {
            thunk: Arc::new(move || thunk().boxed()),
        }
    }

    pub fn from_fn<F>(thunk: F) -> Self
    where
        F: Fn() -> ClientResult<T> + Send + Sync + 'static,
    {
        Self::new(move || std::future::ready(thunk()))
    }

    /// An action yielding `value` on its first run and failing with
    /// [`ClientError::AlreadyEvaluated`] on any later run.
    pub fn once(value: T) -> Self {
        let slot = Arc::new(Mutex::new(Some(value)));
        Self::from_fn(move || slot.lock().take().ok_or(ClientError::AlreadyEvaluated))
    }

    pub async fn run(&self) -> ClientResult<T> {
        (self.thunk)().await
    }

    pub fn map<U, F>(self, f: F) -> Action<U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Action::new(move || {
            let this = self.clone();
            let f = Arc::clone(&f);
            async move { this.run().await.map(|value| f(value)) }
        })
    }

    pub fn and_then<U, K>(self, continuation: K) -> Action<U>
    where
        T: Bindable,
        U: Send + 'static,
        K: Fn(T) -> Action<U> + Send + Sync + 'static,
    {
        bind(self, continuation)
    }
}

/// An action yielding `value` with no effect.
pub fn pure<T>(value: T) -> Action<T>
where
    T: Clone + Send + Sync + 'static,
{
    Action::from_fn(move || Ok(value.clone()))
}

/// How [`bind`] treats a value before handing it to the continuation.
#[derive(Debug, Clone)]
pub enum Binding {
    Value,
    /// A live request issued by this client.
    Client(KernelClient),
    /// A request whose idle wait expired.
    TimedOut {
        subject: String,
        waited: Duration,
        request_id: MsgId,
    },
}

pub trait Bindable {
    fn binding(&self) -> Binding {
        Binding::Value
    }
}

macro_rules! plain_bindable {
    ($($ty:ty),* $(,)?) => {
        $(impl Bindable for $ty {})*
    };
}

plain_bindable!(
    (),
    bool,
    i32,
    i64,
    u32,
    u64,
    usize,
    f64,
    String,
    &'static str,
    serde_json::Value,
    KernelMessage,
    KernelId,
    KernelRecord,
    MsgId,
    KernelClient,
);

impl<T> Bindable for Vec<T> {}

impl<T> Bindable for Option<T> {}

/// Runs `action`, classifies its value, and continues with `continuation`.
///
/// A timed-out request fails the chain with [`ClientError::ProtocolTimeout`].
/// A live request bound to a client makes that client ambient while the
/// continuation's action runs.
pub fn bind<T, U, K>(action: Action<T>, continuation: K) -> Action<U>
where
    T: Bindable + Send + 'static,
    U: Send + 'static,
    K: Fn(T) -> Action<U> + Send + Sync + 'static,
{
    let continuation = Arc::new(continuation);
    Action::new(move || {
        let action = action.clone();
        let continuation = Arc::clone(&continuation);
        async move {
            let value = action.run().await?;
            match value.binding() {
                Binding::TimedOut {
                    subject,
                    waited,
                    request_id,
                } => Err(ClientError::ProtocolTimeout {
                    subject,
                    waited,
                    request_id: Some(request_id),
                }),
                Binding::Client(client) => {
                    CURRENT_CLIENT
                        .scope(Some(client), async move { continuation(value).run().await })
                        .await
                }
                Binding::Value => continuation(value).run().await,
            }
        }
    })
}

/// Runs `first`, discards its value, then runs `second`.
pub fn sequence<A, B>(first: Action<A>, second: Action<B>) -> Action<B>
where
    A: Send + 'static,
    B: Send + 'static,
{
    Action::new(move || {
        let first = first.clone();
        let second = second.clone();
        async move {
            first.run().await?;
            second.run().await
        }
    })
}

/// Evaluates `action` with `context` installed.
pub fn with_context<T>(context: IoContext, action: Action<T>) -> Action<T>
where
    T: Send + 'static,
{
    Action::new(move || {
        let context = context.clone();
        let action = action.clone();
        CURRENT_CONTEXT.scope(context, async move { action.run().await })
    })
}

/// Evaluates `action` with `client` as the ambient client.
pub fn with_client<T>(client: KernelClient, action: Action<T>) -> Action<T>
where
    T: Send + 'static,
{
    Action::new(move || {
        let client = client.clone();
        let action = action.clone();
        CURRENT_CLIENT.scope(Some(client), async move { action.run().await })
    })
}

/// Binds `action` under `context` and returns its value.
pub async fn run_with_context<T>(context: IoContext, action: Action<T>) -> ClientResult<T>
where
    T: Bindable + Send + 'static,
{
    bind(with_context(context, action), Action::once).run().await
}

pub fn current_context() -> ClientResult<IoContext> {
    CURRENT_CONTEXT
        .try_with(IoContext::clone)
        .map_err(|_| ClientError::MissingContext)
}

pub fn current_client() -> Option<KernelClient> {
    CURRENT_CLIENT.try_with(Option::clone).ok().flatten()
}

type Handler = dyn Fn(Directive) -> BoxFuture<'static, ClientResult<()>> + Send + Sync;

/// The execution context actions run against: where directives go, and
/// the publisher carrying every message of the kernel.
#[derive(Clone)]
pub struct IoContext {
    handler: Arc<Handler>,
    messages: Publisher<KernelMessage>,
}

impl IoContext {
    pub fn new<F, Fut>(handler: F, messages: Publisher<KernelMessage>) -> Self
    where
        F: Fn(Directive) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ClientResult<()>> + Send + 'static,
    {
        Self {
            handler: Arc::new(move |directive| handler(directive).boxed()),
            messages,
        }
    }

    pub async fn handle(&self, directive: Directive) -> ClientResult<()> {
        (self.handler)(directive).await
    }

    pub fn messages(&self) -> &Publisher<KernelMessage> {
        &self.messages
    }
}

impl fmt::Debug for IoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoContext")
            .field("messages", &self.messages)
            .finish_non_exhaustive()
    }
}
