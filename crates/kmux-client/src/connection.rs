//! The connection multiplexer.
//!
//! A [`ServerConnection`] owns the one transport of an endpoint and the set
//! of kernel ids whose channels the transport reports as connected. Comm
//! filters attach to it; transport events are dispatched to the filters of
//! the kernel they name by a single dispatch task per transport.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use kmux_protocol::{
    AuthProvider, ClientError, ClientResult, CommEvent, CommId, Directive, Endpoint, KernelId,
    LaunchedTransport, Transport, TransportCommand, TransportConfig, TransportEvent,
    TransportEventKind, TransportLauncher,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::comm::KernelCommFilter;
use crate::config::ClientConfig;

/// What the current transport reports. `generation` names the transport
/// the rest belongs to; `open` drops to false once its event stream ends.
#[derive(Debug, Clone, Default)]
struct Links {
    generation: u64,
    open: bool,
    kernels: BTreeSet<KernelId>,
}

pub struct ServerConnection {
    endpoint: Endpoint,
    launcher: Arc<dyn TransportLauncher>,
    auth: Arc<dyn AuthProvider>,
    config: ClientConfig,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    links: watch::Sender<Links>,
    attached: Mutex<Vec<Arc<KernelCommFilter>>>,
    start_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl ServerConnection {
    pub fn new(
        endpoint: Endpoint,
        launcher: Arc<dyn TransportLauncher>,
        auth: Arc<dyn AuthProvider>,
        config: ClientConfig,
    ) -> Arc<Self> {
        let (links, _) = watch::channel(Links::default());
        Arc::new(Self {
            endpoint,
            launcher,
            auth,
            config,
            transport: Mutex::new(None),
            links,
            attached: Mutex::new(Vec::new()),
            start_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// True while the transport process is running.
    pub fn is_alive(&self) -> bool {
        self.transport
            .lock()
            .as_ref()
            .is_some_and(|transport| transport.is_alive())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_kernel_connected(&self, kernel_id: &KernelId) -> bool {
        self.is_alive() && self.links.borrow().kernels.contains(kernel_id)
    }

    pub fn active_kernel_ids(&self) -> BTreeSet<KernelId> {
        self.links.borrow().kernels.clone()
    }

    pub fn is_attached(&self, comm_id: &CommId) -> bool {
        self.attached.lock().iter().any(|filter| filter.id() == comm_id)
    }

    pub fn attached_count(&self) -> usize {
        self.attached.lock().len()
    }

    fn generation(&self) -> u64 {
        self.links.borrow().generation
    }

    /// Launches the transport unless one is already running. Filters still
    /// attached to a previous, dead transport are stopped first so they can
    /// be started again on the new one.
    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    pub async fn start(self: &Arc<Self>) -> ClientResult<()> {
        let _guard = self.start_lock.lock().await;
        if self.is_closed() {
            return Err(ClientError::ConnectionUnavailable(format!(
                "connection to {} was shut down",
                self.endpoint
            )));
        }
        if self.is_alive() {
            return Ok(());
        }

        self.auth.persist().await?;
        let headers = self.auth.headers(&self.endpoint).await?;
        let LaunchedTransport { transport, events } = self
            .launcher
            .launch(TransportConfig {
                endpoint: self.endpoint.clone(),
                headers,
                event_buffer: self.config.event_buffer,
            })
            .await?;

        let (generation, previous, stale) = {
            let mut slot = self.transport.lock();
            let previous = slot.replace(transport);
            (self.reset(true), previous, self.detach_all())
        };
        if !stale.is_empty() {
            warn!(filters = stale.len(), "stopping filters of the replaced transport");
        }
        for filter in stale {
            filter.stop();
        }
        if let Some(previous) = previous {
            if let Err(error) = previous.stop().await {
                debug!(%error, "replaced transport did not stop cleanly");
            }
        }

        self.spawn_dispatch(generation, events);
        info!(generation, "transport started");
        Ok(())
    }

    /// Moves to a new generation with no connected kernels. Called with the
    /// transport slot locked.
    fn reset(&self, open: bool) -> u64 {
        self.links.send_modify(|links| {
            links.generation += 1;
            links.open = open;
            links.kernels.clear();
        });
        self.generation()
    }

    fn detach_all(&self) -> Vec<Arc<KernelCommFilter>> {
        std::mem::take(&mut *self.attached.lock())
    }

    fn spawn_dispatch(
        self: &Arc<Self>,
        generation: u64,
        mut events: mpsc::Receiver<TransportEvent>,
    ) {
        let connection: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(connection) = connection.upgrade() else {
                    return;
                };
                if connection.generation() != generation {
                    return;
                }
                connection.dispatch(event);
            }
            if let Some(connection) = connection.upgrade() {
                connection.transport_closed(generation);
            }
        });
    }

    /// Routes one transport event. Runs on the dispatch task only.
    pub(crate) fn dispatch(&self, event: TransportEvent) {
        let TransportEvent { kernel_id, kind } = event;
        match kind {
            TransportEventKind::ConnectChannels => {
                self.links.send_modify(|links| {
                    links.kernels.insert(kernel_id.clone());
                });
                debug!(kernel = %kernel_id.display_id(), "channels connected");
            }
            TransportEventKind::DisconnectChannels => {
                self.links.send_modify(|links| {
                    links.kernels.remove(&kernel_id);
                });
                let filters = self.attached_for(&kernel_id);
                debug!(
                    kernel = %kernel_id.display_id(),
                    stopped = filters.len(),
                    "channels disconnected"
                );
                for filter in filters {
                    filter.stop();
                }
            }
            TransportEventKind::Message { message } => {
                self.forward(&kernel_id, CommEvent::Message(message));
            }
            TransportEventKind::Error { status, reason } => {
                self.forward(&kernel_id, CommEvent::Error { status, reason });
            }
        }
    }

    fn forward(&self, kernel_id: &KernelId, event: CommEvent) {
        let filters = self.attached_for(kernel_id);
        if filters.is_empty() {
            debug!(
                kernel = %kernel_id.display_id(),
                "event for kernel without attached filters"
            );
            return;
        }
        for filter in filters {
            filter.handle_event(event.clone());
        }
    }

    fn attached_for(&self, kernel_id: &KernelId) -> Vec<Arc<KernelCommFilter>> {
        self.attached
            .lock()
            .iter()
            .filter(|filter| filter.kernel_id() == kernel_id)
            .cloned()
            .collect()
    }

    fn transport_closed(&self, generation: u64) {
        let (lost, filters) = {
            let mut slot = self.transport.lock();
            if self.generation() != generation {
                return;
            }
            slot.take();
            let lost = self.links.borrow().kernels.len();
            self.links.send_modify(|links| {
                links.open = false;
                links.kernels.clear();
            });
            (lost, self.detach_all())
        };
        warn!(
            endpoint = %self.endpoint,
            kernels = lost,
            "transport event stream ended"
        );
        for filter in filters {
            filter.stop();
        }
    }

    /// Attaches `filter` and waits until the transport confirms its kernel's
    /// channels are connected. Fails early if the transport goes away first.
    #[instrument(skip(self, filter), fields(kernel = %filter.display_id()))]
    pub async fn connect_client(&self, filter: &Arc<KernelCommFilter>) -> ClientResult<()> {
        let kernel_id = filter.kernel_id().clone();
        let mut links = self.links.subscribe();
        let generation = links.borrow().generation;
        self.attach(filter);

        let command = TransportCommand {
            kernel_id: kernel_id.clone(),
            directive: Directive::ConnectChannels,
        };
        if let Err(error) = self.send(command).await {
            self.disconnect_client(filter.id());
            return Err(error);
        }

        let waited = self.config.connect_timeout;
        let settled = links.wait_for(|links| {
            links.kernels.contains(&kernel_id) || links.generation != generation || !links.open
        });
        let confirmed = timeout(waited, settled)
            .await
            .map(|links| links.is_ok_and(|links| links.kernels.contains(&kernel_id)));

        match confirmed {
            Ok(true) => {
                debug!("client connected");
                Ok(())
            }
            Ok(false) => {
                self.disconnect_client(filter.id());
                Err(ClientError::ConnectionUnavailable(format!(
                    "transport for {} closed before kernel {} connected",
                    self.endpoint, kernel_id
                )))
            }
            Err(_) => {
                self.disconnect_client(filter.id());
                warn!(?waited, "no connect-channels confirmation");
                Err(ClientError::ProtocolTimeout {
                    subject: format!("channels of kernel {kernel_id} to connect"),
                    waited,
                    request_id: None,
                })
            }
        }
    }

    fn attach(&self, filter: &Arc<KernelCommFilter>) {
        let mut attached = self.attached.lock();
        if !attached.iter().any(|existing| existing.id() == filter.id()) {
            attached.push(Arc::clone(filter));
        }
    }

    /// Detaches a filter. The shared transport keeps running.
    pub fn disconnect_client(&self, comm_id: &CommId) {
        self.attached.lock().retain(|filter| filter.id() != comm_id);
    }

    pub async fn send(&self, command: TransportCommand) -> ClientResult<()> {
        let transport = self.transport.lock().clone();
        match transport {
            Some(transport) if transport.is_alive() => {
                debug!(
                    kernel = %command.kernel_id.display_id(),
                    directive = command.directive.name(),
                    "sending to transport"
                );
                transport.send(command).await
            }
            _ => Err(ClientError::ConnectionUnavailable(format!(
                "no live transport for {}",
                self.endpoint
            ))),
        }
    }

    /// Stops the transport and detaches every filter. The connection cannot
    /// be started again afterwards.
    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    pub async fn shutdown(&self) -> ClientResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        let (transport, filters) = {
            let mut slot = self.transport.lock();
            self.reset(false);
            (slot.take(), self.detach_all())
        };
        for filter in filters {
            filter.stop();
        }

        if let Some(transport) = transport {
            transport.stop().await?;
        }
        info!("connection shut down");
        Ok(())
    }
}

impl fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConnection")
            .field("endpoint", &self.endpoint)
            .field("alive", &self.is_alive())
            .field("active", &self.active_kernel_ids())
            .field("attached", &self.attached_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::StreamExt;
    use kmux_protocol::{Channel, KernelMessage, MsgId, NoAuth, StaticHeaders};
    use kmux_transport::{LoopbackLauncher, LoopbackPeer};
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::comm::CommState;

    fn endpoint() -> Endpoint {
        Endpoint::new("http://localhost:8888", "ws://localhost:8888")
    }

    fn connection(
        config: ClientConfig,
    ) -> (Arc<ServerConnection>, UnboundedReceiver<LoopbackPeer>) {
        let (launcher, peers) = LoopbackLauncher::new();
        let connection =
            ServerConnection::new(endpoint(), Arc::new(launcher), Arc::new(NoAuth), config);
        (connection, peers)
    }

    async fn eventually(condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn echo_replies(kernel_id: &KernelId, directive: &Directive) -> Vec<TransportEvent> {
        match directive {
            Directive::Send { msg_id, msg_type, .. } => {
                let reply_type = msg_type.replace("_request", "_reply");
                vec![TransportEvent::message(
                    kernel_id.clone(),
                    KernelMessage::new(Channel::Shell, reply_type, json!({})).in_reply_to(msg_id),
                )]
            }
            _ => Vec::new(),
        }
    }

    #[tokio::test]
    async fn start_launches_one_transport() {
        let (connection, mut peers) = connection(ClientConfig::default());
        connection.start().await.unwrap();
        connection.start().await.unwrap();

        assert!(connection.is_alive());
        assert!(peers.recv().await.is_some());
        assert!(peers.try_recv().is_err());
    }

    #[tokio::test]
    async fn auth_headers_reach_the_transport() {
        let (launcher, mut peers) = LoopbackLauncher::new();
        let connection = ServerConnection::new(
            endpoint(),
            Arc::new(launcher),
            Arc::new(StaticHeaders::token("secret")),
            ClientConfig::default(),
        );
        connection.start().await.unwrap();
        let peer = peers.recv().await.unwrap();
        assert_eq!(
            peer.config().headers.get("Authorization").map(String::as_str),
            Some("token secret")
        );
        assert_eq!(peer.config().endpoint, endpoint());
    }

    #[tokio::test]
    async fn connect_client_waits_for_confirmation_and_routes_messages() {
        let (connection, mut peers) = connection(ClientConfig::default());
        let kernel = KernelId::from("kernel-a");
        let filter = KernelCommFilter::new(Arc::clone(&connection), kernel.clone());
        let other = KernelCommFilter::new(Arc::clone(&connection), KernelId::from("kernel-b"));

        let starting = {
            let filter = Arc::clone(&filter);
            tokio::spawn(async move { filter.start().await })
        };
        let peer = peers.recv().await.unwrap();
        tokio::spawn(peer.serve(echo_replies));
        starting.await.unwrap().unwrap();
        other.start().await.unwrap();

        assert_eq!(filter.state(), CommState::Started);
        assert!(filter.alive());
        assert!(connection.is_kernel_connected(&kernel));
        assert_eq!(connection.attached_count(), 2);

        let mut replies = filter.messages().stream();
        let mut elsewhere = other.messages().stream();
        let msg_id = MsgId::from("m-1");
        filter
            .send(Directive::Send {
                channel: Channel::Shell,
                msg_type: "kernel_info_request".to_owned(),
                content: json!({}),
                msg_id: msg_id.clone(),
            })
            .await
            .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(5), replies.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.msg_type, "kernel_info_reply");
        assert_eq!(reply.parent_id(), Some(&msg_id));
        assert!(
            tokio::time::timeout(Duration::from_millis(50), elsewhere.next())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn unconfirmed_connect_times_out_and_detaches() {
        let config = ClientConfig::new().connect_timeout(Duration::from_millis(40));
        let (connection, mut peers) = connection(config);
        let kernel = KernelId::from("silent-kernel");
        let filter = KernelCommFilter::new(Arc::clone(&connection), kernel.clone());

        let error = filter.start().await.unwrap_err();
        match error {
            ClientError::ProtocolTimeout { subject, request_id, .. } => {
                assert!(subject.contains(kernel.as_str()));
                assert!(request_id.is_none());
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(filter.state(), CommState::Stopped);
        assert!(!connection.is_attached(filter.id()));

        let mut peer = peers.recv().await.unwrap();
        let command = peer.recv().await.unwrap();
        assert_eq!(command.directive, Directive::ConnectChannels);
    }

    #[tokio::test]
    async fn disconnect_channels_stops_only_that_kernels_filters() {
        let (connection, mut peers) = connection(ClientConfig::default());
        let a = KernelCommFilter::new(Arc::clone(&connection), KernelId::from("kernel-a"));
        let b = KernelCommFilter::new(Arc::clone(&connection), KernelId::from("kernel-b"));

        connection.start().await.unwrap();
        let peer = peers.recv().await.unwrap();
        let peer = peer_serving_connects(peer);
        a.start().await.unwrap();
        b.start().await.unwrap();

        peer.send(TransportEvent::new(
            KernelId::from("kernel-a"),
            TransportEventKind::DisconnectChannels,
        ))
        .unwrap();

        eventually(|| a.state() == CommState::Stopped).await;
        assert!(!a.alive());
        assert!(!connection.is_kernel_connected(a.kernel_id()));
        assert_eq!(b.state(), CommState::Started);
        assert!(b.alive());
    }

    #[tokio::test]
    async fn error_events_are_republished_on_the_status_publisher() {
        let (connection, mut peers) = connection(ClientConfig::default());
        let filter = KernelCommFilter::new(Arc::clone(&connection), KernelId::from("kernel-a"));
        connection.start().await.unwrap();
        let peer = peer_serving_connects(peers.recv().await.unwrap());
        filter.start().await.unwrap();

        let mut events = filter.events().stream();
        peer.send(TransportEvent::new(
            KernelId::from("kernel-a"),
            TransportEventKind::Error {
                status: 1003,
                reason: "unsupported frame".to_owned(),
            },
        ))
        .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            CommEvent::Error {
                status: 1003,
                reason: "unsupported frame".to_owned()
            }
        );
    }

    #[tokio::test]
    async fn transport_exit_clears_active_kernels() {
        let (connection, mut peers) = connection(ClientConfig::default());
        let filter = KernelCommFilter::new(Arc::clone(&connection), KernelId::from("kernel-a"));
        connection.start().await.unwrap();
        let peer = peers.recv().await.unwrap();
        let handle = peer_serving_connects(peer);
        filter.start().await.unwrap();
        assert!(filter.alive());

        handle.close();
        eventually(|| connection.active_kernel_ids().is_empty()).await;
        eventually(|| filter.state() == CommState::Stopped).await;
        assert!(!connection.is_alive());

        connection.start().await.unwrap();
        assert!(connection.is_alive());
        assert!(peers.recv().await.is_some());
    }

    #[tokio::test]
    async fn shutdown_is_final() {
        let (connection, mut peers) = connection(ClientConfig::default());
        connection.start().await.unwrap();
        let peer = peers.recv().await.unwrap();

        connection.shutdown().await.unwrap();
        assert!(peer.is_stopped());
        assert!(connection.is_closed());
        assert!(!connection.is_alive());
        assert!(matches!(
            connection.start().await,
            Err(ClientError::ConnectionUnavailable(_))
        ));
        assert!(matches!(
            connection
                .send(TransportCommand {
                    kernel_id: KernelId::from("k"),
                    directive: Directive::ConnectChannels,
                })
                .await,
            Err(ClientError::ConnectionUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn connection_is_reported_only_after_confirmation() {
        let (connection, mut peers) = connection(ClientConfig::default());
        let kernel = KernelId::from("kernel-a");
        let filter = KernelCommFilter::new(Arc::clone(&connection), kernel.clone());

        let starting = {
            let filter = Arc::clone(&filter);
            tokio::spawn(async move { filter.start().await })
        };
        let mut peer = peers.recv().await.unwrap();
        let command = peer.recv().await.unwrap();
        assert_eq!(command.directive, Directive::ConnectChannels);
        assert!(connection.is_attached(filter.id()));
        assert!(!connection.is_kernel_connected(&kernel));
        assert_eq!(filter.state(), CommState::Starting);
        assert!(!filter.alive());

        peer.emit(TransportEvent::new(kernel.clone(), TransportEventKind::ConnectChannels))
            .await
            .unwrap();
        starting.await.unwrap().unwrap();
        assert!(connection.is_kernel_connected(&kernel));
        assert!(filter.alive());
    }

    #[tokio::test]
    async fn transport_exit_during_connect_fails_without_waiting_for_the_timeout() {
        let (connection, mut peers) = connection(ClientConfig::default());
        let filter = KernelCommFilter::new(Arc::clone(&connection), KernelId::from("kernel-a"));

        let starting = {
            let filter = Arc::clone(&filter);
            tokio::spawn(async move { filter.start().await })
        };
        let mut peer = peers.recv().await.unwrap();
        assert_eq!(peer.recv().await.unwrap().directive, Directive::ConnectChannels);
        peer.close();

        let result = tokio::time::timeout(Duration::from_secs(1), starting)
            .await
            .expect("start should settle once the transport exits")
            .unwrap();
        assert!(matches!(result, Err(ClientError::ConnectionUnavailable(_))));
        assert_eq!(filter.state(), CommState::Stopped);
        assert!(!connection.is_attached(filter.id()));
    }

    #[tokio::test]
    async fn confirmed_then_closed_transport_leaves_the_filter_stopped() {
        let (connection, mut peers) = connection(ClientConfig::default());
        let kernel = KernelId::from("kernel-a");
        let filter = KernelCommFilter::new(Arc::clone(&connection), kernel.clone());

        let starting = {
            let filter = Arc::clone(&filter);
            tokio::spawn(async move { filter.start().await })
        };
        let mut peer = peers.recv().await.unwrap();
        assert_eq!(peer.recv().await.unwrap().directive, Directive::ConnectChannels);
        peer.emit(TransportEvent::new(kernel, TransportEventKind::ConnectChannels))
            .await
            .unwrap();
        peer.close();

        let result = tokio::time::timeout(Duration::from_secs(1), starting)
            .await
            .expect("start should settle once the transport exits")
            .unwrap();
        assert!(!matches!(result, Err(ClientError::ProtocolTimeout { .. })));
        eventually(|| filter.state() == CommState::Stopped).await;
        assert!(!filter.alive());
    }

    #[tokio::test]
    async fn restarting_a_dead_transport_releases_its_filters() {
        let (connection, mut peers) = connection(ClientConfig::default());
        let kernel = KernelId::from("kernel-a");
        let filter = KernelCommFilter::new(Arc::clone(&connection), kernel.clone());

        let starting = {
            let filter = Arc::clone(&filter);
            tokio::spawn(async move { filter.start().await })
        };
        let mut first = peers.recv().await.unwrap();
        assert_eq!(first.recv().await.unwrap().directive, Directive::ConnectChannels);
        first
            .emit(TransportEvent::new(kernel.clone(), TransportEventKind::ConnectChannels))
            .await
            .unwrap();
        starting.await.unwrap().unwrap();

        // The old event stream stays open, so only the new start can notice.
        first.sever_commands();
        assert!(
            filter
                .send(Directive::Send {
                    channel: Channel::Shell,
                    msg_type: "kernel_info_request".to_owned(),
                    content: json!({}),
                    msg_id: MsgId::from("m-1"),
                })
                .await
                .is_err()
        );

        connection.start().await.unwrap();
        let second = peers.recv().await.unwrap();
        tokio::spawn(second.serve(echo_replies));
        assert_eq!(filter.state(), CommState::Stopped);
        assert!(!connection.is_attached(filter.id()));

        filter.start().await.unwrap();
        assert_eq!(filter.state(), CommState::Started);
        assert!(filter.alive());
        assert_eq!(connection.attached_count(), 1);
        drop(first);
    }

    #[tokio::test]
    async fn disconnect_while_starting_is_not_overridden_by_a_late_confirmation() {
        let (connection, mut peers) = connection(ClientConfig::default());
        let kernel = KernelId::from("kernel-a");
        let filter = KernelCommFilter::new(Arc::clone(&connection), kernel.clone());

        let starting = {
            let filter = Arc::clone(&filter);
            tokio::spawn(async move { filter.start().await })
        };
        let mut peer = peers.recv().await.unwrap();
        assert_eq!(peer.recv().await.unwrap().directive, Directive::ConnectChannels);
        peer.emit(TransportEvent::new(kernel.clone(), TransportEventKind::DisconnectChannels))
            .await
            .unwrap();
        eventually(|| !connection.is_attached(filter.id())).await;
        peer.emit(TransportEvent::new(kernel.clone(), TransportEventKind::ConnectChannels))
            .await
            .unwrap();

        let result = starting.await.unwrap();
        assert!(matches!(result, Err(ClientError::ConnectionUnavailable(_))));
        assert_eq!(filter.state(), CommState::Stopped);
        assert!(!connection.is_attached(filter.id()));
        assert!(!filter.alive());
    }

    /// Confirms every connect-channels command and lets the test inject
    /// further events through the returned handle.
    fn peer_serving_connects(peer: LoopbackPeer) -> PeerHandle {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<TransportEvent>();
        let (close_tx, mut close_rx) = tokio::sync::mpsc::unbounded_channel::<()>();
        let mut peer = peer;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    command = peer.recv() => {
                        let Some(command) = command else { return };
                        if command.directive == Directive::ConnectChannels {
                            let event = TransportEvent::new(
                                command.kernel_id,
                                TransportEventKind::ConnectChannels,
                            );
                            if peer.emit(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    injected = rx.recv() => {
                        let Some(event) = injected else { return };
                        if peer.emit(event).await.is_err() {
                            return;
                        }
                    }
                    _ = close_rx.recv() => {
                        peer.close();
                        return;
                    }
                }
            }
        });
        PeerHandle { events: tx, close: close_tx }
    }

    struct PeerHandle {
        events: tokio::sync::mpsc::UnboundedSender<TransportEvent>,
        close: tokio::sync::mpsc::UnboundedSender<()>,
    }

    impl PeerHandle {
        fn send(&self, event: TransportEvent) -> Result<(), String> {
            self.events.send(event).map_err(|error| error.to_string())
        }

        fn close(&self) {
            let _ = self.close.send(());
        }
    }
}
