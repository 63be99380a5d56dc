//! In-process transport.
//!
//! Every launch hands the far end of the transport to the test or embedding
//! host as a [`LoopbackPeer`]: it receives the commands the client sends and
//! injects the events a real multiplexing transport would produce.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use kmux_protocol::{
    ClientError, ClientResult, Directive, KernelId, KernelMessage, LaunchedTransport, Transport,
    TransportCommand, TransportConfig, TransportEvent, TransportEventKind, TransportLauncher,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

pub struct LoopbackLauncher {
    peers: mpsc::UnboundedSender<LoopbackPeer>,
}

impl LoopbackLauncher {
    /// A launcher and the receiver of the peer created by each launch.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LoopbackPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (Self { peers }, rx)
    }
}

#[async_trait]
impl TransportLauncher for LoopbackLauncher {
    async fn launch(&self, config: TransportConfig) -> ClientResult<LaunchedTransport> {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer.max(1));
        let alive = Arc::new(AtomicBool::new(true));

        let transport = Arc::new(LoopbackTransport {
            commands: commands_tx,
            alive: Arc::clone(&alive),
        });
        let peer = LoopbackPeer {
            config,
            commands: commands_rx,
            events: Mutex::new(Some(events_tx)),
            alive,
        };
        self.peers
            .send(peer)
            .map_err(|_| ClientError::Transport("loopback host is gone".to_owned()))?;
        debug!("loopback transport launched");

        Ok(LaunchedTransport {
            transport,
            events: events_rx,
        })
    }
}

struct LoopbackTransport {
    commands: mpsc::UnboundedSender<TransportCommand>,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, command: TransportCommand) -> ClientResult<()> {
        if !self.is_alive() {
            return Err(ClientError::Transport("loopback transport stopped".to_owned()));
        }
        self.commands
            .send(command)
            .map_err(|_| ClientError::Transport("loopback peer dropped".to_owned()))
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.commands.is_closed()
    }

    async fn stop(&self) -> ClientResult<()> {
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// The far end of a loopback transport.
pub struct LoopbackPeer {
    config: TransportConfig,
    commands: mpsc::UnboundedReceiver<TransportCommand>,
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    alive: Arc<AtomicBool>,
}

impl LoopbackPeer {
    /// The config the transport was launched with, headers included.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn is_stopped(&self) -> bool {
        !self.alive.load(Ordering::SeqCst)
    }

    pub async fn recv(&mut self) -> Option<TransportCommand> {
        self.commands.recv().await
    }

    pub async fn emit(&self, event: TransportEvent) -> ClientResult<()> {
        let events = self.events.lock().clone();
        let Some(events) = events else {
            return Err(ClientError::Transport("loopback event stream closed".to_owned()));
        };
        events
            .send(event)
            .await
            .map_err(|_| ClientError::Transport("loopback connection dropped".to_owned()))
    }

    pub async fn emit_message(
        &self,
        kernel_id: &KernelId,
        message: KernelMessage,
    ) -> ClientResult<()> {
        self.emit(TransportEvent::message(kernel_id.clone(), message)).await
    }

    /// Marks the transport dead while the event stream stays open, as a
    /// process with a broken stdin would.
    pub fn sever_commands(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Ends the event stream, as a transport process exiting would.
    pub fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.events.lock().take();
    }

    /// Answers commands until the client side goes away.
    ///
    /// `connect-channels` and `disconnect-channels` are confirmed for any
    /// kernel. Each `send` is passed to `respond`, whose events are emitted
    /// in order.
    pub async fn serve<F>(mut self, mut respond: F)
    where
        F: FnMut(&KernelId, &Directive) -> Vec<TransportEvent> + Send,
    {
        while let Some(TransportCommand { kernel_id, directive }) = self.recv().await {
            let events = match &directive {
                Directive::ConnectChannels => vec![TransportEvent::new(
                    kernel_id.clone(),
                    TransportEventKind::ConnectChannels,
                )],
                Directive::DisconnectChannels => vec![TransportEvent::new(
                    kernel_id.clone(),
                    TransportEventKind::DisconnectChannels,
                )],
                Directive::Send { .. } => respond(&kernel_id, &directive),
            };
            for event in events {
                if self.emit(event).await.is_err() {
                    return;
                }
            }
        }
    }
}
