//! Subprocess transport.
//!
//! The multiplexing transport runs as a child process that owns the kernel
//! websockets. Commands are written to its stdin and events read from its
//! stdout, one JSON object per line. Its stderr is forwarded to tracing.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use kmux_protocol::{
    ClientError, ClientResult, LaunchedTransport, Transport, TransportCommand, TransportConfig,
    TransportEvent, TransportLauncher,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, instrument, warn};

pub const BASE_URL_ENV: &str = "KMUX_BASE_URL";
pub const WS_URL_ENV: &str = "KMUX_WS_URL";
pub const HEADERS_ENV: &str = "KMUX_HEADERS";

#[derive(Debug, Clone)]
pub struct ProcessTransportLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessTransportLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    fn spawn(&self, config: &TransportConfig) -> Result<Child> {
        let headers =
            serde_json::to_string(&config.headers).context("failed to encode transport headers")?;
        Command::new(&self.program)
            .args(&self.args)
            .env(BASE_URL_ENV, &config.endpoint.base_url)
            .env(WS_URL_ENV, &config.endpoint.ws_url)
            .env(HEADERS_ENV, headers)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn transport {}", self.program.display()))
    }
}

#[async_trait]
impl TransportLauncher for ProcessTransportLauncher {
    #[instrument(
        skip(self, config),
        fields(program = %self.program.display(), endpoint = %config.endpoint)
    )]
    async fn launch(&self, config: TransportConfig) -> ClientResult<LaunchedTransport> {
        let mut child = self.spawn(&config).map_err(transport_error)?;
        let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (stdin, stdout, stderr) = match pipes {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                let _ = child.start_kill();
                return Err(ClientError::Transport(
                    "transport process has no piped stdio".to_owned(),
                ));
            }
        };
        info!(pid = child.id(), "transport process started");

        let alive = Arc::new(AtomicBool::new(true));
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer.max(1));
        tokio::spawn(read_events(stdout, events_tx, Arc::clone(&alive)));
        tokio::spawn(forward_stderr(stderr));

        Ok(LaunchedTransport {
            transport: Arc::new(ProcessTransport {
                stdin: Mutex::new(stdin),
                child: Mutex::new(child),
                alive,
            }),
            events: events_rx,
        })
    }
}

struct ProcessTransport {
    stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
    alive: Arc<AtomicBool>,
}

impl ProcessTransport {
    async fn write_line(&self, command: &TransportCommand) -> Result<()> {
        let mut line = serde_json::to_vec(command).context("failed to encode transport command")?;
        line.push(b'\n');
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(&line)
            .await
            .context("failed to write to transport stdin")?;
        stdin.flush().await.context("failed to flush transport stdin")?;
        Ok(())
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    async fn send(&self, command: TransportCommand) -> ClientResult<()> {
        if !self.is_alive() {
            return Err(ClientError::Transport("transport process exited".to_owned()));
        }
        self.write_line(&command).await.map_err(|error| {
            self.alive.store(false, Ordering::SeqCst);
            transport_error(error)
        })
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn stop(&self) -> ClientResult<()> {
        self.alive.store(false, Ordering::SeqCst);
        let mut child = self.child.lock().await;
        if child.try_wait().ok().flatten().is_some() {
            return Ok(());
        }
        child
            .kill()
            .await
            .context("failed to kill transport process")
            .map_err(transport_error)?;
        info!("transport process stopped");
        Ok(())
    }
}

async fn read_events(
    stdout: ChildStdout,
    events: mpsc::Sender<TransportEvent>,
    alive: Arc<AtomicBool>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<TransportEvent>(line) {
                    Ok(event) => {
                        if events.send(event).await.is_err() {
                            debug!("transport event receiver dropped");
                            break;
                        }
                    }
                    Err(error) => warn!(%error, line, "unparseable transport event"),
                }
            }
            Ok(None) => {
                debug!("transport stdout closed");
                break;
            }
            Err(error) => {
                warn!(%error, "failed to read transport stdout");
                break;
            }
        }
    }
    alive.store(false, Ordering::SeqCst);
}

async fn forward_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(target: "kmux_transport::stderr", "{line}");
    }
}

fn transport_error(error: anyhow::Error) -> ClientError {
    ClientError::Transport(format!("{error:#}"))
}
