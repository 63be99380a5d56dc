use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use kmux_client::{ClientConfig, ConnectionRegistry, KernelClient, KernelCommFilter};
use kmux_protocol::{Endpoint, KernelId, StaticHeaders};
use kmux_transport::ProcessTransportLauncher;
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "kmuxctl")]
#[command(about = "Send one request to a running kernel and print its replies as JSON lines")]
struct Cli {
    #[arg(long)]
    base_url: String,
    #[arg(long)]
    ws_url: String,
    #[arg(long)]
    kernel_id: String,
    /// Multiplexing transport program.
    #[arg(long)]
    transport: PathBuf,
    #[arg(long = "transport-arg", allow_hyphen_values = true)]
    transport_args: Vec<String>,
    /// Extra transport header, `name=value`. May be repeated.
    #[arg(long = "header", value_parser = parse_header)]
    headers: Vec<(String, String)>,
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    connect_timeout_secs: u64,
    /// Request message type, e.g. `kernel_info_request`.
    msg_type: String,
    /// Request content as a JSON object.
    #[arg(default_value = "{}")]
    content: String,
}

fn parse_header(raw: &str) -> Result<(String, String)> {
    let Some((name, value)) = raw.split_once('=') else {
        bail!("header must be name=value, got {raw:?}");
    };
    let name = name.trim();
    if name.is_empty() {
        bail!("header name is empty in {raw:?}");
    }
    Ok((name.to_owned(), value.to_owned()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();
    let content: Value =
        serde_json::from_str(&cli.content).context("request content is not valid JSON")?;
    if !content.is_object() {
        bail!("request content must be a JSON object");
    }

    let launcher = ProcessTransportLauncher::new(&cli.transport).args(cli.transport_args.clone());
    let headers: BTreeMap<String, String> = cli.headers.iter().cloned().collect();
    let registry = ConnectionRegistry::builder(Arc::new(launcher))
        .auth(Arc::new(StaticHeaders::new(headers)))
        .config(
            ClientConfig::new()
                .connect_timeout(Duration::from_secs(cli.connect_timeout_secs))
                .request_timeout(Duration::from_secs(cli.timeout_secs)),
        )
        .build();

    let endpoint = Endpoint::new(&cli.base_url, &cli.ws_url);
    let comm = KernelCommFilter::new(registry.connection(&endpoint), KernelId::from(cli.kernel_id));
    let outcome = run(&comm, &cli.msg_type, content).await;

    comm.stop();
    if let Err(error) = registry.shutdown_all().await {
        warn!(%error, "transport shutdown failed");
    }
    outcome
}

async fn run(comm: &Arc<KernelCommFilter>, msg_type: &str, content: Value) -> Result<()> {
    comm.start()
        .await
        .with_context(|| format!("failed to connect to kernel {}", comm.kernel_id()))?;
    let client = KernelClient::new(Arc::clone(comm));
    info!(kernel = %comm.display_id(), %msg_type, "sending request");

    let request = client
        .request(msg_type, content)
        .await
        .with_context(|| format!("{msg_type} failed"))?;

    let mut stdout = std::io::stdout().lock();
    for message in request.messages() {
        let line = serde_json::to_string(&message).context("failed to encode reply")?;
        writeln!(stdout, "{line}").context("failed to write reply")?;
    }
    info!(
        request_id = %request.id(),
        replies = request.message_count(),
        "request idle"
    );
    Ok(())
}
