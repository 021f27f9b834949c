//! NKN elevation forwarder: a bidirectional gateway between overlay DMs
//! and a local OpenTopoData-compatible elevation service.

pub use anyhow::Result;
use anyhow::{format_err, Context};
use clap::Parser;
use metrics::describe_counter;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::{
    fmt::{format::FmtSpan, Subscriber},
    prelude::*,
    EnvFilter,
};

mod chunks;
mod config;
mod dispatch;
mod elevation;
mod errors;
mod geohash;
mod locations;
mod outbound;
mod pending;
mod rate_limit;
mod repack;
mod seed;
mod server;
mod sidecar;
mod wire;

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::elevation::HttpElevationSource;
use crate::errors::fatal_report;
use crate::outbound::{spawn_sender, CommandSink, SendQueue};
use crate::pending::PendingRegistry;
use crate::rate_limit::RateGuard;
use crate::server::AppState;
use crate::sidecar::Sidecar;

#[cfg(all(feature = "jemallocator", not(target_env = "msvc")))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

/// Our command-line arguments. Everything else is environment-driven; see
/// `config.rs`.
#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "forward elevation queries between NKN DMs and a local OpenTopoData service"
)]
struct Opt {
    /// A .env file to load before reading configuration.
    #[arg(long = "env-file", default_value = ".env")]
    env_file: PathBuf,

    /// Override FORWARD_BIND.
    #[arg(long = "bind")]
    bind: Option<String>,

    /// Override FORWARD_PORT.
    #[arg(long = "port")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{}", fatal_report(&err));
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let opt = Opt::parse();
    let _ = dotenv::from_path(&opt.env_file);

    // Configure tracing.
    let filter = EnvFilter::from_default_env();
    Subscriber::builder()
        .with_writer(std::io::stderr)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_env_filter(filter)
        .finish()
        .init();
    debug!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    let mut config = Config::from_env()?;
    if let Some(bind) = opt.bind {
        config.forward_bind = bind;
    }
    if let Some(port) = opt.port {
        config.forward_port = port;
    }

    // Describe our global metrics. No recorder is installed by default;
    // embedders that want them can install one before this point.
    describe_counter!("forwarder.dms_received.total", "Inbound DMs dispatched");
    describe_counter!("forwarder.dms_sent.total", "Outbound DMs written to the sidecar");
    describe_counter!("forwarder.chunks_sent.total", "Reply body chunks emitted");
    describe_counter!(
        "forwarder.send_queue.backpressure.total",
        "Enqueue attempts that timed out on a full send queue"
    );

    // The overlay is only reachable through its Node SDK; without a `node`
    // binary there is nothing we can do.
    ensure_node_runtime().await?;

    // Resolve the identity seed before the sidecar launches so the overlay
    // address is stable across restarts.
    let seed = seed::ensure_seed(&config).await;
    let (sidecar, events) = Sidecar::start(&config, seed).await?;

    let (queue, send_rx) = SendQueue::new(config.nkn_send_queue_max);
    let sink: Arc<dyn CommandSink> = sidecar.clone();
    let _sender = spawn_sender(
        sink,
        send_rx,
        Duration::from_millis(config.nkn_send_delay_ms),
    );

    let pending = Arc::new(PendingRegistry::new());
    let elevation = Arc::new(HttpElevationSource::new(
        &config.elev_base,
        config.elev_timeout_ms,
        config.forward_concurrency,
    ));
    let dispatcher = Arc::new(Dispatcher {
        addr: sidecar.addr_handle(),
        pending: pending.clone(),
        queue: queue.clone(),
        elevation,
        default_dataset: config.elev_dataset.clone(),
        chunk_limit: config.dm_chunk_limit_bytes,
    });
    let _dispatch = dispatcher.spawn(events);

    let state = Arc::new(AppState {
        addr: sidecar.addr_handle(),
        queue,
        pending,
        guard: RateGuard::new(config.forward_rate_rps, config.forward_rate_burst),
        elev_base: config.elev_base.clone(),
        default_dataset: config.elev_dataset.clone(),
        forward_wait: Duration::from_millis(config.elev_timeout_ms)
            + Duration::from_secs(5),
    });

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutting down");
    };
    let result = server::run_server(&config, state, shutdown).await;

    // Best-effort polite shutdown; the sidecar exits on `close`.
    sidecar.close().await;
    result
}

/// Fail fast when the Node runtime is missing.
async fn ensure_node_runtime() -> Result<()> {
    let status = tokio::process::Command::new("node")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .context("Node.js is required (not found on PATH)")?;
    if !status.success() {
        return Err(format_err!("node --version failed: {}", status));
    }
    Ok(())
}
