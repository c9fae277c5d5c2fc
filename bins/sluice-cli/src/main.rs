//! # Sluice - Log/Event Ingestion Daemon
//!
//! Loads a YAML pipeline configuration, starts every configured consumer
//! with its filter chain, and routes accepted messages through the
//! bounded router channel.
//!
//! ## Usage
//!
//! ```bash
//! # Run a pipeline from a YAML configuration file
//! sluice --config pipelines/edge.yml
//!
//! # Expose Prometheus metrics
//! sluice --config pipelines/edge.yml --metrics-addr 127.0.0.1:9102
//!
//! # Enable debug logging
//! RUST_LOG=debug sluice --config pipelines/edge.yml
//! ```
//!
//! ## Signals
//!
//! - SIGINT / SIGTERM: stop every consumer, wait up to
//!   `--shutdown-timeout-sec`, then force the exit.
//! - SIGHUP: send Roll to every consumer (the file consumer re-opens
//!   rotated targets).

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use sluice_core::{
    control_channel, Control, ControlHandle, Dispatcher, PipelineConfig, Runtime,
    DEFAULT_CHANNEL_CAPACITY, DEFAULT_RETRY_CAPACITY,
};
use sluice_io::sink_stdout::StdoutSink;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for the daemon
#[derive(Parser, Debug)]
#[command(name = "sluice")]
#[command(about = "Multi-source log/event ingestion and routing daemon")]
struct Args {
    /// Pipeline YAML configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Router channel capacity; senders block when it is full
    #[arg(long, default_value_t = DEFAULT_CHANNEL_CAPACITY)]
    channel_capacity: usize,

    /// Retry queue capacity
    #[arg(long, default_value_t = DEFAULT_RETRY_CAPACITY)]
    retry_capacity: usize,

    /// Bounded wait for consumers to finish on shutdown
    #[arg(long, default_value_t = 10)]
    shutdown_timeout_sec: u64,

    /// Expose Prometheus metrics on this address
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config: PipelineConfig = {
        let text = std::fs::read_to_string(&args.config)
            .with_context(|| format!("read {}", args.config.display()))?;
        serde_yaml::from_str(&text).context("parse pipeline configuration")?
    };
    info!(pipeline = %config.name, consumers = config.consumers.len(), "configuration loaded");

    if let Some(addr) = args.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("install metrics exporter")?;
        info!(%addr, "metrics exporter listening");
    }

    let runtime = Runtime::new(args.retry_capacity);
    let (router_tx, router_rx) = mpsc::channel(args.channel_capacity.max(1));

    // Build everything before starting anything: configuration errors
    // are fatal up front.
    let mut ids = HashSet::new();
    let mut consumers = Vec::new();
    let mut handles: Vec<(String, ControlHandle)> = Vec::new();
    for spec in &config.consumers {
        let common = spec.common();
        if !ids.insert(common.id.clone()) {
            anyhow::bail!("duplicate consumer id {:?}", common.id);
        }
        let source = sluice_io::create_consumer(spec)
            .with_context(|| format!("consumer {:?}", common.id))?;
        let filters = sluice_tx::create_chain(&common.filters, &runtime)
            .with_context(|| format!("filters of consumer {:?}", common.id))?;
        let out = Dispatcher::new(
            &common.id,
            &common.streams,
            filters,
            router_tx.clone(),
            runtime.clone(),
            common.set_metadata,
        );
        let (handle, slot) = control_channel();
        handles.push((common.id.clone(), handle));
        consumers.push((source, out, slot));
    }
    drop(router_tx);

    let workers = TaskTracker::new();
    for (mut source, out, slot) in consumers {
        let cancel = runtime.shutdown_token();
        workers.spawn(async move {
            let name = source.name().to_string();
            if let Err(err) = source.run(out, slot, cancel).await {
                error!(consumer = %name, error = ?err, "consumer failed");
            } else {
                info!(consumer = %name, "consumer finished");
            }
        });
    }
    workers.close();

    // The sink outlives the consumers so late messages still drain; it
    // is cancelled explicitly at the very end.
    let sink_cancel = tokio_util::sync::CancellationToken::new();
    let sink = tokio::spawn(StdoutSink::new(runtime.clone()).run(router_rx, sink_cancel.clone()));

    let mut sighup = signal::unix::signal(signal::unix::SignalKind::hangup())
        .context("install SIGHUP handler")?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("install SIGTERM handler")?;
    let shutdown_token = runtime.shutdown_token();
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("termination requested, shutting down");
                break;
            }
            _ = sighup.recv() => {
                info!("hangup received, rolling consumers");
                for (_, handle) in &handles {
                    handle.signal(Control::Roll);
                }
            }
            _ = shutdown_token.cancelled() => {
                info!("shutdown requested from within the pipeline");
                break;
            }
            _ = workers.wait() => {
                info!("all consumers finished");
                break;
            }
        }
    }

    for (id, handle) in &handles {
        tracing::debug!(consumer = %id, "sending stop");
        handle.signal(Control::Stop);
    }
    let grace = Duration::from_secs(args.shutdown_timeout_sec.max(1));
    if tokio::time::timeout(grace, workers.wait()).await.is_err() {
        warn!(timeout_sec = args.shutdown_timeout_sec, "consumers still busy, forcing exit");
        runtime.request_shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(2), workers.wait()).await;
    }

    // Let the sink drain whatever the consumers committed, then stop it.
    sink_cancel.cancel();
    let _ = sink.await;
    info!("shutdown complete");
    Ok(())
}
