#![forbid(unsafe_code)]

mod config;

use std::str::FromStr;

use anyhow::{Context, Result};
use clap::Parser;
use tether_kubehub::KubeFetcher;
use tether_reconcile::{handoff, Reconciler, ResyncTrigger};
use tether_sink::FileSink;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Cli, Settings};

fn init_tracing() {
    let env = std::env::var("TETHER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TETHER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid TETHER_METRICS_ADDR; expected host:port");
        }
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "unable to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c() => info!("Ctrl-C received"),
                    _ = term.recv() => info!("SIGTERM received"),
                }
            }
            Err(e) => {
                warn!(error = %e, "unable to listen for SIGTERM");
                ctrl_c().await;
                info!("Ctrl-C received");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c().await;
        info!("Ctrl-C received");
    }
}

fn spawn_signal_handler(cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        shutdown_signal().await;
        cancel.cancel();
    })
}

async fn run(settings: Settings) -> Result<()> {
    let client = tether_kubehub::client(settings.kubeconfig.as_deref()).await.context("loading kube credentials")?;
    let stream = tether_kubehub::subscribe(client.clone(), &settings.key).await.context("establishing change stream")?;
    let trigger = ResyncTrigger::new(settings.resync_period)?;

    let cancel = CancellationToken::new();
    let signals = spawn_signal_handler(cancel.clone());

    let (tx, rx) = handoff(settings.queue_cap);
    let adapter_cancel = cancel.child_token();
    let adapter = stream.spawn(tx, adapter_cancel.clone());

    let sink = FileSink::new(&settings.outfile, settings.write_mode);
    let mut reconciler = Reconciler::new(settings.reconciler_config(), KubeFetcher::new(client), sink);
    let res = reconciler.run(cancel, rx, trigger).await;

    // the reconciler may have failed without a cancellation; stop the watch either way
    adapter_cancel.cancel();
    if let Err(e) = adapter.await {
        warn!(error = %e, "change stream task failed");
    }
    signals.abort();

    res.context("reconciliation failed")?;
    info!(last_emitted_bytes = ?reconciler.last_emitted().map(str::len), "stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let settings = Settings::from_cli(&cli).context("invalid configuration")?;
    if cli.print_config {
        println!("{}", serde_json::to_string_pretty(&settings)?);
        return Ok(());
    }
    settings.log();
    run(settings).await
}
