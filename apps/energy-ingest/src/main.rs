mod cli;
mod config;
mod mqtt;
mod normalize;
mod pipeline;
mod reading;
mod sink;
mod topic;

use crate::cli::Args;
use crate::config::Config;
use crate::pipeline::Pipeline;
use crate::sink::{DocumentSink, QueuedSink, RemoteSink, Sink, TabularSink};
use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const CLOSE_GRACE: Duration = Duration::from_secs(2);

fn init_tracing() -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,energy_ingest=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let name = tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    };
    Ok(name)
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}

/// Opens sinks in their fixed order: CSV, document store, remote.
async fn build_sinks(config: &Config, cancel: &CancellationToken) -> Result<Vec<Arc<dyn Sink>>> {
    let mut sinks: Vec<Arc<dyn Sink>> = Vec::new();

    if let Some(tabular) = &config.tabular {
        let sink = TabularSink::open(&tabular.path)
            .with_context(|| format!("failed to open CSV output {}", tabular.path.display()))?;
        tracing::info!(path=%sink.path().display(), "CSV sink enabled");
        sinks.push(Arc::new(sink));
    }

    if let Some(document) = &config.document {
        let sink = DocumentSink::connect(&document.uri, &document.database, &document.collection)
            .await
            .context("cannot reach MongoDB")?;
        sinks.push(Arc::new(sink));
    }

    if let Some(remote) = &config.remote {
        let inner = RemoteSink::new(&remote.base_url, &remote.table, remote.api_key.clone(), remote.timeout)
            .context("failed to build remote store client")?;
        tracing::info!(
            endpoint = inner.endpoint(),
            queue = remote.queue.capacity,
            "remote sink enabled"
        );
        sinks.push(Arc::new(QueuedSink::spawn(
            Arc::new(inner),
            remote.queue.clone(),
            cancel,
        )));
    }

    Ok(sinks)
}

#[tokio::main]
async fn main() -> Result<()> {
    mqtt::install_crypto_provider();
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_tracing()?;

    let config = Config::from_args(args).context("invalid configuration")?;
    let cancel = CancellationToken::new();

    let sinks = build_sinks(&config, &cancel).await?;
    let pipeline = Pipeline::new(sinks);
    tracing::info!(sinks = ?pipeline.sink_names(), "pipeline ready");

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(signal) => {
                tracing::info!(signal, "shutdown signal received");
                signal_cancel.cancel();
            }
            Err(err) => tracing::error!(error=%err, "failed to install signal handlers"),
        }
    });

    let result = mqtt::run_listener(config.mqtt.clone(), pipeline.clone(), cancel.clone()).await;
    if let Err(err) = &result {
        tracing::error!(error=%err, "MQTT listener exited");
    }

    cancel.cancel();
    let close_budget = config.drain_timeout + CLOSE_GRACE;
    if tokio::time::timeout(close_budget, pipeline.close()).await.is_err() {
        tracing::warn!(budget_ms = close_budget.as_millis() as u64, "sinks did not close in time");
    }
    pipeline.stats().log_summary();
    tracing::info!("shutdown complete");

    result
}
