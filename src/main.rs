//! netflow-collector standalone binary.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing_subscriber::EnvFilter;

use netflow_collector::config::{Cli, CollectorConfig, FlowProtocol, ListenerConfig};
use netflow_collector::connections::{Closer, ConnectionManager};
use netflow_collector::debugout;
use netflow_collector::handler::{
    BindConfig, BindHandler, IpfixHandler, NetflowV5Handler, SflowV5Handler,
};
use netflow_collector::metrics::CollectorMetrics;
use netflow_collector::record::Record;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_ansi(false)
        .init();
}

fn start_listener<H>(
    handler: H,
    listener: &ListenerConfig,
    connections: &Arc<ConnectionManager>,
) -> Result<()>
where
    H: BindHandler + Closer + 'static,
{
    let handler = Arc::new(handler);
    handler
        .listen(&listener.listen)
        .with_context(|| format!("failed to bind {}", listener.listen))?;
    let id = connections.add(handler.clone());
    handler
        .start(id)
        .with_context(|| format!("failed to start listener on {}", listener.listen))?;
    tracing::info!(
        handler = handler.name(),
        listen = %listener.listen,
        tag = %listener.tag,
        id,
        "listener started"
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    debugout::set_verbose(cli.verbose);

    let config = match CollectorConfig::load(&cli) {
        Ok(cfg) => cfg,
        Err(err) => {
            tracing::error!("failed to load configuration: {err:#}");
            std::process::exit(1);
        }
    };

    let (tx, mut rx) = mpsc::channel::<Record>(config.queue_size);
    let connections = Arc::new(ConnectionManager::new());
    let tasks = TaskTracker::new();
    let metrics = Arc::new(CollectorMetrics::default());

    // stand-in downstream sink: the real ingestion bus is wired up here
    let sink = tokio::spawn(async move {
        let mut forwarded: u64 = 0;
        while let Some(record) = rx.recv().await {
            forwarded += 1;
            debugout!(
                "{} byte record from {} tagged '{}'",
                record.data.len(),
                record.source,
                record.tag
            );
            if forwarded.is_multiple_of(10_000) {
                tracing::info!(forwarded, "records forwarded downstream");
            }
        }
        forwarded
    });

    for listener in &config.listeners {
        let bind = BindConfig {
            tag: listener.tag.clone(),
            channel: tx.clone(),
            tasks: tasks.clone(),
            ignore_timestamps: listener.ignore_timestamps,
            local_tz: listener.local_tz,
            session_dump_enabled: listener.session_dump,
            session_dump_interval: config.session_dump_interval,
            connections: Arc::clone(&connections),
            metrics: Arc::clone(&metrics),
        };

        let started = match listener.protocol {
            FlowProtocol::NetflowV5 => NetflowV5Handler::new(bind)
                .map_err(anyhow::Error::from)
                .and_then(|h| start_listener(h, listener, &connections)),
            FlowProtocol::Ipfix => IpfixHandler::new(bind)
                .map_err(anyhow::Error::from)
                .and_then(|h| start_listener(h, listener, &connections)),
            FlowProtocol::SflowV5 => SflowV5Handler::new(bind)
                .map_err(anyhow::Error::from)
                .and_then(|h| start_listener(h, listener, &connections)),
        };
        if let Err(err) = started {
            tracing::error!("failed to start listener: {err:#}");
            std::process::exit(1);
        }
    }
    drop(tx);

    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to wait for shutdown signal: {err}");
    }
    tracing::info!("shutting down");

    connections.close_all();
    tasks.close();
    tasks.wait().await;

    match sink.await {
        Ok(forwarded) => {
            let stats = metrics.snapshot();
            tracing::info!(
                forwarded,
                packets = stats.get("udp_packets_received").copied().unwrap_or(0),
                parse_errors = stats.get("parse_errors").copied().unwrap_or(0),
                "collector stopped"
            );
        }
        Err(err) if !err.is_cancelled() => {
            tracing::error!("sink task join error: {err}");
        }
        Err(_) => {}
    }
}
