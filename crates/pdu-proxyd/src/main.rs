mod cipher;
mod cli;
mod codec;
mod config;
mod framed;
mod listener;
mod trace;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use pdu_proxy::Filter;
use tokio::net::TcpListener;
use tracing::info;

use crate::cli::Cli;
use crate::codec::PduCodec;
use crate::listener::{Proxy, ProxyConfig};
use crate::trace::TrafficTrace;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Parse CLI args.
    let cli = Cli::parse();

    // 2. Load config, then merge CLI overrides.
    let mut cfg = config::load(&cli.config)?;

    if let Some(ref listen) = cli.listen {
        cfg.network.listen_addr = listen.clone();
    }
    if let Some(ref upstream) = cli.upstream {
        cfg.network.upstream_addr = upstream.clone();
    }
    if let Some(ref level) = cli.log_level {
        cfg.logging.level = level.clone();
    }

    // 3. Init tracing-subscriber with JSON format.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.level));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    info!(
        config_file = %cli.config.display(),
        listen = %cfg.network.listen_addr,
        upstream = %cfg.network.upstream_addr,
        version = env!("CARGO_PKG_VERSION"),
        "pdu-proxyd starting"
    );

    // 4. Resolve addresses and build the per-session setup.
    let upstream_addr: std::net::SocketAddr = cfg
        .network
        .upstream_addr
        .parse()
        .context("invalid upstream address")?;

    let filters: Vec<Arc<dyn Filter>> = vec![Arc::new(TrafficTrace)];
    info!(
        max_frame_len = cfg.framing.max_frame_len,
        shutdown_timeout_ms = cfg.session.shutdown_timeout_ms,
        handshake_timeout_ms = ?cfg.session.handshake_timeout_ms,
        filters = filters.len(),
        "session settings loaded"
    );

    let proxy = Proxy::new(ProxyConfig {
        upstream_addr,
        codec: PduCodec::new(cfg.framing.max_frame_len),
        session: cfg.session,
        exchange: cfg.handshake.exchange(),
        filters,
    });

    // 5. Set up shutdown signal (ctrl_c + SIGTERM).
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to register SIGTERM handler")?;

    let shutdown_tx_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            tokio::select! {
                _ = ctrl_c => {
                    info!("received SIGINT (ctrl-c)");
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM");
                }
            }
        }

        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("received SIGINT (ctrl-c)");
        }

        let _ = shutdown_tx_signal.send(());
    });

    // 6. Bind and serve until shutdown.
    let listener = TcpListener::bind(&cfg.network.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.network.listen_addr))?;

    proxy
        .run(listener, shutdown_tx)
        .await
        .context("proxy terminated")?;

    info!("pdu-proxyd stopped");
    Ok(())
}
