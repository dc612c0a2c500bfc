use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use pdu_proxy::{Filter, HalfExchange, ProxySession, SessionConfig};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::codec::PduCodec;
use crate::framed::{FramedConnection, Role};

/// Pause after a failed `accept` so a persistent error (e.g. out of file
/// descriptors) does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Source of inbound client sockets.
#[async_trait]
trait Accept: Send + Sync {
    async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)>;
}

#[async_trait]
impl Accept for TcpListener {
    async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

/// Everything needed to turn an accepted socket into a session.
pub struct ProxyConfig {
    /// Address of the real game server.
    pub upstream_addr: SocketAddr,
    pub codec: PduCodec,
    pub session: SessionConfig,
    pub exchange: HalfExchange,
    /// Permanent filter chain, shared by every session.
    pub filters: Vec<Arc<dyn Filter>>,
}

/// Accepts client connections and proxies each one to the upstream server
/// in its own [`ProxySession`].
pub struct Proxy {
    config: Arc<ProxyConfig>,
}

impl Proxy {
    /// Create a new proxy with the given configuration.
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Accept connections until `shutdown` fires, then stop every live
    /// session and wait for them to finish.
    pub async fn run(
        &self,
        listener: TcpListener,
        shutdown: broadcast::Sender<()>,
    ) -> anyhow::Result<()> {
        info!(
            addr = %listener.local_addr()?,
            upstream = %self.config.upstream_addr,
            "pdu-proxyd listening"
        );
        self.serve(&listener, shutdown).await
    }

    async fn serve<A: Accept>(
        &self,
        listener: &A,
        shutdown: broadcast::Sender<()>,
    ) -> anyhow::Result<()> {
        let mut stop = shutdown.subscribe();
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!(%err, "accept failed; retrying");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                            continue;
                        }
                    };
                    let config = Arc::clone(&self.config);
                    let stop = shutdown.subscribe();

                    sessions.spawn(async move {
                        if let Err(err) = handle_connection(stream, remote_addr, config, stop).await {
                            error!(%remote_addr, err = %format!("{err:#}"), "connection handler error");
                        }
                    });
                }
                _ = stop.recv() => {
                    info!(live = sessions.len(), "shutdown requested; draining sessions");
                    break;
                }
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(err) = finished {
                        warn!(%err, "session task ended abnormally");
                    }
                }
            }
        }

        while let Some(finished) = sessions.join_next().await {
            if let Err(err) = finished {
                warn!(%err, "session task ended abnormally");
            }
        }
        info!("all sessions closed");
        Ok(())
    }
}

/// Dial the upstream server for one accepted client and run the session to
/// completion.
async fn handle_connection(
    client: TcpStream,
    remote_addr: SocketAddr,
    config: Arc<ProxyConfig>,
    mut stop: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let server = TcpStream::connect(config.upstream_addr)
        .await
        .with_context(|| format!("failed to connect upstream {}", config.upstream_addr))?;
    client.set_nodelay(true)?;
    server.set_nodelay(true)?;

    let client = FramedConnection::new(
        format!("client {remote_addr}"),
        Role::ClientFacing,
        client,
        config.codec,
    );
    let server = FramedConnection::new(
        format!("server {}", config.upstream_addr),
        Role::ServerFacing,
        server,
        config.codec,
    );

    let session = ProxySession::builder(Arc::new(client), Arc::new(server))
        .filters(config.filters.iter().cloned())
        .key_exchange(config.exchange.clone())
        .config(config.session.clone())
        .build();
    info!(
        session_id = %session.id(),
        %remote_addr,
        filters = ?session.chain(),
        shutdown_timeout_ms = session.config().shutdown_timeout_ms,
        "session accepted"
    );

    let watcher = session.clone();
    let stopper = tokio::spawn(async move {
        if stop.recv().await.is_ok() {
            debug!(session_id = %watcher.id(), "stopping session");
            watcher.shutdown();
        }
    });

    let report = session.run().await;
    stopper.abort();
    let report = report?;

    for direction in &report.directions {
        info!(
            session_id = %report.session_id,
            direction = %direction.direction,
            delivered = direction.delivered,
            dropped = direction.dropped,
            exit = ?direction.exit,
            "direction closed"
        );
    }
    info!(
        session_id = %report.session_id,
        state = ?report.state,
        duration_ms = (report.ended_at - report.started_at).num_milliseconds(),
        handshake_error = ?report.handshake_error,
        "session closed"
    );
    Ok(())
}
