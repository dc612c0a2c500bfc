//! Session orchestration.
//!
//! A [`ProxySession`] owns one client/server connection pair from the first
//! handshake byte until both relay directions have stopped:
//!
//! ```text
//! Init -> Handshake -> Relaying -> ClosedClean | ClosedError
//! ```
//!
//! The handshake relays exactly one unit each way through the permanent
//! chain with a fresh [`KeyCaptureFilter`] spliced in front. If a key comes
//! out of it both connections are rekeyed and one worker task per direction
//! takes over. If not, the session ends and nothing else is relayed.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::connection::Connection;
use crate::context::SessionContext;
use crate::error::{HandshakeError, RelayError, SessionError};
use crate::filter::{Filter, FilterChain, FilterContext};
use crate::key_capture::{HalfExchange, KeyCaptureFilter, KeyExchange, SessionKey};
use crate::message::Direction;
use crate::relay::{Forwarded, RelayLink};

tokio::task_local! {
    static CURRENT_SESSION: ProxySession;
}

/// Lifecycle of a session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Handshake,
    Relaying,
    ClosedClean,
    ClosedError,
}

impl SessionState {
    /// Whether the session has reached a terminal state.
    pub fn is_closed(self) -> bool {
        matches!(self, Self::ClosedClean | Self::ClosedError)
    }
}

/// Why a relay worker stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// The source connection closed.
    EndOfStream,
    /// Shutdown was requested.
    Shutdown,
    /// Reading or writing failed.
    Io(String),
    /// A filter returned an error.
    Failed(String),
    /// A filter (or the connection) panicked.
    Panicked(String),
    /// Still running when the drain timeout expired; left to finish on its own.
    Detached,
}

impl WorkerExit {
    /// Whether this exit counts towards a `ClosedError` session.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Failed(_) | Self::Panicked(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectionReport {
    pub direction: Direction,
    /// Name of the connection this direction read from.
    pub connection: String,
    pub delivered: u64,
    pub dropped: u64,
    pub exit: WorkerExit,
}

/// Summary returned by [`ProxySession::run`].
#[derive(Debug)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Set when the session never got past the handshake.
    pub handshake_error: Option<HandshakeError>,
    /// One entry per relay worker; empty if the handshake failed.
    pub directions: Vec<DirectionReport>,
}

impl SessionReport {
    /// Whether the session ended `ClosedClean`.
    pub fn is_clean(&self) -> bool {
        self.state == SessionState::ClosedClean
    }

    /// Report for the worker relaying `direction`, if it ever started.
    pub fn direction(&self, direction: Direction) -> Option<&DirectionReport> {
        self.directions.iter().find(|d| d.direction == direction)
    }
}

/// Builder for a [`ProxySession`].
pub struct SessionBuilder {
    client: Arc<dyn Connection>,
    server: Arc<dyn Connection>,
    filters: Vec<Arc<dyn Filter>>,
    exchange: Arc<dyn KeyExchange>,
    config: SessionConfig,
}

impl SessionBuilder {
    /// Append a filter to the permanent chain.
    pub fn filter(mut self, filter: Arc<dyn Filter>) -> Self {
        self.filters.push(filter);
        self
    }

    /// Append several filters to the permanent chain, in order.
    pub fn filters(mut self, filters: impl IntoIterator<Item = Arc<dyn Filter>>) -> Self {
        self.filters.extend(filters);
        self
    }

    /// Protocol knowledge used to pull the key out of the handshake.
    /// Defaults to a [`HalfExchange`] with no constraints.
    pub fn key_exchange(mut self, exchange: impl KeyExchange + 'static) -> Self {
        self.exchange = Arc::new(exchange);
        self
    }

    /// Override the default [`SessionConfig`].
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Create the session. No work starts until [`ProxySession::run`].
    pub fn build(self) -> ProxySession {
        let client_to_server = RelayLink::new(
            Direction::ClientToServer,
            Arc::clone(&self.client),
            Arc::clone(&self.server),
        );
        let server_to_client = RelayLink::new(
            Direction::ServerToClient,
            Arc::clone(&self.server),
            Arc::clone(&self.client),
        );
        let (state, _) = watch::channel(SessionState::Init);

        ProxySession {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                config: self.config,
                client: self.client,
                server: self.server,
                client_to_server,
                server_to_client,
                chain: FilterChain::new(self.filters),
                exchange: self.exchange,
                context: Arc::new(SessionContext::new()),
                running: AtomicBool::new(true),
                started: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                state,
            }),
        }
    }
}

struct Inner {
    id: Uuid,
    config: SessionConfig,
    client: Arc<dyn Connection>,
    server: Arc<dyn Connection>,
    client_to_server: RelayLink,
    server_to_client: RelayLink,
    chain: FilterChain,
    exchange: Arc<dyn KeyExchange>,
    context: Arc<SessionContext>,
    running: AtomicBool,
    started: AtomicBool,
    cancel: CancellationToken,
    state: watch::Sender<SessionState>,
}

/// Proxies one client connection to one server connection.
///
/// Cheap to clone; every clone refers to the same session. A session runs
/// at most once.
#[derive(Clone)]
pub struct ProxySession {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ProxySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySession")
            .field("id", &self.inner.id)
            .field("client", &self.inner.client.name())
            .field("server", &self.inner.server.name())
            .field("chain", &self.inner.chain)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ProxySession {
    /// Create a session with the default key exchange and config. No work
    /// starts until [`run`](Self::run).
    pub fn new(
        client: Arc<dyn Connection>,
        server: Arc<dyn Connection>,
        filters: Vec<Arc<dyn Filter>>,
    ) -> Self {
        Self::builder(client, server).filters(filters).build()
    }

    /// Start building a session over `client` and `server`.
    pub fn builder(client: Arc<dyn Connection>, server: Arc<dyn Connection>) -> SessionBuilder {
        SessionBuilder {
            client,
            server,
            filters: Vec::new(),
            exchange: Arc::new(HalfExchange::new()),
            config: SessionConfig::default(),
        }
    }

    /// The session the calling task is running on behalf of.
    ///
    /// Set for the task driving [`run`](Self::run) and for both relay
    /// workers, so filters can reach the session without it being passed
    /// down. Returns `None` anywhere else.
    pub fn current() -> Option<ProxySession> {
        CURRENT_SESSION.try_with(Clone::clone).ok()
    }

    /// Unique id, attached to every log event of this session.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// State shared by both directions. Available before the handshake.
    pub fn context(&self) -> &SessionContext {
        &self.inner.context
    }

    /// Owned handle to the same [`SessionContext`] as [`context`](Self::context).
    pub fn shared_context(&self) -> Arc<SessionContext> {
        Arc::clone(&self.inner.context)
    }

    pub fn client_name(&self) -> &str {
        self.inner.client.name()
    }

    pub fn server_name(&self) -> &str {
        self.inner.server.name()
    }

    /// The permanent filter chain. The handshake never modifies it.
    pub fn chain(&self) -> &FilterChain {
        &self.inner.chain
    }

    /// Tunables this session was built with.
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// `false` once shutdown has been requested or the session has ended.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Ask both relay workers to stop.
    ///
    /// Workers waiting for their next unit stop right away; a unit already
    /// read is still filtered and written first. Idempotent and safe to call
    /// from anywhere, including a filter running inside a worker.
    pub fn shutdown(&self) {
        if self.inner.running.swap(false, Ordering::SeqCst) {
            info!(session_id = %self.inner.id, "session shutdown requested");
        }
        self.inner.cancel.cancel();
    }

    /// Run the session to completion.
    ///
    /// Returns once the handshake has failed or both relay directions have
    /// stopped. Dropping the returned future requests shutdown; workers
    /// already running are left to drain on their own.
    pub async fn run(&self) -> Result<SessionReport, SessionError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(SessionError::AlreadyStarted(self.inner.id));
        }

        Ok(CURRENT_SESSION.scope(self.clone(), self.drive()).await)
    }

    async fn drive(&self) -> SessionReport {
        let started_at = Utc::now();
        let mut guard = ShutdownOnDrop {
            session: self,
            armed: true,
        };

        info!(
            session_id = %self.inner.id,
            client = self.client_name(),
            server = self.server_name(),
            filters = self.inner.chain.len(),
            "session started"
        );

        self.set_state(SessionState::Handshake);

        let report = match self.handshake().await {
            Ok(key) => {
                info!(session_id = %self.inner.id, key_len = key.len(), "session rekeyed");
                self.set_state(SessionState::Relaying);

                let directions = self.relay().await;
                let state = if directions.iter().all(|d| d.exit.is_error()) {
                    SessionState::ClosedError
                } else {
                    SessionState::ClosedClean
                };

                SessionReport {
                    session_id: self.inner.id,
                    state,
                    started_at,
                    ended_at: Utc::now(),
                    handshake_error: None,
                    directions,
                }
            }
            Err(err) => {
                if err.is_shutdown() {
                    info!(session_id = %self.inner.id, "shutdown requested during key exchange");
                } else {
                    error!(session_id = %self.inner.id, %err, "key exchange did not complete");
                }
                SessionReport {
                    session_id: self.inner.id,
                    state: SessionState::ClosedError,
                    started_at,
                    ended_at: Utc::now(),
                    handshake_error: Some(err),
                    directions: Vec::new(),
                }
            }
        };

        guard.armed = false;
        self.inner.running.store(false, Ordering::SeqCst);
        self.set_state(report.state);

        info!(
            session_id = %self.inner.id,
            state = ?report.state,
            "session closed"
        );

        report
    }

    /// Relay one unit each way with key capture in front of the chain, then
    /// rekey both connections.
    async fn handshake(&self) -> Result<SessionKey, HandshakeError> {
        let capture = Arc::new(KeyCaptureFilter::with_exchange(Arc::clone(
            &self.inner.exchange,
        )));

        // A per-session copy; the permanent chain is never touched.
        let chain = match self.inner.chain.first_name() {
            Some(anchor) => {
                let mut chain = self.inner.chain.clone();
                chain.insert_before(anchor, Arc::clone(&capture) as Arc<dyn Filter>)?;
                chain
            }
            None => FilterChain::new(vec![Arc::clone(&capture) as Arc<dyn Filter>]),
        };

        let exchange = async {
            let client_ctx = FilterContext::new(Direction::ClientToServer, self);
            self.inner
                .client_to_server
                .forward(&chain, &client_ctx)
                .await?;

            let server_ctx = FilterContext::new(Direction::ServerToClient, self);
            self.inner
                .server_to_client
                .forward(&chain, &server_ctx)
                .await?;

            Ok::<(), HandshakeError>(())
        };

        let cancellable = async {
            tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => Err(HandshakeError::Cancelled),
                result = exchange => result,
            }
        };

        match self.inner.config.handshake_timeout() {
            Some(limit) => tokio::time::timeout(limit, cancellable)
                .await
                .map_err(|_| HandshakeError::TimedOut(limit))??,
            None => cancellable.await?,
        }

        let key = capture.key().ok_or(HandshakeError::KeyNotCaptured)?;

        // A failed server rekey leaves the client already rekeyed. No worker
        // ever runs on either connection after that.
        for connection in [&self.inner.client, &self.inner.server] {
            connection
                .rekey(&key)
                .map_err(|source| HandshakeError::Rekey {
                    connection: connection.name().to_string(),
                    source,
                })?;
        }

        Ok(key)
    }

    /// Spawn both workers and wait for them.
    ///
    /// The wait is unbounded while the session runs. Once shutdown has been
    /// requested the remaining wait is capped by the configured shutdown
    /// timeout, after which stragglers are detached.
    async fn relay(&self) -> Vec<DirectionReport> {
        let mut workers = [
            self.spawn_worker(Direction::ClientToServer),
            self.spawn_worker(Direction::ServerToClient),
        ];

        let finished = tokio::select! {
            _ = wait_all(&mut workers) => true,
            _ = self.inner.cancel.cancelled() => false,
        };

        if !finished {
            let drain = self.inner.config.shutdown_timeout();
            if tokio::time::timeout(drain, wait_all(&mut workers))
                .await
                .is_err()
            {
                warn!(
                    session_id = %self.inner.id,
                    ?drain,
                    "relay workers did not stop within the shutdown timeout; detaching"
                );
            }
        }

        workers.into_iter().map(Worker::into_report).collect()
    }

    fn spawn_worker(&self, direction: Direction) -> Worker {
        let stats = Arc::new(WorkerStats::default());
        let session = self.clone();
        let task_stats = Arc::clone(&stats);

        let handle = tokio::spawn(CURRENT_SESSION.scope(self.clone(), async move {
            session.relay_loop(direction, &task_stats).await
        }));

        Worker {
            direction,
            connection: self.link(direction).name().to_string(),
            stats,
            handle,
            exit: None,
        }
    }

    /// Steady-state loop for one direction.
    async fn relay_loop(&self, direction: Direction, stats: &WorkerStats) -> WorkerExit {
        let link = self.link(direction);
        let ctx = FilterContext::new(direction, self);

        debug!(
            session_id = %self.inner.id,
            %direction,
            connection = link.name(),
            "relay worker started"
        );

        let exit = loop {
            if !self.is_running() {
                break WorkerExit::Shutdown;
            }

            match link
                .forward_until(&self.inner.chain, &ctx, &self.inner.cancel)
                .await
            {
                Ok(Some(Forwarded::Delivered)) => {
                    stats.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Some(Forwarded::Dropped)) => {
                    stats.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Ok(None) => break WorkerExit::Shutdown,
                Err(RelayError::EndOfStream { connection }) => {
                    debug!(session_id = %self.inner.id, %connection, "at end of stream");
                    break WorkerExit::EndOfStream;
                }
                Err(err @ (RelayError::Read { .. } | RelayError::Write { .. })) => {
                    debug!(session_id = %self.inner.id, %direction, %err, "relay I/O failure");
                    break WorkerExit::Io(err.to_string());
                }
                Err(RelayError::Filter(err)) => {
                    warn!(session_id = %self.inner.id, %direction, %err, "relay closed by filter failure");
                    break WorkerExit::Failed(err.to_string());
                }
            }
        };

        debug!(
            session_id = %self.inner.id,
            %direction,
            ?exit,
            delivered = stats.delivered.load(Ordering::Relaxed),
            dropped = stats.dropped.load(Ordering::Relaxed),
            "relay worker finished"
        );

        exit
    }

    fn link(&self, direction: Direction) -> &RelayLink {
        match direction {
            Direction::ClientToServer => &self.inner.client_to_server,
            Direction::ServerToClient => &self.inner.server_to_client,
        }
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            debug!(session_id = %self.inner.id, from = ?previous, to = ?state, "session state changed");
        }
    }
}

/// Requests shutdown if `run` is dropped before it finishes.
struct ShutdownOnDrop<'a> {
    session: &'a ProxySession,
    armed: bool,
}

impl Drop for ShutdownOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(session_id = %self.session.id(), "session wait cancelled");
            self.session.shutdown();
        }
    }
}

#[derive(Default)]
struct WorkerStats {
    delivered: AtomicU64,
    dropped: AtomicU64,
}

struct Worker {
    direction: Direction,
    connection: String,
    stats: Arc<WorkerStats>,
    handle: JoinHandle<WorkerExit>,
    exit: Option<WorkerExit>,
}

impl Worker {
    /// Wait for the task and record how it ended. Cancel-safe: the exit is
    /// stored as soon as the task completes, and a finished task is never
    /// polled again.
    async fn wait(&mut self) {
        if self.exit.is_some() {
            return;
        }
        let exit = match (&mut self.handle).await {
            Ok(exit) => exit,
            Err(err) => exit_from_join_error(err),
        };
        if let WorkerExit::Panicked(reason) = &exit {
            warn!(direction = %self.direction, %reason, "relay worker panicked");
        }
        self.exit = Some(exit);
    }

    fn into_report(self) -> DirectionReport {
        DirectionReport {
            direction: self.direction,
            connection: self.connection,
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            exit: self.exit.unwrap_or(WorkerExit::Detached),
        }
    }
}

/// Wait for both workers concurrently, so a worker that finishes is
/// recorded even while the other one is still stuck.
async fn wait_all(workers: &mut [Worker; 2]) {
    let [first, second] = workers;
    tokio::join!(first.wait(), second.wait());
}

fn exit_from_join_error(err: JoinError) -> WorkerExit {
    if err.is_panic() {
        WorkerExit::Panicked(panic_message(err.into_panic()))
    } else {
        WorkerExit::Failed(err.to_string())
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
