pub mod fixtures {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use crate::config::SessionConfig;
    use crate::connection::Connection;
    use crate::error::{ConnectionError, FilterError};
    use crate::filter::{Filter, FilterContext, FilterResult};
    use crate::key_capture::{KeyExchange, SessionKey};
    use crate::memory::{MemoryConnection, MemoryPeer};
    use crate::message::MessageUnit;
    use crate::session::ProxySession;

    pub struct Peers {
        pub client: MemoryPeer,
        pub server: MemoryPeer,
    }

    /// A session over two memory connections named `client` and `server`.
    pub fn session(filters: Vec<Arc<dyn Filter>>) -> (ProxySession, Peers) {
        let (client, client_peer) = MemoryConnection::new("client");
        let (server, server_peer) = MemoryConnection::new("server");
        let session = ProxySession::new(Arc::new(client), Arc::new(server), filters);
        (
            session,
            Peers {
                client: client_peer,
                server: server_peer,
            },
        )
    }

    pub fn session_with(
        filters: Vec<Arc<dyn Filter>>,
        exchange: impl KeyExchange + 'static,
        config: SessionConfig,
    ) -> (ProxySession, Peers) {
        let (client, client_peer) = MemoryConnection::new("client");
        let (server, server_peer) = MemoryConnection::new("server");
        let session = ProxySession::builder(Arc::new(client), Arc::new(server))
            .filters(filters)
            .key_exchange(exchange)
            .config(config)
            .build();
        (
            session,
            Peers {
                client: client_peer,
                server: server_peer,
            },
        )
    }

    struct Named(String);

    impl Filter for Named {
        fn name(&self) -> &str {
            &self.0
        }

        fn apply(
            &self,
            unit: MessageUnit,
            _ctx: &FilterContext<'_>,
        ) -> Result<FilterResult, FilterError> {
            Ok(FilterResult::Forward(unit))
        }
    }

    /// Pass-through filter with the given name.
    pub fn named(name: &str) -> Arc<dyn Filter> {
        Arc::new(Named(name.to_string()))
    }

    /// Appends `name:payload` to a shared log for every unit it sees.
    pub struct Recorder {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        pub fn log() -> Arc<Mutex<Vec<String>>> {
            Arc::new(Mutex::new(Vec::new()))
        }

        pub fn entries(log: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
            log.lock().unwrap().clone()
        }

        pub fn new(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name: name.to_string(),
                log: Arc::clone(log),
            }
        }
    }

    impl Filter for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn apply(
            &self,
            unit: MessageUnit,
            _ctx: &FilterContext<'_>,
        ) -> Result<FilterResult, FilterError> {
            let entry = format!("{}:{}", self.name, String::from_utf8_lossy(&unit.payload));
            self.log.lock().unwrap().push(entry);
            Ok(FilterResult::Forward(unit))
        }
    }

    /// Appends fixed bytes to every payload.
    pub struct Suffix {
        name: String,
        suffix: &'static [u8],
    }

    impl Suffix {
        pub fn new(name: &str, suffix: &'static [u8]) -> Self {
            Self {
                name: name.to_string(),
                suffix,
            }
        }
    }

    impl Filter for Suffix {
        fn name(&self) -> &str {
            &self.name
        }

        fn apply(
            &self,
            unit: MessageUnit,
            _ctx: &FilterContext<'_>,
        ) -> Result<FilterResult, FilterError> {
            let mut payload = unit.payload.to_vec();
            payload.extend_from_slice(self.suffix);
            Ok(FilterResult::Forward(unit.with_payload(payload)))
        }
    }

    /// Drops every unit carrying `tag`.
    pub struct DropTag(u16);

    impl DropTag {
        pub fn new(tag: u16) -> Self {
            Self(tag)
        }
    }

    impl Filter for DropTag {
        fn name(&self) -> &str {
            "drop-tag"
        }

        fn apply(
            &self,
            unit: MessageUnit,
            _ctx: &FilterContext<'_>,
        ) -> Result<FilterResult, FilterError> {
            if unit.tag == self.0 {
                Ok(FilterResult::Drop(format!("tag {} blocked", self.0)))
            } else {
                Ok(FilterResult::Forward(unit))
            }
        }
    }

    /// Returns a filter error for units carrying `tag`.
    pub struct Failing(u16);

    impl Failing {
        pub fn on_tag(tag: u16) -> Self {
            Self(tag)
        }
    }

    impl Filter for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn apply(
            &self,
            unit: MessageUnit,
            _ctx: &FilterContext<'_>,
        ) -> Result<FilterResult, FilterError> {
            if unit.tag == self.0 {
                return Err(FilterError::new("failing", format!("cannot handle tag {}", self.0)));
            }
            Ok(FilterResult::Forward(unit))
        }
    }

    /// Panics on units carrying `tag`.
    pub struct Panicking(u16);

    impl Panicking {
        pub fn on_tag(tag: u16) -> Self {
            Self(tag)
        }
    }

    impl Filter for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        fn apply(
            &self,
            unit: MessageUnit,
            _ctx: &FilterContext<'_>,
        ) -> Result<FilterResult, FilterError> {
            if unit.tag == self.0 {
                panic!("panicking on tag {}", self.0);
            }
            Ok(FilterResult::Forward(unit))
        }
    }

    /// Calls `shutdown()` on its own session when it sees `tag`, then
    /// forwards the unit.
    pub struct ShutdownOnTag(u16);

    impl ShutdownOnTag {
        pub fn new(tag: u16) -> Self {
            Self(tag)
        }
    }

    impl Filter for ShutdownOnTag {
        fn name(&self) -> &str {
            "shutdown-on-tag"
        }

        fn apply(
            &self,
            unit: MessageUnit,
            ctx: &FilterContext<'_>,
        ) -> Result<FilterResult, FilterError> {
            if unit.tag == self.0 {
                ctx.session().shutdown();
            }
            Ok(FilterResult::Forward(unit))
        }
    }

    /// Counts whether `ProxySession::current()` agrees with the context's
    /// session.
    #[derive(Default)]
    pub struct CurrentProbe {
        matched: AtomicUsize,
        missing: AtomicUsize,
    }

    impl CurrentProbe {
        pub fn matched(&self) -> usize {
            self.matched.load(Ordering::SeqCst)
        }

        pub fn missing(&self) -> usize {
            self.missing.load(Ordering::SeqCst)
        }
    }

    impl Filter for CurrentProbe {
        fn name(&self) -> &str {
            "current-probe"
        }

        fn apply(
            &self,
            unit: MessageUnit,
            ctx: &FilterContext<'_>,
        ) -> Result<FilterResult, FilterError> {
            match ProxySession::current() {
                Some(current) if current.id() == ctx.session().id() => {
                    self.matched.fetch_add(1, Ordering::SeqCst);
                }
                _ => {
                    self.missing.fetch_add(1, Ordering::SeqCst);
                }
            }
            Ok(FilterResult::Forward(unit))
        }
    }

    /// Wraps a connection so that writes after the first `allowed` never
    /// complete. Notifies once the first write stalls.
    pub struct StallWrites {
        inner: MemoryConnection,
        allowed: AtomicUsize,
        stalled: Arc<Notify>,
    }

    impl StallWrites {
        pub fn after(inner: MemoryConnection, allowed: usize) -> (Self, Arc<Notify>) {
            let stalled = Arc::new(Notify::new());
            let conn = Self {
                inner,
                allowed: AtomicUsize::new(allowed),
                stalled: Arc::clone(&stalled),
            };
            (conn, stalled)
        }
    }

    #[async_trait]
    impl Connection for StallWrites {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn read_next(&self) -> Result<MessageUnit, ConnectionError> {
            self.inner.read_next().await
        }

        async fn write(&self, unit: MessageUnit) -> Result<(), ConnectionError> {
            let remaining = self.allowed.load(Ordering::SeqCst);
            if remaining == 0 {
                self.stalled.notify_one();
                std::future::pending::<()>().await;
            }
            self.allowed.store(remaining - 1, Ordering::SeqCst);
            self.inner.write(unit).await
        }

        fn rekey(&self, key: &SessionKey) -> Result<(), ConnectionError> {
            self.inner.rekey(key)
        }
    }

    /// Wraps a connection whose `rekey` always fails.
    pub struct RefuseRekey(pub MemoryConnection);

    #[async_trait]
    impl Connection for RefuseRekey {
        fn name(&self) -> &str {
            self.0.name()
        }

        async fn read_next(&self) -> Result<MessageUnit, ConnectionError> {
            self.0.read_next().await
        }

        async fn write(&self, unit: MessageUnit) -> Result<(), ConnectionError> {
            self.0.write(unit).await
        }

        fn rekey(&self, _key: &SessionKey) -> Result<(), ConnectionError> {
            Err(ConnectionError::Rekey("cipher refused the key".to_string()))
        }
    }
}
