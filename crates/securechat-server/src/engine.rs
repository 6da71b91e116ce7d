//! Server engine
//!
//! Owns the handler pool and the shared session state, and exposes the
//! operations handlers and the accept loop use to move between the idle pool
//! and the occupancy set and to deliver messages.
//!
//! Every move between the two collections happens under one lock, so each
//! handler is in exactly one of them except while it is shutting down.
//! The lock is never held across network I/O.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::join_all;
use securechat_core::{ClientId, CredentialProvider, Recipient, TrustedRoot};
use tokio::net::TcpStream;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{ServerError, ServerResult};
use crate::events::EventSink;
use crate::handler::{ConnectionHandler, HandlerId, PresenceEntry};
use crate::registry::SessionRegistry;
use crate::stats::{EngineStats, StatsSnapshot};

// ----------------------------------------------------------------------------
// Pool State
// ----------------------------------------------------------------------------

#[derive(Default)]
struct Pools {
    idle: VecDeque<Arc<ConnectionHandler>>,
    occupied: HashMap<HandlerId, Arc<ConnectionHandler>>,
}

/// Sizes of the two handler collections, read together
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolCounts {
    pub idle: usize,
    pub occupied: usize,
}

impl PoolCounts {
    pub fn total(&self) -> usize {
        self.idle + self.occupied
    }
}

/// Pool size and the time bounds applied to every connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineLimits {
    /// Number of handlers the pool is kept at
    pub capacity: usize,
    /// Time a new connection has to complete the handshake
    pub handshake_timeout: Duration,
    /// Time one outbound delivery may take
    pub delivery_timeout: Duration,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            capacity: 10,
            handshake_timeout: Duration::from_secs(10),
            delivery_timeout: Duration::from_secs(5),
        }
    }
}

// ----------------------------------------------------------------------------
// Engine
// ----------------------------------------------------------------------------

/// The pool of connection handlers and the state they share
pub struct Engine {
    pools: Mutex<Pools>,
    limits: EngineLimits,
    next_handler: AtomicU64,
    shutting_down: AtomicBool,
    registry: Arc<SessionRegistry>,
    credentials: Arc<dyn CredentialProvider>,
    root: TrustedRoot,
    events: Arc<dyn EventSink>,
    stats: EngineStats,
}

impl Engine {
    /// Create the engine and spawn `limits.capacity` idle handlers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        limits: EngineLimits,
        registry: Arc<SessionRegistry>,
        credentials: Arc<dyn CredentialProvider>,
        root: TrustedRoot,
        events: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        let engine = Arc::new(Self {
            pools: Mutex::new(Pools::default()),
            limits,
            next_handler: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            registry,
            credentials,
            root,
            events,
            stats: EngineStats::default(),
        });

        let handlers: Vec<_> = (0..limits.capacity).map(|_| engine.spawn_handler()).collect();
        engine.pools().idle.extend(handlers);
        info!(capacity = limits.capacity, root = %engine.root.name, "Engine started");
        engine
    }

    fn spawn_handler(self: &Arc<Self>) -> Arc<ConnectionHandler> {
        let n = self.next_handler.fetch_add(1, Ordering::Relaxed);
        let (handler, assignments) = ConnectionHandler::new(HandlerId::new(format!("handler-{}", n)));
        tokio::spawn(Arc::clone(&handler).run(Arc::clone(self), assignments));
        handler
    }

    fn pools(&self) -> MutexGuard<'_, Pools> {
        self.pools.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn credentials(&self) -> &dyn CredentialProvider {
        self.credentials.as_ref()
    }

    pub fn trusted_root(&self) -> &TrustedRoot {
        &self.root
    }

    pub fn events(&self) -> &dyn EventSink {
        self.events.as_ref()
    }

    pub(crate) fn counters(&self) -> &EngineStats {
        &self.stats
    }

    /// Current engine counters
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of handlers the pool is kept at
    pub fn capacity(&self) -> usize {
        self.limits.capacity
    }

    pub fn limits(&self) -> &EngineLimits {
        &self.limits
    }

    pub fn idle_count(&self) -> usize {
        self.pools().idle.len()
    }

    pub fn occupied_count(&self) -> usize {
        self.pools().occupied.len()
    }

    /// Idle and occupied counts taken under the same lock
    pub fn pool_counts(&self) -> PoolCounts {
        let pools = self.pools();
        PoolCounts {
            idle: pools.idle.len(),
            occupied: pools.occupied.len(),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------------
    // Pool Operations
    // ------------------------------------------------------------------------

    /// Bind a fresh connection to an idle handler.
    ///
    /// With no idle handler the connection is dropped, which closes it.
    pub fn assign(self: &Arc<Self>, stream: TcpStream) -> ServerResult<HandlerId> {
        if self.is_shutting_down() {
            return Err(ServerError::ShuttingDown);
        }

        let handler = {
            let mut pools = self.pools();
            match pools.idle.pop_front() {
                Some(handler) => {
                    pools.occupied.insert(handler.id().clone(), Arc::clone(&handler));
                    handler
                }
                None => {
                    drop(pools);
                    self.stats.record_rejected();
                    warn!(peer = ?stream.peer_addr().ok(), "Pool exhausted; refusing connection");
                    return Err(ServerError::PoolExhausted {
                        capacity: self.limits.capacity,
                    });
                }
            }
        };

        let id = handler.id().clone();
        if let Err(e) = handler.bind(stream) {
            // The worker is gone; keep the pool at capacity
            self.replace(&id);
            return Err(e);
        }
        self.stats.record_assigned();
        debug!(handler = %id, "Connection assigned");
        Ok(id)
    }

    /// Move a handler from the occupancy set back to the idle pool.
    ///
    /// A handler that is not occupied is left alone.
    pub fn release(&self, id: &HandlerId) -> bool {
        let mut pools = self.pools();
        match pools.occupied.remove(id) {
            Some(handler) => {
                pools.idle.push_back(handler);
                debug!(handler = %id, "Handler released");
                true
            }
            None => false,
        }
    }

    /// Retire a handler and enqueue a fresh one under a new identity
    pub fn replace(self: &Arc<Self>, id: &HandlerId) {
        if self.is_shutting_down() {
            self.remove_occupancy(id);
            return;
        }

        let fresh = self.spawn_handler();
        let fresh_id = fresh.id().clone();
        {
            let mut pools = self.pools();
            pools.occupied.remove(id);
            pools.idle.retain(|handler| handler.id() != id);
            pools.idle.push_back(fresh);
        }
        self.stats.record_replaced();
        info!(retired = %id, replacement = %fresh_id, "Handler replaced");
    }

    /// Drop a handler from the occupancy set; repeated calls are harmless
    pub fn remove_occupancy(&self, id: &HandlerId) -> bool {
        self.pools().occupied.remove(id).is_some()
    }

    /// Close the session served by `id`, which a newer login has superseded
    pub fn supersede(&self, id: &HandlerId) {
        let handler = self.pools().occupied.get(id).cloned();
        if let Some(handler) = handler {
            info!(handler = %id, "Closing superseded session");
            handler.request_close();
        }
    }

    fn occupied_handlers(&self) -> Vec<Arc<ConnectionHandler>> {
        self.pools().occupied.values().cloned().collect()
    }

    // ------------------------------------------------------------------------
    // Delivery
    // ------------------------------------------------------------------------

    /// Deliver `text` to every occupied handler, the sender included.
    ///
    /// Deliveries run concurrently; returns how many handlers accepted one.
    pub async fn broadcast(&self, text: &str) -> usize {
        let handlers = self.occupied_handlers();
        self.stats.record_broadcast();

        let results = join_all(handlers.iter().map(|handler| handler.write_msg(self, text))).await;
        let delivered = results.into_iter().filter(|accepted| *accepted).count();
        debug!(recipients = handlers.len(), delivered, "Broadcast");
        delivered
    }

    /// Deliver `text` to the one occupied handler matching `target`.
    ///
    /// A numeric target matches the remote port of the bound connection;
    /// anything else resolves to the handler owning that client's registry
    /// entry. No match is not an error.
    pub async fn unicast(&self, target: &Recipient, text: &str) -> bool {
        let recipient = match target {
            Recipient::Port(port) => self
                .occupied_handlers()
                .into_iter()
                .find(|handler| handler.remote_addr().map(|addr| addr.port()) == Some(*port)),
            Recipient::Client(name) => self
                .registry
                .get(&ClientId::from(name.as_str()))
                .and_then(|entry| self.pools().occupied.get(&entry.handler).cloned()),
        };

        let delivered = match recipient {
            Some(handler) => handler.write_msg(self, text).await,
            None => false,
        };
        if delivered {
            self.stats.record_private_delivered();
        } else {
            self.stats.record_private_dropped();
            debug!(%target, "No recipient for private message");
        }
        delivered
    }

    /// Presence entries of all occupied handlers, ordered by handler
    pub fn who_is_in(&self) -> Vec<PresenceEntry> {
        let mut entries: Vec<_> = self
            .occupied_handlers()
            .iter()
            .map(|handler| handler.snapshot())
            .collect();
        entries.sort_by(|a, b| a.handler.cmp(&b.handler));
        entries
    }

    /// Stop every handler, idle and occupied
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let handlers: Vec<_> = {
            let pools = self.pools();
            pools
                .idle
                .iter()
                .chain(pools.occupied.values())
                .cloned()
                .collect()
        };
        for handler in &handlers {
            handler.stop();
        }
        info!(handlers = handlers.len(), "Engine shut down");
    }
}

impl core::fmt::Debug for Engine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let counts = self.pool_counts();
        f.debug_struct("Engine")
            .field("capacity", &self.limits.capacity)
            .field("idle", &counts.idle)
            .field("occupied", &counts.occupied)
            .field("sessions", &self.registry.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TracingEventSink;
    use securechat_core::crypto::{decrypt_symmetric, generate_session_key};
    use securechat_core::wire::read_value;
    use securechat_core::{
        Certificate, CertificateAuthority, CryptographicError, EstablishedSession, KeyStore,
        PeerPublicKey, SessionKey, StoreCredentials,
    };
    use tokio::io::AsyncWriteExt;
    use tokio::net::tcp::OwnedWriteHalf;
    use tokio::net::TcpListener;

    fn credentials() -> (StoreCredentials, TrustedRoot) {
        let ca = CertificateAuthority::generate("Test Root").unwrap();
        let credentials = StoreCredentials::new(KeyStore::generate("server", &ca).unwrap());
        (credentials, ca.root())
    }

    fn engine_with(
        limits: EngineLimits,
        credentials: Arc<dyn CredentialProvider>,
        root: TrustedRoot,
    ) -> Arc<Engine> {
        Engine::start(
            limits,
            Arc::new(SessionRegistry::new()),
            credentials,
            root,
            Arc::new(TracingEventSink),
        )
    }

    fn engine(capacity: usize) -> Arc<Engine> {
        let (credentials, root) = credentials();
        let limits = EngineLimits {
            capacity,
            ..EngineLimits::default()
        };
        engine_with(limits, Arc::new(credentials), root)
    }

    /// Register `name` on a worker-less handler in the occupancy set, writing to `writer`
    async fn attach(
        engine: &Arc<Engine>,
        name: &str,
        writer: OwnedWriteHalf,
    ) -> (Arc<ConnectionHandler>, SessionKey) {
        let (handler, _assignments) = ConnectionHandler::new(HandlerId::new(format!("test-{}", name)));
        engine
            .pools()
            .occupied
            .insert(handler.id().clone(), Arc::clone(&handler));

        let session_key = generate_session_key().unwrap();
        let session = EstablishedSession {
            client_id: ClientId::from(name),
            certificate_subject: name.to_string(),
            public_key: PeerPublicKey {
                signing: [0u8; 32],
                encryption: [0u8; 32],
            },
            session_key: session_key.clone(),
        };
        handler.register(engine, session, writer).await;
        (handler, session_key)
    }

    async fn next_plaintext(peer: &mut TcpStream, key: &SessionKey) -> String {
        let ciphertext: String = read_value(peer).await.unwrap();
        decrypt_symmetric(&ciphertext, key).unwrap()
    }

    /// Delegates everything except symmetric encryption, which always fails
    struct NoEncryption(StoreCredentials);

    impl CredentialProvider for NoEncryption {
        fn certificate(&self) -> securechat_core::Result<Certificate> {
            self.0.certificate()
        }
        fn public_key(&self, certificate: &Certificate) -> securechat_core::Result<PeerPublicKey> {
            self.0.public_key(certificate)
        }
        fn verify_certificate(&self, certificate: &Certificate, root: &TrustedRoot) -> securechat_core::Result<()> {
            self.0.verify_certificate(certificate, root)
        }
        fn sign(&self, data: &[u8]) -> securechat_core::Result<[u8; 64]> {
            self.0.sign(data)
        }
        fn verify_signature(&self, key: &PeerPublicKey, data: &[u8], signature: &[u8]) -> securechat_core::Result<()> {
            self.0.verify_signature(key, data, signature)
        }
        fn encrypt_asymmetric(&self, key: &PeerPublicKey, data: &[u8]) -> securechat_core::Result<Vec<u8>> {
            self.0.encrypt_asymmetric(key, data)
        }
        fn decrypt_asymmetric(&self, data: &[u8]) -> securechat_core::Result<Vec<u8>> {
            self.0.decrypt_asymmetric(data)
        }
        fn generate_symmetric_key(&self) -> securechat_core::Result<SessionKey> {
            self.0.generate_symmetric_key()
        }
        fn encrypt_symmetric(&self, _text: &str, _key: &SessionKey) -> securechat_core::Result<String> {
            Err(CryptographicError::EncryptionFailed.into())
        }
        fn decrypt_symmetric(&self, text: &str, key: &SessionKey) -> securechat_core::Result<String> {
            self.0.decrypt_symmetric(text, key)
        }
    }

    async fn loopback_stream(listener: &TcpListener) -> (TcpStream, TcpStream) {
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_start_fills_idle_pool() {
        let engine = engine(3);
        assert_eq!(engine.pool_counts(), PoolCounts { idle: 3, occupied: 0 });
        assert_eq!(engine.capacity(), 3);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_assign_release_and_exhaustion() {
        let engine = engine(1);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let (_client_a, accepted_a) = loopback_stream(&listener).await;
        let id = engine.assign(accepted_a).unwrap();
        assert_eq!(engine.pool_counts(), PoolCounts { idle: 0, occupied: 1 });

        let (_client_b, accepted_b) = loopback_stream(&listener).await;
        assert!(matches!(
            engine.assign(accepted_b),
            Err(ServerError::PoolExhausted { capacity: 1 })
        ));
        assert_eq!(engine.stats().assignments_rejected, 1);

        assert!(engine.release(&id));
        assert!(!engine.release(&id));
        assert_eq!(engine.pool_counts(), PoolCounts { idle: 1, occupied: 0 });
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_replace_keeps_capacity() {
        let engine = engine(2);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (_client, accepted) = loopback_stream(&listener).await;
        let id = engine.assign(accepted).unwrap();

        engine.replace(&id);
        let counts = engine.pool_counts();
        assert_eq!(counts, PoolCounts { idle: 2, occupied: 0 });
        assert_eq!(engine.stats().handlers_replaced, 1);

        // The replacement has a label never used before
        let labels: Vec<_> = engine.pools().idle.iter().map(|h| h.id().clone()).collect();
        assert!(!labels.contains(&id));
        assert!(labels.contains(&HandlerId::new("handler-2")));
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_remove_occupancy_is_idempotent() {
        let engine = engine(1);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (_client, accepted) = loopback_stream(&listener).await;
        let id = engine.assign(accepted).unwrap();

        assert!(engine.remove_occupancy(&id));
        assert!(!engine.remove_occupancy(&id));
        assert_eq!(engine.occupied_count(), 0);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_unicast_without_match_is_dropped() {
        let engine = engine(1);
        assert!(!engine.unicast(&Recipient::Port(7001), "Hello").await);
        assert!(!engine.unicast(&Recipient::Client("nobody".into()), "Hello").await);
        assert_eq!(engine.stats().private_dropped, 2);
        assert_eq!(engine.broadcast("nobody home").await, 0);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_assign_after_shutdown_refused() {
        let engine = engine(1);
        engine.shutdown();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (_client, accepted) = loopback_stream(&listener).await;
        assert!(matches!(engine.assign(accepted), Err(ServerError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_failed_write_is_counted_and_others_still_receive() {
        let engine = engine(0);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (mut alice_peer, alice_stream) = loopback_stream(&listener).await;
        let (_dave_peer, dave_stream) = loopback_stream(&listener).await;

        let (_alice_reader, alice_writer) = alice_stream.into_split();
        let (_dave_reader, mut dave_writer) = dave_stream.into_split();
        // Writes after shutting down the write side fail with a broken pipe
        dave_writer.shutdown().await.unwrap();

        let (_alice, alice_key) = attach(&engine, "alice", alice_writer).await;
        let (dave, _) = attach(&engine, "dave", dave_writer).await;
        assert!(dave.is_open());

        engine.broadcast("alice: hello").await;
        assert_eq!(engine.stats().delivery_failures, 1);
        assert_eq!(next_plaintext(&mut alice_peer, &alice_key).await, "alice: hello");
    }

    #[tokio::test]
    async fn test_stalled_recipient_does_not_block_broadcast() {
        let (credentials, root) = credentials();
        let limits = EngineLimits {
            capacity: 0,
            delivery_timeout: Duration::from_millis(200),
            ..EngineLimits::default()
        };
        let engine = engine_with(limits, Arc::new(credentials), root);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (mut alice_peer, alice_stream) = loopback_stream(&listener).await;
        // Never read from
        let (_stalled_peer, stalled_stream) = loopback_stream(&listener).await;

        let (_alice_reader, alice_writer) = alice_stream.into_split();
        let (_stalled_reader, stalled_writer) = stalled_stream.into_split();
        let (_alice, alice_key) = attach(&engine, "alice", alice_writer).await;
        let (stalled, _) = attach(&engine, "carol", stalled_writer).await;

        let chunk = "x".repeat(600_000);
        let filled = tokio::time::timeout(Duration::from_secs(30), async {
            for _ in 0..500 {
                stalled.write_msg(&engine, &chunk).await;
                if engine.stats().delivery_failures > 0 {
                    break;
                }
            }
        })
        .await;
        assert!(filled.is_ok());
        assert_eq!(engine.stats().delivery_failures, 1);
        assert!(!stalled.is_open());

        let delivered = tokio::time::timeout(Duration::from_secs(5), engine.broadcast("bob: anyone?"))
            .await
            .expect("broadcast blocked on a stalled recipient");
        assert_eq!(delivered, 1);
        assert_eq!(next_plaintext(&mut alice_peer, &alice_key).await, "bob: anyone?");
    }

    #[tokio::test]
    async fn test_encryption_failure_is_not_a_delivery() {
        let (credentials, root) = credentials();
        let limits = EngineLimits {
            capacity: 0,
            ..EngineLimits::default()
        };
        let engine = engine_with(limits, Arc::new(NoEncryption(credentials)), root);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (_peer, stream) = loopback_stream(&listener).await;
        let (_reader, writer) = stream.into_split();
        let (alice, _) = attach(&engine, "alice", writer).await;

        assert!(!alice.write_msg(&engine, "hello").await);
        assert_eq!(engine.broadcast("hello again").await, 0);
        assert_eq!(engine.stats().delivery_failures, 2);
    }

    #[tokio::test]
    async fn test_name_routing_follows_registry_owner() {
        let engine = engine(0);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (_old_peer, old_stream) = loopback_stream(&listener).await;
        let (mut new_peer, new_stream) = loopback_stream(&listener).await;

        let (_old_reader, old_writer) = old_stream.into_split();
        let (_new_reader, new_writer) = new_stream.into_split();
        let (old, _) = attach(&engine, "alice", old_writer).await;

        // Second login under the same name, on another handler
        let (handler, _assignments) = ConnectionHandler::new(HandlerId::new("test-alice-2"));
        engine
            .pools()
            .occupied
            .insert(handler.id().clone(), Arc::clone(&handler));
        let key = generate_session_key().unwrap();
        let session = EstablishedSession {
            client_id: ClientId::from("alice"),
            certificate_subject: "alice".into(),
            public_key: PeerPublicKey {
                signing: [0u8; 32],
                encryption: [0u8; 32],
            },
            session_key: key.clone(),
        };
        handler.register(&engine, session, new_writer).await;

        // The superseded handler was asked to close
        assert!(!old.is_open());
        for _ in 0..5 {
            assert!(engine.unicast(&Recipient::Client("alice".into()), "hi").await);
            assert_eq!(next_plaintext(&mut new_peer, &key).await, "hi");
        }
        assert_eq!(engine.stats().private_dropped, 0);
    }
}
