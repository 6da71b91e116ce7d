//! Server builder
//!
//! Assembles an engine from credentials, a trusted root and optional pieces
//! (event sink, shared registry), then binds a listener and starts the accept
//! loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use securechat_core::{ChatError, CredentialProvider, ServerConfig, TrustedRoot};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::info;

use crate::engine::{Engine, EngineLimits};
use crate::error::{ServerError, ServerResult};
use crate::events::{EventSink, TracingEventSink};
use crate::listener::Listener;
use crate::registry::SessionRegistry;

// ----------------------------------------------------------------------------
// Server Builder
// ----------------------------------------------------------------------------

/// Builder for a running SecureChat server
pub struct ServerBuilder {
    credentials: Arc<dyn CredentialProvider>,
    root: TrustedRoot,
    bind_address: String,
    limits: EngineLimits,
    events: Arc<dyn EventSink>,
    registry: Arc<SessionRegistry>,
}

impl ServerBuilder {
    /// Start from the defaults of `ServerConfig`
    pub fn new(credentials: Arc<dyn CredentialProvider>, root: TrustedRoot) -> Self {
        let defaults = ServerConfig::default();
        Self {
            credentials,
            root,
            bind_address: defaults.bind_address,
            limits: EngineLimits {
                capacity: defaults.pool_size,
                handshake_timeout: Duration::from_secs(defaults.handshake_timeout_secs),
                delivery_timeout: Duration::from_secs(defaults.delivery_timeout_secs),
            },
            events: Arc::new(TracingEventSink),
            registry: Arc::new(SessionRegistry::new()),
        }
    }

    /// Take bind address, pool size and timeouts from a loaded configuration
    pub fn with_config(mut self, config: &ServerConfig) -> Self {
        self.bind_address = config.bind_address.clone();
        self.limits = EngineLimits {
            capacity: config.pool_size,
            handshake_timeout: Duration::from_secs(config.handshake_timeout_secs),
            delivery_timeout: Duration::from_secs(config.delivery_timeout_secs),
        };
        self
    }

    pub fn bind_address<S: Into<String>>(mut self, address: S) -> Self {
        self.bind_address = address.into();
        self
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.limits.capacity = size;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.limits.handshake_timeout = timeout;
        self
    }

    pub fn delivery_timeout(mut self, timeout: Duration) -> Self {
        self.limits.delivery_timeout = timeout;
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    pub fn registry(mut self, registry: Arc<SessionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Start the engine without a listener
    pub fn build_engine(self) -> ServerResult<Arc<Engine>> {
        if self.limits.capacity == 0 {
            return Err(ChatError::config("pool_size must be at least 1").into());
        }
        if self.limits.handshake_timeout.is_zero() || self.limits.delivery_timeout.is_zero() {
            return Err(ChatError::config("timeouts must be non-zero").into());
        }
        Ok(Engine::start(
            self.limits,
            self.registry,
            self.credentials,
            self.root,
            self.events,
        ))
    }

    /// Start the engine, bind the listener and spawn the accept loop
    pub async fn build_and_start(self) -> ServerResult<ServerHandle> {
        let bind_address = self.bind_address.clone();
        let engine = self.build_engine()?;

        let listener = match Listener::bind(bind_address.as_str(), Arc::clone(&engine)).await {
            Ok(listener) => listener,
            Err(e) => {
                engine.shutdown();
                return Err(e);
            }
        };
        let local_addr = listener.local_addr()?;

        let shutdown = Arc::new(Notify::new());
        let accept_task = tokio::spawn(listener.run(Arc::clone(&shutdown)));
        info!(%local_addr, capacity = engine.capacity(), "Server started");

        Ok(ServerHandle {
            engine,
            local_addr,
            shutdown,
            accept_task: Some(accept_task),
        })
    }
}

// ----------------------------------------------------------------------------
// Server Handle
// ----------------------------------------------------------------------------

/// Handle to a running server
pub struct ServerHandle {
    engine: Arc<Engine>,
    local_addr: SocketAddr,
    shutdown: Arc<Notify>,
    accept_task: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.accept_task
            .as_ref()
            .map_or(false, |task| !task.is_finished())
    }

    /// Wait for the accept loop to end
    pub async fn wait(&mut self) -> ServerResult<()> {
        if let Some(task) = self.accept_task.take() {
            task.await.map_err(|e| ServerError::Io(std::io::Error::other(e)))?;
        }
        Ok(())
    }

    /// Stop accepting, stop every handler and wait for the accept loop
    pub async fn shutdown(&mut self) -> ServerResult<()> {
        self.shutdown.notify_one();
        self.engine.shutdown();
        self.wait().await
    }
}

impl core::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("local_addr", &self.local_addr)
            .field("engine", &self.engine)
            .finish()
    }
}
