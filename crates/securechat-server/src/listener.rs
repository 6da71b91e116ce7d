//! Accept loop
//!
//! Accepts TCP connections and hands each one to the engine. The loop never
//! touches a connection beyond assigning it.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::Notify;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::error::{ServerError, ServerResult};

/// Back-off after a failed accept, so descriptor exhaustion does not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A bound listening socket feeding an engine
pub struct Listener {
    inner: TcpListener,
    engine: Arc<Engine>,
}

impl Listener {
    pub async fn bind<A: ToSocketAddrs>(addr: A, engine: Arc<Engine>) -> ServerResult<Self> {
        let inner = TcpListener::bind(addr).await?;
        Ok(Self { inner, engine })
    }

    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    /// Accept until `shutdown` is notified
    pub async fn run(self, shutdown: Arc<Notify>) {
        let addr = self.inner.local_addr().ok();
        info!(?addr, "Listening");

        loop {
            let accepted = tokio::select! {
                _ = shutdown.notified() => break,
                accepted = self.inner.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "Accepted connection");
                    match self.engine.assign(stream) {
                        Ok(_) => {}
                        Err(ServerError::ShuttingDown) => break,
                        Err(e) => warn!(%peer, error = %e, "Connection not assigned"),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
        info!(?addr, "Listener stopped");
    }
}
