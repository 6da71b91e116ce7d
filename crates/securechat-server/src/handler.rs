//! Connection handlers
//!
//! A handler is one worker slot of the pool. Each runs in its own task and
//! moves through `idle → handshaking → serving → idle`, or terminates for
//! good after a failed handshake or a `stop()`. Idle handlers wait on their
//! assignment channel; the engine wakes one by sending it a connection.

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use securechat_core::wire::{read_value, write_value};
use securechat_core::{
    server_handshake, ChatMessage, ClientId, Envelope, EstablishedSession, ProtocolError,
};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::dispatcher::{dispatch, Flow};
use crate::engine::Engine;
use crate::error::{ServerError, ServerResult};
use crate::registry::SessionEntry;

// ----------------------------------------------------------------------------
// Identity and Presence
// ----------------------------------------------------------------------------

/// Stable label of a handler, assigned at construction and never reused
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandlerId(String);

impl HandlerId {
    pub fn new<S: Into<String>>(label: S) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a handler is currently serving, as reported by WHOISIN
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub handler: HandlerId,
    pub remote_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,
    /// Resolved once the handshake completes
    pub client: Option<ClientId>,
}

impl fmt::Display for PresenceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let client = self.client.as_ref().map(ClientId::as_str).unwrap_or("<handshaking>");
        write!(f, "[{}] {}", self.handler, client)?;
        if let Some(remote) = self.remote_addr {
            write!(f, " remote={}", remote)?;
        }
        if let Some(local) = self.local_addr {
            write!(f, " local={}", local)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Binding {
    client: Option<ClientId>,
    remote_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
}

/// How a served connection ended for the handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// Back in the idle pool, ready for another connection
    Released,
    /// Permanently out of service
    Terminated,
}

// ----------------------------------------------------------------------------
// Connection Handler
// ----------------------------------------------------------------------------

/// One worker slot of the connection pool
pub struct ConnectionHandler {
    id: HandlerId,
    assignments: mpsc::UnboundedSender<TcpStream>,
    writer: AsyncMutex<Option<OwnedWriteHalf>>,
    binding: Mutex<Binding>,
    open: AtomicBool,
    shutting_down: AtomicBool,
    stop_signal: Notify,
    close_requested: AtomicBool,
    close_signal: Notify,
}

impl ConnectionHandler {
    /// Create an idle handler and the receiving end of its assignment channel
    pub(crate) fn new(id: HandlerId) -> (Arc<Self>, mpsc::UnboundedReceiver<TcpStream>) {
        let (assignments, receiver) = mpsc::unbounded_channel();
        let handler = Arc::new(Self {
            id,
            assignments,
            writer: AsyncMutex::new(None),
            binding: Mutex::new(Binding::default()),
            open: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            stop_signal: Notify::new(),
            close_requested: AtomicBool::new(false),
            close_signal: Notify::new(),
        });
        (handler, receiver)
    }

    pub fn id(&self) -> &HandlerId {
        &self.id
    }

    /// Whether the bound connection is still usable
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Identifier of the client served, once authenticated
    pub fn client(&self) -> Option<ClientId> {
        self.binding().client.clone()
    }

    /// Remote address of the bound connection
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.binding().remote_addr
    }

    /// Presence entry for this handler
    pub fn snapshot(&self) -> PresenceEntry {
        let binding = self.binding();
        PresenceEntry {
            handler: self.id.clone(),
            remote_addr: binding.remote_addr,
            local_addr: binding.local_addr,
            client: binding.client.clone(),
        }
    }

    fn binding(&self) -> MutexGuard<'_, Binding> {
        // Binding holds plain data; a panic elsewhere cannot leave it half-written
        self.binding.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hand a connection to this handler and wake its worker
    pub(crate) fn bind(&self, stream: TcpStream) -> ServerResult<()> {
        {
            let mut binding = self.binding();
            binding.remote_addr = stream.peer_addr().ok();
            binding.local_addr = stream.local_addr().ok();
            binding.client = None;
        }
        self.assignments
            .send(stream)
            .map_err(|_| ServerError::HandlerUnavailable {
                handler: self.id.to_string(),
            })
    }

    /// Force the handler out of service; an idle worker wakes and exits
    pub fn stop(&self) {
        self.open.store(false, Ordering::Release);
        self.shutting_down.store(true, Ordering::Release);
        self.stop_signal.notify_one();
    }

    /// Ask the worker to close the current session and return to the idle pool.
    ///
    /// Used when the session is superseded by a newer login or its connection
    /// stopped accepting writes.
    pub fn request_close(&self) {
        self.open.store(false, Ordering::Release);
        self.close_requested.store(true, Ordering::Release);
        self.close_signal.notify_one();
    }

    // ------------------------------------------------------------------------
    // Worker
    // ------------------------------------------------------------------------

    /// Worker loop: wait for an assignment, serve it, repeat until stopped
    pub(crate) async fn run(
        self: Arc<Self>,
        engine: Arc<Engine>,
        mut assignments: mpsc::UnboundedReceiver<TcpStream>,
    ) {
        debug!(handler = %self.id, "Handler ready");
        while !self.is_shutting_down() {
            let stream = tokio::select! {
                _ = self.stop_signal.notified() => break,
                next = assignments.recv() => match next {
                    Some(stream) => stream,
                    None => break,
                },
            };

            if self.serve(&engine, stream).await == Outcome::Terminated {
                break;
            }
        }
        debug!(handler = %self.id, "Handler exited");
    }

    async fn serve(&self, engine: &Arc<Engine>, stream: TcpStream) -> Outcome {
        let (mut reader, mut writer) = stream.into_split();

        let handshake = tokio::select! {
            _ = self.stop_signal.notified() => None,
            result = timeout(
                engine.limits().handshake_timeout,
                server_handshake(
                    &mut reader,
                    &mut writer,
                    engine.credentials(),
                    engine.trusted_root(),
                ),
            ) => Some(result.unwrap_or_else(|_| Err(ProtocolError::HandshakeTimedOut.into()))),
        };

        let session = match handshake {
            None => {
                debug!(handler = %self.id, "Stopped during handshake");
                let _ = writer.shutdown().await;
                *self.binding() = Binding::default();
                engine.remove_occupancy(&self.id);
                return Outcome::Terminated;
            }
            Some(Ok(session)) => session,
            Some(Err(e)) => {
                warn!(handler = %self.id, error = %e, "Handshake failed; retiring handler");
                engine.counters().record_handshake_failed();
                engine
                    .events()
                    .append_event(&format!("[{}] handshake failed: {}", self.id, e));
                let _ = writer.shutdown().await;
                self.stop();
                *self.binding() = Binding::default();
                engine.replace(&self.id);
                return Outcome::Terminated;
            }
        };

        self.register(engine, session, writer).await;

        while self.is_open() {
            // Signals are polled before the read so a leftover permit never
            // cancels a partially read frame
            let next = tokio::select! {
                biased;
                _ = self.stop_signal.notified() => break,
                _ = self.close_signal.notified() => {
                    // A permit left over from an earlier session carries no request
                    if self.close_requested.swap(false, Ordering::AcqRel) {
                        debug!(handler = %self.id, "Close requested");
                        break;
                    }
                    continue;
                }
                next = read_value::<_, Envelope>(&mut reader) => next,
            };

            let envelope = match next {
                Ok(envelope) => envelope,
                Err(e) if e.is_transport() => {
                    debug!(handler = %self.id, error = %e, "Connection closed");
                    break;
                }
                Err(e) => {
                    warn!(handler = %self.id, error = %e, "Unreadable message; closing session");
                    break;
                }
            };

            match ChatMessage::from_envelope(envelope) {
                Ok(message) => {
                    if dispatch(self, engine, message).await == Flow::Stop {
                        break;
                    }
                }
                Err(e) => warn!(handler = %self.id, error = %e, "Skipping malformed message"),
            }
        }

        self.close_session(engine).await;
        if self.is_shutting_down() {
            Outcome::Terminated
        } else {
            Outcome::Released
        }
    }

    pub(crate) async fn register(
        &self,
        engine: &Engine,
        session: EstablishedSession,
        writer: OwnedWriteHalf,
    ) {
        let EstablishedSession {
            client_id,
            certificate_subject,
            public_key,
            session_key,
        } = session;

        self.close_requested.store(false, Ordering::Release);
        self.binding().client = Some(client_id.clone());
        *self.writer.lock().await = Some(writer);
        self.open.store(true, Ordering::Release);

        let previous = engine.registry().insert(
            client_id.clone(),
            SessionEntry::new(public_key, session_key, self.id.clone()),
        );
        if let Some(previous) = previous {
            engine.supersede(&previous.handler);
        }

        engine.counters().record_handshake_completed();
        info!(
            handler = %self.id,
            client = %client_id,
            subject = %certificate_subject,
            fingerprint = %public_key.short_fingerprint(),
            "Client authenticated"
        );
        engine
            .events()
            .append_event(&format!("[{}] {} connected", self.id, client_id));
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Close the served session and return the handler to the idle pool.
    ///
    /// Only the first call after a session was established has any effect;
    /// it returns whether this call did the work.
    pub async fn close_session(&self, engine: &Engine) -> bool {
        self.open.store(false, Ordering::Release);
        let client = {
            let mut binding = self.binding();
            let client = binding.client.take();
            if client.is_some() {
                binding.remote_addr = None;
                binding.local_addr = None;
            }
            client
        };
        let Some(client) = client else {
            return false;
        };

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        engine.registry().remove_if_owned(&client, &self.id);
        engine.counters().record_session_closed();
        info!(handler = %self.id, %client, "Session closed");
        engine
            .events()
            .append_event(&format!("[{}] {} disconnected", self.id, client));

        if self.is_shutting_down() {
            engine.remove_occupancy(&self.id);
        } else {
            engine.release(&self.id);
        }
        true
    }

    // ------------------------------------------------------------------------
    // Outbound Delivery
    // ------------------------------------------------------------------------

    /// Encrypt `text` under the bound client's session key and send it.
    ///
    /// Returns `false` without error when the handler has no live session it
    /// owns or the text could not be encrypted. A failed write is logged and
    /// swallowed. A write that does not finish within the delivery timeout
    /// also closes the session, since the frame may be half-written.
    pub async fn write_msg(&self, engine: &Engine, text: &str) -> bool {
        if !self.is_open() {
            return false;
        }
        let Some(client) = self.client() else {
            return false;
        };
        let entry = match engine.registry().get(&client) {
            Some(entry) if entry.handler == self.id => entry,
            _ => return false,
        };

        let ciphertext = match engine.credentials().encrypt_symmetric(text, &entry.session_key) {
            Ok(ciphertext) => ciphertext,
            Err(e) => {
                warn!(handler = %self.id, %client, error = %e, "Could not encrypt delivery");
                engine.counters().record_delivery_failure();
                return false;
            }
        };

        let delivery = timeout(engine.limits().delivery_timeout, async {
            let mut writer = self.writer.lock().await;
            match writer.as_mut() {
                Some(writer) => Some(write_value(writer, &ciphertext).await),
                None => None,
            }
        })
        .await;

        match delivery {
            Ok(None) => return false,
            Ok(Some(Ok(()))) => {}
            Ok(Some(Err(e))) => {
                warn!(handler = %self.id, %client, error = %e, "Delivery failed");
                engine.counters().record_delivery_failure();
            }
            Err(_) => {
                warn!(handler = %self.id, %client, "Delivery timed out; closing session");
                engine.counters().record_delivery_failure();
                self.request_close();
            }
        }
        true
    }
}

impl fmt::Debug for ConnectionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_line() {
        let entry = PresenceEntry {
            handler: HandlerId::new("handler-3"),
            remote_addr: Some("127.0.0.1:7001".parse().unwrap()),
            local_addr: Some("127.0.0.1:7000".parse().unwrap()),
            client: Some(ClientId::from("alice")),
        };
        assert_eq!(
            entry.to_string(),
            "[handler-3] alice remote=127.0.0.1:7001 local=127.0.0.1:7000"
        );

        let pending = PresenceEntry {
            handler: HandlerId::new("handler-0"),
            remote_addr: None,
            local_addr: None,
            client: None,
        };
        assert_eq!(pending.to_string(), "[handler-0] <handshaking>");
    }

    #[test]
    fn test_new_handler_is_idle() {
        let (handler, _assignments) = ConnectionHandler::new(HandlerId::new("handler-0"));
        assert!(!handler.is_open());
        assert!(!handler.is_shutting_down());
        assert_eq!(handler.client(), None);
        assert_eq!(handler.snapshot().remote_addr, None);
    }

    #[test]
    fn test_stop_is_terminal() {
        let (handler, _assignments) = ConnectionHandler::new(HandlerId::new("handler-0"));
        handler.stop();
        handler.stop();
        assert!(handler.is_shutting_down());
        assert!(!handler.is_open());
    }
}
