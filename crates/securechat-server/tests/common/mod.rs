//! Shared fixtures for the server integration tests

#![allow(dead_code)]

use std::sync::Arc;

use securechat_core::{
    CertificateAuthority, ChatClient, KeyStore, StoreCredentials, TrustedRoot,
};
use securechat_server::{ServerBuilder, ServerHandle, ServerEvent};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration, Instant};

pub const WAIT: Duration = Duration::from_secs(5);

/// A certificate authority plus a running server trusting it
pub struct TestServer {
    pub ca: CertificateAuthority,
    pub root: TrustedRoot,
    pub handle: ServerHandle,
    pub events: mpsc::UnboundedReceiver<ServerEvent>,
}

pub async fn start_server(pool_size: usize) -> TestServer {
    start_server_with(pool_size, |builder| builder).await
}

/// Start a server after applying `configure` to its builder
pub async fn start_server_with<F>(pool_size: usize, configure: F) -> TestServer
where
    F: FnOnce(ServerBuilder) -> ServerBuilder,
{
    let ca = CertificateAuthority::generate("Test Root").unwrap();
    let root = ca.root();
    let credentials = StoreCredentials::new(KeyStore::generate("server", &ca).unwrap());
    let (sink, events) = securechat_server::ChannelEventSink::new();

    let builder = ServerBuilder::new(Arc::new(credentials), root.clone())
        .bind_address("127.0.0.1:0")
        .pool_size(pool_size)
        .event_sink(Arc::new(sink));
    let handle = configure(builder)
        .build_and_start()
        .await
        .expect("Failed to start server");

    TestServer {
        ca,
        root,
        handle,
        events,
    }
}

impl TestServer {
    /// Connect a client whose certificate was issued by the server's authority
    pub async fn connect(&self, name: &str) -> securechat_core::Result<ChatClient> {
        let credentials = StoreCredentials::new(KeyStore::generate(name, &self.ca).unwrap());
        ChatClient::connect(
            self.handle.local_addr(),
            Arc::new(credentials),
            &self.root,
            name,
        )
        .await
    }

    /// Connect and wait until the server has registered the session
    pub async fn login(&self, name: &str) -> ChatClient {
        let client = self.connect(name).await.expect("Handshake failed");
        let registry = Arc::clone(self.handle.engine().registry());
        let id = securechat_core::ClientId::from(name);
        eventually(|| registry.contains(&id)).await;
        client
    }

    /// Drain chat lines seen by the event sink so far
    pub fn chat_lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let ServerEvent::Chat(line) = event {
                lines.push(line);
            }
        }
        lines
    }
}

/// Poll `condition` until it holds, panicking after `WAIT`
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "Condition not reached in time");
        sleep(Duration::from_millis(10)).await;
    }
}

/// Next delivery for `client`, failing the test if none arrives
pub async fn next_line(client: &mut ChatClient) -> String {
    timeout(WAIT, client.receive())
        .await
        .expect("Timed out waiting for delivery")
        .expect("Receive failed")
}

/// Whether `client` receives nothing within a short window
pub async fn stays_silent(client: &mut ChatClient) -> bool {
    timeout(Duration::from_millis(300), client.receive()).await.is_err()
}
