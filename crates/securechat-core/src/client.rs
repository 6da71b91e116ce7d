//! Client side of a SecureChat connection
//!
//! `ChatClient` performs the client role of the handshake and then offers a
//! typed API over the established session. It can be split into a sender and
//! a receiver so reading server deliveries and sending user input can run
//! concurrently.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, info};

use crate::certificate::TrustedRoot;
use crate::crypto::CredentialProvider;
use crate::errors::Result;
use crate::handshake::{client_handshake, ClientSession};
use crate::types::SessionKey;
use crate::wire::{read_value, write_value, ChatMessage, Recipient};

// ----------------------------------------------------------------------------
// Chat Client
// ----------------------------------------------------------------------------

/// An authenticated connection to a SecureChat server
pub struct ChatClient {
    sender: ClientSender,
    receiver: ClientReceiver,
    server_subject: String,
    local_addr: SocketAddr,
}

impl ChatClient {
    /// Connect, run the handshake and announce `identifier`
    pub async fn connect<A: ToSocketAddrs>(
        addr: A,
        credentials: Arc<dyn CredentialProvider>,
        root: &TrustedRoot,
        identifier: &str,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let local_addr = stream.local_addr()?;
        let (mut reader, mut writer) = stream.into_split();

        let ClientSession {
            server_subject,
            session_key,
            ..
        } = client_handshake(&mut reader, &mut writer, credentials.as_ref(), root, identifier)
            .await?;
        info!(server = %server_subject, identifier, "Session established");

        Ok(Self {
            sender: ClientSender {
                writer,
                credentials: Arc::clone(&credentials),
                session_key: session_key.clone(),
            },
            receiver: ClientReceiver {
                reader,
                credentials,
                session_key,
            },
            server_subject,
            local_addr,
        })
    }

    /// Subject of the server's certificate
    pub fn server_subject(&self) -> &str {
        &self.server_subject
    }

    /// Local address of the connection; its port addresses this client in private messages
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The negotiated session key
    pub fn session_key(&self) -> &SessionKey {
        &self.sender.session_key
    }

    /// Broadcast chat text
    pub async fn send_chat(&mut self, text: &str) -> Result<()> {
        self.sender.send_chat(text).await
    }

    /// Send text to one client
    pub async fn send_private(&mut self, target: Recipient, text: &str) -> Result<()> {
        self.sender.send_private(target, text).await
    }

    /// Ask for the list of connected clients
    pub async fn who_is_in(&mut self) -> Result<()> {
        self.sender.who_is_in().await
    }

    /// Announce a graceful disconnect
    pub async fn logout(&mut self) -> Result<()> {
        self.sender.logout().await
    }

    /// Send an arbitrary message
    pub async fn send(&mut self, message: &ChatMessage) -> Result<()> {
        self.sender.send(message).await
    }

    /// Wait for the next delivery from the server and decrypt it
    pub async fn receive(&mut self) -> Result<String> {
        self.receiver.receive().await
    }

    /// Split into independently usable halves
    pub fn into_split(self) -> (ClientSender, ClientReceiver) {
        (self.sender, self.receiver)
    }
}

// ----------------------------------------------------------------------------
// Halves
// ----------------------------------------------------------------------------

/// Sending half of a client session
pub struct ClientSender {
    writer: OwnedWriteHalf,
    credentials: Arc<dyn CredentialProvider>,
    session_key: SessionKey,
}

impl ClientSender {
    pub async fn send_chat(&mut self, text: &str) -> Result<()> {
        let ciphertext = self.credentials.encrypt_symmetric(text, &self.session_key)?;
        self.send(&ChatMessage::Message(ciphertext)).await
    }

    pub async fn send_private(&mut self, target: Recipient, text: &str) -> Result<()> {
        let ciphertext = self.credentials.encrypt_symmetric(text, &self.session_key)?;
        self.send(&ChatMessage::PrivateMessage { target, ciphertext })
            .await
    }

    pub async fn who_is_in(&mut self) -> Result<()> {
        self.send(&ChatMessage::WhoIsIn).await
    }

    pub async fn logout(&mut self) -> Result<()> {
        self.send(&ChatMessage::Logout).await
    }

    pub async fn send(&mut self, message: &ChatMessage) -> Result<()> {
        debug!(?message, "Sending");
        write_value(&mut self.writer, &message.to_envelope()).await
    }
}

/// Receiving half of a client session
pub struct ClientReceiver {
    reader: OwnedReadHalf,
    credentials: Arc<dyn CredentialProvider>,
    session_key: SessionKey,
}

impl ClientReceiver {
    /// Wait for the next delivery from the server and decrypt it
    pub async fn receive(&mut self) -> Result<String> {
        let ciphertext: String = read_value(&mut self.reader).await?;
        self.credentials
            .decrypt_symmetric(&ciphertext, &self.session_key)
    }
}

impl core::fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChatClient")
            .field("server", &self.server_subject)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}
