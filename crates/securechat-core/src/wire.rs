//! Wire format for SecureChat
//!
//! Every unit on the wire is a frame: a big-endian `u32` length followed by
//! that many bytes. Handshake units carry raw bytes or bincode values;
//! steady-state client messages are bincode `Envelope`s and server deliveries
//! are bincode strings holding ciphertext.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::{ProtocolError, Result};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Maximum size of a single frame
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Separator between target and text in a private message payload
pub const PRIVATE_SEPARATOR: char = ',';

// ----------------------------------------------------------------------------
// Framing
// ----------------------------------------------------------------------------

/// Write one length-prefixed frame and flush
pub async fn write_frame<W>(io: &mut W, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if data.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            size: data.len(),
            max: MAX_FRAME_LEN,
        }
        .into());
    }

    io.write_u32(data.len() as u32).await?;
    io.write_all(data).await?;
    io.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame
///
/// A clean end of stream before the length prefix reports `ConnectionClosed`.
pub async fn read_frame<R>(io: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let len = match io.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::ConnectionClosed.into())
        }
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_LEN,
        }
        .into());
    }

    let mut data = vec![0u8; len];
    io.read_exact(&mut data).await?;
    Ok(data)
}

/// Serialize a value with bincode and write it as one frame
pub async fn write_value<W, T>(io: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let bytes = bincode::serialize(value)?;
    write_frame(io, &bytes).await
}

/// Read one frame and deserialize it with bincode
pub async fn read_value<R, T>(io: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let bytes = read_frame(io).await?;
    Ok(bincode::deserialize(&bytes)?)
}

// ----------------------------------------------------------------------------
// Message Types
// ----------------------------------------------------------------------------

/// Wire tags of client messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    WhoIsIn = 0,
    Message = 1,
    Logout = 2,
    PrivateMessage = 3,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(tag: u8) -> core::result::Result<Self, u8> {
        match tag {
            0 => Ok(MessageType::WhoIsIn),
            1 => Ok(MessageType::Message),
            2 => Ok(MessageType::Logout),
            3 => Ok(MessageType::PrivateMessage),
            other => Err(other),
        }
    }
}

/// Raw client message as it travels on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub tag: u8,
    pub body: String,
}

/// Addressee of a private message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Recipient {
    /// The client whose connection has this remote port
    Port(u16),
    /// The client with this identifier
    Client(String),
}

impl Recipient {
    /// Numeric targets address a remote port; anything else is an identifier
    pub fn parse(target: &str) -> Self {
        let target = target.trim();
        match target.parse::<u16>() {
            Ok(port) => Recipient::Port(port),
            Err(_) => Recipient::Client(target.to_string()),
        }
    }
}

impl core::fmt::Display for Recipient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Recipient::Port(port) => write!(f, "{}", port),
            Recipient::Client(name) => f.write_str(name),
        }
    }
}

/// Typed client message received over an established session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatMessage {
    /// Chat text, encrypted under the sender's session key
    Message(String),
    /// Graceful disconnect notice
    Logout,
    /// Request for the list of connected clients
    WhoIsIn,
    /// Text for one client, encrypted under the sender's session key
    PrivateMessage {
        target: Recipient,
        ciphertext: String,
    },
    /// Tag this server does not know; ignored by the dispatcher
    Unknown(u8),
}

impl ChatMessage {
    /// Decode a wire envelope.
    ///
    /// Only a private message with a payload that cannot be split into
    /// `target,text` fails.
    pub fn from_envelope(envelope: Envelope) -> Result<Self> {
        let message = match MessageType::try_from(envelope.tag) {
            Ok(MessageType::Message) => ChatMessage::Message(envelope.body),
            Ok(MessageType::Logout) => ChatMessage::Logout,
            Ok(MessageType::WhoIsIn) => ChatMessage::WhoIsIn,
            Ok(MessageType::PrivateMessage) => {
                let (target, ciphertext) = split_private_payload(&envelope.body)?;
                ChatMessage::PrivateMessage {
                    target: Recipient::parse(target),
                    ciphertext: ciphertext.to_string(),
                }
            }
            Err(tag) => ChatMessage::Unknown(tag),
        };
        Ok(message)
    }

    /// Encode for the wire
    pub fn to_envelope(&self) -> Envelope {
        let (tag, body) = match self {
            ChatMessage::Message(ciphertext) => (MessageType::Message as u8, ciphertext.clone()),
            ChatMessage::Logout => (MessageType::Logout as u8, String::new()),
            ChatMessage::WhoIsIn => (MessageType::WhoIsIn as u8, String::new()),
            ChatMessage::PrivateMessage { target, ciphertext } => (
                MessageType::PrivateMessage as u8,
                format!("{}{}{}", target, PRIVATE_SEPARATOR, ciphertext),
            ),
            ChatMessage::Unknown(tag) => (*tag, String::new()),
        };
        Envelope { tag, body }
    }
}

/// Split a private payload at the first separator into exactly two fields
fn split_private_payload(payload: &str) -> Result<(&str, &str)> {
    let (target, text) = payload.split_once(PRIVATE_SEPARATOR).ok_or_else(|| {
        ProtocolError::MalformedPrivateMessage {
            reason: "missing separator".to_string(),
        }
    })?;

    if target.trim().is_empty() {
        return Err(ProtocolError::MalformedPrivateMessage {
            reason: "empty target".to_string(),
        }
        .into());
    }
    Ok((target, text))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
