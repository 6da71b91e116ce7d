//! SecureChat Server Engine
//!
//! This crate contains the server side of SecureChat:
//! - `Engine`: the fixed-capacity pool of connection handlers
//! - `ConnectionHandler`: one worker slot running handshake and message loop
//! - `SessionRegistry`: authenticated clients and their session keys
//! - `Listener` and `ServerBuilder`: the accept loop and its assembly
//!
//! `securechat-core` provides the handshake, credentials and wire format.

pub mod builder;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod handler;
pub mod listener;
pub mod registry;
pub mod stats;

pub use builder::{ServerBuilder, ServerHandle};
pub use engine::{Engine, EngineLimits, PoolCounts};
pub use error::{ServerError, ServerResult};
pub use events::{ChannelEventSink, EventSink, ServerEvent, TracingEventSink};
pub use handler::{ConnectionHandler, HandlerId, PresenceEntry};
pub use listener::Listener;
pub use registry::{SessionEntry, SessionRegistry};
pub use stats::StatsSnapshot;

// Re-export core types for convenience
pub use securechat_core::{
    ChatClient, ChatError, ClientId, CredentialProvider, Recipient, ServerConfig, StoreCredentials,
    TrustedRoot,
};
