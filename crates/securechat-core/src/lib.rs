//! SecureChat Core Protocol Implementation
//!
//! This crate provides the foundational types, credential provider, wire
//! format and handshake for the SecureChat certificate-authenticated chat
//! service, plus the client role used by chat clients and integration tests.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod certificate;
pub mod client;
pub mod config;
pub mod crypto;
pub mod errors;
pub mod handshake;
pub mod keystore;
pub mod types;
pub mod wire;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use certificate::{Certificate, CertificateAuthority, TrustedRoot};
pub use client::{ChatClient, ClientReceiver, ClientSender};
pub use config::{ClientConfig, ServerConfig};
pub use crypto::{CredentialProvider, StoreCredentials};
pub use errors::{ChatError, CryptographicError, ProtocolError, Result, TrustError};
pub use handshake::{client_handshake, server_handshake, ClientSession, EstablishedSession};
pub use keystore::KeyStore;
pub use types::{ClientId, PeerPublicKey, SessionKey, SESSION_KEY_LEN, SIGNATURE_LEN};
pub use wire::{ChatMessage, Envelope, MessageType, Recipient};
