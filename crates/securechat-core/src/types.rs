//! Core types for the SecureChat protocol
//!
//! This module defines the fundamental types used throughout the protocol,
//! using newtype patterns for semantic validation and type safety.

use core::fmt;
use core::ops::Deref;
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Length of an Ed25519 signature; the implicit boundary of the key exchange unit
pub const SIGNATURE_LEN: usize = 64;

/// Length of a session key (AES-256)
pub const SESSION_KEY_LEN: usize = 32;

/// Length of a raw public key (Ed25519 or X25519)
pub const PUBLIC_KEY_LEN: usize = 32;

// ----------------------------------------------------------------------------
// Client Identifier
// ----------------------------------------------------------------------------

/// Authenticated identifier (username) of a connected client
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(String);

impl ClientId {
    /// Create a new client identifier
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self(name.into())
    }

    /// Get the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Deref for ClientId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ----------------------------------------------------------------------------
// Session Key
// ----------------------------------------------------------------------------

/// Symmetric key negotiated for one connection
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    /// Wrap raw key bytes
    pub fn new(bytes: [u8; SESSION_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Build a key from a slice, which must be exactly `SESSION_KEY_LEN` bytes
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let key: [u8; SESSION_KEY_LEN] = bytes.try_into().ok()?;
        Some(Self(key))
    }

    /// Get the raw key bytes
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }
}

// Never print key material.
impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(<redacted>)")
    }
}

// ----------------------------------------------------------------------------
// Peer Public Key
// ----------------------------------------------------------------------------

/// Public half of a participant's credentials, as carried in its certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerPublicKey {
    /// Ed25519 key used to verify signatures made by the participant
    pub signing: [u8; PUBLIC_KEY_LEN],
    /// X25519 key used to encrypt data for the participant
    pub encryption: [u8; PUBLIC_KEY_LEN],
}

impl PeerPublicKey {
    /// Short hex fingerprint of the signing key, for log lines
    pub fn short_fingerprint(&self) -> String {
        hex::encode(&self.signing[..8])
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_display() {
        let id = ClientId::new("alice");
        assert_eq!(id.to_string(), "alice");
        assert_eq!(id.as_str(), "alice");
        assert_eq!(id.len(), 5);
    }

    #[test]
    fn test_session_key_from_slice() {
        assert!(SessionKey::from_slice(&[7u8; SESSION_KEY_LEN]).is_some());
        assert!(SessionKey::from_slice(&[7u8; 16]).is_none());
    }

    #[test]
    fn test_session_key_debug_is_redacted() {
        let key = SessionKey::new([0xAB; SESSION_KEY_LEN]);
        assert!(!format!("{:?}", key).contains("ab"));
    }
}
