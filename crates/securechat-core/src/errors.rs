//! Error types for the SecureChat protocol
//!
//! This module contains all error types used throughout the core protocol:
//! cryptographic errors, trust (certificate) errors, wire protocol errors and
//! the main `ChatError` type that unifies them.

use thiserror::Error;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Specific cryptographic error types
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptographicError {
    #[error("Signature verification failed")]
    SignatureVerificationFailed,
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Invalid key format")]
    InvalidKeyFormat,
    #[error("Invalid ciphertext encoding")]
    InvalidEncoding,
    #[error("Random number generation failed")]
    RandomGenerationFailed,
}

/// Certificate trust failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TrustError {
    #[error("Certificate for {subject} was not issued by trusted root {root}")]
    UntrustedIssuer { subject: String, root: String },
    #[error("Certificate signature for {subject} does not verify against the trusted root")]
    BadCertificateSignature { subject: String },
    #[error("Certificate for {subject} carries a malformed public key")]
    MalformedPublicKey { subject: String },
    #[error("Session key signature from {subject} does not verify")]
    KeySignatureMismatch { subject: String },
}

/// Wire protocol and framing errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("Key exchange unit too short: expected more than {expected} bytes, got {actual}")]
    KeyUnitTooShort { expected: usize, actual: usize },
    #[error("Malformed private message payload: {reason}")]
    MalformedPrivateMessage { reason: String },
    #[error("Client sent an empty identifier")]
    EmptyIdentifier,
    #[error("Handshake did not complete in time")]
    HandshakeTimedOut,
    #[error("Connection closed by peer")]
    ConnectionClosed,
}

// ----------------------------------------------------------------------------
// Main Error Type
// ----------------------------------------------------------------------------

/// Core error type for the SecureChat protocol
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptographicError),

    #[error("Trust error: {0}")]
    Trust(#[from] TrustError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Key store error: {message}")]
    KeyStore { message: String },
}

impl ChatError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a key store error
    pub fn key_store<S: Into<String>>(message: S) -> Self {
        Self::KeyStore {
            message: message.into(),
        }
    }

    /// Whether the error was raised by the transport rather than by the peer's data.
    ///
    /// An orderly close by the peer counts as a transport condition.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ChatError::Io(_) | ChatError::Protocol(ProtocolError::ConnectionClosed)
        )
    }

    /// Whether the error is a certificate or signature trust failure
    pub fn is_trust_failure(&self) -> bool {
        matches!(self, ChatError::Trust(_))
    }
}

impl From<toml::de::Error> for ChatError {
    fn from(err: toml::de::Error) -> Self {
        ChatError::config(err.to_string())
    }
}

impl From<toml::ser::Error> for ChatError {
    fn from(err: toml::ser::Error) -> Self {
        ChatError::config(err.to_string())
    }
}

/// Result type for core operations
pub type Result<T> = core::result::Result<T, ChatError>;

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        let io = ChatError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(io.is_transport());
        assert!(ChatError::Protocol(ProtocolError::ConnectionClosed).is_transport());
        assert!(!ChatError::Crypto(CryptographicError::DecryptionFailed).is_transport());
    }

    #[test]
    fn test_trust_classification() {
        let err = ChatError::from(TrustError::UntrustedIssuer {
            subject: "mallory".into(),
            root: "SecureChat Root CA".into(),
        });
        assert!(err.is_trust_failure());
        assert!(err.to_string().contains("mallory"));
    }
}
