//! The SecureChat handshake
//!
//! Converts a fresh bidirectional stream into an authenticated session with a
//! shared AES-256 key. Four units cross the wire, in order:
//!
//! 1. server → client: server certificate (cleartext)
//! 2. client → server: client certificate (cleartext)
//! 3. server → client: `signature(64) || seal(client key, session key)`
//! 4. client → server: client identifier encrypted under the session key
//!
//! Each side verifies the other's certificate against the trusted root before
//! using any key it carries. The key material carries no nonce or timestamp,
//! so a captured unit 3 can be replayed to the same client; changing that
//! would change the wire format.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::certificate::{Certificate, TrustedRoot};
use crate::crypto::CredentialProvider;
use crate::errors::{CryptographicError, ProtocolError, Result, TrustError};
use crate::types::{ClientId, PeerPublicKey, SessionKey, SIGNATURE_LEN};
use crate::wire::{read_frame, read_value, write_frame, write_value};

// ----------------------------------------------------------------------------
// Handshake Results
// ----------------------------------------------------------------------------

/// Outcome of a completed server-side handshake
#[derive(Debug, Clone)]
pub struct EstablishedSession {
    /// Identifier the client announced in the final unit
    pub client_id: ClientId,
    /// Subject of the client's verified certificate
    pub certificate_subject: String,
    /// Public key extracted from the client's certificate
    pub public_key: PeerPublicKey,
    /// Session key generated for this connection
    pub session_key: SessionKey,
}

/// Outcome of a completed client-side handshake
#[derive(Debug, Clone)]
pub struct ClientSession {
    /// Subject of the server's verified certificate
    pub server_subject: String,
    /// Public key extracted from the server's certificate
    pub server_key: PeerPublicKey,
    /// Session key received from the server
    pub session_key: SessionKey,
}

// ----------------------------------------------------------------------------
// Server Role
// ----------------------------------------------------------------------------

/// Run the server side of the handshake.
///
/// Any error is fatal to the connection. Recording the session is left to the caller.
pub async fn server_handshake<R, W>(
    reader: &mut R,
    writer: &mut W,
    credentials: &dyn CredentialProvider,
    root: &TrustedRoot,
) -> Result<EstablishedSession>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // 1. Our certificate, in cleartext
    let own_certificate = credentials.certificate()?;
    write_frame(writer, &own_certificate.encode()?).await?;
    debug!(subject = own_certificate.subject(), "Sent server certificate");

    // 2-4. The peer's certificate, verified before its key is used
    let peer_certificate = Certificate::decode(&read_frame(reader).await?)?;
    credentials.verify_certificate(&peer_certificate, root)?;
    let public_key = credentials.public_key(&peer_certificate)?;
    debug!(
        subject = peer_certificate.subject(),
        fingerprint = %public_key.short_fingerprint(),
        "Client certificate verified"
    );

    // 5-7. Fresh session key, signed for authenticity and sealed for confidentiality
    let session_key = credentials.generate_symmetric_key()?;
    let signature = credentials.sign(session_key.as_bytes())?;
    let sealed = credentials.encrypt_asymmetric(&public_key, session_key.as_bytes())?;

    let mut key_unit = Vec::with_capacity(SIGNATURE_LEN + sealed.len());
    key_unit.extend_from_slice(&signature);
    key_unit.extend_from_slice(&sealed);
    write_frame(writer, &key_unit).await?;

    // 8. The client's identifier under the new key
    let encrypted_identifier: String = read_value(reader).await?;
    let identifier = credentials.decrypt_symmetric(&encrypted_identifier, &session_key)?;
    if identifier.trim().is_empty() {
        return Err(ProtocolError::EmptyIdentifier.into());
    }

    Ok(EstablishedSession {
        client_id: ClientId::new(identifier),
        certificate_subject: peer_certificate.subject().to_string(),
        public_key,
        session_key,
    })
}

// ----------------------------------------------------------------------------
// Client Role
// ----------------------------------------------------------------------------

/// Run the client side of the handshake, announcing `identifier` to the server
pub async fn client_handshake<R, W>(
    reader: &mut R,
    writer: &mut W,
    credentials: &dyn CredentialProvider,
    root: &TrustedRoot,
    identifier: &str,
) -> Result<ClientSession>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let server_certificate = Certificate::decode(&read_frame(reader).await?)?;
    credentials.verify_certificate(&server_certificate, root)?;
    let server_key = credentials.public_key(&server_certificate)?;
    debug!(subject = server_certificate.subject(), "Server certificate verified");

    let own_certificate = credentials.certificate()?;
    write_frame(writer, &own_certificate.encode()?).await?;

    let key_unit = read_frame(reader).await?;
    let session_key = open_key_unit(credentials, &server_key, server_certificate.subject(), &key_unit)?;

    let encrypted_identifier = credentials.encrypt_symmetric(identifier, &session_key)?;
    write_value(writer, &encrypted_identifier).await?;

    Ok(ClientSession {
        server_subject: server_certificate.subject().to_string(),
        server_key,
        session_key,
    })
}

/// Split `signature || sealed key`, recover the key and check the server signed it
fn open_key_unit(
    credentials: &dyn CredentialProvider,
    server_key: &PeerPublicKey,
    server_subject: &str,
    key_unit: &[u8],
) -> Result<SessionKey> {
    if key_unit.len() <= SIGNATURE_LEN {
        return Err(ProtocolError::KeyUnitTooShort {
            expected: SIGNATURE_LEN,
            actual: key_unit.len(),
        }
        .into());
    }

    let (signature, sealed) = key_unit.split_at(SIGNATURE_LEN);
    let key_bytes = credentials.decrypt_asymmetric(sealed)?;
    let session_key =
        SessionKey::from_slice(&key_bytes).ok_or(CryptographicError::InvalidKeyFormat)?;

    credentials
        .verify_signature(server_key, session_key.as_bytes(), signature)
        .map_err(|_| TrustError::KeySignatureMismatch {
            subject: server_subject.to_string(),
        })?;

    Ok(session_key)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
