//! Cryptographic primitives for SecureChat
//!
//! This module provides the credential provider consumed by the handshake and
//! the message loop. The core only talks to the `CredentialProvider` trait; the
//! default `StoreCredentials` implementation uses Ed25519 signatures, an
//! X25519 sealed box for asymmetric encryption and AES-256-GCM for session
//! traffic.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::certificate::{Certificate, TrustedRoot};
use crate::errors::{CryptographicError, Result, TrustError};
use crate::keystore::KeyStore;
use crate::types::{PeerPublicKey, SessionKey, PUBLIC_KEY_LEN, SESSION_KEY_LEN, SIGNATURE_LEN};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// AES-GCM nonce length
pub const NONCE_LEN: usize = 12;

const SEAL_DOMAIN: &[u8] = b"securechat/seal/v1";

// ----------------------------------------------------------------------------
// Credential Provider
// ----------------------------------------------------------------------------

/// The cryptographic capability consumed by the handshake and message loop
pub trait CredentialProvider: Send + Sync {
    /// Extract this participant's own certificate from its credential store
    fn certificate(&self) -> Result<Certificate>;

    /// Extract the public key bound by a certificate
    fn public_key(&self, certificate: &Certificate) -> Result<PeerPublicKey>;

    /// Verify that a certificate was issued by the trusted root; fails loudly
    fn verify_certificate(&self, certificate: &Certificate, root: &TrustedRoot) -> Result<()>;

    /// Sign bytes with this participant's private key
    fn sign(&self, data: &[u8]) -> Result<[u8; SIGNATURE_LEN]>;

    /// Verify a signature made by the holder of `key`
    fn verify_signature(&self, key: &PeerPublicKey, data: &[u8], signature: &[u8]) -> Result<()>;

    /// Encrypt bytes so only the holder of `key` can read them
    fn encrypt_asymmetric(&self, key: &PeerPublicKey, data: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt bytes encrypted under this participant's public key
    fn decrypt_asymmetric(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Generate a fresh random 256-bit session key
    fn generate_symmetric_key(&self) -> Result<SessionKey>;

    /// Encrypt text under a session key
    fn encrypt_symmetric(&self, text: &str, key: &SessionKey) -> Result<String>;

    /// Decrypt text produced by `encrypt_symmetric`
    fn decrypt_symmetric(&self, text: &str, key: &SessionKey) -> Result<String>;
}

// ----------------------------------------------------------------------------
// Store-backed Credentials
// ----------------------------------------------------------------------------

/// Private half of a participant's credentials
pub struct PrivateKey {
    signing: SigningKey,
    encryption: StaticSecret,
}

impl PrivateKey {
    /// Build from raw secret bytes
    pub fn from_bytes(signing: &[u8; 32], encryption: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(signing),
            encryption: StaticSecret::from(*encryption),
        }
    }

    /// Derive the matching public keys
    pub fn public_key(&self) -> PeerPublicKey {
        PeerPublicKey {
            signing: self.signing.verifying_key().to_bytes(),
            encryption: X25519Public::from(&self.encryption).to_bytes(),
        }
    }
}

impl core::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PrivateKey")
            .field("public", &self.public_key().short_fingerprint())
            .finish()
    }
}

/// Default provider backed by a `KeyStore`
#[derive(Debug)]
pub struct StoreCredentials {
    store: KeyStore,
    private_key: PrivateKey,
}

impl StoreCredentials {
    /// Wrap a key store, extracting its private key once
    pub fn new(store: KeyStore) -> Self {
        let private_key = store.private_key();
        Self { store, private_key }
    }

    /// Subject name of the wrapped certificate
    pub fn subject(&self) -> &str {
        self.store.certificate().subject()
    }
}

impl CredentialProvider for StoreCredentials {
    fn certificate(&self) -> Result<Certificate> {
        Ok(self.store.certificate().clone())
    }

    fn public_key(&self, certificate: &Certificate) -> Result<PeerPublicKey> {
        let key = *certificate.public_key();
        VerifyingKey::from_bytes(&key.signing).map_err(|_| TrustError::MalformedPublicKey {
            subject: certificate.subject().to_string(),
        })?;
        Ok(key)
    }

    fn verify_certificate(&self, certificate: &Certificate, root: &TrustedRoot) -> Result<()> {
        certificate.verify(root)
    }

    fn sign(&self, data: &[u8]) -> Result<[u8; SIGNATURE_LEN]> {
        Ok(self.private_key.signing.sign(data).to_bytes())
    }

    fn verify_signature(&self, key: &PeerPublicKey, data: &[u8], signature: &[u8]) -> Result<()> {
        verify_signature(key, data, signature)
    }

    fn encrypt_asymmetric(&self, key: &PeerPublicKey, data: &[u8]) -> Result<Vec<u8>> {
        seal(key, data)
    }

    fn decrypt_asymmetric(&self, data: &[u8]) -> Result<Vec<u8>> {
        open(&self.private_key, data)
    }

    fn generate_symmetric_key(&self) -> Result<SessionKey> {
        generate_session_key()
    }

    fn encrypt_symmetric(&self, text: &str, key: &SessionKey) -> Result<String> {
        encrypt_symmetric(text, key)
    }

    fn decrypt_symmetric(&self, text: &str, key: &SessionKey) -> Result<String> {
        decrypt_symmetric(text, key)
    }
}

// ----------------------------------------------------------------------------
// Primitives
// ----------------------------------------------------------------------------

/// Fill a fixed-size array from the operating system RNG
pub fn random_array<const N: usize>() -> Result<[u8; N]> {
    let mut bytes = [0u8; N];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|_| CryptographicError::RandomGenerationFailed)?;
    Ok(bytes)
}

/// Generate a fresh random session key
pub fn generate_session_key() -> Result<SessionKey> {
    Ok(SessionKey::new(random_array::<SESSION_KEY_LEN>()?))
}

/// Verify an Ed25519 signature over `data`
pub fn verify_signature(key: &PeerPublicKey, data: &[u8], signature: &[u8]) -> Result<()> {
    let verifying_key =
        VerifyingKey::from_bytes(&key.signing).map_err(|_| CryptographicError::InvalidKeyFormat)?;
    let signature: [u8; SIGNATURE_LEN] = signature
        .try_into()
        .map_err(|_| CryptographicError::SignatureVerificationFailed)?;

    verifying_key
        .verify(data, &Signature::from_bytes(&signature))
        .map_err(|_| CryptographicError::SignatureVerificationFailed.into())
}

/// Encrypt `text` under `key`, returning `base64(nonce || ciphertext)`
pub fn encrypt_symmetric(text: &str, key: &SessionKey) -> Result<String> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|_| CryptographicError::InvalidKeyFormat)?;
    let nonce = random_array::<NONCE_LEN>()?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), text.as_bytes())
        .map_err(|_| CryptographicError::EncryptionFailed)?;

    let mut framed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    framed.extend_from_slice(&nonce);
    framed.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(framed))
}

/// Decrypt text produced by `encrypt_symmetric`
pub fn decrypt_symmetric(text: &str, key: &SessionKey) -> Result<String> {
    let framed = STANDARD
        .decode(text)
        .map_err(|_| CryptographicError::InvalidEncoding)?;
    if framed.len() < NONCE_LEN {
        return Err(CryptographicError::InvalidEncoding.into());
    }

    let (nonce, ciphertext) = framed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|_| CryptographicError::InvalidKeyFormat)?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptographicError::DecryptionFailed)?;

    String::from_utf8(plaintext).map_err(|_| CryptographicError::DecryptionFailed.into())
}

fn seal_key(shared: &[u8; 32], ephemeral: &[u8; 32], recipient: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(SEAL_DOMAIN);
    hasher.update(shared);
    hasher.update(ephemeral);
    hasher.update(recipient);
    let hash = hasher.finalize();

    let mut key = [0u8; 32];
    key.copy_from_slice(&hash);
    key
}

/// Encrypt `data` for the holder of `recipient`'s encryption key.
///
/// Output layout: `ephemeral public key (32) || AES-256-GCM ciphertext`. The
/// AES key is single-use, so the nonce is fixed at zero.
pub fn seal(recipient: &PeerPublicKey, data: &[u8]) -> Result<Vec<u8>> {
    let ephemeral = StaticSecret::from(random_array::<32>()?);
    let ephemeral_public = X25519Public::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&X25519Public::from(recipient.encryption));
    if !shared.was_contributory() {
        return Err(CryptographicError::InvalidKeyFormat.into());
    }

    let key = seal_key(shared.as_bytes(), ephemeral_public.as_bytes(), &recipient.encryption);
    let cipher =
        Aes256Gcm::new_from_slice(&key).map_err(|_| CryptographicError::InvalidKeyFormat)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&[0u8; NONCE_LEN]), data)
        .map_err(|_| CryptographicError::EncryptionFailed)?;

    let mut sealed = Vec::with_capacity(PUBLIC_KEY_LEN + ciphertext.len());
    sealed.extend_from_slice(ephemeral_public.as_bytes());
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Decrypt data produced by `seal` for this private key
pub fn open(private_key: &PrivateKey, sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() <= PUBLIC_KEY_LEN {
        return Err(CryptographicError::DecryptionFailed.into());
    }

    let (ephemeral, ciphertext) = sealed.split_at(PUBLIC_KEY_LEN);
    let ephemeral: [u8; PUBLIC_KEY_LEN] = ephemeral
        .try_into()
        .map_err(|_| CryptographicError::DecryptionFailed)?;
    let own_public = X25519Public::from(&private_key.encryption);
    let shared = private_key
        .encryption
        .diffie_hellman(&X25519Public::from(ephemeral));
    if !shared.was_contributory() {
        return Err(CryptographicError::DecryptionFailed.into());
    }

    let key = seal_key(shared.as_bytes(), &ephemeral, own_public.as_bytes());
    let cipher =
        Aes256Gcm::new_from_slice(&key).map_err(|_| CryptographicError::InvalidKeyFormat)?;
    cipher
        .decrypt(Nonce::from_slice(&[0u8; NONCE_LEN]), ciphertext)
        .map_err(|_| CryptographicError::DecryptionFailed.into())
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
