//! Credential stores on disk
//!
//! A key store holds one participant's certificate and private keys. Key
//! stores, trusted roots and authorities are persisted as TOML with hex
//! encoded secrets and a base64 encoded certificate.

use std::fs;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::certificate::{Certificate, CertificateAuthority, TrustedRoot};
use crate::crypto::{random_array, PrivateKey};
use crate::errors::{ChatError, Result};

// ----------------------------------------------------------------------------
// Key Store
// ----------------------------------------------------------------------------

/// One participant's certificate and private key material
#[derive(Clone)]
pub struct KeyStore {
    certificate: Certificate,
    signing_secret: [u8; 32],
    encryption_secret: [u8; 32],
}

impl core::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KeyStore")
            .field("subject", &self.certificate.subject())
            .field("issuer", &self.certificate.issuer())
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
struct KeyStoreFile {
    subject: String,
    signing_secret: String,
    encryption_secret: String,
    certificate: String,
}

impl KeyStore {
    /// Generate fresh keys for `subject` and have `authority` certify them
    pub fn generate(subject: &str, authority: &CertificateAuthority) -> Result<Self> {
        let signing_secret = random_array::<32>()?;
        let encryption_secret = random_array::<32>()?;
        let public_key = PrivateKey::from_bytes(&signing_secret, &encryption_secret).public_key();
        let certificate = authority.issue(subject, public_key)?;

        Ok(Self {
            certificate,
            signing_secret,
            encryption_secret,
        })
    }

    /// Assemble a key store from parts, checking that the certificate matches the keys
    pub fn from_parts(
        certificate: Certificate,
        signing_secret: [u8; 32],
        encryption_secret: [u8; 32],
    ) -> Result<Self> {
        let derived = PrivateKey::from_bytes(&signing_secret, &encryption_secret).public_key();
        if &derived != certificate.public_key() {
            return Err(ChatError::key_store(format!(
                "certificate for {} does not match the stored private keys",
                certificate.subject()
            )));
        }

        Ok(Self {
            certificate,
            signing_secret,
            encryption_secret,
        })
    }

    /// The stored certificate
    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// Extract the private key
    pub fn private_key(&self) -> PrivateKey {
        PrivateKey::from_bytes(&self.signing_secret, &self.encryption_secret)
    }

    /// Load a key store from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())?;
        let file: KeyStoreFile = toml::from_str(&contents)?;

        let cert_bytes = STANDARD
            .decode(&file.certificate)
            .map_err(|e| ChatError::key_store(format!("certificate encoding: {}", e)))?;
        let certificate = Certificate::decode(&cert_bytes)?;
        if certificate.subject() != file.subject {
            return Err(ChatError::key_store(format!(
                "key store subject {} does not match certificate subject {}",
                file.subject,
                certificate.subject()
            )));
        }

        Self::from_parts(
            certificate,
            decode_key("signing_secret", &file.signing_secret)?,
            decode_key("encryption_secret", &file.encryption_secret)?,
        )
    }

    /// Save the key store to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = KeyStoreFile {
            subject: self.certificate.subject().to_string(),
            signing_secret: hex::encode(self.signing_secret),
            encryption_secret: hex::encode(self.encryption_secret),
            certificate: STANDARD.encode(self.certificate.encode()?),
        };
        fs::write(path.as_ref(), toml::to_string_pretty(&file)?)?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Trusted Root and Authority Files
// ----------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct TrustedRootFile {
    name: String,
    public_key: String,
}

#[derive(Serialize, Deserialize)]
struct AuthorityFile {
    name: String,
    secret: String,
}

impl TrustedRoot {
    /// Load a trusted root from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())?;
        let file: TrustedRootFile = toml::from_str(&contents)?;
        Ok(Self {
            name: file.name,
            public_key: decode_key("public_key", &file.public_key)?,
        })
    }

    /// Save the trusted root to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = TrustedRootFile {
            name: self.name.clone(),
            public_key: hex::encode(self.public_key),
        };
        fs::write(path.as_ref(), toml::to_string_pretty(&file)?)?;
        Ok(())
    }
}

impl CertificateAuthority {
    /// Load an authority (including its private key) from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())?;
        let file: AuthorityFile = toml::from_str(&contents)?;
        let secret = decode_key("secret", &file.secret)?;
        Ok(Self::from_bytes(file.name, &secret))
    }

    /// Save the authority (including its private key) to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = AuthorityFile {
            name: self.name().to_string(),
            secret: hex::encode(self.secret_bytes()),
        };
        fs::write(path.as_ref(), toml::to_string_pretty(&file)?)?;
        Ok(())
    }
}

fn decode_key(field: &str, value: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(value)
        .map_err(|e| ChatError::key_store(format!("{}: invalid hex: {}", field, e)))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| ChatError::key_store(format!("{}: expected 32 bytes, got {}", field, bytes.len())))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
