//! Certificates and the trusted root authority
//!
//! A certificate binds a subject name to its public keys and carries an
//! Ed25519 signature from the issuing authority. Certificates travel over the
//! wire in cleartext as bincode during the handshake.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::errors::{CryptographicError, Result, TrustError};
use crate::types::{PeerPublicKey, PUBLIC_KEY_LEN, SIGNATURE_LEN};

// ----------------------------------------------------------------------------
// Certificate
// ----------------------------------------------------------------------------

/// Signed binding of a subject to its public keys
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    subject: String,
    issuer: String,
    public_key: PeerPublicKey,
    signature: Vec<u8>,
}

/// The portion of a certificate covered by the issuer's signature
#[derive(Serialize)]
struct SignedPortion<'a> {
    subject: &'a str,
    issuer: &'a str,
    public_key: &'a PeerPublicKey,
}

impl Certificate {
    /// Subject (common name) of the certificate
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Name of the issuing authority
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Public keys bound by this certificate
    pub fn public_key(&self) -> &PeerPublicKey {
        &self.public_key
    }

    /// Serialize for transmission
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize a received certificate
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    fn signed_bytes(subject: &str, issuer: &str, public_key: &PeerPublicKey) -> Result<Vec<u8>> {
        let portion = SignedPortion {
            subject,
            issuer,
            public_key,
        };
        Ok(bincode::serialize(&portion)?)
    }

    /// Verify that this certificate was issued by `root`.
    ///
    /// Fails loudly: any mismatch in issuer name, signature or key encoding is an error.
    pub fn verify(&self, root: &TrustedRoot) -> Result<()> {
        if self.issuer != root.name {
            return Err(TrustError::UntrustedIssuer {
                subject: self.subject.clone(),
                root: root.name.clone(),
            }
            .into());
        }

        let root_key = VerifyingKey::from_bytes(&root.public_key)
            .map_err(|_| CryptographicError::InvalidKeyFormat)?;
        let signature: [u8; SIGNATURE_LEN] =
            self.signature.as_slice().try_into().map_err(|_| {
                TrustError::BadCertificateSignature {
                    subject: self.subject.clone(),
                }
            })?;
        let signed = Self::signed_bytes(&self.subject, &self.issuer, &self.public_key)?;

        root_key
            .verify(&signed, &Signature::from_bytes(&signature))
            .map_err(|_| TrustError::BadCertificateSignature {
                subject: self.subject.clone(),
            })?;

        // The subject's signing key must itself be a valid curve point.
        VerifyingKey::from_bytes(&self.public_key.signing).map_err(|_| {
            TrustError::MalformedPublicKey {
                subject: self.subject.clone(),
            }
        })?;

        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Trusted Root
// ----------------------------------------------------------------------------

/// Public identity of the root authority that both sides trust
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedRoot {
    pub name: String,
    pub public_key: [u8; PUBLIC_KEY_LEN],
}

// ----------------------------------------------------------------------------
// Certificate Authority
// ----------------------------------------------------------------------------

/// Issuing authority holding the root signing key
#[derive(Debug, Clone)]
pub struct CertificateAuthority {
    name: String,
    signing_key: SigningKey,
}

impl CertificateAuthority {
    /// Create a new authority with a random signing key
    pub fn generate<S: Into<String>>(name: S) -> Result<Self> {
        let secret = crate::crypto::random_array::<32>()?;
        Ok(Self::from_bytes(name, &secret))
    }

    /// Create an authority from raw private key bytes
    pub fn from_bytes<S: Into<String>>(name: S, secret: &[u8; 32]) -> Self {
        Self {
            name: name.into(),
            signing_key: SigningKey::from_bytes(secret),
        }
    }

    /// Authority name, written into every issued certificate
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw private key bytes, for persisting the authority
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// The trust anchor corresponding to this authority
    pub fn root(&self) -> TrustedRoot {
        TrustedRoot {
            name: self.name.clone(),
            public_key: self.signing_key.verifying_key().to_bytes(),
        }
    }

    /// Issue a certificate binding `subject` to `public_key`
    pub fn issue<S: Into<String>>(&self, subject: S, public_key: PeerPublicKey) -> Result<Certificate> {
        let subject = subject.into();
        let signed = Certificate::signed_bytes(&subject, &self.name, &public_key)?;
        let signature = self.signing_key.sign(&signed).to_bytes().to_vec();

        Ok(Certificate {
            subject,
            issuer: self.name.clone(),
            public_key,
            signature,
        })
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
