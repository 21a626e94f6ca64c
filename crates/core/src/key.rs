//! Key-pair material as the platform sees it.
//!
//! The platform stores public keys as SPKI PEM and identifies them by
//! `SHA256:` + base64 of the SHA-256 digest of the SPKI DER. Private keys
//! never leave the process unencrypted; [`PrivateKey`] only exists long
//! enough to sign an authentication challenge.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Key encoding or signing failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    /// Not a parseable SPKI PEM public key.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// A key could not be serialized.
    #[error("key encoding failed: {0}")]
    Encoding(String),

    /// Signing failed.
    #[error("signing failed: {0}")]
    Signature(String),
}

/// `SHA256:<base64>` fingerprint of a public key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    fn of_der(der: &[u8]) -> Self {
        Self(format!("SHA256:{}", STANDARD.encode(Sha256::digest(der))))
    }

    /// The `SHA256:`-prefixed string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical SPKI PEM encoding of an RSA public key.
///
/// Parsing re-encodes the key, so two PEM strings that differ only in line
/// endings or trailing whitespace compare equal.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PublicKeyPem {
    pem: String,
    fingerprint: Fingerprint,
}

impl PublicKeyPem {
    /// Parse and canonicalize a PEM public key.
    pub fn parse(pem: impl AsRef<str>) -> Result<Self, KeyError> {
        let key = RsaPublicKey::from_public_key_pem(pem.as_ref().trim())
            .map_err(|e| KeyError::InvalidPublicKey(e.to_string()))?;
        Self::from_rsa(&key)
    }

    /// Encode an RSA public key.
    pub fn from_rsa(key: &RsaPublicKey) -> Result<Self, KeyError> {
        let der = key
            .to_public_key_der()
            .map_err(|e| KeyError::Encoding(e.to_string()))?;
        let pem = key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| KeyError::Encoding(e.to_string()))?;
        Ok(Self {
            pem,
            fingerprint: Fingerprint::of_der(der.as_bytes()),
        })
    }

    /// Decode back into an RSA public key.
    pub fn to_rsa(&self) -> Result<RsaPublicKey, KeyError> {
        RsaPublicKey::from_public_key_pem(&self.pem)
            .map_err(|e| KeyError::InvalidPublicKey(e.to_string()))
    }

    /// Platform fingerprint of this key.
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// PEM text.
    pub fn as_str(&self) -> &str {
        &self.pem
    }

    /// Check a PKCS#1 v1.5 / SHA-256 signature over `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(key) = self.to_rsa() else {
            return false;
        };
        let Ok(signature) = Signature::try_from(signature) else {
            return false;
        };
        VerifyingKey::<Sha256>::new(key)
            .verify(message, &signature)
            .is_ok()
    }
}

impl fmt::Debug for PublicKeyPem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKeyPem")
            .field(&self.fingerprint.0)
            .finish()
    }
}

impl TryFrom<String> for PublicKeyPem {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<PublicKeyPem> for String {
    fn from(key: PublicKeyPem) -> Self {
        key.pem
    }
}

/// A decrypted RSA private key.
///
/// The wrapped key zeroizes its limbs on drop. `Debug` prints only the
/// public fingerprint.
#[derive(Clone)]
pub struct PrivateKey {
    inner: RsaPrivateKey,
}

impl PrivateKey {
    /// Wrap an RSA private key.
    pub fn from_rsa(inner: RsaPrivateKey) -> Self {
        Self { inner }
    }

    /// Borrow the RSA key.
    pub fn as_rsa(&self) -> &RsaPrivateKey {
        &self.inner
    }

    /// Public half, PEM encoded.
    pub fn public_key_pem(&self) -> Result<PublicKeyPem, KeyError> {
        PublicKeyPem::from_rsa(&self.inner.to_public_key())
    }

    /// PKCS#1 v1.5 / SHA-256 signature over `message`.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, KeyError> {
        SigningKey::<Sha256>::new(self.inner.clone())
            .try_sign(message)
            .map(|signature| signature.to_vec())
            .map_err(|e| KeyError::Signature(e.to_string()))
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.public_key_pem() {
            Ok(public) => write!(f, "PrivateKey({})", public.fingerprint()),
            Err(_) => f.write_str("PrivateKey(..)"),
        }
    }
}
