//! RSA key-pair generation with an encrypted private key encoding.

use std::fmt;
use std::sync::Arc;

use bastion_core::{Fingerprint, PrivateKey, PublicKeyPem};
use pkcs8::LineEnding;
use pkcs8::pkcs5::pbes2;
use rand::RngCore;
use rand::rngs::OsRng;
use rsa::RsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroizing;

/// Smallest modulus accepted.
pub const MIN_KEY_BITS: usize = 2048;

/// PBKDF2 rounds used when none are configured.
pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 600_000;

const ENCRYPTED_PEM_LABEL: &str = "ENCRYPTED PRIVATE KEY";
const PROBE: &[u8] = b"bastion key correspondence probe";

/// Key generation failures. None of them is worth retrying.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum KeyGenError {
    /// Requested modulus below [`MIN_KEY_BITS`]
    #[error("RSA keys must be at least {MIN_KEY_BITS} bits, got {bits}")]
    WeakKey {
        /// Requested size
        bits: usize,
    },

    /// The RNG or the RSA implementation failed
    #[error("key generation failed: {0}")]
    Generation(String),

    /// Encoding or encrypting the key failed
    #[error("key encoding failed: {0}")]
    Encoding(String),

    /// The stored private key could not be decrypted
    #[error("private key could not be decrypted: {0}")]
    Decrypt(String),

    /// Public and private halves do not belong together
    #[error("generated public key does not verify signatures of its private key")]
    Correspondence,
}

/// A freshly generated key pair, private half encrypted.
#[derive(Clone, PartialEq, Eq)]
pub struct GeneratedKey {
    /// SPKI PEM of the public key
    pub public_key: PublicKeyPem,
    /// PKCS#8 `ENCRYPTED PRIVATE KEY` PEM
    pub encrypted_private_key: String,
    /// `SHA256:` fingerprint of the public key
    pub fingerprint: Fingerprint,
}

impl fmt::Debug for GeneratedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratedKey")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Produces RSA key pairs and opens their encrypted private halves.
///
/// The private key is encrypted with PBES2 (PBKDF2-HMAC-SHA256 and
/// AES-256-CBC) under the configured passphrase before it leaves the
/// generator.
#[derive(Clone)]
pub struct KeyGenerator {
    bits: usize,
    passphrase: Arc<SecretString>,
    pbkdf2_iterations: u32,
}

impl KeyGenerator {
    /// Generator for `bits`-bit keys encrypted under `passphrase`.
    pub fn new(bits: usize, passphrase: SecretString) -> Result<Self, KeyGenError> {
        if bits < MIN_KEY_BITS {
            return Err(KeyGenError::WeakKey { bits });
        }
        Ok(Self {
            bits,
            passphrase: Arc::new(passphrase),
            pbkdf2_iterations: DEFAULT_PBKDF2_ITERATIONS,
        })
    }

    /// Override the PBKDF2 iteration count.
    pub fn with_pbkdf2_iterations(mut self, iterations: u32) -> Self {
        self.pbkdf2_iterations = iterations.max(1);
        self
    }

    /// Generate a key pair and check that its halves correspond.
    pub fn generate(&self) -> Result<GeneratedKey, KeyGenError> {
        let private = RsaPrivateKey::new(&mut OsRng, self.bits)
            .map_err(|e| KeyGenError::Generation(e.to_string()))?;
        let private = PrivateKey::from_rsa(private);
        let public_key = private
            .public_key_pem()
            .map_err(|e| KeyGenError::Encoding(e.to_string()))?;

        let signature = private
            .sign(PROBE)
            .map_err(|e| KeyGenError::Generation(e.to_string()))?;
        if !public_key.verify(PROBE, &signature) {
            return Err(KeyGenError::Correspondence);
        }

        let encrypted_private_key = self.encrypt(&private)?;
        let fingerprint = public_key.fingerprint().clone();

        tracing::debug!(fingerprint = %fingerprint, bits = self.bits, "Generated key pair");

        Ok(GeneratedKey {
            public_key,
            encrypted_private_key,
            fingerprint,
        })
    }

    /// Decrypt a private key produced by [`generate`](Self::generate).
    pub fn open(&self, encrypted_pem: &str) -> Result<PrivateKey, KeyGenError> {
        RsaPrivateKey::from_pkcs8_encrypted_pem(
            encrypted_pem,
            self.passphrase.expose_secret().as_bytes(),
        )
        .map(PrivateKey::from_rsa)
        .map_err(|e| KeyGenError::Decrypt(e.to_string()))
    }

    fn encrypt(&self, key: &PrivateKey) -> Result<String, KeyGenError> {
        let encoding = |e: &dyn fmt::Display| KeyGenError::Encoding(e.to_string());

        let der = key.as_rsa().to_pkcs8_der().map_err(|e| encoding(&e))?;
        let info = pkcs8::PrivateKeyInfo::try_from(der.as_bytes()).map_err(|e| encoding(&e))?;

        let mut salt = Zeroizing::new([0u8; 16]);
        let mut iv = [0u8; 16];
        OsRng.fill_bytes(&mut salt[..]);
        OsRng.fill_bytes(&mut iv);

        let params = pbes2::Parameters::pbkdf2_sha256_aes256cbc(
            self.pbkdf2_iterations,
            &salt[..],
            &iv,
        )
        .map_err(|e| encoding(&e))?;

        let encrypted = info
            .encrypt_with_params(params, self.passphrase.expose_secret().as_bytes())
            .map_err(|e| encoding(&e))?;
        let pem = encrypted
            .to_pem(ENCRYPTED_PEM_LABEL, LineEnding::LF)
            .map_err(|e| encoding(&e))?;
        Ok(String::from(pem.as_str()))
    }
}

impl fmt::Debug for KeyGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyGenerator")
            .field("bits", &self.bits)
            .field("pbkdf2_iterations", &self.pbkdf2_iterations)
            .finish_non_exhaustive()
    }
}
