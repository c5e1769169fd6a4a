//! Cryptographic primitives for `MageBox`.
//!
//! Provides AES-256-GCM authenticated encryption for secrets at rest,
//! Argon2id hashing for bearer tokens, and zeroize-on-drop key newtypes.
//!
//! # Security model
//!
//! - Every encryption generates a fresh 96-bit nonce via `OsRng`.
//! - Ciphertext format: `base64(nonce (12 bytes) || ciphertext || tag (16 bytes))`.
//! - Tokens are stored as PHC strings
//!   (`$argon2id$v=19$m=65536,t=3,p=4$<salt>$<hash>`) with a fresh 16-byte
//!   salt per hash; verification re-derives with the embedded parameters and
//!   compares in constant time.

use std::fmt;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Minimum decoded ciphertext length: 12-byte nonce + 16-byte AES-GCM tag.
const MIN_CIPHERTEXT_LEN: usize = 12 + 16;

/// Nonce length for AES-256-GCM (96 bits).
const NONCE_LEN: usize = 12;

/// Symmetric key length in bytes.
pub const KEY_LEN: usize = 32;

/// Random bytes in a freshly generated bearer token.
const TOKEN_BYTES: usize = 32;

/// A 256-bit encryption key that is zeroized on drop.
///
/// Used as the master key for every secret column. The inner bytes are never
/// exposed in `Debug` output.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    /// Create a key from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Create a key from a slice, failing unless it is exactly 32 bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] for any other length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength {
                actual: bytes.len(),
            })?;
        Ok(Self(arr))
    }

    /// Decode a standard-base64 key (the `MAGEBOX_MASTER_KEY` format).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] if the input is not valid
    /// base64 or does not decode to 32 bytes.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let mut raw = STANDARD
            .decode(encoded.trim())
            .map_err(|_| CryptoError::InvalidKeyLength { actual: 0 })?;
        let key = Self::from_slice(&raw);
        raw.zeroize();
        key
    }

    /// Generate a new random key using the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        Self(generate_master_key())
    }

    /// Encode the key as standard base64 for the key file.
    #[must_use]
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Borrow the raw key bytes.
    ///
    /// Use with care: the caller must not log or persist these bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Generate 32 random bytes suitable for a master key.
#[must_use]
pub fn generate_master_key() -> [u8; KEY_LEN] {
    let key = Aes256Gcm::generate_key(OsRng);
    let mut bytes = [0u8; KEY_LEN];
    bytes.copy_from_slice(&key);
    bytes
}

/// Encrypt plaintext using AES-256-GCM with a fresh random nonce.
///
/// Returns `base64(nonce || ciphertext || tag)`.
///
/// # Errors
///
/// Returns [`CryptoError::Encryption`] if the AEAD operation fails.
pub fn encrypt(key: &EncryptionKey, plaintext: &[u8]) -> Result<String, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| CryptoError::Encryption {
            reason: e.to_string(),
        })?;

    let mut combined = Vec::with_capacity(NONCE_LEN.saturating_add(ciphertext.len()));
    combined.extend_from_slice(&nonce);
    combined.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(combined))
}

/// Decrypt a value produced by [`encrypt`].
///
/// # Errors
///
/// Returns [`CryptoError::Decryption`] on bad base64, truncated input, a
/// wrong key, or a tampered tag. The cases are deliberately
/// indistinguishable to callers.
pub fn decrypt(key: &EncryptionKey, encoded: &str) -> Result<Vec<u8>, CryptoError> {
    let combined = STANDARD
        .decode(encoded)
        .map_err(|_| CryptoError::Decryption)?;
    if combined.len() < MIN_CIPHERTEXT_LEN {
        return Err(CryptoError::Decryption);
    }

    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::Decryption)
}

/// Encrypt a UTF-8 string.
///
/// # Errors
///
/// See [`encrypt`].
pub fn encrypt_str(key: &EncryptionKey, plaintext: &str) -> Result<String, CryptoError> {
    encrypt(key, plaintext.as_bytes())
}

/// Decrypt to a UTF-8 string.
///
/// # Errors
///
/// Returns [`CryptoError::Decryption`] if decryption fails or the plaintext
/// is not UTF-8.
pub fn decrypt_str(key: &EncryptionKey, encoded: &str) -> Result<String, CryptoError> {
    let bytes = decrypt(key, encoded)?;
    String::from_utf8(bytes).map_err(|_| CryptoError::Decryption)
}

/// Argon2id cost parameters for token hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenHashParams {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    /// Iterations.
    pub iterations: u32,
    /// Lanes.
    pub parallelism: u32,
}

impl Default for TokenHashParams {
    /// time=3, memory=64 MiB, parallelism=4.
    fn default() -> Self {
        Self {
            memory_kib: 64 * 1024,
            iterations: 3,
            parallelism: 4,
        }
    }
}

/// Hash a bearer token with Argon2id using the production parameters.
///
/// # Errors
///
/// Returns [`CryptoError::Hashing`] if Argon2 rejects the parameters.
pub fn hash_token(token: &str) -> Result<String, CryptoError> {
    hash_token_with(token, TokenHashParams::default())
}

/// Hash a bearer token with explicit Argon2id parameters.
///
/// The output is always 32 bytes with a fresh 16-byte salt.
///
/// # Errors
///
/// Returns [`CryptoError::Hashing`] if Argon2 rejects the parameters.
pub fn hash_token_with(token: &str, params: TokenHashParams) -> Result<String, CryptoError> {
    let params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(32),
    )
    .map_err(|e| CryptoError::Hashing {
        reason: e.to_string(),
    })?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let salt = SaltString::generate(&mut OsRng);

    argon
        .hash_password(token.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| CryptoError::Hashing {
            reason: e.to_string(),
        })
}

/// Verify a token against a stored Argon2id hash.
///
/// Malformed or non-argon2id encodings verify as `false`.
#[must_use]
pub fn verify_token(token: &str, encoded: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(encoded) else {
        return false;
    };
    if parsed.algorithm.as_str() != "argon2id" {
        return false;
    }
    Argon2::default()
        .verify_password(token.as_bytes(), &parsed)
        .is_ok()
}

/// Generate a random URL-safe bearer token (256 bits).
#[must_use]
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let token = URL_SAFE_NO_PAD.encode(bytes);
    bytes.zeroize();
    token
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    /// Cheap parameters so the suite stays fast.
    const FAST: TokenHashParams = TokenHashParams {
        memory_kib: 1024,
        iterations: 1,
        parallelism: 1,
    };

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = EncryptionKey::generate();
        let ciphertext = encrypt_str(&key, "deploy key material").unwrap();
        assert_eq!(decrypt_str(&key, &ciphertext).unwrap(), "deploy key material");
    }

    #[test]
    fn encrypt_decrypt_empty_plaintext() {
        let key = EncryptionKey::generate();
        let ciphertext = encrypt(&key, b"").unwrap();
        assert!(decrypt(&key, &ciphertext).unwrap().is_empty());
    }

    #[test]
    fn two_encryptions_produce_different_ciphertext() {
        let key = EncryptionKey::generate();
        let ct1 = encrypt(&key, b"same data").unwrap();
        let ct2 = encrypt(&key, b"same data").unwrap();
        assert_ne!(ct1, ct2);
    }

    #[test]
    fn decrypt_wrong_key_fails() {
        let ciphertext = encrypt(&EncryptionKey::generate(), b"secret").unwrap();
        let result = decrypt(&EncryptionKey::generate(), &ciphertext);
        assert!(matches!(result, Err(CryptoError::Decryption)));
    }

    #[test]
    fn decrypt_truncated_fails() {
        let key = EncryptionKey::generate();
        let short = STANDARD.encode([0u8; 10]);
        assert!(matches!(decrypt(&key, &short), Err(CryptoError::Decryption)));
        assert!(matches!(decrypt(&key, "not base64!"), Err(CryptoError::Decryption)));
    }

    #[test]
    fn decrypt_tampered_ciphertext_fails() {
        let key = EncryptionKey::generate();
        let encoded = encrypt(&key, b"secret").unwrap();
        let mut raw = STANDARD.decode(&encoded).unwrap();
        if let Some(byte) = raw.get_mut(NONCE_LEN) {
            *byte ^= 0xFF;
        }
        let tampered = STANDARD.encode(raw);
        assert!(matches!(decrypt(&key, &tampered), Err(CryptoError::Decryption)));
    }

    #[test]
    fn key_from_slice_requires_32_bytes() {
        assert!(EncryptionKey::from_slice(&[0u8; 32]).is_ok());
        assert!(matches!(
            EncryptionKey::from_slice(&[0u8; 16]),
            Err(CryptoError::InvalidKeyLength { actual: 16 })
        ));
    }

    #[test]
    fn key_base64_roundtrip() {
        let key = EncryptionKey::generate();
        let restored = EncryptionKey::from_base64(&key.to_base64()).unwrap();
        assert_eq!(key.as_bytes(), restored.as_bytes());
        assert!(EncryptionKey::from_base64("c2hvcnQ=").is_err());
    }

    #[test]
    fn encryption_key_debug_redacts_bytes() {
        let debug = format!("{:?}", EncryptionKey::generate());
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn production_hash_has_fixed_parameters() {
        let hash = hash_token("tok").unwrap();
        assert!(hash.starts_with("$argon2id$v=19$m=65536,t=3,p=4$"));
        assert!(verify_token("tok", &hash));
    }

    #[test]
    fn verify_rejects_other_token() {
        let hash = hash_token_with("token-one", FAST).unwrap();
        assert!(verify_token("token-one", &hash));
        assert!(!verify_token("token-two", &hash));
    }

    #[test]
    fn same_token_hashes_differently() {
        let h1 = hash_token_with("t", FAST).unwrap();
        let h2 = hash_token_with("t", FAST).unwrap();
        assert_ne!(h1, h2);
    }

    #[test]
    fn malformed_hashes_verify_false() {
        for bad in [
            "",
            "plaintext",
            "$argon2id$",
            "$argon2id$v=19$m=65536,t=3,p=4$",
            "$argon2id$v=19$m=abc,t=3,p=4$c2FsdA$aGFzaA",
            "$bcrypt$whatever",
        ] {
            assert!(!verify_token("tok", bad), "{bad} should not verify");
        }
    }

    #[test]
    fn generated_tokens_are_unique_and_url_safe() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(a.bytes().all(|c| c.is_ascii_alphanumeric() || c == b'-' || c == b'_'));
    }
}
