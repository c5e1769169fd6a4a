//! Error types for `magebox-core`.
//!
//! Each error variant carries enough context to diagnose the problem without
//! a debugger. Crypto errors never include key material, only operation
//! descriptions.

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// A symmetric key had the wrong length.
    #[error("invalid key length: expected 32 bytes, got {actual}")]
    InvalidKeyLength { actual: usize },

    /// AES-256-GCM encryption failed.
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// Decryption failed: wrong key, truncated input, bad encoding, or a
    /// tampered tag. Callers treat this as fatal for the record.
    #[error("decryption failed")]
    Decryption,

    /// Argon2id hashing failed.
    #[error("token hashing failed: {reason}")]
    Hashing { reason: String },

    /// SSH key generation, parsing, or encoding failed.
    #[error("ssh key error: {reason}")]
    SshKey { reason: String },

    /// Certificate construction or signing failed.
    #[error("certificate signing failed: {reason}")]
    Certificate { reason: String },
}

/// Errors from TOTP / recovery-code handling.
#[derive(Debug, thiserror::Error)]
pub enum MfaError {
    /// The stored secret is not valid base32 or is too short.
    #[error("invalid TOTP secret: {reason}")]
    InvalidSecret { reason: String },

    /// The system clock is before the Unix epoch.
    #[error("system clock error: {reason}")]
    Clock { reason: String },
}

/// Errors from the SSH key deployer.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    /// The remote host presented a key that differs from the pinned fingerprint.
    #[error("host key mismatch: expected {expected}, got {actual}")]
    HostKeyMismatch { expected: String, actual: String },

    /// TCP connect or SSH handshake did not finish within the dial timeout.
    #[error("connection to {host} timed out after {secs}s")]
    Timeout { host: String, secs: u64 },

    /// The deploy key could not be parsed.
    #[error("invalid deploy key: {reason}")]
    InvalidKey { reason: String },

    /// The server rejected the deploy key.
    #[error("authentication failed for {user}@{host}")]
    AuthFailed { user: String, host: String },

    /// A remote command exited non-zero.
    #[error("remote command failed (exit {status}): {stderr}")]
    Command { status: u32, stderr: String },

    /// The remote `authorized_keys` could not be taken as text; it is left alone.
    #[error("unreadable authorized_keys: {reason}")]
    UnreadableKeys { reason: String },

    /// Any other SSH protocol or transport failure.
    #[error("ssh error: {0}")]
    Ssh(String),
}

impl From<russh::Error> for DeployError {
    fn from(err: russh::Error) -> Self {
        Self::Ssh(err.to_string())
    }
}
