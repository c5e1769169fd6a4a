//! TOTP multi-factor authentication (RFC 6238) and recovery codes.
//!
//! Secrets are 20 random bytes, base32 without padding. Codes are six
//! digits over a 30-second step using HMAC-SHA1, accepted within one step of
//! drift either way.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use rand::rngs::OsRng;
use totp_rs::{Algorithm, Secret, TOTP};

use crate::error::MfaError;

const SECRET_BYTES: usize = 20;
const DIGITS: usize = 6;
const STEP_SECS: u64 = 30;
const SKEW_STEPS: u8 = 1;

/// Number of recovery codes issued when MFA is enabled.
pub const RECOVERY_CODE_COUNT: usize = 10;

/// Material a user needs to enrol an authenticator app.
#[derive(Clone)]
pub struct MfaSetup {
    /// Base32 secret, no padding.
    pub secret: String,
    /// `otpauth://totp/...` provisioning URI (for QR codes).
    pub otpauth_url: String,
    /// The secret split into space-separated groups of four.
    pub manual_entry: String,
}

impl fmt::Debug for MfaSetup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MfaSetup")
            .field("secret", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

/// Stateless TOTP helper. Holds only the issuer label shown in apps.
#[derive(Debug, Clone)]
pub struct MfaManager {
    issuer: String,
}

impl MfaManager {
    #[must_use]
    pub fn new(issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
        }
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Generate a fresh base32 secret from 20 random bytes.
    #[must_use]
    pub fn generate_secret(&self) -> String {
        let mut bytes = vec![0u8; SECRET_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Secret::Raw(bytes).to_encoded().to_string()
    }

    /// Generate a secret plus the provisioning URI for `account`.
    #[must_use]
    pub fn generate_setup(&self, account: &str) -> MfaSetup {
        let secret = self.generate_secret();
        let otpauth_url = format!(
            "otpauth://totp/{issuer}:{account}?secret={secret}&issuer={issuer}&algorithm=SHA1&digits={DIGITS}&period={STEP_SECS}",
            issuer = urlencoding::encode(&self.issuer),
            account = urlencoding::encode(account),
        );
        let manual_entry = group_secret(&secret);
        MfaSetup {
            secret,
            otpauth_url,
            manual_entry,
        }
    }

    /// The code for the current time step.
    ///
    /// # Errors
    ///
    /// Returns [`MfaError`] if the secret is invalid or the clock is broken.
    pub fn current_code(&self, secret: &str) -> Result<String, MfaError> {
        self.code_at(secret, unix_now()?)
    }

    /// The code for an arbitrary Unix time.
    ///
    /// # Errors
    ///
    /// Returns [`MfaError::InvalidSecret`] if the secret cannot be decoded.
    pub fn code_at(&self, secret: &str, unix_secs: u64) -> Result<String, MfaError> {
        Ok(totp(secret)?.generate(unix_secs))
    }

    /// Check `code` against the current, previous and next time step.
    ///
    /// Whitespace inside the code is ignored. Anything other than six
    /// digits is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`MfaError`] if the secret is invalid or the clock is broken.
    pub fn validate_code(&self, secret: &str, code: &str) -> Result<bool, MfaError> {
        self.validate_code_at(secret, code, unix_now()?)
    }

    /// [`Self::validate_code`] at a fixed time.
    ///
    /// # Errors
    ///
    /// Returns [`MfaError::InvalidSecret`] if the secret cannot be decoded.
    pub fn validate_code_at(
        &self,
        secret: &str,
        code: &str,
        unix_secs: u64,
    ) -> Result<bool, MfaError> {
        let code: String = code.chars().filter(|c| !c.is_whitespace()).collect();
        if code.len() != DIGITS || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(false);
        }
        Ok(totp(secret)?.check(&code, unix_secs))
    }

    /// Generate `count` recovery codes of the form `XXXX-XXXX`.
    #[must_use]
    pub fn generate_recovery_codes(&self, count: usize) -> Vec<String> {
        (0..count)
            .map(|_| {
                let mut bytes = [0u8; 4];
                OsRng.fill_bytes(&mut bytes);
                let hex = hex::encode_upper(bytes);
                format!("{}-{}", &hex[..4], &hex[4..])
            })
            .collect()
    }
}

/// Normalise a recovery code to upper case, or `None` if it is not
/// `XXXX-XXXX` hex. Consumption tracking is left to the caller.
#[must_use]
pub fn normalize_recovery_code(code: &str) -> Option<String> {
    let code = code.trim().to_ascii_uppercase();
    let (left, right) = code.split_once('-')?;
    let is_group = |s: &str| s.len() == 4 && s.bytes().all(|b| b.is_ascii_hexdigit());
    (is_group(left) && is_group(right)).then_some(code)
}

/// Whether `code` is formatted like a recovery code.
#[must_use]
pub fn is_recovery_code(code: &str) -> bool {
    normalize_recovery_code(code).is_some()
}

fn totp(secret: &str) -> Result<TOTP, MfaError> {
    let cleaned: String = secret
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .collect::<String>()
        .to_ascii_uppercase();
    let bytes = Secret::Encoded(cleaned)
        .to_bytes()
        .map_err(|e| MfaError::InvalidSecret {
            reason: format!("{e:?}"),
        })?;
    TOTP::new(Algorithm::SHA1, DIGITS, SKEW_STEPS, STEP_SECS, bytes).map_err(|e| {
        MfaError::InvalidSecret {
            reason: e.to_string(),
        }
    })
}

fn unix_now() -> Result<u64, MfaError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|e| MfaError::Clock {
            reason: e.to_string(),
        })
}

fn group_secret(secret: &str) -> String {
    secret
        .as_bytes()
        .chunks(4)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}
