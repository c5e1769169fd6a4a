//! Certificate issuance for team members.

use chrono::{DateTime, Utc};
use serde::Serialize;

use magebox_core::ssh::{self, SignedCertificate};
use magebox_storage::models::{CaKeys, User};

use crate::error::AppError;
use crate::state::AppState;

/// A signed certificate as returned to clients.
#[derive(Debug, Clone, Serialize)]
pub struct CertificateResponse {
    pub certificate: String,
    /// Decimal serial. A string so JSON clients keep all 64 bits.
    pub serial: String,
    pub key_id: String,
    pub principals: Vec<String>,
    pub valid_after: DateTime<Utc>,
    pub valid_before: DateTime<Utc>,
}

impl From<SignedCertificate> for CertificateResponse {
    fn from(cert: SignedCertificate) -> Self {
        Self {
            certificate: cert.certificate,
            serial: cert.serial.to_string(),
            key_id: cert.key_id,
            principals: cert.principals,
            valid_after: cert.valid_after,
            valid_before: cert.valid_before,
        }
    }
}

/// The CA key pair, if the CA is enabled.
///
/// # Errors
///
/// Returns [`AppError::Internal`] if the CA is enabled but its keys are
/// missing or cannot be decrypted.
pub async fn ca_keys(state: &AppState) -> Result<Option<CaKeys>, AppError> {
    if !state.config.ca_enabled {
        return Ok(None);
    }
    state
        .store
        .ca_keys()
        .await?
        .map(Some)
        .ok_or_else(|| AppError::Internal("CA enabled but no CA keys stored".to_owned()))
}

/// Sign a certificate for `user` valid for the given principals and
/// remember its serial and expiry.
///
/// # Errors
///
/// Returns [`AppError::BadRequest`] if the user has no public key or there
/// are no principals.
pub async fn issue_certificate(
    state: &AppState,
    ca: &CaKeys,
    user: &User,
    principals: &[String],
) -> Result<SignedCertificate, AppError> {
    let public_key = user
        .public_key
        .as_deref()
        .ok_or_else(|| AppError::BadRequest("user has no public key".to_owned()))?;
    if principals.is_empty() {
        return Err(AppError::BadRequest(
            "no environments in the user's projects, so no principals to sign for".to_owned(),
        ));
    }

    let cert = ssh::sign_user_certificate(
        &ca.private_key,
        public_key,
        &user.email,
        principals,
        state.config.cert_validity,
    )?;
    state
        .store
        .record_certificate(&user.name, cert.serial, cert.valid_before)
        .await?;
    Ok(cert)
}
