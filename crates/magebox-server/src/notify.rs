//! Outbound notifications.
//!
//! Mail delivery lives outside the server; it only needs something that
//! implements [`Notifier`]. Every call is made from a background task and
//! a failure is logged, never returned to an HTTP caller.

use std::fmt;
use std::net::IpAddr;

use async_trait::async_trait;
use tracing::{info, warn};

use magebox_storage::models::{Invite, User};

/// A notification could not be delivered.
#[derive(Debug, thiserror::Error)]
#[error("notification failed: {0}")]
pub struct NotifyError(pub String);

/// Why a security alert was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    /// Several consecutive authentication failures from one address.
    RepeatedFailures,
    /// The address has been locked out.
    Lockout,
    /// An account's MFA checks have been locked out.
    MfaLockout,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RepeatedFailures => write!(f, "repeated authentication failures"),
            Self::Lockout => write!(f, "address locked out"),
            Self::MfaLockout => write!(f, "account MFA locked out"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SecurityAlert {
    pub kind: AlertKind,
    pub ip: IpAddr,
    pub failures: u32,
    pub detail: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Tell the invitee how to join. `token` is the plaintext invite token.
    async fn send_user_invited(&self, invite: &Invite, token: &str) -> Result<(), NotifyError>;

    /// Welcome a user who has just joined.
    async fn send_user_joined(&self, user: &User) -> Result<(), NotifyError>;

    /// Warn administrators about suspicious authentication activity.
    async fn send_security_alert(
        &self,
        recipients: &[String],
        alert: &SecurityAlert,
    ) -> Result<(), NotifyError>;
}

/// Writes notifications to the log instead of sending them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_user_invited(&self, invite: &Invite, _token: &str) -> Result<(), NotifyError> {
        info!(
            username = %invite.username,
            email = %invite.email,
            expires_at = %invite.expires_at,
            "invite created; deliver the token out of band"
        );
        Ok(())
    }

    async fn send_user_joined(&self, user: &User) -> Result<(), NotifyError> {
        info!(user = %user.name, email = %user.email, "user joined");
        Ok(())
    }

    async fn send_security_alert(
        &self,
        recipients: &[String],
        alert: &SecurityAlert,
    ) -> Result<(), NotifyError> {
        warn!(
            kind = %alert.kind,
            ip = %alert.ip,
            failures = alert.failures,
            detail = %alert.detail,
            recipients = recipients.len(),
            "security alert"
        );
        Ok(())
    }
}
