//! Caller identity and credential checks.
//!
//! A bearer token is either the static admin token or a per-user session
//! token of the form `<username>.<secret>`. Both are stored only as
//! Argon2id hashes.

use std::net::IpAddr;
use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{HeaderMap, header};
use tracing::warn;

use magebox_core::mfa::is_recovery_code;
use magebox_storage::models::{Role, User};
use magebox_storage::{StoreError, now};

use crate::error::AppError;
use crate::notify::{AlertKind, SecurityAlert};
use crate::state::{AppState, session_token_user};

/// Actor name recorded for requests made with the static admin token.
pub const ADMIN_ACTOR: &str = "admin";

/// Actor name recorded when no credential was verified.
pub const ANONYMOUS_ACTOR: &str = "anonymous";

/// Header carrying an admin's TOTP or recovery code.
pub const MFA_HEADER: &str = "x-mfa-code";

/// Failure count at which administrators are warned, before lockout.
const ALERT_THRESHOLD: u32 = 3;

/// The authenticated identity behind a request.
///
/// Inserted by the auth middleware and taken by handlers as an extractor.
#[derive(Debug, Clone)]
pub struct Caller {
    pub name: String,
    pub role: Role,
    /// `None` for the static admin token.
    pub user: Option<User>,
}

impl Caller {
    fn admin_token() -> Self {
        Self {
            name: ADMIN_ACTOR.to_owned(),
            role: Role::Admin,
            user: None,
        }
    }

    fn from_user(user: User) -> Self {
        Self {
            name: user.name.clone(),
            role: user.role,
            user: Some(user),
        }
    }

    /// The caller's user account.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::BadRequest`] for the static admin token, which
    /// has no account.
    pub fn user(&self) -> Result<&User, AppError> {
        self.user.as_ref().ok_or_else(|| {
            AppError::BadRequest("the static admin token has no user account".to_owned())
        })
    }
}

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Self>()
            .cloned()
            .ok_or_else(|| AppError::Unauthorized("authentication required".to_owned()))
    }
}

/// Result of checking a bearer token.
#[derive(Debug)]
pub enum AuthOutcome {
    Valid(Caller),
    /// The token matched a user whose account has expired.
    Expired(String),
    Invalid,
}

/// Extract the token from `Authorization: Bearer <token>`.
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Resolve a bearer token to a caller.
///
/// # Errors
///
/// Returns [`AppError::Internal`] if the user lookup fails.
pub async fn authenticate(state: &AppState, token: &str) -> Result<AuthOutcome, AppError> {
    if let Some(name) = session_token_user(token) {
        match state.store.get_user(name).await {
            Ok(user) => {
                if state.verify_token(token, &user.token_hash).await {
                    if user.is_expired(now()) {
                        return Ok(AuthOutcome::Expired(user.name));
                    }
                    return Ok(AuthOutcome::Valid(Caller::from_user(user)));
                }
            }
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }

    if state.verify_token(token, &state.admin_token_hash).await {
        return Ok(AuthOutcome::Valid(Caller::admin_token()));
    }
    Ok(AuthOutcome::Invalid)
}

/// Count an authentication failure against `ip`, audit it, and alert
/// administrators at the warning threshold and at lockout. Returns the
/// error to send back.
///
/// `claimed` is an unverified identity taken from the request; it goes into
/// the audit details, never the actor column.
pub async fn record_auth_failure(
    state: &Arc<AppState>,
    ip: IpAddr,
    actor: &str,
    reason: &str,
    claimed: Option<&str>,
) -> AppError {
    let outcome = state.login_attempts.record_failure(&ip);
    warn!(ip = %ip, failures = outcome.failures, reason, "authentication failed");
    let details = match claimed {
        Some(name) => format!(
            "{reason}, claimed user {name:?} (consecutive failures: {})",
            outcome.failures
        ),
        None => format!("{reason} (consecutive failures: {})", outcome.failures),
    };
    state.audit(actor, "auth.failed", &details, ip).await;

    if outcome.locked_now {
        state
            .audit(
                actor,
                "auth.lockout",
                &format!("locked out after {} failures", outcome.failures),
                ip,
            )
            .await;
        spawn_security_alert(
            state,
            SecurityAlert {
                kind: AlertKind::Lockout,
                ip,
                failures: outcome.failures,
                detail: reason.to_owned(),
            },
        );
    } else if outcome.failures == ALERT_THRESHOLD && !outcome.locked {
        spawn_security_alert(
            state,
            SecurityAlert {
                kind: AlertKind::RepeatedFailures,
                ip,
                failures: outcome.failures,
                detail: reason.to_owned(),
            },
        );
    }

    if outcome.locked {
        AppError::LockedOut
    } else {
        AppError::Unauthorized(reason.to_owned())
    }
}

fn spawn_security_alert(state: &Arc<AppState>, alert: SecurityAlert) {
    let state_bg = Arc::clone(state);
    state.tasks.spawn("security-alert", async move {
        let recipients: Vec<String> = state_bg
            .store
            .list_users()
            .await
            .map_err(|e| e.to_string())?
            .into_iter()
            .filter(|u| u.role.is_admin())
            .map(|u| u.email)
            .collect();
        state_bg
            .notifier
            .send_security_alert(&recipients, &alert)
            .await
            .map_err(|e| e.to_string())
    });
}

/// Check a TOTP code, or consume a recovery code once MFA is enabled.
///
/// # Errors
///
/// Returns [`AppError::Internal`] if the stored secret is unusable.
pub async fn check_mfa_code(state: &AppState, user: &User, code: &str) -> Result<bool, AppError> {
    let Some(secret) = user.mfa_secret.as_deref() else {
        return Ok(false);
    };
    if state.mfa.validate_code(secret, code)? {
        return Ok(true);
    }
    if user.mfa_enabled && is_recovery_code(code) {
        return Ok(state.store.consume_recovery_code(&user.name, code).await?);
    }
    Ok(false)
}

/// Refuse MFA checks for an account locked out by earlier failures.
///
/// # Errors
///
/// Returns [`AppError::LockedOut`] while the lockout lasts.
pub fn ensure_mfa_unlocked(state: &AppState, user: &str) -> Result<(), AppError> {
    if state.mfa_attempts.is_locked(&user.to_owned()) {
        warn!(user, "MFA check refused while locked out");
        return Err(AppError::LockedOut);
    }
    Ok(())
}

/// Record the outcome of an MFA check.
///
/// Failures count per account, so switching addresses does not reset them.
/// The failure that reaches the lockout limit is audited and alerted; a
/// success clears the count.
///
/// # Errors
///
/// Returns [`AppError::LockedOut`] once the account is locked out.
pub async fn record_mfa_outcome(
    state: &Arc<AppState>,
    user: &str,
    ok: bool,
    ip: IpAddr,
) -> Result<(), AppError> {
    let key = user.to_owned();
    if ok {
        state.mfa_attempts.clear(&key);
        if let Err(e) = state.store.reset_failed_logins(user).await {
            warn!(user, error = %e, "failed to reset MFA failure count");
        }
        return Ok(());
    }

    let outcome = state.mfa_attempts.record_failure(&key);
    warn!(user, ip = %ip, failures = outcome.failures, "invalid MFA code");
    state
        .audit(
            user,
            "mfa.failed",
            &format!("invalid MFA code (consecutive failures: {})", outcome.failures),
            ip,
        )
        .await;
    if let Err(e) = state.store.record_failed_login(user).await {
        warn!(user, error = %e, "failed to update MFA failure count");
    }

    if outcome.locked_now {
        state
            .audit(
                user,
                "mfa.lockout",
                &format!("MFA locked after {} failures", outcome.failures),
                ip,
            )
            .await;
        spawn_security_alert(
            state,
            SecurityAlert {
                kind: AlertKind::MfaLockout,
                ip,
                failures: outcome.failures,
                detail: format!("user {user}"),
            },
        );
    }

    if outcome.locked {
        Err(AppError::LockedOut)
    } else {
        Ok(())
    }
}
