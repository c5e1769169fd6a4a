//! Request middleware for the `MageBox` server.
//!
//! Every request passes the guard (client address, rate limit, lockout,
//! allowlist). Authenticated routes then resolve the bearer token into a
//! [`Caller`], and admin routes check the role and the MFA policy.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use tracing::warn;
use zeroize::Zeroizing;

use crate::auth::{
    ANONYMOUS_ACTOR, AuthOutcome, Caller, MFA_HEADER, authenticate, bearer_token,
    check_mfa_code, ensure_mfa_unlocked, record_auth_failure, record_mfa_outcome,
};
use crate::client_ip::{ClientIp, resolve_client_ip};
use crate::config::{MfaPolicy, contains_ip};
use crate::error::{AppError, ErrorCode};
use crate::state::AppState;

/// Resolve the client address and apply the rate limiter, the lockout
/// tracker, and the IP allowlist, in that order.
pub async fn guard_middleware(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let ip = resolve_client_ip(peer.ip(), req.headers(), &state.config.trusted_proxies);

    if !state.rate_limiter.allow(&ip) {
        warn!(ip = %ip, "rate limit exceeded");
        return Err(AppError::RateLimited);
    }
    if state.login_attempts.is_locked(&ip) {
        return Err(AppError::LockedOut);
    }
    let allowlist = &state.config.ip_allowlist;
    if !allowlist.is_empty() && !contains_ip(allowlist, ip) {
        warn!(ip = %ip, "request from address outside allowlist");
        return Err(AppError::Forbidden("address not allowed".to_owned()));
    }

    req.extensions_mut().insert(ClientIp(ip));
    Ok(next.run(req).await)
}

/// Validate the bearer token and inject the [`Caller`].
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(token) = bearer_token(req.headers()).map(|t| Zeroizing::new(t.to_owned())) else {
        return Err(AppError::Unauthorized("missing bearer token".to_owned()));
    };

    match authenticate(&state, &token).await? {
        AuthOutcome::Valid(caller) => {
            state.login_attempts.clear(&ip);
            state
                .audit(
                    &caller.name,
                    "auth.success",
                    &format!("{} {}", req.method(), req.uri().path()),
                    ip,
                )
                .await;
            if caller.user.is_some() {
                if let Err(e) = state.store.touch_last_access(&caller.name).await {
                    warn!(user = %caller.name, error = %e, "failed to record last access");
                }
            }
            req.extensions_mut().insert(caller);
            Ok(next.run(req).await)
        }
        AuthOutcome::Expired(name) => {
            state.audit(&name, "auth.expired", "account expired", ip).await;
            Err(AppError::Unauthorized("account expired".to_owned()))
        }
        AuthOutcome::Invalid => {
            let claimed = crate::state::session_token_user(&token);
            Err(record_auth_failure(&state, ip, ANONYMOUS_ACTOR, "invalid token", claimed).await)
        }
    }
}

/// Require the admin role, then apply the MFA policy to admin users.
/// The static admin token has no account and is not subject to MFA.
pub async fn require_admin(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    caller: Caller,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    if !caller.role.is_admin() {
        state
            .audit(&caller.name, "auth.denied", req.uri().path(), ip)
            .await;
        return Err(AppError::Forbidden("admin role required".to_owned()));
    }

    if let Some(user) = &caller.user {
        let enrolled = user.mfa_enabled;
        match state.config.mfa_policy {
            MfaPolicy::Disabled => {}
            MfaPolicy::Optional if !enrolled => {}
            MfaPolicy::Required if !enrolled => {
                return Err(AppError::MfaRequired(
                    "MFA must be enabled for admin access".to_owned(),
                ));
            }
            MfaPolicy::Required | MfaPolicy::Optional => {
                let code = req
                    .headers()
                    .get(MFA_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| AppError::MfaRequired("X-MFA-Code header required".to_owned()))?;
                ensure_mfa_unlocked(&state, &user.name)?;
                let ok = check_mfa_code(&state, user, code).await?;
                record_mfa_outcome(&state, &user.name, ok, ip).await?;
                if !ok {
                    return Err(AppError::MfaRequired("invalid MFA code".to_owned()));
                }
            }
        }
    }

    Ok(next.run(req).await)
}

/// Audit admin mutations that fail inside their handler. Handlers audit
/// their own successes; this records the rest with the error code.
pub async fn audit_admin_failures(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    caller: Caller,
    req: Request,
    next: Next,
) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let response = next.run(req).await;

    let status = response.status();
    if !method.is_safe() && (status.is_client_error() || status.is_server_error()) {
        let code = response
            .extensions()
            .get::<ErrorCode>()
            .map_or("error", |c| c.0);
        state
            .audit(
                &caller.name,
                "admin.failed",
                &format!("{method} {path}: {code} ({})", status.as_u16()),
                ip,
            )
            .await;
    }
    response
}
