//! TOTP lifecycle: `/api/mfa/setup`, `/api/mfa/verify`
//!
//! Setup stores a pending secret. The first valid code enables MFA and
//! returns the recovery codes, which are shown only that once.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};

use magebox_core::mfa::RECOVERY_CODE_COUNT;

use crate::auth::{Caller, check_mfa_code, ensure_mfa_unlocked, record_mfa_outcome};
use crate::client_ip::ClientIp;
use crate::error::{ApiJson, AppError};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/mfa/setup", get(status).post(begin_setup).delete(disable))
        .route("/api/mfa/verify", post(verify))
}

#[derive(Deserialize)]
pub struct CodeRequest {
    pub code: String,
}

async fn status(State(state): State<Arc<AppState>>, caller: Caller) -> Result<Json<Value>, AppError> {
    let user = caller.user()?;
    Ok(Json(json!({
        "enabled": user.mfa_enabled,
        "pending": user.mfa_secret.is_some() && !user.mfa_enabled,
        "recovery_codes_remaining": user.recovery_codes.len(),
        "required": user.role.is_admin()
            && state.config.mfa_policy == crate::config::MfaPolicy::Required,
    })))
}

/// Generate a secret and keep it pending until a code is verified.
async fn begin_setup(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    caller: Caller,
) -> Result<Json<Value>, AppError> {
    let user = caller.user()?;
    if user.mfa_enabled {
        return Err(AppError::Conflict(
            "MFA is already enabled; disable it first".to_owned(),
        ));
    }

    let setup = state.mfa.generate_setup(&user.email);
    state
        .store
        .set_mfa_secret(&user.name, Some(&setup.secret))
        .await?;
    state
        .audit(&user.name, "mfa.setup_started", "pending TOTP secret issued", ip)
        .await;

    Ok(Json(json!({
        "secret": setup.secret,
        "otpauth_url": setup.otpauth_url,
        "manual_entry": setup.manual_entry,
    })))
}

/// Confirm a pending setup, or check a code once MFA is enabled.
async fn verify(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    caller: Caller,
    ApiJson(body): ApiJson<CodeRequest>,
) -> Result<Json<Value>, AppError> {
    let user = caller.user()?;
    let Some(secret) = user.mfa_secret.as_deref() else {
        return Err(AppError::BadRequest("MFA has not been set up".to_owned()));
    };

    ensure_mfa_unlocked(&state, &user.name)?;

    if user.mfa_enabled {
        let ok = check_mfa_code(&state, user, &body.code).await?;
        record_mfa_outcome(&state, &user.name, ok, ip).await?;
        if !ok {
            return Err(AppError::Unauthorized("invalid MFA code".to_owned()));
        }
        return Ok(Json(json!({ "valid": true })));
    }

    let ok = state.mfa.validate_code(secret, &body.code)?;
    record_mfa_outcome(&state, &user.name, ok, ip).await?;
    if !ok {
        return Err(AppError::Unauthorized("invalid MFA code".to_owned()));
    }

    let recovery_codes = state.mfa.generate_recovery_codes(RECOVERY_CODE_COUNT);
    state.store.enable_mfa(&user.name, &recovery_codes).await?;
    state
        .audit(&user.name, "mfa.enabled", "TOTP verified and enabled", ip)
        .await;

    Ok(Json(json!({
        "enabled": true,
        "recovery_codes": recovery_codes,
    })))
}

/// Turn MFA off. An enabled setup needs a valid code; a pending one is
/// simply discarded.
async fn disable(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    caller: Caller,
    ApiJson(body): ApiJson<CodeRequest>,
) -> Result<Json<Value>, AppError> {
    let user = caller.user()?;
    if user.mfa_enabled {
        ensure_mfa_unlocked(&state, &user.name)?;
        let ok = check_mfa_code(&state, user, &body.code).await?;
        record_mfa_outcome(&state, &user.name, ok, ip).await?;
        if !ok {
            return Err(AppError::Unauthorized("invalid MFA code".to_owned()));
        }
    }

    state.store.set_mfa_secret(&user.name, None).await?;
    state.audit(&user.name, "mfa.disabled", "", ip).await;
    Ok(Json(json!({ "enabled": false })))
}
