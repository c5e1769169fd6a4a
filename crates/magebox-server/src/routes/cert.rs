//! SSH certificate lifecycle: `/api/cert/renew`, `/api/cert/info`

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{Value, json};

use magebox_core::ssh;
use magebox_storage::now;

use crate::auth::Caller;
use crate::certs::{self, CertificateResponse};
use crate::client_ip::ClientIp;
use crate::error::AppError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/cert/renew", post(renew))
        .route("/api/cert/info", get(info))
}

#[derive(Serialize)]
pub struct RenewResponse {
    #[serde(flatten)]
    pub certificate: CertificateResponse,
    pub ca_public_key: String,
}

async fn renew(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    caller: Caller,
) -> Result<Json<RenewResponse>, AppError> {
    let user = caller.user()?;
    let Some(ca) = certs::ca_keys(&state).await? else {
        return Err(AppError::BadRequest(
            "the certificate authority is disabled".to_owned(),
        ));
    };
    if user.projects.is_empty() {
        return Err(AppError::Forbidden("no project access".to_owned()));
    }

    let principals = state.store.deploy_users_for(&user.name).await?;
    let cert = certs::issue_certificate(&state, &ca, user, &principals).await?;
    state
        .audit(
            &user.name,
            "cert.renewed",
            &format!(
                "serial {} for [{}] until {}",
                cert.serial,
                cert.principals.join(", "),
                cert.valid_before.to_rfc3339()
            ),
            ip,
        )
        .await;

    Ok(Json(RenewResponse {
        certificate: cert.into(),
        ca_public_key: ca.public_key,
    }))
}

/// The caller's most recent certificate and the principals a new one
/// would carry.
async fn info(State(state): State<Arc<AppState>>, caller: Caller) -> Result<Json<Value>, AppError> {
    let user = caller.user()?;
    let ca = certs::ca_keys(&state).await?;
    let ca_fingerprint = ca
        .as_ref()
        .map(|ca| ssh::fingerprint(&ca.public_key))
        .transpose()?;
    let principals = state.store.deploy_users_for(&user.name).await?;

    Ok(Json(json!({
        "ca_enabled": ca.is_some(),
        "ca_public_key": ca.as_ref().map(|ca| ca.public_key.clone()),
        "ca_fingerprint": ca_fingerprint,
        "serial": user.cert_serial,
        "valid_before": user.cert_valid_before,
        "valid": user.cert_valid_before.is_some_and(|t| t > now()),
        "principals": principals,
        "validity_hours": state.config.cert_validity.as_secs() / 3600,
    })))
}
