//! `GET /api/admin/ca`

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};

use magebox_core::ssh;

use crate::certs;
use crate::error::AppError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(ca_info))
}

/// The CA public key, for `TrustedUserCAKeys` on managed hosts.
async fn ca_info(State(state): State<Arc<AppState>>) -> Result<Json<Value>, AppError> {
    let Some(ca) = certs::ca_keys(&state).await? else {
        return Ok(Json(json!({ "enabled": false })));
    };
    let fingerprint = ssh::fingerprint(&ca.public_key)?;
    Ok(Json(json!({
        "enabled": true,
        "public_key": ca.public_key,
        "fingerprint": fingerprint,
        "validity_hours": state.config.cert_validity.as_secs() / 3600,
    })))
}
