//! Self-service: `/api/me`, `/api/environments`

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};

use magebox_storage::models::Environment;

use crate::auth::Caller;
use crate::error::AppError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/me", get(me))
        .route("/api/environments", get(environments))
}

/// The caller's own account. Secrets are never serialized.
async fn me(caller: Caller) -> Result<Json<Value>, AppError> {
    let Some(user) = caller.user else {
        return Ok(Json(json!({
            "name": caller.name,
            "role": caller.role,
            "static_token": true,
        })));
    };
    serde_json::to_value(&user)
        .map(Json)
        .map_err(|e| AppError::Internal(e.to_string()))
}

/// Environments the caller can reach. Admins see all of them.
async fn environments(
    State(state): State<Arc<AppState>>,
    caller: Caller,
) -> Result<Json<Vec<Environment>>, AppError> {
    let envs = if caller.role.is_admin() {
        state.store.list_environments(None).await?
    } else {
        state.store.list_user_environments(&caller.name).await?
    };
    Ok(Json(envs))
}
