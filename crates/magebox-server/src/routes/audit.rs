//! Audit retrieval: `/api/admin/audit`, `/api/admin/audit/verify`

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use magebox_core::audit::{AuditEntry, ChainVerification};
use magebox_storage::models::AuditQuery;

use crate::error::{ApiQuery, AppError};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(query_audit))
        .route("/verify", get(verify_chain))
}

async fn query_audit(
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<AuditQuery>,
) -> Result<Json<Vec<AuditEntry>>, AppError> {
    Ok(Json(state.store.query_audit(&query).await?))
}

async fn verify_chain(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ChainVerification>, AppError> {
    let verification = state.store.verify_audit().await?;
    if !verification.valid {
        tracing::warn!(
            first_invalid_index = ?verification.first_invalid_index,
            "audit chain verification failed"
        );
    }
    Ok(Json(verification))
}
