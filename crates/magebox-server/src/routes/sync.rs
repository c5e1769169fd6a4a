//! Key reconciliation: `POST /api/admin/sync`
//!
//! `environment` selects the scope: empty for every environment, a project
//! name for that project, or `project/name` for one environment. One
//! unreachable host does not stop the rest; each gets its own result.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::auth::Caller;
use crate::client_ip::ClientIp;
use crate::error::{ApiJson, AppError};
use crate::keysync::{EnvironmentSync, sync_environments};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", post(sync))
}

#[derive(Debug, Default, Deserialize)]
pub struct SyncRequest {
    #[serde(default)]
    pub environment: String,
}

#[derive(Serialize)]
pub struct SyncResponse {
    pub results: Vec<EnvironmentSync>,
    pub succeeded: usize,
    pub failed: usize,
}

async fn sync(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    caller: Caller,
    ApiJson(body): ApiJson<SyncRequest>,
) -> Result<Json<SyncResponse>, AppError> {
    let scope = body.environment.trim();
    let targets = if scope.is_empty() {
        state.store.list_deployable(None).await?
    } else if let Some((project, name)) = scope.split_once('/') {
        vec![state.store.get_deployable(project, name).await?]
    } else {
        state.store.get_project(scope).await?;
        state.store.list_deployable(Some(scope)).await?
    };

    let results = sync_environments(&state, &targets).await;
    let succeeded = results.iter().filter(|r| r.success).count();
    let failed = results.len() - succeeded;

    state
        .audit(
            &caller.name,
            "sync",
            &format!(
                "scope {}: {succeeded} ok, {failed} failed",
                if scope.is_empty() { "all" } else { scope }
            ),
            ip,
        )
        .await;

    Ok(Json(SyncResponse {
        results,
        succeeded,
        failed,
    }))
}
