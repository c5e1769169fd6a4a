//! Environment administration: `/api/admin/environments/*`
//!
//! The deploy key is accepted on creation and never returned.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::warn;
use zeroize::Zeroizing;

use magebox_core::ssh;
use magebox_storage::models::{Environment, NewEnvironment};

use crate::auth::Caller;
use crate::client_ip::ClientIp;
use crate::error::{ApiJson, ApiQuery, AppError};
use crate::keysync::pin_fingerprint;
use crate::routes::{require_field, validate_name};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_environments).post(create_environment))
        .route(
            "/{project}/{name}",
            get(get_environment).delete(delete_environment),
        )
        .route("/{project}/{name}/test", post(test_environment))
}

// ── Request types ────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ListQuery {
    pub project: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateEnvironmentRequest {
    pub project: String,
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub deploy_user: String,
    /// OpenSSH private key used to log in as `deploy_user`.
    pub deploy_key: String,
}

const fn default_port() -> u16 {
    22
}

// ── Handlers ─────────────────────────────────────────────────────────

async fn list_environments(
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<ListQuery>,
) -> Result<Json<Vec<Environment>>, AppError> {
    Ok(Json(
        state
            .store
            .list_environments(query.project.as_deref())
            .await?,
    ))
}

async fn create_environment(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    caller: Caller,
    ApiJson(body): ApiJson<CreateEnvironmentRequest>,
) -> Result<(StatusCode, Json<Environment>), AppError> {
    validate_name("environment", &body.name)?;
    require_field("host", &body.host)?;
    require_field("deploy_user", &body.deploy_user)?;
    if body.port == 0 {
        return Err(AppError::BadRequest("port must be non-zero".to_owned()));
    }

    let deploy_key = Zeroizing::new(body.deploy_key);
    ssh::parse_private_key(&deploy_key)
        .map_err(|e| AppError::BadRequest(format!("invalid deploy key: {e}")))?;

    let env = state
        .store
        .create_environment(&NewEnvironment {
            project: body.project,
            name: body.name,
            host: body.host.trim().to_owned(),
            port: body.port,
            deploy_user: body.deploy_user.trim().to_owned(),
            deploy_key,
        })
        .await?;

    state
        .audit(
            &caller.name,
            "environment.created",
            &format!(
                "{} ({}@{}:{})",
                env.qualified_name(),
                env.deploy_user,
                env.host,
                env.port
            ),
            ip,
        )
        .await;
    Ok((StatusCode::CREATED, Json(env)))
}

async fn get_environment(
    State(state): State<Arc<AppState>>,
    Path((project, name)): Path<(String, String)>,
) -> Result<Json<Environment>, AppError> {
    Ok(Json(state.store.get_environment(&project, &name).await?))
}

async fn delete_environment(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    caller: Caller,
    Path((project, name)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    state.store.delete_environment(&project, &name).await?;
    state
        .audit(
            &caller.name,
            "environment.deleted",
            &format!("{project}/{name}"),
            ip,
        )
        .await;
    Ok(StatusCode::NO_CONTENT)
}

/// Log in with the deploy key. A first successful contact pins the host
/// key. Connection failures are reported in the body, not as an error.
async fn test_environment(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    caller: Caller,
    Path((project, name)): Path<(String, String)>,
) -> Result<Json<Value>, AppError> {
    let env = state.store.get_deployable(&project, &name).await?;
    let qualified = env.environment.qualified_name();

    match state.deployer.test_connection(&env.target()).await {
        Ok(fingerprint) => {
            let pinned = pin_fingerprint(&state, &env.environment, &fingerprint).await;
            state
                .audit(&caller.name, "environment.tested", &qualified, ip)
                .await;
            Ok(Json(json!({
                "environment": qualified,
                "success": true,
                "host_key_fingerprint": fingerprint,
                "pinned": pinned,
            })))
        }
        Err(e) => {
            warn!(environment = %qualified, error = %e, "connection test failed");
            state
                .audit(
                    &caller.name,
                    "environment.test_failed",
                    &format!("{qualified}: {e}"),
                    ip,
                )
                .await;
            Ok(Json(json!({
                "environment": qualified,
                "success": false,
                "error": e.to_string(),
            })))
        }
    }
}
