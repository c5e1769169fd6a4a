//! User administration: `/api/admin/users/*`

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use magebox_core::ssh;
use magebox_storage::models::{NewUser, Role, User, UserUpdate};

use crate::auth::Caller;
use crate::client_ip::ClientIp;
use crate::error::{ApiJson, AppError};
use crate::keysync;
use crate::routes::{require_field, validate_name};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_users).post(create_user))
        .route("/{name}", get(get_user).put(update_user).delete(delete_user))
        .route("/{name}/access", post(grant_access).delete(revoke_access))
}

// ── Request / Response types ─────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateUserRequest {
    pub name: String,
    pub email: String,
    #[serde(default = "default_role")]
    pub role: Role,
    pub expires_at: Option<DateTime<Utc>>,
    /// An existing public key. A key pair is generated when omitted.
    pub public_key: Option<String>,
    #[serde(default)]
    pub projects: Vec<String>,
}

const fn default_role() -> Role {
    Role::Dev
}

#[derive(Serialize)]
pub struct CreateUserResponse {
    pub user: User,
    /// Session token. Shown once.
    pub token: String,
    /// Present only when the key pair was generated here. Shown once.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateUserRequest {
    pub email: Option<String>,
    pub role: Option<Role>,
    /// `null` clears the expiry; omitting the field leaves it unchanged.
    #[serde(default, deserialize_with = "present")]
    pub expires_at: Option<Option<DateTime<Utc>>>,
}

/// Distinguish an explicit `null` from an absent field.
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Deserialize)]
pub struct AccessRequest {
    pub project: String,
}

// ── Handlers ─────────────────────────────────────────────────────────

async fn list_users(State(state): State<Arc<AppState>>) -> Result<Json<Vec<User>>, AppError> {
    Ok(Json(state.store.list_users().await?))
}

async fn create_user(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    caller: Caller,
    ApiJson(body): ApiJson<CreateUserRequest>,
) -> Result<(StatusCode, Json<CreateUserResponse>), AppError> {
    validate_name("user", &body.name)?;
    require_field("email", &body.email)?;

    let (public_key, private_key) = match body.public_key {
        Some(key) => {
            ssh::parse_public_key(&key)
                .map_err(|e| AppError::BadRequest(format!("invalid public key: {e}")))?;
            (key.trim().to_owned(), None)
        }
        None => {
            let pair = ssh::generate_keypair(&body.email)?;
            (pair.public_key, Some(pair.private_key.as_str().to_owned()))
        }
    };

    let (token, token_hash) = state.issue_session_token(&body.name).await?;
    let user = state
        .store
        .create_user(
            NewUser {
                name: body.name,
                email: body.email,
                role: body.role,
                expires_at: body.expires_at,
                public_key: Some(public_key),
                token_hash,
                created_by: caller.name.clone(),
            },
            &body.projects,
        )
        .await?;

    state
        .audit(
            &caller.name,
            "user.created",
            &format!(
                "{} ({}) with projects [{}]",
                user.name,
                user.role,
                user.projects.join(", ")
            ),
            ip,
        )
        .await;
    keysync::spawn_key_push(&state, user.name.clone(), None);

    Ok((
        StatusCode::CREATED,
        Json(CreateUserResponse {
            user,
            token: token.as_str().to_owned(),
            private_key,
        }),
    ))
}

async fn get_user(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<User>, AppError> {
    Ok(Json(state.store.get_user(&name).await?))
}

async fn update_user(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    caller: Caller,
    Path(name): Path<String>,
    ApiJson(body): ApiJson<UpdateUserRequest>,
) -> Result<Json<User>, AppError> {
    if let Some(email) = &body.email {
        require_field("email", email)?;
    }
    let update = UserUpdate {
        email: body.email,
        role: body.role,
        expires_at: body.expires_at,
    };
    let user = state.store.update_user(&name, &update).await?;

    let mut changes = Vec::new();
    if update.email.is_some() {
        changes.push(format!("email={}", user.email));
    }
    if update.role.is_some() {
        changes.push(format!("role={}", user.role));
    }
    if update.expires_at.is_some() {
        changes.push(format!(
            "expires_at={}",
            user.expires_at.map_or_else(|| "never".to_owned(), |t| t.to_rfc3339())
        ));
    }
    state
        .audit(
            &caller.name,
            "user.updated",
            &format!("{name}: {}", changes.join(", ")),
            ip,
        )
        .await;

    Ok(Json(user))
}

/// Delete a user and, in the background, pull their key from every
/// environment they could reach.
async fn delete_user(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    caller: Caller,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    state.store.get_user(&name).await?;
    let reachable = state.store.list_user_deployable(&name).await?;
    state.store.delete_user(&name).await?;

    state.audit(&caller.name, "user.deleted", &name, ip).await;
    keysync::spawn_key_removal(&state, name, reachable);
    Ok(StatusCode::NO_CONTENT)
}

async fn grant_access(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    caller: Caller,
    Path(name): Path<String>,
    ApiJson(body): ApiJson<AccessRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let granted = state.store.grant_access(&name, &body.project).await?;
    if granted {
        state
            .audit(
                &caller.name,
                "access.granted",
                &format!("{name} -> {}", body.project),
                ip,
            )
            .await;
        keysync::spawn_key_push(&state, name.clone(), Some(body.project.clone()));
    }
    Ok(Json(serde_json::json!({
        "user": name,
        "project": body.project,
        "changed": granted,
    })))
}

async fn revoke_access(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    caller: Caller,
    Path(name): Path<String>,
    ApiJson(body): ApiJson<AccessRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let revoked = state.store.revoke_access(&name, &body.project).await?;
    if revoked {
        state
            .audit(
                &caller.name,
                "access.revoked",
                &format!("{name} -x {}", body.project),
                ip,
            )
            .await;
        keysync::spawn_project_key_removal(&state, name.clone(), body.project.clone());
    }
    Ok(Json(serde_json::json!({
        "user": name,
        "project": body.project,
        "changed": revoked,
    })))
}
