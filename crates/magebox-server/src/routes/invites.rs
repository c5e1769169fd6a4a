//! Invite administration: `/api/admin/invites/*`

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get};
use axum::{Json, Router};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use magebox_core::crypto;
use magebox_storage::models::{Invite, NewInvite, Role};
use magebox_storage::{StoreError, now};

use crate::auth::Caller;
use crate::client_ip::ClientIp;
use crate::error::{ApiJson, AppError};
use crate::routes::{require_field, validate_name};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_invites).post(create_invite))
        .route("/{id}", delete(revoke_invite))
}

#[derive(Deserialize)]
pub struct CreateInviteRequest {
    pub username: String,
    pub email: String,
    #[serde(default = "default_role")]
    pub role: Role,
    #[serde(default)]
    pub projects: Vec<String>,
    /// Lifetime override. Defaults to the configured invite TTL.
    pub ttl_hours: Option<i64>,
}

const fn default_role() -> Role {
    Role::Dev
}

#[derive(Serialize)]
pub struct CreateInviteResponse {
    pub invite: Invite,
    /// Redeemed at `/api/join`. Shown once.
    pub token: String,
}

async fn list_invites(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Invite>>, AppError> {
    Ok(Json(state.store.list_pending_invites().await?))
}

async fn create_invite(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    caller: Caller,
    ApiJson(body): ApiJson<CreateInviteRequest>,
) -> Result<(StatusCode, Json<CreateInviteResponse>), AppError> {
    validate_name("user", &body.username)?;
    require_field("email", &body.email)?;
    let ttl_hours = body.ttl_hours.unwrap_or(state.config.invite_ttl_hours);
    if !(1..=24 * 30).contains(&ttl_hours) {
        return Err(AppError::BadRequest(
            "ttl_hours must be between 1 and 720".to_owned(),
        ));
    }

    match state.store.get_user(&body.username).await {
        Ok(_) => {
            return Err(AppError::Conflict(format!(
                "user {} already exists",
                body.username
            )));
        }
        Err(StoreError::NotFound(_)) => {}
        Err(e) => return Err(e.into()),
    }

    let token = Zeroizing::new(crypto::generate_token());
    let token_hash = state.hash_token(&token).await?;
    let invite = state
        .store
        .create_invite(&NewInvite {
            token_hash,
            username: body.username,
            email: body.email,
            role: body.role,
            projects: body.projects,
            created_by: caller.name.clone(),
            expires_at: now() + Duration::hours(ttl_hours),
        })
        .await?;

    state
        .audit(
            &caller.name,
            "invite.created",
            &format!(
                "#{} for {} ({}) expiring {}",
                invite.id,
                invite.username,
                invite.role,
                invite.expires_at.to_rfc3339()
            ),
            ip,
        )
        .await;

    {
        let state_bg = Arc::clone(&state);
        let invited = invite.clone();
        let token = token.clone();
        state.tasks.spawn("invite-email", async move {
            state_bg.notifier.send_user_invited(&invited, &token).await
        });
    }

    Ok((
        StatusCode::CREATED,
        Json(CreateInviteResponse {
            invite,
            token: token.as_str().to_owned(),
        }),
    ))
}

async fn revoke_invite(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    caller: Caller,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    state.store.delete_invite(id).await?;
    state
        .audit(&caller.name, "invite.revoked", &format!("#{id}"), ip)
        .await;
    Ok(StatusCode::NO_CONTENT)
}
