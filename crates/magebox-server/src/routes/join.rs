//! Invite redemption: `POST /api/join`
//!
//! The only endpoint that ever sends a private key. The invite is found by
//! checking the token against every pending invite, never by ID.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use zeroize::Zeroizing;

use magebox_core::ssh;
use magebox_storage::StoreError;
use magebox_storage::models::{NewUser, Role};

use crate::auth::record_auth_failure;
use crate::certs::{self, CertificateResponse};
use crate::client_ip::ClientIp;
use crate::error::{ApiJson, AppError};
use crate::keysync;
use crate::state::AppState;

/// Joins hash a token and generate a key pair; cap how many run at once.
const MAX_CONCURRENT_JOINS: usize = 8;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/join", post(join))
        .layer(tower::limit::ConcurrencyLimitLayer::new(MAX_CONCURRENT_JOINS))
}

// ── Request / Response types ─────────────────────────────────────────

#[derive(Deserialize)]
pub struct JoinRequest {
    pub token: String,
}

#[derive(Serialize)]
pub struct JoinResponse {
    pub username: String,
    pub email: String,
    pub role: Role,
    pub projects: Vec<String>,
    /// Session token for the API. Shown once.
    pub token: String,
    /// OpenSSH private key. Shown once and never stored.
    pub private_key: String,
    pub public_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<CertificateResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_public_key: Option<String>,
}

// ── Handlers ─────────────────────────────────────────────────────────

async fn join(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    ApiJson(body): ApiJson<JoinRequest>,
) -> Result<(StatusCode, Json<JoinResponse>), AppError> {
    let invite_token = Zeroizing::new(body.token);
    let Some(invite) = state.store.find_invite_by_token(&invite_token).await? else {
        return Err(record_auth_failure(
            &state,
            ip,
            "invite",
            "invalid or expired invite",
            None,
        )
        .await);
    };

    let keypair = ssh::generate_keypair(&invite.email)?;
    let (session_token, token_hash) = state.issue_session_token(&invite.username).await?;

    let new_user = NewUser {
        name: invite.username.clone(),
        email: invite.email.clone(),
        role: invite.role,
        expires_at: None,
        public_key: Some(keypair.public_key.clone()),
        token_hash,
        created_by: format!("invite:{}", invite.created_by),
    };
    let user = match state.store.redeem_invite(invite.id, new_user).await {
        Ok(user) => user,
        Err(StoreError::NotFound(_)) => {
            return Err(record_auth_failure(
                &state,
                ip,
                &invite.username,
                "invite expired or already used",
                None,
            )
            .await);
        }
        Err(StoreError::AlreadyExists(_)) => {
            state
                .audit(&invite.username, "join.rejected", "username already taken", ip)
                .await;
            return Err(AppError::Forbidden(format!(
                "username {} is already taken",
                invite.username
            )));
        }
        Err(e) => return Err(e.into()),
    };

    state.login_attempts.clear(&ip);
    state
        .audit(
            &user.name,
            "user.joined",
            &format!(
                "joined via invite #{} as {} with projects [{}]",
                invite.id,
                user.role,
                user.projects.join(", ")
            ),
            ip,
        )
        .await;
    info!(user = %user.name, role = %user.role, "user joined");

    keysync::spawn_key_push(&state, user.name.clone(), None);
    {
        let state_bg = Arc::clone(&state);
        let joined = user.clone();
        state.tasks.spawn("welcome-email", async move {
            state_bg.notifier.send_user_joined(&joined).await
        });
    }

    // The account exists from here on; failures only drop the certificate.
    let (certificate, ca_public_key) = match certs::ca_keys(&state).await {
        Ok(Some(ca)) => {
            let principals = match state.store.deploy_users_for(&user.name).await {
                Ok(principals) => principals,
                Err(e) => {
                    warn!(user = %user.name, error = %e, "principal lookup at join failed");
                    Vec::new()
                }
            };
            let certificate = if principals.is_empty() {
                None
            } else {
                match certs::issue_certificate(&state, &ca, &user, &principals).await {
                    Ok(cert) => Some(CertificateResponse::from(cert)),
                    Err(e) => {
                        warn!(user = %user.name, error = ?e, "certificate signing at join failed");
                        None
                    }
                }
            };
            (certificate, Some(ca.public_key))
        }
        Ok(None) => (None, None),
        Err(e) => {
            warn!(user = %user.name, error = ?e, "CA unavailable at join");
            (None, None)
        }
    };

    Ok((
        StatusCode::CREATED,
        Json(JoinResponse {
            username: user.name,
            email: user.email,
            role: user.role,
            projects: user.projects,
            token: session_token.as_str().to_owned(),
            private_key: keypair.private_key.as_str().to_owned(),
            public_key: keypair.public_key,
            certificate,
            ca_public_key,
        }),
    ))
}
