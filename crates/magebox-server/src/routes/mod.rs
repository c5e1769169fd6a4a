//! HTTP routes, grouped by audience.
//!
//! - public: `/health`, `/api/join`
//! - any authenticated user: `/api/me`, `/api/environments`, `/api/mfa/*`,
//!   `/api/cert/*`
//! - admin: everything under `/api/admin`

pub mod audit;
pub mod ca;
pub mod cert;
pub mod environments;
pub mod health;
pub mod invites;
pub mod join;
pub mod me;
pub mod mfa;
pub mod projects;
pub mod sync;
pub mod users;

use std::sync::Arc;

use axum::Router;
use magebox_core::deploy::sanitize_username;

use crate::error::AppError;
use crate::state::AppState;

/// Routes any authenticated caller may use.
pub fn user_router() -> Router<Arc<AppState>> {
    Router::new()
        .merge(me::router())
        .merge(mfa::router())
        .merge(cert::router())
}

/// Routes nested under `/api/admin`.
pub fn admin_router() -> Router<Arc<AppState>> {
    Router::new()
        .nest("/users", users::router())
        .nest("/projects", projects::router())
        .nest("/environments", environments::router())
        .nest("/invites", invites::router())
        .nest("/audit", audit::router())
        .nest("/sync", sync::router())
        .nest("/ca", ca::router())
}

/// Names of users, projects, and environments: non-empty and limited to
/// `[A-Za-z0-9._-]` so they survive in `authorized_keys` markers and paths.
pub(crate) fn validate_name(kind: &str, name: &str) -> Result<(), AppError> {
    if name.is_empty() || name.len() > 64 || sanitize_username(name) != name {
        return Err(AppError::BadRequest(format!(
            "invalid {kind} name: use 1-64 characters from A-Z, a-z, 0-9, '.', '_', '-'"
        )));
    }
    Ok(())
}

/// Reject blank required fields.
pub(crate) fn require_field(field: &str, value: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::BadRequest(format!("{field} is required")));
    }
    Ok(())
}
