//! Pushing user keys to environments.
//!
//! Full reconciliation runs inline for the `sync` endpoint and reports a
//! result per environment. Incremental pushes after a join, a grant, or a
//! revocation run as background tasks; `sync` is the authoritative repair.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use magebox_core::deploy::UserKey;
use magebox_storage::models::{DeployableEnvironment, Environment};

use crate::state::AppState;

/// Outcome of reconciling one environment.
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentSync {
    /// `project/name`
    pub environment: String,
    pub success: bool,
    pub added: usize,
    pub removed: usize,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Pin the fingerprint a host presented if none was recorded yet.
pub async fn pin_fingerprint(state: &AppState, env: &Environment, fingerprint: &str) -> bool {
    if env.host_key_fingerprint.is_some() || fingerprint.is_empty() {
        return false;
    }
    match state.store.pin_host_key(env.id, fingerprint).await {
        Ok(pinned) => {
            if pinned {
                info!(environment = %env.qualified_name(), fingerprint, "host key pinned");
            }
            pinned
        }
        Err(e) => {
            warn!(environment = %env.qualified_name(), error = %e, "failed to pin host key");
            false
        }
    }
}

/// Make one environment's managed keys match its project's current users.
pub async fn sync_environment(state: &AppState, env: &DeployableEnvironment) -> EnvironmentSync {
    let name = env.environment.qualified_name();
    let outcome = async {
        let keys = state
            .store
            .project_user_keys(env.environment.project_id)
            .await
            .map_err(|e| e.to_string())?;
        state
            .deployer
            .sync_environment(&env.target(), &keys)
            .await
            .map_err(|e| e.to_string())
    }
    .await;

    match outcome {
        Ok(result) => {
            pin_fingerprint(state, &env.environment, &result.host_key_fingerprint).await;
            info!(
                environment = %name,
                added = result.added,
                removed = result.removed,
                "environment synced"
            );
            EnvironmentSync {
                environment: name,
                success: true,
                added: result.added,
                removed: result.removed,
                message: result.message,
                error: None,
            }
        }
        Err(e) => {
            warn!(environment = %name, error = %e, "environment sync failed");
            EnvironmentSync {
                environment: name,
                success: false,
                added: 0,
                removed: 0,
                message: "sync failed".to_owned(),
                error: Some(e),
            }
        }
    }
}

/// Sync each environment in turn. A failure is recorded and the rest
/// continue.
pub async fn sync_environments(
    state: &AppState,
    envs: &[DeployableEnvironment],
) -> Vec<EnvironmentSync> {
    let mut results = Vec::with_capacity(envs.len());
    for env in envs {
        results.push(sync_environment(state, env).await);
    }
    results
}

/// In the background, add `username`'s key to every environment of
/// `project`, or to every environment they can reach when `project` is
/// `None`.
pub fn spawn_key_push(state: &Arc<AppState>, username: String, project: Option<String>) {
    let state_bg = Arc::clone(state);
    state.tasks.spawn("key-push", async move {
        let user = state_bg
            .store
            .get_user(&username)
            .await
            .map_err(|e| e.to_string())?;
        let Some(public_key) = user.public_key else {
            return Ok(());
        };
        let envs = match project.as_deref() {
            Some(project) => state_bg.store.list_deployable(Some(project)).await,
            None => state_bg.store.list_user_deployable(&username).await,
        }
        .map_err(|e| e.to_string())?;

        let key = UserKey::new(username.clone(), public_key);
        for env in envs {
            match state_bg.deployer.add_key(&env.target(), &key).await {
                Ok(result) => {
                    pin_fingerprint(&state_bg, &env.environment, &result.host_key_fingerprint)
                        .await;
                    info!(
                        user = %username,
                        environment = %env.environment.qualified_name(),
                        added = result.added,
                        "key pushed"
                    );
                }
                Err(e) => warn!(
                    user = %username,
                    environment = %env.environment.qualified_name(),
                    error = %e,
                    "key push failed"
                ),
            }
        }
        Ok::<_, String>(())
    });
}

/// In the background, remove `username`'s managed keys from `envs`.
pub fn spawn_key_removal(
    state: &Arc<AppState>,
    username: String,
    envs: Vec<DeployableEnvironment>,
) {
    let state_bg = Arc::clone(state);
    state.tasks.spawn("key-removal", async move {
        for env in envs {
            match state_bg.deployer.remove_key(&env.target(), &username).await {
                Ok(result) => info!(
                    user = %username,
                    environment = %env.environment.qualified_name(),
                    removed = result.removed,
                    "key removed"
                ),
                Err(e) => warn!(
                    user = %username,
                    environment = %env.environment.qualified_name(),
                    error = %e,
                    "key removal failed"
                ),
            }
        }
        Ok::<_, String>(())
    });
}

/// Like [`spawn_key_removal`], for every environment of `project`.
pub fn spawn_project_key_removal(state: &Arc<AppState>, username: String, project: String) {
    let state_bg = Arc::clone(state);
    state.tasks.spawn("key-removal", async move {
        let envs = state_bg
            .store
            .list_deployable(Some(&project))
            .await
            .map_err(|e| e.to_string())?;
        spawn_key_removal(&state_bg, username, envs);
        Ok::<_, String>(())
    });
}
