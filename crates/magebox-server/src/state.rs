//! Shared application state for the `MageBox` server.
//!
//! A single [`AppState`] is constructed at startup and shared across all
//! Axum handlers via `Arc`. Durable state lives in the [`Store`]; the only
//! in-memory state is the request guards.

use std::net::IpAddr;
use std::sync::Arc;

use tracing::warn;
use zeroize::Zeroizing;

use magebox_core::crypto::{self, TokenHashParams};
use magebox_core::deploy::KeyDeployer;
use magebox_core::mfa::MfaManager;
use magebox_storage::Store;

use crate::config::ServerConfig;
use crate::error::AppError;
use crate::notify::Notifier;
use crate::security::{LoginAttemptTracker, RateLimiter};
use crate::tasks::BackgroundTasks;

/// Shared application state passed to all HTTP handlers.
pub struct AppState {
    pub config: ServerConfig,
    pub store: Store,
    pub mfa: MfaManager,
    pub deployer: Arc<dyn KeyDeployer>,
    pub notifier: Arc<dyn Notifier>,
    pub tasks: BackgroundTasks,
    pub rate_limiter: RateLimiter,
    pub login_attempts: LoginAttemptTracker,
    /// MFA failures, keyed by user name.
    pub mfa_attempts: LoginAttemptTracker<String>,
    /// Argon2id hash of the static admin token.
    pub admin_token_hash: String,
    /// Cost parameters for newly hashed tokens.
    pub token_params: TokenHashParams,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

impl AppState {
    #[must_use]
    pub fn new(
        config: ServerConfig,
        store: Store,
        admin_token_hash: String,
        deployer: Arc<dyn KeyDeployer>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            mfa: MfaManager::new(config.mfa_issuer.clone()),
            tasks: BackgroundTasks::new(config.max_background_tasks),
            rate_limiter: RateLimiter::new(config.rate_limit, config.rate_window),
            login_attempts: LoginAttemptTracker::new(
                config.lockout_max_attempts,
                config.lockout_duration,
            ),
            mfa_attempts: LoginAttemptTracker::new(
                config.lockout_max_attempts,
                config.lockout_duration,
            ),
            config,
            store,
            deployer,
            notifier,
            admin_token_hash,
            token_params: TokenHashParams::default(),
        }
    }

    /// Override the Argon2id cost for newly issued tokens.
    #[must_use]
    pub fn with_token_params(mut self, params: TokenHashParams) -> Self {
        self.token_params = params;
        self
    }

    /// Append to the audit log. A failed append is logged, not returned.
    pub async fn audit(&self, actor: &str, action: &str, details: &str, ip: IpAddr) {
        if let Err(e) = self
            .store
            .append_audit(actor, action, details, &ip.to_string())
            .await
        {
            warn!(actor, action, error = %e, "audit append failed");
        }
    }

    /// Hash a token on the blocking pool.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Internal`] if hashing fails.
    pub async fn hash_token(&self, token: &str) -> Result<String, AppError> {
        let token = Zeroizing::new(token.to_owned());
        let params = self.token_params;
        let hash =
            tokio::task::spawn_blocking(move || crypto::hash_token_with(&token, params)).await??;
        Ok(hash)
    }

    /// Check a token against a stored hash on the blocking pool.
    pub async fn verify_token(&self, token: &str, hash: &str) -> bool {
        let token = Zeroizing::new(token.to_owned());
        let hash = hash.to_owned();
        tokio::task::spawn_blocking(move || crypto::verify_token(&token, &hash))
            .await
            .unwrap_or(false)
    }

    /// Issue a session token for `username`. Returns the plaintext token and
    /// its hash; only the hash is stored.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Internal`] if hashing fails.
    pub async fn issue_session_token(
        &self,
        username: &str,
    ) -> Result<(Zeroizing<String>, String), AppError> {
        let token = Zeroizing::new(format!("{username}.{}", crypto::generate_token()));
        let hash = self.hash_token(&token).await?;
        Ok((token, hash))
    }
}

/// Split a session token into the username it names and its secret part.
///
/// The secret is URL-safe base64 and never contains `.`, so the last dot
/// separates the two.
#[must_use]
pub fn session_token_user(token: &str) -> Option<&str> {
    token
        .rsplit_once('.')
        .map(|(user, _)| user)
        .filter(|user| !user.is_empty())
}
