//! SSH key deployment.
//!
//! [`KeyDeployer`] is the seam the server talks to; [`SshDeployer`] is the
//! real implementation that logs in as an environment's deploy user and
//! rewrites `~/.ssh/authorized_keys`.

mod authorized_keys;
mod client;

use std::fmt;

use zeroize::Zeroizing;

pub use authorized_keys::{
    KeyDiff, MARKER_PREFIX, UserKey, add_managed_key, build_authorized_keys, keys_match, marker,
    remove_managed_key, sanitize_username,
};
pub use client::SshDeployer;

use crate::error::DeployError;

/// Connection details for one environment.
#[derive(Clone)]
pub struct DeployTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Decrypted OpenSSH private key.
    pub private_key: Zeroizing<String>,
    /// Pinned `SHA256:` host key fingerprint. `None` means trust on first use.
    pub host_key_fingerprint: Option<String>,
}

impl fmt::Debug for DeployTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeployTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("private_key", &"[REDACTED]")
            .field("host_key_fingerprint", &self.host_key_fingerprint)
            .finish()
    }
}

/// Outcome of a key operation against one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResult {
    pub added: usize,
    pub removed: usize,
    pub message: String,
    /// Fingerprint the host presented. Callers pin it when the target had
    /// none recorded.
    pub host_key_fingerprint: String,
}

impl SyncResult {
    pub(crate) fn from_diff(diff: &KeyDiff, written: bool, fingerprint: String) -> Self {
        let message = if written {
            format!("added {}, removed {}", diff.added, diff.removed)
        } else {
            "already up to date".to_owned()
        };
        Self {
            added: diff.added,
            removed: diff.removed,
            message,
            host_key_fingerprint: fingerprint,
        }
    }
}

/// Operations the server needs from a key deployer.
#[async_trait::async_trait]
pub trait KeyDeployer: Send + Sync {
    /// Make the managed section of the host's file match `users` exactly.
    async fn sync_environment(
        &self,
        target: &DeployTarget,
        users: &[UserKey],
    ) -> Result<SyncResult, DeployError>;

    /// Add a single user's key, leaving everything else alone.
    async fn add_key(&self, target: &DeployTarget, user: &UserKey)
    -> Result<SyncResult, DeployError>;

    /// Remove every managed line belonging to `username`.
    async fn remove_key(
        &self,
        target: &DeployTarget,
        username: &str,
    ) -> Result<SyncResult, DeployError>;

    /// Log in and run a no-op. Returns the host key fingerprint.
    async fn test_connection(&self, target: &DeployTarget) -> Result<String, DeployError>;

    /// Read the host key fingerprint without authenticating.
    async fn host_key_fingerprint(&self, host: &str, port: u16) -> Result<String, DeployError>;
}
