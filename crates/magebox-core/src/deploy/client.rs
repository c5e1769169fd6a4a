//! russh-backed [`KeyDeployer`].

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use russh::client::{self, Handle, Handler};
use russh::keys::{HashAlg, PrivateKeyWithHashAlg, PublicKey};
use russh::{ChannelMsg, Disconnect};
use tracing::{debug, info, warn};

use super::authorized_keys::{
    KeyDiff, UserKey, add_managed_key, build_authorized_keys, remove_managed_key,
};
use super::{DeployTarget, KeyDeployer, SyncResult};
use crate::error::DeployError;

/// Only a missing file reads as empty; any other read error fails the command.
const READ_KEYS: &str = "[ ! -e ~/.ssh/authorized_keys ] || cat ~/.ssh/authorized_keys";
const TMP_PATH: &str = "~/.ssh/authorized_keys.magebox.tmp";

/// Verifies the server's host key during the handshake.
struct HostKeyCheck {
    pinned: Option<String>,
    seen: Arc<Mutex<Option<String>>>,
    /// Record the key and abort the handshake.
    capture_only: bool,
}

impl Handler for HostKeyCheck {
    type Error = DeployError;

    async fn check_server_key(&mut self, server_key: &PublicKey) -> Result<bool, Self::Error> {
        let actual = server_key.fingerprint(HashAlg::Sha256).to_string();
        *self.seen.lock().unwrap_or_else(PoisonError::into_inner) = Some(actual.clone());

        if self.capture_only {
            return Ok(false);
        }
        match &self.pinned {
            Some(expected) if *expected != actual => Err(DeployError::HostKeyMismatch {
                expected: expected.clone(),
                actual,
            }),
            _ => Ok(true),
        }
    }
}

struct Session {
    handle: Handle<HostKeyCheck>,
    fingerprint: String,
}

/// Deploys keys over SSH with a fixed dial timeout.
#[derive(Debug, Clone)]
pub struct SshDeployer {
    timeout: Duration,
}

impl SshDeployer {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn config(&self) -> Arc<client::Config> {
        Arc::new(client::Config {
            inactivity_timeout: Some(self.timeout),
            ..Default::default()
        })
    }

    fn timeout_err(&self, host: &str) -> DeployError {
        DeployError::Timeout {
            host: host.to_owned(),
            secs: self.timeout.as_secs(),
        }
    }

    async fn connect(&self, target: &DeployTarget) -> Result<Session, DeployError> {
        let key = russh::keys::decode_secret_key(&target.private_key, None).map_err(|e| {
            DeployError::InvalidKey {
                reason: e.to_string(),
            }
        })?;

        let seen = Arc::new(Mutex::new(None));
        let handler = HostKeyCheck {
            pinned: target.host_key_fingerprint.clone(),
            seen: Arc::clone(&seen),
            capture_only: false,
        };

        let dial = async {
            let mut handle = client::connect(
                self.config(),
                (target.host.as_str(), target.port),
                handler,
            )
            .await?;
            let auth = handle
                .authenticate_publickey(
                    target.user.as_str(),
                    PrivateKeyWithHashAlg::new(Arc::new(key), None),
                )
                .await?;
            if !auth.success() {
                return Err(DeployError::AuthFailed {
                    user: target.user.clone(),
                    host: target.host.clone(),
                });
            }
            Ok::<_, DeployError>(handle)
        };

        let handle = tokio::time::timeout(self.timeout, dial)
            .await
            .map_err(|_| self.timeout_err(&target.host))??;

        let fingerprint = seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_default();
        debug!(host = %target.host, user = %target.user, "ssh session established");
        Ok(Session {
            handle,
            fingerprint,
        })
    }

    async fn exec(
        &self,
        session: &Session,
        host: &str,
        command: &str,
    ) -> Result<Vec<u8>, DeployError> {
        let run = async {
            let mut channel = session.handle.channel_open_session().await?;
            channel.exec(true, command).await?;

            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let mut status = None;
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                    ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                        stderr.extend_from_slice(data);
                    }
                    ChannelMsg::ExitStatus { exit_status } => status = Some(exit_status),
                    _ => {}
                }
            }

            match status {
                Some(0) => Ok(stdout),
                Some(code) => Err(DeployError::Command {
                    status: code,
                    stderr: String::from_utf8_lossy(&stderr).trim().to_owned(),
                }),
                None => Err(DeployError::Ssh("channel closed without exit status".to_owned())),
            }
        };

        tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| self.timeout_err(host))?
    }

    async fn close(session: Session) {
        if let Err(e) = session
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!(error = %e, "ssh disconnect failed");
        }
    }

    /// Read, transform, and (if changed) write the file in one session.
    async fn rewrite<F>(
        &self,
        target: &DeployTarget,
        transform: F,
    ) -> Result<SyncResult, DeployError>
    where
        F: FnOnce(&str) -> KeyDiff + Send,
    {
        let session = self.connect(target).await?;
        let result = async {
            let read = self.exec(&session, &target.host, READ_KEYS).await;
            let (diff, written) = plan_rewrite(read, transform)?;
            if written {
                self.exec(&session, &target.host, &write_command(&diff.content))
                    .await?;
            }
            let fingerprint = session.fingerprint.clone();
            Ok::<_, DeployError>(SyncResult::from_diff(&diff, written, fingerprint))
        }
        .await;
        Self::close(session).await;
        result
    }
}

/// Turn the result of reading `authorized_keys` into the new content and
/// whether it must be written. A failed or non-UTF-8 read never produces a
/// write.
fn plan_rewrite<F>(
    read: Result<Vec<u8>, DeployError>,
    transform: F,
) -> Result<(KeyDiff, bool), DeployError>
where
    F: FnOnce(&str) -> KeyDiff,
{
    let current = String::from_utf8(read?).map_err(|e| DeployError::UnreadableKeys {
        reason: format!(
            "invalid UTF-8 at byte {}",
            e.utf8_error().valid_up_to()
        ),
    })?;
    let diff = transform(&current);
    let written = diff.content != current;
    Ok((diff, written))
}

/// Shell command that atomically replaces `authorized_keys` with `content`.
///
/// The content travels base64-encoded inside single quotes, so nothing in
/// it is interpreted by the remote shell.
fn write_command(content: &str) -> String {
    let encoded = STANDARD.encode(content.as_bytes());
    format!(
        "umask 077 && mkdir -p ~/.ssh && chmod 700 ~/.ssh && \
         printf '%s' '{encoded}' | base64 -d > {TMP_PATH} && \
         chmod 600 {TMP_PATH} && mv -f {TMP_PATH} ~/.ssh/authorized_keys"
    )
}

#[async_trait::async_trait]
impl KeyDeployer for SshDeployer {
    async fn sync_environment(
        &self,
        target: &DeployTarget,
        users: &[UserKey],
    ) -> Result<SyncResult, DeployError> {
        let result = self
            .rewrite(target, |current| build_authorized_keys(current, users))
            .await?;
        info!(
            host = %target.host,
            user = %target.user,
            added = result.added,
            removed = result.removed,
            "authorized_keys synchronized"
        );
        Ok(result)
    }

    async fn add_key(
        &self,
        target: &DeployTarget,
        user: &UserKey,
    ) -> Result<SyncResult, DeployError> {
        let result = self
            .rewrite(target, |current| add_managed_key(current, user))
            .await?;
        info!(host = %target.host, username = %user.username, added = result.added, "key added");
        Ok(result)
    }

    async fn remove_key(
        &self,
        target: &DeployTarget,
        username: &str,
    ) -> Result<SyncResult, DeployError> {
        let result = self
            .rewrite(target, |current| remove_managed_key(current, username))
            .await?;
        info!(host = %target.host, %username, removed = result.removed, "key removed");
        Ok(result)
    }

    async fn test_connection(&self, target: &DeployTarget) -> Result<String, DeployError> {
        let session = self.connect(target).await?;
        let outcome = self.exec(&session, &target.host, "true").await;
        let fingerprint = session.fingerprint.clone();
        Self::close(session).await;
        outcome.map(|_| fingerprint)
    }

    async fn host_key_fingerprint(&self, host: &str, port: u16) -> Result<String, DeployError> {
        let seen = Arc::new(Mutex::new(None));
        let handler = HostKeyCheck {
            pinned: None,
            seen: Arc::clone(&seen),
            capture_only: true,
        };

        // The handler rejects the key, so the handshake always errors.
        let outcome = tokio::time::timeout(
            self.timeout,
            client::connect(self.config(), (host, port), handler),
        )
        .await
        .map_err(|_| self.timeout_err(host))?;

        let captured = seen.lock().unwrap_or_else(PoisonError::into_inner).clone();
        match (captured, outcome) {
            (Some(fingerprint), _) => Ok(fingerprint),
            (None, Err(e)) => {
                warn!(%host, error = %e, "host key capture failed");
                Err(e)
            }
            (None, Ok(_)) => Err(DeployError::Ssh("server presented no host key".to_owned())),
        }
    }
}
