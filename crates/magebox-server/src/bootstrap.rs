//! First-start and every-start setup: the master key, the static admin
//! token, and the CA key pair.

use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, bail};
use tracing::info;
use zeroize::Zeroizing;

use magebox_core::crypto::{self, EncryptionKey, TokenHashParams};
use magebox_core::ssh;
use magebox_storage::{ADMIN_TOKEN_HASH_KEY, Store};

use crate::config::ServerConfig;

/// File name of the master key inside the data directory.
pub const MASTER_KEY_FILE: &str = "master.key";

/// Load the master key from `MAGEBOX_MASTER_KEY`, or from
/// `<data_dir>/master.key`, creating that file on first start.
///
/// # Errors
///
/// Fails if the configured or stored key is not valid base64 of the right
/// length, or if the key file cannot be read or written.
pub fn load_master_key(config: &ServerConfig) -> anyhow::Result<EncryptionKey> {
    if let Some(encoded) = &config.master_key {
        info!("using master key from environment");
        return EncryptionKey::from_base64(encoded.trim())
            .context("MAGEBOX_MASTER_KEY is not a valid base64 32-byte key");
    }

    let path = config.data_dir.join(MASTER_KEY_FILE);
    if path.exists() {
        let encoded = Zeroizing::new(
            fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?,
        );
        info!(path = %path.display(), "master key loaded");
        return EncryptionKey::from_base64(encoded.trim())
            .with_context(|| format!("{} does not hold a valid key", path.display()));
    }

    let key = EncryptionKey::generate();
    write_secret_file(&path, &key.to_base64())?;
    info!(path = %path.display(), "generated new master key");
    Ok(key)
}

#[cfg(unix)]
fn write_secret_file(path: &Path, contents: &str) -> anyhow::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(contents.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(not(unix))]
fn write_secret_file(path: &Path, contents: &str) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(contents.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Result of [`bootstrap_admin_token`].
pub struct AdminToken {
    /// Hash checked by the auth middleware.
    pub hash: String,
    /// Set only when a token was generated on this start. Shown once.
    pub generated: Option<Zeroizing<String>>,
}

/// Settle the static admin token.
///
/// A configured token replaces the stored hash unless it already matches.
/// Without one, the stored hash is used; on a fresh database a token is
/// generated and its hash stored.
///
/// # Errors
///
/// Fails on storage errors or if hashing fails.
pub async fn bootstrap_admin_token(
    store: &Store,
    configured: Option<&str>,
    params: TokenHashParams,
) -> anyhow::Result<AdminToken> {
    let stored = store
        .get_config(ADMIN_TOKEN_HASH_KEY)
        .await
        .context("failed to read admin token hash")?;

    let (token, generated) = match (configured, stored) {
        (Some(token), Some(hash)) => {
            let candidate = Zeroizing::new(token.to_owned());
            let known = hash.clone();
            let matches =
                tokio::task::spawn_blocking(move || crypto::verify_token(&candidate, &known))
                    .await?;
            if matches {
                return Ok(AdminToken {
                    hash,
                    generated: None,
                });
            }
            info!("admin token changed, replacing stored hash");
            (Zeroizing::new(token.to_owned()), false)
        }
        (Some(token), None) => (Zeroizing::new(token.to_owned()), false),
        (None, Some(hash)) => {
            return Ok(AdminToken {
                hash,
                generated: None,
            });
        }
        (None, None) => (Zeroizing::new(crypto::generate_token()), true),
    };

    if token.trim().is_empty() {
        bail!("MAGEBOX_ADMIN_TOKEN must not be blank");
    }

    let hash = {
        let token = token.clone();
        tokio::task::spawn_blocking(move || crypto::hash_token_with(&token, params)).await??
    };
    store
        .set_config(ADMIN_TOKEN_HASH_KEY, &hash)
        .await
        .context("failed to store admin token hash")?;

    Ok(AdminToken {
        hash,
        generated: generated.then_some(token),
    })
}

/// Generate the CA key pair on first start when the CA is enabled.
///
/// # Errors
///
/// Fails on storage errors or if key generation fails.
pub async fn ensure_ca(store: &Store, config: &ServerConfig) -> anyhow::Result<()> {
    if !config.ca_enabled {
        info!("SSH certificate authority disabled");
        return Ok(());
    }

    if let Some(ca) = store.ca_keys().await.context("failed to load CA keys")? {
        info!(fingerprint = %ssh::fingerprint(&ca.public_key)?, "SSH certificate authority loaded");
        return Ok(());
    }

    let pair = ssh::generate_ca_keypair().context("failed to generate CA key pair")?;
    store
        .store_ca_keys(&pair.private_key, &pair.public_key)
        .await
        .context("failed to store CA keys")?;
    info!(
        fingerprint = %ssh::fingerprint(&pair.public_key)?,
        "generated SSH certificate authority"
    );
    Ok(())
}
