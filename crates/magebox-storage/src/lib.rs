//! SQLite persistence for `MageBox`.
//!
//! [`Store`] owns the connection pool and the master key. Every secret
//! column (MFA secrets, recovery codes, deploy keys, the CA private key)
//! is encrypted with AES-256-GCM on the way in and decrypted on the way
//! out, so callers only ever handle plaintext domain objects.
//!
//! The database runs in WAL mode with foreign keys enforced; the schema is
//! applied from `migrations/` on open.

mod audit;
mod config;
mod environments;
mod error;
mod invites;
pub mod models;
mod projects;
mod users;

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use magebox_core::crypto::{self, EncryptionKey};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use tracing::{info, warn};
use zeroize::Zeroizing;

pub use config::{ADMIN_TOKEN_HASH_KEY, AUDIT_ANCHOR_KEY, CA_PRIVATE_KEY, CA_PUBLIC_KEY};
pub use error::StoreError;

/// Boxed future returned by closures passed to [`Store::with_tx`].
pub type TxFuture<'c, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'c>>;

/// Handle to the team database.
pub struct Store {
    pool: SqlitePool,
    key: EncryptionKey,
    /// Serializes audit appends so each entry links to its true predecessor.
    audit_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Open (creating if needed) the database file at `path` and apply
    /// migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the file cannot be opened and
    /// [`StoreError::Migration`] if the schema cannot be applied.
    pub async fn open(path: &Path, key: EncryptionKey) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let store = Self::from_pool(pool, key).await?;
        info!(path = %path.display(), "database opened");
        Ok(store)
    }

    /// Open a private in-memory database. Used by tests.
    ///
    /// # Errors
    ///
    /// Same as [`Store::open`].
    pub async fn open_in_memory(key: EncryptionKey) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        // A single connection that never recycles keeps the database alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::from_pool(pool, key).await
    }

    async fn from_pool(pool: SqlitePool, key: EncryptionKey) -> Result<Self, StoreError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self {
            pool,
            key,
            audit_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Close the pool, flushing the WAL.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Run `f` inside a transaction: commit if it returns `Ok`, roll back
    /// otherwise.
    ///
    /// The closure receives the open transaction; pass `&mut **tx` to sqlx.
    /// Because the future may outlive any borrow of the caller's stack, move
    /// owned values into it.
    ///
    /// # Errors
    ///
    /// Returns whatever `f` returns, or [`StoreError::Database`] if the
    /// transaction cannot begin or commit.
    pub async fn with_tx<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut Transaction<'static, Sqlite>) -> TxFuture<'c, T> + Send,
    {
        let mut tx = self.pool.begin().await?;
        match f(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "transaction rollback failed");
                }
                Err(e)
            }
        }
    }

    fn seal(&self, plaintext: &str) -> Result<String, StoreError> {
        Ok(crypto::encrypt_str(&self.key, plaintext)?)
    }

    fn open_secret(&self, ciphertext: &str) -> Result<Zeroizing<String>, StoreError> {
        Ok(Zeroizing::new(crypto::decrypt_str(&self.key, ciphertext)?))
    }
}

/// Current time truncated to whole seconds, the precision every stored
/// timestamp uses.
#[must_use]
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) async fn test_store() -> Store {
    Store::open_in_memory(EncryptionKey::generate()).await.unwrap()
}
