use zeroize::Zeroizing;

use crate::models::CaKeys;
use crate::{Store, StoreError, now};

/// Argon2id hash of the static admin token.
pub const ADMIN_TOKEN_HASH_KEY: &str = "admin_token_hash";
/// Encrypted CA private key.
pub const CA_PRIVATE_KEY: &str = "ca_private_key";
/// CA public key in `authorized_keys` form, stored in the clear.
pub const CA_PUBLIC_KEY: &str = "ca_public_key";
/// Hash of the last audit entry removed by a retention purge.
pub const AUDIT_ANCHOR_KEY: &str = "audit_anchor";

impl Store {
    /// Read a plain config value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn get_config(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM config WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    /// Insert or replace a plain config value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn set_config(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            r"INSERT INTO config (key, value, updated_at) VALUES (?, ?, ?)
              ON CONFLICT (key) DO UPDATE SET value = excluded.value,
                                              updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Read and decrypt a secret config value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Crypto`] if the value fails to decrypt.
    pub async fn get_secret_config(&self, key: &str) -> Result<Option<Zeroizing<String>>, StoreError> {
        self.get_config(key)
            .await?
            .map(|sealed| self.open_secret(&sealed))
            .transpose()
    }

    /// Encrypt and store a secret config value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Crypto`] or [`StoreError::Database`].
    pub async fn set_secret_config(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let sealed = self.seal(value)?;
        self.set_config(key, &sealed).await
    }

    /// The CA key pair, if one has been generated.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Crypto`] if the private key fails to decrypt.
    pub async fn ca_keys(&self) -> Result<Option<CaKeys>, StoreError> {
        let Some(private_key) = self.get_secret_config(CA_PRIVATE_KEY).await? else {
            return Ok(None);
        };
        let public_key = self
            .get_config(CA_PUBLIC_KEY)
            .await?
            .ok_or_else(|| StoreError::Invalid("CA public key missing".to_owned()))?;
        Ok(Some(CaKeys {
            private_key,
            public_key,
        }))
    }

    /// Store the CA key pair, private half encrypted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Crypto`] or [`StoreError::Database`].
    pub async fn store_ca_keys(&self, private_key: &str, public_key: &str) -> Result<(), StoreError> {
        self.set_secret_config(CA_PRIVATE_KEY, private_key).await?;
        self.set_config(CA_PUBLIC_KEY, public_key).await
    }
}
