use std::collections::HashMap;

use chrono::{DateTime, Utc};
use magebox_core::deploy::UserKey;
use magebox_core::mfa::normalize_recovery_code;
use sqlx::SqliteConnection;
use zeroize::Zeroizing;

use crate::models::{NewUser, Role, User, UserUpdate};
use crate::{Store, StoreError, now};

const USER_COLUMNS: &str = "id, name, email, role, expires_at, public_key, token_hash, \
     mfa_secret, mfa_enabled, mfa_recovery, failed_login_count, cert_serial, \
     cert_valid_before, created_by, created_at, last_access_at";

/// A `users` row as stored: MFA columns still encrypted.
#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    name: String,
    email: String,
    role: Role,
    expires_at: Option<DateTime<Utc>>,
    public_key: Option<String>,
    token_hash: String,
    mfa_secret: Option<String>,
    mfa_enabled: bool,
    mfa_recovery: Option<String>,
    failed_login_count: i64,
    cert_serial: Option<String>,
    cert_valid_before: Option<DateTime<Utc>>,
    created_by: String,
    created_at: DateTime<Utc>,
    last_access_at: Option<DateTime<Utc>>,
}

fn user_not_found(name: &str) -> StoreError {
    StoreError::NotFound(format!("user {name}"))
}

/// Insert a user row and its grants on an open connection.
///
/// Every project must exist.
pub(crate) async fn insert_user(
    conn: &mut SqliteConnection,
    new: &NewUser,
    projects: &[String],
    at: DateTime<Utc>,
) -> Result<i64, StoreError> {
    let id: i64 = sqlx::query_scalar(
        r"INSERT INTO users (name, email, role, expires_at, public_key, token_hash,
                             created_by, created_at)
          VALUES (?, ?, ?, ?, ?, ?, ?, ?)
          RETURNING id",
    )
    .bind(&new.name)
    .bind(&new.email)
    .bind(new.role)
    .bind(new.expires_at)
    .bind(&new.public_key)
    .bind(&new.token_hash)
    .bind(&new.created_by)
    .bind(at)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| match StoreError::from(e) {
        StoreError::AlreadyExists(_) => StoreError::AlreadyExists(format!("user {}", new.name)),
        other => other,
    })?;

    for project in projects {
        let done = sqlx::query(
            r"INSERT OR IGNORE INTO user_projects (user_id, project_id, granted_at)
              SELECT ?, id, ? FROM projects WHERE name = ?",
        )
        .bind(id)
        .bind(at)
        .bind(project)
        .execute(&mut *conn)
        .await?;
        if done.rows_affected() == 0 {
            let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM projects WHERE name = ?")
                .bind(project)
                .fetch_optional(&mut *conn)
                .await?;
            if exists.is_none() {
                return Err(StoreError::NotFound(format!("project {project}")));
            }
        }
    }

    Ok(id)
}

impl Store {
    fn hydrate_user(&self, row: UserRow, projects: Vec<String>) -> Result<User, StoreError> {
        let mfa_secret = row
            .mfa_secret
            .as_deref()
            .map(|c| self.open_secret(c))
            .transpose()?;
        let recovery_codes = match row.mfa_recovery.as_deref() {
            Some(c) => serde_json::from_str(&self.open_secret(c)?)?,
            None => Vec::new(),
        };

        Ok(User {
            id: row.id,
            name: row.name,
            email: row.email,
            role: row.role,
            expires_at: row.expires_at,
            public_key: row.public_key,
            token_hash: row.token_hash,
            mfa_secret,
            mfa_enabled: row.mfa_enabled,
            recovery_codes,
            failed_login_count: row.failed_login_count,
            cert_serial: row.cert_serial,
            cert_valid_before: row.cert_valid_before,
            created_by: row.created_by,
            created_at: row.created_at,
            last_access_at: row.last_access_at,
            projects,
        })
    }

    async fn projects_of(&self, user_id: i64) -> Result<Vec<String>, StoreError> {
        let names = sqlx::query_scalar::<_, String>(
            r"SELECT p.name FROM projects p
              JOIN user_projects up ON up.project_id = p.id
              WHERE up.user_id = ?
              ORDER BY p.name",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    async fn user_row(&self, name: &str) -> Result<UserRow, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE name = ?");
        sqlx::query_as::<_, UserRow>(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| user_not_found(name))
    }

    /// Create a user and grant the listed projects atomically.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyExists`] for a duplicate name and
    /// [`StoreError::NotFound`] for an unknown project.
    pub async fn create_user(&self, new: NewUser, projects: &[String]) -> Result<User, StoreError> {
        let projects = projects.to_vec();
        let name = new.name.clone();
        self.with_tx(move |tx| {
            Box::pin(async move { insert_user(&mut **tx, &new, &projects, now()).await })
        })
        .await?;
        self.get_user(&name).await
    }

    /// Look up a user by name.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such user exists and
    /// [`StoreError::Crypto`] if the MFA columns fail to decrypt.
    pub async fn get_user(&self, name: &str) -> Result<User, StoreError> {
        let row = self.user_row(name).await?;
        let projects = self.projects_of(row.id).await?;
        self.hydrate_user(row, projects)
    }

    /// Look up a user by row ID.
    ///
    /// # Errors
    ///
    /// See [`Store::get_user`].
    pub async fn get_user_by_id(&self, id: i64) -> Result<User, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?");
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("user #{id}")))?;
        let projects = self.projects_of(row.id).await?;
        self.hydrate_user(row, projects)
    }

    /// All users, by name, with their project lists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] or [`StoreError::Crypto`].
    pub async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users ORDER BY name");
        let rows = sqlx::query_as::<_, UserRow>(&sql)
            .fetch_all(&self.pool)
            .await?;

        let grants = sqlx::query_as::<_, (i64, String)>(
            r"SELECT up.user_id, p.name FROM user_projects up
              JOIN projects p ON p.id = up.project_id
              ORDER BY p.name",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut by_user: HashMap<i64, Vec<String>> = HashMap::new();
        for (user_id, project) in grants {
            by_user.entry(user_id).or_default().push(project);
        }

        rows.into_iter()
            .map(|row| {
                let projects = by_user.remove(&row.id).unwrap_or_default();
                self.hydrate_user(row, projects)
            })
            .collect()
    }

    /// Apply a partial update.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such user exists.
    pub async fn update_user(&self, name: &str, update: &UserUpdate) -> Result<User, StoreError> {
        let row = self.user_row(name).await?;
        let email = update.email.clone().unwrap_or(row.email);
        let role = update.role.unwrap_or(row.role);
        let expires_at = update.expires_at.unwrap_or(row.expires_at);

        sqlx::query("UPDATE users SET email = ?, role = ?, expires_at = ? WHERE id = ?")
            .bind(email)
            .bind(role)
            .bind(expires_at)
            .bind(row.id)
            .execute(&self.pool)
            .await?;
        self.get_user(name).await
    }

    /// Delete a user and their grants.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such user exists.
    pub async fn delete_user(&self, name: &str) -> Result<(), StoreError> {
        let done = sqlx::query("DELETE FROM users WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(user_not_found(name));
        }
        Ok(())
    }

    /// Grant `user` access to `project`. Returns `false` if already granted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the user or project is unknown.
    pub async fn grant_access(&self, user: &str, project: &str) -> Result<bool, StoreError> {
        let user_id = self.user_row(user).await?.id;
        let project_id = self.get_project(project).await?.id;
        let done = sqlx::query(
            "INSERT OR IGNORE INTO user_projects (user_id, project_id, granted_at) VALUES (?, ?, ?)",
        )
        .bind(user_id)
        .bind(project_id)
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    /// Revoke `user`'s access to `project`. Returns `false` if there was no
    /// grant.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the user or project is unknown.
    pub async fn revoke_access(&self, user: &str, project: &str) -> Result<bool, StoreError> {
        let user_id = self.user_row(user).await?.id;
        let project_id = self.get_project(project).await?.id;
        let done = sqlx::query("DELETE FROM user_projects WHERE user_id = ? AND project_id = ?")
            .bind(user_id)
            .bind(project_id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() == 1)
    }

    /// Keys of every non-expired user with access to a project.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn project_user_keys(&self, project_id: i64) -> Result<Vec<UserKey>, StoreError> {
        let rows = sqlx::query_as::<_, (String, String)>(
            r"SELECT u.name, u.public_key FROM users u
              JOIN user_projects up ON up.user_id = u.id
              WHERE up.project_id = ?
                AND u.public_key IS NOT NULL
                AND (u.expires_at IS NULL OR u.expires_at > ?)
              ORDER BY u.name",
        )
        .bind(project_id)
        .bind(now())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(name, key)| UserKey::new(name, key))
            .collect())
    }

    // ── MFA ──────────────────────────────────────────────────────────

    /// Store a pending (not yet enabled) TOTP secret, or clear MFA entirely
    /// with `None`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] or [`StoreError::Crypto`].
    pub async fn set_mfa_secret(&self, name: &str, secret: Option<&str>) -> Result<(), StoreError> {
        let sealed = secret.map(|s| self.seal(s)).transpose()?;
        let done = sqlx::query(
            r"UPDATE users SET mfa_secret = ?, mfa_enabled = 0, mfa_recovery = NULL
              WHERE name = ?",
        )
        .bind(sealed)
        .bind(name)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(user_not_found(name));
        }
        Ok(())
    }

    /// Turn MFA on and store a fresh set of recovery codes.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Invalid`] if no secret has been set up.
    pub async fn enable_mfa(&self, name: &str, recovery_codes: &[String]) -> Result<(), StoreError> {
        let sealed = self.seal(&serde_json::to_string(recovery_codes)?)?;
        let done = sqlx::query(
            r"UPDATE users SET mfa_enabled = 1, mfa_recovery = ?
              WHERE name = ? AND mfa_secret IS NOT NULL",
        )
        .bind(sealed)
        .bind(name)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            self.user_row(name).await?;
            return Err(StoreError::Invalid("no pending MFA secret".to_owned()));
        }
        Ok(())
    }

    /// Consume a recovery code. Returns `true` exactly once per code.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] or [`StoreError::Crypto`].
    pub async fn consume_recovery_code(&self, name: &str, code: &str) -> Result<bool, StoreError> {
        let Some(code) = normalize_recovery_code(code) else {
            return Ok(false);
        };
        let row = self.user_row(name).await?;
        let Some(sealed) = row.mfa_recovery else {
            return Ok(false);
        };
        let mut codes: Vec<String> = serde_json::from_str(&self.open_secret(&sealed)?)?;
        let Some(pos) = codes.iter().position(|c| *c == code) else {
            return Ok(false);
        };
        codes.remove(pos);
        let resealed = self.seal(&serde_json::to_string(&codes)?)?;

        // Compare-and-swap so two concurrent uses cannot both succeed.
        let done = sqlx::query("UPDATE users SET mfa_recovery = ? WHERE id = ? AND mfa_recovery = ?")
            .bind(resealed)
            .bind(row.id)
            .bind(sealed)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() == 1)
    }

    /// Increment the failed-login counter and return the new value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such user exists.
    pub async fn record_failed_login(&self, name: &str) -> Result<i64, StoreError> {
        sqlx::query_scalar::<_, i64>(
            r"UPDATE users SET failed_login_count = failed_login_count + 1
              WHERE name = ?
              RETURNING failed_login_count",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| user_not_found(name))
    }

    /// Reset the failed-login counter.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn reset_failed_logins(&self, name: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET failed_login_count = 0 WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record the time of an authenticated request.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn touch_last_access(&self, name: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET last_access_at = ? WHERE name = ?")
            .bind(now())
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remember the most recently issued certificate.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn record_certificate(
        &self,
        name: &str,
        serial: u64,
        valid_before: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET cert_serial = ?, cert_valid_before = ? WHERE name = ?")
            .bind(serial.to_string())
            .bind(valid_before)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// The decrypted TOTP secret, if one is stored.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] or [`StoreError::Crypto`].
    pub async fn mfa_secret(&self, name: &str) -> Result<Option<Zeroizing<String>>, StoreError> {
        let row = self.user_row(name).await?;
        row.mfa_secret
            .as_deref()
            .map(|c| self.open_secret(c))
            .transpose()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::test_store;

    fn new_user(name: &str, role: Role) -> NewUser {
        NewUser {
            name: name.to_owned(),
            email: format!("{name}@example.com"),
            role,
            expires_at: None,
            public_key: Some(format!("ssh-ed25519 AAAAC3Nza{name} {name}")),
            token_hash: "$argon2id$placeholder".to_owned(),
            created_by: "admin".to_owned(),
        }
    }

    #[tokio::test]
    async fn create_user_with_projects() {
        let store = test_store().await;
        store.create_project("shop", "", "admin").await.unwrap();
        store.create_project("blog", "", "admin").await.unwrap();

        let user = store
            .create_user(new_user("alice", Role::Dev), &["shop".to_owned(), "blog".to_owned()])
            .await
            .unwrap();
        assert_eq!(user.role, Role::Dev);
        assert_eq!(user.projects, ["blog", "shop"]);
        assert_eq!(user.failed_login_count, 0);
        assert!(!user.mfa_enabled);
    }

    #[tokio::test]
    async fn unknown_project_rolls_back_user() {
        let store = test_store().await;
        let result = store
            .create_user(new_user("bob", Role::Dev), &["missing".to_owned()])
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
        assert!(matches!(store.get_user("bob").await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn duplicate_user_conflicts() {
        let store = test_store().await;
        store.create_user(new_user("carol", Role::Admin), &[]).await.unwrap();
        assert!(matches!(
            store.create_user(new_user("carol", Role::Dev), &[]).await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn grant_revoke_and_project_keys() {
        let store = test_store().await;
        let shop = store.create_project("shop", "", "admin").await.unwrap();
        store.create_user(new_user("alice", Role::Dev), &[]).await.unwrap();

        assert!(store.grant_access("alice", "shop").await.unwrap());
        assert!(!store.grant_access("alice", "shop").await.unwrap());
        let keys = store.project_user_keys(shop.id).await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].username, "alice");
        assert_eq!(store.project_members("shop").await.unwrap(), ["alice"]);

        assert!(store.revoke_access("alice", "shop").await.unwrap());
        assert!(!store.revoke_access("alice", "shop").await.unwrap());
        assert!(store.project_user_keys(shop.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_users_have_no_project_keys() {
        let store = test_store().await;
        let shop = store.create_project("shop", "", "admin").await.unwrap();
        let mut expired = new_user("old", Role::Dev);
        expired.expires_at = Some(now() - Duration::hours(1));
        store.create_user(expired, &["shop".to_owned()]).await.unwrap();

        let user = store.get_user("old").await.unwrap();
        assert!(user.is_expired(now()));
        assert!(store.project_user_keys(shop.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_and_delete() {
        let store = test_store().await;
        store.create_user(new_user("dave", Role::Readonly), &[]).await.unwrap();

        let expiry = now() + Duration::days(30);
        let updated = store
            .update_user(
                "dave",
                &UserUpdate {
                    email: Some("d@corp.example".to_owned()),
                    role: Some(Role::Dev),
                    expires_at: Some(Some(expiry)),
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.email, "d@corp.example");
        assert_eq!(updated.role, Role::Dev);
        assert_eq!(updated.expires_at, Some(expiry));

        let cleared = store
            .update_user(
                "dave",
                &UserUpdate {
                    expires_at: Some(None),
                    ..UserUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(cleared.expires_at, None);
        assert_eq!(cleared.email, "d@corp.example");

        store.delete_user("dave").await.unwrap();
        assert!(matches!(store.delete_user("dave").await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn mfa_secret_is_encrypted_at_rest() {
        let store = test_store().await;
        store.create_user(new_user("erin", Role::Admin), &[]).await.unwrap();
        store.set_mfa_secret("erin", Some("JBSWY3DPEHPK3PXP")).await.unwrap();

        let raw: Option<String> = sqlx::query_scalar("SELECT mfa_secret FROM users WHERE name = 'erin'")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        let raw = raw.unwrap();
        assert!(!raw.contains("JBSWY3DPEHPK3PXP"));

        let user = store.get_user("erin").await.unwrap();
        assert_eq!(user.mfa_secret.as_deref().map(String::as_str), Some("JBSWY3DPEHPK3PXP"));
        assert!(!user.mfa_enabled);
    }

    #[tokio::test]
    async fn enable_mfa_requires_secret() {
        let store = test_store().await;
        store.create_user(new_user("fay", Role::Dev), &[]).await.unwrap();
        assert!(matches!(
            store.enable_mfa("fay", &[]).await,
            Err(StoreError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn recovery_codes_are_single_use() {
        let store = test_store().await;
        store.create_user(new_user("gus", Role::Admin), &[]).await.unwrap();
        store.set_mfa_secret("gus", Some("JBSWY3DPEHPK3PXP")).await.unwrap();
        let codes = vec!["AAAA-1111".to_owned(), "BBBB-2222".to_owned()];
        store.enable_mfa("gus", &codes).await.unwrap();

        assert!(store.get_user("gus").await.unwrap().mfa_enabled);
        assert!(store.consume_recovery_code("gus", "aaaa-1111").await.unwrap());
        assert!(!store.consume_recovery_code("gus", "AAAA-1111").await.unwrap());
        assert!(!store.consume_recovery_code("gus", "not-a-code").await.unwrap());
        assert_eq!(store.get_user("gus").await.unwrap().recovery_codes, ["BBBB-2222"]);
    }

    #[tokio::test]
    async fn failed_login_counter() {
        let store = test_store().await;
        store.create_user(new_user("hal", Role::Dev), &[]).await.unwrap();
        assert_eq!(store.record_failed_login("hal").await.unwrap(), 1);
        assert_eq!(store.record_failed_login("hal").await.unwrap(), 2);
        store.reset_failed_logins("hal").await.unwrap();
        assert_eq!(store.get_user("hal").await.unwrap().failed_login_count, 0);
    }

    #[tokio::test]
    async fn certificate_and_last_access_recorded() {
        let store = test_store().await;
        store.create_user(new_user("ivy", Role::Dev), &[]).await.unwrap();
        let until = now() + Duration::hours(24);
        store.record_certificate("ivy", u64::MAX, until).await.unwrap();
        store.touch_last_access("ivy").await.unwrap();

        let user = store.get_user("ivy").await.unwrap();
        assert_eq!(user.cert_serial.as_deref(), Some("18446744073709551615"));
        assert_eq!(user.cert_valid_before, Some(until));
        assert!(user.last_access_at.is_some());
    }

    #[tokio::test]
    async fn deleting_project_drops_grants() {
        let store = test_store().await;
        store.create_project("shop", "", "admin").await.unwrap();
        store
            .create_user(new_user("jay", Role::Dev), &["shop".to_owned()])
            .await
            .unwrap();
        store.delete_project("shop").await.unwrap();
        assert!(store.get_user("jay").await.unwrap().projects.is_empty());
    }

    #[tokio::test]
    async fn list_users_includes_projects() {
        let store = test_store().await;
        store.create_project("shop", "", "admin").await.unwrap();
        store
            .create_user(new_user("kim", Role::Dev), &["shop".to_owned()])
            .await
            .unwrap();
        store.create_user(new_user("lee", Role::Readonly), &[]).await.unwrap();

        let users = store.list_users().await.unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].projects, ["shop"]);
        assert!(users[1].projects.is_empty());
    }
}
