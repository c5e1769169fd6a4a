use chrono::{DateTime, Utc};
use magebox_core::crypto::verify_token;
use tracing::debug;

use crate::models::{Invite, NewInvite, NewUser, Role, User};
use crate::users::insert_user;
use crate::{Store, StoreError, now};

const INVITE_COLUMNS: &str =
    "id, token_hash, username, email, role, projects, created_by, created_at, expires_at, consumed_at";

#[derive(sqlx::FromRow)]
struct InviteRow {
    id: i64,
    token_hash: String,
    username: String,
    email: String,
    role: Role,
    projects: String,
    created_by: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    consumed_at: Option<DateTime<Utc>>,
}

impl TryFrom<InviteRow> for Invite {
    type Error = StoreError;

    fn try_from(row: InviteRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            token_hash: row.token_hash,
            username: row.username,
            email: row.email,
            role: row.role,
            projects: serde_json::from_str(&row.projects)?,
            created_by: row.created_by,
            created_at: row.created_at,
            expires_at: row.expires_at,
            consumed_at: row.consumed_at,
        })
    }
}

fn invite_unavailable() -> StoreError {
    StoreError::NotFound("invite".to_owned())
}

impl Store {
    /// Record a new invite. Every listed project must exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown project.
    pub async fn create_invite(&self, new: &NewInvite) -> Result<Invite, StoreError> {
        for project in &new.projects {
            self.get_project(project).await?;
        }

        let sql = format!(
            r"INSERT INTO invites (token_hash, username, email, role, projects, created_by,
                                   created_at, expires_at)
              VALUES (?, ?, ?, ?, ?, ?, ?, ?)
              RETURNING {INVITE_COLUMNS}"
        );
        let row = sqlx::query_as::<_, InviteRow>(&sql)
            .bind(&new.token_hash)
            .bind(&new.username)
            .bind(&new.email)
            .bind(new.role)
            .bind(serde_json::to_string(&new.projects)?)
            .bind(&new.created_by)
            .bind(now())
            .bind(new.expires_at)
            .fetch_one(&self.pool)
            .await?;
        row.try_into()
    }

    /// Unconsumed, unexpired invites, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn list_pending_invites(&self) -> Result<Vec<Invite>, StoreError> {
        let sql = format!(
            "SELECT {INVITE_COLUMNS} FROM invites \
             WHERE consumed_at IS NULL AND expires_at > ? ORDER BY id"
        );
        sqlx::query_as::<_, InviteRow>(&sql)
            .bind(now())
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Invite::try_from)
            .collect()
    }

    /// Revoke an invite.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if it does not exist.
    pub async fn delete_invite(&self, id: i64) -> Result<(), StoreError> {
        let done = sqlx::query("DELETE FROM invites WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("invite #{id}")));
        }
        Ok(())
    }

    /// Find the pending invite whose hash matches `token`.
    ///
    /// Every pending invite is checked in turn; there is no lookup by token
    /// or by ID, so a caller learns nothing about which invites exist.
    /// Verification runs on the blocking pool.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn find_invite_by_token(&self, token: &str) -> Result<Option<Invite>, StoreError> {
        let candidates = self.list_pending_invites().await?;
        debug!(candidates = candidates.len(), "scanning pending invites");
        let token = zeroize::Zeroizing::new(token.to_owned());
        let found = tokio::task::spawn_blocking(move || {
            candidates
                .into_iter()
                .find(|invite| verify_token(&token, &invite.token_hash))
        })
        .await?;
        Ok(found)
    }

    /// Consume an invite and create its user in one transaction.
    ///
    /// The user's role, email and projects come from the invite; `new`
    /// supplies the generated key and token hash.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the invite was consumed, expired,
    /// or deleted in the meantime, and [`StoreError::AlreadyExists`] if the
    /// username is taken. Either way nothing is written.
    pub async fn redeem_invite(&self, invite_id: i64, new: NewUser) -> Result<User, StoreError> {
        let name = new.name.clone();
        self.with_tx(move |tx| {
            Box::pin(async move {
                let at = now();
                let claimed = sqlx::query(
                    r"UPDATE invites SET consumed_at = ?
                      WHERE id = ? AND consumed_at IS NULL AND expires_at > ?",
                )
                .bind(at)
                .bind(invite_id)
                .bind(at)
                .execute(&mut **tx)
                .await?;
                if claimed.rows_affected() != 1 {
                    return Err(invite_unavailable());
                }

                let projects: String = sqlx::query_scalar("SELECT projects FROM invites WHERE id = ?")
                    .bind(invite_id)
                    .fetch_one(&mut **tx)
                    .await?;
                let projects: Vec<String> = serde_json::from_str(&projects)?;
                insert_user(&mut **tx, &new, &projects, at).await
            })
        })
        .await?;
        self.get_user(&name).await
    }

    /// Delete invites whose expiry has passed. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn purge_expired_invites(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let done = sqlx::query("DELETE FROM invites WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }
}
