use chrono::{DateTime, Utc};
use magebox_core::audit::{
    AuditEntry, ChainVerification, compute_audit_hash, verify_audit_chain_from,
};
use sqlx::{QueryBuilder, Sqlite};

use crate::config::AUDIT_ANCHOR_KEY;
use crate::models::AuditQuery;
use crate::{Store, StoreError, now};

const DEFAULT_LIMIT: u32 = 100;
const MAX_LIMIT: u32 = 1000;

#[derive(sqlx::FromRow)]
struct AuditRow {
    id: i64,
    timestamp: DateTime<Utc>,
    actor: String,
    action: String,
    details: String,
    ip: String,
    hash: String,
    prev_hash: String,
}

impl From<AuditRow> for AuditEntry {
    fn from(row: AuditRow) -> Self {
        Self {
            id: row.id,
            timestamp: row.timestamp,
            user: row.actor,
            action: row.action,
            details: row.details,
            ip: row.ip,
            hash: row.hash,
            prev_hash: row.prev_hash,
        }
    }
}

impl Store {
    /// Append an entry to the hash chain.
    ///
    /// Three steps inside one transaction, serialized by the audit lock:
    /// read the last hash, insert with a placeholder hash, then compute the
    /// real hash now that the row ID is known and write it back.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn append_audit(
        &self,
        user: &str,
        action: &str,
        details: &str,
        ip: &str,
    ) -> Result<AuditEntry, StoreError> {
        let _guard = self.audit_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let prev_hash: String =
            sqlx::query_scalar("SELECT hash FROM audit_log ORDER BY id DESC LIMIT 1")
                .fetch_optional(&mut *tx)
                .await?
                .unwrap_or_default();

        let timestamp = now();
        let id = sqlx::query(
            r"INSERT INTO audit_log (timestamp, actor, action, details, ip, hash, prev_hash)
              VALUES (?, ?, ?, ?, ?, '', ?)",
        )
        .bind(timestamp)
        .bind(user)
        .bind(action)
        .bind(details)
        .bind(ip)
        .bind(&prev_hash)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        let mut entry = AuditEntry {
            id,
            timestamp,
            user: user.to_owned(),
            action: action.to_owned(),
            details: details.to_owned(),
            ip: ip.to_owned(),
            hash: String::new(),
            prev_hash,
        };
        entry.hash = compute_audit_hash(&entry, &entry.prev_hash);

        sqlx::query("UPDATE audit_log SET hash = ? WHERE id = ?")
            .bind(&entry.hash)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(entry)
    }

    /// Filtered audit retrieval, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn query_audit(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>, StoreError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, timestamp, actor, action, details, ip, hash, prev_hash \
             FROM audit_log WHERE 1 = 1",
        );
        if let Some(user) = &query.user {
            qb.push(" AND actor = ").push_bind(user.clone());
        }
        if let Some(action) = &query.action {
            qb.push(" AND action = ").push_bind(action.clone());
        }
        if let Some(from) = query.from {
            qb.push(" AND timestamp >= ").push_bind(from);
        }
        if let Some(to) = query.to {
            qb.push(" AND timestamp <= ").push_bind(to);
        }
        let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
        qb.push(" ORDER BY id DESC LIMIT ").push_bind(i64::from(limit));

        let rows = qb.build_query_as::<AuditRow>().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(AuditEntry::from).collect())
    }

    /// The whole surviving chain in insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn audit_chain(&self) -> Result<Vec<AuditEntry>, StoreError> {
        let rows = sqlx::query_as::<_, AuditRow>(
            "SELECT id, timestamp, actor, action, details, ip, hash, prev_hash \
             FROM audit_log ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(AuditEntry::from).collect())
    }

    /// Hash the oldest surviving entry must link to; empty until the first
    /// retention purge.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn audit_anchor(&self) -> Result<String, StoreError> {
        Ok(self.get_config(AUDIT_ANCHOR_KEY).await?.unwrap_or_default())
    }

    /// Verify the surviving chain against the recorded purge anchor.
    ///
    /// Chain and anchor are read together under the audit lock so a
    /// concurrent purge cannot split them.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn verify_audit(&self) -> Result<ChainVerification, StoreError> {
        let _guard = self.audit_lock.lock().await;
        let anchor = self.audit_anchor().await?;
        let chain = self.audit_chain().await?;
        Ok(verify_audit_chain_from(&chain, &anchor))
    }

    /// Retention sweep: delete the run of oldest entries up to the newest
    /// one older than `cutoff`, and record that entry's hash as the anchor
    /// in the same transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn purge_audit_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let _guard = self.audit_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let last: Option<(i64, String)> = sqlx::query_as(
            "SELECT id, hash FROM audit_log WHERE timestamp < ? ORDER BY id DESC LIMIT 1",
        )
        .bind(cutoff)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((last_id, anchor)) = last else {
            return Ok(0);
        };

        let done = sqlx::query("DELETE FROM audit_log WHERE id <= ?")
            .bind(last_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r"INSERT INTO config (key, value, updated_at) VALUES (?, ?, ?)
              ON CONFLICT (key) DO UPDATE SET value = excluded.value,
                                              updated_at = excluded.updated_at",
        )
        .bind(AUDIT_ANCHOR_KEY)
        .bind(&anchor)
        .bind(now())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(done.rows_affected())
    }
}
