// crates/db/src/backfill/lease.rs
//! Durable lease locks, one per `(target_table, column)`.
//!
//! The lock lives in `_backfill_locks`, so it holds across processes (two
//! cron invocations) as well as across tasks. A lease that is not renewed
//! expires, which is how a crashed holder's lock gets taken over. A job
//! locks every column it writes, so two jobs conflict as soon as their
//! column sets overlap.

use std::time::Duration;

use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::{now_secs, Database, DbError, DbResult};

/// `horses:sire_id`.
pub fn lock_key(table: &str, column: &str) -> String {
    format!("{}:{}", table.to_ascii_lowercase(), column.to_ascii_lowercase())
}

/// One key per distinct column, sorted, so every job takes its locks in
/// the same order. Column order in the plan does not matter.
pub fn lock_keys(table: &str, columns: &[String]) -> Vec<String> {
    let mut keys: Vec<String> = columns.iter().map(|c| lock_key(table, c)).collect();
    keys.sort();
    keys.dedup();
    keys
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub lock_key: String,
    pub job_id: String,
    /// Unique per acquisition; renew/release only touch our own row.
    pub owner: String,
    pub expires_at: i64,
}

fn ttl_secs(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX / 2)
}

impl Database {
    /// Take the lock, or take it over if the current lease has expired.
    pub async fn acquire_lease(&self, lock_key: &str, job_id: &str, ttl: Duration) -> DbResult<Lease> {
        let owner = Ulid::new().to_string();
        let now = now_secs();
        let expires_at = now.saturating_add(ttl_secs(ttl));

        let result = sqlx::query(
            r#"INSERT INTO _backfill_locks (lock_key, job_id, owner, acquired_at, expires_at)
               VALUES (?1, ?2, ?3, ?4, ?5)
               ON CONFLICT(lock_key) DO UPDATE SET
                   job_id = excluded.job_id,
                   owner = excluded.owner,
                   acquired_at = excluded.acquired_at,
                   expires_at = excluded.expires_at
               WHERE _backfill_locks.expires_at <= excluded.acquired_at"#,
        )
        .bind(lock_key)
        .bind(job_id)
        .bind(&owner)
        .bind(now)
        .bind(expires_at)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.lock_held(lock_key).await);
        }
        info!(lock_key, job_id, %owner, expires_at, "lease acquired");
        Ok(Lease {
            lock_key: lock_key.to_string(),
            job_id: job_id.to_string(),
            owner,
            expires_at,
        })
    }

    /// Extend our lease. Fails with `LockHeld` when it was taken over.
    pub async fn renew_lease(&self, lease: &mut Lease, ttl: Duration) -> DbResult<()> {
        let expires_at = now_secs().saturating_add(ttl_secs(ttl));
        let result = sqlx::query(
            "UPDATE _backfill_locks SET expires_at = ?1 WHERE lock_key = ?2 AND owner = ?3",
        )
        .bind(expires_at)
        .bind(&lease.lock_key)
        .bind(&lease.owner)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.lock_held(&lease.lock_key).await);
        }
        lease.expires_at = expires_at;
        debug!(lock_key = %lease.lock_key, expires_at, "lease renewed");
        Ok(())
    }

    /// Take every key in order. On a conflict the leases already taken are
    /// released and the conflict is returned.
    pub async fn acquire_leases(
        &self,
        lock_keys: &[String],
        job_id: &str,
        ttl: Duration,
    ) -> DbResult<Vec<Lease>> {
        let mut leases = Vec::with_capacity(lock_keys.len());
        for key in lock_keys {
            match self.acquire_lease(key, job_id, ttl).await {
                Ok(lease) => leases.push(lease),
                Err(e) => {
                    self.release_leases(&leases).await;
                    return Err(e);
                }
            }
        }
        Ok(leases)
    }

    pub async fn renew_leases(&self, leases: &mut [Lease], ttl: Duration) -> DbResult<()> {
        for lease in leases.iter_mut() {
            self.renew_lease(lease, ttl).await?;
        }
        Ok(())
    }

    /// Best effort; an unreleased lease expires on its own.
    pub async fn release_leases(&self, leases: &[Lease]) {
        for lease in leases {
            if let Err(e) = self.release_lease(lease).await {
                warn!(lock_key = %lease.lock_key, job_id = %lease.job_id, error = %e, "failed to release lease");
            }
        }
    }

    pub async fn release_lease(&self, lease: &Lease) -> DbResult<()> {
        sqlx::query("DELETE FROM _backfill_locks WHERE lock_key = ?1 AND owner = ?2")
            .bind(&lease.lock_key)
            .bind(&lease.owner)
            .execute(self.pool())
            .await?;
        debug!(lock_key = %lease.lock_key, job_id = %lease.job_id, "lease released");
        Ok(())
    }

    async fn lock_held(&self, lock_key: &str) -> DbError {
        let holder: Option<(String,)> =
            sqlx::query_as("SELECT job_id FROM _backfill_locks WHERE lock_key = ?1")
                .bind(lock_key)
                .fetch_optional(self.pool())
                .await
                .unwrap_or(None);
        DbError::LockHeld {
            lock_key: lock_key.to_string(),
            holder: holder.map(|(h,)| h).unwrap_or_else(|| "<unknown>".into()),
        }
    }
}
