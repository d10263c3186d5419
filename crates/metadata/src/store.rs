//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::repos::{CheckpointRepo, CopyJobRepo, DeadLetterRepo, QueueRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined coordination store trait.
#[async_trait]
pub trait MetadataStore:
    CopyJobRepo + QueueRepo + DeadLetterRepo + CheckpointRepo + Send + Sync
{
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based coordination store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `path` and migrate it.
    pub async fn new(path: impl AsRef<Path>) -> MetadataResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            // Prevent transient "database is locked" errors when the daemon and
            // twinctl share the file.
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // A single connection serializes every transaction in this process,
            // which is what makes the lease and finalize-claim transactions atomic.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        tracing::debug!(path = %path.display(), "Opened coordination store");
        Ok(store)
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// Implement all the repository traits for SqliteStore
mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use crate::repos::{LeasedItem, PartCompletion};
    use sqlx::SqliteConnection;
    use time::OffsetDateTime;
    use twinstore_core::WorkItem;
    use uuid::Uuid;

    async fn insert_queue_item(
        conn: &mut SqliteConnection,
        item: &WorkItem,
        available_at: OffsetDateTime,
    ) -> MetadataResult<Uuid> {
        let item_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO work_queue (
                item_id, item_type, payload, available_at, leased_until, deliveries, enqueued_at
            ) VALUES (?, ?, ?, ?, NULL, 0, ?)
            "#,
        )
        .bind(item_id)
        .bind(item.label())
        .bind(item.to_json()?)
        .bind(to_micros(available_at))
        .bind(to_micros(OffsetDateTime::now_utc()))
        .execute(&mut *conn)
        .await?;
        Ok(item_id)
    }

    async fn insert_dead_letter(
        conn: &mut SqliteConnection,
        row: &DeadLetterRow,
    ) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO dead_letters (
                dead_letter_id, task_id, task_json, attempts, failure_class,
                reason, state, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(row.dead_letter_id)
        .bind(row.task_id)
        .bind(&row.task_json)
        .bind(row.attempts)
        .bind(&row.failure_class)
        .bind(&row.reason)
        .bind(&row.state)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Move a queue item that ran out of deliveries into the dead-letter table.
    ///
    /// A copy-part item fails its whole job; the job's task is what gets
    /// dead-lettered.
    async fn redirect_exhausted(
        conn: &mut SqliteConnection,
        row: &QueueItemRow,
        item: WorkItem,
        max_deliveries: u32,
        now_us: i64,
    ) -> MetadataResult<()> {
        let reason = format!("delivery limit of {max_deliveries} exceeded");
        let task = match item {
            WorkItem::Sync(task) => Some(task),
            WorkItem::CopyPart { job_id, .. } => {
                let failed = sqlx::query(
                    "UPDATE copy_jobs SET state = 'failed', error = ?, updated_at = ? WHERE job_id = ? AND state = 'copying'",
                )
                .bind(&reason)
                .bind(now_us)
                .bind(job_id)
                .execute(&mut *conn)
                .await?;

                if failed.rows_affected() == 1 {
                    let job = sqlx::query_as::<_, CopyJobRow>(
                        "SELECT * FROM copy_jobs WHERE job_id = ?",
                    )
                    .bind(job_id)
                    .fetch_one(&mut *conn)
                    .await?;
                    Some(job.task()?)
                } else {
                    None
                }
            }
        };

        if let Some(mut task) = task {
            task.attempts += 1;
            let dead = DeadLetterRow::new(&task, "transient", &reason)?;
            insert_dead_letter(conn, &dead).await?;
            tracing::warn!(
                task_id = %task.task_id,
                item_id = %row.item_id,
                item_type = %row.item_type,
                deliveries = row.deliveries,
                "Queue item exhausted its deliveries; dead-lettered"
            );
        }

        sqlx::query("DELETE FROM work_queue WHERE item_id = ?")
            .bind(row.item_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    #[async_trait]
    impl CopyJobRepo for SqliteStore {
        async fn create_copy_job(&self, job: &CopyJobRow) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO copy_jobs (
                    job_id, task_json, source_replica, dest_replica, source_key, dest_key,
                    session_id, size, part_size, total_parts, state, error,
                    created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(job.job_id)
            .bind(&job.task_json)
            .bind(&job.source_replica)
            .bind(&job.dest_replica)
            .bind(&job.source_key)
            .bind(&job.dest_key)
            .bind(&job.session_id)
            .bind(job.size)
            .bind(job.part_size)
            .bind(job.total_parts)
            .bind(&job.state)
            .bind(&job.error)
            .bind(job.created_at)
            .bind(job.updated_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn get_copy_job(&self, job_id: Uuid) -> MetadataResult<Option<CopyJobRow>> {
            let row = sqlx::query_as::<_, CopyJobRow>("SELECT * FROM copy_jobs WHERE job_id = ?")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn find_active_copy_job(
            &self,
            dest_replica: &str,
            dest_key: &str,
        ) -> MetadataResult<Option<CopyJobRow>> {
            let row = sqlx::query_as::<_, CopyJobRow>(
                "SELECT * FROM copy_jobs WHERE dest_replica = ? AND dest_key = ? AND state IN ('copying', 'finalizing')",
            )
            .bind(dest_replica)
            .bind(dest_key)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn record_part_complete(
            &self,
            job_id: Uuid,
            part_index: u32,
            etag: Option<&str>,
            completed_at: OffsetDateTime,
        ) -> MetadataResult<PartCompletion> {
            let now_us = to_micros(completed_at);
            let mut tx = self.pool.begin().await?;

            let state: Option<String> =
                sqlx::query_scalar("SELECT state FROM copy_jobs WHERE job_id = ?")
                    .bind(job_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            match state.as_deref() {
                None => {
                    return Err(MetadataError::NotFound(format!(
                        "copy job {job_id} not found"
                    )));
                }
                Some(JOB_COPYING) => {}
                Some(_) => {
                    tx.commit().await?;
                    return Ok(PartCompletion::JobInactive);
                }
            }

            // A redelivered part replaces its earlier upload, so keep the newest tag.
            sqlx::query(
                r#"
                INSERT INTO copy_job_parts (job_id, part_index, etag, completed_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(job_id, part_index) DO UPDATE SET
                    etag = excluded.etag,
                    completed_at = excluded.completed_at
                "#,
            )
            .bind(job_id)
            .bind(i64::from(part_index))
            .bind(etag)
            .bind(now_us)
            .execute(&mut *tx)
            .await?;

            let claimed = sqlx::query(
                r#"
                UPDATE copy_jobs SET state = 'finalizing', updated_at = ?
                WHERE job_id = ?
                  AND state = 'copying'
                  AND (SELECT COUNT(*) FROM copy_job_parts WHERE job_id = ?) = total_parts
                "#,
            )
            .bind(now_us)
            .bind(job_id)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;

            if claimed.rows_affected() == 1 {
                Ok(PartCompletion::FinalizeClaimed)
            } else {
                Ok(PartCompletion::Recorded)
            }
        }

        async fn completed_parts(&self, job_id: Uuid) -> MetadataResult<Vec<CopyPartRow>> {
            let rows = sqlx::query_as::<_, CopyPartRow>(
                "SELECT * FROM copy_job_parts WHERE job_id = ? ORDER BY part_index",
            )
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn fail_copy_job(
            &self,
            job_id: Uuid,
            from_state: &str,
            reason: &str,
            failed_at: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE copy_jobs SET state = 'failed', error = ?, updated_at = ? WHERE job_id = ? AND state = ?",
            )
            .bind(reason)
            .bind(to_micros(failed_at))
            .bind(job_id)
            .bind(from_state)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        }

        async fn reclaim_stalled_finalizes(
            &self,
            older_than: OffsetDateTime,
            now: OffsetDateTime,
            limit: u32,
        ) -> MetadataResult<Vec<CopyJobRow>> {
            let stalled = sqlx::query_as::<_, CopyJobRow>(
                "SELECT * FROM copy_jobs WHERE state = 'finalizing' AND updated_at < ? ORDER BY updated_at LIMIT ?",
            )
            .bind(to_micros(older_than))
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

            let now_us = to_micros(now);
            let mut claimed = Vec::with_capacity(stalled.len());
            for mut job in stalled {
                let result = sqlx::query(
                    "UPDATE copy_jobs SET updated_at = ? WHERE job_id = ? AND state = 'finalizing' AND updated_at = ?",
                )
                .bind(now_us)
                .bind(job.job_id)
                .bind(job.updated_at)
                .execute(&self.pool)
                .await?;
                if result.rows_affected() == 1 {
                    job.updated_at = now_us;
                    claimed.push(job);
                }
            }
            Ok(claimed)
        }

        async fn failed_copy_jobs(&self, limit: u32) -> MetadataResult<Vec<CopyJobRow>> {
            let rows = sqlx::query_as::<_, CopyJobRow>(
                "SELECT * FROM copy_jobs WHERE state = 'failed' ORDER BY updated_at LIMIT ?",
            )
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn delete_copy_job(&self, job_id: Uuid) -> MetadataResult<()> {
            // Parts go with the job through ON DELETE CASCADE.
            sqlx::query("DELETE FROM copy_jobs WHERE job_id = ?")
                .bind(job_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        }
    }

    #[async_trait]
    impl QueueRepo for SqliteStore {
        async fn enqueue(
            &self,
            item: &WorkItem,
            available_at: OffsetDateTime,
        ) -> MetadataResult<Uuid> {
            let mut conn = self.pool.acquire().await?;
            insert_queue_item(&mut *conn, item, available_at).await
        }

        async fn lease(
            &self,
            now: OffsetDateTime,
            limit: u32,
            visibility: Duration,
            max_deliveries: u32,
        ) -> MetadataResult<Vec<LeasedItem>> {
            let now_us = to_micros(now);
            let leased_until = to_micros(now + visibility);
            let mut tx = self.pool.begin().await?;

            let due = sqlx::query_as::<_, QueueItemRow>(
                r#"
                SELECT * FROM work_queue
                WHERE available_at <= ? AND (leased_until IS NULL OR leased_until <= ?)
                ORDER BY available_at, enqueued_at
                LIMIT ?
                "#,
            )
            .bind(now_us)
            .bind(now_us)
            .bind(i64::from(limit))
            .fetch_all(&mut *tx)
            .await?;

            let mut leased = Vec::with_capacity(due.len());
            for row in due {
                let item = match WorkItem::from_json(&row.payload) {
                    Ok(item) => item,
                    Err(e) => {
                        tracing::error!(
                            item_id = %row.item_id,
                            error = %e,
                            "Dropping unreadable queue item"
                        );
                        sqlx::query("DELETE FROM work_queue WHERE item_id = ?")
                            .bind(row.item_id)
                            .execute(&mut *tx)
                            .await?;
                        continue;
                    }
                };

                if row.deliveries >= i64::from(max_deliveries) {
                    redirect_exhausted(&mut *tx, &row, item, max_deliveries, now_us).await?;
                    continue;
                }

                sqlx::query(
                    "UPDATE work_queue SET deliveries = deliveries + 1, leased_until = ? WHERE item_id = ?",
                )
                .bind(leased_until)
                .bind(row.item_id)
                .execute(&mut *tx)
                .await?;

                leased.push(LeasedItem {
                    item_id: row.item_id,
                    item,
                    deliveries: (row.deliveries + 1) as u32,
                });
            }

            tx.commit().await?;
            Ok(leased)
        }

        async fn ack(&self, item_id: Uuid) -> MetadataResult<bool> {
            let result = sqlx::query("DELETE FROM work_queue WHERE item_id = ?")
                .bind(item_id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() == 1)
        }

        async fn release(
            &self,
            item_id: Uuid,
            available_at: OffsetDateTime,
        ) -> MetadataResult<()> {
            sqlx::query(
                "UPDATE work_queue SET leased_until = NULL, available_at = ? WHERE item_id = ?",
            )
            .bind(to_micros(available_at))
            .bind(item_id)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn queue_depth(&self) -> MetadataResult<u64> {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM work_queue")
                .fetch_one(&self.pool)
                .await?;
            Ok(count as u64)
        }
    }

    #[async_trait]
    impl DeadLetterRepo for SqliteStore {
        async fn push_dead_letter(&self, row: &DeadLetterRow) -> MetadataResult<()> {
            let mut conn = self.pool.acquire().await?;
            insert_dead_letter(&mut *conn, row).await
        }

        async fn get_dead_letter(
            &self,
            dead_letter_id: Uuid,
        ) -> MetadataResult<Option<DeadLetterRow>> {
            let row = sqlx::query_as::<_, DeadLetterRow>(
                "SELECT * FROM dead_letters WHERE dead_letter_id = ?",
            )
            .bind(dead_letter_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn list_dead_letters(
            &self,
            state: Option<&str>,
            limit: u32,
        ) -> MetadataResult<Vec<DeadLetterRow>> {
            let rows = match state {
                Some(state) => {
                    sqlx::query_as::<_, DeadLetterRow>(
                        "SELECT * FROM dead_letters WHERE state = ? ORDER BY created_at LIMIT ?",
                    )
                    .bind(state)
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool)
                    .await?
                }
                None => {
                    sqlx::query_as::<_, DeadLetterRow>(
                        "SELECT * FROM dead_letters ORDER BY created_at LIMIT ?",
                    )
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool)
                    .await?
                }
            };
            Ok(rows)
        }

        async fn park_dead_letter(
            &self,
            dead_letter_id: Uuid,
            parked_at: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE dead_letters SET state = 'parked', updated_at = ? WHERE dead_letter_id = ? AND state = 'pending'",
            )
            .bind(to_micros(parked_at))
            .bind(dead_letter_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        }

        async fn redrive_dead_letter(
            &self,
            dead_letter_id: Uuid,
            item: &WorkItem,
            available_at: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let mut tx = self.pool.begin().await?;

            let removed = sqlx::query("DELETE FROM dead_letters WHERE dead_letter_id = ?")
                .bind(dead_letter_id)
                .execute(&mut *tx)
                .await?;
            if removed.rows_affected() == 0 {
                tx.rollback().await?;
                return Ok(false);
            }

            insert_queue_item(&mut *tx, item, available_at).await?;
            tx.commit().await?;
            Ok(true)
        }

        async fn count_dead_letters(&self, state: &str) -> MetadataResult<u64> {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters WHERE state = ?")
                .bind(state)
                .fetch_one(&self.pool)
                .await?;
            Ok(count as u64)
        }
    }

    #[async_trait]
    impl CheckpointRepo for SqliteStore {
        async fn get_checkpoint(&self, kind: &str) -> MetadataResult<Option<CheckpointRow>> {
            let row = sqlx::query_as::<_, CheckpointRow>(
                "SELECT * FROM verification_checkpoints WHERE kind = ?",
            )
            .bind(kind)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn list_checkpoints(&self) -> MetadataResult<Vec<CheckpointRow>> {
            let rows = sqlx::query_as::<_, CheckpointRow>(
                "SELECT * FROM verification_checkpoints ORDER BY kind",
            )
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn compare_and_set_checkpoint(
            &self,
            kind: &str,
            expected: Option<OffsetDateTime>,
            new: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let new_us = to_micros(new);
            let now_us = to_micros(OffsetDateTime::now_utc());

            let result = match expected {
                None => {
                    sqlx::query(
                        "INSERT INTO verification_checkpoints (kind, checkpoint_us, updated_at) VALUES (?, ?, ?) ON CONFLICT(kind) DO NOTHING",
                    )
                    .bind(kind)
                    .bind(new_us)
                    .bind(now_us)
                    .execute(&self.pool)
                    .await?
                }
                Some(expected) => {
                    let expected_us = to_micros(expected);
                    if new_us < expected_us {
                        return Ok(false);
                    }
                    sqlx::query(
                        "UPDATE verification_checkpoints SET checkpoint_us = ?, updated_at = ? WHERE kind = ? AND checkpoint_us = ?",
                    )
                    .bind(new_us)
                    .bind(now_us)
                    .bind(kind)
                    .bind(expected_us)
                    .execute(&self.pool)
                    .await?
                }
            };
            Ok(result.rows_affected() == 1)
        }
    }
}

/// SQL schema for SQLite.
const SCHEMA_SQL: &str = r#"
-- Chunked copies in flight
CREATE TABLE IF NOT EXISTS copy_jobs (
    job_id BLOB PRIMARY KEY,
    task_json TEXT NOT NULL,
    source_replica TEXT NOT NULL,
    dest_replica TEXT NOT NULL,
    source_key TEXT NOT NULL,
    dest_key TEXT NOT NULL,
    session_id TEXT NOT NULL,
    size INTEGER NOT NULL,
    part_size INTEGER NOT NULL,
    total_parts INTEGER NOT NULL,
    state TEXT NOT NULL DEFAULT 'copying',
    error TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_copy_jobs_state ON copy_jobs(state, updated_at);
-- One active job per destination key
CREATE UNIQUE INDEX IF NOT EXISTS idx_copy_jobs_active_dest
ON copy_jobs(dest_replica, dest_key)
WHERE state IN ('copying', 'finalizing');

CREATE TABLE IF NOT EXISTS copy_job_parts (
    job_id BLOB NOT NULL REFERENCES copy_jobs(job_id) ON DELETE CASCADE,
    part_index INTEGER NOT NULL,
    etag TEXT,
    completed_at INTEGER NOT NULL,
    PRIMARY KEY (job_id, part_index)
);

-- Work queue
CREATE TABLE IF NOT EXISTS work_queue (
    item_id BLOB PRIMARY KEY,
    item_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    available_at INTEGER NOT NULL,
    leased_until INTEGER,
    deliveries INTEGER NOT NULL DEFAULT 0,
    enqueued_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_work_queue_due ON work_queue(available_at, enqueued_at);

-- Failed tasks
CREATE TABLE IF NOT EXISTS dead_letters (
    dead_letter_id BLOB PRIMARY KEY,
    task_id BLOB NOT NULL,
    task_json TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    failure_class TEXT NOT NULL,
    reason TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'pending',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_dead_letters_state ON dead_letters(state, created_at);

-- Verification checkpoints, one per object kind
CREATE TABLE IF NOT EXISTS verification_checkpoints (
    kind TEXT PRIMARY KEY,
    checkpoint_us INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
"#;
