use crate::error::QueueError;
use crate::retry::{with_retry, RetryPolicy};
use ingest_manifest::{ContributionSpec, Manifest};
use sqlx::{PgPool, Row};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// One row of `contribfile_queue`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContribRow {
    pub id: i64,
    pub database: String,
    pub table: String,
    pub chunk_id: Option<i32>,
    pub filepath: String,
    pub is_overlap: Option<bool>,
    pub locking_worker: Option<String>,
    pub succeed: Option<bool>,
}

/// The three legal states of a [`ContribRow`]. No other
/// combination of `locking_worker`/`succeed` is valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContribState {
    Available,
    Locked,
    Done,
}

impl ContribRow {
    /// Classifies this row's state, failing if `succeed` is `false` --
    /// the column only ever holds `NULL` (not yet done) or `true` (done);
    /// `false`, locked or not, is never a state the queue writes itself.
    pub fn state(&self) -> Result<ContribState, QueueError> {
        match (&self.locking_worker, self.succeed) {
            (None, None) => Ok(ContribState::Available),
            (Some(_), None) => Ok(ContribState::Locked),
            (_, Some(true)) => Ok(ContribState::Done),
            (None, Some(false)) | (Some(_), Some(false)) => Err(QueueError::Invariant(format!(
                "contrib {} has succeed=false, an undefined combination",
                self.id
            ))),
        }
    }
}

impl From<&ContribRow> for ContributionSpec {
    fn from(row: &ContribRow) -> Self {
        ContributionSpec {
            database: row.database.clone(),
            table: row.table.clone(),
            chunk_id: row.chunk_id,
            filepath: row.filepath.clone(),
            is_overlap: row.is_overlap,
        }
    }
}

/// The shared-queue coordination primitive between independent orchestrator
/// worker processes. Backed by two Postgres tables:
/// `contribfile_queue` and the singleton `mutex` row.
///
/// `batch_size` is precomputed once by [`ContributionQueue::set_transaction_size`]
/// and reused by every subsequent [`ContributionQueue::lock_contribfiles`] call.
pub struct ContributionQueue {
    pool: PgPool,
    batch_size: AtomicI64,
    retry_policy: RetryPolicy,
}

impl ContributionQueue {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            batch_size: AtomicI64::new(1),
            retry_policy: RetryPolicy::default_queue(),
        }
    }

    /// Creates `contribfile_queue` and `mutex` if they don't already exist.
    /// Lets the binary stand up its own schema with no external migration
    /// runner.
    pub async fn ensure_schema(&self) -> Result<(), QueueError> {
        with_retry(self.retry_policy, || async {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS contribfile_queue (
                    id             BIGSERIAL PRIMARY KEY,
                    database       TEXT NOT NULL,
                    "table"        TEXT NOT NULL,
                    chunk_id       INTEGER,
                    filepath       TEXT NOT NULL,
                    is_overlap     BOOLEAN,
                    locking_worker TEXT,
                    succeed        BOOLEAN
                )
                "#,
            )
            .execute(&self.pool)
            .await
            .map_err(QueueError::from)?;

            sqlx::query(
                r#"
                CREATE INDEX IF NOT EXISTS contribfile_queue_database_idx
                    ON contribfile_queue (database, locking_worker, succeed)
                "#,
            )
            .execute(&self.pool)
            .await
            .map_err(QueueError::from)?;

            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS mutex (
                    owner       TEXT,
                    latest_move TIMESTAMPTZ NOT NULL DEFAULT now()
                )
                "#,
            )
            .execute(&self.pool)
            .await
            .map_err(QueueError::from)?;

            Ok(())
        })
        .await
    }

    /// Idempotent bootstrap: if the queue already has rows for `database`,
    /// this is a no-op; otherwise bulk-inserts one row per
    /// [`ContributionSpec`] the manifest yields.
    #[tracing::instrument(skip(self, manifest), fields(database = manifest.database()))]
    pub async fn insert_contribfiles(&self, manifest: &Manifest) -> Result<u64, QueueError> {
        let database = manifest.database().to_string();

        let existing: i64 = with_retry(self.retry_policy, || async {
            sqlx::query_scalar("SELECT COUNT(*) FROM contribfile_queue WHERE database = $1")
                .bind(&database)
                .fetch_one(&self.pool)
                .await
                .map_err(QueueError::from)
        })
        .await?;

        if existing > 0 {
            tracing::info!(database = %database, existing, "contribfile_queue already populated, skipping insert");
            return Ok(0);
        }

        let specs: Vec<ContributionSpec> = manifest.contributions().collect();

        with_retry(self.retry_policy, || {
            let specs = &specs;
            async move {
                let mut txn = self.pool.begin().await.map_err(QueueError::from)?;
                for spec in specs {
                    sqlx::query(
                        r#"
                        INSERT INTO contribfile_queue (database, "table", chunk_id, filepath, is_overlap)
                        VALUES ($1, $2, $3, $4, $5)
                        "#,
                    )
                    .bind(&spec.database)
                    .bind(&spec.table)
                    .bind(spec.chunk_id)
                    .bind(&spec.filepath)
                    .bind(spec.is_overlap)
                    .execute(&mut *txn)
                    .await
                    .map_err(QueueError::from)?;
                }
                txn.commit().await.map_err(QueueError::from)?;
                Ok(())
            }
        })
        .await?;

        Ok(specs.len() as u64)
    }

    /// Ensures the singleton mutex row exists with `owner` unset. Called
    /// once per dataset load before any worker starts.
    pub async fn init_mutex(&self) -> Result<(), QueueError> {
        with_retry(self.retry_policy, || async {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM mutex")
                .fetch_one(&self.pool)
                .await
                .map_err(QueueError::from)?;
            if count == 0 {
                sqlx::query("INSERT INTO mutex (owner, latest_move) VALUES (NULL, now())")
                    .execute(&self.pool)
                    .await
                    .map_err(QueueError::from)?;
            } else {
                sqlx::query("UPDATE mutex SET owner = NULL")
                    .execute(&self.pool)
                    .await
                    .map_err(QueueError::from)?;
            }
            Ok(())
        })
        .await
    }

    /// Busy-waits for exclusive ownership of the mutex row, doubling the
    /// backoff from 1s up to a 10s cap between attempts.
    #[tracing::instrument(skip(self))]
    pub async fn acquire_mutex(&self, worker_id: &str) -> Result<(), QueueError> {
        let mut delay = Duration::from_secs(1);
        const CAP: Duration = Duration::from_secs(10);

        loop {
            let acquired = with_retry(self.retry_policy, || async {
                let result = sqlx::query(
                    "UPDATE mutex SET owner = $1, latest_move = now() WHERE owner IS NULL",
                )
                .bind(worker_id)
                .execute(&self.pool)
                .await
                .map_err(QueueError::from)?;
                Ok(result.rows_affected() == 1)
            })
            .await?;

            if acquired {
                return Ok(());
            }

            let already_mine: Option<String> = with_retry(self.retry_policy, || async {
                sqlx::query_scalar("SELECT owner FROM mutex")
                    .fetch_one(&self.pool)
                    .await
                    .map_err(QueueError::from)
            })
            .await?;

            if already_mine.as_deref() == Some(worker_id) {
                return Ok(());
            }

            tracing::debug!(?delay, "mutex held by another worker, backing off");
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(CAP);
        }
    }

    /// Releases the mutex, but only if we still hold it.
    pub async fn release_mutex(&self, worker_id: &str) -> Result<(), QueueError> {
        with_retry(self.retry_policy, || async {
            sqlx::query("UPDATE mutex SET owner = NULL WHERE owner = $1")
                .bind(worker_id)
                .execute(&self.pool)
                .await
                .map_err(QueueError::from)?;
            Ok(())
        })
        .await
    }

    /// Precomputes `batch_size = floor(total_unfinished / fraction) + 1`
    /// for `database` and stores it for subsequent `lock_contribfiles`
    /// calls.
    pub async fn set_transaction_size(&self, database: &str, fraction: u32) -> Result<i64, QueueError> {
        let total_unfinished: i64 = with_retry(self.retry_policy, || async {
            sqlx::query_scalar(
                "SELECT COUNT(*) FROM contribfile_queue WHERE database = $1 AND succeed IS NOT TRUE",
            )
            .bind(database)
            .fetch_one(&self.pool)
            .await
            .map_err(QueueError::from)
        })
        .await?;

        let fraction = fraction.max(1) as i64;
        let batch_size = total_unfinished / fraction + 1;
        self.batch_size.store(batch_size, Ordering::SeqCst);
        Ok(batch_size)
    }

    /// Locks up to `batch_size` available rows for `database` under the
    /// mutex, then returns every row this worker now owns and hasn't yet
    /// completed.
    #[tracing::instrument(skip(self))]
    pub async fn lock_contribfiles(
        &self,
        database: &str,
        worker_id: &str,
    ) -> Result<Vec<ContribRow>, QueueError> {
        self.acquire_mutex(worker_id).await?;

        let batch_size = self.batch_size.load(Ordering::SeqCst);
        let lock_result = with_retry(self.retry_policy, || async {
            let ids: Vec<i64> = sqlx::query_scalar(
                r#"
                SELECT id FROM contribfile_queue
                WHERE locking_worker IS NULL AND database = $1
                LIMIT $2
                "#,
            )
            .bind(database)
            .bind(batch_size)
            .fetch_all(&self.pool)
            .await
            .map_err(QueueError::from)?;

            if !ids.is_empty() {
                sqlx::query(
                    r#"UPDATE contribfile_queue SET locking_worker = $1 WHERE id = ANY($2)"#,
                )
                .bind(worker_id)
                .bind(&ids)
                .execute(&self.pool)
                .await
                .map_err(QueueError::from)?;
            }
            Ok(())
        })
        .await;

        // Always release the mutex, even if the lock attempt failed, so a
        // transient error here doesn't wedge every other worker.
        self.release_mutex(worker_id).await?;
        lock_result?;

        self.select_locked_by(database, worker_id).await
    }

    async fn select_locked_by(&self, database: &str, worker_id: &str) -> Result<Vec<ContribRow>, QueueError> {
        with_retry(self.retry_policy, || async {
            let rows = sqlx::query(
                r#"
                SELECT id, database, "table", chunk_id, filepath, is_overlap, locking_worker, succeed
                FROM contribfile_queue
                WHERE locking_worker = $1 AND succeed IS NULL AND database = $2
                "#,
            )
            .bind(worker_id)
            .bind(database)
            .fetch_all(&self.pool)
            .await
            .map_err(QueueError::from)?;

            Ok(rows.into_iter().map(row_to_contrib).collect())
        })
        .await
    }

    /// Marks this worker's locked batch succeeded, or releases the lock on
    /// failure. Retried up to 100 times: the queue MUST end up
    /// consistent with what the server actually did, even through a
    /// flapping database connection.
    #[tracing::instrument(skip(self))]
    pub async fn unlock_contribfiles(&self, worker_id: &str, success: bool) -> Result<(), QueueError> {
        with_retry(RetryPolicy::reconciliation(), || async {
            if success {
                sqlx::query("UPDATE contribfile_queue SET succeed = TRUE WHERE locking_worker = $1")
                    .bind(worker_id)
                    .execute(&self.pool)
                    .await
                    .map_err(QueueError::from)?;
            } else {
                sqlx::query("UPDATE contribfile_queue SET locking_worker = NULL WHERE locking_worker = $1")
                    .bind(worker_id)
                    .execute(&self.pool)
                    .await
                    .map_err(QueueError::from)?;
            }
            Ok(())
        })
        .await
    }

    /// True iff every row for `database` has `succeed = TRUE`.
    pub async fn all_succeed(&self, database: &str) -> Result<bool, QueueError> {
        with_retry(self.retry_policy, || async {
            let remaining: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM contribfile_queue WHERE succeed IS NOT TRUE AND database = $1",
            )
            .bind(database)
            .fetch_one(&self.pool)
            .await
            .map_err(QueueError::from)?;
            Ok(remaining == 0)
        })
        .await
    }

    /// Diagnostic read: every row not yet ingested.
    pub async fn select_noningested_contribfiles(&self, database: &str) -> Result<Vec<ContribRow>, QueueError> {
        self.select_by_predicate(database, "succeed IS NOT TRUE").await
    }

    /// Diagnostic read: every row currently locked by some worker but not
    /// yet marked succeeded.
    pub async fn select_inprogress_contribfiles(&self, database: &str) -> Result<Vec<ContribRow>, QueueError> {
        self.select_by_predicate(database, "locking_worker IS NOT NULL AND succeed IS NULL")
            .await
    }

    async fn select_by_predicate(&self, database: &str, predicate: &str) -> Result<Vec<ContribRow>, QueueError> {
        let sql = format!(
            r#"SELECT id, database, "table", chunk_id, filepath, is_overlap, locking_worker, succeed
               FROM contribfile_queue WHERE database = $1 AND {predicate}"#
        );
        with_retry(self.retry_policy, || {
            let sql = &sql;
            async move {
                let rows = sqlx::query(sql)
                    .bind(database)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(QueueError::from)?;
                Ok(rows.into_iter().map(row_to_contrib).collect())
            }
        })
        .await
    }
}

fn row_to_contrib(row: sqlx::postgres::PgRow) -> ContribRow {
    ContribRow {
        id: row.get("id"),
        database: row.get("database"),
        table: row.get("table"),
        chunk_id: row.get("chunk_id"),
        filepath: row.get("filepath"),
        is_overlap: row.get("is_overlap"),
        locking_worker: row.get("locking_worker"),
        succeed: row.get("succeed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i64, locking_worker: Option<&str>, succeed: Option<bool>) -> ContribRow {
        ContribRow {
            id,
            database: "gaia".to_string(),
            table: "Source".to_string(),
            chunk_id: Some(1),
            filepath: "x/chunk_1.txt".to_string(),
            is_overlap: Some(false),
            locking_worker: locking_worker.map(String::from),
            succeed,
        }
    }

    #[test]
    fn classifies_available_locked_done() {
        assert_eq!(row(1, None, None).state().unwrap(), ContribState::Available);
        assert_eq!(row(2, Some("w1"), None).state().unwrap(), ContribState::Locked);
        assert_eq!(row(3, Some("w1"), Some(true)).state().unwrap(), ContribState::Done);
    }

    #[test]
    fn rejects_illegal_combination() {
        assert!(row(4, None, Some(false)).state().is_err());
    }

    #[test]
    fn contrib_row_converts_to_contribution_spec() {
        let r = row(5, Some("w1"), None);
        let spec: ContributionSpec = (&r).into();
        assert_eq!(spec.database, "gaia");
        assert_eq!(spec.filepath, "x/chunk_1.txt");
    }
}
