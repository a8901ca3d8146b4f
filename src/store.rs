use crate::config::FileOrder;
use crate::error::{CrucibleError, Result};
use crate::protocol::{FailureKind, SkipReason, SourceSummary};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::time::Duration;

const SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Assigned,
    Processing,
    Completed,
    Failed,
    Skipped,
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FileStatus::Pending => "pending",
            FileStatus::Assigned => "assigned",
            FileStatus::Processing => "processing",
            FileStatus::Completed => "completed",
            FileStatus::Failed => "failed",
            FileStatus::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

/// One row of the `files` table, the unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FileRecord {
    pub id: i64,
    pub path: String,
    pub directory: String,
    pub filename: String,
    pub size_bytes: i64,
    pub mtime: i64,
    pub status: FileStatus,
    pub priority: i32,
    pub preferred_worker_id: Option<String>,
    pub assigned_worker_id: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub last_progress_at: Option<DateTime<Utc>>,
    pub lease_token: Option<String>,
    pub source_codec: Option<String>,
    pub source_resolution: Option<String>,
    pub source_audio_codec: Option<String>,
    pub source_bitrate: Option<i64>,
    pub hdr_kind: Option<String>,
    pub target_crf: Option<i64>,
    pub target_audio_bitrate: Option<i64>,
    pub output_size_bytes: Option<i64>,
    pub savings_bytes: Option<i64>,
    pub savings_percent: Option<f64>,
    pub attempt_count: i32,
    pub last_error_kind: Option<String>,
    pub last_error_message: Option<String>,
    pub error_at: Option<DateTime<Utc>>,
    pub skip_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

const FILE_COLUMNS: &str = "id, path, directory, filename, size_bytes, mtime, status, priority, \
     preferred_worker_id, assigned_worker_id, assigned_at, last_progress_at, lease_token, \
     source_codec, source_resolution, source_audio_codec, source_bitrate, hdr_kind, \
     target_crf, target_audio_bitrate, output_size_bytes, savings_bytes, savings_percent, \
     attempt_count, last_error_kind, last_error_message, error_at, skip_reason, \
     created_at, updated_at, completed_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    Added,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// First delivery for this lease; the record transitioned.
    Recorded,
    /// The record was already completed; nothing changed.
    Duplicate,
    /// The lease does not match the current assignment; nothing changed.
    StaleLease,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QueueStats {
    pub pending: i64,
    pub assigned: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub skipped: i64,
    pub total_size_bytes: i64,
    pub total_output_bytes: i64,
    pub total_savings_bytes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub stats: QueueStats,
    pub files: Vec<FileRecord>,
}

pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn new(db_path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(options).await?;

        let store = Self { pool };
        store.init().await?;
        store.recover_interrupted().await?;

        Ok(store)
    }

    async fn init(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        let version: Option<i64> = sqlx::query_scalar("SELECT version FROM schema_version")
            .fetch_optional(&self.pool)
            .await?;

        match version {
            None => {
                sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
                    .bind(SCHEMA_VERSION)
                    .execute(&self.pool)
                    .await?;
            }
            Some(v) if v > SCHEMA_VERSION => {
                return Err(CrucibleError::Config(format!(
                    "Database schema version {} is newer than supported version {}",
                    v, SCHEMA_VERSION
                )));
            }
            Some(_) => {}
        }

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT NOT NULL UNIQUE,
                directory TEXT NOT NULL,
                filename TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                mtime INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                priority INTEGER NOT NULL DEFAULT 0,
                preferred_worker_id TEXT,
                pending_since DATETIME DEFAULT CURRENT_TIMESTAMP,
                assigned_worker_id TEXT,
                assigned_at DATETIME,
                last_progress_at DATETIME,
                lease_token TEXT,
                source_codec TEXT,
                source_resolution TEXT,
                source_audio_codec TEXT,
                source_bitrate INTEGER,
                hdr_kind TEXT,
                target_crf INTEGER,
                target_audio_bitrate INTEGER,
                output_size_bytes INTEGER,
                savings_bytes INTEGER,
                savings_percent REAL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                last_error_kind TEXT,
                last_error_message TEXT,
                error_at DATETIME,
                skip_reason TEXT,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                completed_at DATETIME
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_files_queue
             ON files (status, priority DESC, id ASC)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_files_pin
             ON files (preferred_worker_id, status)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_files_assignee
             ON files (assigned_worker_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS stats_daily (
                day TEXT PRIMARY KEY,
                files_completed INTEGER NOT NULL DEFAULT 0,
                bytes_in INTEGER NOT NULL DEFAULT 0,
                bytes_out INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Records left in flight by a crash go back to `pending`. Their
    /// attempt already counted; the lease is dead either way.
    async fn recover_interrupted(&self) -> Result<()> {
        let result = sqlx::query(
            "UPDATE files SET status = 'pending', assigned_worker_id = NULL,
                assigned_at = NULL, lease_token = NULL,
                pending_since = CURRENT_TIMESTAMP, updated_at = CURRENT_TIMESTAMP
             WHERE status IN ('assigned', 'processing')",
        )
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            tracing::info!(
                "Recovered {} interrupted assignment(s) to pending",
                result.rows_affected()
            );
        }
        Ok(())
    }

    /// Insert a newly scanned file, or refresh size/mtime on a settled
    /// record. In-flight records are never touched; a completed record
    /// whose content changed is re-enqueued.
    pub async fn upsert_scan(&self, path: &str, size_bytes: u64, mtime: i64) -> Result<ScanOutcome> {
        let existing = sqlx::query(
            "SELECT id, status, size_bytes, mtime FROM files WHERE path = ?",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = existing else {
            let (directory, filename) = split_path(path);
            sqlx::query(
                "INSERT INTO files (path, directory, filename, size_bytes, mtime, status)
                 VALUES (?, ?, ?, ?, ?, 'pending')",
            )
            .bind(path)
            .bind(directory)
            .bind(filename)
            .bind(size_bytes as i64)
            .bind(mtime)
            .execute(&self.pool)
            .await?;
            return Ok(ScanOutcome::Added);
        };

        let id: i64 = row.get("id");
        let status: FileStatus = row.get("status");
        let old_size: i64 = row.get("size_bytes");
        let old_mtime: i64 = row.get("mtime");
        let changed = old_size != size_bytes as i64 || old_mtime != mtime;

        if !changed {
            return Ok(ScanOutcome::Unchanged);
        }

        match status {
            FileStatus::Pending | FileStatus::Failed => {
                sqlx::query(
                    "UPDATE files SET size_bytes = ?, mtime = ?, updated_at = CURRENT_TIMESTAMP
                     WHERE id = ?",
                )
                .bind(size_bytes as i64)
                .bind(mtime)
                .bind(id)
                .execute(&self.pool)
                .await?;
                Ok(ScanOutcome::Updated)
            }
            FileStatus::Completed => {
                // New bytes at a finished path mean new work.
                sqlx::query(
                    "UPDATE files SET size_bytes = ?, mtime = ?, status = 'pending',
                        attempt_count = 0, output_size_bytes = NULL, savings_bytes = NULL,
                        savings_percent = NULL, completed_at = NULL, skip_reason = NULL,
                        last_error_kind = NULL, last_error_message = NULL, error_at = NULL,
                        pending_since = CURRENT_TIMESTAMP, updated_at = CURRENT_TIMESTAMP
                     WHERE id = ?",
                )
                .bind(size_bytes as i64)
                .bind(mtime)
                .bind(id)
                .execute(&self.pool)
                .await?;
                Ok(ScanOutcome::Updated)
            }
            _ => Ok(ScanOutcome::Unchanged),
        }
    }

    /// Atomically claim the best pending file for a worker. Pins are soft:
    /// a file pinned elsewhere becomes fair game once its pin grace runs
    /// out. Returns the claimed record with a fresh lease.
    pub async fn claim_next(
        &self,
        worker_id: &str,
        order: FileOrder,
        pin_grace_s: u64,
    ) -> Result<Option<FileRecord>> {
        let order_key = match order {
            FileOrder::Oldest => "mtime ASC",
            FileOrder::Newest => "mtime DESC",
            FileOrder::Largest => "size_bytes DESC",
            FileOrder::Smallest => "size_bytes ASC",
        };

        let lease = uuid::Uuid::new_v4().to_string();
        let grace_modifier = format!("-{} seconds", pin_grace_s);

        let query = format!(
            "UPDATE files SET status = 'assigned', assigned_worker_id = ?1,
                assigned_at = CURRENT_TIMESTAMP, last_progress_at = CURRENT_TIMESTAMP,
                lease_token = ?2, attempt_count = attempt_count + 1,
                updated_at = CURRENT_TIMESTAMP
             WHERE id = (
                 SELECT id FROM files
                 WHERE status = 'pending'
                   AND (preferred_worker_id IS NULL
                        OR preferred_worker_id = ?1
                        OR pending_since <= datetime('now', ?3))
                 ORDER BY (preferred_worker_id = ?1) DESC, priority DESC, {order_key}, id ASC
                 LIMIT 1
             )
             RETURNING {FILE_COLUMNS}"
        );

        let record = sqlx::query_as::<_, FileRecord>(&query)
            .bind(worker_id)
            .bind(&lease)
            .bind(&grace_modifier)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    /// The live assignment a worker currently holds, if any.
    pub async fn assignment_for(&self, worker_id: &str) -> Result<Option<FileRecord>> {
        let query = format!(
            "SELECT {FILE_COLUMNS} FROM files
             WHERE assigned_worker_id = ? AND status IN ('assigned', 'processing')"
        );
        let record = sqlx::query_as::<_, FileRecord>(&query)
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    /// Bump progress under a valid lease. The first progress report moves
    /// the record from `assigned` to `processing`. Returns false when the
    /// lease is stale (the report belongs to a reaped assignment).
    pub async fn record_progress(&self, file_id: i64, lease_token: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE files SET status = 'processing', last_progress_at = CURRENT_TIMESTAMP,
                updated_at = CURRENT_TIMESTAMP
             WHERE id = ? AND lease_token = ? AND status IN ('assigned', 'processing')",
        )
        .bind(file_id)
        .bind(lease_token)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Persist what the worker's probe learned. Lease-gated like any other
    /// worker-originated mutation.
    pub async fn record_source_profile(
        &self,
        file_id: i64,
        lease_token: &str,
        source: &SourceSummary,
    ) -> Result<bool> {
        let resolution = format!("{}x{}", source.width, source.height);
        let result = sqlx::query(
            "UPDATE files SET source_codec = ?, source_resolution = ?, source_audio_codec = ?,
                source_bitrate = ?, hdr_kind = ?, target_crf = ?, target_audio_bitrate = ?,
                updated_at = CURRENT_TIMESTAMP
             WHERE id = ? AND lease_token = ? AND status IN ('assigned', 'processing')",
        )
        .bind(&source.video_codec)
        .bind(resolution)
        .bind(&source.audio_codec)
        .bind(source.video_bitrate_bps.map(|b| b as i64))
        .bind(source.hdr_kind.as_str())
        .bind(source.target_crf.map(i64::from))
        .bind(source.target_audio_bitrate.map(i64::from))
        .bind(file_id)
        .bind(lease_token)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Transition to `completed`. Exactly-once: the first delivery for the
    /// live lease wins; duplicates and stale leases are no-ops.
    pub async fn record_completion(
        &self,
        file_id: i64,
        lease_token: &str,
        output_size_bytes: u64,
    ) -> Result<CompletionOutcome> {
        let result = sqlx::query(
            "UPDATE files SET status = 'completed',
                output_size_bytes = ?2,
                savings_bytes = size_bytes - ?2,
                savings_percent = ROUND(100.0 * (size_bytes - ?2) / size_bytes, 2),
                assigned_worker_id = NULL, assigned_at = NULL, lease_token = NULL,
                completed_at = CURRENT_TIMESTAMP, updated_at = CURRENT_TIMESTAMP
             WHERE id = ?1 AND lease_token = ?3 AND status IN ('assigned', 'processing')",
        )
        .bind(file_id)
        .bind(output_size_bytes as i64)
        .bind(lease_token)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            sqlx::query(
                "INSERT INTO stats_daily (day, files_completed, bytes_in, bytes_out)
                 SELECT date('now'), 1, size_bytes, output_size_bytes FROM files WHERE id = ?
                 ON CONFLICT(day) DO UPDATE SET
                    files_completed = files_completed + 1,
                    bytes_in = bytes_in + excluded.bytes_in,
                    bytes_out = bytes_out + excluded.bytes_out",
            )
            .bind(file_id)
            .execute(&self.pool)
            .await?;
            return Ok(CompletionOutcome::Recorded);
        }

        let status: Option<FileStatus> =
            sqlx::query_scalar("SELECT status FROM files WHERE id = ?")
                .bind(file_id)
                .fetch_optional(&self.pool)
                .await?;

        match status {
            Some(FileStatus::Completed) => Ok(CompletionOutcome::Duplicate),
            _ => Ok(CompletionOutcome::StaleLease),
        }
    }

    /// Record a failure under a valid lease. Retryable failures under the
    /// attempt ceiling go back to `pending`; everything else sticks at
    /// `failed` until an operator resets it.
    pub async fn record_failure(
        &self,
        file_id: i64,
        lease_token: &str,
        kind: FailureKind,
        message: &str,
        retryable: bool,
        max_attempts: i32,
    ) -> Result<Option<FileStatus>> {
        let result = sqlx::query(
            "UPDATE files SET
                status = CASE WHEN ?4 AND attempt_count < ?5 THEN 'pending' ELSE 'failed' END,
                pending_since = CASE WHEN ?4 AND attempt_count < ?5
                                     THEN CURRENT_TIMESTAMP ELSE pending_since END,
                assigned_worker_id = NULL, assigned_at = NULL, lease_token = NULL,
                last_error_kind = ?2, last_error_message = ?3,
                error_at = CURRENT_TIMESTAMP, updated_at = CURRENT_TIMESTAMP
             WHERE id = ?1 AND lease_token = ?6 AND status IN ('assigned', 'processing')
             RETURNING status",
        )
        .bind(file_id)
        .bind(kind.as_str())
        .bind(message)
        .bind(retryable)
        .bind(max_attempts)
        .bind(lease_token)
        .fetch_optional(&self.pool)
        .await?;

        Ok(result.map(|row| row.get("status")))
    }

    /// Terminal skip. Workers pass their lease; operator skips pass none
    /// and apply to any non-terminal record.
    pub async fn record_skip(
        &self,
        file_id: i64,
        lease_token: Option<&str>,
        reason: SkipReason,
    ) -> Result<bool> {
        let result = match lease_token {
            Some(lease) => {
                sqlx::query(
                    "UPDATE files SET status = 'skipped', skip_reason = ?,
                        assigned_worker_id = NULL, assigned_at = NULL, lease_token = NULL,
                        updated_at = CURRENT_TIMESTAMP
                     WHERE id = ? AND lease_token = ? AND status IN ('assigned', 'processing')",
                )
                .bind(reason.as_str())
                .bind(file_id)
                .bind(lease)
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "UPDATE files SET status = 'skipped', skip_reason = ?,
                        assigned_worker_id = NULL, assigned_at = NULL, lease_token = NULL,
                        updated_at = CURRENT_TIMESTAMP
                     WHERE id = ? AND status IN ('pending', 'assigned', 'processing', 'failed')",
                )
                .bind(reason.as_str())
                .bind(file_id)
                .execute(&self.pool)
                .await?
            }
        };

        Ok(result.rows_affected() > 0)
    }

    /// Reclaim the assignment of an offline worker. Guarded on the worker
    /// id so a racing completion from a revived worker cannot be undone.
    pub async fn reap_assignment(&self, file_id: i64, worker_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE files SET status = 'pending', assigned_worker_id = NULL,
                assigned_at = NULL, lease_token = NULL,
                pending_since = CURRENT_TIMESTAMP,
                last_error_kind = 'worker_offline', error_at = CURRENT_TIMESTAMP,
                updated_at = CURRENT_TIMESTAMP
             WHERE id = ? AND assigned_worker_id = ? AND status IN ('assigned', 'processing')",
        )
        .bind(file_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Processing records whose progress went silent. The sweeper fails
    /// them with `kind=stalled` (retryable).
    pub async fn find_stalled(&self, silence_timeout_s: u64) -> Result<Vec<FileRecord>> {
        let modifier = format!("-{} seconds", silence_timeout_s);
        let query = format!(
            "SELECT {FILE_COLUMNS} FROM files
             WHERE status = 'processing' AND last_progress_at <= datetime('now', ?)"
        );
        let records = sqlx::query_as::<_, FileRecord>(&query)
            .bind(&modifier)
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    pub async fn get_file(&self, id: i64) -> Result<Option<FileRecord>> {
        let query = format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?");
        let record = sqlx::query_as::<_, FileRecord>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    pub async fn set_priority(&self, id: i64, priority: i32) -> Result<()> {
        sqlx::query(
            "UPDATE files SET priority = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(priority)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_preferred_worker(&self, id: i64, worker_id: Option<&str>) -> Result<()> {
        sqlx::query(
            "UPDATE files SET preferred_worker_id = ?, updated_at = CURRENT_TIMESTAMP
             WHERE id = ?",
        )
        .bind(worker_id)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Operator reset: back to `pending` with a clean slate. Valid from any
    /// terminal state; in-flight records must be aborted first.
    pub async fn reset(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE files SET status = 'pending', attempt_count = 0,
                output_size_bytes = NULL, savings_bytes = NULL, savings_percent = NULL,
                last_error_kind = NULL, last_error_message = NULL, error_at = NULL,
                skip_reason = NULL, completed_at = NULL,
                pending_since = CURRENT_TIMESTAMP, updated_at = CURRENT_TIMESTAMP
             WHERE id = ? AND status IN ('completed', 'failed', 'skipped')",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn bulk_reset_failed(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE files SET status = 'pending', attempt_count = 0,
                last_error_kind = NULL, last_error_message = NULL, error_at = NULL,
                pending_since = CURRENT_TIMESTAMP, updated_at = CURRENT_TIMESTAMP
             WHERE status = 'failed'",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn bulk_delete_completed(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM files WHERE status = 'completed'")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let rows = sqlx::query(
            "SELECT status, count(*) as count, COALESCE(sum(size_bytes), 0) as bytes
             FROM files GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: FileStatus = row.get("status");
            let count: i64 = row.get("count");
            let bytes: i64 = row.get("bytes");
            stats.total_size_bytes += bytes;
            match status {
                FileStatus::Pending => stats.pending = count,
                FileStatus::Assigned => stats.assigned = count,
                FileStatus::Processing => stats.processing = count,
                FileStatus::Completed => stats.completed = count,
                FileStatus::Failed => stats.failed = count,
                FileStatus::Skipped => stats.skipped = count,
            }
        }

        let row = sqlx::query(
            "SELECT COALESCE(sum(output_size_bytes), 0) as out_bytes,
                    COALESCE(sum(savings_bytes), 0) as saved
             FROM files WHERE status = 'completed'",
        )
        .fetch_one(&self.pool)
        .await?;
        stats.total_output_bytes = row.get("out_bytes");
        stats.total_savings_bytes = row.get("saved");

        Ok(stats)
    }

    /// Consistent stats plus the most recently touched files, for the UI.
    pub async fn snapshot_for_ui(&self, top_n: i64) -> Result<Snapshot> {
        let stats = self.stats().await?;
        let query = format!(
            "SELECT {FILE_COLUMNS} FROM files ORDER BY updated_at DESC, id DESC LIMIT ?"
        );
        let files = sqlx::query_as::<_, FileRecord>(&query)
            .bind(top_n)
            .fetch_all(&self.pool)
            .await?;
        Ok(Snapshot { stats, files })
    }
}

fn split_path(path: &str) -> (String, String) {
    let p = Path::new(path);
    let directory = p
        .parent()
        .map(|d| d.to_string_lossy().into_owned())
        .unwrap_or_default();
    let filename = p
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    (directory, filename)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_path() {
        let (dir, name) = split_path("/media/shows/a.mkv");
        assert_eq!(dir, "/media/shows");
        assert_eq!(name, "a.mkv");
    }

    #[test]
    fn test_status_display() {
        assert_eq!(FileStatus::Pending.to_string(), "pending");
        assert_eq!(FileStatus::Skipped.to_string(), "skipped");
    }
}
