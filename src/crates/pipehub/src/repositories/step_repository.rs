//! Step repository for metadata store operations
//!
//! Every query binds its parameters; the only strings ever spliced into SQL
//! are placeholder lists sized to the inputs.

use crate::db::Database;
use crate::error::{HubError, Result};
use crate::models::{StepRow, StepStatus};
use sqlx::Row;
use std::collections::HashMap;
use std::sync::Arc;

const ROW_COLUMNS: &str = "id, priority, scope, velocity, tag, status, epoch, msg, trace";

/// Characters an exclude substring may keep; everything else is dropped
/// before the value is bound into a LIKE pattern.
const EXCLUDE_WHITELIST: &str = " _-.,:/()[]{}'\"";

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Sanitize one `fetch-errors` exclude substring. Returns `None` when
/// nothing usable remains.
pub fn sanitize_exclude(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || EXCLUDE_WHITELIST.contains(*c))
        .collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Repository for step row operations
#[derive(Clone, Debug)]
pub struct StepRepository {
    db: Arc<Database>,
}

impl StepRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a step row. Re-inserting the same id overwrites the row, so a
    /// replayed upload is a no-op.
    pub async fn insert(&self, row: &StepRow) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO steps (id, priority, scope, velocity, tag, status, epoch, msg, trace)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.id)
        .bind(row.priority)
        .bind(&row.scope)
        .bind(row.velocity)
        .bind(&row.tag)
        .bind(row.status)
        .bind(row.epoch)
        .bind(&row.msg)
        .bind(&row.trace)
        .execute(self.db.pool())
        .await
        .map_err(|e| HubError::Database(format!("failed to insert step: {}", e)))?;

        Ok(())
    }

    /// Load one row by id.
    pub async fn find_by_id(&self, id: &str) -> Result<Option<StepRow>> {
        let row = sqlx::query_as::<_, StepRow>(&format!(
            "SELECT {} FROM steps WHERE id = ?",
            ROW_COLUMNS
        ))
        .bind(id)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| HubError::Database(format!("failed to load step: {}", e)))?;

        Ok(row)
    }

    /// Load several rows by id, in the stored order of the id list.
    pub async fn find_many(&self, ids: &[String]) -> Result<Vec<StepRow>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM steps WHERE id IN ({})",
            ROW_COLUMNS,
            placeholders(ids.len())
        );
        let mut query = sqlx::query_as::<_, StepRow>(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let mut rows = query
            .fetch_all(self.db.pool())
            .await
            .map_err(|e| HubError::Database(format!("failed to load steps: {}", e)))?;

        let order: HashMap<&str, usize> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        rows.sort_by_key(|r| order.get(r.id.as_str()).copied().unwrap_or(usize::MAX));
        Ok(rows)
    }

    /// Absolute status transition for one row.
    pub async fn set_status(&self, id: &str, status: StepStatus, epoch: i64) -> Result<()> {
        sqlx::query("UPDATE steps SET status = ?, epoch = ?, msg = '', trace = '' WHERE id = ?")
            .bind(status.as_i64())
            .bind(epoch)
            .bind(id)
            .execute(self.db.pool())
            .await
            .map_err(|e| HubError::Database(format!("failed to update step status: {}", e)))?;

        Ok(())
    }

    /// Record a worker failure with its message and stack trace.
    pub async fn set_error(&self, id: &str, epoch: i64, msg: &str, trace: &str) -> Result<()> {
        sqlx::query("UPDATE steps SET status = ?, epoch = ?, msg = ?, trace = ? WHERE id = ?")
            .bind(StepStatus::Error.as_i64())
            .bind(epoch)
            .bind(msg)
            .bind(trace)
            .bind(id)
            .execute(self.db.pool())
            .await
            .map_err(|e| HubError::Database(format!("failed to record step error: {}", e)))?;

        Ok(())
    }

    /// Batched status transition (child promotion, cancel/reset sweeps).
    pub async fn set_status_many(
        &self,
        ids: &[String],
        status: StepStatus,
        epoch: i64,
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "UPDATE steps SET status = ?, epoch = ?, msg = '', trace = '' WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&sql).bind(status.as_i64()).bind(epoch);
        for id in ids {
            query = query.bind(id);
        }
        query
            .execute(self.db.pool())
            .await
            .map_err(|e| HubError::Database(format!("failed to update step batch: {}", e)))?;

        Ok(())
    }

    /// One page of scheduler candidates.
    ///
    /// Scopes are an unordered filter; ranking is `priority DESC, epoch
    /// ASC` (priority ascending when `reverse`). Stale `working` rows are
    /// included when `include_working` and their lease epoch is older than
    /// `stale_before`.
    #[allow(clippy::too_many_arguments)]
    pub async fn candidates(
        &self,
        scopes: &[String],
        status: StepStatus,
        include_working: bool,
        stale_before: i64,
        reverse: bool,
        chunk_size: usize,
        offset: usize,
    ) -> Result<Vec<StepRow>> {
        if scopes.is_empty() {
            return Ok(Vec::new());
        }

        let mut sql = format!(
            "SELECT {} FROM steps WHERE scope IN ({}) AND (status = ?",
            ROW_COLUMNS,
            placeholders(scopes.len())
        );
        if include_working {
            sql.push_str(" OR (status = ? AND epoch < ?)");
        }
        sql.push_str(&format!(
            ") ORDER BY priority {}, epoch ASC LIMIT ? OFFSET ?",
            if reverse { "ASC" } else { "DESC" }
        ));

        let mut query = sqlx::query_as::<_, StepRow>(&sql);
        for scope in scopes {
            query = query.bind(scope);
        }
        query = query.bind(status.as_i64());
        if include_working {
            query = query.bind(StepStatus::Working.as_i64()).bind(stale_before);
        }
        let rows = query
            .bind(chunk_size as i64)
            .bind(offset as i64)
            .fetch_all(self.db.pool())
            .await
            .map_err(|e| HubError::Database(format!("failed to scan candidates: {}", e)))?;

        Ok(rows)
    }

    /// Lease the selected rows: one batched UPDATE to `working`.
    pub async fn lease(&self, ids: &[String], epoch: i64) -> Result<()> {
        self.set_status_many(ids, StepStatus::Working, epoch).await
    }

    /// Grouped counts by status name. Excludes the terminal `success` and
    /// `cancel` groups unless `all`.
    pub async fn count_by_status(&self, all: bool) -> Result<HashMap<String, i64>> {
        let sql = if all {
            "SELECT status, COUNT(*) as count FROM steps GROUP BY status"
        } else {
            "SELECT status, COUNT(*) as count FROM steps WHERE status NOT IN (?, ?) GROUP BY status"
        };

        let mut query = sqlx::query(sql);
        if !all {
            query = query
                .bind(StepStatus::Success.as_i64())
                .bind(StepStatus::Cancel.as_i64());
        }
        let rows = query
            .fetch_all(self.db.pool())
            .await
            .map_err(|e| HubError::Database(format!("failed to count steps: {}", e)))?;

        let mut counts = HashMap::new();
        for row in rows {
            let status: i64 = row.get("status");
            let count: i64 = row.get("count");
            counts.insert(StepStatus::name_of(status).to_string(), count);
        }
        Ok(counts)
    }

    /// Total number of rows.
    pub async fn count_all(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM steps")
            .fetch_one(self.db.pool())
            .await
            .map_err(|e| HubError::Database(format!("failed to count steps: {}", e)))?;
        Ok(count)
    }

    fn error_filter_sql(excludes: &[String]) -> String {
        let mut sql = String::from("status = ?");
        for _ in excludes {
            sql.push_str(" AND NOT (LOWER(msg) LIKE ? OR LOWER(trace) LIKE ?)");
        }
        sql
    }

    /// Rows in `error`, newest first, skipping rows whose msg or trace
    /// contains any exclude substring (already sanitized, matched
    /// case-insensitively).
    pub async fn errors(&self, limit: usize, excludes: &[String]) -> Result<Vec<StepRow>> {
        let sql = format!(
            "SELECT {} FROM steps WHERE {} ORDER BY epoch DESC LIMIT ?",
            ROW_COLUMNS,
            Self::error_filter_sql(excludes)
        );
        let mut query = sqlx::query_as::<_, StepRow>(&sql).bind(StepStatus::Error.as_i64());
        for exclude in excludes {
            let pattern = format!("%{}%", exclude.to_lowercase());
            query = query.bind(pattern.clone()).bind(pattern);
        }
        let rows = query
            .bind(limit as i64)
            .fetch_all(self.db.pool())
            .await
            .map_err(|e| HubError::Database(format!("failed to fetch errors: {}", e)))?;
        Ok(rows)
    }

    /// Total error rows surviving the exclude filter.
    pub async fn errors_total(&self, excludes: &[String]) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(*) as count FROM steps WHERE {}",
            Self::error_filter_sql(excludes)
        );
        let mut query = sqlx::query(&sql).bind(StepStatus::Error.as_i64());
        for exclude in excludes {
            let pattern = format!("%{}%", exclude.to_lowercase());
            query = query.bind(pattern.clone()).bind(pattern);
        }
        let row = query
            .fetch_one(self.db.pool())
            .await
            .map_err(|e| HubError::Database(format!("failed to count errors: {}", e)))?;
        Ok(row.get("count"))
    }

    /// Move every `error` row (and optionally `working` rows) back to
    /// `pending`.
    pub async fn reset_errors(&self, include_working: bool, epoch: i64) -> Result<u64> {
        let sql = if include_working {
            "UPDATE steps SET status = ?, epoch = ?, msg = '', trace = '' WHERE status IN (?, ?)"
        } else {
            "UPDATE steps SET status = ?, epoch = ?, msg = '', trace = '' WHERE status = ?"
        };
        let mut query = sqlx::query(sql)
            .bind(StepStatus::Pending.as_i64())
            .bind(epoch)
            .bind(StepStatus::Error.as_i64());
        if include_working {
            query = query.bind(StepStatus::Working.as_i64());
        }
        let result = query
            .execute(self.db.pool())
            .await
            .map_err(|e| HubError::Database(format!("failed to reset errors: {}", e)))?;
        Ok(result.rows_affected())
    }

    /// Status of each listed id (ids with no row are absent from the map).
    pub async fn statuses_of(&self, ids: &[String]) -> Result<HashMap<String, i64>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let sql = format!(
            "SELECT id, status FROM steps WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let rows = query
            .fetch_all(self.db.pool())
            .await
            .map_err(|e| HubError::Database(format!("failed to load statuses: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get::<String, _>("id"), row.get::<i64, _>("status")))
            .collect())
    }

    /// Administrative wipe of every row. Returns the number removed.
    pub async fn delete_all(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM steps")
            .execute(self.db.pool())
            .await
            .map_err(|e| HubError::Database(format!("failed to delete steps: {}", e)))?;
        Ok(result.rows_affected())
    }
}
