//! Tag velocity repository
//!
//! The `tag_velocity` table holds the per-tag admission caps the scheduler
//! consults. A tag with no row is unlimited.

use crate::db::Database;
use crate::error::{HubError, Result};
use crate::models::TagVelocity;
use std::collections::HashMap;
use std::sync::Arc;

/// Repository for tag velocity limits
#[derive(Clone, Debug)]
pub struct VelocityRepository {
    db: Arc<Database>,
}

impl VelocityRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Set (or replace) the cap for a tag.
    pub async fn set(&self, tag: &str, velocity_limit: i64) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO tag_velocity (tag, velocity_limit) VALUES (?, ?)")
            .bind(tag)
            .bind(velocity_limit)
            .execute(self.db.pool())
            .await
            .map_err(|e| HubError::Database(format!("failed to set tag velocity: {}", e)))?;
        Ok(())
    }

    /// Look up one tag's cap.
    pub async fn get(&self, tag: &str) -> Result<Option<i64>> {
        let row = sqlx::query_as::<_, TagVelocity>(
            "SELECT tag, velocity_limit FROM tag_velocity WHERE tag = ?",
        )
        .bind(tag)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| HubError::Database(format!("failed to load tag velocity: {}", e)))?;
        Ok(row.map(|r| r.velocity_limit))
    }

    /// All configured caps, fetched once per scheduling pass.
    pub async fn all(&self) -> Result<HashMap<String, i64>> {
        let rows = sqlx::query_as::<_, TagVelocity>("SELECT tag, velocity_limit FROM tag_velocity")
            .fetch_all(self.db.pool())
            .await
            .map_err(|e| HubError::Database(format!("failed to load tag velocities: {}", e)))?;
        Ok(rows.into_iter().map(|r| (r.tag, r.velocity_limit)).collect())
    }

    /// Remove a tag's cap, making it unlimited again.
    pub async fn remove(&self, tag: &str) -> Result<()> {
        sqlx::query("DELETE FROM tag_velocity WHERE tag = ?")
            .bind(tag)
            .execute(self.db.pool())
            .await
            .map_err(|e| HubError::Database(format!("failed to remove tag velocity: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_remove() {
        let db = Arc::new(Database::test_in_memory().await.unwrap());
        let repo = VelocityRepository::new(db);

        assert!(repo.get("reports").await.unwrap().is_none());

        repo.set("reports", 2).await.unwrap();
        assert_eq!(repo.get("reports").await.unwrap(), Some(2));

        repo.set("reports", 5).await.unwrap();
        assert_eq!(repo.get("reports").await.unwrap(), Some(5));

        repo.set("imports", 1).await.unwrap();
        let all = repo.all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all.get("imports"), Some(&1));

        repo.remove("reports").await.unwrap();
        assert!(repo.get("reports").await.unwrap().is_none());
    }
}
