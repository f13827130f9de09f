//! Step scheduler
//!
//! Selects the next runnable steps for a worker's scope set and leases them.
//! Ranking is priority first, then epoch for FIFO fairness; tag admission
//! runs per candidate against the governor so throttled tags are skipped
//! rather than blocking the scan.

use crate::error::Result;
use crate::governor::TagGovernor;
use crate::models::{now_epoch, StepStatus, LEASE_SECONDS};
use crate::repositories::{StepRepository, VelocityRepository};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

fn default_limit() -> usize {
    1
}

fn default_chunk_size() -> usize {
    100
}

fn default_status() -> i64 {
    StepStatus::Pending.as_i64()
}

fn default_include_working() -> bool {
    true
}

/// Options object of a `get-steps` request. Absent fields take the wire
/// defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct GetStepsOptions {
    /// Maximum number of ids to lease
    #[serde(default = "default_limit")]
    pub limit: usize,

    /// Candidate scan page size
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Requested status (integer encoding)
    #[serde(default = "default_status")]
    pub status: i64,

    /// Also reclaim `working` rows whose lease has expired
    #[serde(default = "default_include_working")]
    pub include_working: bool,

    /// Flip priority ordering to lowest-first
    #[serde(default)]
    pub reverse: bool,
}

impl Default for GetStepsOptions {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            chunk_size: default_chunk_size(),
            status: default_status(),
            include_working: default_include_working(),
            reverse: false,
        }
    }
}

/// Ranks, admits, and leases steps.
#[derive(Clone)]
pub struct Scheduler {
    steps: StepRepository,
    velocities: VelocityRepository,
    governor: Arc<TagGovernor>,
}

impl Scheduler {
    pub fn new(
        steps: StepRepository,
        velocities: VelocityRepository,
        governor: Arc<TagGovernor>,
    ) -> Self {
        Self {
            steps,
            velocities,
            governor,
        }
    }

    /// Select up to `limit` runnable steps for the scope set and lease them
    /// as `working`.
    ///
    /// The caller (the request processor) runs these calls one at a time,
    /// so a leased id is `working` before the next `get-steps` scans.
    pub async fn get_steps(
        &self,
        scopes: &[String],
        options: &GetStepsOptions,
    ) -> Result<Vec<String>> {
        if scopes.is_empty() || options.limit == 0 {
            return Ok(Vec::new());
        }
        let status = StepStatus::from_i64(options.status).unwrap_or(StepStatus::Pending);
        let chunk_size = options.chunk_size.max(1);

        let limits = self.velocities.all().await?;
        let now = now_epoch();
        let stale_before = now - LEASE_SECONDS;

        let mut picked: Vec<String> = Vec::with_capacity(options.limit);
        let mut offset = 0usize;

        'scan: loop {
            let page = self
                .steps
                .candidates(
                    scopes,
                    status,
                    options.include_working,
                    stale_before,
                    options.reverse,
                    chunk_size,
                    offset,
                )
                .await?;
            if page.is_empty() {
                break;
            }
            offset += page.len();

            for row in page {
                let limit = limits.get(&row.tag).copied();
                if !self.governor.admit(&row.tag, limit) {
                    debug!(step = %row.id, tag = %row.tag, "tag at velocity limit, skipping");
                    continue;
                }
                picked.push(row.id);
                if picked.len() == options.limit {
                    break 'scan;
                }
            }
        }

        if !picked.is_empty() {
            self.steps.lease(&picked, now).await?;
            debug!(count = picked.len(), "leased steps");
        }
        Ok(picked)
    }
}
