//! Tag-velocity governor
//!
//! Process-local leaky bucket: the scheduler increments a per-tag counter on
//! every admission, and a background ticker decrements every counter once
//! per second (floored at zero). A tag with `velocity_limit = V` therefore
//! admits at most V concurrent leases plus roughly V/second sustained.
//! Counters are ephemeral; a hub restart resets them.

use crate::shutdown::ShutdownCoordinator;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Interval between decrement sweeps.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Owns the in-memory tag usage counters.
#[derive(Debug, Default)]
pub struct TagGovernor {
    usage: Mutex<HashMap<String, u32>>,
}

impl TagGovernor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to admit one step carrying `tag` under `limit`.
    ///
    /// Admission increments the tag's counter even when no limit is
    /// configured, so a limit added later sees current usage.
    pub fn admit(&self, tag: &str, limit: Option<i64>) -> bool {
        let mut usage = self.usage.lock();
        let count = usage.entry(tag.to_string()).or_insert(0);
        if let Some(limit) = limit {
            if i64::from(*count) >= limit {
                return false;
            }
        }
        *count += 1;
        true
    }

    /// One governor tick: decrement every counter by one, dropping tags
    /// that reach zero.
    pub fn release_all(&self) {
        let mut usage = self.usage.lock();
        usage.retain(|_, count| {
            *count -= 1;
            *count > 0
        });
    }

    /// Current in-flight count for `tag`.
    pub fn usage(&self, tag: &str) -> u32 {
        self.usage.lock().get(tag).copied().unwrap_or(0)
    }

    /// Spawn the background decrement loop. Stops when `shutdown` fires.
    pub fn spawn_ticker(
        self: &Arc<Self>,
        shutdown: ShutdownCoordinator,
    ) -> tokio::task::JoinHandle<()> {
        let governor = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            // The first tick of a tokio interval fires immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => governor.release_all(),
                    _ = shutdown.wait() => {
                        debug!("tag governor ticker stopping");
                        return;
                    }
                }
            }
        })
    }
}
