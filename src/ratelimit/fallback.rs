//! In-process fallback counters.
//!
//! Used only when the distributed store cannot be reached. Entries are
//! process-local, so two replicas using their own tables each grant the full
//! limit.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::clock::{Clock, SystemClock};

/// Counter state for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitEntry {
    pub count: u64,
    /// Absolute end of the window, in milliseconds since the Unix epoch
    pub reset_at_ms: u64,
}

/// Result of a fallback increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackCount {
    pub count: u64,
    pub remaining: u64,
    pub reset_at_ms: u64,
}

/// Fixed-window counters kept in process memory.
pub struct FallbackTable {
    entries: DashMap<String, RateLimitEntry>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for FallbackTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackTable")
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl Default for FallbackTable {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl FallbackTable {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Count a request against `key`.
    ///
    /// A missing or expired entry starts a fresh window. The read-modify-write
    /// runs under the entry's shard lock, so concurrent callers on the same
    /// key are serialized.
    pub fn increment(&self, key: &str, window: Duration, limit: u64) -> FallbackCount {
        let now = self.clock.now_ms();
        let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        let reset_at_ms = now.saturating_add(window_ms);

        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert(RateLimitEntry {
                count: 0,
                reset_at_ms,
            });

        if entry.reset_at_ms <= now {
            *entry = RateLimitEntry {
                count: 0,
                reset_at_ms,
            };
        }

        entry.count += 1;

        FallbackCount {
            count: entry.count,
            remaining: limit.saturating_sub(entry.count),
            reset_at_ms: entry.reset_at_ms,
        }
    }

    /// Remove every entry whose window has ended. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.reset_at_ms > now);
        before.saturating_sub(self.entries.len())
    }

    /// Current entry for `key`, if any.
    pub fn get(&self, key: &str) -> Option<RateLimitEntry> {
        self.entries.get(key).map(|e| *e)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Background task that periodically sweeps a [`FallbackTable`].
///
/// Dropping the handle aborts the task; [`FallbackSweeper::shutdown`] stops it
/// and waits for it to finish.
pub struct FallbackSweeper {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl FallbackSweeper {
    /// Spawn the sweep loop on the current tokio runtime.
    pub fn start(table: Arc<FallbackTable>, interval: Duration) -> Self {
        let (tx, mut rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    _ = ticker.tick() => {
                        let removed = table.sweep();
                        debug!(removed = removed, remaining = table.len(), "Swept fallback rate limit table");
                    }
                }
            }
        });

        info!(interval_secs = interval.as_secs(), "Fallback table sweeper started");

        Self {
            shutdown: Some(tx),
            task: Some(task),
        }
    }

    /// Stop the sweep loop and wait for it to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        info!("Fallback table sweeper stopped");
    }
}

impl Drop for FallbackSweeper {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
