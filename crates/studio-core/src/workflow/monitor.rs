//! Heartbeat watchdog with auto-resume.
//!
//! Every `monitor_scan_secs` (default 30 s) the monitor scans persisted
//! threads still marked `running`. A thread whose heartbeat is older than
//! `heartbeat_stale_secs` (default 120 s) *and* that has no live worker in
//! this process is presumed orphaned by a crash; the monitor re-invokes it
//! through the resume callback, up to `max_resume_attempts` (default 3)
//! times. A successful recovery clears the attempt counter; a failed one
//! leaves it so a later scan retries.

use std::sync::Arc;

use chrono::{Duration, Utc};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use studio_types::config::EngineConfig;
use studio_types::workflow::ThreadStatus;

use crate::repository::workflow::{ThreadFilter, WorkflowStateStore};

use super::registry::WorkflowRegistry;

/// Callback invoked to resume a stale thread. Returns `true` on successful
/// recovery.
pub type ResumeFn = Arc<dyn Fn(String) -> BoxFuture<'static, bool> + Send + Sync>;

/// Heartbeat watchdog for workflow threads.
pub struct WorkflowMonitor<S: WorkflowStateStore> {
    store: Arc<S>,
    registry: Arc<WorkflowRegistry<S>>,
    config: EngineConfig,
    /// Resume attempts per thread since its last successful recovery.
    attempts: DashMap<String, u32>,
}

impl<S: WorkflowStateStore + 'static> WorkflowMonitor<S> {
    pub fn new(store: Arc<S>, registry: Arc<WorkflowRegistry<S>>, config: EngineConfig) -> Self {
        Self { store, registry, config, attempts: DashMap::new() }
    }

    /// Run one scan pass. Returns the thread ids a resume was attempted for.
    ///
    /// Exposed separately from [`WorkflowMonitor::run`] so tests can drive
    /// scans without waiting on the interval clock.
    pub async fn scan_once(&self, resume: &ResumeFn) -> Vec<String> {
        let filter = ThreadFilter { project_id: None, status: Some(ThreadStatus::Running) };
        let threads = match self.store.list(&filter).await {
            Ok(threads) => threads,
            Err(e) => {
                tracing::warn!(error = %e, "monitor scan failed to list threads");
                return Vec::new();
            }
        };

        let stale_cutoff =
            Utc::now() - Duration::seconds(self.config.heartbeat_stale_secs as i64);
        let mut resumed = Vec::new();

        for summary in threads {
            if summary.last_update > stale_cutoff {
                continue;
            }
            if self.registry.is_active(&summary.thread_id) {
                // A live worker just has a long-running step; not stale.
                continue;
            }

            let attempts = self.attempts.get(&summary.thread_id).map(|a| *a).unwrap_or(0);
            if attempts >= self.config.max_resume_attempts {
                tracing::warn!(
                    thread_id = summary.thread_id.as_str(),
                    attempts,
                    "giving up on stale thread"
                );
                continue;
            }
            self.attempts.insert(summary.thread_id.clone(), attempts + 1);

            tracing::info!(
                thread_id = summary.thread_id.as_str(),
                attempt = attempts + 1,
                "resuming stale thread"
            );

            let recovered = resume(summary.thread_id.clone()).await;
            if recovered {
                self.attempts.remove(&summary.thread_id);
            }
            resumed.push(summary.thread_id);
        }

        resumed
    }

    /// Run the scan loop until the process shuts down.
    pub fn run(self: Arc<Self>, resume: ResumeFn) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
                self.config.monitor_scan_secs.max(1),
            ));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.scan_once(&resume).await;
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
