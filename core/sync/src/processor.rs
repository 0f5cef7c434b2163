//! Replay of queued mutations.
//!
//! A pass takes a snapshot of the queue and replays each entry once, in
//! insertion order. An entry is removed only when the network confirms it
//! with a 2xx status; anything else leaves it queued for a later pass (or
//! moves it to dead letters, per the [`RetryPolicy`]). Mutations enqueued
//! while a pass runs wait for the next one.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use harbor_common::{Error, Result};
use harbor_net::Fetcher;

use crate::queue::{QueuedMutation, ReplayRecord, SyncQueue};
use crate::retry::{FailureAction, RetryPolicy};

/// Default upper bound on a single replay.
pub const DEFAULT_REPLAY_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of one replay pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassReport {
    /// Confirmed and removed from the queue.
    pub replayed: usize,
    /// Failed and kept for a later pass.
    pub failed: usize,
    /// Not attempted because their backoff has not elapsed.
    pub skipped: usize,
    /// Moved to dead letters.
    pub dead_lettered: usize,
    pub duration: Duration,
}

impl PassReport {
    /// Entries in the snapshot.
    pub fn total(&self) -> usize {
        self.replayed + self.failed + self.skipped + self.dead_lettered
    }
}

/// Clears the running flag when a pass ends, however it ends.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Replays queued mutations against the network.
pub struct SyncProcessor {
    queue: SyncQueue,
    fetcher: Arc<dyn Fetcher>,
    policy: RetryPolicy,
    replay_timeout: Duration,
    running: AtomicBool,
}

impl SyncProcessor {
    /// Create a processor with the default policy and timeout.
    pub fn new(queue: SyncQueue, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            queue,
            fetcher,
            policy: RetryPolicy::default(),
            replay_timeout: DEFAULT_REPLAY_TIMEOUT,
            running: AtomicBool::new(false),
        }
    }

    /// Set the retry policy.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the per-replay timeout.
    pub fn with_replay_timeout(mut self, timeout: Duration) -> Self {
        self.replay_timeout = timeout;
        self
    }

    /// The queue this processor drains.
    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    /// Whether a pass is in flight.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run one replay pass.
    ///
    /// Returns `None` without doing anything if a pass is already running.
    pub async fn run_pass(&self) -> Option<PassReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Replay pass already running, trigger ignored");
            return None;
        }
        let _guard = PassGuard(&self.running);

        Some(self.replay_snapshot().await)
    }

    async fn replay_snapshot(&self) -> PassReport {
        let start = Instant::now();
        let mut report = PassReport::default();

        let snapshot = self.queue.list_all().await;
        if snapshot.is_empty() {
            debug!("Mutation queue empty, nothing to replay");
            report.duration = start.elapsed();
            return report;
        }

        let records = self.replay_records().await;
        let now = Utc::now();
        info!("Replaying {} queued mutations", snapshot.len());

        for mutation in &snapshot {
            let record = records.get(&mutation.id);
            if let Some(record) = record {
                if record.next_attempt_at > now {
                    debug!(
                        "Mutation #{} backing off until {}",
                        mutation.id, record.next_attempt_at
                    );
                    report.skipped += 1;
                    continue;
                }
            }

            match self.replay(mutation).await {
                Ok(()) => {
                    self.queue.remove(mutation.id).await;
                    report.replayed += 1;
                }
                Err(e) => {
                    let attempts = record.map_or(0, |r| r.attempts) + 1;
                    if self.handle_failure(mutation, attempts, &e).await {
                        report.dead_lettered += 1;
                    } else {
                        report.failed += 1;
                    }
                }
            }
        }

        report.duration = start.elapsed();
        info!(
            "Replay pass completed in {:?}: {} replayed, {} failed, {} skipped, {} dead-lettered",
            report.duration, report.replayed, report.failed, report.skipped, report.dead_lettered
        );
        report
    }

    async fn replay_records(&self) -> HashMap<i64, ReplayRecord> {
        match self.queue.store().replay_records().await {
            Ok(records) => records,
            Err(e) => {
                // Without bookkeeping every entry is treated as eligible.
                warn!("Failed to read replay records: {}", e);
                HashMap::new()
            }
        }
    }

    /// Send one mutation. `Ok` only for a 2xx answer.
    async fn replay(&self, mutation: &QueuedMutation) -> Result<()> {
        let request = mutation.to_request()?;
        debug!("Replaying #{}: {} {}", mutation.id, mutation.method, mutation.url);

        let response = self
            .fetcher
            .fetch_within(&request, self.replay_timeout)
            .await?;

        if response.is_success() {
            Ok(())
        } else {
            Err(Error::Http {
                status: response.status.as_u16(),
                url: mutation.url.clone(),
            })
        }
    }

    /// Apply the retry policy. Returns whether the entry was dead-lettered.
    async fn handle_failure(&self, mutation: &QueuedMutation, attempts: u32, err: &Error) -> bool {
        match self.policy.on_failure(attempts, err) {
            FailureAction::Retry { after } => {
                warn!(
                    "Replay of #{} failed (attempt {}): {}. Next try in {:?}",
                    mutation.id, attempts, err, after
                );
                let next = chrono::Duration::from_std(after)
                    .ok()
                    .and_then(|d| Utc::now().checked_add_signed(d))
                    .unwrap_or_else(Utc::now);
                if let Err(e) = self
                    .queue
                    .store()
                    .record_failure(mutation.id, attempts, next, &err.to_string())
                    .await
                {
                    warn!("Failed to record replay attempt for #{}: {}", mutation.id, e);
                }
                false
            }
            FailureAction::DeadLetter { reason } => {
                warn!("Dead-lettering #{}: {}", mutation.id, reason);
                match self.queue.store().dead_letter(mutation.id, attempts, &reason).await {
                    Ok(_) => true,
                    Err(e) => {
                        error!("Failed to dead-letter #{}: {}", mutation.id, e);
                        false
                    }
                }
            }
        }
    }
}
