//! Sequential event dispatcher.
//!
//! Events accepted by the HTTP listener are queued on an mpsc channel and
//! handled here one at a time, so two events for the same change never
//! race inside this process. An event that fails transiently is held back
//! and handled again after an exponentially growing delay.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use automerger_core::propagation::{EdgeState, PropagationReport};
use automerger_core::{Automerger, EventOutcome, ReviewEvent};

/// Aggregate counters, shared with the health endpoint.
pub struct DispatchStats {
    pub started_at: DateTime<Utc>,
    pub received: AtomicU64,
    pub processed: AtomicU64,
    pub ignored: AtomicU64,
    pub failed: AtomicU64,
    /// Failures that a redelivery of the event could fix.
    pub transient_failures: AtomicU64,
    pub redelivered: AtomicU64,
    /// Events dropped after their last redelivery failed too.
    pub abandoned: AtomicU64,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            received: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            ignored: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            transient_failures: AtomicU64::new(0),
            redelivered: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }
}

impl Default for DispatchStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounds on redelivering transiently failed events.
#[derive(Debug, Clone, Copy)]
pub struct Redelivery {
    /// Deliveries per event, the first included.
    pub attempts: u32,
    pub backoff: Duration,
}

impl Redelivery {
    /// Longest wait between two deliveries.
    const MAX_DELAY: Duration = Duration::from_secs(300);

    /// Delay after the failed delivery number `attempt`.
    fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.backoff.saturating_mul(factor).min(Self::MAX_DELAY)
    }
}

impl Default for Redelivery {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_secs(2),
        }
    }
}

/// An event waiting for its next delivery.
struct Pending {
    due: Instant,
    attempt: u32,
    event: ReviewEvent,
}

pub struct Dispatcher {
    automerger: Arc<Automerger>,
    rx: mpsc::Receiver<ReviewEvent>,
    stats: Arc<DispatchStats>,
    redelivery: Redelivery,
    pending: Vec<Pending>,
}

impl Dispatcher {
    pub fn new(
        automerger: Arc<Automerger>,
        rx: mpsc::Receiver<ReviewEvent>,
        stats: Arc<DispatchStats>,
    ) -> Self {
        Self {
            automerger,
            rx,
            stats,
            redelivery: Redelivery::default(),
            pending: Vec::new(),
        }
    }

    pub fn with_redelivery(mut self, redelivery: Redelivery) -> Self {
        self.redelivery = redelivery;
        self
    }

    /// Handle queued and redelivered events until `shutdown` fires, or the
    /// queue closes and nothing is waiting for redelivery.
    ///
    /// An event in progress when shutdown is requested runs to completion.
    pub async fn run(&mut self, shutdown: Arc<Notify>) {
        info!("dispatcher started");
        let stop = shutdown.notified();
        tokio::pin!(stop);
        let mut open = true;

        loop {
            let next_due = self.pending.iter().map(|p| p.due).min();
            if !open && next_due.is_none() {
                info!("event queue closed");
                break;
            }

            tokio::select! {
                biased;
                _ = &mut stop => {
                    info!(pending = self.pending.len(), "dispatcher stopping");
                    break;
                }
                _ = sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                    if let Some(pending) = self.take_due() {
                        self.stats.redelivered.fetch_add(1, Ordering::SeqCst);
                        self.dispatch(pending.event, pending.attempt).await;
                    }
                }
                next = self.rx.recv(), if open => match next {
                    Some(event) => self.dispatch(event, 1).await,
                    None => open = false,
                },
            }
        }
    }

    /// Remove the earliest pending event whose delay has passed.
    fn take_due(&mut self) -> Option<Pending> {
        let now = Instant::now();
        let index = self
            .pending
            .iter()
            .enumerate()
            .filter(|(_, p)| p.due <= now)
            .min_by_key(|(_, p)| p.due)
            .map(|(i, _)| i)?;
        Some(self.pending.swap_remove(index))
    }

    async fn dispatch(&mut self, event: ReviewEvent, attempt: u32) {
        let seq = self.stats.processed.fetch_add(1, Ordering::SeqCst) + 1;
        let kind = event.kind();
        let change = event.change().map(|c| c.number);

        let transient = match self.automerger.handle_event(&event).await {
            Ok(EventOutcome::Propagated(report)) => {
                log_report(seq, &report);
                report.is_transient_failure()
            }
            Ok(EventOutcome::Ignored(reason)) => {
                self.stats.ignored.fetch_add(1, Ordering::SeqCst);
                debug!(seq, kind, ?change, reason, "event ignored");
                false
            }
            Ok(outcome) => {
                info!(seq, kind, ?change, %outcome, "event processed");
                false
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::SeqCst);
                if e.is_transient() {
                    warn!(seq, kind, ?change, attempt, error = %e, "event failed");
                } else {
                    error!(seq, kind, ?change, error = %e, "event failed");
                }
                e.is_transient()
            }
        };

        if transient {
            self.stats.transient_failures.fetch_add(1, Ordering::SeqCst);
            self.redeliver(event, attempt);
        }
    }

    fn redeliver(&mut self, event: ReviewEvent, attempt: u32) {
        let kind = event.kind();
        let change = event.change().map(|c| c.number);
        if attempt >= self.redelivery.attempts {
            self.stats.abandoned.fetch_add(1, Ordering::SeqCst);
            error!(kind, ?change, attempts = attempt, "giving up on event");
            return;
        }

        let delay = self.redelivery.delay(attempt);
        info!(kind, ?change, attempt, delay_ms = delay.as_millis() as u64, "event will be redelivered");
        self.pending.push(Pending {
            due: Instant::now() + delay,
            attempt: attempt + 1,
            event,
        });
    }
}

fn log_report(seq: u64, report: &PropagationReport) {
    let count = |state: EdgeState| report.edges.iter().filter(|e| e.state == state).count();
    info!(
        seq,
        change = report.source,
        topic = report.topic.as_deref().unwrap_or(""),
        created = count(EdgeState::Created),
        updated = count(EdgeState::Updated),
        unchanged = count(EdgeState::Unchanged),
        conflicted = count(EdgeState::Conflicted),
        failed = count(EdgeState::Failed),
        votes = report.votes_mirrored,
        "propagation finished"
    );
    for edge in report.failed() {
        warn!(
            seq,
            dest = %edge.dest_branch,
            error = edge.error.as_deref().unwrap_or("unknown"),
            "edge failed"
        );
    }
}
