//! Job admission under concurrency and weight ceilings.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::job::Job;
use crate::{LimiterConfig, LimiterError};

/// Admits and paces concurrent weighted jobs.
///
/// Admission is ticket-FIFO: callers are served in arrival order and are
/// never rejected, only delayed. A job is admissible when both ceilings
/// allow it; a job heavier than the weight ceiling is still admitted once
/// nothing else is active, so oversized work cannot starve forever.
///
/// The weight ceiling is therefore a strict bound only while every
/// active job individually fits under it: a lone oversized job runs
/// with `active_weight` above the ceiling, and nothing else is admitted
/// beside it until it releases.
pub struct Limiter {
    shared: Arc<Shared>,
}

/// Snapshot of a limiter's current accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterStats {
    /// Currently admitted jobs.
    pub active_jobs: usize,
    /// Callers waiting for admission.
    pub queued: usize,
    /// Sum of admitted jobs' weights (expected sizes).
    pub active_weight: u64,
}

#[derive(Debug)]
pub(crate) struct Shared {
    name: String,
    max_jobs: usize,
    max_weight: Option<u64>,
    max_throughput: Option<u64>,
    state: Mutex<State>,
    pacer: Mutex<Pacer>,
    notify: Notify,
}

#[derive(Debug)]
struct State {
    next_ticket: u64,
    queue: VecDeque<u64>,
    active_jobs: usize,
    active_weight: u64,
    next_job_id: u64,
}

/// Token bucket replenished by wall time, drained by reported bytes.
#[derive(Debug)]
struct Pacer {
    budget: f64,
    last_refill: tokio::time::Instant,
}

impl Limiter {
    /// Creates a limiter from an injected configuration.
    pub fn new(config: LimiterConfig) -> Self {
        assert!(config.max_concurrent_jobs > 0, "job ceiling must be nonzero");
        Self {
            shared: Arc::new(Shared {
                name: config.name,
                max_jobs: config.max_concurrent_jobs,
                max_weight: config.max_active_weight,
                max_throughput: config.max_throughput,
                state: Mutex::new(State {
                    next_ticket: 0,
                    queue: VecDeque::new(),
                    active_jobs: 0,
                    active_weight: 0,
                    next_job_id: 0,
                }),
                pacer: Mutex::new(Pacer {
                    budget: 0.0,
                    last_refill: tokio::time::Instant::now(),
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Waits until admitting a job of `expected_size` would not exceed
    /// the configured ceilings, then returns the admitted [`Job`].
    ///
    /// Fails only with [`LimiterError::Cancelled`] if `token` fires
    /// while waiting; in that case no capacity was ever acquired and the
    /// caller's queue slot is removed so later waiters are not stalled.
    pub async fn begin(
        &self,
        label: impl Into<String>,
        expected_size: u64,
        token: &CancellationToken,
    ) -> Result<Job, LimiterError> {
        let label = label.into();
        let ticket = {
            let mut st = self.shared.state.lock().unwrap();
            let ticket = st.next_ticket;
            st.next_ticket += 1;
            st.queue.push_back(ticket);
            ticket
        };

        loop {
            // Register for wakeups before checking, so a release between
            // the check and the await cannot be missed.
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut st = self.shared.state.lock().unwrap();
                if st.queue.front() == Some(&ticket) && admissible(&self.shared, &st, expected_size)
                {
                    st.queue.pop_front();
                    st.active_jobs += 1;
                    st.active_weight += expected_size;
                    let id = st.next_job_id;
                    st.next_job_id += 1;
                    drop(st);

                    // The next ticket in line may fit as well.
                    self.shared.notify.notify_waiters();
                    debug!(
                        limiter = %self.shared.name,
                        job = id,
                        %label,
                        size = expected_size,
                        "job admitted"
                    );
                    return Ok(Job::admitted(id, label, expected_size, Arc::clone(&self.shared)));
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = token.cancelled() => {
                    let mut st = self.shared.state.lock().unwrap();
                    st.queue.retain(|&t| t != ticket);
                    drop(st);
                    // The head ticket may have been ours.
                    self.shared.notify.notify_waiters();
                    trace!(limiter = %self.shared.name, %label, "admission wait cancelled");
                    return Err(LimiterError::Cancelled);
                }
            }
        }
    }

    /// Current accounting snapshot.
    pub fn stats(&self) -> LimiterStats {
        let st = self.shared.state.lock().unwrap();
        LimiterStats {
            active_jobs: st.active_jobs,
            queued: st.queue.len(),
            active_weight: st.active_weight,
        }
    }

    /// The limiter's configured name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }
}

fn admissible(shared: &Shared, st: &State, size: u64) -> bool {
    if st.active_jobs == 0 {
        return true;
    }
    if st.active_jobs >= shared.max_jobs {
        return false;
    }
    match shared.max_weight {
        Some(max) => st.active_weight.saturating_add(size) <= max,
        None => true,
    }
}

impl Shared {
    /// Releases one job's capacity. Called exactly once, from `Job::drop`.
    pub(crate) fn release(&self, id: u64, weight: u64) {
        {
            let mut st = self.state.lock().unwrap();
            st.active_jobs -= 1;
            st.active_weight = st.active_weight.saturating_sub(weight);
        }
        self.notify.notify_waiters();
        trace!(limiter = %self.name, job = id, "job released");
    }

    /// Re-accounts a job's weight after a size update.
    pub(crate) fn reweigh(&self, old: u64, new: u64) {
        let mut st = self.state.lock().unwrap();
        st.active_weight = st.active_weight.saturating_sub(old).saturating_add(new);
        drop(st);
        if new < old {
            self.notify.notify_waiters();
        }
    }

    /// Enforces the bandwidth ceiling for `bytes` just reported.
    ///
    /// Sleeps out the bucket deficit, if any; the sleep is a suspension
    /// point and respects `token`.
    pub(crate) async fn pace(
        &self,
        bytes: u64,
        token: &CancellationToken,
    ) -> Result<(), LimiterError> {
        let Some(rate) = self.max_throughput else {
            return Ok(());
        };

        let wait = {
            let mut p = self.pacer.lock().unwrap();
            let now = tokio::time::Instant::now();
            let refill = now.duration_since(p.last_refill).as_secs_f64() * rate as f64;
            p.last_refill = now;
            // Burst capacity is one second of budget.
            p.budget = (p.budget + refill).min(rate as f64);
            p.budget -= bytes as f64;
            if p.budget < 0.0 {
                Duration::from_secs_f64(-p.budget / rate as f64)
            } else {
                Duration::ZERO
            }
        };

        if wait.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(wait) => Ok(()),
            _ = token.cancelled() => Err(LimiterError::Cancelled),
        }
    }
}
