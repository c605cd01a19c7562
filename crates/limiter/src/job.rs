//! One admitted, tracked unit of transfer work.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::limiter::Shared;
use crate::speed::SpeedWindow;
use crate::LimiterError;

/// Progress snapshot published on a job's watch channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobProgress {
    /// Bytes reported so far.
    pub transferred: u64,
    /// Expected total size; 0 while unknown.
    pub size: u64,
    /// Observed throughput over a sliding window.
    pub bytes_per_sec: f64,
}

impl JobProgress {
    /// Completion ratio in `0.0..=1.0`; 0.0 while the size is unknown.
    pub fn fraction(&self) -> f64 {
        if self.size == 0 {
            return 0.0;
        }
        (self.transferred as f64 / self.size as f64).min(1.0)
    }
}

#[derive(Debug)]
struct Account {
    size: u64,
    transferred: u64,
}

/// An admitted job. Holds limiter capacity from admission until drop.
///
/// Not cloneable: the drop releases the slot, and that must happen
/// exactly once.
#[derive(Debug)]
pub struct Job {
    id: u64,
    label: String,
    shared: Arc<Shared>,
    account: Mutex<Account>,
    progress_tx: watch::Sender<JobProgress>,
    speed: SpeedWindow,
}

impl Job {
    pub(crate) fn admitted(id: u64, label: String, expected_size: u64, shared: Arc<Shared>) -> Self {
        let (progress_tx, _) = watch::channel(JobProgress {
            transferred: 0,
            size: expected_size,
            bytes_per_sec: 0.0,
        });
        Self {
            id,
            label,
            shared,
            account: Mutex::new(Account {
                size: expected_size,
                transferred: 0,
            }),
            progress_tx,
            speed: SpeedWindow::new(),
        }
    }

    /// Job identity within its limiter.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Human-readable label, e.g. `"Downloading lighting-overhaul"`.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Bytes reported so far.
    pub fn transferred(&self) -> u64 {
        self.account.lock().unwrap().transferred
    }

    /// Current expected size.
    pub fn size(&self) -> u64 {
        self.account.lock().unwrap().size
    }

    /// Subscribes to incremental progress snapshots.
    ///
    /// Receivers see the latest snapshot immediately and every update
    /// thereafter; no busy-polling required.
    pub fn subscribe(&self) -> watch::Receiver<JobProgress> {
        self.progress_tx.subscribe()
    }

    /// Updates the expected size once the true size is known (often only
    /// after response headers arrive) and re-accounts the slot's weight.
    pub fn set_size(&self, size: u64) {
        let old = {
            let mut acct = self.account.lock().unwrap();
            let old = acct.size;
            acct.size = size;
            old
        };
        if old != size {
            self.shared.reweigh(old, size);
            self.publish();
            trace!(job = self.id, old, new = size, "job size updated");
        }
    }

    /// Reports `bytes` newly transferred.
    ///
    /// Publishes a progress snapshot to subscribers, then enforces the
    /// limiter's bandwidth ceiling; this call is a suspension point and
    /// may sleep. Fails with [`LimiterError::Cancelled`] if `token` fires
    /// during the pacing sleep; the bytes remain counted.
    pub async fn report(&self, bytes: u64, token: &CancellationToken) -> Result<(), LimiterError> {
        if token.is_cancelled() {
            return Err(LimiterError::Cancelled);
        }
        {
            let mut acct = self.account.lock().unwrap();
            acct.transferred += bytes;
        }
        self.speed.record(bytes);
        self.publish();
        self.shared.pace(bytes, token).await
    }

    fn publish(&self) {
        let acct = self.account.lock().unwrap();
        let snapshot = JobProgress {
            transferred: acct.transferred,
            size: acct.size,
            bytes_per_sec: self.speed.bytes_per_second(),
        };
        drop(acct);
        // Send errors only mean nobody is subscribed.
        let _ = self.progress_tx.send(snapshot);
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        let weight = self.account.lock().unwrap().size;
        self.shared.release(self.id, weight);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Limiter, LimiterConfig};

    fn limiter() -> Limiter {
        Limiter::new(LimiterConfig::concurrency("test", 4))
    }

    #[tokio::test]
    async fn report_accumulates_transferred() {
        let lim = limiter();
        let token = CancellationToken::new();
        let job = lim.begin("j", 100, &token).await.unwrap();

        job.report(30, &token).await.unwrap();
        job.report(20, &token).await.unwrap();
        assert_eq!(job.transferred(), 50);
    }

    #[tokio::test]
    async fn subscribers_see_incremental_updates() {
        let lim = limiter();
        let token = CancellationToken::new();
        let job = lim.begin("j", 100, &token).await.unwrap();
        let mut rx = job.subscribe();

        job.report(25, &token).await.unwrap();
        rx.changed().await.unwrap();
        let p = *rx.borrow();
        assert_eq!(p.transferred, 25);
        assert_eq!(p.size, 100);

        job.report(75, &token).await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().transferred, 100);
        assert_eq!(rx.borrow().fraction(), 1.0);
    }

    #[tokio::test]
    async fn set_size_reweighs_the_slot() {
        let lim = Limiter::new(LimiterConfig {
            name: "w".into(),
            max_concurrent_jobs: 4,
            max_active_weight: Some(1_000),
            max_throughput: None,
        });
        let token = CancellationToken::new();

        // Size unknown at begin time.
        let job = lim.begin("j", 0, &token).await.unwrap();
        assert_eq!(lim.stats().active_weight, 0);

        job.set_size(600);
        assert_eq!(lim.stats().active_weight, 600);
        assert_eq!(job.subscribe().borrow().size, 600);

        drop(job);
        assert_eq!(lim.stats().active_weight, 0);
    }

    #[tokio::test]
    async fn report_with_fired_token_fails() {
        let lim = limiter();
        let token = CancellationToken::new();
        let job = lim.begin("j", 10, &token).await.unwrap();

        token.cancel();
        let err = job.report(1, &token).await.unwrap_err();
        assert!(matches!(err, LimiterError::Cancelled));
    }

    #[tokio::test]
    async fn fraction_handles_unknown_size() {
        let p = JobProgress {
            transferred: 10,
            size: 0,
            bytes_per_sec: 0.0,
        };
        assert_eq!(p.fraction(), 0.0);

        let p = JobProgress {
            transferred: 150,
            size: 100,
            bytes_per_sec: 0.0,
        };
        assert_eq!(p.fraction(), 1.0);
    }
}
