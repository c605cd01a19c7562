//! Resource-limited admission of concurrent transfer jobs.
//!
//! A [`Limiter`] admits weighted jobs under two independent ceilings
//! (concurrent job count and aggregate weight) and paces reported bytes
//! against an optional bandwidth ceiling. Admission never rejects, it
//! only delays, in arrival order. Each admitted [`Job`] releases its
//! capacity exactly once when dropped, on every exit path.
//!
//! Progress is an event stream: consumers subscribe to a job's
//! [`watch`](tokio::sync::watch) channel and receive incremental
//! [`JobProgress`] snapshots instead of polling.

mod job;
mod limiter;
mod speed;

pub use job::{Job, JobProgress};
pub use limiter::{Limiter, LimiterStats};
pub use speed::SpeedWindow;

/// Errors produced by the limiter.
///
/// Admission and reporting have exactly one failure mode: the caller's
/// cancellation token fired at a suspension point.
#[derive(Debug, thiserror::Error)]
pub enum LimiterError {
    #[error("cancelled")]
    Cancelled,
}

/// Configuration for one [`Limiter`], injected at construction.
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Human-readable name used in logs (e.g. "downloads").
    pub name: String,
    /// Maximum number of concurrently admitted jobs.
    pub max_concurrent_jobs: usize,
    /// Maximum aggregate weight (sum of expected sizes) of admitted jobs.
    /// `None` disables the weight ceiling.
    pub max_active_weight: Option<u64>,
    /// Bandwidth ceiling in bytes per second applied inside
    /// [`Job::report`]. `None` disables pacing.
    pub max_throughput: Option<u64>,
}

impl LimiterConfig {
    /// Creates a config with only the concurrency ceiling set.
    pub fn concurrency(name: impl Into<String>, max_concurrent_jobs: usize) -> Self {
        Self {
            name: name.into(),
            max_concurrent_jobs,
            max_active_weight: None,
            max_throughput: None,
        }
    }
}
