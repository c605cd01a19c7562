//! Sliding-window throughput measurement.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default measurement window.
const DEFAULT_WINDOW: Duration = Duration::from_secs(5);

/// Maximum retained samples.
const MAX_SAMPLES: usize = 128;

#[derive(Debug)]
struct Sample {
    bytes: u64,
    at: Instant,
}

/// Observed-throughput estimator over a sliding time window.
///
/// Thread-safe; jobs record a sample per `report` call and readers ask
/// for the current bytes/second.
#[derive(Debug)]
pub struct SpeedWindow {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    samples: VecDeque<Sample>,
    window: Duration,
}

impl SpeedWindow {
    /// Creates a window with the default 5 s span.
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    /// Creates a window with an explicit span.
    pub fn with_window(window: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                samples: VecDeque::new(),
                window,
            }),
        }
    }

    /// Records `bytes` transferred at the current instant.
    pub fn record(&self, bytes: u64) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        inner.samples.push_back(Sample { bytes, at: now });

        let cutoff = now - inner.window;
        while inner
            .samples
            .front()
            .is_some_and(|s| s.at < cutoff)
        {
            inner.samples.pop_front();
        }
        while inner.samples.len() > MAX_SAMPLES {
            inner.samples.pop_front();
        }
    }

    /// Average bytes/second across the window, or 0.0 with fewer than
    /// two samples.
    pub fn bytes_per_second(&self) -> f64 {
        let inner = self.inner.lock().unwrap();
        let (Some(first), Some(last)) = (inner.samples.front(), inner.samples.back()) else {
            return 0.0;
        };
        let elapsed = last.at.duration_since(first.at);
        if inner.samples.len() < 2 || elapsed.is_zero() {
            return 0.0;
        }
        let total: u64 = inner.samples.iter().map(|s| s.bytes).sum();
        total as f64 / elapsed.as_secs_f64()
    }
}

impl Default for SpeedWindow {
    fn default() -> Self {
        Self::new()
    }
}
