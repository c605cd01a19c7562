//! Transfer orchestration: make a remote artifact exist locally, with
//! verified content, exactly once.
//!
//! [`TransferMaintainer::ensure_local`] is the one entry point callers
//! need: it checks the hash cache first (a verified local copy costs
//! zero network activity), and otherwise waits for limiter admission,
//! routes the download through the source dispatcher, and records the
//! verified fingerprint in the cache without re-reading the file.
//!
//! Concurrent calls for the same destination serialize on a
//! per-destination lock, so the second caller finds the first caller's
//! result in the cache instead of downloading it again.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use modferry_hash_cache::{CacheError, HashCache};
use modferry_hashing::Hash;
use modferry_limiter::{Limiter, LimiterError};
use modferry_sources::{RemoteArtifact, SourceDispatcher, SourceError, SourceState};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Errors surfaced by [`TransferMaintainer::ensure_local`].
///
/// Nothing below this layer retries; callers decide whether a failed
/// transfer is re-run.
#[derive(Debug, thiserror::Error)]
pub enum MaintainError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("cancelled")]
    Cancelled,
}

impl From<LimiterError> for MaintainError {
    fn from(e: LimiterError) -> Self {
        match e {
            LimiterError::Cancelled => MaintainError::Cancelled,
        }
    }
}

/// Everything needed to materialize one artifact locally.
#[derive(Debug, Clone)]
pub struct TransferDescriptor {
    /// Which remote source holds the content and how to address it.
    pub state: SourceState,
    /// Expected size in bytes; weights limiter admission.
    pub size: u64,
    /// Fingerprint the downloaded content must match.
    pub hash: Hash,
    /// Where the artifact must end up.
    pub destination: PathBuf,
}

impl TransferDescriptor {
    fn artifact(&self) -> RemoteArtifact {
        RemoteArtifact {
            state: self.state.clone(),
            size: self.size,
            hash: Some(self.hash),
        }
    }

    fn label(&self) -> String {
        self.destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.destination.display().to_string())
    }
}

/// Orchestrates downloads across the limiter, dispatcher, and cache.
///
/// Owns its collaborators; share the maintainer itself behind an
/// [`Arc`] when multiple tasks drive transfers.
pub struct TransferMaintainer {
    dispatcher: SourceDispatcher,
    cache: HashCache,
    limiter: Limiter,
    inflight: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl TransferMaintainer {
    pub fn new(dispatcher: SourceDispatcher, cache: HashCache, limiter: Limiter) -> Self {
        Self {
            dispatcher,
            cache,
            limiter,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Guarantees a file at `descriptor.destination` whose content hash
    /// equals `descriptor.hash`.
    ///
    /// Returns immediately, with zero network activity, when the cache
    /// already vouches for the destination. Cancellation during the
    /// admission wait acquires nothing; after admission the job's
    /// capacity is released exactly once.
    pub async fn ensure_local(
        &self,
        descriptor: &TransferDescriptor,
        token: &CancellationToken,
    ) -> Result<(), MaintainError> {
        self.run(descriptor, token, None).await
    }

    /// Like [`ensure_local`](Self::ensure_local), but also hands back a
    /// progress stream of the transfer's completed fraction (0.0–1.0).
    ///
    /// The receiver reads 1.0 once the artifact is local, including on
    /// the cache fast path.
    pub fn ensure_local_with_progress<'a>(
        &'a self,
        descriptor: &'a TransferDescriptor,
        token: &'a CancellationToken,
    ) -> (
        watch::Receiver<f64>,
        impl Future<Output = Result<(), MaintainError>> + 'a,
    ) {
        let (tx, rx) = watch::channel(0.0);
        (rx, self.run(descriptor, token, Some(tx)))
    }

    /// Current limiter accounting, for status displays.
    pub fn stats(&self) -> modferry_limiter::LimiterStats {
        self.limiter.stats()
    }

    async fn run(
        &self,
        descriptor: &TransferDescriptor,
        token: &CancellationToken,
        progress: Option<watch::Sender<f64>>,
    ) -> Result<(), MaintainError> {
        let gate = self.gate(&descriptor.destination);
        let _guard = gate.lock().await;

        if let Some(cached) = self.cache.try_get(&descriptor.destination).await? {
            if cached == descriptor.hash {
                debug!(
                    dest = %descriptor.destination.display(),
                    "artifact already local and verified"
                );
                if let Some(tx) = &progress {
                    let _ = tx.send(1.0);
                }
                return Ok(());
            }
            // Content changed out from under us; fetch fresh.
            self.cache.invalidate(&descriptor.destination)?;
        }

        let job = self
            .limiter
            .begin(descriptor.label(), descriptor.size, token)
            .await?;

        if let Some(tx) = &progress {
            let tx = tx.clone();
            let mut updates = job.subscribe();
            tokio::spawn(async move {
                // Ends when the job is dropped and the sender closes.
                while updates.changed().await.is_ok() {
                    let fraction = updates.borrow().fraction();
                    if tx.send(fraction).is_err() {
                        break;
                    }
                }
            });
        }

        let artifact = descriptor.artifact();
        let result = self
            .dispatcher
            .download(&artifact, &descriptor.destination, &job, token)
            .await;
        drop(job);
        let hash = result?;

        // The dispatcher already verified the content; record the
        // fingerprint without a second pass over the file.
        self.cache.write(&descriptor.destination, hash)?;
        if let Some(tx) = &progress {
            let _ = tx.send(1.0);
        }
        info!(
            dest = %descriptor.destination.display(),
            size = descriptor.size,
            "artifact transferred"
        );
        Ok(())
    }

    fn gate(&self, destination: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inflight.lock().unwrap();
        // Drop locks nobody else holds so the registry tracks only
        // in-flight destinations.
        map.retain(|_, gate| Arc::strong_count(gate) > 1);
        Arc::clone(map.entry(destination.to_path_buf()).or_default())
    }
}

// ---
