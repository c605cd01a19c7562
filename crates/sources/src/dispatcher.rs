//! Locator routing over the registered handler set.

use std::path::Path;
use std::sync::Arc;

use modferry_hashing::Hash;
use modferry_limiter::Job;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::handler::{RemoteArtifact, SourceHandler, SourceState};
use crate::SourceError;

/// Routes locators to the first matching handler.
///
/// Registration order is part of the contract: handlers are tried in
/// the order given to [`SourceDispatcher::new`], so more specific
/// families must be registered before the direct-URL fallback.
pub struct SourceDispatcher {
    handlers: Vec<Arc<dyn SourceHandler>>,
}

impl SourceDispatcher {
    pub fn new(handlers: Vec<Arc<dyn SourceHandler>>) -> Self {
        Self { handlers }
    }

    /// Parses a locator by trying handlers in registration order.
    pub fn parse(&self, url: &Url) -> Result<SourceState, SourceError> {
        for handler in &self.handlers {
            if let Some(state) = handler.matches(url) {
                debug!(%url, handler = handler.name(), "locator matched");
                return Ok(state);
            }
        }
        Err(SourceError::Unrecognized(url.to_string()))
    }

    /// Downloads an artifact to `dest` through the handler owning its
    /// state, verifying the fingerprint when one is expected.
    ///
    /// On a fingerprint disagreement the destination is removed and
    /// [`SourceError::HashMismatch`] is returned; corrupt bytes are
    /// never left where a later cache check could bless them.
    pub async fn download(
        &self,
        artifact: &RemoteArtifact,
        dest: &Path,
        job: &Job,
        token: &CancellationToken,
    ) -> Result<Hash, SourceError> {
        let family = artifact.state.family();
        let handler = self
            .handlers
            .iter()
            .find(|h| h.name() == family)
            .ok_or_else(|| SourceError::Unrecognized(format!("no handler for {family}")))?;

        let hash = handler.download(&artifact.state, dest, job, token).await?;

        if let Some(expected) = artifact.hash {
            if expected != hash {
                warn!(
                    dest = %dest.display(),
                    %expected,
                    actual = %hash,
                    "downloaded content failed integrity check"
                );
                let _ = tokio::fs::remove_file(dest).await;
                return Err(SourceError::HashMismatch {
                    expected,
                    actual: hash,
                });
            }
        }
        Ok(hash)
    }
}
