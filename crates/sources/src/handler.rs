//! The per-source capability contract.

use std::path::Path;

use async_trait::async_trait;
use modferry_hashing::Hash;
use modferry_limiter::Job;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::SourceError;

/// Parsed, source-specific download state. Tagged by family so the
/// dispatcher can route it back to the handler that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum SourceState {
    /// A plain URL fetched as-is.
    Direct { url: Url },
    /// A machine-named artifact on the configured CDN mirror.
    Mirror { machine_name: String },
    /// A file hosted on the mod portal, resolved via its API.
    Portal {
        game: String,
        mod_id: u64,
        file_id: u64,
    },
}

impl SourceState {
    /// The handler family this state belongs to.
    pub fn family(&self) -> &'static str {
        match self {
            SourceState::Direct { .. } => "direct",
            SourceState::Mirror { .. } => "mirror",
            SourceState::Portal { .. } => "portal",
        }
    }
}

/// A remote artifact as the orchestrator describes it: parsed source
/// state plus what we expect the bytes to be.
#[derive(Debug, Clone)]
pub struct RemoteArtifact {
    pub state: SourceState,
    /// Expected size in bytes; 0 when unknown.
    pub size: u64,
    /// Expected content fingerprint; `None` skips verification.
    pub hash: Option<Hash>,
}

/// One remote source family.
///
/// `matches` is cheap and synchronous; `download` streams bytes to the
/// destination, reporting progress to `job` incrementally as they
/// arrive, and returns the fingerprint of the bytes actually written.
/// Upload capability is deliberately not part of this contract; only
/// some sources have it (see
/// [`PortalHandler::upload`](crate::PortalHandler::upload)).
#[async_trait]
pub trait SourceHandler: Send + Sync {
    /// Family tag, matching [`SourceState::family`] for states this
    /// handler produces.
    fn name(&self) -> &'static str;

    /// Claims a locator by returning the parsed state, or `None` to let
    /// the next registered handler try.
    fn matches(&self, url: &Url) -> Option<SourceState>;

    /// Streams the artifact to `dest` and returns its fingerprint.
    async fn download(
        &self,
        state: &SourceState,
        dest: &Path,
        job: &Job,
        token: &CancellationToken,
    ) -> Result<Hash, SourceError>;
}
