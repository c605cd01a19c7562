//! Remote source dispatch: route a locator to the handler that can
//! fetch it.
//!
//! Each remote source family gets one [`SourceHandler`]; the
//! [`SourceDispatcher`] tries handlers in a fixed, documented
//! registration order and the first `matches` wins:
//!
//! 1. portal: `portal://<game>/<mod_id>/<file_id>` locators and the
//!    portal's own mod-page URLs, resolved through the host's API (also
//!    the only upload-capable source)
//! 2. mirror: `mirror://<machine_name>` locators served from a
//!    configured CDN base
//! 3. direct: any plain `http(s)` URL, matched last as the fallback
//!
//! Handlers stream bytes to the destination, report progress to the
//! job as bytes arrive, and return the verified fingerprint of what
//! was actually written.

mod dispatcher;
mod handler;
pub mod handlers;
mod stream;

pub use dispatcher::SourceDispatcher;
pub use handler::{RemoteArtifact, SourceHandler, SourceState};
pub use handlers::direct::DirectUrlHandler;
pub use handlers::mirror::MirrorHandler;
pub use handlers::portal::{PortalConfig, PortalHandler};

use std::path::PathBuf;

use modferry_hashing::Hash;

/// Errors from locator parsing and downloads.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// No registered handler matches the locator.
    #[error("unrecognized locator: {0}")]
    Unrecognized(String),

    /// Non-success HTTP response.
    #[error("transport error: HTTP {status}: {body}")]
    Transport { status: u16, body: String },

    /// Request never produced a response (connect/TLS/timeout).
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Downloaded content disagrees with the expected fingerprint.
    /// Never silently accepted.
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: Hash, actual: Hash },

    /// Server response did not match the expected shape.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("file not found: {0}")]
    NotFound(PathBuf),

    #[error("cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure in the chunked upload protocol (portal uploads).
    #[error(transparent)]
    Upload(#[from] modferry_upload::UploadError),
}

impl From<modferry_limiter::LimiterError> for SourceError {
    fn from(e: modferry_limiter::LimiterError) -> Self {
        match e {
            modferry_limiter::LimiterError::Cancelled => SourceError::Cancelled,
        }
    }
}

impl SourceError {
    pub(crate) async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        SourceError::Transport { status, body }
    }
}
