//! Resumable chunked uploads to an artifact host.
//!
//! Files are partitioned into fixed-size chunks; a stable resumable
//! identifier correlates every request for one logical upload, so the
//! server, never local state, is the source of truth on resume.
//! Replaying the whole sequence after a crash sends only the chunks the
//! server has not yet accepted.
//!
//! The wire contract is the resumable.js-style field set: chunk status
//! queries, multipart chunk uploads, an assembly-status poll, and a
//! single non-idempotent finalize call. This layer performs no retries;
//! re-running [`ChunkedUploader::upload`] is the only recovery path.

mod descriptor;
mod http;
mod uploader;
mod wire;

pub use descriptor::{Chunk, UploadDescriptor};
pub use http::{CredentialProvider, HttpUploadTransport, UploadEndpoints};
pub use uploader::{ChunkedUploader, UploadTransport};
pub use wire::{AssemblyStatus, ChunkState, UploadAck};

/// Fixed chunk size: 5 MiB. An external contract with the remote host;
/// changing it breaks resume for in-flight uploads.
pub const CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Errors produced by the upload protocol.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// Non-success HTTP response at any protocol step.
    #[error("transport error: HTTP {status}: {body}")]
    Transport { status: u16, body: String },

    /// Server response did not match the expected shape.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Request never produced a response (connect/TLS/timeout).
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<modferry_limiter::LimiterError> for UploadError {
    fn from(e: modferry_limiter::LimiterError) -> Self {
        match e {
            modferry_limiter::LimiterError::Cancelled => UploadError::Cancelled,
        }
    }
}

impl UploadError {
    /// Builds a [`UploadError::Transport`] from a reqwest response,
    /// consuming its body for the error message.
    pub(crate) async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        UploadError::Transport { status, body }
    }
}
