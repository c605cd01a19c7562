//! Wire DTOs for the resumable upload protocol.

use serde::{Deserialize, Serialize};

/// Server acknowledgement carried by chunk status queries and chunk
/// upload responses once any chunk has been accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadAck {
    /// Whether the queried/uploaded chunk is accepted.
    #[serde(default)]
    pub status: bool,
    /// Assembly-tracking identifier for the whole upload.
    #[serde(default)]
    pub uuid: String,
    /// Server-side name assigned to the assembled file.
    #[serde(default)]
    pub filename: String,
}

/// Result of a chunk status query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkState {
    /// HTTP 204; the chunk must be sent.
    NotYetUploaded,
    /// Any 200 response: the server already holds this chunk (its
    /// `status` flag may still read false mid-processing); replays
    /// skip it.
    AlreadyUploaded(UploadAck),
}

/// Response of the assembly-status poll endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssemblyStatus {
    /// True once all chunks are assembled into the final file.
    pub file_chunks_assembled: bool,
}
