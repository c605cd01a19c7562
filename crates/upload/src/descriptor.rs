//! Upload descriptors and derived chunk partitioning.

use std::path::PathBuf;

use crate::CHUNK_SIZE;

/// Everything needed to upload one file to its logical target.
///
/// Immutable per request. The finalize metadata (game, mod, version,
/// category, replace flags) is attached only after all chunks are
/// assembled server-side.
#[derive(Debug, Clone)]
pub struct UploadDescriptor {
    /// Local file to upload.
    pub path: PathBuf,
    /// Size of the local file in bytes.
    pub file_size: u64,
    /// Numeric id of the game the artifact belongs to.
    pub game_id: u64,
    /// Numeric id of the mod the file is attached to.
    pub mod_id: u64,
    /// Display name for the uploaded file.
    pub name: String,
    /// Version string for the uploaded file.
    pub version: String,
    /// Host-side category id.
    pub category: u32,
    /// Replace the previous version instead of keeping both.
    pub remove_old_version: bool,
    /// Whether this is a new file rather than an update of `old_file_id`.
    pub new_existing: bool,
    /// Mark the uploaded file as the mod's main file.
    pub set_as_main: bool,
    /// File id being superseded; 0 when uploading a brand-new file.
    pub old_file_id: u64,
    /// Short description shown next to the file.
    pub brief_overview: String,
}

impl UploadDescriptor {
    /// The file name component of `path`.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Resumable identifier correlating all requests for this logical
    /// upload.
    ///
    /// Derived from the file name and size rather than randomized per
    /// attempt, so a re-run after a crash addresses the same
    /// server-side state.
    pub fn resumable_identifier(&self) -> String {
        format!("{}-{}", self.file_name(), self.file_size)
    }

    /// Number of chunks for this file at the fixed [`CHUNK_SIZE`].
    pub fn chunk_count(&self) -> u64 {
        self.file_size.div_ceil(CHUNK_SIZE)
    }

    /// The deterministic chunk partition of this file.
    ///
    /// Purely derived from the file size; recomputed on every pass and
    /// never persisted, so resumability is entirely server-side state.
    pub fn chunks(&self) -> impl Iterator<Item = Chunk> + '_ {
        let file_size = self.file_size;
        (0..self.chunk_count()).map(move |index| {
            let offset = index * CHUNK_SIZE;
            Chunk {
                index,
                offset,
                size: CHUNK_SIZE.min(file_size - offset),
            }
        })
    }
}

/// One chunk of the partition: zero-based index, byte offset and length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub index: u64,
    pub offset: u64,
    pub size: u64,
}
