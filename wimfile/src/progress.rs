use crate::hash::Sha1Digest;
use std::path::Path;

/// Whether to keep going after a progress callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressAction {
    Continue,
    Abort,
}

/// Trait for receiving progress updates from writes and integrity checks.
///
/// All methods take `&self` (not `&mut self`) so the reporter can be shared
/// with compression workers without synchronization. Any callback may
/// request an abort; the engine honors it between streams and between
/// chunks, never mid-chunk, and an aborted in-place overwrite leaves the
/// prior header (and therefore the prior WIM) intact.
pub trait WimProgress: Send + Sync {
    /// Called before a stream's bytes are written.
    fn begin_stream(&self, _hash: &Sha1Digest, _size: u64) -> ProgressAction {
        ProgressAction::Continue
    }

    /// Called after each chunk of stream data lands in the output.
    fn chunk_written(&self, _uncompressed_bytes: u64) -> ProgressAction {
        ProgressAction::Continue
    }

    /// Called once a stream has been fully written.
    fn stream_completed(&self, _hash: &Sha1Digest) -> ProgressAction {
        ProgressAction::Continue
    }

    /// Called per slice while computing or checking the integrity table.
    fn integrity_chunk(&self, _index: usize, _total: usize) -> ProgressAction {
        ProgressAction::Continue
    }

    /// Called when the writer is done reading a staging file, if
    /// done-with-file messages were requested.
    fn done_with_file(&self, _path: &Path) {}

    /// Called after all sections are in place, immediately before the
    /// header commit makes them visible.
    fn pre_commit(&self) -> ProgressAction {
        ProgressAction::Continue
    }
}

/// A no-op progress implementation that discards all updates.
pub struct SilentProgress;

impl WimProgress for SilentProgress {}
