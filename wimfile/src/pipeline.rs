//! Chunk compression pipelines.
//!
//! A pipeline accepts fixed-size uncompressed chunks and emits them in
//! submission order, each either compressed (when the codec managed to
//! shrink it) or verbatim. The serial variant keeps one chunk in flight;
//! the parallel variant batches chunks across a rayon worker pool while
//! still emitting strictly FIFO.

use crate::codec::{CodecError, CodecKind, Compressor};
use rayon::ThreadPool;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use std::collections::VecDeque;

/// One emitted chunk.
pub struct CompressedChunk {
    /// Compressed payload, or a verbatim copy of the input when the codec
    /// could not shrink it.
    pub data: Vec<u8>,
    /// Size of the chunk before compression.
    pub uncompressed_size: u32,
    /// Whether `data` is codec output (strictly smaller than the input).
    pub compressed: bool,
}

/// Drives a codec over a sequence of chunks, FIFO.
///
/// Every submitted chunk produces exactly one emitted chunk. `submit`
/// returns `false` when no slot is free; the caller must then drain with
/// [`next`](Self::next) before resubmitting.
pub trait ChunkPipeline {
    /// Maximum size of a submitted chunk; only the final chunk of a stream
    /// may be smaller.
    fn chunk_size(&self) -> u32;

    /// Offers one chunk. Returns `true` if the pipeline accepted it.
    fn submit(&mut self, chunk: &[u8]) -> bool;

    /// Takes the next chunk in submission order, if any is pending.
    fn next(&mut self) -> Option<CompressedChunk>;
}

/// Creates a pipeline for the given codec parameters.
///
/// `num_threads == 1` selects the serial pipeline; anything larger selects
/// the parallel one with that many workers.
pub fn new_pipeline(
    kind: CodecKind,
    chunk_size: u32,
    level: u32,
    num_threads: usize,
) -> Result<Box<dyn ChunkPipeline>, CodecError> {
    if num_threads <= 1 {
        Ok(Box::new(SerialPipeline::new(kind, chunk_size, level)?))
    } else {
        Ok(Box::new(ParallelPipeline::new(
            kind,
            chunk_size,
            level,
            num_threads,
        )?))
    }
}

/// Single-slot pipeline: one chunk in flight, compressed on demand.
pub struct SerialPipeline {
    compressor: Compressor,
    chunk_size: u32,
    udata: Vec<u8>,
}

impl SerialPipeline {
    pub fn new(kind: CodecKind, chunk_size: u32, level: u32) -> Result<Self, CodecError> {
        Ok(Self {
            compressor: Compressor::new(kind, chunk_size, level)?,
            chunk_size,
            udata: Vec::with_capacity(chunk_size as usize),
        })
    }
}

impl ChunkPipeline for SerialPipeline {
    fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    fn submit(&mut self, chunk: &[u8]) -> bool {
        if !self.udata.is_empty() {
            return false;
        }

        debug_assert!(!chunk.is_empty());
        debug_assert!(chunk.len() <= self.chunk_size as usize);

        self.udata.extend_from_slice(chunk);
        true
    }

    fn next(&mut self) -> Option<CompressedChunk> {
        if self.udata.is_empty() {
            return None;
        }

        let out = compress_one(&mut self.compressor, &self.udata);
        self.udata.clear();
        Some(out)
    }
}

/// Multi-slot pipeline: up to `num_slots` chunks are buffered, then
/// compressed as one rayon batch. Emission order always matches submission
/// order regardless of which worker finishes first.
///
/// Batch compression runs inside [`next`](ChunkPipeline::next), so dropping
/// the pipeline never abandons partial output: whatever was submitted is
/// either already emitted or simply discarded whole.
pub struct ParallelPipeline {
    kind: CodecKind,
    chunk_size: u32,
    level: u32,
    num_slots: usize,
    pool: ThreadPool,
    pending: Vec<Vec<u8>>,
    ready: VecDeque<CompressedChunk>,
}

impl ParallelPipeline {
    pub fn new(
        kind: CodecKind,
        chunk_size: u32,
        level: u32,
        num_threads: usize,
    ) -> Result<Self, CodecError> {
        // Validate the codec parameters up front so per-worker context
        // construction below cannot fail.
        let _ = Compressor::new(kind, chunk_size, level)?;

        // Thread-pool construction only fails on resource exhaustion; fall
        // back to a single worker rather than surfacing a codec error.
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .or_else(|_| rayon::ThreadPoolBuilder::new().num_threads(1).build())
            .expect("single-thread pool");

        Ok(Self {
            kind,
            chunk_size,
            level,
            num_slots: num_threads.max(2) * 2,
            pool,
            pending: Vec::new(),
            ready: VecDeque::new(),
        })
    }

    fn flush_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }

        let kind = self.kind;
        let chunk_size = self.chunk_size;
        let level = self.level;
        let pending = std::mem::take(&mut self.pending);

        let compressed: Vec<CompressedChunk> = self.pool.install(|| {
            pending
                .par_iter()
                .map_init(
                    // One codec context per worker; parameters were
                    // validated at pipeline construction.
                    || {
                        Compressor::new(kind, chunk_size, level)
                            .expect("codec parameters validated at construction")
                    },
                    |compressor, chunk| compress_one(compressor, chunk),
                )
                .collect()
        });

        self.ready.extend(compressed);
    }
}

impl ChunkPipeline for ParallelPipeline {
    fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    fn submit(&mut self, chunk: &[u8]) -> bool {
        if self.pending.len() >= self.num_slots {
            return false;
        }

        debug_assert!(!chunk.is_empty());
        debug_assert!(chunk.len() <= self.chunk_size as usize);

        self.pending.push(chunk.to_vec());
        true
    }

    fn next(&mut self) -> Option<CompressedChunk> {
        if self.ready.is_empty() {
            self.flush_pending();
        }

        self.ready.pop_front()
    }
}

fn compress_one(compressor: &mut Compressor, chunk: &[u8]) -> CompressedChunk {
    let mut out = vec![0u8; chunk.len().saturating_sub(1)];

    match compressor.compress(chunk, &mut out) {
        Some(n) => {
            out.truncate(n);
            CompressedChunk {
                data: out,
                uncompressed_size: chunk.len() as u32,
                compressed: true,
            }
        }
        None => CompressedChunk {
            data: chunk.to_vec(),
            uncompressed_size: chunk.len() as u32,
            compressed: false,
        },
    }
}
