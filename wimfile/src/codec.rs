//! The pluggable block-codec contract.
//!
//! The container engine drives codecs through a closed set of kinds with a
//! uniform contract: compress one block into a buffer one byte smaller than
//! the input (so a codec can never "win" by zero bytes), or report the block
//! incompressible; decompress one block to an exact known size. Everything
//! else about a codec is opaque to the engine.
//!
//! The built-in codec kinds carry the WIM codec ids (XPRESS=1, LZX=2,
//! LZMS=3) and validate the chunk-size ranges those formats allow. Their
//! block coding is backed by raw DEFLATE at kind-specific effort; producing
//! the Microsoft bitstreams is out of scope for the container engine.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use snafu::{Snafu, ensure};
use std::fmt::{self, Display, Formatter};

/// Default compression level on the 10 (fast) / 50 (medium) / 100 (high) scale.
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 50;

/// A compression codec understood by the container engine.
///
/// Adding a codec means adding a variant here plus its entries in the
/// dispatch methods below.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CodecKind {
    Xpress,
    Lzx,
    Lzms,
}

impl CodecKind {
    /// The codec id used in lookup-table bookkeeping and header flag bits.
    #[must_use]
    pub const fn id(self) -> u8 {
        match self {
            Self::Xpress => 1,
            Self::Lzx => 2,
            Self::Lzms => 3,
        }
    }

    /// Resolves a codec id.
    #[must_use]
    pub const fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Self::Xpress),
            2 => Some(Self::Lzx),
            3 => Some(Self::Lzms),
            _ => None,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Xpress => "XPRESS",
            Self::Lzx => "LZX",
            Self::Lzms => "LZMS",
        }
    }

    /// Smallest valid uncompressed chunk size for this codec.
    #[must_use]
    pub const fn min_chunk_size(self) -> u32 {
        1 << 15
    }

    /// Largest valid uncompressed chunk size for this codec.
    #[must_use]
    pub const fn max_chunk_size(self) -> u32 {
        match self {
            Self::Xpress => 1 << 16,
            Self::Lzx => 1 << 21,
            Self::Lzms => 1 << 26,
        }
    }

    /// Chunk sizes must be powers of two within the codec's window range.
    #[must_use]
    pub fn chunk_size_valid(self, chunk_size: u32) -> bool {
        chunk_size.is_power_of_two()
            && chunk_size >= self.min_chunk_size()
            && chunk_size <= self.max_chunk_size()
    }

    /// The chunk size used when the caller does not choose one.
    #[must_use]
    pub const fn default_chunk_size(self) -> u32 {
        1 << 15
    }

    /// Rough upper bound on the memory one compressor context needs.
    #[must_use]
    pub fn needed_memory(self, max_block_size: u32, _level: u32) -> u64 {
        // DEFLATE state plus one block of scratch either side.
        const CONTEXT_OVERHEAD: u64 = 256 * 1024;
        CONTEXT_OVERHEAD + 2 * max_block_size as u64
    }

    fn effort(self, level: u32) -> Compression {
        let level = if level == 0 {
            DEFAULT_COMPRESSION_LEVEL
        } else {
            level
        };

        // Map the 10/50/100 scale onto DEFLATE effort, biased by kind:
        // XPRESS trades ratio for speed, LZMS the reverse.
        let base: u32 = match level {
            0..=25 => 2,
            26..=75 => 6,
            _ => 9,
        };

        match self {
            Self::Xpress => Compression::new(base.min(6)),
            Self::Lzx => Compression::new(base),
            Self::Lzms => Compression::new(base.max(7)),
        }
    }
}

impl Display for CodecKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-codec output compression levels, threaded through the write planner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompressionConfig {
    xpress_level: u32,
    lzx_level: u32,
    lzms_level: u32,
}

impl CompressionConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            xpress_level: DEFAULT_COMPRESSION_LEVEL,
            lzx_level: DEFAULT_COMPRESSION_LEVEL,
            lzms_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }

    #[must_use]
    pub const fn level_for(&self, kind: CodecKind) -> u32 {
        match kind {
            CodecKind::Xpress => self.xpress_level,
            CodecKind::Lzx => self.lzx_level,
            CodecKind::Lzms => self.lzms_level,
        }
    }

    pub fn set_level(&mut self, kind: CodecKind, level: u32) {
        match kind {
            CodecKind::Xpress => self.xpress_level = level,
            CodecKind::Lzx => self.lzx_level = level,
            CodecKind::Lzms => self.lzms_level = level,
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors from codec construction and block decompression.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum CodecError {
    #[snafu(display("codec id {id} is not recognized"))]
    UnknownCodecId { id: u8 },

    #[snafu(display("chunk size {chunk_size} is not valid for {codec}"))]
    InvalidChunkSize { codec: CodecKind, chunk_size: u32 },

    #[snafu(display("compressed block is corrupt"))]
    CorruptBlock,
}

/// A single-block compressor context.
///
/// One context serves one worker; contexts are never shared across workers
/// but are reused from block to block.
pub struct Compressor {
    kind: CodecKind,
    max_block_size: u32,
    ctx: Compress,
}

impl Compressor {
    pub fn new(kind: CodecKind, max_block_size: u32, level: u32) -> Result<Self, CodecError> {
        ensure!(
            kind.chunk_size_valid(max_block_size),
            InvalidChunkSizeSnafu {
                codec: kind,
                chunk_size: max_block_size,
            }
        );

        Ok(Self {
            kind,
            max_block_size,
            ctx: Compress::new(kind.effort(level), false),
        })
    }

    #[must_use]
    pub fn kind(&self) -> CodecKind {
        self.kind
    }

    #[must_use]
    pub fn max_block_size(&self) -> u32 {
        self.max_block_size
    }

    /// Compresses one block.
    ///
    /// `output` must be exactly one byte shorter than `input`, which forbids
    /// the codec from producing output at least as large as the input.
    /// Returns the compressed length, or `None` if the block is
    /// incompressible and must be stored raw. Codec failure is never fatal;
    /// it also maps to `None`.
    pub fn compress(&mut self, input: &[u8], output: &mut [u8]) -> Option<usize> {
        debug_assert!(!input.is_empty());
        debug_assert!(input.len() <= self.max_block_size as usize);
        debug_assert_eq!(output.len(), input.len() - 1);

        self.ctx.reset();

        loop {
            let in_off = self.ctx.total_in() as usize;
            let out_off = self.ctx.total_out() as usize;

            if out_off >= output.len() {
                return None;
            }

            let status = self
                .ctx
                .compress(
                    &input[in_off..],
                    &mut output[out_off..],
                    FlushCompress::Finish,
                )
                .ok()?;

            match status {
                Status::StreamEnd => {
                    let n = self.ctx.total_out() as usize;
                    debug_assert!(n < input.len());
                    return Some(n);
                }
                Status::Ok => continue,
                Status::BufError => return None,
            }
        }
    }
}

/// A single-block decompressor context.
pub struct Decompressor {
    kind: CodecKind,
    max_block_size: u32,
    ctx: Decompress,
}

impl Decompressor {
    pub fn new(kind: CodecKind, max_block_size: u32) -> Result<Self, CodecError> {
        ensure!(
            kind.chunk_size_valid(max_block_size),
            InvalidChunkSizeSnafu {
                codec: kind,
                chunk_size: max_block_size,
            }
        );

        Ok(Self {
            kind,
            max_block_size,
            ctx: Decompress::new(false),
        })
    }

    #[must_use]
    pub fn kind(&self) -> CodecKind {
        self.kind
    }

    /// Decompresses one block into `output`, which must be exactly the
    /// block's uncompressed size. Anything short of an exact fill is
    /// corruption.
    pub fn decompress(&mut self, input: &[u8], output: &mut [u8]) -> Result<(), CodecError> {
        debug_assert!(output.len() <= self.max_block_size as usize);

        self.ctx.reset(false);

        loop {
            let in_off = self.ctx.total_in() as usize;
            let out_off = self.ctx.total_out() as usize;

            let status = self
                .ctx
                .decompress(
                    &input[in_off..],
                    &mut output[out_off..],
                    FlushDecompress::Finish,
                )
                .map_err(|_| CodecError::CorruptBlock)?;

            match status {
                Status::StreamEnd => {
                    ensure!(self.ctx.total_out() as usize == output.len(), CorruptBlockSnafu);
                    return Ok(());
                }
                Status::Ok if (self.ctx.total_in() as usize) < input.len() => continue,
                Status::Ok | Status::BufError => return CorruptBlockSnafu.fail(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: u32 = 1 << 15;

    #[test]
    fn codec_ids_round_trip() {
        for kind in [CodecKind::Xpress, CodecKind::Lzx, CodecKind::Lzms] {
            assert_eq!(CodecKind::from_id(kind.id()), Some(kind));
        }
        assert_eq!(CodecKind::from_id(0), None);
        assert_eq!(CodecKind::from_id(4), None);
    }

    #[test]
    fn chunk_size_ranges() {
        assert!(CodecKind::Xpress.chunk_size_valid(1 << 15));
        assert!(CodecKind::Xpress.chunk_size_valid(1 << 16));
        assert!(!CodecKind::Xpress.chunk_size_valid(1 << 17));
        assert!(CodecKind::Lzx.chunk_size_valid(1 << 21));
        assert!(!CodecKind::Lzx.chunk_size_valid(1 << 22));
        assert!(CodecKind::Lzms.chunk_size_valid(1 << 26));
        assert!(!CodecKind::Lzms.chunk_size_valid((1 << 15) + 1));
        assert!(!CodecKind::Lzms.chunk_size_valid(1 << 14));
    }

    #[test]
    fn compress_round_trips() {
        let input: Vec<u8> = (0..BLOCK as usize).map(|i| (i / 64) as u8).collect();

        let mut compressor = Compressor::new(CodecKind::Lzx, BLOCK, 50).unwrap();
        let mut out = vec![0u8; input.len() - 1];
        let n = compressor
            .compress(&input, &mut out)
            .expect("repetitive data must compress");
        assert!(n < input.len());

        let mut decompressor = Decompressor::new(CodecKind::Lzx, BLOCK).unwrap();
        let mut restored = vec![0u8; input.len()];
        decompressor.decompress(&out[..n], &mut restored).unwrap();
        assert_eq!(restored, input);
    }

    #[test]
    fn context_is_reusable_across_blocks() {
        let a = vec![7u8; 4096];
        let b: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();

        let mut compressor = Compressor::new(CodecKind::Xpress, BLOCK, 50).unwrap();
        let mut decompressor = Decompressor::new(CodecKind::Xpress, BLOCK).unwrap();

        for input in [&a, &b] {
            let mut out = vec![0u8; input.len() - 1];
            let n = compressor.compress(input, &mut out).unwrap();

            let mut restored = vec![0u8; input.len()];
            decompressor.decompress(&out[..n], &mut restored).unwrap();
            assert_eq!(&restored, input);
        }
    }

    #[test]
    fn incompressible_block_reports_none() {
        // A pseudo-random block DEFLATE cannot shrink.
        let mut state = 0x9E3779B97F4A7C15u64;
        let input: Vec<u8> = (0..4096)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect();

        let mut compressor = Compressor::new(CodecKind::Lzx, BLOCK, 100).unwrap();
        let mut out = vec![0u8; input.len() - 1];
        assert_eq!(compressor.compress(&input, &mut out), None);
    }

    #[test]
    fn truncated_block_is_corrupt() {
        let input = vec![3u8; 8192];
        let mut compressor = Compressor::new(CodecKind::Lzx, BLOCK, 50).unwrap();
        let mut out = vec![0u8; input.len() - 1];
        let n = compressor.compress(&input, &mut out).unwrap();

        let mut decompressor = Decompressor::new(CodecKind::Lzx, BLOCK).unwrap();
        let mut restored = vec![0u8; input.len()];
        assert!(
            decompressor
                .decompress(&out[..n / 2], &mut restored)
                .is_err()
        );
    }
}
