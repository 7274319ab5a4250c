//! Resource I/O: reading and writing chunked resources.
//!
//! A resource is a region of the WIM file holding one stream (or, for
//! packed resources, a run of streams). Compressed resources start with a
//! chunk offset table: `ceil(U/C) - 1` end offsets, 4 bytes each while the
//! uncompressed size is below 4 GiB and 8 bytes otherwise, measured from
//! the start of the resource so that the last chunk's end equals
//! `size_in_wim`. Each chunk is stored compressed exactly when its stored
//! size is smaller than its uncompressed size.

use crate::codec::{CodecError, CodecKind, Decompressor};
use crate::hash::{Sha1Digest, StreamHasher};
use crate::io::ReadAt;
use crate::pipeline::ChunkPipeline;
use crate::progress::{ProgressAction, WimProgress};
use crate::reshdr::{Reshdr, ResourceFlags};
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use std::cmp::min;
use std::io::{self, Read, Seek, SeekFrom, Write};
use zerocopy::byteorder::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Uncompressed sizes from this bound up require 8-byte chunk-table entries.
const WIDE_CHUNK_TABLE_BOUND: u64 = 1 << 32;

/// Errors when writing a resource.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum WriteResourceError {
    #[snafu(display("i/o failed writing resource"))]
    WriteIo { source: io::Error },

    #[snafu(display("i/o failed reading the source stream"))]
    SourceIo { source: io::Error },

    #[snafu(display("source stream ended {remaining} bytes early"))]
    SourceTruncated { remaining: u64 },

    #[snafu(display("write aborted by progress callback"))]
    Aborted,
}

/// Errors when reading a resource.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ReadResourceError {
    #[snafu(display("i/o failed reading resource"))]
    ReadIo { source: io::Error },

    #[snafu(display("resource is compressed but the WIM has no codec"))]
    MissingCodec,

    #[snafu(display("chunk table of {count} entries is inconsistent at entry {index}"))]
    BadChunkTable { count: u64, index: u64 },

    #[snafu(display("cannot decompress chunk #{chunk}"))]
    Decompress { chunk: u64, source: CodecError },

    #[snafu(display("codec rejected resource parameters"))]
    Codec { source: CodecError },

    #[snafu(display("packed resource directory is malformed"))]
    BadPackedDirectory,

    #[snafu(display("stream {hash} not present in packed resource"))]
    StreamNotInPack { hash: Sha1Digest },
}

/// Result of writing one resource: its header and the SHA-1 of its
/// uncompressed bytes.
#[derive(Debug, Clone, Copy)]
pub struct WrittenResource {
    pub reshdr: Reshdr,
    pub hash: Sha1Digest,
}

/// Writes a resource of `size` bytes taken from `source`, compressing
/// through `pipeline`.
///
/// Space for the chunk offset table is reserved up front and the table is
/// committed once all chunk sizes are known. If chunking did not shrink the
/// stream, the resource is rewritten uncompressed and the compressed flag
/// is left clear. Extra flag bits (metadata, packed) are carried over from
/// `extra_flags`.
pub fn write_resource<W, R>(
    out: &mut W,
    source: &mut R,
    size: u64,
    pipeline: &mut dyn ChunkPipeline,
    extra_flags: ResourceFlags,
    progress: &dyn WimProgress,
) -> Result<WrittenResource, WriteResourceError>
where
    W: Write + Seek,
    R: Read + Seek,
{
    let start = out.stream_position().context(WriteIoSnafu)?;
    let source_start = source.stream_position().context(SourceIoSnafu)?;

    if size == 0 {
        return Ok(WrittenResource {
            reshdr: Reshdr {
                offset_in_wim: start,
                size_in_wim: 0,
                uncompressed_size: 0,
                flags: extra_flags,
            },
            hash: Sha1Digest::of(&[]),
        });
    }

    let chunk_size = pipeline.chunk_size() as u64;
    let num_chunks = size.div_ceil(chunk_size);
    let entry_width: u64 = if size < WIDE_CHUNK_TABLE_BOUND { 4 } else { 8 };
    let table_bytes = (num_chunks - 1) * entry_width;

    // Reserve the chunk table region.
    io::copy(&mut io::repeat(0).take(table_bytes), out).context(WriteIoSnafu)?;

    let mut hasher = StreamHasher::new();
    let mut chunk_ends: Vec<u64> = Vec::with_capacity(num_chunks as usize);
    let mut written = table_bytes;
    let mut remaining = size;
    let mut chunk_buf = vec![0u8; chunk_size as usize];

    let mut drain =
        |pipeline: &mut dyn ChunkPipeline, out: &mut W, written: &mut u64, ends: &mut Vec<u64>| {
            while let Some(chunk) = pipeline.next() {
                out.write_all(&chunk.data).context(WriteIoSnafu)?;
                *written += chunk.data.len() as u64;
                ends.push(*written);

                ensure!(
                    progress.chunk_written(chunk.uncompressed_size as u64)
                        == ProgressAction::Continue,
                    AbortedSnafu
                );
            }
            Ok::<(), WriteResourceError>(())
        };

    while remaining > 0 {
        let want = min(chunk_size, remaining) as usize;
        source
            .read_exact(&mut chunk_buf[..want])
            .map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => WriteResourceError::SourceTruncated { remaining },
                _ => WriteResourceError::SourceIo { source: e },
            })?;

        hasher.update(&chunk_buf[..want]);

        while !pipeline.submit(&chunk_buf[..want]) {
            drain(pipeline, out, &mut written, &mut chunk_ends)?;
        }

        remaining -= want as u64;
    }

    drain(pipeline, out, &mut written, &mut chunk_ends)?;

    debug_assert_eq!(chunk_ends.len() as u64, num_chunks);

    let hash = hasher.finalize();

    if written >= size {
        // Compression lost; rewrite the resource raw.
        out.seek(SeekFrom::Start(start)).context(WriteIoSnafu)?;
        source
            .seek(SeekFrom::Start(source_start))
            .context(SourceIoSnafu)?;
        let copied = io::copy(&mut source.take(size), out).context(WriteIoSnafu)?;
        ensure!(
            copied == size,
            SourceTruncatedSnafu {
                remaining: size - copied,
            }
        );

        return Ok(WrittenResource {
            reshdr: Reshdr {
                offset_in_wim: start,
                size_in_wim: size,
                uncompressed_size: size,
                flags: extra_flags,
            },
            hash,
        });
    }

    // Commit the chunk table: end offsets of all chunks but the last.
    out.seek(SeekFrom::Start(start)).context(WriteIoSnafu)?;
    for &end in &chunk_ends[..chunk_ends.len() - 1] {
        if entry_width == 4 {
            out.write_all(&(end as u32).to_le_bytes())
                .context(WriteIoSnafu)?;
        } else {
            out.write_all(&end.to_le_bytes()).context(WriteIoSnafu)?;
        }
    }
    out.seek(SeekFrom::Start(start + written))
        .context(WriteIoSnafu)?;

    Ok(WrittenResource {
        reshdr: Reshdr {
            offset_in_wim: start,
            size_in_wim: written,
            uncompressed_size: size,
            flags: extra_flags.with(ResourceFlags::COMPRESSED),
        },
        hash,
    })
}

/// Writes a resource verbatim, without chunking or a chunk table.
///
/// Used for the lookup table, the XML blob, and the integrity table, which
/// the format stores uncompressed.
pub fn write_resource_uncompressed<W: Write + Seek>(
    out: &mut W,
    data: &[u8],
    extra_flags: ResourceFlags,
) -> Result<WrittenResource, WriteResourceError> {
    let start = out.stream_position().context(WriteIoSnafu)?;
    out.write_all(data).context(WriteIoSnafu)?;

    Ok(WrittenResource {
        reshdr: Reshdr {
            offset_in_wim: start,
            size_in_wim: data.len() as u64,
            uncompressed_size: data.len() as u64,
            flags: extra_flags,
        },
        hash: Sha1Digest::of(data),
    })
}

/// Streams `size` bytes from `source` into the output without chunking,
/// hashing along the way. The resource write path for WIMs with no codec.
pub fn write_resource_raw_stream<W, R>(
    out: &mut W,
    source: &mut R,
    size: u64,
    extra_flags: ResourceFlags,
) -> Result<WrittenResource, WriteResourceError>
where
    W: Write + Seek,
    R: Read,
{
    let start = out.stream_position().context(WriteIoSnafu)?;
    let mut hasher = StreamHasher::new();
    let mut remaining = size;
    let mut buf = vec![0u8; min(size.max(1), 64 * 1024) as usize];

    while remaining > 0 {
        let want = min(remaining, buf.len() as u64) as usize;
        source
            .read_exact(&mut buf[..want])
            .map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => WriteResourceError::SourceTruncated { remaining },
                _ => WriteResourceError::SourceIo { source: e },
            })?;
        hasher.update(&buf[..want]);
        out.write_all(&buf[..want]).context(WriteIoSnafu)?;
        remaining -= want as u64;
    }

    Ok(WrittenResource {
        reshdr: Reshdr {
            offset_in_wim: start,
            size_in_wim: size,
            uncompressed_size: size,
            flags: extra_flags,
        },
        hash: hasher.finalize(),
    })
}

/// Copies a resource verbatim between containers, preserving its compressed
/// byte image. Chunk-table offsets are relative to the resource start, so
/// relocation is safe.
pub fn copy_resource_raw<R, W>(
    source: &R,
    reshdr: &Reshdr,
    out: &mut W,
) -> Result<Reshdr, WriteResourceError>
where
    R: ReadAt + ?Sized,
    W: Write + Seek,
{
    let start = out.stream_position().context(WriteIoSnafu)?;
    let mut buf = vec![0u8; 64 * 1024];
    let mut copied = 0u64;

    while copied < reshdr.size_in_wim {
        let want = min(buf.len() as u64, reshdr.size_in_wim - copied) as usize;
        source
            .read_exact_at(reshdr.offset_in_wim + copied, &mut buf[..want])
            .context(SourceIoSnafu)?;
        out.write_all(&buf[..want]).context(WriteIoSnafu)?;
        copied += want as u64;
    }

    Ok(Reshdr {
        offset_in_wim: start,
        ..*reshdr
    })
}

/// Streaming reader over one resource, compressed or not.
///
/// Implements [`Read`] and [`Seek`] over the uncompressed byte view.
/// Sequential reads decode chunks on demand into an internal buffer;
/// seeking jumps straight to the containing chunk.
pub struct ResourceReader<'a, R: ReadAt + ?Sized> {
    source: &'a R,
    reshdr: Reshdr,
    chunk_size: u64,
    /// End offsets of every chunk, relative to the resource start. Empty
    /// for uncompressed resources.
    chunk_ends: Vec<u64>,
    table_bytes: u64,
    decompressor: Option<Decompressor>,
    /// Currently buffered chunk, if any.
    buffered: Option<u64>,
    buf: Vec<u8>,
    pos: u64,
}

impl<'a, R: ReadAt + ?Sized> ResourceReader<'a, R> {
    /// Opens a resource for reading. For compressed resources the chunk
    /// offset table is read and validated at construction.
    pub fn new(
        source: &'a R,
        reshdr: Reshdr,
        codec: Option<CodecKind>,
        chunk_size: u32,
    ) -> Result<Self, ReadResourceError> {
        if !reshdr.flags.is_compressed() {
            return Ok(Self {
                source,
                reshdr,
                chunk_size: chunk_size as u64,
                chunk_ends: Vec::new(),
                table_bytes: 0,
                decompressor: None,
                buffered: None,
                buf: Vec::new(),
                pos: 0,
            });
        }

        let codec = codec.context(MissingCodecSnafu)?;
        let decompressor = Decompressor::new(codec, chunk_size).context(CodecSnafu)?;

        let size = reshdr.uncompressed_size;
        let num_chunks = size.div_ceil(chunk_size as u64);
        let entry_width: u64 = if size < WIDE_CHUNK_TABLE_BOUND { 4 } else { 8 };
        let table_bytes = num_chunks.saturating_sub(1) * entry_width;

        let mut table = vec![0u8; table_bytes as usize];
        source
            .read_exact_at(reshdr.offset_in_wim, &mut table)
            .context(ReadIoSnafu)?;

        let mut chunk_ends = Vec::with_capacity(num_chunks as usize);
        let mut prev = table_bytes;

        for i in 0..num_chunks.saturating_sub(1) {
            let off = (i * entry_width) as usize;
            let end = if entry_width == 4 {
                u32::from_le_bytes(table[off..off + 4].try_into().expect("4-byte entry")) as u64
            } else {
                u64::from_le_bytes(table[off..off + 8].try_into().expect("8-byte entry"))
            };

            ensure!(
                end > prev && end <= reshdr.size_in_wim,
                BadChunkTableSnafu {
                    count: num_chunks - 1,
                    index: i,
                }
            );

            chunk_ends.push(end);
            prev = end;
        }

        if num_chunks > 0 {
            // The last chunk's end is implicit: the resource's on-disk end.
            ensure!(
                reshdr.size_in_wim > prev,
                BadChunkTableSnafu {
                    count: num_chunks - 1,
                    index: num_chunks - 1,
                }
            );
            chunk_ends.push(reshdr.size_in_wim);
        }

        Ok(Self {
            source,
            reshdr,
            chunk_size: chunk_size as u64,
            chunk_ends,
            table_bytes,
            decompressor: Some(decompressor),
            buffered: None,
            buf: Vec::new(),
            pos: 0,
        })
    }

    /// The resource header this reader was opened with.
    #[must_use]
    pub fn reshdr(&self) -> &Reshdr {
        &self.reshdr
    }

    /// Total number of uncompressed bytes in the resource.
    #[must_use]
    pub fn uncompressed_size(&self) -> u64 {
        self.reshdr.uncompressed_size
    }

    #[must_use]
    pub fn num_chunks(&self) -> u64 {
        if self.reshdr.flags.is_compressed() {
            self.chunk_ends.len() as u64
        } else {
            self.reshdr.uncompressed_size.div_ceil(self.chunk_size)
        }
    }

    /// Positions the reader at the start of the given chunk.
    pub fn seek_to_chunk(&mut self, chunk_index: u64) -> io::Result<u64> {
        let pos = chunk_index * self.chunk_size;

        if pos > self.reshdr.uncompressed_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "chunk index past end of resource",
            ));
        }

        self.pos = pos;
        Ok(pos)
    }

    /// Uncompressed byte span `[start, end)` of chunk `index`, relative to
    /// the resource's data area.
    fn chunk_span(&self, index: u64) -> (u64, u64) {
        let start = if index == 0 {
            self.table_bytes
        } else {
            self.chunk_ends[index as usize - 1]
        };
        (start, self.chunk_ends[index as usize])
    }

    fn chunk_uncompressed_len(&self, index: u64) -> u64 {
        min(
            self.chunk_size,
            self.reshdr.uncompressed_size - index * self.chunk_size,
        )
    }

    /// Decodes chunk `index` into the internal buffer.
    fn load_chunk(&mut self, index: u64) -> Result<(), ReadResourceError> {
        if self.buffered == Some(index) {
            return Ok(());
        }

        let (start, end) = self.chunk_span(index);
        let stored = end - start;
        let expected = self.chunk_uncompressed_len(index);

        ensure!(
            stored <= expected,
            BadChunkTableSnafu {
                count: self.chunk_ends.len() as u64,
                index,
            }
        );

        if stored == expected {
            // Stored raw; the codec could not shrink this chunk.
            self.buf.resize(expected as usize, 0);
            self.source
                .read_exact_at(self.reshdr.offset_in_wim + start, &mut self.buf)
                .context(ReadIoSnafu)?;
        } else {
            let mut cdata = vec![0u8; stored as usize];
            self.source
                .read_exact_at(self.reshdr.offset_in_wim + start, &mut cdata)
                .context(ReadIoSnafu)?;

            self.buf.resize(expected as usize, 0);
            self.decompressor
                .as_mut()
                .expect("compressed resources always carry a decompressor")
                .decompress(&cdata, &mut self.buf)
                .context(DecompressSnafu { chunk: index })?;
        }

        self.buffered = Some(index);
        Ok(())
    }

    /// Reads the whole resource into memory. Intended for the bounded
    /// metadata resources, not bulk stream data.
    pub fn read_to_vec(&mut self) -> Result<Vec<u8>, ReadResourceError> {
        self.pos = 0;
        let mut out = vec![0u8; self.reshdr.uncompressed_size as usize];
        let mut filled = 0usize;

        while filled < out.len() {
            let n = self.read(&mut out[filled..]).map_err(read_error)?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        ensure!(
            filled == out.len(),
            BadChunkTableSnafu {
                count: self.chunk_ends.len() as u64,
                index: 0u64,
            }
        );

        Ok(out)
    }

    /// Streams the whole resource and returns the SHA-1 of its
    /// uncompressed bytes.
    pub fn compute_hash(&mut self) -> Result<Sha1Digest, ReadResourceError> {
        self.pos = 0;
        let mut hasher = StreamHasher::new();
        let mut buf = vec![0u8; 64 * 1024];

        loop {
            let n = self.read(&mut buf).map_err(read_error)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        Ok(hasher.finalize())
    }
}

/// Recovers the typed error a [`Read`] call wrapped into `io::Error`.
fn read_error(e: io::Error) -> ReadResourceError {
    match e.downcast::<ReadResourceError>() {
        Ok(inner) => inner,
        Err(e) => ReadResourceError::ReadIo { source: e },
    }
}

impl<R: ReadAt + ?Sized> Read for ResourceReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.pos >= self.reshdr.uncompressed_size {
            return Ok(0);
        }

        let remaining_in_resource = self.reshdr.uncompressed_size - self.pos;

        if !self.reshdr.flags.is_compressed() {
            let want = min(buf.len() as u64, remaining_in_resource) as usize;
            let n = self
                .source
                .read_at(self.reshdr.offset_in_wim + self.pos, &mut buf[..want])?;
            self.pos += n as u64;
            return Ok(n);
        }

        let index = self.pos / self.chunk_size;
        let offset_in_chunk = (self.pos % self.chunk_size) as usize;

        self.load_chunk(index).map_err(io::Error::other)?;

        let available = self.buf.len() - offset_in_chunk;
        let n = min(available, buf.len());
        buf[..n].copy_from_slice(&self.buf[offset_in_chunk..offset_in_chunk + n]);
        self.pos += n as u64;

        Ok(n)
    }
}

impl<R: ReadAt + ?Sized> Seek for ResourceReader<'_, R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let size = self.reshdr.uncompressed_size;

        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(offset) => size as i64 + offset,
            SeekFrom::Current(offset) => self.pos as i64 + offset,
        };

        if new_pos < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative position",
            ));
        }

        self.pos = new_pos as u64;
        Ok(self.pos)
    }
}

/// One member stream of a packed resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PackedEntry {
    pub hash: Sha1Digest,
    /// Offset of the member's bytes within the packed resource's
    /// uncompressed view (past the directory).
    pub offset: u64,
    pub size: u64,
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct PackedEntryRaw {
    hash: [u8; 20],
    offset: U64,
    size: U64,
}

/// Builds the directory that prefixes a packed resource's uncompressed
/// stream: a count followed by fixed records locating each member by hash.
#[must_use]
pub fn encode_packed_directory(entries: &[PackedEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + entries.len() * size_of::<PackedEntryRaw>());
    out.extend_from_slice(U32::new(entries.len() as u32).as_bytes());

    for entry in entries {
        let raw = PackedEntryRaw {
            hash: entry.hash.0,
            offset: U64::new(entry.offset),
            size: U64::new(entry.size),
        };
        out.extend_from_slice(raw.as_bytes());
    }

    out
}

/// Number of bytes the directory for `count` members occupies.
#[must_use]
pub fn packed_directory_len(count: usize) -> u64 {
    4 + (count * size_of::<PackedEntryRaw>()) as u64
}

/// Reads the member directory at the start of a packed resource.
pub fn read_packed_directory<R: ReadAt + ?Sized>(
    reader: &mut ResourceReader<'_, R>,
) -> Result<Vec<PackedEntry>, ReadResourceError> {
    reader.rewind().map_err(read_error)?;

    let mut count_buf = [0u8; 4];
    reader
        .read_exact(&mut count_buf)
        .map_err(|_| ReadResourceError::BadPackedDirectory)?;
    let count = u32::from_le_bytes(count_buf) as usize;

    ensure!(
        packed_directory_len(count) <= reader.uncompressed_size(),
        BadPackedDirectorySnafu
    );

    let mut raw = vec![0u8; count * size_of::<PackedEntryRaw>()];
    reader
        .read_exact(&mut raw)
        .map_err(|_| ReadResourceError::BadPackedDirectory)?;

    let mut entries = Vec::with_capacity(count);
    let end = reader.uncompressed_size();

    for chunk in raw.chunks_exact(size_of::<PackedEntryRaw>()) {
        let entry = PackedEntryRaw::read_from_bytes(chunk).expect("chunk is exactly one entry");
        let offset = entry.offset.get();
        let size = entry.size.get();

        ensure!(
            offset.checked_add(size).is_some_and(|e| e <= end),
            BadPackedDirectorySnafu
        );

        entries.push(PackedEntry {
            hash: Sha1Digest(entry.hash),
            offset,
            size,
        });
    }

    Ok(entries)
}

/// Reads one member stream out of a packed resource by hash, feeding it to
/// `sink` in bounded pieces.
pub fn read_packed_member<R, F>(
    reader: &mut ResourceReader<'_, R>,
    hash: &Sha1Digest,
    mut sink: F,
) -> Result<u64, ReadResourceError>
where
    R: ReadAt + ?Sized,
    F: FnMut(&[u8]) -> io::Result<()>,
{
    let entries = read_packed_directory(reader)?;
    let entry = entries
        .iter()
        .find(|e| e.hash == *hash)
        .context(StreamNotInPackSnafu { hash: *hash })?;

    reader
        .seek(SeekFrom::Start(entry.offset))
        .map_err(read_error)?;

    let mut remaining = entry.size;
    let mut buf = vec![0u8; min(entry.size, 64 * 1024) as usize];

    while remaining > 0 {
        let want = min(remaining, buf.len() as u64) as usize;
        reader.read_exact(&mut buf[..want]).map_err(read_error)?;
        sink(&buf[..want]).context(ReadIoSnafu)?;
        remaining -= want as u64;
    }

    Ok(entry.size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecKind;
    use crate::pipeline::new_pipeline;
    use std::io::Cursor;

    const CHUNK: u32 = 1 << 15;

    fn compressible(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i / 512) as u8).collect()
    }

    fn write_one(data: &[u8]) -> (Vec<u8>, WrittenResource) {
        let mut out = Cursor::new(Vec::new());
        let mut pipeline = new_pipeline(CodecKind::Lzx, CHUNK, 50, 1).unwrap();
        let written = write_resource(
            &mut out,
            &mut Cursor::new(data.to_vec()),
            data.len() as u64,
            pipeline.as_mut(),
            ResourceFlags::default(),
            &crate::progress::SilentProgress,
        )
        .unwrap();
        (out.into_inner(), written)
    }

    #[test]
    fn chunk_table_has_expected_entry_count() {
        // 3.5 chunks -> 4 chunks -> 3 stored end offsets.
        let data = compressible(CHUNK as usize * 7 / 2);
        let (file, written) = write_one(&data);

        assert!(written.reshdr.flags.is_compressed());

        let reader = ResourceReader::new(
            &file,
            written.reshdr,
            Some(CodecKind::Lzx),
            CHUNK,
        )
        .unwrap();
        assert_eq!(reader.num_chunks(), 4);

        // The implicit final entry equals the on-disk size.
        assert_eq!(
            *reader.chunk_ends.last().unwrap(),
            written.reshdr.size_in_wim
        );
    }

    #[test]
    fn sequential_read_round_trips() {
        let data = compressible(CHUNK as usize * 2 + 12345);
        let (file, written) = write_one(&data);

        let mut reader =
            ResourceReader::new(&file, written.reshdr, Some(CodecKind::Lzx), CHUNK).unwrap();
        let restored = reader.read_to_vec().unwrap();

        assert_eq!(restored, data);
        assert_eq!(written.hash, Sha1Digest::of(&data));
        assert_eq!(reader.compute_hash().unwrap(), written.hash);
    }

    #[test]
    fn incompressible_stream_is_stored_raw() {
        let mut state = 0x123456789ABCDEFu64;
        let data: Vec<u8> = (0..CHUNK as usize)
            .map(|_| {
                state = state.wrapping_mul(2862933555777941757).wrapping_add(3037000493);
                (state >> 33) as u8
            })
            .collect();

        let (file, written) = write_one(&data);

        assert!(!written.reshdr.flags.is_compressed());
        assert_eq!(written.reshdr.size_in_wim, written.reshdr.uncompressed_size);
        assert_eq!(&file[..], &data[..]);

        let mut reader = ResourceReader::new(&file, written.reshdr, None, CHUNK).unwrap();
        assert_eq!(reader.read_to_vec().unwrap(), data);
    }

    #[test]
    fn seek_and_partial_reads() {
        let data = compressible(CHUNK as usize * 3);
        let (file, written) = write_one(&data);

        let mut reader =
            ResourceReader::new(&file, written.reshdr, Some(CodecKind::Lzx), CHUNK).unwrap();

        reader.seek_to_chunk(2).unwrap();
        let mut tail = Vec::new();
        reader.read_to_end(&mut tail).unwrap();
        assert_eq!(tail, &data[CHUNK as usize * 2..]);

        reader.seek(SeekFrom::Start(100)).unwrap();
        let mut mid = [0u8; 64];
        reader.read_exact(&mut mid).unwrap();
        assert_eq!(&mid[..], &data[100..164]);
    }

    #[test]
    fn packed_directory_round_trips() {
        let entries = vec![
            PackedEntry {
                hash: Sha1Digest::of(b"a"),
                offset: packed_directory_len(2),
                size: 10,
            },
            PackedEntry {
                hash: Sha1Digest::of(b"b"),
                offset: packed_directory_len(2) + 10,
                size: 5,
            },
        ];

        let mut payload = encode_packed_directory(&entries);
        payload.extend_from_slice(&[1u8; 10]);
        payload.extend_from_slice(&[2u8; 5]);

        let mut out = Cursor::new(Vec::new());
        let written =
            write_resource_uncompressed(&mut out, &payload, ResourceFlags::new(ResourceFlags::PACKED))
                .unwrap();
        let file = out.into_inner();

        let mut reader = ResourceReader::new(&file, written.reshdr, None, CHUNK).unwrap();
        assert_eq!(read_packed_directory(&mut reader).unwrap(), entries);

        let mut member = Vec::new();
        let n = read_packed_member(&mut reader, &Sha1Digest::of(b"b"), |bytes| {
            member.extend_from_slice(bytes);
            Ok(())
        })
        .unwrap();
        assert_eq!(n, 5);
        assert_eq!(member, vec![2u8; 5]);

        let missing = read_packed_member(&mut reader, &Sha1Digest::of(b"zz"), |_| Ok(()));
        assert!(matches!(
            missing,
            Err(ReadResourceError::StreamNotInPack { .. })
        ));
    }
}
