//! The optional integrity table: SHA-1 digests over fixed-size slices of
//! the resource area `[header_end, lookup_table_end)`.

use crate::hash::{SHA1_LEN, Sha1Digest};
use crate::header::{HEADER_SIZE, WimHeader};
use crate::io::ReadAt;
use crate::progress::{ProgressAction, WimProgress};
use snafu::{ResultExt, Snafu, ensure};
use std::cmp::min;
use std::io::{self, Read, Seek, SeekFrom};
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Size of each slice the integrity table covers, by long-standing
/// convention.
pub const INTEGRITY_CHUNK_SIZE: u32 = 10 * 1024 * 1024;

/// Outcome of an integrity check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntegrityStatus {
    /// Every slice digest matched.
    Ok,
    /// At least one slice digest mismatched.
    NotOk {
        /// Index of the first mismatched slice.
        first_bad_chunk: usize,
    },
    /// The WIM carries no integrity table.
    Nonexistent,
}

/// Errors while computing or checking integrity.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum IntegrityError {
    #[snafu(display("i/o failed over the resource area"))]
    Io { source: io::Error },

    #[snafu(display("integrity table is malformed"))]
    Malformed,

    #[snafu(display("integrity operation aborted"))]
    Aborted,
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct IntegrityTableHeaderRaw {
    entry_size: U32,
    entry_count: U32,
    chunk_size: U32,
}

/// Computes the serialized integrity table over `[HEADER_SIZE, end)` of a
/// seekable container.
///
/// Identical resource-area bytes always produce identical tables, so a
/// write-verify-rewrite cycle is byte-stable.
pub fn compute_integrity_table<R: Read + Seek>(
    reader: &mut R,
    end: u64,
    progress: &dyn WimProgress,
) -> Result<Vec<u8>, IntegrityError> {
    debug_assert!(end >= HEADER_SIZE as u64);

    let covered = end - HEADER_SIZE as u64;
    let entry_count = covered.div_ceil(INTEGRITY_CHUNK_SIZE as u64);

    let mut out = Vec::with_capacity(
        size_of::<IntegrityTableHeaderRaw>() + entry_count as usize * SHA1_LEN,
    );
    let header = IntegrityTableHeaderRaw {
        entry_size: U32::new(SHA1_LEN as u32),
        entry_count: U32::new(entry_count as u32),
        chunk_size: U32::new(INTEGRITY_CHUNK_SIZE),
    };
    out.extend_from_slice(header.as_bytes());

    reader
        .seek(SeekFrom::Start(HEADER_SIZE as u64))
        .context(IoSnafu)?;

    let mut remaining = covered;
    let mut buf = vec![0u8; min(covered, INTEGRITY_CHUNK_SIZE as u64) as usize];
    let mut index = 0usize;

    while remaining > 0 {
        let want = min(remaining, INTEGRITY_CHUNK_SIZE as u64) as usize;
        reader.read_exact(&mut buf[..want]).context(IoSnafu)?;

        out.extend_from_slice(Sha1Digest::of(&buf[..want]).as_bytes());
        remaining -= want as u64;

        if progress.integrity_chunk(index, entry_count as usize) == ProgressAction::Abort {
            return AbortedSnafu.fail();
        }
        index += 1;
    }

    Ok(out)
}

/// Verifies the WIM's integrity table against the bytes currently in the
/// container.
pub fn check_integrity<R: ReadAt + ?Sized>(
    reader: &R,
    header: &WimHeader,
    progress: &dyn WimProgress,
) -> Result<IntegrityStatus, IntegrityError> {
    let reshdr = header.integrity_table_reshdr;

    if reshdr.is_absent() {
        return Ok(IntegrityStatus::Nonexistent);
    }

    // The integrity table itself is stored uncompressed.
    let mut table = vec![0u8; reshdr.size_in_wim as usize];
    reader
        .read_exact_at(reshdr.offset_in_wim, &mut table)
        .context(IoSnafu)?;

    let (raw, digests) = IntegrityTableHeaderRaw::read_from_prefix(&table)
        .map_err(|_| IntegrityError::Malformed)?;

    ensure!(raw.entry_size.get() == SHA1_LEN as u32, MalformedSnafu);

    let chunk_size = raw.chunk_size.get() as u64;
    let entry_count = raw.entry_count.get() as usize;

    ensure!(chunk_size > 0, MalformedSnafu);
    ensure!(digests.len() >= entry_count * SHA1_LEN, MalformedSnafu);

    let end = header.lookup_table_reshdr.end_offset();
    let covered = end.saturating_sub(HEADER_SIZE as u64);

    ensure!(
        covered.div_ceil(chunk_size) == entry_count as u64,
        MalformedSnafu
    );

    let mut buf = vec![0u8; min(covered.max(1), chunk_size) as usize];
    let mut offset = HEADER_SIZE as u64;

    for index in 0..entry_count {
        let want = min(chunk_size, end - offset) as usize;
        reader
            .read_exact_at(offset, &mut buf[..want])
            .context(IoSnafu)?;

        let expected = &digests[index * SHA1_LEN..(index + 1) * SHA1_LEN];

        if Sha1Digest::of(&buf[..want]).as_bytes() != expected {
            return Ok(IntegrityStatus::NotOk {
                first_bad_chunk: index,
            });
        }

        if progress.integrity_chunk(index, entry_count) == ProgressAction::Abort {
            return AbortedSnafu.fail();
        }

        offset += want as u64;
    }

    Ok(IntegrityStatus::Ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::SilentProgress;
    use crate::reshdr::Reshdr;
    use std::io::Cursor;

    fn fake_header(resource_area: &[u8], table: &[u8]) -> (Vec<u8>, WimHeader) {
        // Container: header padding, resource area, integrity table.
        let mut file = vec![0u8; HEADER_SIZE];
        file.extend_from_slice(resource_area);
        let table_offset = file.len() as u64;
        file.extend_from_slice(table);

        let mut header = WimHeader::new(None, 1 << 15);
        header.lookup_table_reshdr = Reshdr {
            offset_in_wim: HEADER_SIZE as u64 + resource_area.len() as u64,
            size_in_wim: 0,
            uncompressed_size: 0,
            flags: Default::default(),
        };
        header.integrity_table_reshdr = Reshdr {
            offset_in_wim: table_offset,
            size_in_wim: table.len() as u64,
            uncompressed_size: table.len() as u64,
            flags: Default::default(),
        };

        (file, header)
    }

    #[test]
    fn compute_then_check_is_ok() {
        let area = vec![0xA5u8; 4096];
        let mut file = vec![0u8; HEADER_SIZE];
        file.extend_from_slice(&area);

        let end = file.len() as u64;
        let table =
            compute_integrity_table(&mut Cursor::new(file.clone()), end, &SilentProgress).unwrap();

        let (file, header) = fake_header(&area, &table);
        assert_eq!(
            check_integrity(&file, &header, &SilentProgress).unwrap(),
            IntegrityStatus::Ok
        );
    }

    #[test]
    fn recompute_is_byte_identical() {
        let mut file = vec![0u8; HEADER_SIZE];
        file.extend_from_slice(&vec![7u8; 100_000]);
        let end = file.len() as u64;

        let a = compute_integrity_table(&mut Cursor::new(file.clone()), end, &SilentProgress)
            .unwrap();
        let b =
            compute_integrity_table(&mut Cursor::new(file), end, &SilentProgress).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn flipped_byte_reports_first_bad_chunk() {
        let area = vec![0x11u8; 8192];
        let mut file = vec![0u8; HEADER_SIZE];
        file.extend_from_slice(&area);
        let end = file.len() as u64;
        let table =
            compute_integrity_table(&mut Cursor::new(file), end, &SilentProgress).unwrap();

        let (mut file, header) = fake_header(&area, &table);
        file[HEADER_SIZE + 100] ^= 0xFF;

        assert_eq!(
            check_integrity(&file, &header, &SilentProgress).unwrap(),
            IntegrityStatus::NotOk { first_bad_chunk: 0 }
        );
    }

    #[test]
    fn absent_table_is_nonexistent() {
        let header = WimHeader::new(None, 1 << 15);
        let file = vec![0u8; HEADER_SIZE];

        assert_eq!(
            check_integrity(&file, &header, &SilentProgress).unwrap(),
            IntegrityStatus::Nonexistent
        );
    }
}
