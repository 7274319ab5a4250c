//! The content-addressed stream store, known on disk as the lookup table.
//!
//! Every stream a WIM holds is keyed by the SHA-1 of its uncompressed
//! bytes. The store tracks where each stream's bytes currently live (in
//! this WIM, in an attached buffer, in a staging file, or in another opened
//! WIM), its reference count, and the on-disk entries serialized into the
//! lookup table resource.

use crate::codec::CodecKind;
use crate::hash::{Sha1Digest, hash_reader};
use crate::io::ReadAt;
use crate::reshdr::{Reshdr, ResourceFlags};
use snafu::{ResultExt, Snafu};
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Size of one on-disk lookup-table entry.
pub const LOOKUP_ENTRY_SIZE: usize = 50;

/// Container holding a stream that lives outside the owning WIM.
///
/// The `Arc` keeps the external WIM's reader alive for as long as any
/// entry references it.
#[derive(Clone)]
pub struct ExternalBacking {
    pub reader: Arc<dyn ReadAt>,
    pub codec: Option<CodecKind>,
    pub chunk_size: u32,
}

impl std::fmt::Debug for ExternalBacking {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalBacking")
            .field("codec", &self.codec)
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

/// Where a stream's bytes currently live.
#[derive(Clone, Debug)]
pub enum ResourceLocation {
    /// Stored in the owning WIM at `Lte::reshdr`.
    InWim,
    /// Held in memory, not yet written.
    Buffer(Vec<u8>),
    /// Spilled to a staging file on disk, not yet written.
    StagingFile(PathBuf),
    /// Stored in another opened WIM.
    ExternalWim(ExternalBacking),
}

impl ResourceLocation {
    /// Returns `true` when the bytes are not yet stored in any WIM and the
    /// caller is responsible for them until the next write commits.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Buffer(_) | Self::StagingFile(_))
    }
}

/// Lookup table entry: identity and bookkeeping of one content-addressed
/// stream.
///
/// Once `unhashed` is false, `hash` is the SHA-1 of the uncompressed
/// concatenation of all the stream's chunks. The `reshdr` of an entry whose
/// stream is on disk is immutable; rewriting the stream produces a new
/// entry.
#[derive(Clone, Debug)]
pub struct Lte {
    pub hash: Sha1Digest,
    pub reshdr: Reshdr,
    pub refcount: u32,
    pub part_number: u16,
    pub unhashed: bool,
    pub location: ResourceLocation,
}

impl Lte {
    /// Creates an entry for a stream already stored in the owning WIM.
    #[must_use]
    pub fn in_wim(hash: Sha1Digest, reshdr: Reshdr, refcount: u32, part_number: u16) -> Self {
        Self {
            hash,
            reshdr,
            refcount,
            part_number,
            unhashed: false,
            location: ResourceLocation::InWim,
        }
    }

    /// Creates an entry for bytes held in memory, hashed eagerly.
    #[must_use]
    pub fn from_buffer(data: Vec<u8>) -> Self {
        let hash = Sha1Digest::of(&data);
        Self {
            hash,
            reshdr: Reshdr {
                uncompressed_size: data.len() as u64,
                ..Reshdr::default()
            },
            refcount: 1,
            part_number: 1,
            unhashed: false,
            location: ResourceLocation::Buffer(data),
        }
    }

    /// Creates an unhashed entry for a staging file whose digest is not yet
    /// known; [`StreamStore::checksum_unhashed`] promotes it later.
    #[must_use]
    pub fn from_staging_file(path: PathBuf, size: u64) -> Self {
        Self {
            hash: Sha1Digest::ZERO,
            reshdr: Reshdr {
                uncompressed_size: size,
                ..Reshdr::default()
            },
            refcount: 1,
            part_number: 1,
            unhashed: true,
            location: ResourceLocation::StagingFile(path),
        }
    }

    /// Uncompressed size of the stream.
    #[must_use]
    pub fn size(&self) -> u64 {
        match &self.location {
            ResourceLocation::Buffer(data) => data.len() as u64,
            _ => self.reshdr.uncompressed_size,
        }
    }

    #[must_use]
    pub fn is_metadata(&self) -> bool {
        self.reshdr.flags.is_metadata()
    }
}

/// On-disk lookup-table entry.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct LteRaw {
    reshdr: [u8; Reshdr::DISK_SIZE],
    part_number: U16,
    refcount: U32,
    hash: [u8; 20],
}

/// Errors when materializing unhashed streams.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ChecksumError {
    #[snafu(display("cannot open staging file {}", path.display()))]
    OpenStaging { path: PathBuf, source: io::Error },

    #[snafu(display("cannot read staging file {}", path.display()))]
    ReadStaging { path: PathBuf, source: io::Error },
}

/// Errors when parsing a serialized lookup table.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ParseError {
    #[snafu(display("lookup table size {size} is not a multiple of {LOOKUP_ENTRY_SIZE}"))]
    MisalignedTable { size: u64 },
}

/// In-memory mapping from SHA-1 digest to [`Lte`].
#[derive(Default)]
pub struct StreamStore {
    entries: HashMap<Sha1Digest, Lte>,
    unhashed: Vec<Lte>,
}

impl StreamStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of unhashed entries awaiting checksumming.
    #[must_use]
    pub fn unhashed_count(&self) -> usize {
        self.unhashed.len()
    }

    pub fn lookup(&self, hash: &Sha1Digest) -> Option<&Lte> {
        self.entries.get(hash)
    }

    pub fn lookup_mut(&mut self, hash: &Sha1Digest) -> Option<&mut Lte> {
        self.entries.get_mut(hash)
    }

    /// Inserts `lte`, or folds it into an existing entry with the same
    /// hash by adding its refcount. Returns the hash and whether a new
    /// entry was created.
    pub fn insert_or_coalesce(&mut self, lte: Lte) -> (Sha1Digest, bool) {
        debug_assert!(!lte.unhashed);
        let hash = lte.hash;

        match self.entries.get_mut(&hash) {
            Some(existing) => {
                existing.refcount += lte.refcount;
                existing.reshdr.flags = existing.reshdr.flags.without(ResourceFlags::FREE);
                (hash, false)
            }
            None => {
                self.entries.insert(hash, lte);
                (hash, true)
            }
        }
    }

    /// Queues an entry whose bytes are still being fed; it joins the hash
    /// index once [`checksum_unhashed`](Self::checksum_unhashed) runs.
    pub fn add_unhashed(&mut self, lte: Lte) {
        debug_assert!(lte.unhashed);
        self.unhashed.push(lte);
    }

    /// Increments the refcount of an existing entry. Returns the new count,
    /// or `None` if the hash is unknown.
    pub fn increment(&mut self, hash: &Sha1Digest) -> Option<u32> {
        let lte = self.entries.get_mut(hash)?;
        lte.refcount += 1;
        lte.reshdr.flags = lte.reshdr.flags.without(ResourceFlags::FREE);
        Some(lte.refcount)
    }

    /// Decrements the refcount of an existing entry. A count of zero marks
    /// the resource free; reclamation happens at the next write.
    pub fn decrement(&mut self, hash: &Sha1Digest) -> Option<u32> {
        let lte = self.entries.get_mut(hash)?;
        lte.refcount = lte.refcount.saturating_sub(1);

        if lte.refcount == 0 {
            lte.reshdr.flags = lte.reshdr.flags.with(ResourceFlags::FREE);
        }

        Some(lte.refcount)
    }

    /// Computes the digest of every unhashed entry and merges each into the
    /// hash index, deduplicating against existing entries.
    pub fn checksum_unhashed(&mut self) -> Result<(), ChecksumError> {
        for mut lte in std::mem::take(&mut self.unhashed) {
            let hash = match &lte.location {
                ResourceLocation::Buffer(data) => Sha1Digest::of(data),
                ResourceLocation::StagingFile(path) => {
                    let mut file = File::open(path).context(OpenStagingSnafu { path })?;
                    let (hash, size) =
                        hash_reader(&mut file).context(ReadStagingSnafu { path })?;
                    lte.reshdr.uncompressed_size = size;
                    hash
                }
                // In-WIM and external streams always arrive hashed.
                ResourceLocation::InWim | ResourceLocation::ExternalWim(_) => lte.hash,
            };

            lte.hash = hash;
            lte.unhashed = false;
            self.insert_or_coalesce(lte);
        }

        Ok(())
    }

    /// Removes entries whose refcount reached zero. Only meaningful once
    /// refcounts are known good; the caller gates on that.
    pub fn reclaim_free(&mut self) {
        self.entries
            .retain(|_, lte| lte.refcount > 0 && !lte.reshdr.flags.is_free());
    }

    pub fn zero_refcounts(&mut self) {
        for lte in self.entries.values_mut() {
            lte.refcount = 0;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Lte> {
        self.entries.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Lte> {
        self.entries.values_mut()
    }

    /// All entries in deterministic serialization order: ascending file
    /// offset, ties broken by hash (pending entries have offset zero until
    /// written).
    #[must_use]
    pub fn sorted_for_write(&self) -> Vec<&Lte> {
        let mut entries: Vec<&Lte> = self.entries.values().collect();
        entries.sort_by_key(|lte| (lte.reshdr.offset_in_wim, lte.hash));
        entries
    }

    /// Parses the uncompressed bytes of a lookup table resource.
    ///
    /// Metadata entries are returned separately, in table order; that order
    /// defines the 1-based image indices.
    pub fn parse(data: &[u8]) -> Result<(Self, Vec<Lte>), ParseError> {
        snafu::ensure!(
            data.len() % LOOKUP_ENTRY_SIZE == 0,
            MisalignedTableSnafu {
                size: data.len() as u64,
            }
        );

        let mut store = Self::new();
        let mut metadata = Vec::new();

        for raw in data.chunks_exact(LOOKUP_ENTRY_SIZE) {
            let raw = LteRaw::read_from_bytes(raw).expect("chunk is exactly one entry");
            let reshdr = Reshdr::from_bytes(&raw.reshdr);

            let lte = Lte::in_wim(
                Sha1Digest(raw.hash),
                reshdr,
                raw.refcount.get(),
                raw.part_number.get(),
            );

            if reshdr.flags.is_metadata() {
                metadata.push(lte);
            } else {
                store.entries.insert(lte.hash, lte);
            }
        }

        Ok((store, metadata))
    }

    /// Serializes the on-disk table: fixed 50-byte records.
    ///
    /// Metadata entries come first, in image order, because their table
    /// order defines the 1-based image indices. Stream entries follow in
    /// deterministic offset-ascending order (ties broken by hash), keeping
    /// rebuilds byte-stable for integrity-table reuse. Metadata-flagged
    /// entries living in the store are emitted only through
    /// `metadata_entries`.
    #[must_use]
    pub fn serialize(&self, metadata_entries: &[&Lte]) -> Vec<u8> {
        let mut streams: Vec<&Lte> = self
            .entries
            .values()
            .filter(|lte| {
                lte.refcount > 0 && !lte.reshdr.flags.is_free() && !lte.is_metadata()
            })
            .collect();
        streams.sort_by_key(|lte| (lte.reshdr.offset_in_wim, lte.hash));

        let mut all: Vec<&Lte> = metadata_entries.to_vec();
        all.extend(streams);

        encode_entries(&all)
    }
}

/// Encodes entries into consecutive 50-byte on-disk records, in the order
/// given.
pub(crate) fn encode_entries(entries: &[&Lte]) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.len() * LOOKUP_ENTRY_SIZE);

    for lte in entries {
        let raw = LteRaw {
            reshdr: lte.reshdr.to_bytes(),
            part_number: U16::new(lte.part_number),
            refcount: U32::new(lte.refcount),
            hash: lte.hash.0,
        };
        out.extend_from_slice(raw.as_bytes());
    }

    out
}

impl std::fmt::Debug for StreamStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamStore")
            .field("entries", &self.entries.len())
            .field("unhashed", &self.unhashed.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_lte(data: &[u8]) -> Lte {
        Lte::from_buffer(data.to_vec())
    }

    #[test]
    fn raw_entry_is_50_bytes() {
        assert_eq!(size_of::<LteRaw>(), LOOKUP_ENTRY_SIZE);
    }

    #[test]
    fn duplicate_insert_coalesces_to_one_entry() {
        let mut store = StreamStore::new();

        let (hash_a, created_a) = store.insert_or_coalesce(buffer_lte(b"same bytes"));
        let (hash_b, created_b) = store.insert_or_coalesce(buffer_lte(b"same bytes"));

        assert_eq!(hash_a, hash_b);
        assert!(created_a);
        assert!(!created_b);
        assert_eq!(store.len(), 1);
        assert_eq!(store.lookup(&hash_a).unwrap().refcount, 2);
    }

    #[test]
    fn decrement_to_zero_marks_free_and_reclaim_drops() {
        let mut store = StreamStore::new();
        let (hash, _) = store.insert_or_coalesce(buffer_lte(b"short-lived"));

        assert_eq!(store.decrement(&hash), Some(0));
        assert!(store.lookup(&hash).unwrap().reshdr.flags.is_free());

        // Re-referencing a free entry revives it.
        assert_eq!(store.increment(&hash), Some(1));
        assert!(!store.lookup(&hash).unwrap().reshdr.flags.is_free());

        store.decrement(&hash);
        store.reclaim_free();
        assert!(store.lookup(&hash).is_none());
    }

    #[test]
    fn unhashed_buffer_coalesces_after_checksum() {
        let mut store = StreamStore::new();
        store.insert_or_coalesce(buffer_lte(b"payload"));

        let mut pending = Lte::from_buffer(b"payload".to_vec());
        pending.hash = Sha1Digest::ZERO;
        pending.unhashed = true;
        store.add_unhashed(pending);

        assert_eq!(store.unhashed_count(), 1);
        store.checksum_unhashed().unwrap();
        assert_eq!(store.unhashed_count(), 0);
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.lookup(&Sha1Digest::of(b"payload")).unwrap().refcount,
            2
        );
    }

    #[test]
    fn serialization_round_trips_offset_ascending() {
        let mut store = StreamStore::new();

        for (offset, data) in [(9000u64, &b"c"[..]), (300, b"a"), (4096, b"b")] {
            let mut lte = buffer_lte(data);
            lte.reshdr.offset_in_wim = offset;
            lte.reshdr.size_in_wim = 1;
            lte.location = ResourceLocation::InWim;
            store.insert_or_coalesce(lte);
        }

        let bytes = store.serialize(&[]);
        assert_eq!(bytes.len(), 3 * LOOKUP_ENTRY_SIZE);

        let (reread, metadata) = StreamStore::parse(&bytes).unwrap();
        assert!(metadata.is_empty());
        assert_eq!(reread.len(), 3);

        // Deterministic: serializing the parsed table reproduces the bytes.
        assert_eq!(reread.serialize(&[]), bytes);

        // Offset-ascending order on disk.
        let offsets: Vec<u64> = bytes
            .chunks_exact(LOOKUP_ENTRY_SIZE)
            .map(|raw| Reshdr::from_bytes(&raw[..24].try_into().unwrap()).offset_in_wim)
            .collect();
        assert_eq!(offsets, vec![300, 4096, 9000]);
    }

    #[test]
    fn misaligned_table_is_rejected() {
        assert!(matches!(
            StreamStore::parse(&[0u8; 49]),
            Err(ParseError::MisalignedTable { size: 49 })
        ));
    }

    #[test]
    fn metadata_entries_split_out_in_order() {
        let mut meta1 = buffer_lte(b"image one tree");
        meta1.reshdr.flags = meta1.reshdr.flags.with(ResourceFlags::METADATA);
        meta1.reshdr.offset_in_wim = 100;
        let mut meta2 = buffer_lte(b"image two tree");
        meta2.reshdr.flags = meta2.reshdr.flags.with(ResourceFlags::METADATA);
        meta2.reshdr.offset_in_wim = 200;

        let store = StreamStore::new();
        let bytes = store.serialize(&[&meta1, &meta2]);

        let (reread, metadata) = StreamStore::parse(&bytes).unwrap();
        assert_eq!(reread.len(), 0);
        assert_eq!(metadata.len(), 2);
        assert_eq!(metadata[0].hash, meta1.hash);
        assert_eq!(metadata[1].hash, meta2.hash);
    }
}
