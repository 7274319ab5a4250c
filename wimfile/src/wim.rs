use crate::codec::{CodecKind, CompressionConfig};
use crate::hash::Sha1Digest;
use crate::header::{HEADER_SIZE, WimHeader};
use crate::integrity::{self, IntegrityError, IntegrityStatus};
use crate::io::ReadAt;
use crate::metadata::{ImageMetadata, MetadataBlob, MetadataError};
use crate::progress::WimProgress;
use crate::resource::{self, ReadResourceError, ResourceReader};
use crate::reshdr::ResourceFlags;
use crate::store::{Lte, ParseError, ResourceLocation, StreamStore};
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use std::cmp::min;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Byte-order mark opening the UTF-16LE XML info blob.
const XML_BOM: [u8; 2] = [0xFF, 0xFE];

/// Receives the bytes of one stream during [`Wim::read_stream`].
///
/// `begin` is called once before any data, `chunk` for each bounded piece
/// in order, and `end` exactly once afterwards with whether the stream was
/// delivered completely.
pub trait StreamConsumer {
    fn begin(&mut self, _lte: &Lte) -> io::Result<()> {
        Ok(())
    }

    fn chunk(&mut self, data: &[u8]) -> io::Result<()>;

    fn end(&mut self, _complete: bool) {}
}

impl<F: FnMut(&[u8]) -> io::Result<()>> StreamConsumer for F {
    fn chunk(&mut self, data: &[u8]) -> io::Result<()> {
        self(data)
    }
}

/// Errors when opening a WIM.
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum OpenError {
    #[snafu(display("cannot open {}", path.display()))]
    OpenFile { path: PathBuf, source: io::Error },

    #[snafu(display("cannot parse header"))]
    Header { source: crate::header::ReadError },

    #[snafu(display("chunk size {chunk_size} is not valid for {codec}"))]
    BadChunkSize { codec: CodecKind, chunk_size: u32 },

    #[snafu(display("cannot read lookup table"))]
    LookupTable { source: ReadResourceError },

    #[snafu(display("cannot parse lookup table"))]
    ParseLookup { source: ParseError },

    #[snafu(display("header says {expected} images, lookup table holds {actual}"))]
    ImageCountMismatch { expected: u32, actual: usize },

    #[snafu(display("cannot read XML data"))]
    XmlData { source: ReadResourceError },
}

/// Errors when creating an empty WIM.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum CreateError {
    #[snafu(display("chunk size {chunk_size} is not valid for {codec}"))]
    InvalidChunkSize { codec: CodecKind, chunk_size: u32 },
}

/// Errors when adding an image.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum AddImageError {
    #[snafu(display("image references unknown stream {hash}"))]
    MissingStream { hash: Sha1Digest },
}

/// Errors when reading a stream out of the store.
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum ReadStreamError {
    #[snafu(display("no stream with hash {hash}"))]
    UnknownStream { hash: Sha1Digest },

    #[snafu(display("stream is in the WIM but no backing file is open"))]
    NoBackingFile,

    #[snafu(display("cannot decode resource"))]
    Resource { source: ReadResourceError },

    #[snafu(display("cannot read staging file {}", path.display()))]
    Staging { path: PathBuf, source: io::Error },

    #[snafu(display("consumer rejected stream data"))]
    Consumer { source: io::Error },
}

/// Errors when materializing an image's metadata.
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum MetadataReadError {
    #[snafu(display("no image #{index}"))]
    NoSuchImage { index: usize },

    #[snafu(display("cannot read metadata stream"))]
    Read { source: ReadStreamError },

    #[snafu(display("cannot decode metadata blob"))]
    Decode { source: MetadataError },

    #[snafu(display("metadata stream hash mismatch: expected {expected}, got {actual}"))]
    HashMismatch {
        expected: Sha1Digest,
        actual: Sha1Digest,
    },
}

/// Error for an out-of-range image index.
#[derive(Debug, Snafu)]
#[snafu(display("no image #{index}"))]
pub struct BadImageIndexError {
    pub index: usize,
}

/// Errors when deleting an image.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum DeleteImageError {
    #[snafu(display("no image #{index}"))]
    NoImage { index: usize },

    #[snafu(display("cannot materialize image metadata"))]
    Materialize { source: MetadataReadError },
}

/// An opened or in-construction WIM container.
///
/// A `Wim` owns its backing reader (if any), the parsed header, the stream
/// store, and the per-image metadata handles. Streams referenced from other
/// opened WIMs hold owning back-references, so a sub-WIM outlives every
/// `Wim` that borrows streams from it.
pub struct Wim {
    pub(crate) reader: Option<Arc<dyn ReadAt>>,
    pub(crate) path: Option<PathBuf>,
    pub(crate) header: WimHeader,
    pub(crate) store: StreamStore,
    pub(crate) images: Vec<ImageMetadata>,
    pub(crate) xml_data: Vec<u8>,
    pub(crate) compression: CompressionConfig,
    /// Whether every refcount in the store is known correct. Some producers
    /// write WIMs with wrong counts, so this starts false for opened WIMs
    /// until [`recalculate_refcounts`](Self::recalculate_refcounts) runs.
    pub(crate) refcnts_ok: bool,
    pub(crate) deletion_occurred: bool,
}

impl std::fmt::Debug for Wim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wim")
            .field("image_count", &self.images.len())
            .field("streams", &self.store.len())
            .field("codec", &self.header.codec())
            .field("chunk_size", &self.header.chunk_size)
            .finish_non_exhaustive()
    }
}

impl Wim {
    /// Creates a fresh, empty WIM with the given output codec and chunk
    /// size. Nothing touches disk until a write commits.
    pub fn create(codec: Option<CodecKind>, chunk_size: u32) -> Result<Self, CreateError> {
        if let Some(codec) = codec {
            ensure!(
                codec.chunk_size_valid(chunk_size),
                InvalidChunkSizeSnafu { codec, chunk_size }
            );
        }

        Ok(Self {
            reader: None,
            path: None,
            header: WimHeader::new(codec, chunk_size),
            store: StreamStore::new(),
            images: Vec::new(),
            xml_data: default_xml(),
            compression: CompressionConfig::new(),
            refcnts_ok: true,
            deletion_occurred: false,
        })
    }

    /// Opens a WIM file from disk.
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self, OpenError> {
        let path = path.as_ref();
        let file = File::open(path).context(open_error::OpenFileSnafu { path })?;

        Self::open_inner(Arc::new(file), Some(path.to_path_buf()))
    }

    /// Opens a WIM from any positional-read source, e.g. an in-memory
    /// buffer or a memory map.
    pub fn from_reader(reader: impl ReadAt + 'static) -> Result<Self, OpenError> {
        Self::open_inner(Arc::new(reader), None)
    }

    fn open_inner(reader: Arc<dyn ReadAt>, path: Option<PathBuf>) -> Result<Self, OpenError> {
        let header = WimHeader::read_from(&*reader).context(open_error::HeaderSnafu)?;

        if let Some(codec) = header.codec() {
            ensure!(
                codec.chunk_size_valid(header.chunk_size),
                open_error::BadChunkSizeSnafu {
                    codec,
                    chunk_size: header.chunk_size,
                }
            );
        }

        let mut store = StreamStore::new();
        let mut images = Vec::new();

        if !header.lookup_table_reshdr.is_absent() {
            let mut table_reader = ResourceReader::new(
                &*reader,
                header.lookup_table_reshdr,
                header.codec(),
                header.chunk_size,
            )
            .context(open_error::LookupTableSnafu)?;
            let bytes = table_reader
                .read_to_vec()
                .context(open_error::LookupTableSnafu)?;

            let (parsed, metadata_entries) =
                StreamStore::parse(&bytes).context(open_error::ParseLookupSnafu)?;
            store = parsed;

            ensure!(
                metadata_entries.len() == header.image_count as usize,
                open_error::ImageCountMismatchSnafu {
                    expected: header.image_count,
                    actual: metadata_entries.len(),
                }
            );

            for lte in metadata_entries {
                images.push(ImageMetadata::unloaded(lte.hash));
                store.insert_or_coalesce(lte);
            }
        } else {
            ensure!(
                header.image_count == 0,
                open_error::ImageCountMismatchSnafu {
                    expected: header.image_count,
                    actual: 0usize,
                }
            );
        }

        let xml_data = if header.xml_data_reshdr.is_absent() {
            default_xml()
        } else {
            let mut xml_reader = ResourceReader::new(
                &*reader,
                header.xml_data_reshdr,
                header.codec(),
                header.chunk_size,
            )
            .context(open_error::XmlDataSnafu)?;
            xml_reader.read_to_vec().context(open_error::XmlDataSnafu)?
        };

        Ok(Self {
            reader: Some(reader),
            path,
            header,
            store,
            images,
            xml_data,
            compression: CompressionConfig::new(),
            refcnts_ok: false,
            deletion_occurred: false,
        })
    }

    /// Number of images in the WIM.
    #[must_use]
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    #[must_use]
    pub fn guid(&self) -> &[u8; 16] {
        &self.header.guid
    }

    #[must_use]
    pub fn codec(&self) -> Option<CodecKind> {
        self.header.codec()
    }

    #[must_use]
    pub fn chunk_size(&self) -> u32 {
        self.header.chunk_size
    }

    #[must_use]
    pub fn is_pipable(&self) -> bool {
        self.header.is_pipable()
    }

    #[must_use]
    pub fn has_integrity_table(&self) -> bool {
        self.header.has_integrity_table()
    }

    #[must_use]
    pub fn header(&self) -> &WimHeader {
        &self.header
    }

    /// The opaque XML info blob, UTF-16LE with byte-order mark.
    #[must_use]
    pub fn xml_data(&self) -> &[u8] {
        &self.xml_data
    }

    pub fn set_xml_data(&mut self, data: Vec<u8>) {
        self.xml_data = data;
    }

    #[must_use]
    pub fn boot_index(&self) -> u32 {
        self.header.boot_index
    }

    /// Selects the boot image. Zero means no boot image.
    pub fn set_boot_index(&mut self, index: u32) -> Result<(), BadImageIndexError> {
        ensure!(
            index as usize <= self.images.len(),
            BadImageIndexSnafu {
                index: index as usize,
            }
        );
        self.header.boot_index = index;
        Ok(())
    }

    /// Per-codec output compression levels.
    #[must_use]
    pub fn compression_config(&self) -> &CompressionConfig {
        &self.compression
    }

    pub fn compression_config_mut(&mut self) -> &mut CompressionConfig {
        &mut self.compression
    }

    #[must_use]
    pub fn store(&self) -> &StreamStore {
        &self.store
    }

    /// Submits a stream held in memory. The bytes are hashed immediately
    /// and deduplicated against the store; resubmitting identical bytes
    /// yields the same hash with a bumped refcount.
    pub fn add_stream_from_buffer(&mut self, data: Vec<u8>) -> Sha1Digest {
        self.store.insert_or_coalesce(Lte::from_buffer(data)).0
    }

    /// Submits a stream from any reader, buffering it in memory.
    pub fn add_stream_from_reader(&mut self, reader: &mut impl Read) -> io::Result<Sha1Digest> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Ok(self.add_stream_from_buffer(data))
    }

    /// Submits a stream backed by a staging file on disk. The stream stays
    /// unhashed until the next write (or an explicit
    /// [`checksum_unhashed`](Self::checksum_unhashed)) reads and digests it.
    pub fn add_stream_from_file(&mut self, path: impl Into<PathBuf>) -> io::Result<()> {
        let path = path.into();
        let size = std::fs::metadata(&path)?.len();
        self.store.add_unhashed(Lte::from_staging_file(path, size));
        Ok(())
    }

    /// Hashes all pending unhashed streams and folds duplicates together.
    pub fn checksum_unhashed(&mut self) -> Result<(), crate::store::ChecksumError> {
        self.store.checksum_unhashed()
    }

    /// Imports every in-WIM stream of another opened WIM as an
    /// external-WIM reference. The other WIM's reader stays alive for as
    /// long as this store references it.
    ///
    /// Imported entries start at refcount zero; they become live when an
    /// image added here references them.
    pub fn reference_streams_from(&mut self, other: &Wim) -> usize {
        let Some(backing_reader) = other.reader.clone() else {
            return 0;
        };

        let mut imported = 0;

        for lte in other.store.iter() {
            if lte.is_metadata() || !matches!(lte.location, ResourceLocation::InWim) {
                continue;
            }
            if self.store.lookup(&lte.hash).is_some() {
                continue;
            }

            let mut external = lte.clone();
            external.refcount = 0;
            external.location = ResourceLocation::ExternalWim(crate::store::ExternalBacking {
                reader: backing_reader.clone(),
                codec: other.header.codec(),
                chunk_size: other.header.chunk_size,
            });
            self.store.insert_or_coalesce(external);
            imported += 1;
        }

        imported
    }

    /// Adds an image whose directory tree is already serialized in `blob`.
    ///
    /// Every stream the blob references must already be in the store; each
    /// reference bumps that stream's refcount. Returns the new image's
    /// 1-based index.
    pub fn add_image(&mut self, blob: MetadataBlob) -> Result<usize, AddImageError> {
        for hash in blob.refs() {
            ensure!(
                self.store.lookup(hash).is_some(),
                MissingStreamSnafu { hash: *hash }
            );
        }

        for hash in blob.refs() {
            self.store.increment(hash);
        }

        let bytes = blob.to_bytes();
        let mut lte = Lte::from_buffer(bytes);
        lte.reshdr.flags = lte.reshdr.flags.with(ResourceFlags::METADATA);
        let (hash, _) = self.store.insert_or_coalesce(lte);

        self.images.push(ImageMetadata::new_dirty(hash, blob));
        self.header.image_count = self.images.len() as u32;

        Ok(self.images.len())
    }

    /// Deletes an image (1-based), dropping its reference on the metadata
    /// stream and every stream the image referenced. Streams that reach
    /// refcount zero are reclaimed at the next write.
    pub fn delete_image(&mut self, index: usize) -> Result<(), DeleteImageError> {
        ensure!(
            index >= 1 && index <= self.images.len(),
            NoImageSnafu { index }
        );

        let blob = self
            .image_metadata(index)
            .context(MaterializeSnafu)?
            .clone();

        for hash in blob.refs() {
            self.store.decrement(hash);
        }

        let removed = self.images.remove(index - 1);
        self.store.decrement(&removed.hash);
        self.header.image_count = self.images.len() as u32;
        self.deletion_occurred = true;

        // Fix up the boot selection around the removed slot.
        if self.header.boot_index as usize == index {
            self.header.boot_index = 0;
        } else if self.header.boot_index as usize > index {
            self.header.boot_index -= 1;
        }

        Ok(())
    }

    /// Materializes (and caches) the metadata blob of an image, verifying
    /// the stream digest on first read.
    pub fn image_metadata(&mut self, index: usize) -> Result<&MetadataBlob, MetadataReadError> {
        ensure!(
            index >= 1 && index <= self.images.len(),
            metadata_read_error::NoSuchImageSnafu { index }
        );

        if self.images[index - 1].blob.is_none() {
            let hash = self.images[index - 1].hash;
            let mut bytes = Vec::new();

            self.read_stream(&hash, &mut |data: &[u8]| {
                bytes.extend_from_slice(data);
                Ok(())
            })
            .context(metadata_read_error::ReadSnafu)?;

            let actual = Sha1Digest::of(&bytes);
            ensure!(
                actual == hash,
                metadata_read_error::HashMismatchSnafu {
                    expected: hash,
                    actual,
                }
            );

            let blob =
                MetadataBlob::from_bytes(&bytes).context(metadata_read_error::DecodeSnafu)?;
            self.images[index - 1].blob = Some(blob);
        }

        Ok(self.images[index - 1]
            .blob
            .as_ref()
            .expect("blob was just materialized"))
    }

    /// Streams a stored stream's uncompressed bytes to `consumer`.
    pub fn read_stream(
        &self,
        hash: &Sha1Digest,
        consumer: &mut impl StreamConsumer,
    ) -> Result<u64, ReadStreamError> {
        let lte = self
            .store
            .lookup(hash)
            .context(read_stream_error::UnknownStreamSnafu { hash: *hash })?;

        consumer.begin(lte).context(read_stream_error::ConsumerSnafu)?;

        let result = self.read_stream_inner(lte, consumer);
        consumer.end(result.is_ok());
        result
    }

    fn read_stream_inner(
        &self,
        lte: &Lte,
        consumer: &mut impl StreamConsumer,
    ) -> Result<u64, ReadStreamError> {
        let chunk_size = self.header.chunk_size as usize;

        match &lte.location {
            ResourceLocation::Buffer(data) => {
                feed_in_pieces(data, chunk_size.max(1), consumer)?;
                Ok(data.len() as u64)
            }

            ResourceLocation::StagingFile(path) => {
                let mut file =
                    File::open(path).context(read_stream_error::StagingSnafu { path })?;
                let mut buf = vec![0u8; chunk_size.max(4096)];
                let mut total = 0u64;

                loop {
                    let n = file
                        .read(&mut buf)
                        .context(read_stream_error::StagingSnafu { path })?;
                    if n == 0 {
                        break;
                    }
                    consumer
                        .chunk(&buf[..n])
                        .context(read_stream_error::ConsumerSnafu)?;
                    total += n as u64;
                }

                Ok(total)
            }

            ResourceLocation::InWim => {
                let reader = self
                    .reader
                    .as_ref()
                    .context(read_stream_error::NoBackingFileSnafu)?;
                stream_from_resource(
                    &**reader,
                    lte,
                    self.header.codec(),
                    self.header.chunk_size,
                    consumer,
                )
            }

            ResourceLocation::ExternalWim(backing) => stream_from_resource(
                &*backing.reader,
                lte,
                backing.codec,
                backing.chunk_size,
                consumer,
            ),
        }
    }

    /// Recomputes every stream refcount from the images' reference lists.
    ///
    /// Zeroes all counts, walks each image's metadata (adding one per
    /// reference plus one for the metadata stream itself), then adds one
    /// for each pending caller-held stream (attached buffers and staging
    /// files not yet written). Marks the store trustworthy afterwards.
    pub fn recalculate_refcounts(&mut self) -> Result<(), MetadataReadError> {
        // Materialize everything first so a read failure leaves counts
        // untouched.
        for index in 1..=self.images.len() {
            self.image_metadata(index)?;
        }

        self.store.zero_refcounts();

        for image in &self.images {
            let blob = image.blob.as_ref().expect("materialized above");

            for hash in blob.refs() {
                self.store.increment(hash);
            }

            self.store.increment(&image.hash);
        }

        for lte in self.store.iter_mut() {
            if lte.location.is_pending() {
                lte.refcount += 1;
                lte.reshdr.flags = lte.reshdr.flags.without(ResourceFlags::FREE);
            } else if lte.refcount == 0 {
                lte.reshdr.flags = lte.reshdr.flags.with(ResourceFlags::FREE);
            }
        }

        self.refcnts_ok = true;
        Ok(())
    }

    /// Verifies the integrity table, if present.
    pub fn check_integrity(
        &self,
        progress: &dyn WimProgress,
    ) -> Result<IntegrityStatus, IntegrityError> {
        match &self.reader {
            Some(reader) => integrity::check_integrity(&**reader, &self.header, progress),
            None => Ok(IntegrityStatus::Nonexistent),
        }
    }
}

fn feed_in_pieces(
    data: &[u8],
    piece: usize,
    consumer: &mut impl StreamConsumer,
) -> Result<(), ReadStreamError> {
    for part in data.chunks(piece.max(1)) {
        consumer
            .chunk(part)
            .context(read_stream_error::ConsumerSnafu)?;
    }
    Ok(())
}

fn stream_from_resource<R: ReadAt + ?Sized>(
    reader: &R,
    lte: &Lte,
    codec: Option<CodecKind>,
    chunk_size: u32,
    consumer: &mut impl StreamConsumer,
) -> Result<u64, ReadStreamError> {
    let mut resource = ResourceReader::new(reader, lte.reshdr, codec, chunk_size)
        .context(read_stream_error::ResourceSnafu)?;

    if lte.reshdr.flags.is_packed() {
        return resource::read_packed_member(&mut resource, &lte.hash, |data| {
            consumer.chunk(data)
        })
        .context(read_stream_error::ResourceSnafu);
    }

    let mut buf = vec![0u8; min(chunk_size as u64, 1 << 20).max(4096) as usize];
    let mut total = 0u64;

    loop {
        let n = resource.read(&mut buf).map_err(|e| {
            match e.downcast::<ReadResourceError>() {
                Ok(inner) => ReadStreamError::Resource { source: inner },
                Err(e) => ReadStreamError::Resource {
                    source: ReadResourceError::ReadIo { source: e },
                },
            }
        })?;
        if n == 0 {
            break;
        }
        consumer
            .chunk(&buf[..n])
            .context(read_stream_error::ConsumerSnafu)?;
        total += n as u64;
    }

    Ok(total)
}

/// The XML info blob of a WIM with no recorded information: a byte-order
/// mark and an empty root element.
#[must_use]
pub fn default_xml() -> Vec<u8> {
    let mut out = XML_BOM.to_vec();
    for unit in "<WIM></WIM>".encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

/// Offset where appended resources start: everything after the existing
/// sections.
pub(crate) fn append_start(header: &WimHeader, file_len: u64) -> u64 {
    let mut end = HEADER_SIZE as u64;

    for reshdr in [
        &header.lookup_table_reshdr,
        &header.xml_data_reshdr,
        &header.integrity_table_reshdr,
    ] {
        if !reshdr.is_absent() {
            end = end.max(reshdr.end_offset());
        }
    }

    end.max(file_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_wim_is_empty_and_trusted() {
        let wim = Wim::create(Some(CodecKind::Xpress), 1 << 15).unwrap();
        assert_eq!(wim.image_count(), 0);
        assert!(wim.refcnts_ok);
        assert_eq!(wim.codec(), Some(CodecKind::Xpress));
        assert!(!wim.is_pipable());
    }

    #[test]
    fn invalid_chunk_size_is_rejected_at_create() {
        assert!(matches!(
            Wim::create(Some(CodecKind::Xpress), 1 << 20),
            Err(CreateError::InvalidChunkSize { .. })
        ));
        assert!(Wim::create(None, 1 << 15).is_ok());
    }

    #[test]
    fn duplicate_buffers_dedup_to_one_stream() {
        let mut wim = Wim::create(Some(CodecKind::Lzx), 1 << 15).unwrap();

        let a = wim.add_stream_from_buffer(vec![0xAB; 1024]);
        let b = wim.add_stream_from_buffer(vec![0xAB; 1024]);

        assert_eq!(a, b);
        assert_eq!(wim.store().len(), 1);
        assert_eq!(wim.store().lookup(&a).unwrap().refcount, 2);
    }

    #[test]
    fn add_image_requires_known_streams() {
        let mut wim = Wim::create(None, 1 << 15).unwrap();

        let missing = MetadataBlob::new(vec![Sha1Digest::of(b"nope")], Vec::new());
        assert!(matches!(
            wim.add_image(missing),
            Err(AddImageError::MissingStream { .. })
        ));

        let hash = wim.add_stream_from_buffer(b"present".to_vec());
        let index = wim
            .add_image(MetadataBlob::new(vec![hash], b"tree".to_vec()))
            .unwrap();
        assert_eq!(index, 1);
        assert_eq!(wim.image_count(), 1);
        assert_eq!(wim.store().lookup(&hash).unwrap().refcount, 2);
    }

    #[test]
    fn delete_image_releases_references() {
        let mut wim = Wim::create(None, 1 << 15).unwrap();
        let hash = wim.add_stream_from_buffer(b"shared".to_vec());
        wim.add_image(MetadataBlob::new(vec![hash], Vec::new()))
            .unwrap();
        wim.add_image(MetadataBlob::new(vec![hash], Vec::new()))
            .unwrap();
        wim.set_boot_index(2).unwrap();

        wim.delete_image(1).unwrap();

        assert_eq!(wim.image_count(), 1);
        assert!(wim.deletion_occurred);
        assert_eq!(wim.boot_index(), 1);
        // One submission reference + one remaining image reference.
        assert_eq!(wim.store().lookup(&hash).unwrap().refcount, 2);
    }

    #[test]
    fn read_stream_feeds_buffer_content() {
        let mut wim = Wim::create(None, 1 << 15).unwrap();
        let data = vec![0x5A; 100_000];
        let hash = wim.add_stream_from_buffer(data.clone());

        let mut collected = Vec::new();
        let total = wim
            .read_stream(&hash, &mut |part: &[u8]| {
                collected.extend_from_slice(part);
                Ok(())
            })
            .unwrap();

        assert_eq!(total, data.len() as u64);
        assert_eq!(collected, data);

        let unknown = Sha1Digest::of(b"unknown");
        assert!(matches!(
            wim.read_stream(&unknown, &mut |_: &[u8]| Ok(())),
            Err(ReadStreamError::UnknownStream { .. })
        ));
    }

    #[test]
    fn recalculate_refcounts_counts_image_references() {
        let mut wim = Wim::create(None, 1 << 15).unwrap();
        let used = wim.add_stream_from_buffer(b"used stream".to_vec());
        let orphan = wim.add_stream_from_buffer(b"orphan stream".to_vec());
        wim.add_image(MetadataBlob::new(vec![used, used], Vec::new()))
            .unwrap();

        wim.recalculate_refcounts().unwrap();

        // Two image references plus the pending caller buffer.
        assert_eq!(wim.store().lookup(&used).unwrap().refcount, 3);
        // Only the pending caller buffer.
        assert_eq!(wim.store().lookup(&orphan).unwrap().refcount, 1);
        assert!(wim.refcnts_ok);
    }
}
