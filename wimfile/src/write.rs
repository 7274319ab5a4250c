//! The write planner and overwrite engine.
//!
//! A write assembles a new container (fresh file) or appends to an
//! existing one in place. Either way, sections land in a fixed order:
//! stream resources, image metadata, the lookup table, the XML blob, the
//! optional integrity table, and finally the header at offset 0. The
//! header always commits last, so a crash at any earlier point leaves the
//! previous header (and therefore the previous WIM) fully intact.

use crate::codec::{CodecError, CodecKind};
use crate::hash::Sha1Digest;
use crate::header::{HEADER_SIZE, HeaderFlags, WimHeader, generate_guid};
use crate::integrity::{self, IntegrityError};
use crate::pipeline::{self, ChunkPipeline};
use crate::progress::{ProgressAction, WimProgress};
use crate::resource::{
    self, PackedEntry, ReadResourceError, ResourceReader, WriteResourceError, WrittenResource,
};
use crate::reshdr::{Reshdr, ResourceFlags};
use crate::store::{self, ChecksumError, Lte, ResourceLocation};
use crate::wim::{MetadataReadError, ReadStreamError, Wim, append_start};
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use std::collections::HashMap;
use std::fs::{File, OpenOptions, TryLockError};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Streams smaller than this are grouped into a packed resource when
/// packing is requested.
const PACK_MAX_STREAM_SIZE: u64 = 64 * 1024;

/// Options controlling a write or overwrite.
///
/// The paired `check_integrity`/`no_check_integrity` and
/// `pipable`/`not_pipable` switches override in either direction; with
/// neither set, the source WIM's current state carries over.
#[derive(Clone, Debug, Default)]
pub struct WriteOptions {
    pub check_integrity: bool,
    pub no_check_integrity: bool,
    pub pipable: bool,
    pub not_pipable: bool,
    /// Recompress every stream instead of copying compressed bytes.
    pub recompress: bool,
    pub fsync: bool,
    /// Force a full rebuild even when appending in place would work.
    pub rebuild: bool,
    /// Allow appending after image deletion, leaving dead resources as
    /// holes instead of rebuilding.
    pub soft_delete: bool,
    pub ignore_readonly: bool,
    /// Leave streams that live in external WIMs out of this write.
    pub skip_external_wims: bool,
    /// Keep the WIM GUID instead of generating a fresh one.
    pub retain_guid: bool,
    /// Group small streams into packed resources.
    pub pack_streams: bool,
    pub send_done_with_file_messages: bool,
    /// Compression worker count; zero means one per logical CPU.
    pub num_threads: usize,
    /// Output codec override; `None` inherits the WIM's codec.
    pub out_codec: Option<CodecKind>,
    /// Output chunk-size override; `None` inherits the WIM's chunk size.
    pub out_chunk_size: Option<u32>,
    /// Part number and total parts for split WIMs.
    pub part: Option<(u16, u16)>,
}

/// Errors from the write planner.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum WriteError {
    #[snafu(display("i/o failed during write"))]
    Io { source: io::Error },

    #[snafu(display("cannot open write target {}", path.display()))]
    OpenTarget { path: PathBuf, source: io::Error },

    #[snafu(display("WIM has no backing path to overwrite"))]
    NoPath,

    #[snafu(display("WIM is marked readonly"))]
    ReadOnly,

    #[snafu(display("{} is locked by another writer", path.display()))]
    Locked { path: PathBuf },

    #[snafu(display("write aborted by progress callback"))]
    Aborted,

    #[snafu(display("chunk size {chunk_size} is not valid for {codec}"))]
    InvalidChunkSize { codec: CodecKind, chunk_size: u32 },

    #[snafu(display("cannot set up codec"))]
    Codec { source: CodecError },

    #[snafu(display("cannot checksum pending streams"))]
    Checksum { source: ChecksumError },

    #[snafu(display("cannot write resource"))]
    Resource { source: WriteResourceError },

    #[snafu(display("cannot read source resource"))]
    ReadResource { source: ReadResourceError },

    #[snafu(display("cannot read source stream"))]
    ReadStream { source: ReadStreamError },

    #[snafu(display("cannot open staging file {}", path.display()))]
    Staging { path: PathBuf, source: io::Error },

    #[snafu(display("cannot materialize image metadata"))]
    Metadata { source: MetadataReadError },

    #[snafu(display("stream requires the source WIM's backing file, which is not open"))]
    MissingBacking,

    #[snafu(display("stream {expected} produced digest {actual} on rewrite"))]
    StreamCorrupt {
        expected: Sha1Digest,
        actual: Sha1Digest,
    },

    #[snafu(display("cannot compute integrity table"))]
    Integrity { source: IntegrityError },

    #[snafu(display("cannot rename {} into place", from.display()))]
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },
}

/// Everything a finished section pass hands back for the commit step.
struct SectionPlan {
    header: WimHeader,
    new_reshdrs: HashMap<Sha1Digest, Reshdr>,
    end_of_file: u64,
}

impl Wim {
    /// Writes the WIM into an arbitrary seekable target, e.g. an in-memory
    /// cursor or an already-open file.
    ///
    /// This is an export: the in-memory `Wim` keeps pointing at its
    /// original backing (if any). Use [`write_path`](Self::write_path) or
    /// [`overwrite`](Self::overwrite) to retarget the `Wim` at the result.
    pub fn write_to<W: Read + Write + Seek>(
        &mut self,
        out: &mut W,
        options: &WriteOptions,
        progress: &dyn WimProgress,
    ) -> Result<(), WriteError> {
        out.seek(SeekFrom::Start(0)).context(IoSnafu)?;
        out.write_all(&[0u8; HEADER_SIZE]).context(IoSnafu)?;

        let plan = write_sections(self, out, options, progress, false)?;

        ensure!(progress.pre_commit() == ProgressAction::Continue, AbortedSnafu);
        plan.header.write_to(out).context(IoSnafu)?;

        Ok(())
    }

    /// Writes the WIM into a new file at `path` and retargets this `Wim`
    /// at the result.
    pub fn write_path(
        &mut self,
        path: impl AsRef<Path>,
        options: &WriteOptions,
        progress: &dyn WimProgress,
    ) -> Result<(), WriteError> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .context(OpenTargetSnafu { path })?;

        let plan = write_fresh_into(self, &mut file, options, progress)?;
        self.apply_commit(plan, Some(path))
    }

    /// Commits changes back to the file this WIM was opened from.
    ///
    /// When every existing section is unchanged on disk, new resources are
    /// appended after the old ones and the header flips over last, which
    /// keeps the operation reversible up to the final header write. When
    /// appending is unsafe (rebuild requested, recompression, codec or
    /// layout change, deletion without `soft_delete`, pipable source), the
    /// WIM is rebuilt into a temporary sibling and renamed into place.
    pub fn overwrite(
        &mut self,
        options: &WriteOptions,
        progress: &dyn WimProgress,
    ) -> Result<(), WriteError> {
        let path = self.path.clone().context(NoPathSnafu)?;

        ensure!(
            !self.header.flags.is_readonly() || options.ignore_readonly,
            ReadOnlySnafu
        );

        let codec_changed = options
            .out_codec
            .is_some_and(|codec| Some(codec) != self.header.codec());
        let chunk_changed = options
            .out_chunk_size
            .is_some_and(|size| size != self.header.chunk_size);

        let can_append = !options.rebuild
            && !options.recompress
            && !options.pipable
            && !self.is_pipable()
            && (!self.deletion_occurred || options.soft_delete)
            && !codec_changed
            && !chunk_changed
            && self.reader.is_some();

        if can_append {
            self.overwrite_append(&path, options, progress)
        } else {
            self.rebuild_into(&path, options, progress)
        }
    }

    fn overwrite_append(
        &mut self,
        path: &Path,
        options: &WriteOptions,
        progress: &dyn WimProgress,
    ) -> Result<(), WriteError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .context(OpenTargetSnafu { path })?;

        // Advisory append lock, held for the whole overwrite.
        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => return LockedSnafu { path }.fail(),
            Err(TryLockError::Error(source)) => return Err(WriteError::Io { source }),
        }

        let result = self.append_locked(&mut file, options, progress);
        let _ = file.unlock();
        result
    }

    fn append_locked(
        &mut self,
        file: &mut File,
        options: &WriteOptions,
        progress: &dyn WimProgress,
    ) -> Result<(), WriteError> {
        let old_len = file.metadata().context(IoSnafu)?.len();
        let old_header = self.header.clone();

        // Flag the file as mid-append. The section pointers still name the
        // old tables, so the file stays openable throughout.
        let mut wip_header = old_header.clone();
        wip_header.flags = wip_header.flags.with(HeaderFlags::WRITE_IN_PROGRESS);
        wip_header.write_to(file).context(IoSnafu)?;

        let start = append_start(&old_header, old_len);

        let outcome = (|| {
            file.seek(SeekFrom::Start(start)).context(IoSnafu)?;

            let plan = write_sections(self, file, options, progress, true)?;

            if options.fsync {
                file.sync_all().context(IoSnafu)?;
            }

            ensure!(progress.pre_commit() == ProgressAction::Continue, AbortedSnafu);

            plan.header.write_to(file).context(IoSnafu)?;
            file.set_len(plan.end_of_file).context(IoSnafu)?;

            if options.fsync {
                file.sync_all().context(IoSnafu)?;
            }

            self.apply_commit(plan, None)
        })();

        if outcome.is_err() {
            // Roll back to the pre-append state: old header, old length.
            let _ = old_header.write_to(file);
            let _ = file.set_len(old_len);
        }

        outcome
    }

    fn rebuild_into(
        &mut self,
        path: &Path,
        options: &WriteOptions,
        progress: &dyn WimProgress,
    ) -> Result<(), WriteError> {
        let tmp = tmp_sibling(path);

        let result = (|| {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)
                .context(OpenTargetSnafu { path: &tmp })?;

            write_fresh_into(self, &mut file, options, progress)
        })();

        match result {
            Ok(plan) => {
                std::fs::rename(&tmp, path).context(RenameSnafu {
                    from: tmp,
                    to: path,
                })?;
                self.apply_commit(plan, Some(path))
            }
            Err(e) => {
                let _ = std::fs::remove_file(&tmp);
                Err(e)
            }
        }
    }

    /// Applies a committed plan to the in-memory state: final resource
    /// headers, backing retarget, metadata clean bits, and reclamation of
    /// streams that reached refcount zero (when the counts are trusted).
    fn apply_commit(
        &mut self,
        plan: SectionPlan,
        retarget: Option<&Path>,
    ) -> Result<(), WriteError> {
        if let Some(path) = retarget {
            let file = File::open(path).context(OpenTargetSnafu { path })?;
            self.reader = Some(Arc::new(file));
            self.path = Some(path.to_path_buf());
        }

        for (hash, reshdr) in &plan.new_reshdrs {
            if let Some(lte) = self.store.lookup_mut(hash) {
                lte.reshdr = *reshdr;
                lte.location = ResourceLocation::InWim;
                lte.part_number = plan.header.part_number;
            }
        }

        self.header = plan.header;

        for image in &mut self.images {
            image.dirty = false;
        }

        if self.refcnts_ok {
            self.store.reclaim_free();
        }

        self.deletion_occurred = false;
        Ok(())
    }
}

/// Full fresh write into an open file: placeholder header, sections, sync,
/// commit callback, header, truncation.
fn write_fresh_into(
    wim: &mut Wim,
    file: &mut File,
    options: &WriteOptions,
    progress: &dyn WimProgress,
) -> Result<SectionPlan, WriteError> {
    file.seek(SeekFrom::Start(0)).context(IoSnafu)?;
    file.write_all(&[0u8; HEADER_SIZE]).context(IoSnafu)?;

    let plan = write_sections(wim, file, options, progress, false)?;

    if options.fsync {
        file.sync_all().context(IoSnafu)?;
    }

    ensure!(progress.pre_commit() == ProgressAction::Continue, AbortedSnafu);

    plan.header.write_to(file).context(IoSnafu)?;
    file.set_len(plan.end_of_file.max(HEADER_SIZE as u64))
        .context(IoSnafu)?;

    if options.fsync {
        file.sync_all().context(IoSnafu)?;
    }

    Ok(plan)
}

/// Writes every section except the header: streams, image metadata, the
/// lookup table, the XML blob, and the integrity table. Returns the plan
/// whose header the caller commits.
///
/// In append mode the output is already positioned past the existing
/// sections and streams that live in the source keep their headers; in
/// fresh mode everything is emitted.
fn write_sections<W: Read + Write + Seek>(
    wim: &mut Wim,
    out: &mut W,
    options: &WriteOptions,
    progress: &dyn WimProgress,
    append: bool,
) -> Result<SectionPlan, WriteError> {
    wim.checksum_unhashed().context(ChecksumSnafu)?;

    let codec = options.out_codec.or(wim.header.codec());
    let chunk_size = options.out_chunk_size.unwrap_or(wim.header.chunk_size);

    if let Some(codec) = codec {
        ensure!(
            codec.chunk_size_valid(chunk_size),
            InvalidChunkSizeSnafu { codec, chunk_size }
        );
    }

    let num_threads = if options.num_threads == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    } else {
        options.num_threads
    };

    let mut pipeline: Option<Box<dyn ChunkPipeline>> = match codec {
        Some(kind) => Some(
            pipeline::new_pipeline(
                kind,
                chunk_size,
                wim.compression.level_for(kind),
                num_threads,
            )
            .context(CodecSnafu)?,
        ),
        None => None,
    };

    // Materialize metadata blobs up front; a read failure here leaves the
    // output untouched beyond the placeholder.
    if !append {
        for index in 1..=wim.images.len() {
            wim.image_metadata(index).context(MetadataSnafu)?;
        }
    }

    // Collect the streams to emit: existing on-disk streams in file order,
    // then pending ones ordered by size and hash.
    let mut existing: Vec<(u64, Sha1Digest)> = Vec::new();
    let mut pending: Vec<(u64, Sha1Digest)> = Vec::new();

    for lte in wim.store.iter() {
        if lte.is_metadata() {
            continue;
        }
        if options.skip_external_wims
            && matches!(lte.location, ResourceLocation::ExternalWim(_))
        {
            continue;
        }
        if wim.refcnts_ok && (lte.refcount == 0 || lte.reshdr.flags.is_free()) {
            continue;
        }

        match lte.location {
            ResourceLocation::InWim => existing.push((lte.reshdr.offset_in_wim, lte.hash)),
            _ => pending.push((lte.size(), lte.hash)),
        }
    }

    existing.sort_unstable();
    pending.sort_unstable();

    let mut new_reshdrs: HashMap<Sha1Digest, Reshdr> = HashMap::new();
    let mut included: Vec<Sha1Digest> = Vec::new();

    // Existing streams: untouched when appending, copied or recompressed
    // on a fresh write. Packed containers are copied once and shared.
    let raw_copy_ok =
        !options.recompress && codec == wim.header.codec() && chunk_size == wim.header.chunk_size;
    let mut copied_packs: HashMap<u64, Reshdr> = HashMap::new();

    for (old_offset, hash) in existing {
        included.push(hash);

        if append {
            continue;
        }

        let lte = wim.store.lookup(&hash).expect("collected above").clone();

        ensure!(
            progress.begin_stream(&hash, lte.size()) == ProgressAction::Continue,
            AbortedSnafu
        );

        let reshdr = if raw_copy_ok {
            let reader = wim.reader.as_ref().context(MissingBackingSnafu)?;

            if lte.reshdr.flags.is_packed() {
                match copied_packs.get(&old_offset) {
                    Some(done) => *done,
                    None => {
                        let copied = resource::copy_resource_raw(&**reader, &lte.reshdr, out)
                            .context(ResourceSnafu)?;
                        copied_packs.insert(old_offset, copied);
                        copied
                    }
                }
            } else {
                resource::copy_resource_raw(&**reader, &lte.reshdr, out).context(ResourceSnafu)?
            }
        } else {
            let written =
                write_stream_payload(wim, out, &lte, &mut pipeline, Default::default(), progress)?;
            ensure!(
                written.hash == lte.hash,
                StreamCorruptSnafu {
                    expected: lte.hash,
                    actual: written.hash,
                }
            );
            written.reshdr
        };

        new_reshdrs.insert(hash, reshdr);

        ensure!(
            progress.stream_completed(&hash) == ProgressAction::Continue,
            AbortedSnafu
        );
    }

    // Pack decision: group small pending streams when requested.
    let mut pack_members: Vec<(u64, Sha1Digest)> = Vec::new();
    let mut individual: Vec<(u64, Sha1Digest)> = Vec::new();

    if options.pack_streams && codec.is_some() {
        for (size, hash) in pending {
            if size > 0 && size < PACK_MAX_STREAM_SIZE {
                pack_members.push((size, hash));
            } else {
                individual.push((size, hash));
            }
        }
        if pack_members.len() < 2 {
            individual.append(&mut pack_members);
            individual.sort_unstable();
        }
    } else {
        individual = pending;
    }

    for (size, hash) in individual {
        included.push(hash);

        ensure!(
            progress.begin_stream(&hash, size) == ProgressAction::Continue,
            AbortedSnafu
        );

        let lte = wim.store.lookup(&hash).expect("collected above").clone();
        let written =
            write_stream_payload(wim, out, &lte, &mut pipeline, Default::default(), progress)?;

        ensure!(
            written.hash == lte.hash,
            StreamCorruptSnafu {
                expected: lte.hash,
                actual: written.hash,
            }
        );

        new_reshdrs.insert(hash, written.reshdr);

        if options.send_done_with_file_messages {
            if let ResourceLocation::StagingFile(path) = &lte.location {
                progress.done_with_file(path);
            }
        }

        ensure!(
            progress.stream_completed(&hash) == ProgressAction::Continue,
            AbortedSnafu
        );
    }

    if !pack_members.is_empty() {
        let members = write_packed_group(wim, out, &pack_members, &mut pipeline, progress)?;
        for (hash, reshdr) in members {
            included.push(hash);
            new_reshdrs.insert(hash, reshdr);
        }
    }

    // Image metadata, in image order. Clean images keep their resources
    // when appending; identical metadata across images is written once.
    let part_number = options.part.map_or(wim.header.part_number, |(part, _)| part);
    let mut metadata_entries: Vec<Lte> = Vec::with_capacity(wim.images.len());

    for index in 0..wim.images.len() {
        let hash = wim.images[index].hash;
        let store_lte = wim
            .store
            .lookup(&hash)
            .expect("image metadata is always in the store")
            .clone();

        let reshdr = if append
            && !wim.images[index].dirty
            && matches!(store_lte.location, ResourceLocation::InWim)
        {
            store_lte.reshdr
        } else if let Some(done) = new_reshdrs.get(&hash) {
            *done
        } else {
            let blob = match wim.images[index].blob.as_ref() {
                Some(blob) => blob.clone(),
                None => wim
                    .image_metadata(index + 1)
                    .context(MetadataSnafu)?
                    .clone(),
            };
            let bytes = blob.to_bytes();

            ensure!(
                progress.begin_stream(&hash, bytes.len() as u64) == ProgressAction::Continue,
                AbortedSnafu
            );

            let written = emit_stream(
                out,
                &mut Cursor::new(bytes.as_slice()),
                bytes.len() as u64,
                &mut pipeline,
                ResourceFlags::new(ResourceFlags::METADATA),
                progress,
            )?;

            ensure!(
                written.hash == hash,
                StreamCorruptSnafu {
                    expected: hash,
                    actual: written.hash,
                }
            );

            ensure!(
                progress.stream_completed(&hash) == ProgressAction::Continue,
                AbortedSnafu
            );

            written.reshdr
        };

        new_reshdrs.insert(hash, reshdr);

        let mut entry = store_lte;
        entry.reshdr = reshdr;
        entry.reshdr.flags = entry.reshdr.flags.with(ResourceFlags::METADATA);
        entry.part_number = part_number;
        metadata_entries.push(entry);
    }

    // Lookup table.
    let mut table_streams: Vec<Lte> = Vec::with_capacity(included.len());
    for hash in included {
        let mut entry = wim
            .store
            .lookup(&hash)
            .expect("collected above")
            .clone();
        if let Some(reshdr) = new_reshdrs.get(&hash) {
            entry.reshdr = *reshdr;
        }
        entry.part_number = part_number;
        table_streams.push(entry);
    }
    table_streams.sort_by_key(|lte| (lte.reshdr.offset_in_wim, lte.hash));

    let ordered: Vec<&Lte> = metadata_entries.iter().chain(table_streams.iter()).collect();
    let table_bytes = store::encode_entries(&ordered);

    let lookup = resource::write_resource_uncompressed(
        out,
        &table_bytes,
        ResourceFlags::new(ResourceFlags::METADATA),
    )
    .context(ResourceSnafu)?;

    // XML info blob, opaque UTF-16LE bytes.
    let xml = resource::write_resource_uncompressed(
        out,
        &wim.xml_data,
        ResourceFlags::new(ResourceFlags::METADATA),
    )
    .context(ResourceSnafu)?;

    // Integrity table over the resource area, when wanted.
    let had_integrity = wim.header.has_integrity_table();
    let want_integrity =
        options.check_integrity || (!options.no_check_integrity && had_integrity);

    let integrity_reshdr = if want_integrity {
        let table_pos = out.stream_position().context(IoSnafu)?;
        let table =
            integrity::compute_integrity_table(out, lookup.reshdr.end_offset(), progress)
                .context(IntegritySnafu)?;

        out.seek(SeekFrom::Start(table_pos)).context(IoSnafu)?;
        resource::write_resource_uncompressed(out, &table, ResourceFlags::default())
            .context(ResourceSnafu)?
            .reshdr
    } else {
        Reshdr::default()
    };

    let end_of_file = out.stream_position().context(IoSnafu)?;

    // Assemble the header the caller will commit last.
    let mut header = wim.header.clone();
    header.flags = header
        .flags
        .without(HeaderFlags::WRITE_IN_PROGRESS)
        .with_codec(codec);
    header.chunk_size = chunk_size;

    let pipable = if options.pipable {
        true
    } else if options.not_pipable {
        false
    } else {
        wim.header.is_pipable()
    };
    header.set_pipable(pipable);

    if !append && !options.retain_guid {
        header.guid = generate_guid();
    }

    if let Some((part, total)) = options.part {
        header.part_number = part;
        header.total_parts = total;
        if total > 1 {
            header.flags = header.flags.with(HeaderFlags::SPANNED);
        }
    }

    header.image_count = wim.images.len() as u32;
    header.lookup_table_reshdr = lookup.reshdr;
    header.xml_data_reshdr = xml.reshdr;
    header.integrity_table_reshdr = integrity_reshdr;
    header.boot_metadata_reshdr = if header.boot_index > 0 {
        metadata_entries[header.boot_index as usize - 1].reshdr
    } else {
        Reshdr::default()
    };

    Ok(SectionPlan {
        header,
        new_reshdrs,
        end_of_file,
    })
}

/// Writes one packed resource holding every grouped small stream and
/// returns the shared resource header each member records.
fn write_packed_group<W: Read + Write + Seek>(
    wim: &Wim,
    out: &mut W,
    members: &[(u64, Sha1Digest)],
    pipeline: &mut Option<Box<dyn ChunkPipeline>>,
    progress: &dyn WimProgress,
) -> Result<Vec<(Sha1Digest, Reshdr)>, WriteError> {
    let mut offset = resource::packed_directory_len(members.len());
    let mut directory = Vec::with_capacity(members.len());
    let mut bodies: Vec<Vec<u8>> = Vec::with_capacity(members.len());

    for (_, hash) in members {
        let mut bytes = Vec::new();
        wim.read_stream(hash, &mut |part: &[u8]| {
            bytes.extend_from_slice(part);
            Ok(())
        })
        .context(ReadStreamSnafu)?;

        directory.push(PackedEntry {
            hash: *hash,
            offset,
            size: bytes.len() as u64,
        });
        offset += bytes.len() as u64;
        bodies.push(bytes);
    }

    let mut payload = resource::encode_packed_directory(&directory);
    for body in &bodies {
        payload.extend_from_slice(body);
    }

    let written = emit_stream(
        out,
        &mut Cursor::new(payload.as_slice()),
        payload.len() as u64,
        pipeline,
        ResourceFlags::new(ResourceFlags::PACKED),
        progress,
    )?;

    Ok(directory
        .iter()
        .map(|entry| (entry.hash, written.reshdr))
        .collect())
}

/// Streams one stored stream's bytes into the output as its own resource,
/// resolving whichever location the bytes currently live in.
fn write_stream_payload<W: Read + Write + Seek>(
    wim: &Wim,
    out: &mut W,
    lte: &Lte,
    pipeline: &mut Option<Box<dyn ChunkPipeline>>,
    extra_flags: ResourceFlags,
    progress: &dyn WimProgress,
) -> Result<WrittenResource, WriteError> {
    match &lte.location {
        ResourceLocation::Buffer(data) => emit_stream(
            out,
            &mut Cursor::new(data.as_slice()),
            data.len() as u64,
            pipeline,
            extra_flags,
            progress,
        ),

        ResourceLocation::StagingFile(path) => {
            let mut file = File::open(path).context(StagingSnafu { path })?;
            emit_stream(out, &mut file, lte.size(), pipeline, extra_flags, progress)
        }

        ResourceLocation::InWim => {
            let reader = wim.reader.as_ref().context(MissingBackingSnafu)?;
            emit_from_resource(
                out,
                &**reader,
                lte,
                wim.header.codec(),
                wim.header.chunk_size,
                pipeline,
                extra_flags,
                progress,
            )
        }

        ResourceLocation::ExternalWim(backing) => emit_from_resource(
            out,
            &*backing.reader,
            lte,
            backing.codec,
            backing.chunk_size,
            pipeline,
            extra_flags,
            progress,
        ),
    }
}

/// Decodes a stream out of a source container and re-emits it. Packed
/// members are materialized (they are small by construction); whole
/// resources stream straight through the decoder.
fn emit_from_resource<W: Read + Write + Seek, R: crate::io::ReadAt + ?Sized>(
    out: &mut W,
    reader: &R,
    lte: &Lte,
    codec: Option<CodecKind>,
    chunk_size: u32,
    pipeline: &mut Option<Box<dyn ChunkPipeline>>,
    extra_flags: ResourceFlags,
    progress: &dyn WimProgress,
) -> Result<WrittenResource, WriteError> {
    let mut source = ResourceReader::new(reader, lte.reshdr, codec, chunk_size)
        .context(ReadResourceSnafu)?;

    if lte.reshdr.flags.is_packed() {
        let mut bytes = Vec::new();
        resource::read_packed_member(&mut source, &lte.hash, |part| {
            bytes.extend_from_slice(part);
            Ok(())
        })
        .context(ReadResourceSnafu)?;

        return emit_stream(
            out,
            &mut Cursor::new(bytes.as_slice()),
            bytes.len() as u64,
            pipeline,
            extra_flags,
            progress,
        );
    }

    let size = lte.reshdr.uncompressed_size;
    emit_stream(out, &mut source, size, pipeline, extra_flags, progress)
}

/// Emits one resource, compressed through the pipeline when the output has
/// a codec and raw otherwise.
fn emit_stream<W: Read + Write + Seek, S: Read + Seek>(
    out: &mut W,
    source: &mut S,
    size: u64,
    pipeline: &mut Option<Box<dyn ChunkPipeline>>,
    extra_flags: ResourceFlags,
    progress: &dyn WimProgress,
) -> Result<WrittenResource, WriteError> {
    let result = match pipeline {
        Some(p) => resource::write_resource(out, source, size, p.as_mut(), extra_flags, progress),
        None => resource::write_resource_raw_stream(out, source, size, extra_flags),
    };

    result.map_err(|e| match e {
        WriteResourceError::Aborted => WriteError::Aborted,
        other => WriteError::Resource { source: other },
    })
}

/// A temporary sibling of the target, in the same directory so the final
/// rename never crosses filesystems.
fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tmp_sibling_stays_in_directory() {
        let tmp = tmp_sibling(Path::new("/data/images/base.wim"));
        assert_eq!(tmp, Path::new("/data/images/base.wim.tmp"));
    }

    #[test]
    fn default_options_inherit_everything() {
        let options = WriteOptions::default();
        assert!(!options.check_integrity && !options.no_check_integrity);
        assert!(!options.pipable && !options.not_pipable);
        assert_eq!(options.out_codec, None);
        assert_eq!(options.out_chunk_size, None);
        assert_eq!(options.num_threads, 0);
    }
}
