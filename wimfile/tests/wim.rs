//! End-to-end container scenarios: write, reopen, append, verify, recover.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::Cursor;
use wimfile::progress::{ProgressAction, SilentProgress, WimProgress};
use wimfile::{
    CodecKind, IntegrityStatus, MetadataBlob, Sha1Digest, Wim, WriteError, WriteOptions,
};

fn collect_stream(wim: &Wim, hash: &Sha1Digest) -> Vec<u8> {
    let mut out = Vec::new();
    wim.read_stream(hash, &mut |part: &[u8]| {
        out.extend_from_slice(part);
        Ok(())
    })
    .expect("stream must be readable");
    out
}

fn compressible(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add((i / 256) as u8)).collect()
}

fn write_to_vec(wim: &mut Wim, options: &WriteOptions) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    wim.write_to(&mut out, options, &SilentProgress)
        .expect("write must succeed");
    out.into_inner()
}

#[test]
fn empty_wim_round_trips() {
    let mut wim = Wim::create(Some(CodecKind::Xpress), 32768).unwrap();
    let file = write_to_vec(&mut wim, &WriteOptions::default());

    let reopened = Wim::from_reader(file).unwrap();
    assert_eq!(reopened.image_count(), 0);
    assert_eq!(reopened.codec(), Some(CodecKind::Xpress));
    assert_eq!(reopened.chunk_size(), 32768);
    assert_eq!(reopened.header().lookup_table_reshdr.uncompressed_size, 0);
    assert!(!reopened.has_integrity_table());
}

#[test]
fn identical_streams_dedup_to_one_resource() {
    let buf = compressible(1 << 20, 3);

    let mut two = Wim::create(Some(CodecKind::Xpress), 32768).unwrap();
    let hash_a = two.add_stream_from_buffer(buf.clone());
    let hash_b = two.add_stream_from_buffer(buf.clone());
    assert_eq!(hash_a, hash_b);
    let file_two = write_to_vec(&mut two, &WriteOptions::default());

    let mut one = Wim::create(Some(CodecKind::Xpress), 32768).unwrap();
    one.add_stream_from_buffer(buf.clone());
    let file_one = write_to_vec(&mut one, &WriteOptions::default());

    // One on-disk resource either way.
    assert_eq!(file_two.len(), file_one.len());

    let reopened = Wim::from_reader(file_two).unwrap();
    assert_eq!(reopened.store().len(), 1);
    assert_eq!(reopened.store().lookup(&hash_a).unwrap().refcount, 2);
    assert_eq!(collect_stream(&reopened, &hash_a), buf);
}

#[test]
fn incompressible_stream_falls_back_to_raw() {
    let mut rng = StdRng::seed_from_u64(0x5EED);
    let noise: Vec<u8> = (0..64 * 1024).map(|_| rng.random()).collect();

    let mut wim = Wim::create(Some(CodecKind::Lzx), 32768).unwrap();
    let hash = wim.add_stream_from_buffer(noise.clone());
    let file = write_to_vec(&mut wim, &WriteOptions::default());

    let reopened = Wim::from_reader(file).unwrap();
    let lte = reopened.store().lookup(&hash).unwrap();

    assert!(!lte.reshdr.flags.is_compressed());
    assert_eq!(lte.reshdr.size_in_wim, lte.reshdr.uncompressed_size);
    assert_eq!(lte.reshdr.uncompressed_size, noise.len() as u64);
    assert_eq!(collect_stream(&reopened, &hash), noise);
}

#[test]
fn compressed_streams_round_trip_with_parallel_pipeline() {
    let big = compressible(3 * (1 << 20) + 777, 9);
    let small = compressible(5000, 40);

    let mut wim = Wim::create(Some(CodecKind::Lzms), 1 << 16).unwrap();
    let big_hash = wim.add_stream_from_buffer(big.clone());
    let small_hash = wim.add_stream_from_buffer(small.clone());

    let options = WriteOptions {
        num_threads: 4,
        ..WriteOptions::default()
    };
    let file = write_to_vec(&mut wim, &options);
    assert!(file.len() < big.len());

    let reopened = Wim::from_reader(file).unwrap();
    assert_eq!(collect_stream(&reopened, &big_hash), big);
    assert_eq!(collect_stream(&reopened, &small_hash), small);
    assert!(
        reopened
            .store()
            .lookup(&big_hash)
            .unwrap()
            .reshdr
            .flags
            .is_compressed()
    );
}

#[test]
fn images_and_metadata_survive_reopen() {
    let payload = compressible(200_000, 17);

    let mut wim = Wim::create(Some(CodecKind::Xpress), 32768).unwrap();
    let hash = wim.add_stream_from_buffer(payload.clone());
    wim.add_image(MetadataBlob::new(vec![hash], b"image one tree".to_vec()))
        .unwrap();
    wim.add_image(MetadataBlob::new(vec![hash], b"image two tree".to_vec()))
        .unwrap();
    wim.set_boot_index(2).unwrap();

    let file = write_to_vec(&mut wim, &WriteOptions::default());

    let mut reopened = Wim::from_reader(file).unwrap();
    assert_eq!(reopened.image_count(), 2);
    assert_eq!(reopened.boot_index(), 2);

    let one = reopened.image_metadata(1).unwrap().clone();
    assert_eq!(one.payload(), b"image one tree");
    assert_eq!(one.refs(), &[hash]);

    let two = reopened.image_metadata(2).unwrap().clone();
    assert_eq!(two.payload(), b"image two tree");

    reopened.recalculate_refcounts().unwrap();
    // One reference from each image.
    assert_eq!(reopened.store().lookup(&hash).unwrap().refcount, 2);
}

#[test]
fn append_in_place_preserves_existing_layout() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("base.wim");

    let shared = compressible(300_000, 1);
    let mut wim = Wim::create(Some(CodecKind::Xpress), 32768).unwrap();
    let shared_hash = wim.add_stream_from_buffer(shared.clone());
    wim.add_image(MetadataBlob::new(vec![shared_hash], b"one".to_vec()))
        .unwrap();
    wim.add_image(MetadataBlob::new(vec![shared_hash], b"two".to_vec()))
        .unwrap();
    wim.write_path(&path, &WriteOptions::default(), &SilentProgress)
        .unwrap();

    let old_guid = *wim.guid();
    let old_reshdr = wim.store().lookup(&shared_hash).unwrap().reshdr;
    let old_lookup_offset = wim.header().lookup_table_reshdr.offset_in_wim;

    // Reopen from disk and append a third image with two new streams plus
    // the pre-existing one.
    let mut wim = Wim::open_path(&path).unwrap();
    let new_a = compressible(150_000, 60);
    let new_b = compressible(90_000, 61);
    let hash_a = wim.add_stream_from_buffer(new_a.clone());
    let hash_b = wim.add_stream_from_buffer(new_b.clone());
    wim.add_image(MetadataBlob::new(
        vec![hash_a, hash_b, shared_hash],
        b"three".to_vec(),
    ))
    .unwrap();

    let options = WriteOptions {
        retain_guid: true,
        ..WriteOptions::default()
    };
    wim.overwrite(&options, &SilentProgress).unwrap();

    let mut reopened = Wim::open_path(&path).unwrap();
    assert_eq!(reopened.image_count(), 3);
    assert_eq!(*reopened.guid(), old_guid);

    // The pre-existing stream was not rewritten.
    assert_eq!(
        reopened.store().lookup(&shared_hash).unwrap().reshdr,
        old_reshdr
    );

    // New streams landed after the original lookup table, and the new
    // lookup table landed after them.
    for hash in [&hash_a, &hash_b] {
        let reshdr = reopened.store().lookup(hash).unwrap().reshdr;
        assert!(reshdr.offset_in_wim >= old_lookup_offset);
    }
    assert!(reopened.header().lookup_table_reshdr.offset_in_wim > old_lookup_offset);

    assert_eq!(collect_stream(&reopened, &shared_hash), shared);
    assert_eq!(collect_stream(&reopened, &hash_a), new_a);
    assert_eq!(collect_stream(&reopened, &hash_b), new_b);
    assert_eq!(reopened.image_metadata(3).unwrap().payload(), b"three");
}

#[test]
fn integrity_check_flags_corrupted_resource_area() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checked.wim");

    let mut wim = Wim::create(Some(CodecKind::Xpress), 32768).unwrap();
    let hash = wim.add_stream_from_buffer(compressible(500_000, 5));
    wim.add_image(MetadataBlob::new(vec![hash], Vec::new()))
        .unwrap();

    let options = WriteOptions {
        check_integrity: true,
        ..WriteOptions::default()
    };
    wim.write_path(&path, &options, &SilentProgress).unwrap();

    let clean = Wim::open_path(&path).unwrap();
    assert!(clean.has_integrity_table());
    assert_eq!(
        clean.check_integrity(&SilentProgress).unwrap(),
        IntegrityStatus::Ok
    );
    drop(clean);

    // Flip one byte inside the first stream resource.
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[wimfile::HEADER_SIZE + 50] ^= 0xFF;
    std::fs::write(&path, &bytes).unwrap();

    let corrupted = Wim::open_path(&path).unwrap();
    assert_eq!(
        corrupted.check_integrity(&SilentProgress).unwrap(),
        IntegrityStatus::NotOk { first_bad_chunk: 0 }
    );
}

/// Aborts an overwrite at the last possible moment, standing in for a
/// crash immediately before the header commit.
struct AbortBeforeCommit;

impl WimProgress for AbortBeforeCommit {
    fn pre_commit(&self) -> ProgressAction {
        ProgressAction::Abort
    }
}

#[test]
fn aborted_overwrite_leaves_old_wim_intact() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("recover.wim");

    let mut wim = Wim::create(Some(CodecKind::Xpress), 32768).unwrap();
    let original = compressible(120_000, 8);
    let original_hash = wim.add_stream_from_buffer(original.clone());
    wim.add_image(MetadataBlob::new(vec![original_hash], b"one".to_vec()))
        .unwrap();
    wim.add_image(MetadataBlob::new(vec![original_hash], b"two".to_vec()))
        .unwrap();
    wim.write_path(&path, &WriteOptions::default(), &SilentProgress)
        .unwrap();

    let old_guid = *wim.guid();
    let old_len = std::fs::metadata(&path).unwrap().len();
    let old_lookup = wim.header().lookup_table_reshdr;

    // Attempt an append that dies right before the header commit.
    let mut appender = Wim::open_path(&path).unwrap();
    let extra = appender.add_stream_from_buffer(compressible(80_000, 77));
    appender
        .add_image(MetadataBlob::new(vec![extra], b"three".to_vec()))
        .unwrap();

    let result = appender.overwrite(&WriteOptions::default(), &AbortBeforeCommit);
    assert!(matches!(result, Err(WriteError::Aborted)));

    // The file rolled back to the pre-overwrite state.
    assert_eq!(std::fs::metadata(&path).unwrap().len(), old_len);

    let reopened = Wim::open_path(&path).unwrap();
    assert_eq!(reopened.image_count(), 2);
    assert_eq!(*reopened.guid(), old_guid);
    assert_eq!(reopened.header().lookup_table_reshdr, old_lookup);
    assert_eq!(collect_stream(&reopened, &original_hash), original);
    assert!(reopened.store().lookup(&extra).is_none());
}

#[test]
fn packed_streams_share_one_resource() {
    let small_a = compressible(2000, 21);
    let small_b = compressible(3000, 22);
    let big = compressible(200_000, 23);

    let mut wim = Wim::create(Some(CodecKind::Lzx), 32768).unwrap();
    let hash_a = wim.add_stream_from_buffer(small_a.clone());
    let hash_b = wim.add_stream_from_buffer(small_b.clone());
    let hash_big = wim.add_stream_from_buffer(big.clone());

    let options = WriteOptions {
        pack_streams: true,
        ..WriteOptions::default()
    };
    let file = write_to_vec(&mut wim, &options);

    let reopened = Wim::from_reader(file).unwrap();
    let lte_a = reopened.store().lookup(&hash_a).unwrap();
    let lte_b = reopened.store().lookup(&hash_b).unwrap();
    let lte_big = reopened.store().lookup(&hash_big).unwrap();

    assert!(lte_a.reshdr.flags.is_packed());
    assert!(lte_b.reshdr.flags.is_packed());
    assert!(!lte_big.reshdr.flags.is_packed());
    // Both members point at the same packed resource.
    assert_eq!(lte_a.reshdr.offset_in_wim, lte_b.reshdr.offset_in_wim);

    assert_eq!(collect_stream(&reopened, &hash_a), small_a);
    assert_eq!(collect_stream(&reopened, &hash_b), small_b);
    assert_eq!(collect_stream(&reopened, &hash_big), big);
}

#[test]
fn deleted_image_streams_are_reclaimed_on_rebuild() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shrink.wim");

    let keep = compressible(100_000, 30);
    let drop_me = compressible(100_000, 31);

    let mut wim = Wim::create(Some(CodecKind::Xpress), 32768).unwrap();
    let keep_hash = wim.add_stream_from_buffer(keep.clone());
    let drop_hash = wim.add_stream_from_buffer(drop_me);
    wim.add_image(MetadataBlob::new(vec![keep_hash], Vec::new()))
        .unwrap();
    wim.add_image(MetadataBlob::new(vec![drop_hash], Vec::new()))
        .unwrap();
    wim.write_path(&path, &WriteOptions::default(), &SilentProgress)
        .unwrap();

    let mut wim = Wim::open_path(&path).unwrap();
    wim.recalculate_refcounts().unwrap();
    wim.delete_image(2).unwrap();

    // Deletion forces the rebuild path; the dropped stream disappears.
    wim.overwrite(&WriteOptions::default(), &SilentProgress)
        .unwrap();

    let reopened = Wim::open_path(&path).unwrap();
    assert_eq!(reopened.image_count(), 1);
    assert!(reopened.store().lookup(&drop_hash).is_none());
    assert_eq!(collect_stream(&reopened, &keep_hash), keep);
}

#[test]
fn uncompressed_wim_round_trips() {
    let data = compressible(100_000, 44);

    let mut wim = Wim::create(None, 32768).unwrap();
    let hash = wim.add_stream_from_buffer(data.clone());
    let file = write_to_vec(&mut wim, &WriteOptions::default());

    let reopened = Wim::from_reader(file).unwrap();
    assert_eq!(reopened.codec(), None);
    let lte = reopened.store().lookup(&hash).unwrap();
    assert!(!lte.reshdr.flags.is_compressed());
    assert_eq!(collect_stream(&reopened, &hash), data);
}
