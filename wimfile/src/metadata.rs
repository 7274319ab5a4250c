//! Per-image metadata containers.
//!
//! Each image owns one metadata stream: a serialized directory tree
//! produced by a capture collaborator and stored content-addressed like any
//! other stream, marked with the metadata resource flag. The engine does
//! not interpret the tree itself; it only needs the set of streams the
//! image references, so metadata blobs open with a stream-reference
//! envelope (a counted list of SHA-1 digests) followed by the
//! collaborator's opaque payload.

use crate::hash::{SHA1_LEN, Sha1Digest};
use snafu::{Snafu, ensure};
use zerocopy::IntoBytes;
use zerocopy::byteorder::little_endian::U32;

/// Errors when decoding a metadata blob.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum MetadataError {
    #[snafu(display("metadata blob is too small"))]
    TooSmall,

    #[snafu(display("metadata blob truncated: {expected} stream references, {available} bytes"))]
    TruncatedRefs { expected: u32, available: usize },
}

/// A decoded image metadata blob.
///
/// `refs` lists every stream the image's directory tree references, with
/// one entry per reference (a stream referenced twice appears twice, which
/// is what refcounting needs). `payload` is the collaborator's serialized
/// tree, opaque to the engine.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetadataBlob {
    refs: Vec<Sha1Digest>,
    payload: Vec<u8>,
}

impl MetadataBlob {
    #[must_use]
    pub fn new(refs: Vec<Sha1Digest>, payload: Vec<u8>) -> Self {
        Self { refs, payload }
    }

    #[must_use]
    pub fn refs(&self) -> &[Sha1Digest] {
        &self.refs
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Serializes the envelope: reference count, references, payload.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(4 + self.refs.len() * SHA1_LEN + self.payload.len());
        out.extend_from_slice(U32::new(self.refs.len() as u32).as_bytes());

        for digest in &self.refs {
            out.extend_from_slice(digest.as_bytes());
        }

        out.extend_from_slice(&self.payload);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, MetadataError> {
        ensure!(data.len() >= 4, TooSmallSnafu);

        let count = u32::from_le_bytes(data[..4].try_into().expect("4-byte prefix"));
        let refs_len = count as usize * SHA1_LEN;

        ensure!(
            data.len() - 4 >= refs_len,
            TruncatedRefsSnafu {
                expected: count,
                available: data.len() - 4,
            }
        );

        let refs = data[4..4 + refs_len]
            .chunks_exact(SHA1_LEN)
            .map(|raw| Sha1Digest(raw.try_into().expect("20-byte digest")))
            .collect();

        Ok(Self {
            refs,
            payload: data[4 + refs_len..].to_vec(),
        })
    }
}

/// Bookkeeping for one image's metadata stream.
#[derive(Clone, Debug)]
pub struct ImageMetadata {
    /// Hash of the metadata stream; the key of its lookup-table entry.
    pub hash: Sha1Digest,
    /// Set when the blob changed since the WIM was last committed.
    pub dirty: bool,
    /// Cached decoded blob; populated lazily for opened WIMs.
    pub(crate) blob: Option<MetadataBlob>,
}

impl ImageMetadata {
    /// A freshly added image whose blob is already in memory.
    #[must_use]
    pub fn new_dirty(hash: Sha1Digest, blob: MetadataBlob) -> Self {
        Self {
            hash,
            dirty: true,
            blob: Some(blob),
        }
    }

    /// An image read from an opened WIM; the blob is materialized on first
    /// use.
    #[must_use]
    pub fn unloaded(hash: Sha1Digest) -> Self {
        Self {
            hash,
            dirty: false,
            blob: None,
        }
    }

    #[must_use]
    pub fn blob(&self) -> Option<&MetadataBlob> {
        self.blob.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips() {
        let blob = MetadataBlob::new(
            vec![Sha1Digest::of(b"a"), Sha1Digest::of(b"b"), Sha1Digest::of(b"a")],
            b"opaque directory tree bytes".to_vec(),
        );

        let decoded = MetadataBlob::from_bytes(&blob.to_bytes()).unwrap();
        assert_eq!(decoded, blob);
        assert_eq!(decoded.refs().len(), 3);
    }

    #[test]
    fn empty_blob_round_trips() {
        let blob = MetadataBlob::default();
        let bytes = blob.to_bytes();
        assert_eq!(bytes.len(), 4);
        assert_eq!(MetadataBlob::from_bytes(&bytes).unwrap(), blob);
    }

    #[test]
    fn truncated_refs_are_rejected() {
        let blob = MetadataBlob::new(vec![Sha1Digest::of(b"x")], Vec::new());
        let mut bytes = blob.to_bytes();
        bytes.truncate(10);

        assert!(matches!(
            MetadataBlob::from_bytes(&bytes),
            Err(MetadataError::TruncatedRefs { expected: 1, .. })
        ));
        assert!(matches!(
            MetadataBlob::from_bytes(&[1]),
            Err(MetadataError::TooSmall)
        ));
    }
}
