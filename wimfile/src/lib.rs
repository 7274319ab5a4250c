//! A library for reading and writing Windows Imaging (WIM) archives.
//!
//! A WIM is a content-addressed, deduplicated container: every stored
//! stream is keyed by the SHA-1 of its bytes, images are directory trees
//! whose entries reference streams by hash, and resources are compressed
//! in fixed-size chunks by one of the XPRESS, LZX, or LZMS codec families.
//!
//! # Features
//!
//! - Bit-exact header, resource-header, and lookup-table encoding
//! - SHA-1 deduplicated stream store with reference counting
//! - Chunked resource compression with serial and parallel pipelines
//! - Append-in-place writes that stay crash-recoverable: the header
//!   commits last, so an interrupted overwrite leaves the old WIM valid
//! - Packed resources grouping small streams for better ratio
//! - Optional integrity table over the resource area
//!
//! # Example
//!
//! ```no_run
//! use wimfile::{CodecKind, MetadataBlob, SilentProgress, Wim, WriteOptions};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Build a WIM with one image referencing one stream.
//! let mut wim = Wim::create(Some(CodecKind::Lzx), 1 << 15)?;
//! let hash = wim.add_stream_from_buffer(std::fs::read("kernel.bin")?);
//! wim.add_image(MetadataBlob::new(vec![hash], Vec::new()))?;
//! wim.write_path("image.wim", &WriteOptions::default(), &SilentProgress)?;
//!
//! // Reopen and stream the bytes back out.
//! let reopened = wimfile::Wim::open_path("image.wim")?;
//! let mut restored = Vec::new();
//! reopened.read_stream(&hash, &mut |part: &[u8]| {
//!     restored.extend_from_slice(part);
//!     Ok(())
//! })?;
//! # Ok(())
//! # }
//! ```
//!
//! # References
//!
//! - Windows Imaging File Format specification (MSDN archive)

pub mod codec;
pub mod hash;
pub mod header;
pub mod integrity;
pub mod io;
pub mod metadata;
pub mod pipeline;
pub mod progress;
pub mod resource;
pub mod reshdr;
pub mod store;
pub mod wim;
pub mod write;

pub use self::codec::{CodecKind, CompressionConfig, DEFAULT_COMPRESSION_LEVEL};
pub use self::hash::Sha1Digest;
pub use self::header::{HEADER_SIZE, HeaderFlags, WimHeader};
pub use self::integrity::{INTEGRITY_CHUNK_SIZE, IntegrityStatus};
pub use self::io::ReadAt;
pub use self::metadata::MetadataBlob;
pub use self::progress::{ProgressAction, SilentProgress, WimProgress};
pub use self::reshdr::{Reshdr, ResourceFlags};
pub use self::store::{Lte, ResourceLocation, StreamStore};
pub use self::wim::{OpenError, StreamConsumer, Wim};
pub use self::write::{WriteError, WriteOptions};
