use crate::codec::CodecKind;
use crate::io::ReadAt;
use crate::reshdr::Reshdr;
use sha1::{Digest, Sha1};
use snafu::{Snafu, ensure};
use std::fmt::{self, Display, Formatter};
use std::io::{self, Seek, SeekFrom, Write};
use std::time::{SystemTime, UNIX_EPOCH};
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Magic bytes of an ordinary WIM file.
pub const WIM_MAGIC: [u8; 8] = *b"MSWIM\0\0\0";

/// Magic bytes of a pipable WIM, laid out for one-pass consumption.
pub const PWM_MAGIC: [u8; 8] = *b"WLPWM\0\0\0";

/// Size of the on-disk header in bytes.
pub const HEADER_SIZE: usize = 208;

/// Format version of ordinary image WIMs.
pub const WIM_VERSION_DEFAULT: u32 = 0x10d00;

/// Format version of pipable WIMs.
pub const WIM_VERSION_PIPABLE: u32 = 0x10000;

/// Header flag word.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    FromBytes,
    IntoBytes,
    KnownLayout,
    Immutable,
    Unaligned,
)]
#[repr(transparent)]
pub struct HeaderFlags(U32);

impl HeaderFlags {
    pub const RESERVED: u32 = 0x00000001;
    /// Resources are compressed; exactly one codec bit must accompany this.
    pub const COMPRESSION: u32 = 0x00000002;
    pub const READONLY: u32 = 0x00000004;
    pub const SPANNED: u32 = 0x00000008;
    pub const RESOURCE_ONLY: u32 = 0x00000010;
    pub const METADATA_ONLY: u32 = 0x00000020;
    /// Set while an in-place append is running; cleared at header commit.
    pub const WRITE_IN_PROGRESS: u32 = 0x00000040;
    pub const RP_FIX: u32 = 0x00000080;
    pub const COMPRESS_XPRESS: u32 = 0x00020000;
    pub const COMPRESS_LZX: u32 = 0x00040000;
    pub const COMPRESS_LZMS: u32 = 0x00080000;

    const COMPRESS_MASK: u32 =
        Self::COMPRESS_XPRESS | Self::COMPRESS_LZX | Self::COMPRESS_LZMS;

    #[must_use]
    pub const fn new(bits: u32) -> Self {
        Self(U32::new(bits))
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0.get()
    }

    #[inline]
    #[must_use]
    pub const fn contains(self, bits: u32) -> bool {
        self.0.get() & bits != 0
    }

    #[must_use]
    pub const fn with(self, bits: u32) -> Self {
        Self::new(self.0.get() | bits)
    }

    #[must_use]
    pub const fn without(self, bits: u32) -> Self {
        Self::new(self.0.get() & !bits)
    }

    #[inline]
    #[must_use]
    pub const fn is_readonly(self) -> bool {
        self.contains(Self::READONLY)
    }

    #[inline]
    #[must_use]
    pub const fn write_in_progress(self) -> bool {
        self.contains(Self::WRITE_IN_PROGRESS)
    }

    /// Decodes the codec bits.
    ///
    /// Returns `Err` with the offending bits when the compression flag and
    /// codec bits are inconsistent.
    pub const fn codec(self) -> Result<Option<CodecKind>, u32> {
        let compress_bits = self.0.get() & Self::COMPRESS_MASK;

        if !self.contains(Self::COMPRESSION) {
            return if compress_bits == 0 {
                Ok(None)
            } else {
                Err(compress_bits)
            };
        }

        match compress_bits {
            Self::COMPRESS_XPRESS => Ok(Some(CodecKind::Xpress)),
            Self::COMPRESS_LZX => Ok(Some(CodecKind::Lzx)),
            Self::COMPRESS_LZMS => Ok(Some(CodecKind::Lzms)),
            bits => Err(bits),
        }
    }

    /// Replaces the compression flag and codec bits.
    #[must_use]
    pub const fn with_codec(self, codec: Option<CodecKind>) -> Self {
        let cleared = self.0.get() & !(Self::COMPRESSION | Self::COMPRESS_MASK);

        let bits = match codec {
            None => cleared,
            Some(CodecKind::Xpress) => cleared | Self::COMPRESSION | Self::COMPRESS_XPRESS,
            Some(CodecKind::Lzx) => cleared | Self::COMPRESSION | Self::COMPRESS_LZX,
            Some(CodecKind::Lzms) => cleared | Self::COMPRESSION | Self::COMPRESS_LZMS,
        };

        Self::new(bits)
    }
}

impl Display for HeaderFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.bits())?;

        let names = [
            (Self::RESERVED, "reserved"),
            (Self::COMPRESSION, "compression"),
            (Self::READONLY, "readonly"),
            (Self::SPANNED, "spanned"),
            (Self::RESOURCE_ONLY, "resource-only"),
            (Self::METADATA_ONLY, "metadata-only"),
            (Self::WRITE_IN_PROGRESS, "write-in-progress"),
            (Self::RP_FIX, "rp-fix"),
            (Self::COMPRESS_XPRESS, "xpress"),
            (Self::COMPRESS_LZX, "lzx"),
            (Self::COMPRESS_LZMS, "lzms"),
        ];

        let mut first = true;

        for (bit, name) in names {
            if self.contains(bit) {
                f.write_str(if first { " (" } else { ", " })?;
                f.write_str(name)?;
                first = false;
            }
        }

        if !first {
            f.write_str(")")?;
        }

        Ok(())
    }
}

/// On-disk layout of the 208-byte header.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct WimHeaderRaw {
    magic: [u8; 8],             // 0x00
    header_size: U32,           // 0x08
    version: U32,               // 0x0C
    flags: HeaderFlags,         // 0x10
    chunk_size: U32,            // 0x14
    guid: [u8; 16],             // 0x18
    part_number: U16,           // 0x28
    total_parts: U16,           // 0x2A
    image_count: U32,           // 0x2C
    lookup_table_reshdr: [u8; Reshdr::DISK_SIZE], // 0x30
    xml_data_reshdr: [u8; Reshdr::DISK_SIZE],     // 0x48
    boot_metadata_reshdr: [u8; Reshdr::DISK_SIZE], // 0x60
    boot_index: U32,            // 0x78
    integrity_table_reshdr: [u8; Reshdr::DISK_SIZE], // 0x7C
    reserved: [u8; 60],         // 0x94, zero padding to 0xD0
}

/// Errors when reading a WIM header.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ReadError {
    #[snafu(display("i/o failed reading header"))]
    Io { source: io::Error },

    #[snafu(display("not a WIM file (bad magic)"))]
    NotAWimFile,

    #[snafu(display("unexpected header size {size}"))]
    BadHeaderSize { size: u32 },

    #[snafu(display("unknown WIM version {version:#x}"))]
    UnknownVersion { version: u32 },

    #[snafu(display("inconsistent compression flag bits {bits:#x}"))]
    BadCompressionFlags { bits: u32 },
}

/// The parsed WIM header.
///
/// Layout and field order are bit-exact with the on-disk format; the header
/// is always rewritten last during a commit so that a crash mid-write
/// leaves an older, still-valid header in place.
#[derive(Clone, Debug)]
pub struct WimHeader {
    pub magic: [u8; 8],
    pub version: u32,
    pub flags: HeaderFlags,
    pub chunk_size: u32,
    pub guid: [u8; 16],
    pub part_number: u16,
    pub total_parts: u16,
    pub image_count: u32,
    pub lookup_table_reshdr: Reshdr,
    pub xml_data_reshdr: Reshdr,
    pub boot_metadata_reshdr: Reshdr,
    pub boot_index: u32,
    pub integrity_table_reshdr: Reshdr,
}

impl WimHeader {
    /// Creates the header of a fresh, empty WIM.
    #[must_use]
    pub fn new(codec: Option<CodecKind>, chunk_size: u32) -> Self {
        Self {
            magic: WIM_MAGIC,
            version: WIM_VERSION_DEFAULT,
            flags: HeaderFlags::default().with_codec(codec),
            chunk_size,
            guid: generate_guid(),
            part_number: 1,
            total_parts: 1,
            image_count: 0,
            lookup_table_reshdr: Reshdr::default(),
            xml_data_reshdr: Reshdr::default(),
            boot_metadata_reshdr: Reshdr::default(),
            boot_index: 0,
            integrity_table_reshdr: Reshdr::default(),
        }
    }

    /// Reads and validates the header at offset 0 of `reader`.
    pub fn read_from<R: ReadAt + ?Sized>(reader: &R) -> Result<Self, ReadError> {
        let mut buf = [0u8; HEADER_SIZE];
        reader
            .read_exact_at(0, &mut buf)
            .map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => ReadError::NotAWimFile,
                _ => ReadError::Io { source: e },
            })?;

        let raw = WimHeaderRaw::read_from_bytes(&buf).expect("buffer is exactly one header");

        ensure!(
            raw.magic == WIM_MAGIC || raw.magic == PWM_MAGIC,
            NotAWimFileSnafu
        );
        ensure!(
            raw.header_size.get() == HEADER_SIZE as u32,
            BadHeaderSizeSnafu {
                size: raw.header_size.get(),
            }
        );
        ensure!(
            raw.version.get() == WIM_VERSION_DEFAULT || raw.version.get() == WIM_VERSION_PIPABLE,
            UnknownVersionSnafu {
                version: raw.version.get(),
            }
        );

        if let Err(bits) = raw.flags.codec() {
            return BadCompressionFlagsSnafu { bits }.fail();
        }

        Ok(Self {
            magic: raw.magic,
            version: raw.version.get(),
            flags: raw.flags,
            chunk_size: raw.chunk_size.get(),
            guid: raw.guid,
            part_number: raw.part_number.get(),
            total_parts: raw.total_parts.get(),
            image_count: raw.image_count.get(),
            lookup_table_reshdr: Reshdr::from_bytes(&raw.lookup_table_reshdr),
            xml_data_reshdr: Reshdr::from_bytes(&raw.xml_data_reshdr),
            boot_metadata_reshdr: Reshdr::from_bytes(&raw.boot_metadata_reshdr),
            boot_index: raw.boot_index.get(),
            integrity_table_reshdr: Reshdr::from_bytes(&raw.integrity_table_reshdr),
        })
    }

    /// Encodes into the 208-byte on-disk form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let raw = WimHeaderRaw {
            magic: self.magic,
            header_size: U32::new(HEADER_SIZE as u32),
            version: U32::new(self.version),
            flags: self.flags,
            chunk_size: U32::new(self.chunk_size),
            guid: self.guid,
            part_number: U16::new(self.part_number),
            total_parts: U16::new(self.total_parts),
            image_count: U32::new(self.image_count),
            lookup_table_reshdr: self.lookup_table_reshdr.to_bytes(),
            xml_data_reshdr: self.xml_data_reshdr.to_bytes(),
            boot_metadata_reshdr: self.boot_metadata_reshdr.to_bytes(),
            boot_index: U32::new(self.boot_index),
            integrity_table_reshdr: self.integrity_table_reshdr.to_bytes(),
            reserved: [0; 60],
        };

        let mut out = [0u8; HEADER_SIZE];
        out.copy_from_slice(raw.as_bytes());
        out
    }

    /// Writes the header at offset 0 and flushes. Callers commit the
    /// header as the final step of a write.
    pub fn write_to<W: Write + Seek>(&self, out: &mut W) -> io::Result<()> {
        out.seek(SeekFrom::Start(0))?;
        out.write_all(&self.to_bytes())?;
        out.flush()
    }

    #[inline]
    #[must_use]
    pub fn is_pipable(&self) -> bool {
        self.magic == PWM_MAGIC
    }

    #[inline]
    #[must_use]
    pub fn has_integrity_table(&self) -> bool {
        !self.integrity_table_reshdr.is_absent()
    }

    /// The codec all compressed resources in this WIM use, or `None` for an
    /// uncompressed WIM. Validated at read time.
    #[must_use]
    pub fn codec(&self) -> Option<CodecKind> {
        self.flags.codec().unwrap_or(None)
    }

    pub fn set_codec(&mut self, codec: Option<CodecKind>) {
        self.flags = self.flags.with_codec(codec);
    }

    /// Switches between ordinary and pipable magic/version.
    pub fn set_pipable(&mut self, pipable: bool) {
        if pipable {
            self.magic = PWM_MAGIC;
            self.version = WIM_VERSION_PIPABLE;
        } else {
            self.magic = WIM_MAGIC;
            self.version = WIM_VERSION_DEFAULT;
        }
    }
}

/// Produces a fresh 16-byte GUID for a new or rewritten WIM.
///
/// Derived from the wall clock, the process id, and a per-process counter,
/// digested so the output carries no recognizable structure.
#[must_use]
pub fn generate_guid() -> [u8; 16] {
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    let mut sha1 = Sha1::new();
    sha1.update(nanos.to_le_bytes());
    sha1.update(std::process::id().to_le_bytes());
    sha1.update(COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());

    let digest = sha1.finalize();
    let mut guid = [0u8; 16];
    guid.copy_from_slice(&digest[..16]);
    guid
}
