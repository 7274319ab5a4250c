use std::fmt::{self, Display, Formatter};
use zerocopy::byteorder::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Flag bits of the on-disk resource header.
///
/// Stored in the single flags byte of the 24-byte [`Reshdr`] encoding.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    FromBytes,
    IntoBytes,
    KnownLayout,
    Immutable,
    Unaligned,
)]
#[repr(transparent)]
pub struct ResourceFlags(u8);

impl ResourceFlags {
    /// The resource region is unused and may be reclaimed.
    pub const FREE: u8 = 0x01;
    /// The resource holds serialized image metadata.
    pub const METADATA: u8 = 0x02;
    /// The resource is chunk-compressed and carries a chunk offset table.
    pub const COMPRESSED: u8 = 0x04;
    /// The resource continues in another part of a split WIM.
    pub const SPANNED: u8 = 0x08;
    /// The resource holds a run of multiple packed streams.
    pub const PACKED: u8 = 0x10;

    #[must_use]
    pub const fn new(bits: u8) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_free(self) -> bool {
        self.0 & Self::FREE != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_metadata(self) -> bool {
        self.0 & Self::METADATA != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_compressed(self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_spanned(self) -> bool {
        self.0 & Self::SPANNED != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_packed(self) -> bool {
        self.0 & Self::PACKED != 0
    }

    #[must_use]
    pub const fn with(self, bits: u8) -> Self {
        Self(self.0 | bits)
    }

    #[must_use]
    pub const fn without(self, bits: u8) -> Self {
        Self(self.0 & !bits)
    }
}

impl Display for ResourceFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)?;

        let names = [
            (Self::FREE, "free"),
            (Self::METADATA, "metadata"),
            (Self::COMPRESSED, "compressed"),
            (Self::SPANNED, "spanned"),
            (Self::PACKED, "packed"),
        ];

        let mut first = true;

        for (bit, name) in names {
            if self.0 & bit != 0 {
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

/// On-disk layout of a resource header (24 bytes).
///
/// The size-in-WIM field is only 7 bytes wide; the eighth byte of that
/// word holds the flags.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct ReshdrRaw {
    size_in_wim: [u8; 7],
    flags: ResourceFlags,
    offset_in_wim: U64,
    uncompressed_size: U64,
}

/// Describes one stored resource: where it lives in the file, its on-disk
/// (possibly compressed) size, its uncompressed size, and its flags.
///
/// A `Reshdr` is immutable once its resource is written; rewriting a stream
/// produces a new header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Reshdr {
    pub offset_in_wim: u64,
    pub size_in_wim: u64,
    pub uncompressed_size: u64,
    pub flags: ResourceFlags,
}

impl Reshdr {
    /// Size of the on-disk encoding in bytes.
    pub const DISK_SIZE: usize = size_of::<ReshdrRaw>();

    /// Maximum representable on-disk size (7-byte field).
    pub const MAX_SIZE_IN_WIM: u64 = (1 << 56) - 1;

    /// Returns `true` if this header describes no resource at all
    /// (every field zero), the encoding for "absent" in the WIM header.
    #[must_use]
    pub fn is_absent(&self) -> bool {
        *self == Self::default()
    }

    /// File offset one past the end of the resource.
    #[must_use]
    pub fn end_offset(&self) -> u64 {
        self.offset_in_wim + self.size_in_wim
    }

    /// Encodes into the bit-exact 24-byte on-disk form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::DISK_SIZE] {
        debug_assert!(self.size_in_wim <= Self::MAX_SIZE_IN_WIM);

        let size = self.size_in_wim.to_le_bytes();
        let mut size7 = [0u8; 7];
        size7.copy_from_slice(&size[..7]);

        let raw = ReshdrRaw {
            size_in_wim: size7,
            flags: self.flags,
            offset_in_wim: U64::new(self.offset_in_wim),
            uncompressed_size: U64::new(self.uncompressed_size),
        };

        let mut out = [0u8; Self::DISK_SIZE];
        out.copy_from_slice(raw.as_bytes());
        out
    }

    /// Decodes from the 24-byte on-disk form.
    #[must_use]
    pub fn from_bytes(bytes: &[u8; Self::DISK_SIZE]) -> Self {
        let raw = ReshdrRaw::read_from_bytes(bytes).expect("buffer is exactly one reshdr");

        let mut size = [0u8; 8];
        size[..7].copy_from_slice(&raw.size_in_wim);

        Self {
            offset_in_wim: raw.offset_in_wim.get(),
            size_in_wim: u64::from_le_bytes(size),
            uncompressed_size: raw.uncompressed_size.get(),
            flags: raw.flags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_size_is_24() {
        assert_eq!(Reshdr::DISK_SIZE, 24);
    }

    #[test]
    fn round_trip_is_bit_exact() {
        let hdr = Reshdr {
            offset_in_wim: 0x1122334455667788,
            size_in_wim: 0x00DEADBEEFCAFE42,
            uncompressed_size: 0x0102030405060708,
            flags: ResourceFlags::new(ResourceFlags::COMPRESSED | ResourceFlags::METADATA),
        };

        let bytes = hdr.to_bytes();
        assert_eq!(Reshdr::from_bytes(&bytes), hdr);

        // 7-byte little-endian size followed by the flags byte.
        assert_eq!(&bytes[..7], &[0x42, 0xFE, 0xCA, 0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(bytes[7], ResourceFlags::COMPRESSED | ResourceFlags::METADATA);
        assert_eq!(&bytes[8..16], &0x1122334455667788u64.to_le_bytes());
        assert_eq!(&bytes[16..24], &0x0102030405060708u64.to_le_bytes());
    }

    #[test]
    fn absent_header_is_all_zero() {
        let hdr = Reshdr::default();
        assert!(hdr.is_absent());
        assert_eq!(hdr.to_bytes(), [0u8; 24]);
    }

    #[test]
    fn flags_display_names_set_bits() {
        let flags = ResourceFlags::new(ResourceFlags::COMPRESSED | ResourceFlags::PACKED);
        assert_eq!(flags.to_string(), "0x14 (compressed, packed)");
        assert_eq!(ResourceFlags::default().to_string(), "0x00");
    }
}
