use sha1::{Digest, Sha1};
use std::fmt::{self, Display, Formatter};
use std::io::Read;
use std::str::FromStr;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Length of a SHA-1 message digest in bytes.
pub const SHA1_LEN: usize = 20;

/// A 20-byte SHA-1 digest.
///
/// Digests serve double duty in a WIM: they are the content address of every
/// stored stream (the dedup key of the lookup table) and the integrity check
/// over stream contents and resource-area slices.
#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    FromBytes,
    IntoBytes,
    KnownLayout,
    Immutable,
    Unaligned,
)]
#[repr(transparent)]
pub struct Sha1Digest(pub [u8; SHA1_LEN]);

impl Sha1Digest {
    /// The all-zero digest, used as a placeholder for unhashed streams.
    pub const ZERO: Self = Self([0; SHA1_LEN]);

    /// Hashes a complete buffer.
    #[must_use]
    pub fn of(data: &[u8]) -> Self {
        let mut sha1 = Sha1::new();
        sha1.update(data);
        Self(sha1.finalize().into())
    }

    /// Returns the raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; SHA1_LEN] {
        &self.0
    }

    /// Returns `true` if this is the all-zero placeholder digest.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0; SHA1_LEN]
    }
}

impl Display for Sha1Digest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Sha1Digest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Sha1Digest({})", self)
    }
}

/// Error returned when parsing a [`Sha1Digest`] from a hex string.
#[derive(Debug, snafu::Snafu)]
#[snafu(display("expected 40 hexadecimal digits"))]
pub struct ParseDigestError;

impl FromStr for Sha1Digest {
    type Err = ParseDigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != SHA1_LEN * 2 || !s.is_ascii() {
            return Err(ParseDigestError);
        }

        let mut out = [0u8; SHA1_LEN];

        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).map_err(|_| ParseDigestError)?;
        }

        Ok(Self(out))
    }
}

/// Incremental SHA-1 over a byte stream.
pub struct StreamHasher {
    sha1: Sha1,
    bytes_fed: u64,
}

impl StreamHasher {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sha1: Sha1::new(),
            bytes_fed: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.sha1.update(data);
        self.bytes_fed += data.len() as u64;
    }

    /// Total number of bytes fed so far.
    #[must_use]
    pub fn bytes_fed(&self) -> u64 {
        self.bytes_fed
    }

    #[must_use]
    pub fn finalize(self) -> Sha1Digest {
        Sha1Digest(self.sha1.finalize().into())
    }
}

impl Default for StreamHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Hashes everything remaining in `reader`.
pub fn hash_reader<R: Read>(reader: &mut R) -> std::io::Result<(Sha1Digest, u64)> {
    let mut hasher = StreamHasher::new();
    let mut buf = [0u8; 32 * 1024];

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    let total = hasher.bytes_fed();
    Ok((hasher.finalize(), total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_of_empty_input() {
        // Well-known SHA-1 of the empty string.
        let expected: Sha1Digest = "da39a3ee5e6b4b0d3255bfef95601890afd80709".parse().unwrap();
        assert_eq!(Sha1Digest::of(&[]), expected);
    }

    #[test]
    fn streaming_matches_one_shot() {
        let data = b"the quick brown fox jumps over the lazy dog";

        let mut hasher = StreamHasher::new();
        hasher.update(&data[..10]);
        hasher.update(&data[10..]);

        assert_eq!(hasher.finalize(), Sha1Digest::of(data));
    }

    #[test]
    fn hex_round_trip() {
        let digest = Sha1Digest::of(b"abc");
        let parsed: Sha1Digest = digest.to_string().parse().unwrap();
        assert_eq!(parsed, digest);

        assert!("not-a-digest".parse::<Sha1Digest>().is_err());
        assert!("zz".repeat(20).parse::<Sha1Digest>().is_err());
    }
}
