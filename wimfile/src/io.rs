use std::cmp::min;
use std::io;
use std::sync::Arc;

/// Positional read access to a WIM container.
///
/// This trait provides thread-safe, stateless access to the underlying
/// bytes. Unlike `Read + Seek`, each call specifies its own offset, so
/// concurrent readers need no synchronization and no shared cursor.
pub trait ReadAt: Send + Sync {
    /// Reads bytes at the given offset into `buf`.
    ///
    /// Returns the number of bytes actually read. A short read indicates
    /// the end of the container was reached.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Reads exactly `buf.len()` bytes at `offset`.
    ///
    /// Returns [`io::ErrorKind::UnexpectedEof`] if the container ends before
    /// the buffer is filled.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut total = 0;

        while total < buf.len() {
            let n = self.read_at(offset + total as u64, &mut buf[total..])?;

            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "unexpected EOF in WIM container",
                ));
            }

            total += n;
        }

        Ok(())
    }

    /// Returns the total length of the container in bytes.
    fn len(&self) -> u64;

    /// Returns `true` if the container is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ReadAt for [u8] {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let start = offset as usize;

        if start >= self.len() {
            return Ok(0);
        }

        let n = min(buf.len(), self.len() - start);
        buf[..n].copy_from_slice(&self[start..start + n]);

        Ok(n)
    }

    fn len(&self) -> u64 {
        <[u8]>::len(self) as u64
    }
}

impl ReadAt for Vec<u8> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.as_slice().read_at(offset, buf)
    }

    fn len(&self) -> u64 {
        self.as_slice().len() as u64
    }
}

#[cfg(unix)]
impl ReadAt for std::fs::File {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, offset)
    }

    fn len(&self) -> u64 {
        self.metadata().map(|m| m.len()).unwrap_or(0)
    }
}

impl<T: ReadAt + ?Sized> ReadAt for &T {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_at(offset, buf)
    }

    fn len(&self) -> u64 {
        (**self).len()
    }
}

impl<T: ReadAt + ?Sized> ReadAt for Arc<T> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_at(offset, buf)
    }

    fn len(&self) -> u64 {
        (**self).len()
    }
}

impl<T: ReadAt + ?Sized> ReadAt for Box<T> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_at(offset, buf)
    }

    fn len(&self) -> u64 {
        (**self).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_read_at_short_read_at_end() {
        let data = [1u8, 2, 3, 4, 5];
        let mut buf = [0u8; 4];

        assert_eq!(data.as_slice().read_at(3, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[4, 5]);
        assert_eq!(data.as_slice().read_at(5, &mut buf).unwrap(), 0);
    }

    #[test]
    fn read_exact_at_fails_past_end() {
        let data = vec![0u8; 8];
        let mut buf = [0u8; 4];

        data.read_exact_at(4, &mut buf).unwrap();

        let err = data.read_exact_at(6, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
