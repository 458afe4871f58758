#![forbid(unsafe_code)]

use std::io::{self, Write};

use crc::{Crc, Digest, CRC_32_ISO_HDLC};

////////////////////////////////////////////////////////////////////////////////

static CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Running checksum over a byte stream.
pub trait Checksum {
    fn update(&mut self, bytes: &[u8]);
    fn finalize(self) -> u32;
}

/// CRC-32 as used by GZIP.
pub struct Crc32(Digest<'static, u32>);

impl Default for Crc32 {
    fn default() -> Self {
        Self(CRC.digest())
    }
}

impl Checksum for Crc32 {
    fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    fn finalize(self) -> u32 {
        self.0.finalize()
    }
}

pub fn crc32(bytes: &[u8]) -> u32 {
    CRC.checksum(bytes)
}

////////////////////////////////////////////////////////////////////////////////

const ADLER_MOD: u32 = 65521;
// Largest n such that 255 * n * (n + 1) / 2 + (n + 1) * (ADLER_MOD - 1) fits in u32.
const ADLER_MAX_CHUNK: usize = 5552;

/// Adler-32 as used by ZLIB.
pub struct Adler32 {
    a: u32,
    b: u32,
}

impl Default for Adler32 {
    fn default() -> Self {
        Self { a: 1, b: 0 }
    }
}

impl Checksum for Adler32 {
    fn update(&mut self, bytes: &[u8]) {
        for chunk in bytes.chunks(ADLER_MAX_CHUNK) {
            for &byte in chunk {
                self.a += byte as u32;
                self.b += self.a;
            }
            self.a %= ADLER_MOD;
            self.b %= ADLER_MOD;
        }
    }

    fn finalize(self) -> u32 {
        (self.b << 16) | self.a
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Passes writes through to `inner` while counting bytes and updating a
/// checksum over exactly the bytes `inner` accepted.
pub struct TrackingWriter<T, C = Crc32> {
    checksum: C,
    inner: T,
    byte_n: u64,
}

impl<T: Write, C: Checksum> Write for TrackingWriter<T, C> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let size = self.inner.write(buf)?;
        self.checksum.update(&buf[..size]);
        self.byte_n += size as u64;
        Ok(size)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<T: Write, C: Checksum + Default> TrackingWriter<T, C> {
    pub fn new(inner: T) -> Self {
        Self {
            checksum: C::default(),
            inner,
            byte_n: 0,
        }
    }
}

impl<T, C: Checksum> TrackingWriter<T, C> {
    pub fn byte_count(&self) -> u64 {
        self.byte_n
    }

    /// Returns `(inner, checksum, byte count)`.
    pub fn into_parts(self) -> (T, u32, u64) {
        (self.inner, self.checksum.finalize(), self.byte_n)
    }
}

////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write() -> io::Result<()> {
        let mut buf: &mut [u8] = &mut [0u8; 10];
        let mut writer: TrackingWriter<_> = TrackingWriter::new(&mut buf);

        assert_eq!(writer.write(&[1, 2, 3, 4])?, 4);
        assert_eq!(writer.byte_count(), 4);

        assert_eq!(writer.write(&[4, 8, 15, 16, 23])?, 5);
        assert_eq!(writer.byte_count(), 9);

        assert_eq!(writer.write(&[0, 0, 123])?, 1);
        assert_eq!(writer.byte_count(), 10);

        assert_eq!(writer.write(&[42, 124, 234, 27])?, 0);
        assert_eq!(writer.byte_count(), 10);
        assert_eq!(writer.into_parts().1, 2992191065);

        Ok(())
    }

    #[test]
    fn crc32_known_values() {
        assert_eq!(crc32(b""), 0);
        assert_eq!(crc32(b"123456789"), 0xcbf43926);

        let mut crc = Crc32::default();
        crc.update(b"12345");
        crc.update(b"6789");
        assert_eq!(crc.finalize(), 0xcbf43926);
    }

    #[test]
    fn adler32_known_values() {
        assert_eq!(Adler32::default().finalize(), 1);

        let mut adler = Adler32::default();
        adler.update(b"Wiki");
        adler.update(b"pedia");
        assert_eq!(adler.finalize(), 0x11e60398);
    }

    #[test]
    fn adler32_long_input() {
        let data = vec![0xffu8; 100_000];
        let mut chunked = Adler32::default();
        for piece in data.chunks(777) {
            chunked.update(piece);
        }

        let (mut a, mut b) = (1u64, 0u64);
        for &byte in &data {
            a = (a + byte as u64) % 65521;
            b = (b + a) % 65521;
        }
        assert_eq!(chunked.finalize(), ((b << 16) | a) as u32);
    }

    #[test]
    fn tracks_adler() -> io::Result<()> {
        let mut writer: TrackingWriter<_, Adler32> = TrackingWriter::new(Vec::new());
        writer.write_all(b"Wikipedia")?;
        let (inner, adler, count) = writer.into_parts();
        assert_eq!(inner, b"Wikipedia".to_vec());
        assert_eq!(adler, 0x11e60398);
        assert_eq!(count, 9);
        Ok(())
    }
}
