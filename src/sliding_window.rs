#![forbid(unsafe_code)]

use std::io::Write;

use crate::error::{Error, Result};

////////////////////////////////////////////////////////////////////////////////

/// Window size used by DEFLATE unless configured otherwise.
pub const DEFAULT_WINDOW_BITS: u8 = 15;

/// How much decoded output is staged before it is written out.
pub const DEFAULT_OUTPUT_CHUNK: usize = 8 * 1024 * 1024;

////////////////////////////////////////////////////////////////////////////////

/// Circular history of the last `2^nbits` bytes.
pub struct SlidingWindow {
    data: Vec<u8>,
    mask: usize,
    pos: usize,
}

impl SlidingWindow {
    pub fn new(nbits: u8) -> Self {
        assert!(nbits < usize::BITS as u8);
        let size = 1usize << nbits;
        Self {
            data: vec![0; size],
            mask: size - 1,
            pos: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// The byte written `offset` puts ago.
    pub fn get(&self, offset: usize) -> u8 {
        debug_assert!(offset >= 1 && offset <= self.size());
        self.data[self.pos.wrapping_sub(offset) & self.mask]
    }

    pub fn put(&mut self, value: u8) {
        self.data[self.pos] = value;
        self.pos = (self.pos + 1) & self.mask;
    }

    /// Copy the byte at `offset` to the head of the window and return it.
    pub fn get_put(&mut self, offset: usize) -> u8 {
        let value = self.get(offset);
        self.put(value);
        value
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        let bytes = if bytes.len() > self.size() {
            &bytes[bytes.len() - self.size()..]
        } else {
            bytes
        };
        let first = bytes.len().min(self.size() - self.pos);
        self.data[self.pos..self.pos + first].copy_from_slice(&bytes[..first]);
        self.data[..bytes.len() - first].copy_from_slice(&bytes[first..]);
        self.pos = (self.pos + bytes.len()) & self.mask;
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Decoder output: a sliding window plus a staging buffer in front of `inner`.
///
/// Everything passes through the window so that back-references can be
/// resolved; the staging buffer is written to `inner` only when it fills up,
/// or on `flush_staging`/`finish`.
pub struct WindowedWriter<W> {
    window: SlidingWindow,
    staging: Vec<u8>,
    chunk_size: usize,
    inner: W,
    total_out: u64,
}

impl<W: Write> WindowedWriter<W> {
    pub fn new(inner: W) -> Self {
        Self::with_config(inner, DEFAULT_WINDOW_BITS, DEFAULT_OUTPUT_CHUNK)
    }

    pub fn with_config(inner: W, window_bits: u8, chunk_size: usize) -> Self {
        Self {
            window: SlidingWindow::new(window_bits),
            staging: Vec::new(),
            chunk_size: chunk_size.max(1),
            inner,
            total_out: 0,
        }
    }

    pub fn put_literal(&mut self, value: u8) -> Result<()> {
        self.window.put(value);
        self.staging.push(value);
        self.total_out += 1;
        self.flush_if_full()
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.window.put_bytes(bytes);
        self.staging.extend_from_slice(bytes);
        self.total_out += bytes.len() as u64;
        self.flush_if_full()
    }

    /// Repeat `length` bytes starting `distance` bytes back. The ranges may
    /// overlap, so the copy goes one byte at a time.
    pub fn copy_back(&mut self, distance: usize, length: usize) -> Result<()> {
        if distance == 0 || distance > self.window.size() || distance as u64 > self.total_out {
            return Err(Error::MalformedBlock("invalid distance"));
        }
        self.staging.reserve(length);
        for _ in 0..length {
            let value = self.window.get_put(distance);
            self.staging.push(value);
        }
        self.total_out += length as u64;
        self.flush_if_full()
    }

    pub fn total_out(&self) -> u64 {
        self.total_out
    }

    fn flush_if_full(&mut self) -> Result<()> {
        if self.staging.len() >= self.chunk_size {
            self.flush_staging()?;
        }
        Ok(())
    }

    pub fn flush_staging(&mut self) -> Result<()> {
        if !self.staging.is_empty() {
            self.inner.write_all(&self.staging)?;
            self.staging.clear();
        }
        Ok(())
    }

    pub fn finish(mut self) -> Result<W> {
        self.flush_staging()?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_and_put() {
        let mut window = SlidingWindow::new(4);
        for byte in b"ABCD" {
            window.put(*byte);
        }
        assert_eq!(window.get(1), b'D');
        assert_eq!(window.get(4), b'A');
        assert_eq!(window.get_put(4), b'A');
        assert_eq!(window.get(1), b'A');
    }

    #[test]
    fn wraparound() {
        let mut window = SlidingWindow::new(3);
        for i in 0..100u8 {
            window.put(i);
        }
        for offset in 1..=8 {
            assert_eq!(window.get(offset), 100 - offset as u8);
        }

        window.put_bytes(&[200, 201, 202, 203, 204, 205]);
        assert_eq!(window.get(1), 205);
        assert_eq!(window.get(6), 200);
        assert_eq!(window.get(7), 99);
        assert_eq!(window.get(8), 98);

        let long: Vec<u8> = (0..20).collect();
        window.put_bytes(&long);
        for offset in 1..=8 {
            assert_eq!(window.get(offset), 20 - offset as u8);
        }
    }

    #[test]
    fn copy_back() -> Result<()> {
        let mut writer = WindowedWriter::new(Vec::new());
        writer.put_bytes(b"Aboba or Bebra")?;
        writer.copy_back(2, 8)?;
        writer.put_literal(b'!')?;
        assert_eq!(writer.total_out(), 23);
        assert_eq!(writer.finish()?, b"Aboba or Bebrarararara!".to_vec());
        Ok(())
    }

    #[test]
    fn rejects_distance_before_start() -> Result<()> {
        let mut writer = WindowedWriter::new(Vec::new());
        writer.put_bytes(b"abc")?;
        assert!(matches!(
            writer.copy_back(4, 1),
            Err(Error::MalformedBlock(_))
        ));
        assert!(matches!(
            writer.copy_back(0, 1),
            Err(Error::MalformedBlock(_))
        ));
        Ok(())
    }

    #[test]
    fn rejects_distance_beyond_window() -> Result<()> {
        let mut writer = WindowedWriter::with_config(Vec::new(), 8, 16);
        let data: Vec<u8> = (0..=255).chain(0..=255).collect();
        writer.put_bytes(&data)?;
        writer.copy_back(256, 3)?;
        assert!(matches!(
            writer.copy_back(257, 1),
            Err(Error::MalformedBlock(_))
        ));
        let out = writer.finish()?;
        assert_eq!(&out[512..], &[0, 1, 2]);
        Ok(())
    }

    #[test]
    fn flushes_in_chunks() -> Result<()> {
        let mut sink = Vec::new();
        let mut writer = WindowedWriter::with_config(&mut sink, 15, 4);
        writer.put_bytes(b"ab")?;
        writer.copy_back(2, 6)?;
        writer.put_literal(b'c')?;
        writer.finish()?;
        assert_eq!(sink, b"abababababc".to_vec());
        Ok(())
    }
}
