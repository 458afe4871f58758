#![forbid(unsafe_code)]

use std::io::{self, Write};

use crate::bit_reader::BitSequence;

////////////////////////////////////////////////////////////////////////////////

const FLUSH_THRESHOLD: usize = 16 * 1024;

/// LSB-first bit writer, the mirror image of `BitReader`.
pub struct BitWriter<W: Write> {
    inner: W,
    pending: Vec<u8>,
    bits: u64,
    bit_count: u8,
    bits_written: u64,
}

impl<W: Write> BitWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            pending: Vec::with_capacity(FLUSH_THRESHOLD),
            bits: 0,
            bit_count: 0,
            bits_written: 0,
        }
    }

    pub fn write_bits(&mut self, bits: u32, len: u8) -> io::Result<()> {
        assert!(len <= 32);
        self.write_seq(BitSequence::new(bits, len))
    }

    pub fn write_seq(&mut self, seq: BitSequence) -> io::Result<()> {
        self.bits |= (seq.bits() as u64) << self.bit_count;
        self.bit_count += seq.len();
        self.bits_written += seq.len() as u64;
        while self.bit_count >= 8 {
            self.pending.push(self.bits as u8);
            self.bits >>= 8;
            self.bit_count -= 8;
        }
        if self.pending.len() >= FLUSH_THRESHOLD {
            self.flush_pending()?;
        }
        Ok(())
    }

    /// Write a Huffman code, most significant bit first.
    pub fn write_code(&mut self, code: BitSequence) -> io::Result<()> {
        self.write_seq(code.reversed())
    }

    /// Pad with zero bits up to the next byte boundary.
    pub fn align_to_byte(&mut self) -> io::Result<()> {
        let pad = (8 - self.bit_count % 8) % 8;
        self.write_bits(0, pad)
    }

    /// Byte-aligned raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.align_to_byte()?;
        self.pending.extend_from_slice(bytes);
        self.bits_written += 8 * bytes.len() as u64;
        if self.pending.len() >= FLUSH_THRESHOLD {
            self.flush_pending()?;
        }
        Ok(())
    }

    pub fn bits_written(&self) -> u64 {
        self.bits_written
    }

    fn flush_pending(&mut self) -> io::Result<()> {
        self.inner.write_all(&self.pending)?;
        self.pending.clear();
        Ok(())
    }

    /// Write out completed bytes. Bits of an unfinished byte stay buffered.
    pub fn flush(&mut self) -> io::Result<()> {
        self.flush_pending()?;
        self.inner.flush()
    }

    /// Pad the last byte and hand back the underlying writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.align_to_byte()?;
        self.flush_pending()?;
        Ok(self.inner)
    }
}

////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bit_reader::BitReader;

    #[test]
    fn write_bits() -> io::Result<()> {
        let mut writer = BitWriter::new(Vec::new());
        writer.write_bits(0b1, 1)?;
        writer.write_bits(0b01, 2)?;
        writer.write_bits(0b100, 3)?;
        writer.write_bits(0b1101, 4)?;
        writer.write_bits(0b10110, 5)?;
        writer.write_bits(0b01011111, 8)?;
        assert_eq!(writer.bits_written(), 23);
        assert_eq!(writer.finish()?, vec![0b01100011, 0b11011011, 0b00101111]);
        Ok(())
    }

    #[test]
    fn codes_are_msb_first() -> io::Result<()> {
        let mut writer = BitWriter::new(Vec::new());
        writer.write_code(BitSequence::new(0b110, 3))?;
        assert_eq!(writer.finish()?, vec![0b011]);
        Ok(())
    }

    #[test]
    fn bytes_after_bits() -> anyhow::Result<()> {
        let mut writer = BitWriter::new(Vec::new());
        writer.write_bits(0b101, 3)?;
        writer.write_bytes(&[0xaa, 0xbb])?;
        writer.write_bits(0x3ff, 10)?;
        let out = writer.finish()?;
        assert_eq!(out, vec![0b101, 0xaa, 0xbb, 0xff, 0x03]);

        let mut reader = BitReader::new(out.as_slice());
        assert_eq!(reader.read_bits(3)?.bits(), 0b101);
        assert_eq!(reader.read_u16_le()?, 0xbbaa);
        assert_eq!(reader.read_bits(10)?.bits(), 0x3ff);
        Ok(())
    }
}
