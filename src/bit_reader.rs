#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::io::{self, BufRead, Read};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};

use crate::error::{Error, Result};

////////////////////////////////////////////////////////////////////////////////

/// Minimum number of bytes pulled from the underlying reader per refill.
pub const BIG_CHUNK_SIZE: usize = 8192;

/// Largest `n` accepted by [`BitReader::read_bits`].
pub const MAX_READ_BITS: u8 = 24;

////////////////////////////////////////////////////////////////////////////////

/// Up to 32 bits, the first one read stored in the least significant position.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BitSequence {
    bits: u32,
    len: u8,
}

impl BitSequence {
    pub fn new(bits: u32, len: u8) -> Self {
        assert!(len <= 32);
        Self {
            bits: bits & mask(len),
            len,
        }
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn len(&self) -> u8 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reverse the order of the `len` bits.
    ///
    /// Huffman codes are defined most significant bit first, while DEFLATE packs
    /// everything else least significant bit first.
    pub fn reversed(&self) -> Self {
        if self.len == 0 {
            return *self;
        }
        Self {
            bits: self.bits.reverse_bits() >> (32 - self.len as u32),
            len: self.len,
        }
    }
}

fn mask(len: u8) -> u32 {
    if len >= 32 {
        u32::MAX
    } else {
        (1u32 << len) - 1
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Byte queue between the underlying reader and the bit layer.
///
/// Bytes are pulled from `inner` in big chunks and handed out one at a time.
/// The queue is double-ended so that look-ahead bytes the bit layer did not
/// consume can be given back on byte alignment.
pub struct StagedReader<T> {
    inner: T,
    queue: VecDeque<u8>,
    scratch: Vec<u8>,
    exhausted: bool,
    consumed: u64,
}

impl<T: Read> StagedReader<T> {
    fn new(inner: T) -> Self {
        Self {
            inner,
            queue: VecDeque::new(),
            scratch: Vec::new(),
            exhausted: false,
            consumed: 0,
        }
    }

    /// Make sure at least `n` bytes are staged, unless the reader runs dry first.
    pub fn prepare_bytes_up_to(&mut self, n: usize) -> Result<()> {
        while self.queue.len() < n && !self.exhausted {
            let want = (n - self.queue.len()).max(BIG_CHUNK_SIZE);
            self.scratch.resize(want, 0);
            match self.inner.read(&mut self.scratch) {
                Ok(0) => self.exhausted = true,
                Ok(read) => self.queue.extend(&self.scratch[..read]),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    pub fn prepare_big_chunk_if_required(&mut self) -> Result<()> {
        if self.queue.is_empty() {
            self.prepare_bytes_up_to(BIG_CHUNK_SIZE)?;
        }
        Ok(())
    }

    pub fn staged(&self) -> usize {
        self.queue.len()
    }

    fn next_byte(&mut self) -> Result<Option<u8>> {
        self.prepare_big_chunk_if_required()?;
        let byte = self.queue.pop_front();
        if byte.is_some() {
            self.consumed += 1;
        }
        Ok(byte)
    }

    fn unread(&mut self, byte: u8) {
        self.queue.push_front(byte);
        self.consumed -= 1;
    }
}

impl<T: Read> Read for StagedReader<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let available = self.fill_buf()?;
        let len = available.len().min(buf.len());
        buf[..len].copy_from_slice(&available[..len]);
        self.consume(len);
        Ok(len)
    }
}

impl<T: Read> BufRead for StagedReader<T> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.prepare_big_chunk_if_required()?;
        Ok(self.queue.as_slices().0)
    }

    fn consume(&mut self, amt: usize) {
        let amt = amt.min(self.queue.len());
        self.queue.drain(..amt);
        self.consumed += amt as u64;
    }
}

////////////////////////////////////////////////////////////////////////////////

/// LSB-first bit reader with byte-aligned access to the same stream.
pub struct BitReader<T> {
    source: StagedReader<T>,
    bits: u32,
    bit_count: u8,
}

impl<T: Read> BitReader<T> {
    pub fn new(stream: T) -> Self {
        Self {
            source: StagedReader::new(stream),
            bits: 0,
            bit_count: 0,
        }
    }

    /// Pull whole bytes into the accumulator until it holds `n` bits.
    /// Returns `false` if the source ran out first.
    fn fill(&mut self, n: u8) -> Result<bool> {
        while self.bit_count < n {
            match self.source.next_byte()? {
                Some(byte) => {
                    self.bits |= (byte as u32) << self.bit_count;
                    self.bit_count += 8;
                }
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    pub fn read_bits(&mut self, len: u8) -> Result<BitSequence> {
        assert!(len <= MAX_READ_BITS, "cannot read {} bits at once", len);
        if len == 0 {
            return Ok(BitSequence::default());
        }
        if !self.fill(len)? {
            return Err(Error::TruncatedInput);
        }
        let seq = BitSequence::new(self.bits, len);
        self.consume_bits(len);
        Ok(seq)
    }

    pub fn read_bit(&mut self) -> Result<bool> {
        Ok(self.read_bits(1)?.bits() != 0)
    }

    /// Look at the next `len` bits without consuming them.
    ///
    /// Returns `None` when the stream cannot supply that many bits; whatever
    /// could be fetched stays buffered.
    pub fn peek_bits(&mut self, len: u8) -> Result<Option<u32>> {
        assert!(len <= MAX_READ_BITS, "cannot peek {} bits at once", len);
        if !self.fill(len)? {
            return Ok(None);
        }
        Ok(Some(self.bits & mask(len)))
    }

    /// Drop `len` bits previously made available by [`Self::peek_bits`].
    pub fn consume_bits(&mut self, len: u8) {
        debug_assert!(len <= self.bit_count);
        self.bits = if len >= 32 { 0 } else { self.bits >> len };
        self.bit_count -= len;
    }

    pub fn buffered_bits(&self) -> u8 {
        self.bit_count
    }

    /// Skip to the next byte boundary.
    ///
    /// The partially consumed byte is discarded; whole bytes fetched only for
    /// look-ahead go back to the staging queue.
    pub fn align_to_byte(&mut self) {
        let partial = self.bit_count % 8;
        self.consume_bits(partial);
        for i in (0..self.bit_count / 8).rev() {
            self.source.unread((self.bits >> (8 * i as u32)) as u8);
        }
        self.bits = 0;
        self.bit_count = 0;
    }

    /// Byte-aligned access to the rest of the stream.
    pub fn borrow_reader_from_boundary(&mut self) -> &mut StagedReader<T> {
        self.align_to_byte();
        &mut self.source
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.borrow_reader_from_boundary().read_u8()?)
    }

    pub fn read_u16_le(&mut self) -> Result<u16> {
        Ok(self.borrow_reader_from_boundary().read_u16::<LittleEndian>()?)
    }

    pub fn read_u32_le(&mut self) -> Result<u32> {
        Ok(self.borrow_reader_from_boundary().read_u32::<LittleEndian>()?)
    }

    pub fn read_u32_be(&mut self) -> Result<u32> {
        Ok(self.borrow_reader_from_boundary().read_u32::<BigEndian>()?)
    }

    pub fn read_bytes_into(&mut self, buf: &mut [u8]) -> Result<()> {
        self.borrow_reader_from_boundary().read_exact(buf)?;
        Ok(())
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut bytes = vec![0; len];
        self.read_bytes_into(&mut bytes)?;
        Ok(bytes)
    }

    /// Read a zero-terminated ISO 8859-1 string.
    pub fn read_strz(&mut self) -> Result<String> {
        let mut out = String::new();
        loop {
            match self.read_u8()? {
                0 => return Ok(out),
                byte => out.push(byte as char),
            }
        }
    }

    pub fn prepare_bytes_up_to(&mut self, n: usize) -> Result<()> {
        self.source.prepare_bytes_up_to(n)
    }

    pub fn prepare_big_chunk_if_required(&mut self) -> Result<()> {
        self.source.prepare_big_chunk_if_required()
    }

    /// True when no whole byte is left, buffered or in the source.
    pub fn is_at_end(&mut self) -> Result<bool> {
        if self.bit_count >= 8 {
            return Ok(false);
        }
        self.source.prepare_bytes_up_to(1)?;
        Ok(self.source.staged() == 0)
    }

    /// Bytes of the stream handed out so far. A partially read byte counts.
    pub fn bytes_consumed(&self) -> u64 {
        self.source.consumed - (self.bit_count / 8) as u64
    }

    pub fn bits_consumed(&self) -> u64 {
        self.source.consumed * 8 - self.bit_count as u64
    }

    /// Returns the underlying reader. Staged bytes are lost.
    pub fn into_inner(self) -> T {
        self.source.inner
    }
}

////////////////////////////////////////////////////////////////////////////////
