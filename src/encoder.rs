#![forbid(unsafe_code)]

use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;

use log::trace;

use crate::bit_reader::BitSequence;
use crate::bit_writer::BitWriter;
use crate::deflate::{DIST_BASE, DIST_EXTRA, END_OF_BLOCK, LEN_BASE, LEN_EXTRA};
use crate::error::{Error, Result};

////////////////////////////////////////////////////////////////////////////////

/// Largest amount of input encoded as one block; also the stored block limit.
pub const BLOCK_SIZE: usize = 0xffff;

const WINDOW_SIZE: usize = 1 << 15;
const MIN_MATCH: usize = 3;
const MAX_MATCH: usize = 258;
const HASH_BITS: u32 = 15;
const NO_POS: usize = usize::MAX;

////////////////////////////////////////////////////////////////////////////////

/// 0 stores the input as is, 1..=9 trade speed for a longer match search.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CompressionLevel(u8);

impl CompressionLevel {
    pub const NONE: Self = Self(0);
    pub const FAST: Self = Self(1);
    pub const DEFAULT: Self = Self(6);
    pub const BEST: Self = Self(9);

    pub fn new(level: u8) -> Result<Self> {
        if level > 9 {
            return Err(Error::InvalidConfig(format!(
                "compression level must be in 0..=9, got {}",
                level
            )));
        }
        Ok(Self(level))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    fn max_chain(self) -> usize {
        const CHAINS: [usize; 10] = [0, 4, 8, 16, 32, 64, 128, 256, 1024, 4096];
        CHAINS[self.0 as usize]
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for CompressionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CompressionLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let level = s
            .parse::<u8>()
            .map_err(|_| Error::InvalidConfig(format!("invalid compression level: {}", s)))?;
        Self::new(level)
    }
}

////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Token {
    Literal(u8),
    Match { length: u16, distance: u16 },
}

/// Returns `(symbol index past 257, extra bit count, extra bits)`.
fn length_code(length: u16) -> (usize, u8, u32) {
    let index = if length as usize == MAX_MATCH {
        LEN_BASE.len() - 1
    } else {
        LEN_BASE[..LEN_BASE.len() - 1].partition_point(|&base| base <= length) - 1
    };
    (index, LEN_EXTRA[index], (length - LEN_BASE[index]) as u32)
}

/// Returns `(distance symbol, extra bit count, extra bits)`.
fn distance_code(distance: u16) -> (usize, u8, u32) {
    let index = DIST_BASE.partition_point(|&base| base <= distance) - 1;
    (index, DIST_EXTRA[index], (distance - DIST_BASE[index]) as u32)
}

////////////////////////////////////////////////////////////////////////////////

/// Greedy LZ77 match finder over hash chains of 3-byte prefixes.
///
/// Positions are absolute stream offsets; `base` is the absolute offset of
/// `data[0]`.
struct Matcher {
    head: Vec<usize>,
    prev: Vec<usize>,
    max_chain: usize,
}

impl Matcher {
    fn new(max_chain: usize) -> Self {
        Self {
            head: vec![NO_POS; 1 << HASH_BITS],
            prev: vec![NO_POS; WINDOW_SIZE],
            max_chain,
        }
    }

    fn hash(data: &[u8], i: usize) -> usize {
        let v = (data[i] as u32) << 16 | (data[i + 1] as u32) << 8 | data[i + 2] as u32;
        (v.wrapping_mul(0x9e37_79b1) >> (32 - HASH_BITS)) as usize
    }

    fn insert(&mut self, data: &[u8], base: usize, i: usize) {
        if i + MIN_MATCH > data.len() {
            return;
        }
        let h = Self::hash(data, i);
        let pos = base + i;
        self.prev[pos & (WINDOW_SIZE - 1)] = self.head[h];
        self.head[h] = pos;
    }

    fn find_match(&self, data: &[u8], base: usize, i: usize, end: usize) -> Option<(usize, usize)> {
        let max_len = (end - i).min(MAX_MATCH);
        if max_len < MIN_MATCH {
            return None;
        }
        let pos = base + i;
        let mut candidate = self.head[Self::hash(data, i)];
        let mut best = (MIN_MATCH - 1, 0);
        let mut chain = self.max_chain;

        while candidate != NO_POS && chain > 0 {
            if candidate < base || pos - candidate > WINDOW_SIZE {
                break;
            }
            let c = candidate - base;
            if data[c + best.0] == data[i + best.0] {
                let len = (0..max_len)
                    .find(|&k| data[c + k] != data[i + k])
                    .unwrap_or(max_len);
                if len > best.0 {
                    best = (len, pos - candidate);
                    if len == max_len {
                        break;
                    }
                }
            }
            let next = self.prev[candidate & (WINDOW_SIZE - 1)];
            // A slot overwritten by a newer position ends the chain.
            if next == NO_POS || next >= candidate {
                break;
            }
            candidate = next;
            chain -= 1;
        }

        if best.0 >= MIN_MATCH {
            Some(best)
        } else {
            None
        }
    }

    fn tokenize(
        &mut self,
        data: &[u8],
        base: usize,
        start: usize,
        end: usize,
        tokens: &mut Vec<Token>,
    ) {
        let mut i = start;
        while i < end {
            match self.find_match(data, base, i, end) {
                Some((length, distance)) => {
                    tokens.push(Token::Match {
                        length: length as u16,
                        distance: distance as u16,
                    });
                    for p in i..i + length {
                        self.insert(data, base, p);
                    }
                    i += length;
                }
                None => {
                    tokens.push(Token::Literal(data[i]));
                    self.insert(data, base, i);
                    i += 1;
                }
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Streaming DEFLATE encoder.
///
/// Input is cut into blocks of at most [`BLOCK_SIZE`] bytes. At level 0 every
/// block is stored; otherwise each block is LZ77-matched and written with the
/// fixed Huffman codes, unless storing it is smaller.
pub struct DeflateWriter<W: Write> {
    bit_writer: BitWriter<W>,
    matcher: Option<Matcher>,
    data: Vec<u8>,
    pending_start: usize,
    base: usize,
    tokens: Vec<Token>,
    litlen_codes: Vec<BitSequence>,
    distance_codes: Vec<BitSequence>,
}

impl<W: Write> DeflateWriter<W> {
    pub fn new(inner: W, level: CompressionLevel) -> Self {
        let matcher = if level == CompressionLevel::NONE {
            None
        } else {
            Some(Matcher::new(level.max_chain()))
        };
        Self {
            bit_writer: BitWriter::new(inner),
            matcher,
            data: Vec::new(),
            pending_start: 0,
            base: 0,
            tokens: Vec::new(),
            litlen_codes: fixed_litlen_codes(),
            distance_codes: fixed_distance_codes(),
        }
    }

    fn pending(&self) -> usize {
        self.data.len() - self.pending_start
    }

    fn emit_block(&mut self, len: usize, is_final: bool) -> io::Result<()> {
        let start = self.pending_start;
        let end = start + len;

        let use_fixed = match &mut self.matcher {
            Some(matcher) => {
                self.tokens.clear();
                matcher.tokenize(&self.data, self.base, start, end, &mut self.tokens);
                self.fixed_cost() < self.stored_cost(len)
            }
            None => false,
        };
        trace!(
            "block of {} bytes, final={}, fixed={}",
            len,
            is_final,
            use_fixed
        );
        if use_fixed {
            self.write_fixed_block(is_final)?;
        } else {
            self.write_stored_block(start, end, is_final)?;
        }

        self.pending_start = end;
        Ok(())
    }

    /// Forget input older than the match window. Called once per `write`,
    /// not per block, so the buffer is shifted at most once per call.
    fn discard_history(&mut self) {
        if self.pending_start > WINDOW_SIZE {
            let drop = self.pending_start - WINDOW_SIZE;
            self.data.drain(..drop);
            self.base += drop;
            self.pending_start -= drop;
        }
    }

    fn fixed_cost(&self) -> u64 {
        let tokens: u64 = self
            .tokens
            .iter()
            .map(|token| match *token {
                Token::Literal(byte) => self.litlen_codes[byte as usize].len() as u64,
                Token::Match { length, distance } => {
                    let (symbol, extra, _) = length_code(length);
                    let (dsymbol, dextra, _) = distance_code(distance);
                    (self.litlen_codes[257 + symbol].len()
                        + extra
                        + self.distance_codes[dsymbol].len()
                        + dextra) as u64
                }
            })
            .sum();
        3 + tokens + self.litlen_codes[END_OF_BLOCK as usize].len() as u64
    }

    fn stored_cost(&self, len: usize) -> u64 {
        let pad = (8 - (self.bit_writer.bits_written() + 3) % 8) % 8;
        3 + pad + 32 + 8 * len as u64
    }

    fn write_fixed_block(&mut self, is_final: bool) -> io::Result<()> {
        self.bit_writer.write_bits(is_final as u32, 1)?;
        self.bit_writer.write_bits(1, 2)?;
        for token in &self.tokens {
            match *token {
                Token::Literal(byte) => {
                    self.bit_writer.write_code(self.litlen_codes[byte as usize])?;
                }
                Token::Match { length, distance } => {
                    let (symbol, extra, bits) = length_code(length);
                    self.bit_writer.write_code(self.litlen_codes[257 + symbol])?;
                    self.bit_writer.write_bits(bits, extra)?;
                    let (symbol, extra, bits) = distance_code(distance);
                    self.bit_writer.write_code(self.distance_codes[symbol])?;
                    self.bit_writer.write_bits(bits, extra)?;
                }
            }
        }
        self.bit_writer
            .write_code(self.litlen_codes[END_OF_BLOCK as usize])
    }

    fn write_stored_block(&mut self, start: usize, end: usize, is_final: bool) -> io::Result<()> {
        let len = (end - start) as u16;
        self.bit_writer.write_bits(is_final as u32, 1)?;
        self.bit_writer.write_bits(0, 2)?;
        self.bit_writer.write_bytes(&len.to_le_bytes())?;
        self.bit_writer.write_bytes(&(!len).to_le_bytes())?;
        self.bit_writer.write_bytes(&self.data[start..end])
    }

    /// Encode whatever is pending as the final block and return the sink.
    pub fn finish(mut self) -> io::Result<W> {
        while self.pending() > BLOCK_SIZE {
            self.emit_block(BLOCK_SIZE, false)?;
        }
        self.emit_block(self.pending(), true)?;
        let mut inner = self.bit_writer.finish()?;
        inner.flush()?;
        Ok(inner)
    }
}

impl<W: Write> Write for DeflateWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.data.extend_from_slice(buf);
        // The last block is held back so that `finish` can mark it final.
        while self.pending() > BLOCK_SIZE {
            self.emit_block(BLOCK_SIZE, false)?;
        }
        self.discard_history();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.bit_writer.flush()
    }
}

/// Literal/length codes of the fixed Huffman code (RFC 1951, 3.2.6).
fn fixed_litlen_codes() -> Vec<BitSequence> {
    (0..288u32)
        .map(|symbol| match symbol {
            0..=143 => BitSequence::new(0x30 + symbol, 8),
            144..=255 => BitSequence::new(0x190 + symbol - 144, 9),
            256..=279 => BitSequence::new(symbol - 256, 7),
            _ => BitSequence::new(0xc0 + symbol - 280, 8),
        })
        .collect()
}

fn fixed_distance_codes() -> Vec<BitSequence> {
    (0..32).map(|symbol| BitSequence::new(symbol, 5)).collect()
}

////////////////////////////////////////////////////////////////////////////////
