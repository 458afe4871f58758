#![forbid(unsafe_code)]

use std::convert::TryFrom;
use std::io::{self, BufRead, Read, Write};
use std::iter::repeat;

use log::{debug, trace};

use crate::bit_reader::BitReader;
use crate::encoder::{CompressionLevel, DeflateWriter};
use crate::error::{Error, Result};
use crate::huffman::HuffmanTree;
use crate::sliding_window::{WindowedWriter, DEFAULT_OUTPUT_CHUNK, DEFAULT_WINDOW_BITS};
use crate::tracking_writer::TrackingWriter;
use crate::CompressionMethod;

////////////////////////////////////////////////////////////////////////////////

pub(crate) const LEN_BASE: [u16; 29] = [
    3, 4, 5, 6, 7, 8, 9, 10, 11, 13, 15, 17, 19, 23, 27, 31, 35, 43, 51, 59, 67, 83, 99, 115,
    131, 163, 195, 227, 258,
];
pub(crate) const LEN_EXTRA: [u8; 29] = [
    0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 5, 5, 5, 5, 0,
];
pub(crate) const DIST_BASE: [u16; 30] = [
    1, 2, 3, 4, 5, 7, 9, 13, 17, 25, 33, 49, 65, 97, 129, 193, 257, 385, 513, 769, 1025, 1537,
    2049, 3073, 4097, 6145, 8193, 12289, 16385, 24577,
];
pub(crate) const DIST_EXTRA: [u8; 30] = [
    0, 0, 0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7, 8, 8, 9, 9, 10, 10, 11, 11, 12, 12, 13,
    13,
];
/// Order in which code length code lengths are stored in a dynamic header.
pub(crate) const HCLENPOS: [usize; 19] = [
    16, 17, 18, 0, 8, 7, 9, 6, 10, 5, 11, 4, 12, 3, 13, 2, 14, 1, 15,
];

pub(crate) const END_OF_BLOCK: u16 = 256;
const MAX_LITLEN_CODES: usize = 286;
const MAX_DISTANCE_CODES: usize = 30;

/// Code lengths of the fixed literal/length alphabet (RFC 1951, 3.2.6).
pub(crate) fn fixed_litlen_lengths() -> Vec<u8> {
    repeat(8)
        .take(144)
        .chain(repeat(9).take(112))
        .chain(repeat(7).take(24))
        .chain(repeat(8).take(8))
        .collect()
}

pub(crate) fn fixed_distance_lengths() -> Vec<u8> {
    repeat(5).take(32).collect()
}

////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub is_final: bool,
    pub compression_type: CompressionType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    Uncompressed = 0,
    FixedTree = 1,
    DynamicTree = 2,
    Reserved = 3,
}

impl TryFrom<u32> for CompressionType {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        Ok(match value {
            0 => CompressionType::Uncompressed,
            1 => CompressionType::FixedTree,
            2 => CompressionType::DynamicTree,
            3 => CompressionType::Reserved,
            _ => return Err(Error::MalformedBlock("invalid block type")),
        })
    }
}

////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LitLenToken {
    Literal(u8),
    EndOfBlock,
    Length { base: u16, extra_bits: u8 },
}

impl TryFrom<u16> for LitLenToken {
    type Error = Error;

    fn try_from(symbol: u16) -> Result<Self> {
        match symbol {
            0..=255 => Ok(LitLenToken::Literal(symbol as u8)),
            END_OF_BLOCK => Ok(LitLenToken::EndOfBlock),
            257..=285 => {
                let index = (symbol - 257) as usize;
                Ok(LitLenToken::Length {
                    base: LEN_BASE[index],
                    extra_bits: LEN_EXTRA[index],
                })
            }
            _ => Err(Error::MalformedBlock("invalid length symbol")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DistanceToken {
    pub base: u16,
    pub extra_bits: u8,
}

impl TryFrom<u16> for DistanceToken {
    type Error = Error;

    fn try_from(symbol: u16) -> Result<Self> {
        match DIST_BASE.get(symbol as usize) {
            Some(&base) => Ok(DistanceToken {
                base,
                extra_bits: DIST_EXTRA[symbol as usize],
            }),
            None => Err(Error::MalformedBlock("invalid distance symbol")),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Block-by-block DEFLATE decoder.
pub struct DeflateReader<T> {
    bit_reader: BitReader<T>,
    litlen: HuffmanTree,
    distance: HuffmanTree,
    code_lengths: HuffmanTree,
    fixed: Option<(HuffmanTree, HuffmanTree)>,
    lengths: Vec<u8>,
    is_avail: bool,
}

impl<T: Read> DeflateReader<T> {
    pub fn new(bit_reader: BitReader<T>) -> Self {
        Self {
            bit_reader,
            litlen: HuffmanTree::new(),
            distance: HuffmanTree::new(),
            code_lengths: HuffmanTree::new(),
            fixed: None,
            lengths: Vec::new(),
            is_avail: true,
        }
    }

    /// Decode the next block into `out`. Returns `None` once the final block
    /// has been decoded.
    pub fn next_block<W: Write>(
        &mut self,
        out: &mut WindowedWriter<W>,
    ) -> Option<Result<BlockHeader>> {
        if self.is_avail {
            let block = self.read_block(out);
            if block.is_err() {
                self.is_avail = false;
            }
            Some(block)
        } else {
            None
        }
    }

    /// Decode blocks until the final one.
    pub fn read_to_end<W: Write>(&mut self, out: &mut WindowedWriter<W>) -> Result<()> {
        while let Some(block) = self.next_block(out) {
            block?;
        }
        Ok(())
    }

    fn read_block<W: Write>(&mut self, out: &mut WindowedWriter<W>) -> Result<BlockHeader> {
        let is_final = self.bit_reader.read_bit()?;
        self.is_avail = !is_final;
        let compression_type = CompressionType::try_from(self.bit_reader.read_bits(2)?.bits())?;
        let header = BlockHeader {
            is_final,
            compression_type,
        };
        debug!("block header: {:?}", header);

        match compression_type {
            CompressionType::Uncompressed => self.read_stored(out)?,
            CompressionType::FixedTree => {
                if self.fixed.is_none() {
                    self.fixed = Some((
                        HuffmanTree::from_lengths(&fixed_litlen_lengths())?,
                        HuffmanTree::from_lengths(&fixed_distance_lengths())?,
                    ));
                }
                if let Some((litlen, distance)) = &self.fixed {
                    inflate_codes(&mut self.bit_reader, litlen, distance, out)?;
                }
            }
            CompressionType::DynamicTree => {
                self.read_dynamic_trees()?;
                inflate_codes(&mut self.bit_reader, &self.litlen, &self.distance, out)?;
            }
            CompressionType::Reserved => return Err(Error::MalformedBlock("invalid block type")),
        }
        Ok(header)
    }

    fn read_stored<W: Write>(&mut self, out: &mut WindowedWriter<W>) -> Result<()> {
        let len = self.bit_reader.read_u16_le()?;
        let nlen = self.bit_reader.read_u16_le()?;
        if len != !nlen {
            return Err(Error::MalformedBlock("stored block length check failed"));
        }
        trace!("stored block of {} bytes", len);

        let rdr = self.bit_reader.borrow_reader_from_boundary();
        let mut remaining = len as usize;
        while remaining > 0 {
            let available = rdr.fill_buf()?;
            if available.is_empty() {
                return Err(Error::TruncatedInput);
            }
            let take = available.len().min(remaining);
            out.put_bytes(&available[..take])?;
            rdr.consume(take);
            remaining -= take;
        }
        Ok(())
    }

    fn read_dynamic_trees(&mut self) -> Result<()> {
        let hlit = self.bit_reader.read_bits(5)?.bits() as usize + 257;
        let hdist = self.bit_reader.read_bits(5)?.bits() as usize + 1;
        let hclen = self.bit_reader.read_bits(4)?.bits() as usize + 4;
        trace!("dynamic header: hlit={} hdist={} hclen={}", hlit, hdist, hclen);
        if hlit > MAX_LITLEN_CODES || hdist > MAX_DISTANCE_CODES {
            return Err(Error::MalformedBlock("too many length or distance symbols"));
        }

        let mut code_length_lengths = [0u8; 19];
        for &pos in &HCLENPOS[..hclen] {
            code_length_lengths[pos] = self.bit_reader.read_bits(3)?.bits() as u8;
        }
        self.code_lengths.set_from_lengths(&code_length_lengths)?;

        let total = hlit + hdist;
        self.lengths.clear();
        while self.lengths.len() < total {
            let symbol = self.code_lengths.read(&mut self.bit_reader)?;
            let (value, count) = match symbol {
                0..=15 => (symbol as u8, 1),
                16 => {
                    let previous = *self
                        .lengths
                        .last()
                        .ok_or(Error::MalformedBlock("repeat with no previous length"))?;
                    (previous, 3 + self.bit_reader.read_bits(2)?.bits() as usize)
                }
                17 => (0, 3 + self.bit_reader.read_bits(3)?.bits() as usize),
                18 => (0, 11 + self.bit_reader.read_bits(7)?.bits() as usize),
                _ => return Err(Error::MalformedBlock("invalid code length symbol")),
            };
            if self.lengths.len() + count > total {
                return Err(Error::MalformedBlock("code length repeat overflows table"));
            }
            self.lengths.extend(repeat(value).take(count));
        }

        if self.lengths[END_OF_BLOCK as usize] == 0 {
            return Err(Error::MalformedBlock("missing end-of-block code"));
        }
        self.litlen.set_from_lengths(&self.lengths[..hlit])?;
        self.distance
            .set_from_lengths_allow_incomplete(&self.lengths[hlit..])?;
        Ok(())
    }

    pub fn into_bit_reader(self) -> BitReader<T> {
        self.bit_reader
    }
}

fn inflate_codes<T: Read, W: Write>(
    bit_reader: &mut BitReader<T>,
    litlen: &HuffmanTree,
    distance: &HuffmanTree,
    out: &mut WindowedWriter<W>,
) -> Result<()> {
    loop {
        match LitLenToken::try_from(litlen.read(bit_reader)?)? {
            LitLenToken::EndOfBlock => return Ok(()),
            LitLenToken::Literal(byte) => out.put_literal(byte)?,
            LitLenToken::Length { base, extra_bits } => {
                let length = base as usize + bit_reader.read_bits(extra_bits)?.bits() as usize;
                let token = DistanceToken::try_from(distance.read(bit_reader)?)?;
                let dist =
                    token.base as usize + bit_reader.read_bits(token.extra_bits)?.bits() as usize;
                out.copy_back(dist, length)?;
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Raw DEFLATE (RFC 1951) without any container.
#[derive(Clone, Debug)]
pub struct Deflate {
    window_bits: u8,
    output_chunk: usize,
    level: CompressionLevel,
}

impl Default for Deflate {
    fn default() -> Self {
        Self {
            window_bits: DEFAULT_WINDOW_BITS,
            output_chunk: DEFAULT_OUTPUT_CHUNK,
            level: CompressionLevel::default(),
        }
    }
}

impl Deflate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size of the decoder history, `2^bits` bytes. RFC 1951 allows 8 to 15.
    pub fn with_window_bits(mut self, bits: u8) -> Result<Self> {
        if !(8..=DEFAULT_WINDOW_BITS).contains(&bits) {
            return Err(Error::InvalidConfig(format!(
                "window bits must be in 8..=15, got {}",
                bits
            )));
        }
        self.window_bits = bits;
        Ok(self)
    }

    /// How much decoded output is staged before each write to the sink.
    pub fn with_output_chunk(mut self, size: usize) -> Self {
        self.output_chunk = size.max(1);
        self
    }

    pub fn with_level(mut self, level: CompressionLevel) -> Self {
        self.level = level;
        self
    }

    pub fn window_bits(&self) -> u8 {
        self.window_bits
    }

    pub fn level(&self) -> CompressionLevel {
        self.level
    }

    /// Decode one DEFLATE stream from `bit_reader` into `out`, handing both
    /// back so a container can read its trailer.
    pub(crate) fn uncompress_stream<T: Read, W: Write>(
        &self,
        bit_reader: BitReader<T>,
        out: W,
    ) -> Result<(BitReader<T>, W)> {
        let mut window = WindowedWriter::with_config(out, self.window_bits, self.output_chunk);
        let mut reader = DeflateReader::new(bit_reader);
        reader.read_to_end(&mut window)?;
        Ok((reader.into_bit_reader(), window.finish()?))
    }

    pub(crate) fn writer<W: Write>(&self, out: W) -> DeflateWriter<W> {
        DeflateWriter::new(out, self.level)
    }
}

impl CompressionMethod for Deflate {
    fn name(&self) -> &'static str {
        "deflate"
    }

    fn uncompress<R: Read, W: Write>(&self, input: R, output: W) -> Result<u64> {
        let tracker: TrackingWriter<W> = TrackingWriter::new(output);
        let (_, tracker) = self.uncompress_stream(BitReader::new(input), tracker)?;
        Ok(tracker.byte_count())
    }

    fn compress<R: Read, W: Write>(&self, mut input: R, output: W) -> Result<u64> {
        let mut writer = self.writer(output);
        let read = io::copy(&mut input, &mut writer)?;
        writer.finish()?;
        Ok(read)
    }
}

////////////////////////////////////////////////////////////////////////////////
