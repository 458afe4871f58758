#![forbid(unsafe_code)]

use std::io::{self, Read, Write};

use byteorder::{BigEndian, WriteBytesExt};
use log::debug;

use crate::bit_reader::BitReader;
use crate::deflate::Deflate;
use crate::error::{Error, Result};
use crate::gzip::verify;
use crate::tracking_writer::{Adler32, TrackingWriter};
use crate::CompressionMethod;

////////////////////////////////////////////////////////////////////////////////

const CM_DEFLATE: u8 = 8;
const MAX_CINFO: u8 = 7;
const FDICT: u8 = 0x20;

/// ZLIB container (RFC 1950). Preset dictionaries are not supported.
#[derive(Clone, Debug)]
pub struct Zlib {
    deflate: Deflate,
    check_adler: bool,
}

impl Default for Zlib {
    fn default() -> Self {
        Self {
            deflate: Deflate::default(),
            check_adler: true,
        }
    }
}

impl Zlib {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_check_adler(mut self, check: bool) -> Self {
        self.check_adler = check;
        self
    }

    pub fn with_deflate(mut self, deflate: Deflate) -> Self {
        self.deflate = deflate;
        self
    }

    fn read_header<T: Read>(bit_reader: &mut BitReader<T>) -> Result<()> {
        let cmf = bit_reader.read_u8()?;
        let flg = bit_reader.read_u8()?;

        if (u16::from(cmf) << 8 | u16::from(flg)) % 31 != 0 {
            return Err(Error::MalformedHeader(format!(
                "header check failed for {:#04x} {:#04x}",
                cmf, flg
            )));
        }
        if cmf & 0x0f != CM_DEFLATE {
            return Err(Error::MalformedHeader(format!(
                "unsupported compression method {}",
                cmf & 0x0f
            )));
        }
        if cmf >> 4 > MAX_CINFO {
            return Err(Error::MalformedHeader(format!(
                "window size 2^{} is too large",
                (cmf >> 4) + 8
            )));
        }
        if flg & FDICT != 0 {
            return Err(Error::MalformedHeader("preset dictionary is not supported".into()));
        }
        debug!("zlib stream: window 2^{} level {}", (cmf >> 4) + 8, flg >> 6);
        Ok(())
    }

    fn header(&self) -> [u8; 2] {
        let cmf = (MAX_CINFO << 4) | CM_DEFLATE;
        let flevel = match self.deflate.level().get() {
            0..=1 => 0,
            2..=5 => 1,
            6 => 2,
            _ => 3,
        };
        let flg = flevel << 6;
        let fcheck = 31 - (u16::from(cmf) << 8 | u16::from(flg)) % 31;
        [cmf, flg | (fcheck % 31) as u8]
    }
}

impl CompressionMethod for Zlib {
    fn name(&self) -> &'static str {
        "zlib"
    }

    fn uncompress<R: Read, W: Write>(&self, input: R, output: W) -> Result<u64> {
        let mut bit_reader = BitReader::new(input);
        Self::read_header(&mut bit_reader)?;

        let tracker: TrackingWriter<W, Adler32> = TrackingWriter::new(output);
        let (mut bit_reader, tracker) = self.deflate.uncompress_stream(bit_reader, tracker)?;
        let (_, adler, size) = tracker.into_parts();

        let expected = bit_reader.read_u32_be()?;
        verify(self.check_adler, "adler32", expected, adler)?;
        Ok(size)
    }

    fn compress<R: Read, W: Write>(&self, mut input: R, mut output: W) -> Result<u64> {
        output.write_all(&self.header())?;

        let mut tracker: TrackingWriter<_, Adler32> =
            TrackingWriter::new(self.deflate.writer(output));
        let read = io::copy(&mut input, &mut tracker)?;
        let (encoder, adler, _) = tracker.into_parts();

        let mut output = encoder.finish()?;
        output.write_u32::<BigEndian>(adler)?;
        output.flush()?;
        Ok(read)
    }
}

////////////////////////////////////////////////////////////////////////////////
