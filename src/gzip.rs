#![forbid(unsafe_code)]

use std::io::{self, BufRead, Read, Write};

use byteorder::{LittleEndian, WriteBytesExt};
use log::{debug, warn};

use crate::bit_reader::BitReader;
use crate::deflate::Deflate;
use crate::error::{Error, Result};
use crate::tracking_writer::{Checksum, Crc32, TrackingWriter};
use crate::CompressionMethod;

////////////////////////////////////////////////////////////////////////////////

const ID1: u8 = 0x1f;
const ID2: u8 = 0x8b;

const CM_DEFLATE: u8 = 8;

const FTEXT_OFFSET: u8 = 0;
const FHCRC_OFFSET: u8 = 1;
const FEXTRA_OFFSET: u8 = 2;
const FNAME_OFFSET: u8 = 3;
const FCOMMENT_OFFSET: u8 = 4;
const RESERVED_FLAGS: u8 = 0xe0;

////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberHeader {
    pub compression_method: Method,
    pub flags: MemberFlags,
    pub modification_time: u32,
    pub extra: Option<Vec<u8>>,
    pub name: Option<String>,
    pub comment: Option<String>,
    pub extra_flags: u8,
    pub os: u8,
}

impl Default for MemberHeader {
    fn default() -> Self {
        Self {
            compression_method: Method::Deflate,
            flags: MemberFlags::default(),
            modification_time: 0,
            extra: None,
            name: None,
            comment: None,
            extra_flags: 0,
            os: 0,
        }
    }
}

impl MemberHeader {
    /// Low 16 bits of the CRC-32 of every header byte before the CRC field.
    pub fn crc16(&self) -> u16 {
        let mut crc = Crc32::default();
        crc.update(&[ID1, ID2, self.compression_method.into(), self.flags().0]);
        crc.update(&self.modification_time.to_le_bytes());
        crc.update(&[self.extra_flags, self.os]);

        if let Some(extra) = &self.extra {
            crc.update(&(extra.len() as u16).to_le_bytes());
            crc.update(extra);
        }

        if let Some(name) = &self.name {
            crc.update(&latin1(name));
            crc.update(&[0]);
        }

        if let Some(comment) = &self.comment {
            crc.update(&latin1(comment));
            crc.update(&[0]);
        }

        (crc.finalize() & 0xffff) as u16
    }

    /// Flags as they go on the wire: the optional-field bits follow the fields.
    pub fn flags(&self) -> MemberFlags {
        let mut flags = self.flags;
        flags.set_has_extra(self.extra.is_some());
        flags.set_has_name(self.name.is_some());
        flags.set_has_comment(self.comment.is_some());
        flags
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        let flags = self.flags();
        out.write_u8(ID1)?;
        out.write_u8(ID2)?;
        out.write_u8(self.compression_method.into())?;
        out.write_u8(flags.0)?;
        out.write_u32::<LittleEndian>(self.modification_time)?;
        out.write_u8(self.extra_flags)?;
        out.write_u8(self.os)?;

        if let Some(extra) = &self.extra {
            let len = u16::try_from(extra.len())
                .map_err(|_| Error::InvalidConfig("extra field longer than 65535 bytes".into()))?;
            out.write_u16::<LittleEndian>(len)?;
            out.write_all(extra)?;
        }
        if let Some(name) = &self.name {
            out.write_all(&latin1(name))?;
            out.write_u8(0)?;
        }
        if let Some(comment) = &self.comment {
            out.write_all(&latin1(comment))?;
            out.write_u8(0)?;
        }
        if flags.has_crc() {
            out.write_u16::<LittleEndian>(self.crc16())?;
        }
        Ok(())
    }
}

fn latin1(s: &str) -> Vec<u8> {
    s.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}

////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, PartialEq, Ord, PartialOrd, Eq)]
pub enum Method {
    Deflate,
    Unknown(u8),
}

impl From<u8> for Method {
    fn from(value: u8) -> Self {
        match value {
            CM_DEFLATE => Self::Deflate,
            x => Self::Unknown(x),
        }
    }
}

impl From<Method> for u8 {
    fn from(method: Method) -> u8 {
        match method {
            Method::Deflate => CM_DEFLATE,
            Method::Unknown(x) => x,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemberFlags(u8);

impl MemberFlags {
    fn bit(&self, n: u8) -> bool {
        (self.0 >> n) & 1 != 0
    }

    fn set_bit(&mut self, n: u8, value: bool) {
        if value {
            self.0 |= 1 << n;
        } else {
            self.0 &= !(1 << n);
        }
    }

    pub fn is_text(&self) -> bool {
        self.bit(FTEXT_OFFSET)
    }

    pub fn set_is_text(&mut self, value: bool) {
        self.set_bit(FTEXT_OFFSET, value)
    }

    pub fn has_crc(&self) -> bool {
        self.bit(FHCRC_OFFSET)
    }

    pub fn set_has_crc(&mut self, value: bool) {
        self.set_bit(FHCRC_OFFSET, value)
    }

    pub fn has_extra(&self) -> bool {
        self.bit(FEXTRA_OFFSET)
    }

    pub fn set_has_extra(&mut self, value: bool) {
        self.set_bit(FEXTRA_OFFSET, value)
    }

    pub fn has_name(&self) -> bool {
        self.bit(FNAME_OFFSET)
    }

    pub fn set_has_name(&mut self, value: bool) {
        self.set_bit(FNAME_OFFSET, value)
    }

    pub fn has_comment(&self) -> bool {
        self.bit(FCOMMENT_OFFSET)
    }

    pub fn set_has_comment(&mut self, value: bool) {
        self.set_bit(FCOMMENT_OFFSET, value)
    }
}

////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberFooter {
    pub data_crc32: u32,
    pub data_size: u32,
}

////////////////////////////////////////////////////////////////////////////////

/// Reads the framing of one GZIP member around its DEFLATE payload.
pub struct MemberReader<'a, T> {
    inner: &'a mut BitReader<T>,
}

impl<'a, T: Read> MemberReader<'a, T> {
    pub fn new(inner: &'a mut BitReader<T>) -> Self {
        Self { inner }
    }

    /// Parse a member header. The header CRC, if present, is only verified
    /// when `check_crc` is set.
    pub fn read_header(&mut self, check_crc: bool) -> Result<MemberHeader> {
        let id1 = self.inner.read_u8()?;
        let id2 = self.inner.read_u8()?;
        if id1 != ID1 || id2 != ID2 {
            return Err(Error::MalformedHeader(format!(
                "wrong id values {:#04x} {:#04x}",
                id1, id2
            )));
        }
        let cm = Method::from(self.inner.read_u8()?);
        if cm != Method::Deflate {
            return Err(Error::MalformedHeader(format!(
                "unsupported compression method {}",
                u8::from(cm)
            )));
        }
        let flags = MemberFlags(self.inner.read_u8()?);
        if flags.0 & RESERVED_FLAGS != 0 {
            return Err(Error::MalformedHeader(format!(
                "reserved flag bits set: {:#04x}",
                flags.0
            )));
        }
        let mtime = self.inner.read_u32_le()?;
        let xfl = self.inner.read_u8()?;
        let os = self.inner.read_u8()?;

        let extra = if flags.has_extra() {
            let len = self.inner.read_u16_le()?;
            Some(self.inner.read_bytes(len as usize)?)
        } else {
            None
        };

        let name = if flags.has_name() {
            Some(self.inner.read_strz()?)
        } else {
            None
        };

        let comment = if flags.has_comment() {
            Some(self.inner.read_strz()?)
        } else {
            None
        };

        let header = MemberHeader {
            compression_method: cm,
            flags,
            modification_time: mtime,
            extra,
            name,
            comment,
            extra_flags: xfl,
            os,
        };

        if header.flags.has_crc() {
            let crc = self.inner.read_u16_le()?;
            verify(check_crc, "header crc16", crc as u32, header.crc16() as u32)?;
        }

        debug!(
            "gzip member: name={:?} mtime={} os={} text={}",
            header.name,
            header.modification_time,
            header.os,
            header.flags.is_text()
        );
        Ok(header)
    }

    pub fn read_footer(&mut self) -> Result<MemberFooter> {
        let crc = self.inner.read_u32_le()?;
        let isize = self.inner.read_u32_le()?;
        Ok(MemberFooter {
            data_crc32: crc,
            data_size: isize,
        })
    }
}

/// Consume zero bytes padding the stream after its last member, as tape and
/// block devices leave them. Returns `false` without consuming anything if
/// the next byte is not zero.
fn skip_zero_padding<T: Read>(bit_reader: &mut BitReader<T>) -> Result<bool> {
    let reader = bit_reader.borrow_reader_from_boundary();
    if reader.fill_buf()?.first() != Some(&0) {
        return Ok(false);
    }
    let mut skipped = 0u64;
    loop {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            break;
        }
        let zeros = available.iter().take_while(|&&byte| byte == 0).count();
        if zeros < available.len() {
            return Err(Error::MalformedHeader(
                "trailing garbage after zero padding".into(),
            ));
        }
        reader.consume(zeros);
        skipped += zeros as u64;
    }
    warn!("ignored {} bytes of zero padding after the last member", skipped);
    Ok(true)
}

/// Compare a stored check value with the computed one. Mismatches are errors
/// only when `strict`.
pub(crate) fn verify(strict: bool, what: &'static str, expected: u32, actual: u32) -> Result<()> {
    if expected == actual {
        return Ok(());
    }
    if strict {
        return Err(Error::Integrity {
            what,
            expected,
            actual,
        });
    }
    warn!(
        "{} mismatch ignored: expected {:#010x}, got {:#010x}",
        what, expected, actual
    );
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////

/// GZIP container (RFC 1952).
#[derive(Clone, Debug)]
pub struct Gzip {
    deflate: Deflate,
    check_crc: bool,
}

impl Default for Gzip {
    fn default() -> Self {
        Self {
            deflate: Deflate::default(),
            check_crc: true,
        }
    }
}

impl Gzip {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoder that reports checksum mismatches in the log instead of failing.
    pub fn permissive() -> Self {
        Self::default().with_check_crc(false)
    }

    pub fn with_check_crc(mut self, check_crc: bool) -> Self {
        self.check_crc = check_crc;
        self
    }

    pub fn with_deflate(mut self, deflate: Deflate) -> Self {
        self.deflate = deflate;
        self
    }

    /// Decode every member of `input` into `output`, returning the headers.
    pub fn uncompress_members<R: Read, W: Write>(
        &self,
        input: R,
        output: W,
    ) -> Result<(Vec<MemberHeader>, u64)> {
        let mut bit_reader = BitReader::new(input);
        let mut output = output;
        let mut headers = Vec::new();
        let mut total = 0;

        loop {
            headers.push(MemberReader::new(&mut bit_reader).read_header(self.check_crc)?);

            let tracker: TrackingWriter<W, Crc32> = TrackingWriter::new(output);
            let (rest, tracker) = self.deflate.uncompress_stream(bit_reader, tracker)?;
            bit_reader = rest;
            let (inner, crc, size) = tracker.into_parts();
            output = inner;
            total += size;

            let footer = MemberReader::new(&mut bit_reader).read_footer()?;
            verify(self.check_crc, "crc32", footer.data_crc32, crc)?;
            verify(self.check_crc, "length", footer.data_size, size as u32)?;

            if bit_reader.is_at_end()? || skip_zero_padding(&mut bit_reader)? {
                break;
            }
        }
        Ok((headers, total))
    }

    /// Write one member with the given header around the compressed `input`.
    pub fn compress_with_header<R: Read, W: Write>(
        &self,
        header: &MemberHeader,
        mut input: R,
        mut output: W,
    ) -> Result<u64> {
        header.write_to(&mut output)?;

        let mut tracker: TrackingWriter<_, Crc32> =
            TrackingWriter::new(self.deflate.writer(output));
        let read = io::copy(&mut input, &mut tracker)?;
        let (encoder, crc, size) = tracker.into_parts();

        let mut output = encoder.finish()?;
        output.write_u32::<LittleEndian>(crc)?;
        output.write_u32::<LittleEndian>(size as u32)?;
        output.flush()?;
        Ok(read)
    }
}

impl CompressionMethod for Gzip {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn uncompress<R: Read, W: Write>(&self, input: R, output: W) -> Result<u64> {
        Ok(self.uncompress_members(input, output)?.1)
    }

    fn compress<R: Read, W: Write>(&self, input: R, output: W) -> Result<u64> {
        self.compress_with_header(&MemberHeader::default(), input, output)
    }
}

////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::CompressionLevel;

    const HELLO_GZ: &[u8] = &[
        0x1f, 0x8b, 0x08, 0x08, 0x00, 0xf1, 0x53, 0x65, 0x02, 0xff, 0x68, 0x65, 0x6c, 0x6c, 0x6f,
        0x2e, 0x74, 0x78, 0x74, 0x00, 0xcb, 0x48, 0xcd, 0xc9, 0xc9, 0xd7, 0x51, 0xc8, 0x40, 0xa2,
        0x14, 0xca, 0xf3, 0x8b, 0x72, 0x52, 0xb8, 0x00, 0x87, 0x5d, 0x46, 0x2b, 0x1a, 0x00, 0x00,
        0x00,
    ];

    fn stored_gzip() -> Gzip {
        Gzip::new().with_deflate(Deflate::new().with_level(CompressionLevel::NONE))
    }

    #[test]
    fn decodes_reference_member() -> Result<()> {
        let mut out = Vec::new();
        let (headers, total) = Gzip::new().uncompress_members(HELLO_GZ, &mut out)?;
        assert_eq!(out, b"hello, hello, hello world\n".to_vec());
        assert_eq!(total, 26);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].name.as_deref(), Some("hello.txt"));
        assert_eq!(headers[0].modification_time, 1_700_000_000);
        assert_eq!(headers[0].extra_flags, 2);
        assert_eq!(headers[0].os, 0xff);
        Ok(())
    }

    #[test]
    fn ten_as() -> Result<()> {
        let gzip = Gzip::new();
        let compressed = gzip.compress_bytes(b"AAAAAAAAAA")?;
        let restored = gzip.uncompress_bytes(&compressed)?;
        assert_eq!(restored.len(), 10);
        assert_eq!(restored, b"AAAAAAAAAA".to_vec());
        Ok(())
    }

    #[test]
    fn default_header_bytes() -> Result<()> {
        let compressed = Gzip::new().compress_bytes(b"")?;
        assert_eq!(
            &compressed[..10],
            &[0x1f, 0x8b, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
        assert_eq!(&compressed[compressed.len() - 8..], &[0; 8]);
        assert_eq!(Gzip::new().uncompress_bytes(&compressed)?, Vec::<u8>::new());
        Ok(())
    }

    #[test]
    fn optional_fields_round_trip() -> Result<()> {
        let mut header = MemberHeader {
            modification_time: 1234,
            extra: Some(vec![b'A', b'P', 2, 0, 7, 9]),
            name: Some("caf\u{e9}.txt".to_string()),
            comment: Some("a comment".to_string()),
            os: 3,
            ..MemberHeader::default()
        };
        header.flags.set_has_crc(true);
        header.flags.set_is_text(true);

        let mut compressed = Vec::new();
        Gzip::new().compress_with_header(&header, &b"payload"[..], &mut compressed)?;

        let mut out = Vec::new();
        let (headers, _) = Gzip::new().uncompress_members(compressed.as_slice(), &mut out)?;
        assert_eq!(out, b"payload".to_vec());
        assert_eq!(headers[0].flags(), header.flags());
        assert_eq!(headers[0], MemberHeader { flags: header.flags(), ..header });
        Ok(())
    }

    #[test]
    fn header_crc_mismatch() -> Result<()> {
        let mut header = MemberHeader::default();
        header.flags.set_has_crc(true);
        let mut compressed = Vec::new();
        Gzip::new().compress_with_header(&header, &b"x"[..], &mut compressed)?;
        compressed[10] ^= 0xff;

        assert!(matches!(
            Gzip::new().uncompress_bytes(&compressed),
            Err(Error::Integrity {
                what: "header crc16",
                ..
            })
        ));
        assert_eq!(Gzip::permissive().uncompress_bytes(&compressed)?, b"x".to_vec());
        Ok(())
    }

    #[test]
    fn wrong_magic_and_method() {
        let mut data = HELLO_GZ.to_vec();
        data[1] = 0x8c;
        assert!(matches!(
            Gzip::new().uncompress_bytes(&data),
            Err(Error::MalformedHeader(_))
        ));

        let mut data = HELLO_GZ.to_vec();
        data[2] = 7;
        assert!(matches!(
            Gzip::new().uncompress_bytes(&data),
            Err(Error::MalformedHeader(_))
        ));

        let mut data = HELLO_GZ.to_vec();
        data[3] |= 0x80;
        assert!(matches!(
            Gzip::new().uncompress_bytes(&data),
            Err(Error::MalformedHeader(_))
        ));
    }

    #[test]
    fn corrupted_payload() -> Result<()> {
        let data = b"some payload that is stored verbatim";
        let mut compressed = stored_gzip().compress_bytes(data)?;
        // 10 header bytes, then the stored block header.
        compressed[10 + 5 + 3] ^= 0x20;

        assert!(matches!(
            Gzip::new().uncompress_bytes(&compressed),
            Err(Error::Integrity { what: "crc32", .. })
        ));

        let restored = Gzip::permissive().uncompress_bytes(&compressed)?;
        assert_eq!(restored.len(), data.len());
        assert_ne!(restored, data.to_vec());
        Ok(())
    }

    #[test]
    fn wrong_length() -> Result<()> {
        let mut compressed = Gzip::new().compress_bytes(b"abc")?;
        let len = compressed.len();
        compressed[len - 4] = 4;
        assert!(matches!(
            Gzip::new().uncompress_bytes(&compressed),
            Err(Error::Integrity { what: "length", .. })
        ));
        Ok(())
    }

    #[test]
    fn truncated_trailer() -> Result<()> {
        let compressed = Gzip::new().compress_bytes(b"abc")?;
        let cut = &compressed[..compressed.len() - 3];
        assert!(matches!(
            Gzip::new().uncompress_bytes(cut),
            Err(Error::TruncatedInput)
        ));
        assert!(matches!(
            Gzip::new().uncompress_bytes(&[]),
            Err(Error::TruncatedInput)
        ));
        Ok(())
    }

    #[test]
    fn multiple_members() -> Result<()> {
        let gzip = Gzip::new();
        let mut data = gzip.compress_bytes(b"first member, ")?;
        data.extend(stored_gzip().compress_bytes(b"second member, ")?);
        data.extend_from_slice(HELLO_GZ);

        let mut out = Vec::new();
        let (headers, total) = gzip.uncompress_members(data.as_slice(), &mut out)?;
        assert_eq!(headers.len(), 3);
        assert_eq!(out, b"first member, second member, hello, hello, hello world\n".to_vec());
        assert_eq!(total, out.len() as u64);
        Ok(())
    }

    #[test]
    fn trailing_zero_padding() -> Result<()> {
        let mut data = HELLO_GZ.to_vec();
        data.extend_from_slice(&[0; 512]);
        assert_eq!(
            Gzip::new().uncompress_bytes(&data)?,
            b"hello, hello, hello world\n".to_vec()
        );

        data.push(0x1f);
        assert!(matches!(
            Gzip::new().uncompress_bytes(&data),
            Err(Error::MalformedHeader(_))
        ));
        Ok(())
    }

    #[test]
    fn trailing_garbage_is_rejected() -> Result<()> {
        let mut data = Gzip::new().compress_bytes(b"abc")?;
        data.extend_from_slice(b"junk");
        assert!(matches!(
            Gzip::new().uncompress_bytes(&data),
            Err(Error::MalformedHeader(_))
        ));
        Ok(())
    }
}
