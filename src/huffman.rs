#![forbid(unsafe_code)]

use std::io::Read;

use crate::bit_reader::{BitReader, BitSequence};
use crate::error::{Error, Result};

////////////////////////////////////////////////////////////////////////////////

/// Longest code length accepted (RFC 1951 itself never goes past 15).
pub const MAX_CODE_LENGTH: usize = 16;

/// Number of bits resolved by a single fast-table lookup.
pub const FAST_BITS: u8 = 10;

const FAST_SIZE: usize = 1 << FAST_BITS;

const NIL: u16 = u16::MAX;
const INVALID: u16 = u16::MAX;

////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FastEntry {
    /// No code starts with these bits.
    Invalid,
    /// A whole code of `len` bits.
    Leaf { value: u16, len: u8 },
    /// The code is longer than `FAST_BITS`; continue walking from this node.
    Node(u16),
}

////////////////////////////////////////////////////////////////////////////////

/// Canonical Huffman decoder.
///
/// Nodes live in three parallel arrays indexed by node id. Leaves carry a
/// symbol in `value`; internal nodes have `value == INVALID`.
pub struct HuffmanTree {
    value: Vec<u16>,
    left: Vec<u16>,
    right: Vec<u16>,
    root: u16,
    fast: Vec<FastEntry>,

    counts: [u16; MAX_CODE_LENGTH + 1],
    codes: Vec<u16>,
    level: Vec<u16>,
    next_level: Vec<u16>,
    stack: Vec<(u16, u8, u32)>,
}

impl Default for HuffmanTree {
    fn default() -> Self {
        Self::new()
    }
}

impl HuffmanTree {
    /// An empty tree. Every read fails until `set_from_lengths` is called.
    pub fn new() -> Self {
        Self {
            value: Vec::new(),
            left: Vec::new(),
            right: Vec::new(),
            root: NIL,
            fast: vec![FastEntry::Invalid; FAST_SIZE],
            counts: [0; MAX_CODE_LENGTH + 1],
            codes: Vec::new(),
            level: Vec::new(),
            next_level: Vec::new(),
            stack: Vec::new(),
        }
    }

    pub fn from_lengths(lengths: &[u8]) -> Result<Self> {
        let mut tree = Self::new();
        tree.set_from_lengths(lengths)?;
        Ok(tree)
    }

    /// Rebuild the tree for the code given by per-symbol lengths (0 = unused).
    /// The code must be complete.
    pub fn set_from_lengths(&mut self, lengths: &[u8]) -> Result<()> {
        self.build(lengths, false)
    }

    /// Like [`Self::set_from_lengths`], but also accepts no codes at all or a
    /// single code of length 1, as a distance alphabet may be (RFC 1951,
    /// 3.2.7). Reading an unassigned code from such a tree fails at decode
    /// time.
    pub fn set_from_lengths_allow_incomplete(&mut self, lengths: &[u8]) -> Result<()> {
        self.build(lengths, true)
    }

    fn build(&mut self, lengths: &[u8], allow_incomplete: bool) -> Result<()> {
        assert!(lengths.len() < NIL as usize / 2);

        self.value.clear();
        self.left.clear();
        self.right.clear();
        self.root = NIL;

        self.counts = [0; MAX_CODE_LENGTH + 1];
        for &len in lengths {
            if len as usize > MAX_CODE_LENGTH {
                return Err(Error::MalformedHuffmanTable("invalid code length"));
            }
            self.counts[len as usize] += 1;
        }

        // Bucket sort of the used symbols by code length, stable in symbol order.
        let mut offsets = [0usize; MAX_CODE_LENGTH + 2];
        for len in 1..=MAX_CODE_LENGTH {
            offsets[len + 1] = offsets[len] + self.counts[len] as usize;
        }
        let used = offsets[MAX_CODE_LENGTH + 1];
        let starts = offsets;
        self.codes.clear();
        self.codes.resize(used, 0);
        for (symbol, &len) in lengths.iter().enumerate() {
            if len != 0 {
                self.codes[offsets[len as usize]] = symbol as u16;
                offsets[len as usize] += 1;
            }
        }

        // Longest codes first: the nodes of one level are that level's leaves
        // followed by the pairs formed from the level below.
        self.level.clear();
        for len in (1..=MAX_CODE_LENGTH).rev() {
            if self.level.len() % 2 != 0 {
                return Err(Error::MalformedHuffmanTable(
                    "not a valid Huffman code tree",
                ));
            }
            let mut next_level = std::mem::take(&mut self.next_level);
            next_level.clear();
            for i in starts[len]..starts[len + 1] {
                let symbol = self.codes[i];
                next_level.push(self.alloc(symbol, NIL, NIL));
            }
            for i in (0..self.level.len()).step_by(2) {
                let (left, right) = (self.level[i], self.level[i + 1]);
                next_level.push(self.alloc(INVALID, left, right));
            }
            self.next_level = std::mem::replace(&mut self.level, next_level);
        }

        match self.level.len() {
            0 if allow_incomplete => {}
            1 if allow_incomplete && used == 1 && self.counts[1] == 1 => {
                self.root = self.alloc(INVALID, self.level[0], NIL);
            }
            2 => {
                self.root = self.alloc(INVALID, self.level[0], self.level[1]);
            }
            _ => {
                return Err(Error::MalformedHuffmanTable(
                    "not a valid Huffman code tree",
                ))
            }
        }

        self.compute_encoded_values();
        Ok(())
    }

    fn alloc(&mut self, value: u16, left: u16, right: u16) -> u16 {
        let id = self.value.len() as u16;
        self.value.push(value);
        self.left.push(left);
        self.right.push(right);
        id
    }

    /// Fill the fast table by walking every prefix of up to `FAST_BITS` bits.
    fn compute_encoded_values(&mut self) {
        self.fast.clear();
        self.fast.resize(FAST_SIZE, FastEntry::Invalid);
        if self.root == NIL {
            return;
        }

        self.stack.clear();
        self.stack.push((self.root, 0, 0));
        while let Some((node, depth, prefix)) = self.stack.pop() {
            let value = self.value[node as usize];
            let entry = if value != INVALID {
                FastEntry::Leaf { value, len: depth }
            } else if depth == FAST_BITS {
                FastEntry::Node(node)
            } else {
                let (left, right) = (self.left[node as usize], self.right[node as usize]);
                if left != NIL {
                    self.stack.push((left, depth + 1, prefix));
                }
                if right != NIL {
                    self.stack.push((right, depth + 1, prefix | 1 << depth));
                }
                continue;
            };
            // Bits are peeked LSB-first, so every index sharing the low
            // `depth` bits starts with this prefix.
            for index in (prefix as usize..FAST_SIZE).step_by(1 << depth) {
                self.fast[index] = entry;
            }
        }
    }

    /// Decode one symbol.
    pub fn read<T: Read>(&self, reader: &mut BitReader<T>) -> Result<u16> {
        if self.root == NIL {
            return Err(Error::MalformedBlock("invalid huffman code"));
        }
        match reader.peek_bits(FAST_BITS)? {
            Some(peeked) => match self.fast[peeked as usize] {
                FastEntry::Leaf { value, len } => {
                    reader.consume_bits(len);
                    Ok(value)
                }
                FastEntry::Node(node) => {
                    reader.consume_bits(FAST_BITS);
                    self.walk(node, reader)
                }
                FastEntry::Invalid => Err(Error::MalformedBlock("invalid huffman code")),
            },
            None => self.walk(self.root, reader),
        }
    }

    /// Decode one symbol one bit at a time, without the fast table.
    pub fn read_slow<T: Read>(&self, reader: &mut BitReader<T>) -> Result<u16> {
        if self.root == NIL {
            return Err(Error::MalformedBlock("invalid huffman code"));
        }
        self.walk(self.root, reader)
    }

    fn walk<T: Read>(&self, mut node: u16, reader: &mut BitReader<T>) -> Result<u16> {
        while self.value[node as usize] == INVALID {
            node = if reader.read_bit()? {
                self.right[node as usize]
            } else {
                self.left[node as usize]
            };
            if node == NIL {
                return Err(Error::MalformedBlock("invalid huffman code"));
            }
        }
        Ok(self.value[node as usize])
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Assign canonical codes (RFC 1951, 3.2.2) to per-symbol lengths.
///
/// Codes are returned most significant bit first; unused symbols get an
/// empty sequence.
pub fn canonical_codes(lengths: &[u8]) -> Result<Vec<BitSequence>> {
    let mut bl_count = [0u32; MAX_CODE_LENGTH + 1];
    for &len in lengths {
        if len as usize > MAX_CODE_LENGTH {
            return Err(Error::MalformedHuffmanTable("invalid code length"));
        }
        bl_count[len as usize] += 1;
    }
    bl_count[0] = 0;

    let mut next_code = [0u32; MAX_CODE_LENGTH + 1];
    let mut code = 0;
    for bits in 1..=MAX_CODE_LENGTH {
        code = (code + bl_count[bits - 1]) << 1;
        next_code[bits] = code;
    }

    Ok(lengths
        .iter()
        .map(|&len| {
            if len == 0 {
                BitSequence::default()
            } else {
                let code = next_code[len as usize];
                next_code[len as usize] += 1;
                BitSequence::new(code, len)
            }
        })
        .collect())
}

////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bit_writer::BitWriter;

    struct XorShift(u64);

    impl XorShift {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }
    }

    fn encode(lengths: &[u8], symbols: &[u16]) -> anyhow::Result<Vec<u8>> {
        let codes = canonical_codes(lengths)?;
        let mut writer = BitWriter::new(Vec::new());
        for &symbol in symbols {
            writer.write_code(codes[symbol as usize])?;
        }
        Ok(writer.finish()?)
    }

    fn fixed_litlen_lengths() -> Vec<u8> {
        let mut lengths = vec![8; 144];
        lengths.extend([9; 112]);
        lengths.extend([7; 24]);
        lengths.extend([8; 8]);
        lengths
    }

    /// 1, 2, ..., max-1, max, max: a complete code with one leaf per level.
    fn skewed_lengths(max: u8) -> Vec<u8> {
        let mut lengths: Vec<u8> = (1..=max).collect();
        lengths.push(max);
        lengths
    }

    #[test]
    fn rfc_example_codes() -> Result<()> {
        let codes = canonical_codes(&[3, 3, 3, 3, 3, 2, 4, 4])?;
        let expected = [
            (0b010, 3),
            (0b011, 3),
            (0b100, 3),
            (0b101, 3),
            (0b110, 3),
            (0b00, 2),
            (0b1110, 4),
            (0b1111, 4),
        ];
        for (code, (bits, len)) in codes.iter().zip(expected) {
            assert_eq!(*code, BitSequence::new(bits, len));
        }
        Ok(())
    }

    #[test]
    fn decodes_canonical_codes() -> anyhow::Result<()> {
        let lengths = [3, 3, 3, 3, 3, 2, 4, 4];
        let symbols = [5, 0, 7, 6, 1, 2, 3, 4, 5, 5, 7];
        let data = encode(&lengths, &symbols)?;

        let tree = HuffmanTree::from_lengths(&lengths)?;
        let mut reader = BitReader::new(data.as_slice());
        for &symbol in &symbols {
            assert_eq!(tree.read(&mut reader)?, symbol);
        }
        Ok(())
    }

    #[test]
    fn decodes_long_codes() -> anyhow::Result<()> {
        let lengths = skewed_lengths(16);
        let symbols: Vec<u16> = (0..lengths.len() as u16).rev().chain(0..5).collect();
        let data = encode(&lengths, &symbols)?;

        let tree = HuffmanTree::from_lengths(&lengths)?;
        let mut reader = BitReader::new(data.as_slice());
        for &symbol in &symbols {
            assert_eq!(tree.read(&mut reader)?, symbol);
        }
        Ok(())
    }

    #[test]
    fn rejects_invalid_tables() {
        for lengths in [
            &[1, 1, 1][..],
            &[2, 2, 2],
            &[1, 2],
            &[1, 1, 2, 2],
            &[2],
            &[17, 1],
        ] {
            assert!(
                matches!(
                    HuffmanTree::from_lengths(lengths),
                    Err(Error::MalformedHuffmanTable(_))
                ),
                "{:?}",
                lengths
            );
        }
    }

    #[test]
    fn rejects_incomplete_tables() {
        for lengths in [&[1][..], &[0, 0, 1, 0], &[0; 19], &[]] {
            assert!(
                matches!(
                    HuffmanTree::from_lengths(lengths),
                    Err(Error::MalformedHuffmanTable(_))
                ),
                "{:?}",
                lengths
            );
        }
        let mut tree = HuffmanTree::new();
        assert!(matches!(
            tree.set_from_lengths_allow_incomplete(&[0, 2, 2]),
            Err(Error::MalformedHuffmanTable(_))
        ));
    }

    #[test]
    fn single_code() -> Result<()> {
        let mut tree = HuffmanTree::new();
        tree.set_from_lengths_allow_incomplete(&[0, 1, 0])?;
        let data: &[u8] = &[0b10];
        let mut reader = BitReader::new(data);
        assert_eq!(tree.read(&mut reader)?, 1);
        assert!(matches!(tree.read(&mut reader), Err(Error::MalformedBlock(_))));
        Ok(())
    }

    #[test]
    fn empty_tree() -> Result<()> {
        let mut tree = HuffmanTree::new();
        tree.set_from_lengths_allow_incomplete(&[0; 30])?;
        let data: &[u8] = &[0, 0];
        let mut reader = BitReader::new(data);
        assert!(matches!(tree.read(&mut reader), Err(Error::MalformedBlock(_))));
        Ok(())
    }

    #[test]
    fn reuse_after_rebuild() -> anyhow::Result<()> {
        let mut tree = HuffmanTree::from_lengths(&skewed_lengths(14))?;
        tree.set_from_lengths(&[1, 1])?;
        let data: &[u8] = &[0b0110];
        let mut reader = BitReader::new(data);
        let decoded: Vec<u16> = (0..4).map(|_| tree.read(&mut reader)).collect::<Result<_>>()?;
        assert_eq!(decoded, vec![0, 1, 1, 0]);
        Ok(())
    }

    #[test]
    fn truncated_code() -> anyhow::Result<()> {
        let lengths = skewed_lengths(12);
        let data = encode(&lengths, &[12])?;
        let mut reader = BitReader::new(&data[..1]);
        let tree = HuffmanTree::from_lengths(&lengths)?;
        assert!(matches!(tree.read(&mut reader), Err(Error::TruncatedInput)));
        Ok(())
    }

    #[test]
    fn fast_table_matches_tree_walk() -> Result<()> {
        let mut rng = XorShift(0x9e3779b97f4a7c15);
        let tables = [
            fixed_litlen_lengths(),
            vec![5; 32],
            skewed_lengths(11),
            skewed_lengths(16),
            vec![3, 3, 3, 3, 3, 2, 4, 4],
        ];
        for lengths in &tables {
            let tree = HuffmanTree::from_lengths(lengths)?;
            let data: Vec<u8> = (0..4096).map(|_| rng.next() as u8).collect();
            let mut fast = BitReader::new(data.as_slice());
            let mut slow = BitReader::new(data.as_slice());
            loop {
                let (a, b) = (tree.read(&mut fast), tree.read_slow(&mut slow));
                match (a, b) {
                    (Ok(a), Ok(b)) => {
                        assert_eq!(a, b);
                        assert_eq!(fast.bits_consumed(), slow.bits_consumed());
                    }
                    (Err(Error::TruncatedInput), Err(Error::TruncatedInput)) => break,
                    (a, b) => panic!("diverged: {:?} vs {:?}", a, b),
                }
            }
        }
        Ok(())
    }
}
