//! Whole-file compression applied by the client around a transfer.
//!
//! The default codec is canonical Huffman coding over bytes. Container
//! layout: magic `HUF1`, original length as u64 big-endian, 256 code
//! lengths (one byte per symbol, 0 = unused), then the codes packed
//! MSB-first with zero padding in the last byte.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs;
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut};
use tracing::debug;

use crate::error::CompressionError;
use crate::transfer::utils::{compressed_path, decompressed_path};

const MAGIC: &[u8; 4] = b"HUF1";
const HEADER_LEN: usize = MAGIC.len() + 8 + 256;
const MAX_CODE_LEN: u8 = 56;

/// File-level compression collaborator.
///
/// `compress(p)` writes `p.cmp` and returns its path; `decompress(p.cmp)`
/// writes `p` and returns its path. Implementations block, so async callers
/// run them on the blocking pool.
pub trait Compressor: Send + Sync {
    fn compress(&self, path: &Path) -> Result<PathBuf, CompressionError>;
    fn decompress(&self, path: &Path) -> Result<PathBuf, CompressionError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HuffmanCompressor;

impl Compressor for HuffmanCompressor {
    fn compress(&self, path: &Path) -> Result<PathBuf, CompressionError> {
        let input = fs::read(path)?;
        let output = encode(&input)?;
        let target = compressed_path(path);
        fs::write(&target, &output)?;
        debug!(
            "Compressed {} ({} -> {} bytes)",
            path.display(),
            input.len(),
            output.len()
        );
        Ok(target)
    }

    fn decompress(&self, path: &Path) -> Result<PathBuf, CompressionError> {
        let target = decompressed_path(path)
            .ok_or_else(|| CompressionError::UnexpectedName(path.to_path_buf()))?;
        let input = fs::read(path)?;
        let output = decode(&input)?;
        fs::write(&target, &output)?;
        debug!(
            "Decompressed {} ({} -> {} bytes)",
            path.display(),
            input.len(),
            output.len()
        );
        Ok(target)
    }
}

/// Compress a buffer into the container format
pub fn encode(input: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut freq = [0u64; 256];
    for &b in input {
        freq[b as usize] += 1;
    }
    let lengths = code_lengths(&freq)?;
    let codes = canonical_codes(&lengths);

    let mut out = Vec::with_capacity(HEADER_LEN + input.len() / 2);
    out.put_slice(MAGIC);
    out.put_u64(input.len() as u64);
    out.put_slice(&lengths);

    let mut acc: u64 = 0;
    let mut nbits: u32 = 0;
    for &b in input {
        let len = lengths[b as usize] as u32;
        acc = (acc << len) | codes[b as usize];
        nbits += len;
        while nbits >= 8 {
            nbits -= 8;
            out.put_u8((acc >> nbits) as u8);
        }
        acc &= (1u64 << nbits) - 1;
    }
    if nbits > 0 {
        out.put_u8((acc << (8 - nbits)) as u8);
    }
    Ok(out)
}

/// Restore a buffer produced by [`encode`]
pub fn decode(input: &[u8]) -> Result<Vec<u8>, CompressionError> {
    if input.len() < HEADER_LEN {
        return Err(if input.starts_with(MAGIC) || input.len() < MAGIC.len() {
            CompressionError::Truncated
        } else {
            CompressionError::BadMagic
        });
    }
    let mut buf = input;
    if &buf[..MAGIC.len()] != MAGIC {
        return Err(CompressionError::BadMagic);
    }
    buf.advance(MAGIC.len());
    let original_len = buf.get_u64();
    let mut lengths = [0u8; 256];
    buf.copy_to_slice(&mut lengths);

    if original_len == 0 {
        return Ok(Vec::new());
    }
    let table = DecodeTable::new(&lengths)?;

    let expected = usize::try_from(original_len).map_err(|_| CompressionError::InvalidCodeTable)?;
    let mut out = Vec::with_capacity(expected.min(buf.len().saturating_mul(8)));
    let mut code: u64 = 0;
    let mut len: usize = 0;
    'bytes: for &byte in buf {
        for shift in (0..8).rev() {
            code = (code << 1) | u64::from((byte >> shift) & 1);
            len += 1;
            if let Some(symbol) = table.lookup(code, len) {
                out.push(symbol);
                if out.len() == expected {
                    break 'bytes;
                }
                code = 0;
                len = 0;
            } else if len >= table.max_len {
                return Err(CompressionError::InvalidBitstream);
            }
        }
    }

    if out.len() != expected {
        return Err(CompressionError::Truncated);
    }
    Ok(out)
}

/// Huffman code length for every byte value
fn code_lengths(freq: &[u64; 256]) -> Result<[u8; 256], CompressionError> {
    let mut lengths = [0u8; 256];
    let used: Vec<usize> = (0..256).filter(|&s| freq[s] > 0).collect();

    match used.as_slice() {
        [] => return Ok(lengths),
        [only] => {
            lengths[*only] = 1;
            return Ok(lengths);
        }
        _ => {}
    }

    // Nodes 0..256 are leaves; internal nodes are appended with their children.
    let mut children: Vec<(usize, usize)> = Vec::new();
    let mut heap: BinaryHeap<Reverse<(u64, usize)>> =
        used.iter().map(|&s| Reverse((freq[s], s))).collect();

    while heap.len() > 1 {
        let (Some(Reverse((w1, a))), Some(Reverse((w2, b)))) = (heap.pop(), heap.pop()) else {
            break;
        };
        let id = 256 + children.len();
        children.push((a, b));
        heap.push(Reverse((w1 + w2, id)));
    }
    let Some(Reverse((_, root))) = heap.pop() else {
        return Ok(lengths);
    };

    let mut stack = vec![(root, 0u8)];
    while let Some((node, depth)) = stack.pop() {
        if node < 256 {
            if depth > MAX_CODE_LEN {
                return Err(CompressionError::InvalidCodeTable);
            }
            lengths[node] = depth;
        } else {
            let (left, right) = children[node - 256];
            stack.push((left, depth + 1));
            stack.push((right, depth + 1));
        }
    }
    Ok(lengths)
}

/// Canonical code values for the given lengths
fn canonical_codes(lengths: &[u8; 256]) -> [u64; 256] {
    let mut order: Vec<usize> = (0..256).filter(|&s| lengths[s] > 0).collect();
    order.sort_by_key(|&s| (lengths[s], s));

    let mut codes = [0u64; 256];
    let mut code: u64 = 0;
    let mut prev_len = 0u8;
    for s in order {
        code <<= lengths[s] - prev_len;
        codes[s] = code;
        code += 1;
        prev_len = lengths[s];
    }
    codes
}

/// Per-length first code and symbol ranges for canonical decoding
struct DecodeTable {
    first_code: Vec<u64>,
    count: Vec<u64>,
    offset: Vec<usize>,
    symbols: Vec<u8>,
    max_len: usize,
}

impl DecodeTable {
    fn new(lengths: &[u8; 256]) -> Result<Self, CompressionError> {
        let max_len = lengths.iter().copied().max().unwrap_or(0) as usize;
        if max_len == 0 || max_len > MAX_CODE_LEN as usize {
            return Err(CompressionError::InvalidCodeTable);
        }

        let mut count = vec![0u64; max_len + 1];
        for &len in lengths.iter().filter(|&&l| l > 0) {
            count[len as usize] += 1;
        }

        // Kraft inequality: an over-subscribed table cannot be prefix-free.
        let mut kraft: u128 = 0;
        for (len, &n) in count.iter().enumerate().skip(1) {
            kraft += u128::from(n) << (max_len - len);
        }
        if kraft > 1u128 << max_len {
            return Err(CompressionError::InvalidCodeTable);
        }

        let mut symbols: Vec<u8> = (0..=255u8).filter(|&s| lengths[s as usize] > 0).collect();
        symbols.sort_by_key(|&s| (lengths[s as usize], s));

        let mut first_code = vec![0u64; max_len + 1];
        let mut offset = vec![0usize; max_len + 1];
        let mut code: u64 = 0;
        let mut index = 0usize;
        for len in 1..=max_len {
            code <<= 1;
            first_code[len] = code;
            offset[len] = index;
            code += count[len];
            index += count[len] as usize;
        }

        Ok(Self {
            first_code,
            count,
            offset,
            symbols,
            max_len,
        })
    }

    fn lookup(&self, code: u64, len: usize) -> Option<u8> {
        if len > self.max_len || self.count[len] == 0 {
            return None;
        }
        let delta = code.checked_sub(self.first_code[len])?;
        if delta < self.count[len] {
            self.symbols.get(self.offset[len] + delta as usize).copied()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_text_round_trip_shrinks() {
        let input = b"abracadabra, abracadabra, abracadabra!".repeat(50);
        let packed = encode(&input).unwrap();
        assert!(packed.len() < input.len());
        assert_eq!(decode(&packed).unwrap(), input);
    }

    #[test]
    fn test_empty_and_single_symbol() {
        let packed = encode(b"").unwrap();
        assert_eq!(packed.len(), HEADER_LEN);
        assert!(decode(&packed).unwrap().is_empty());

        let input = vec![b'z'; 1000];
        let packed = encode(&input).unwrap();
        assert_eq!(packed.len(), HEADER_LEN + 125);
        assert_eq!(decode(&packed).unwrap(), input);
    }

    #[test]
    fn test_all_byte_values() {
        let input: Vec<u8> = (0..4096u32).map(|i| (i * 7 % 256) as u8).collect();
        assert_eq!(decode(&encode(&input).unwrap()).unwrap(), input);
    }

    #[test]
    fn test_corrupt_inputs() {
        assert!(matches!(
            decode(b"NOPE and some more bytes"),
            Err(CompressionError::Truncated) | Err(CompressionError::BadMagic)
        ));

        let mut wrong_magic = encode(b"hello").unwrap();
        wrong_magic[0] = b'X';
        assert!(matches!(
            decode(&wrong_magic),
            Err(CompressionError::BadMagic)
        ));

        let packed = encode(b"hello world, hello huffman").unwrap();
        assert!(matches!(
            decode(&packed[..HEADER_LEN + 2]),
            Err(CompressionError::Truncated)
        ));

        let mut oversubscribed = encode(b"ab").unwrap();
        oversubscribed[12 + b'c' as usize] = 1;
        assert!(matches!(
            decode(&oversubscribed),
            Err(CompressionError::InvalidCodeTable)
        ));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        let content = b"The quick brown fox jumps over the lazy dog\n".repeat(20);
        std::fs::write(&path, &content).unwrap();

        let codec = HuffmanCompressor;
        let packed = codec.compress(&path).unwrap();
        assert_eq!(packed, dir.path().join("notes.txt.cmp"));

        std::fs::remove_file(&path).unwrap();
        let restored = codec.decompress(&packed).unwrap();
        assert_eq!(restored, path);
        assert_eq!(std::fs::read(&path).unwrap(), content);
    }

    #[test]
    fn test_decompress_requires_suffix() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plain.bin");
        std::fs::write(&path, encode(b"x").unwrap()).unwrap();
        assert!(matches!(
            HuffmanCompressor.decompress(&path),
            Err(CompressionError::UnexpectedName(_))
        ));
    }
}
