use bitpacking::{BitPacker, BitPacker4x};

use crate::segment::posting::COMPRESSION_BLOCK_SIZE;

use super::vint;

// a vint takes at most 5 bytes
const COMPRESSED_BLOCK_MAX_BYTES: usize = COMPRESSION_BLOCK_SIZE * 5;

pub struct BlockEncoder {
    bitpacker: BitPacker4x,
    output: [u8; COMPRESSED_BLOCK_MAX_BYTES],
}

impl BlockEncoder {
    pub fn new() -> Self {
        Self {
            bitpacker: BitPacker4x::new(),
            output: [0; COMPRESSED_BLOCK_MAX_BYTES],
        }
    }

    pub fn compress_block_sorted(&mut self, block: &[u32], offset: u32) -> (u8, &[u8]) {
        debug_assert_eq!(block.len(), COMPRESSION_BLOCK_SIZE);
        let offset = if offset == 0u32 { None } else { Some(offset) };

        let num_bits = self.bitpacker.num_bits_strictly_sorted(offset, block);
        let written_size =
            self.bitpacker
                .compress_strictly_sorted(offset, block, &mut self.output[..], num_bits);
        (num_bits, &self.output[..written_size])
    }

    pub fn compress_block_unsorted(&mut self, block: &[u32]) -> (u8, &[u8]) {
        debug_assert_eq!(block.len(), COMPRESSION_BLOCK_SIZE);
        let num_bits = self.bitpacker.num_bits(block);
        let written_size = self
            .bitpacker
            .compress(block, &mut self.output[..], num_bits);
        (num_bits, &self.output[..written_size])
    }

    pub fn compress_vint_sorted(&mut self, block: &[u32], mut offset: u32) -> &[u8] {
        let mut byte_written = 0;
        for &v in block {
            byte_written += self.put_vint(byte_written, v - offset);
            offset = v;
        }
        &self.output[..byte_written]
    }

    pub fn compress_vint_unsorted(&mut self, block: &[u32]) -> &[u8] {
        let mut byte_written = 0;
        for &v in block {
            byte_written += self.put_vint(byte_written, v);
        }
        &self.output[..byte_written]
    }

    fn put_vint(&mut self, at: usize, mut to_encode: u32) -> usize {
        let mut written = 0;
        loop {
            let next_byte: u8 = (to_encode % 128u32) as u8;
            to_encode /= 128u32;
            if to_encode == 0u32 {
                self.output[at + written] = next_byte | 128u8;
                return written + 1;
            }
            self.output[at + written] = next_byte;
            written += 1;
        }
    }
}

/// Decodes into a fixed buffer. Every method returns the number of input
/// bytes consumed, or `None` if the input cannot have been produced by
/// [`BlockEncoder`].
pub struct BlockDecoder {
    bitpacker: BitPacker4x,
    output: [u32; COMPRESSION_BLOCK_SIZE],
    len: usize,
}

impl BlockDecoder {
    pub fn new() -> Self {
        Self {
            bitpacker: BitPacker4x::new(),
            output: [0; COMPRESSION_BLOCK_SIZE],
            len: 0,
        }
    }

    pub fn decompress_block_sorted(
        &mut self,
        block: &[u8],
        num_bits: u8,
        offset: u32,
    ) -> Option<usize> {
        if num_bits > 32 || block.len() < compressed_block_size(num_bits) {
            return None;
        }
        let initial = if offset == 0u32 { None } else { Some(offset) };
        self.len = COMPRESSION_BLOCK_SIZE;
        let read = self
            .bitpacker
            .decompress_strictly_sorted(initial, block, &mut self.output, num_bits);
        if initial.is_some_and(|o| self.output[0] <= o) || !is_strictly_sorted(self.output()) {
            return None;
        }
        Some(read)
    }

    pub fn decompress_block_unsorted(&mut self, block: &[u8], num_bits: u8) -> Option<usize> {
        if num_bits > 32 || block.len() < compressed_block_size(num_bits) {
            return None;
        }
        self.len = COMPRESSION_BLOCK_SIZE;
        Some(self.bitpacker.decompress(block, &mut self.output, num_bits))
    }

    pub fn decompress_vint_sorted(&mut self, mut block: &[u8], offset: u32, count: u32) -> Option<usize> {
        let count = count as usize;
        if count > COMPRESSION_BLOCK_SIZE {
            return None;
        }
        let start = block.len();
        self.len = count;
        let mut res = offset;
        for i in 0..count {
            let delta = vint::decode_vint32(&mut block)?;
            // only the first delta of a list starting at doc 0 may be zero
            if delta == 0 && (i > 0 || offset > 0) {
                return None;
            }
            res = res.checked_add(delta)?;
            self.output[i] = res;
        }
        Some(start - block.len())
    }

    pub fn decompress_vint_unsorted(&mut self, mut block: &[u8], count: u32) -> Option<usize> {
        let count = count as usize;
        if count > COMPRESSION_BLOCK_SIZE {
            return None;
        }
        let start = block.len();
        self.len = count;
        for i in 0..count {
            self.output[i] = vint::decode_vint32(&mut block)?;
        }
        Some(start - block.len())
    }

    #[inline]
    pub fn output(&self) -> &[u32] {
        &self.output[..self.len]
    }
}

pub fn compressed_block_size(num_bits: u8) -> usize {
    (num_bits as usize) * COMPRESSION_BLOCK_SIZE / 8
}

fn is_strictly_sorted(values: &[u32]) -> bool {
    values.windows(2).all(|w| w[0] < w[1])
}

#[cfg(test)]
mod test {
    use super::*;

    fn random_sorted(len: usize, range: usize) -> Vec<u32> {
        let mut block = rand::seq::index::sample(&mut rand::thread_rng(), range, len)
            .into_iter()
            .map(|i| i as u32)
            .collect::<Vec<_>>();
        block.sort_unstable();
        block
    }

    #[test]
    fn test_block_encoder() {
        let mut encoder = BlockEncoder::new();
        let block = (0..128).collect::<Vec<_>>();
        let (num_bits, compressed) = encoder.compress_block_sorted(&block, 0);
        let mut decoder = BlockDecoder::new();
        let bytes = decoder.decompress_block_sorted(compressed, num_bits, 0);
        assert_eq!(decoder.output(), block);
        assert_eq!(bytes, Some(compressed.len()));
    }

    #[test]
    fn test_block_encoder_with_offset() {
        let mut encoder = BlockEncoder::new();
        let block = random_sorted(128, 100000)
            .into_iter()
            .map(|v| v + 1000)
            .collect::<Vec<_>>();
        let (num_bits, compressed) = encoder.compress_block_sorted(&block, 999);
        let mut decoder = BlockDecoder::new();
        let bytes = decoder.decompress_block_sorted(compressed, num_bits, 999);
        assert_eq!(decoder.output(), block);
        assert_eq!(bytes, Some(compressed.len()));
    }

    #[test]
    fn test_block_encoder_unsorted_random() {
        let mut encoder = BlockEncoder::new();
        let block = (0..128).map(|_| rand::random::<u32>()).collect::<Vec<_>>();
        let (num_bits, compressed) = encoder.compress_block_unsorted(&block);
        let mut decoder = BlockDecoder::new();
        let bytes = decoder.decompress_block_unsorted(compressed, num_bits);
        assert_eq!(decoder.output(), block);
        assert_eq!(bytes, Some(compressed.len()));
    }

    #[test]
    fn test_block_encoder_vint_sorted_random() {
        let mut encoder = BlockEncoder::new();
        let block = random_sorted(100, 100000);
        let compressed = encoder.compress_vint_sorted(&block, 0);
        let mut decoder = BlockDecoder::new();
        let bytes = decoder.decompress_vint_sorted(compressed, 0, 100);
        assert_eq!(decoder.output(), block);
        assert_eq!(bytes, Some(compressed.len()));
    }

    #[test]
    fn test_block_encoder_vint_unsorted_max() {
        let mut encoder = BlockEncoder::new();
        let block = vec![u32::MAX; 128];
        let compressed = encoder.compress_vint_unsorted(&block);
        assert_eq!(compressed.len(), 128 * 5);
        let mut decoder = BlockDecoder::new();
        let bytes = decoder.decompress_vint_unsorted(compressed, 128);
        assert_eq!(decoder.output(), block);
        assert_eq!(bytes, Some(compressed.len()));
    }

    #[test]
    fn test_block_decoder_rejects_garbage() {
        let mut decoder = BlockDecoder::new();
        assert_eq!(decoder.decompress_block_sorted(&[0; 4], 8, 0), None);
        assert_eq!(decoder.decompress_block_unsorted(&[0; 512], 33), None);
        assert_eq!(decoder.decompress_vint_unsorted(&[0x80; 10], 11), None);
        assert_eq!(decoder.decompress_vint_sorted(&[0x81, 0x80], 0, 2), None);
        assert_eq!(decoder.decompress_vint_sorted(&[0x80; 4], 0, 200), None);
    }
}
