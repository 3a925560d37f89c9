use std::num::NonZeroU32;

use bitpack::{BitpackDecode, BitpackEncode};
use enum_dispatch::enum_dispatch;
use plain::{PlainDecode, PlainEncode};

use crate::options::EncodeOption;

mod bitpack;
mod plain;

/// Encodes one block of at most `COMPRESSION_BLOCK_SIZE` postings.
///
/// `offset` is the last doc id of the previous block of the same term, so
/// the first doc id of the block can be delta coded too.
#[enum_dispatch]
pub trait BlockEncodeTrait {
    fn encode(
        &mut self,
        offset: Option<NonZeroU32>,
        docids: &[u32],
        freqs: &[u32],
        fieldnorm_ids: &[u8],
    ) -> &[u8];
}

/// Decodes a block written by the matching encoder. `None` means the bytes
/// cannot have come from it: wrong length, unsorted doc ids, zero term
/// frequency and so on.
#[enum_dispatch]
pub trait BlockDecodeTrait {
    fn decode(&mut self, data: &[u8], offset: Option<NonZeroU32>, doc_cnt: u32) -> Option<()>;
    fn docids(&self) -> &[u32];
    fn freqs(&self) -> &[u32];
    fn fieldnorm_ids(&self) -> &[u8];
}

#[enum_dispatch(BlockEncodeTrait)]
pub enum BlockEncode {
    BitpackEncode,
    PlainEncode,
}

#[enum_dispatch(BlockDecodeTrait)]
pub enum BlockDecode {
    BitpackDecode,
    PlainDecode,
}

impl BlockEncode {
    pub fn new(option: EncodeOption) -> Self {
        match option {
            EncodeOption::DeltaBitpack => BitpackEncode::new().into(),
            EncodeOption::Plain => PlainEncode::new().into(),
        }
    }
}

impl BlockDecode {
    pub fn new(option: EncodeOption) -> Self {
        match option {
            EncodeOption::DeltaBitpack => BitpackDecode::new().into(),
            EncodeOption::Plain => PlainDecode::new().into(),
        }
    }
}

fn is_strictly_sorted_after(offset: Option<NonZeroU32>, docids: &[u32]) -> bool {
    let first_ok = match (offset, docids.first()) {
        (Some(offset), Some(&first)) => first > offset.get(),
        _ => true,
    };
    first_ok && docids.windows(2).all(|w| w[0] < w[1])
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;
    use crate::segment::posting::COMPRESSION_BLOCK_SIZE;

    struct Block {
        offset: Option<NonZeroU32>,
        docids: Vec<u32>,
        freqs: Vec<u32>,
        norms: Vec<u8>,
    }

    fn random_block(len: usize) -> Block {
        let mut rng = rand::thread_rng();
        let base = rng.gen_range(0..1_000_000u32);
        let mut docids = rand::seq::index::sample(&mut rng, 100_000, len)
            .into_iter()
            .map(|x| x as u32 + base + 1)
            .collect::<Vec<_>>();
        docids.sort_unstable();
        Block {
            offset: NonZeroU32::new(base),
            docids,
            freqs: (0..len).map(|_| rng.gen_range(1..5000)).collect(),
            norms: (0..len).map(|_| rng.gen()).collect(),
        }
    }

    fn adversarial_blocks() -> Vec<Block> {
        let full = COMPRESSION_BLOCK_SIZE;
        vec![
            // single document at id 0
            Block {
                offset: None,
                docids: vec![0],
                freqs: vec![1],
                norms: vec![0],
            },
            // all-zero deltas, tf 1, norm 0
            Block {
                offset: None,
                docids: (0..full as u32).collect(),
                freqs: vec![1; full],
                norms: vec![0; full],
            },
            // ids ending at the largest live id, all-max tf and norm
            Block {
                offset: NonZeroU32::new(u32::MAX - 1 - full as u32),
                docids: (u32::MAX - full as u32..u32::MAX).collect(),
                freqs: vec![u32::MAX; full],
                norms: vec![u8::MAX; full],
            },
            // widest possible gaps
            Block {
                offset: None,
                docids: vec![0, u32::MAX - 1],
                freqs: vec![u32::MAX, 1],
                norms: vec![255, 0],
            },
            // single document just after the offset
            Block {
                offset: NonZeroU32::new(41),
                docids: vec![42],
                freqs: vec![7],
                norms: vec![3],
            },
        ]
    }

    fn check(option: EncodeOption, block: &Block) {
        let mut encoder = BlockEncode::new(option);
        let mut decoder = BlockDecode::new(option);
        let data = encoder
            .encode(block.offset, &block.docids, &block.freqs, &block.norms)
            .to_vec();
        decoder
            .decode(&data, block.offset, block.docids.len() as u32)
            .unwrap();
        assert_eq!(decoder.docids(), block.docids);
        assert_eq!(decoder.freqs(), block.freqs);
        assert_eq!(decoder.fieldnorm_ids(), block.norms);
    }

    #[test]
    fn random_blocks_round_trip() {
        for option in [EncodeOption::DeltaBitpack, EncodeOption::Plain] {
            for len in [1, 2, 77, 127, COMPRESSION_BLOCK_SIZE] {
                for _ in 0..20 {
                    check(option, &random_block(len));
                }
            }
        }
    }

    #[test]
    fn adversarial_blocks_round_trip() {
        for option in [EncodeOption::DeltaBitpack, EncodeOption::Plain] {
            for block in adversarial_blocks() {
                check(option, &block);
            }
        }
    }

    #[test]
    fn malformed_blocks_are_rejected() {
        for option in [EncodeOption::DeltaBitpack, EncodeOption::Plain] {
            let block = random_block(COMPRESSION_BLOCK_SIZE);
            let mut encoder = BlockEncode::new(option);
            let data = encoder
                .encode(block.offset, &block.docids, &block.freqs, &block.norms)
                .to_vec();
            let mut decoder = BlockDecode::new(option);
            assert!(decoder.decode(&data[..data.len() - 1], block.offset, 128).is_none());
            assert!(decoder.decode(&data, block.offset, 0).is_none());
            assert!(decoder.decode(&data, block.offset, 129).is_none());
            assert!(decoder.decode(&[], None, 1).is_none());
        }
    }
}
