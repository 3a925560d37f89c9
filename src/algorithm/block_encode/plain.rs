// uncompressed blocks: [u32 le docids][u32 le tfs][fieldnorm ids]

use std::num::NonZeroU32;

use arrayvec::ArrayVec;

use super::{is_strictly_sorted_after, BlockDecodeTrait, BlockEncodeTrait};
use crate::segment::posting::COMPRESSION_BLOCK_SIZE;

pub struct PlainEncode {
    output: Vec<u8>,
}

impl PlainEncode {
    pub fn new() -> Self {
        Self { output: Vec::new() }
    }
}

impl BlockEncodeTrait for PlainEncode {
    fn encode(
        &mut self,
        _offset: Option<NonZeroU32>,
        docids: &[u32],
        freqs: &[u32],
        fieldnorm_ids: &[u8],
    ) -> &[u8] {
        self.output.clear();
        for &docid in docids {
            self.output.extend_from_slice(&docid.to_le_bytes());
        }
        for &freq in freqs {
            self.output.extend_from_slice(&freq.to_le_bytes());
        }
        self.output.extend_from_slice(fieldnorm_ids);
        &self.output
    }
}

pub struct PlainDecode {
    docids: ArrayVec<u32, COMPRESSION_BLOCK_SIZE>,
    freqs: ArrayVec<u32, COMPRESSION_BLOCK_SIZE>,
    fieldnorm_ids: ArrayVec<u8, COMPRESSION_BLOCK_SIZE>,
}

impl PlainDecode {
    pub fn new() -> Self {
        Self {
            docids: ArrayVec::new(),
            freqs: ArrayVec::new(),
            fieldnorm_ids: ArrayVec::new(),
        }
    }
}

impl BlockDecodeTrait for PlainDecode {
    fn decode(&mut self, data: &[u8], offset: Option<NonZeroU32>, doc_cnt: u32) -> Option<()> {
        self.docids.clear();
        self.freqs.clear();
        self.fieldnorm_ids.clear();
        let len = doc_cnt as usize;
        if len == 0 || len > COMPRESSION_BLOCK_SIZE || data.len() != len * 9 {
            return None;
        }
        let (docids, rest) = data.split_at(len * 4);
        let (freqs, fieldnorm_ids) = rest.split_at(len * 4);
        let read_u32 = |chunk: &[u8]| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        self.docids.extend(docids.chunks_exact(4).map(read_u32));
        self.freqs.extend(freqs.chunks_exact(4).map(read_u32));
        self.fieldnorm_ids.extend(fieldnorm_ids.iter().copied());
        if !is_strictly_sorted_after(offset, &self.docids) || self.freqs.contains(&0) {
            self.docids.clear();
            self.freqs.clear();
            self.fieldnorm_ids.clear();
            return None;
        }
        Some(())
    }

    fn docids(&self) -> &[u32] {
        &self.docids
    }

    fn freqs(&self) -> &[u32] {
        &self.freqs
    }

    fn fieldnorm_ids(&self) -> &[u8] {
        &self.fieldnorm_ids
    }
}
