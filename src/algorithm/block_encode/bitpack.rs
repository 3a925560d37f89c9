// full blocks: [docid_bits][tf_bits][bitpacked docid deltas][bitpacked tf - 1][fieldnorm ids]
// last, partial block of a term: [vint docid deltas][vint tf - 1][fieldnorm ids]

use std::num::NonZeroU32;

use arrayvec::ArrayVec;

use super::{is_strictly_sorted_after, BlockDecodeTrait, BlockEncodeTrait};
use crate::segment::posting::COMPRESSION_BLOCK_SIZE;
use crate::utils::compress_block::{BlockDecoder, BlockEncoder};

pub struct BitpackEncode {
    docid_encoder: BlockEncoder,
    tf_encoder: BlockEncoder,
    tfs: [u32; COMPRESSION_BLOCK_SIZE],
    output: Vec<u8>,
}

impl BitpackEncode {
    pub fn new() -> Self {
        Self {
            docid_encoder: BlockEncoder::new(),
            tf_encoder: BlockEncoder::new(),
            tfs: [0; COMPRESSION_BLOCK_SIZE],
            output: Vec::new(),
        }
    }
}

impl BlockEncodeTrait for BitpackEncode {
    fn encode(
        &mut self,
        offset: Option<NonZeroU32>,
        docids: &[u32],
        freqs: &[u32],
        fieldnorm_ids: &[u8],
    ) -> &[u8] {
        let len = docids.len();
        debug_assert!(len > 0 && len <= COMPRESSION_BLOCK_SIZE);
        debug_assert!(len == freqs.len() && len == fieldnorm_ids.len());
        self.output.clear();
        for (dst, &freq) in self.tfs.iter_mut().zip(freqs) {
            *dst = freq - 1;
        }
        let offset = offset.map_or(0, NonZeroU32::get);

        if len == COMPRESSION_BLOCK_SIZE {
            let (docid_bits, docid_block) = self.docid_encoder.compress_block_sorted(docids, offset);
            let (tf_bits, tf_block) = self.tf_encoder.compress_block_unsorted(&self.tfs);
            self.output.extend_from_slice(&[docid_bits, tf_bits]);
            self.output.extend_from_slice(docid_block);
            self.output.extend_from_slice(tf_block);
        } else {
            let docid_block = self.docid_encoder.compress_vint_sorted(docids, offset);
            self.output.extend_from_slice(docid_block);
            let tf_block = self.tf_encoder.compress_vint_unsorted(&self.tfs[..len]);
            self.output.extend_from_slice(tf_block);
        }
        self.output.extend_from_slice(fieldnorm_ids);
        &self.output
    }
}

pub struct BitpackDecode {
    decoder: BlockDecoder,
    docids: ArrayVec<u32, COMPRESSION_BLOCK_SIZE>,
    freqs: ArrayVec<u32, COMPRESSION_BLOCK_SIZE>,
    fieldnorm_ids: ArrayVec<u8, COMPRESSION_BLOCK_SIZE>,
}

impl BitpackDecode {
    pub fn new() -> Self {
        Self {
            decoder: BlockDecoder::new(),
            docids: ArrayVec::new(),
            freqs: ArrayVec::new(),
            fieldnorm_ids: ArrayVec::new(),
        }
    }

    fn decode_inner(&mut self, mut data: &[u8], offset: u32, len: usize) -> Option<()> {
        if len == COMPRESSION_BLOCK_SIZE {
            let (&docid_bits, rest) = data.split_first()?;
            let (&tf_bits, rest) = rest.split_first()?;
            data = rest;
            let read = self
                .decoder
                .decompress_block_sorted(data, docid_bits, offset)?;
            self.docids.try_extend_from_slice(self.decoder.output()).ok()?;
            data = &data[read..];
            let read = self.decoder.decompress_block_unsorted(data, tf_bits)?;
            data = &data[read..];
        } else {
            let read = self
                .decoder
                .decompress_vint_sorted(data, offset, len as u32)?;
            self.docids.try_extend_from_slice(self.decoder.output()).ok()?;
            data = &data[read..];
            let read = self.decoder.decompress_vint_unsorted(data, len as u32)?;
            data = &data[read..];
        }
        for &tf in self.decoder.output() {
            self.freqs.push(tf.checked_add(1)?);
        }
        if data.len() != len {
            return None;
        }
        self.fieldnorm_ids.try_extend_from_slice(data).ok()
    }
}

impl BlockDecodeTrait for BitpackDecode {
    fn decode(&mut self, data: &[u8], offset: Option<NonZeroU32>, doc_cnt: u32) -> Option<()> {
        self.docids.clear();
        self.freqs.clear();
        self.fieldnorm_ids.clear();
        let len = doc_cnt as usize;
        if len == 0 || len > COMPRESSION_BLOCK_SIZE {
            return None;
        }
        let result = self
            .decode_inner(data, offset.map_or(0, NonZeroU32::get), len)
            .filter(|_| is_strictly_sorted_after(offset, &self.docids));
        if result.is_none() {
            self.docids.clear();
            self.freqs.clear();
            self.fieldnorm_ids.clear();
        }
        result
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
