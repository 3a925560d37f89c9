use std::num::NonZeroU32;

use crate::algorithm::{BlockEncode, BlockEncodeTrait};
use crate::error::{Bm25Error, Result};
use crate::options::EncodeOption;
use crate::page::PageWriter;

use super::{SkipBlock, COMPRESSION_BLOCK_SIZE};

/// Sink for a sorted stream of terms, each followed by its postings in
/// doc id order. Spilling a memtable and merging segments both feed one.
pub trait InvertedSerialize {
    fn new_term(&mut self, term: &[u8]) -> Result<()>;
    fn write_doc(&mut self, doc_id: u32, freq: u32, fieldnorm_id: u8) -> Result<()>;
    fn close_term(&mut self) -> Result<()>;
}

/// Where one term's postings ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermLocation {
    pub skip_start: u32,
    pub block_count: u32,
    pub doc_freq: u32,
}

/// Buffers postings into blocks, writes each block to the data stream and
/// keeps the skip entries in memory until the segment is finalized.
pub struct PostingSerializer {
    encoder: BlockEncode,
    // last doc id of the previous block, 0 for the first block of a term
    last_doc_id: u32,
    doc_ids: [u32; COMPRESSION_BLOCK_SIZE],
    term_freqs: [u32; COMPRESSION_BLOCK_SIZE],
    fieldnorm_ids: [u8; COMPRESSION_BLOCK_SIZE],
    block_size: usize,
    term_skip_start: u32,
    term_doc_freq: u32,
    skips: Vec<SkipBlock>,
}

impl PostingSerializer {
    pub fn new(encode: EncodeOption) -> Self {
        Self {
            encoder: BlockEncode::new(encode),
            last_doc_id: 0,
            doc_ids: [0; COMPRESSION_BLOCK_SIZE],
            term_freqs: [0; COMPRESSION_BLOCK_SIZE],
            fieldnorm_ids: [0; COMPRESSION_BLOCK_SIZE],
            block_size: 0,
            term_skip_start: 0,
            term_doc_freq: 0,
            skips: Vec::new(),
        }
    }

    pub fn new_term(&mut self) {
        self.last_doc_id = 0;
        self.block_size = 0;
        self.term_skip_start = self.skips.len() as u32;
        self.term_doc_freq = 0;
    }

    pub fn write_doc(
        &mut self,
        writer: &mut PageWriter,
        doc_id: u32,
        freq: u32,
        fieldnorm_id: u8,
    ) -> Result<()> {
        let last = if self.block_size > 0 {
            Some(self.doc_ids[self.block_size - 1])
        } else if self.term_doc_freq > 0 {
            Some(self.last_doc_id)
        } else {
            None
        };
        if let Some(last) = last {
            if doc_id <= last {
                return Err(Bm25Error::DocIdOutOfOrder { doc_id, last });
            }
        }
        if freq == 0 {
            return Err(Bm25Error::InvalidState(format!(
                "zero term frequency for doc {}",
                doc_id
            )));
        }
        self.doc_ids[self.block_size] = doc_id;
        self.term_freqs[self.block_size] = freq;
        self.fieldnorm_ids[self.block_size] = fieldnorm_id;
        self.block_size += 1;
        self.term_doc_freq += 1;
        if self.block_size == COMPRESSION_BLOCK_SIZE {
            self.flush_block(writer)?;
        }
        Ok(())
    }

    pub fn close_term(&mut self, writer: &mut PageWriter) -> Result<TermLocation> {
        if self.block_size > 0 {
            self.flush_block(writer)?;
        }
        Ok(TermLocation {
            skip_start: self.term_skip_start,
            block_count: self.skips.len() as u32 - self.term_skip_start,
            doc_freq: self.term_doc_freq,
        })
    }

    /// Skip entries of every term, in write order.
    pub fn into_skips(self) -> Vec<SkipBlock> {
        self.skips
    }

    fn flush_block(&mut self, writer: &mut PageWriter) -> Result<()> {
        let len = self.block_size;
        let (blockwand_tf, blockwand_fieldnorm_id) = self.block_wand();

        let block_offset = writer.offset();
        let data = self.encoder.encode(
            NonZeroU32::new(self.last_doc_id),
            &self.doc_ids[..len],
            &self.term_freqs[..len],
            &self.fieldnorm_ids[..len],
        );
        writer.write(data)?;
        self.last_doc_id = self.doc_ids[len - 1];

        self.skips.push(SkipBlock {
            last_doc: self.last_doc_id,
            block_offset,
            blockwand_tf,
            block_len: data.len() as u16,
            doc_cnt: len as u8,
            blockwand_fieldnorm_id,
        });
        self.block_size = 0;
        Ok(())
    }

    fn block_wand(&self) -> (u32, u8) {
        let len = self.block_size;
        let max_tf = self.term_freqs[..len].iter().copied().max().unwrap_or(0);
        let min_norm = self.fieldnorm_ids[..len].iter().copied().min().unwrap_or(0);
        (max_tf, min_norm)
    }
}
