use std::num::NonZeroU32;
use std::sync::Arc;

use crate::algorithm::{BlockDecode, BlockDecodeTrait};
use crate::error::{Bm25Error, Result};
use crate::segment::sealed::{DictEntry, SealedSegmentReader};
use crate::weight::Bm25Weight;

use super::{PostingIterator, SkipBlock, TERMINATED_DOC};

/// Iterates one term's postings inside a sealed segment.
///
/// The skip entries of the term are read once when the cursor is opened, so
/// seeking never touches the skip region again. `cur_block` is the decoded
/// block, `shallow_block` the block-max window, which may run ahead of it.
pub struct PostingCursor {
    segment: Arc<SealedSegmentReader>,
    skips: Vec<SkipBlock>,
    doc_freq: u32,
    block_decode: BlockDecode,
    buf: Vec<u8>,
    cur_block: usize,
    block_decoded: bool,
    pos: usize,
    started: bool,
    terminated: bool,
    shallow_block: usize,
    load_row_refs: bool,
    row_refs: Vec<u64>,
}

impl PostingCursor {
    pub fn new(
        segment: Arc<SealedSegmentReader>,
        entry: DictEntry,
        load_row_refs: bool,
    ) -> Result<Self> {
        let skips = segment.read_skips(entry.skip_start, entry.block_count)?;
        let total: u32 = skips.iter().map(|s| s.doc_cnt as u32).sum();
        if skips.is_empty() || total != entry.doc_freq {
            return Err(Bm25Error::segment_corrupt(
                segment.segment_id(),
                format!(
                    "term has {} postings in {} blocks, dictionary says {}",
                    total,
                    skips.len(),
                    entry.doc_freq
                ),
            ));
        }
        let block_decode = BlockDecode::new(segment.encode());
        Ok(Self {
            segment,
            skips,
            doc_freq: entry.doc_freq,
            block_decode,
            buf: Vec::new(),
            cur_block: 0,
            block_decoded: false,
            pos: 0,
            started: false,
            terminated: false,
            shallow_block: 0,
            load_row_refs,
            row_refs: Vec::new(),
        })
    }

    pub fn segment(&self) -> &Arc<SealedSegmentReader> {
        &self.segment
    }

    /// Row ref of the current posting; only with `load_row_refs`.
    pub fn row_ref(&self) -> Option<u64> {
        if !self.load_row_refs || !self.positioned() {
            return None;
        }
        self.row_refs.get(self.pos).copied()
    }

    fn positioned(&self) -> bool {
        self.started && !self.terminated && self.block_decoded
    }

    fn terminate(&mut self) -> u32 {
        self.terminated = true;
        self.block_decoded = false;
        self.shallow_block = self.skips.len();
        TERMINATED_DOC
    }

    fn decode_block(&mut self, block: usize) -> Result<()> {
        let skip = self.skips[block];
        let offset = if block == 0 {
            None
        } else {
            NonZeroU32::new(self.skips[block - 1].last_doc)
        };
        self.buf.resize(skip.block_len as usize, 0);
        self.segment.pages().read_at(skip.block_offset, &mut self.buf)?;
        let segment_id = self.segment.segment_id();
        self.block_decode
            .decode(&self.buf, offset, skip.doc_cnt as u32)
            .ok_or_else(|| {
                Bm25Error::segment_corrupt(
                    segment_id,
                    format!("posting block at {} does not decode", skip.block_offset),
                )
            })?;
        if self.block_decode.docids().last() != Some(&skip.last_doc) {
            return Err(Bm25Error::segment_corrupt(
                segment_id,
                format!("posting block at {} disagrees with its skip entry", skip.block_offset),
            ));
        }
        if self.load_row_refs {
            self.row_refs = self.segment.resolve_row_refs(self.block_decode.docids())?;
        }
        self.cur_block = block;
        self.block_decoded = true;
        self.pos = 0;
        self.shallow_block = block;
        Ok(())
    }
}

impl PostingIterator for PostingCursor {
    fn docid(&self) -> u32 {
        if !self.positioned() {
            return TERMINATED_DOC;
        }
        self.block_decode.docids()[self.pos]
    }

    fn advance(&mut self) -> Result<u32> {
        if self.terminated {
            return Ok(TERMINATED_DOC);
        }
        if !self.started {
            self.started = true;
            self.decode_block(0)?;
            return Ok(self.docid());
        }
        self.pos += 1;
        if self.pos < self.block_decode.docids().len() {
            return Ok(self.docid());
        }
        let next = self.cur_block + 1;
        if next == self.skips.len() {
            return Ok(self.terminate());
        }
        self.decode_block(next)?;
        Ok(self.docid())
    }

    fn seek(&mut self, target: u32) -> Result<u32> {
        if self.terminated {
            return Ok(TERMINATED_DOC);
        }
        if self.started && self.docid() >= target {
            return Ok(self.docid());
        }
        let first = if self.started { self.cur_block } else { 0 };
        let block = first + self.skips[first..].partition_point(|s| s.last_doc < target);
        if block == self.skips.len() {
            self.started = true;
            return Ok(self.terminate());
        }
        if !self.started || block != self.cur_block {
            self.started = true;
            self.decode_block(block)?;
        }
        let docids = self.block_decode.docids();
        self.pos += docids[self.pos..].partition_point(|&d| d < target);
        Ok(self.docid())
    }

    fn shallow_seek(&mut self, target: u32) -> bool {
        if self.terminated {
            return false;
        }
        // the window is recomputed from the decoded block, so a smaller
        // target than last time still gets the right block
        let first = if self.started { self.cur_block } else { 0 };
        self.shallow_block = first + self.skips[first..].partition_point(|s| s.last_doc < target);
        self.shallow_block < self.skips.len()
    }

    fn freq(&self) -> u32 {
        if !self.positioned() {
            return 0;
        }
        self.block_decode.freqs()[self.pos]
    }

    fn fieldnorm_id(&self) -> u8 {
        if !self.positioned() {
            return 0;
        }
        self.block_decode.fieldnorm_ids()[self.pos]
    }

    fn block_max_score(&self, weight: &Bm25Weight) -> f32 {
        match self.skips.get(self.shallow_block) {
            Some(skip) if !self.terminated => skip.block_max_score(weight),
            _ => 0.0,
        }
    }

    fn last_doc_in_block(&self) -> u32 {
        match self.skips.get(self.shallow_block) {
            Some(skip) if !self.terminated => skip.last_doc,
            _ => TERMINATED_DOC,
        }
    }

    fn max_score(&self, weight: &Bm25Weight) -> f32 {
        self.skips
            .iter()
            .map(|skip| skip.block_max_score(weight))
            .fold(0.0, f32::max)
    }

    fn doc_freq(&self) -> u32 {
        self.doc_freq
    }
}
