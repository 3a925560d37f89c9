mod reader;
mod serializer;

use bytemuck::{Pod, Zeroable};
pub use reader::PostingCursor;
pub use serializer::{InvertedSerialize, PostingSerializer};

use crate::error::Result;
use crate::segment::field_norm::id_to_fieldnorm;
use crate::weight::Bm25Weight;

pub const TERMINATED_DOC: u32 = u32::MAX;

pub const COMPRESSION_BLOCK_SIZE: usize =
    <bitpacking::BitPacker4x as bitpacking::BitPacker>::BLOCK_LEN;

/// One entry per posting block of a term.
///
/// `blockwand_tf` and `blockwand_fieldnorm_id` are the largest term frequency
/// and the smallest field norm in the block. Scoring them together bounds the
/// score of every posting in the block under any corpus statistics.
#[repr(C)]
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct SkipBlock {
    pub last_doc: u32,
    pub block_offset: u32,
    pub blockwand_tf: u32,
    pub block_len: u16,
    pub doc_cnt: u8,
    pub blockwand_fieldnorm_id: u8,
}

unsafe impl Zeroable for SkipBlock {}
unsafe impl Pod for SkipBlock {}

impl SkipBlock {
    pub fn block_max_score(&self, weight: &Bm25Weight) -> f32 {
        let len = id_to_fieldnorm(self.blockwand_fieldnorm_id);
        weight.score(len, self.blockwand_tf)
    }
}

/// A cursor over one term's posting list.
///
/// A new iterator is positioned before its first posting: `docid` is
/// meaningless until `advance` or `seek` is called. Once exhausted, `docid`
/// returns [`TERMINATED_DOC`].
pub trait PostingIterator {
    fn docid(&self) -> u32;
    /// Moves to the next posting and returns its doc id.
    fn advance(&mut self) -> Result<u32>;
    /// Moves to the first posting with doc id `>= target`. Never moves backwards.
    fn seek(&mut self, target: u32) -> Result<u32>;
    /// Moves only the block-max window to the block that may contain
    /// `target`, without decoding it. Returns false if no block can.
    fn shallow_seek(&mut self, target: u32) -> bool;
    fn freq(&self) -> u32;
    fn fieldnorm_id(&self) -> u8;
    /// Upper bound of the scores in the block-max window.
    fn block_max_score(&self, weight: &Bm25Weight) -> f32;
    /// Last doc id of the block-max window.
    fn last_doc_in_block(&self) -> u32;
    /// Upper bound of every score in the list.
    fn max_score(&self, weight: &Bm25Weight) -> f32;
    fn doc_freq(&self) -> u32;
}
