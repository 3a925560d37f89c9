//! Document map of a sealed segment: doc_id -> (length, row ref), sorted by doc id.

use bytemuck::{Pod, Zeroable};

use crate::error::{Bm25Error, Result};
use crate::page::SegmentPages;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DocMapEntry {
    pub doc_id: u32,
    pub doc_len: u32,
    pub row_ref: u64,
}

unsafe impl Zeroable for DocMapEntry {}
unsafe impl Pod for DocMapEntry {}

pub struct DocMapReader<'a> {
    pages: &'a SegmentPages,
    segment_id: u32,
    start: u32,
    len: u32,
}

impl<'a> DocMapReader<'a> {
    pub fn new(pages: &'a SegmentPages, segment_id: u32, start: u32, len: u32) -> Self {
        Self {
            pages,
            segment_id,
            start,
            len,
        }
    }

    pub fn get(&self, index: u32) -> Result<DocMapEntry> {
        self.pages.read_entry(self.start, index)
    }

    pub fn read_all(&self) -> Result<Vec<DocMapEntry>> {
        self.pages.read_entries(self.start, 0, self.len)
    }

    /// Index of the first entry in `lo..` whose doc id is `>= doc_id`.
    fn lower_bound(&self, mut lo: u32, doc_id: u32) -> Result<u32> {
        let mut hi = self.len;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.get(mid)?.doc_id < doc_id {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    pub fn find(&self, doc_id: u32) -> Result<Option<DocMapEntry>> {
        let index = self.lower_bound(0, doc_id)?;
        if index == self.len {
            return Ok(None);
        }
        let entry = self.get(index)?;
        Ok((entry.doc_id == doc_id).then_some(entry))
    }

    /// Row refs of `docids`, which must be sorted and present in the map.
    pub fn resolve_sorted(&self, docids: &[u32]) -> Result<Vec<u64>> {
        let mut row_refs = Vec::with_capacity(docids.len());
        let mut lo = 0;
        for &doc_id in docids {
            let index = self.lower_bound(lo, doc_id)?;
            let entry = if index < self.len {
                Some(self.get(index)?)
            } else {
                None
            };
            match entry {
                Some(entry) if entry.doc_id == doc_id => row_refs.push(entry.row_ref),
                _ => {
                    return Err(Bm25Error::segment_corrupt(
                        self.segment_id,
                        format!("doc {} has postings but no document map entry", doc_id),
                    ))
                }
            }
            lo = index + 1;
        }
        Ok(row_refs)
    }
}
