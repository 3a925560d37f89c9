pub mod delete;
pub mod docmap;
pub mod field_norm;
pub mod memtable;
pub mod merge;
pub mod meta;
pub mod pending;
pub mod posting;
pub mod sealed;

use std::sync::Arc;

use sealed::SealedSegmentReader;

use crate::page::PageAllocator;
use crate::error::Result;

/// Frees every page of `segment`. Returns the number of pages.
pub fn free_segment(allocator: &PageAllocator, segment: &SealedSegmentReader) -> Result<usize> {
    let pages = segment.all_pages();
    let n = pages.len();
    allocator.free_pages(pages)?;
    Ok(n)
}

/// Opens the segment at `root` and frees its pages.
pub fn free_segment_at(allocator: &PageAllocator, root: u32) -> Result<usize> {
    let segment = SealedSegmentReader::open(allocator.relation(), root)?;
    free_segment(allocator, &segment)
}

/// Segments of one level, newest first.
pub type LevelSegments = Vec<Arc<SealedSegmentReader>>;
