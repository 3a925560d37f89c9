use bytemuck::{Pod, Zeroable};

use crate::error::{Bm25Error, Result};
use crate::options::EncodeOption;
use crate::page::{page_alloc, page_read, page_write, PageFlags, Relation, INVALID_BLKNO, METAPAGE_BLKNO};
use crate::weight;

pub const META_MAGIC: u32 = 0x4D32_3542;
pub const META_VERSION: u32 = 1;
pub const MAX_LEVELS: usize = 8;

/// The fixed record on block 0.
///
/// `doc_cnt` and `doc_term_cnt` cover live documents in the memtable and in
/// segments. The memtable part is lost on an unclean shutdown, which is why
/// recovery recomputes both from the segment chains.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MetaPageData {
    pub magic: u32,
    pub version: u32,
    pub doc_cnt: u64,
    pub doc_term_cnt: u64,
    pub next_doc_id: u32,
    pub free_page_blkno: u32,
    pub delete_bitmap_blkno: u32,
    pub pending_rows_blkno: u32,
    pub level_heads: [u32; MAX_LEVELS],
    pub level_counts: [u32; MAX_LEVELS],
    pub encode: u32,
    pub clean_shutdown: u32,
}

unsafe impl Zeroable for MetaPageData {}
unsafe impl Pod for MetaPageData {}

impl MetaPageData {
    pub fn new(encode: EncodeOption) -> Self {
        Self {
            magic: META_MAGIC,
            version: META_VERSION,
            doc_cnt: 0,
            doc_term_cnt: 0,
            next_doc_id: 0,
            free_page_blkno: INVALID_BLKNO,
            delete_bitmap_blkno: INVALID_BLKNO,
            pending_rows_blkno: INVALID_BLKNO,
            level_heads: [INVALID_BLKNO; MAX_LEVELS],
            level_counts: [0; MAX_LEVELS],
            encode: encode.to_raw(),
            clean_shutdown: 0,
        }
    }

    pub fn avgdl(&self) -> f32 {
        weight::avgdl(self.doc_cnt, self.doc_term_cnt)
    }

    pub fn num_segments(&self) -> u32 {
        self.level_counts.iter().sum()
    }
}

/// Claims block 0 of an empty relation for the metapage.
pub fn init_metapage(relation: &Relation, meta: &MetaPageData) -> Result<()> {
    if relation.nblocks() != 0 {
        return Err(Bm25Error::InvalidState(format!(
            "relation already holds {} pages",
            relation.nblocks()
        )));
    }
    let mut page = page_alloc(relation, PageFlags::META, INVALID_BLKNO, 0)?;
    debug_assert_eq!(page.blkno(), METAPAGE_BLKNO);
    page.write_pod(meta);
    Ok(())
}

pub fn read_meta(relation: &Relation) -> Result<MetaPageData> {
    if relation.nblocks() == 0 {
        return Err(Bm25Error::MetaCorrupt("relation is empty".into()));
    }
    let page = page_read(relation, METAPAGE_BLKNO)?;
    page.check(METAPAGE_BLKNO, PageFlags::META)
        .map_err(|e| Bm25Error::MetaCorrupt(e.to_string()))?;
    let meta: MetaPageData = page
        .read_pod()
        .ok_or_else(|| Bm25Error::MetaCorrupt("metapage is truncated".into()))?;
    if meta.magic != META_MAGIC {
        return Err(Bm25Error::MetaCorrupt("bad magic".into()));
    }
    if meta.version != META_VERSION {
        return Err(Bm25Error::MetaCorrupt(format!(
            "unsupported version {}",
            meta.version
        )));
    }
    if EncodeOption::from_raw(meta.encode).is_none() {
        return Err(Bm25Error::MetaCorrupt(format!(
            "unknown encoding {}",
            meta.encode
        )));
    }
    Ok(meta)
}

pub fn write_meta(relation: &Relation, meta: &MetaPageData) -> Result<()> {
    let mut page = page_write(relation, METAPAGE_BLKNO)?;
    page.check(METAPAGE_BLKNO, PageFlags::META)
        .map_err(|e| Bm25Error::MetaCorrupt(e.to_string()))?;
    page.write_pod(meta);
    Ok(())
}
