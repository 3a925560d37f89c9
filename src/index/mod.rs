//! The index facade.
//!
//! Writers (insert, delete, spill, compaction, build, vacuum) are serialized
//! by `writer_lock`. Locks are always taken in the order
//! `meta -> memtable -> segments -> deletes -> pending -> retired`; readers
//! never hold `meta` while taking another lock.

mod am;
mod build;
mod compaction;
mod insert;
mod options;
mod recovery;
mod scan;
mod vacuum;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

pub use am::{Capabilities, CAPABILITIES};
pub use build::{BuildMode, BuildReport, Document, DocumentSource};
pub use options::parse_options;
pub use recovery::RecoveryReport;
pub use scan::{FilteredSearch, SearchHit};
pub use vacuum::{BulkDeleteStats, VacuumReport};

use crate::error::{Bm25Error, Result};
use crate::options::IndexingOption;
use crate::page::{page_read, PageAllocator, PageInfo, Relation};
use crate::segment::delete::{delete_bitmap_pages, DeleteBitmap};
use crate::segment::memtable::Memtable;
use crate::segment::meta::{init_metapage, write_meta, MetaPageData, MAX_LEVELS};
use crate::segment::pending::PendingLog;
use crate::segment::sealed::{set_next_segment, SealedSegmentReader};
use crate::segment::LevelSegments;

/// An immutable view of every live segment, one list per level.
///
/// Published as an `Arc`; a query keeps the set it started with even when
/// compaction swaps in a new one.
#[derive(Debug, Clone, Default)]
pub struct SegmentSet {
    levels: [LevelSegments; MAX_LEVELS],
}

impl SegmentSet {
    pub fn level(&self, level: usize) -> &[Arc<SealedSegmentReader>] {
        &self.levels[level]
    }

    /// Every segment, level 0 first and newest first within a level.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<SealedSegmentReader>> {
        self.levels.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexStats {
    pub doc_cnt: u64,
    pub doc_term_cnt: u64,
    pub avgdl: f32,
    pub next_doc_id: u32,
    pub deleted_docs: u64,
    pub memtable_docs: usize,
    pub memtable_postings: usize,
    pub memtable_bytes: usize,
    pub segments: usize,
    pub nblocks: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentSummary {
    pub root: u32,
    pub level: u16,
    pub num_docs: u32,
    pub num_terms: u32,
    pub total_tokens: u64,
    pub pages: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSummary {
    /// Segments per level, newest first.
    pub levels: Vec<Vec<SegmentSummary>>,
    pub memtable_docs: usize,
    pub free_pages: u32,
    pub nblocks: u32,
}

pub struct Bm25Index {
    relation: Relation,
    option: IndexingOption,
    allocator: PageAllocator,
    meta: Mutex<MetaPageData>,
    memtable: RwLock<Memtable>,
    segments: RwLock<Arc<SegmentSet>>,
    deletes: RwLock<Arc<DeleteBitmap>>,
    pending: Mutex<PendingLog>,
    writer_lock: Mutex<()>,
    retired: Mutex<Vec<Arc<SealedSegmentReader>>>,
    interrupt: Arc<AtomicBool>,
}

impl Bm25Index {
    /// Creates an empty index in `relation`, which must hold no pages.
    pub fn create(relation: Relation, option: IndexingOption) -> Result<Self> {
        options::validate(&option)?;
        let meta = MetaPageData::new(option.encode);
        init_metapage(&relation, &meta)?;
        tracing::debug!(encode = ?option.encode, "created index");
        Ok(Self::assemble(
            relation,
            option,
            meta,
            SegmentSet::default(),
            DeleteBitmap::new(),
        ))
    }

    fn assemble(
        relation: Relation,
        option: IndexingOption,
        meta: MetaPageData,
        segments: SegmentSet,
        deletes: DeleteBitmap,
    ) -> Self {
        let allocator = PageAllocator::new(relation.clone(), meta.free_page_blkno);
        Self {
            relation,
            memtable: RwLock::new(Memtable::new(option.memtable_spill_threshold)),
            option,
            allocator,
            meta: Mutex::new(meta),
            segments: RwLock::new(Arc::new(segments)),
            deletes: RwLock::new(Arc::new(deletes)),
            pending: Mutex::new(PendingLog::new()),
            writer_lock: Mutex::new(()),
            retired: Mutex::new(Vec::new()),
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn relation(&self) -> &Relation {
        &self.relation
    }

    pub fn option(&self) -> &IndexingOption {
        &self.option
    }

    /// Setting the flag makes running queries and builds fail with
    /// [`Bm25Error::Cancelled`]. Clear it again before the next operation.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    pub fn segments(&self) -> Arc<SegmentSet> {
        self.segments.read().clone()
    }

    pub fn stats(&self) -> IndexStats {
        let meta = *self.meta.lock();
        let (memtable_docs, memtable_postings, memtable_bytes) = {
            let memtable = self.memtable.read();
            (memtable.num_docs(), memtable.num_postings(), memtable.arena_bytes())
        };
        IndexStats {
            doc_cnt: meta.doc_cnt,
            doc_term_cnt: meta.doc_term_cnt,
            avgdl: meta.avgdl(),
            next_doc_id: meta.next_doc_id,
            deleted_docs: self.deletes.read().len(),
            memtable_docs,
            memtable_postings,
            memtable_bytes,
            segments: self.segments.read().len(),
            nblocks: self.relation.nblocks(),
        }
    }

    pub fn summary(&self) -> Result<IndexSummary> {
        let memtable_docs = self.memtable.read().num_docs();
        let segments = self.segments();
        let levels = segments
            .levels
            .iter()
            .map(|level| {
                level
                    .iter()
                    .map(|segment| SegmentSummary {
                        root: segment.segment_id(),
                        level: segment.level(),
                        num_docs: segment.num_docs(),
                        num_terms: segment.num_terms(),
                        total_tokens: segment.total_tokens(),
                        pages: segment.all_pages().len(),
                    })
                    .collect()
            })
            .collect();
        Ok(IndexSummary {
            levels,
            memtable_docs,
            free_pages: self.allocator.free_list_len()?,
            nblocks: self.relation.nblocks(),
        })
    }

    /// Decodes the trailer of one page without any other context.
    pub fn inspect_page(&self, blkno: u32) -> Result<PageInfo> {
        let page = page_read(&self.relation, blkno)?;
        PageInfo::of(blkno, &page)
    }

    /// Row ref of a live document, from the memtable or any live segment.
    pub fn resolve_row_ref(&self, doc_id: u32) -> Result<Option<u64>> {
        if self.deletes.read().is_deleted(doc_id) {
            return Ok(None);
        }
        let (in_memtable, segments) = {
            let memtable = self.memtable.read();
            (memtable.doc(doc_id), self.segments.read().clone())
        };
        if let Some(doc) = in_memtable {
            return Ok(Some(doc.row_ref));
        }
        for segment in segments.iter() {
            if !segment.contains_doc(doc_id) {
                continue;
            }
            if let Some(row_ref) = segment.resolve_row_ref(doc_id)? {
                return Ok(Some(row_ref));
            }
        }
        Ok(None)
    }

    /// Spills the memtable. Deletes and the metapage are persisted as they
    /// happen, so after this returns every document is on pages.
    pub fn flush(&self) -> Result<()> {
        let _writer = self.writer_lock.lock();
        self.spill_locked()?;
        let mut meta = self.meta.lock();
        self.persist_meta(&mut meta)
    }

    /// Flushes and marks the metapage as cleanly shut down.
    pub fn close(self) -> Result<()> {
        self.flush()?;
        let _writer = self.writer_lock.lock();
        let mut meta = self.meta.lock();
        meta.clean_shutdown = 1;
        self.persist_meta(&mut meta)?;
        tracing::debug!(docs = meta.doc_cnt, "closed index");
        Ok(())
    }

    fn persist_meta(&self, meta: &mut MetaPageData) -> Result<()> {
        meta.free_page_blkno = self.allocator.free_head();
        write_meta(&self.relation, meta)
    }

    /// Links unlinked segments in front of `level`, keeping their order, and
    /// publishes the new segment set.
    fn link_segments(&self, meta: &mut MetaPageData, level: usize, roots: &[u32]) -> Result<()> {
        if roots.is_empty() {
            return Ok(());
        }
        let mut next = meta.level_heads[level];
        for &root in roots.iter().rev() {
            set_next_segment(&self.relation, root, next)?;
            next = root;
        }
        let readers = roots
            .iter()
            .map(|&root| SealedSegmentReader::open(&self.relation, root).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        let mut set = (**self.segments.read()).clone();
        set.levels[level].splice(0..0, readers);
        meta.level_heads[level] = next;
        meta.level_counts[level] += roots.len() as u32;
        self.persist_meta(meta)?;
        *self.segments.write() = Arc::new(set);
        Ok(())
    }

    /// Stores `bitmap` as a new chain, frees the old one and publishes it.
    fn publish_deletes(&self, meta: &mut MetaPageData, bitmap: DeleteBitmap) -> Result<()> {
        let old_pages = delete_bitmap_pages(&self.relation, meta.delete_bitmap_blkno)?;
        meta.delete_bitmap_blkno = bitmap.store(&self.allocator)?;
        *self.deletes.write() = Arc::new(bitmap);
        self.allocator.free_pages(old_pages)?;
        self.persist_meta(meta)
    }

    fn check_interrupt(&self) -> Result<()> {
        if self.interrupt.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(Bm25Error::Cancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{PageFlags, INVALID_BLKNO, METAPAGE_BLKNO};
    use crate::segment::meta::read_meta;

    pub(super) fn small_option() -> IndexingOption {
        IndexingOption {
            memtable_spill_threshold: 64,
            segments_per_level: 2,
            build_workers: 3,
            ..Default::default()
        }
    }

    pub(super) fn doc(row_ref: u64, terms: &[(&str, u32)]) -> Document {
        Document {
            row_ref,
            terms: terms.iter().map(|(t, tf)| (t.to_string(), *tf)).collect(),
            length: terms.iter().map(|(_, tf)| *tf).sum(),
        }
    }

    #[test]
    fn create_requires_empty_relation() {
        let relation = Relation::new();
        let index = Bm25Index::create(relation.clone(), IndexingOption::default()).unwrap();
        assert_eq!(index.stats().doc_cnt, 0);
        assert_eq!(index.stats().avgdl, 1.0);
        assert!(matches!(
            Bm25Index::create(relation, IndexingOption::default()),
            Err(Bm25Error::InvalidState(_))
        ));
    }

    #[test]
    fn create_rejects_invalid_options() {
        let option = IndexingOption {
            segments_per_level: 1,
            ..Default::default()
        };
        assert!(matches!(
            Bm25Index::create(Relation::new(), option),
            Err(Bm25Error::InvalidOptions(_))
        ));
    }

    #[test]
    fn summary_and_inspect() {
        let index = Bm25Index::create(Relation::new(), small_option()).unwrap();
        for i in 0..10 {
            index.insert(&doc(i, &[("alpha", 1), ("beta", 2)])).unwrap();
        }
        index.flush().unwrap();
        let summary = index.summary().unwrap();
        assert_eq!(summary.memtable_docs, 0);
        assert_eq!(summary.levels[0].len(), 1);
        let segment = &summary.levels[0][0];
        assert_eq!(segment.num_docs, 10);
        assert_eq!(segment.num_terms, 2);
        assert_eq!(segment.total_tokens, 30);

        let meta_page = index.inspect_page(METAPAGE_BLKNO).unwrap();
        assert_eq!(meta_page.flag, PageFlags::META);
        let root = index.inspect_page(segment.root).unwrap();
        assert_eq!(root.flag, PageFlags::SEGMENT_HEADER);
        assert_eq!(root.segment_id, segment.root);
        assert_eq!(root.next_blkno, INVALID_BLKNO);
        assert!(index.inspect_page(summary.nblocks).is_err());
    }

    #[test]
    fn resolve_across_memtable_and_segments() {
        let index = Bm25Index::create(Relation::new(), small_option()).unwrap();
        let a = index.insert(&doc(100, &[("x", 1)])).unwrap();
        index.flush().unwrap();
        let b = index.insert(&doc(200, &[("x", 1)])).unwrap();
        assert_eq!(index.resolve_row_ref(a).unwrap(), Some(100));
        assert_eq!(index.resolve_row_ref(b).unwrap(), Some(200));
        assert_eq!(index.resolve_row_ref(b + 1).unwrap(), None);
        index.delete_document(a).unwrap();
        assert_eq!(index.resolve_row_ref(a).unwrap(), None);
    }

    #[test]
    fn close_marks_clean_shutdown() {
        let relation = Relation::new();
        let index = Bm25Index::create(relation.clone(), small_option()).unwrap();
        index.insert(&doc(1, &[("x", 3)])).unwrap();
        index.close().unwrap();
        let meta = read_meta(&relation).unwrap();
        assert_eq!(meta.clean_shutdown, 1);
        assert_eq!(meta.doc_cnt, 1);
        assert_eq!(meta.doc_term_cnt, 3);
        assert_eq!(meta.num_segments(), 1);
        assert_eq!(meta.pending_rows_blkno, INVALID_BLKNO);
    }

    #[test]
    fn save_and_load_round_trip() {
        let relation = Relation::new();
        let index = Bm25Index::create(relation.clone(), small_option()).unwrap();
        for i in 0..300u64 {
            let term = format!("t{}", i % 7);
            index.insert(&doc(i, &[(term.as_str(), 1), ("all", 1)])).unwrap();
        }
        let before = index.topk(&["t3", "all"], 10).unwrap();
        index.close().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.pages");
        relation.save(&path).unwrap();
        let loaded = Relation::load(&path).unwrap();
        assert_eq!(loaded.nblocks(), relation.nblocks());

        let (reopened, report) = Bm25Index::open(loaded, small_option()).unwrap();
        assert!(!report.stats_corrected);
        assert!(report.pending_rows.is_empty());
        assert_eq!(reopened.stats().doc_cnt, 300);
        assert_eq!(reopened.topk(&["t3", "all"], 10).unwrap(), before);
    }
}
