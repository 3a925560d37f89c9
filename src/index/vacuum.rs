use std::collections::HashSet;

use crate::error::Result;
use crate::page::METAPAGE_BLKNO;
use crate::segment::delete::delete_bitmap_pages;
use crate::segment::pending::pending_pages;

use super::Bm25Index;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkDeleteStats {
    /// Live documents offered to the callback.
    pub examined: u64,
    pub deleted: u64,
    pub remaining: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VacuumReport {
    pub reclaimed_segments: usize,
    pub reclaimed_pages: usize,
    /// Pages no structure referenced, such as those of a segment whose
    /// writer died before linking it.
    pub orphan_pages: usize,
    pub free_pages: u32,
    pub total_pages: u32,
}

impl Bm25Index {
    /// Deletes every live document whose row ref `callback` accepts.
    pub fn bulk_delete(&self, mut callback: impl FnMut(u64) -> bool) -> Result<BulkDeleteStats> {
        let _writer = self.writer_lock.lock();
        let mut stats = BulkDeleteStats::default();
        let mut bitmap = (**self.deletes.read()).clone();
        let mut removed_tokens = 0u64;

        let (memtable_docs, segments) = {
            let memtable = self.memtable.read();
            (memtable.docs().to_vec(), self.segments.read().clone())
        };
        let mut consider = |doc_id: u32, doc_len: u32, row_ref: u64| {
            if bitmap.is_deleted(doc_id) {
                return;
            }
            stats.examined += 1;
            if callback(row_ref) {
                bitmap.delete(doc_id);
                stats.deleted += 1;
                removed_tokens += doc_len as u64;
            }
        };
        for doc in memtable_docs {
            consider(doc.doc_id, doc.len, doc.row_ref);
        }
        for segment in segments.iter() {
            for entry in segment.docmap().read_all()? {
                consider(entry.doc_id, entry.doc_len, entry.row_ref);
            }
        }
        stats.remaining = stats.examined - stats.deleted;

        if stats.deleted > 0 {
            let mut meta = self.meta.lock();
            meta.doc_cnt = meta.doc_cnt.saturating_sub(stats.deleted);
            meta.doc_term_cnt = meta.doc_term_cnt.saturating_sub(removed_tokens);
            self.publish_deletes(&mut meta, bitmap)?;
        }
        tracing::info!(
            examined = stats.examined,
            deleted = stats.deleted,
            "bulk delete"
        );
        Ok(stats)
    }

    /// Frees retired segments nothing reads any more, then sweeps pages no
    /// structure of the index reaches onto the free list.
    pub fn vacuum_cleanup(&self) -> Result<VacuumReport> {
        let _writer = self.writer_lock.lock();
        let (reclaimed_segments, reclaimed_pages) = self.reclaim_retired()?;

        let mut reachable: HashSet<u32> = HashSet::new();
        reachable.insert(METAPAGE_BLKNO);
        reachable.extend(self.allocator.free_list()?);
        for segment in self.segments.read().iter() {
            reachable.extend(segment.all_pages());
        }
        for segment in self.retired.lock().iter() {
            reachable.extend(segment.all_pages());
        }
        {
            let meta = self.meta.lock();
            reachable.extend(delete_bitmap_pages(&self.relation, meta.delete_bitmap_blkno)?);
            reachable.extend(pending_pages(&self.relation, meta.pending_rows_blkno)?);
        }

        let total_pages = self.relation.nblocks();
        // reserved pool pages are reachable only through the allocator
        let orphans: Vec<u32> = if self.allocator.pool_len() > 0 {
            Vec::new()
        } else {
            (0..total_pages).filter(|blkno| !reachable.contains(blkno)).collect()
        };
        let orphan_pages = orphans.len();
        if orphan_pages > 0 {
            tracing::warn!(pages = orphan_pages, "freed orphan pages");
            self.allocator.free_pages(orphans)?;
        }
        {
            let mut meta = self.meta.lock();
            self.persist_meta(&mut meta)?;
        }

        let report = VacuumReport {
            reclaimed_segments,
            reclaimed_pages,
            orphan_pages,
            free_pages: self.allocator.free_list_len()?,
            total_pages,
        };
        tracing::info!(
            reclaimed_pages,
            orphan_pages,
            free_pages = report.free_pages,
            total_pages,
            "vacuum cleanup"
        );
        Ok(report)
    }
}
