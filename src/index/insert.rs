use crate::error::{Bm25Error, Result};
use crate::page::INVALID_BLKNO;
use crate::segment::pending::PendingRow;
use crate::segment::posting::TERMINATED_DOC;

use super::{Bm25Index, Document};

impl Bm25Index {
    /// Adds a document and returns its doc id. A full memtable is spilled
    /// first.
    pub fn insert(&self, document: &Document) -> Result<u32> {
        let _writer = self.writer_lock.lock();
        self.insert_locked(document)
    }

    pub(super) fn insert_locked(&self, document: &Document) -> Result<u32> {
        let doc_id = self.meta.lock().next_doc_id;
        if doc_id == TERMINATED_DOC {
            return Err(Bm25Error::DocIdExhausted);
        }
        if !self.memtable.read().has_room(&document.terms) {
            tracing::debug!(doc_id, "memtable full");
            self.spill_locked()?;
        }

        let mut meta = self.meta.lock();
        {
            let mut memtable = self.memtable.write();
            let mut pending = self.pending.lock();
            let mark = pending.mark(&self.relation)?;
            pending.append(
                &self.allocator,
                PendingRow {
                    doc_id,
                    row_ref: document.row_ref,
                },
            )?;
            let inserted =
                memtable.insert(doc_id, &document.terms, document.length, document.row_ref);
            if let Err(e) = inserted {
                if let Err(rollback) = pending.rollback(&self.allocator, mark) {
                    tracing::warn!(doc_id, error = %rollback, "cannot roll back pending row");
                }
                return Err(e);
            }
            meta.pending_rows_blkno = pending.head();
        }
        meta.next_doc_id = doc_id + 1;
        meta.doc_cnt += 1;
        meta.doc_term_cnt += document.length as u64;
        meta.clean_shutdown = 0;
        self.persist_meta(&mut meta)?;
        Ok(doc_id)
    }

    /// Marks a live document as deleted. Queries stop returning it at once;
    /// its postings are dropped by the next spill or merge that covers it.
    pub fn delete_document(&self, doc_id: u32) -> Result<()> {
        let _writer = self.writer_lock.lock();
        self.delete_locked(doc_id)
    }

    /// Replaces a document: the old id is deleted and the new content gets a
    /// fresh id, which is returned.
    pub fn update(&self, doc_id: u32, document: &Document) -> Result<u32> {
        let _writer = self.writer_lock.lock();
        if self.live_doc_len(doc_id)?.is_none() {
            return Err(Bm25Error::DocumentNotFound(doc_id));
        }
        // the old content stays live until the new one is in
        let new_id = self.insert_locked(document)?;
        self.delete_locked(doc_id)?;
        Ok(new_id)
    }

    fn delete_locked(&self, doc_id: u32) -> Result<()> {
        let len = self
            .live_doc_len(doc_id)?
            .ok_or(Bm25Error::DocumentNotFound(doc_id))?;

        let mut meta = self.meta.lock();
        let mut bitmap = (**self.deletes.read()).clone();
        bitmap.delete(doc_id);
        meta.doc_cnt = meta.doc_cnt.saturating_sub(1);
        meta.doc_term_cnt = meta.doc_term_cnt.saturating_sub(len as u64);
        self.publish_deletes(&mut meta, bitmap)?;
        tracing::trace!(doc_id, "deleted document");
        Ok(())
    }

    /// Length of `doc_id` if it is live.
    pub(super) fn live_doc_len(&self, doc_id: u32) -> Result<Option<u32>> {
        if self.deletes.read().is_deleted(doc_id) {
            return Ok(None);
        }
        let (in_memtable, segments) = {
            let memtable = self.memtable.read();
            (memtable.doc(doc_id), self.segments.read().clone())
        };
        if let Some(doc) = in_memtable {
            return Ok(Some(doc.len));
        }
        for segment in segments.iter() {
            if !segment.contains_doc(doc_id) {
                continue;
            }
            if let Some(entry) = segment.doc_entry(doc_id)? {
                return Ok(Some(entry.doc_len));
            }
        }
        Ok(None)
    }

    /// Writes the memtable as a level-0 segment, empties it and runs
    /// compaction. Returns the new segment's root, if any document was live.
    pub fn spill(&self) -> Result<Option<u32>> {
        let _writer = self.writer_lock.lock();
        self.spill_locked()
    }

    pub(super) fn spill_locked(&self) -> Result<Option<u32>> {
        let deletes = self.deletes.read().clone();
        let spilled = {
            let memtable = self.memtable.read();
            if memtable.is_empty() {
                return Ok(None);
            }
            memtable.write_segment(&self.allocator, 0, self.option.encode, |doc| {
                deletes.is_deleted(doc)
            })?
        };

        {
            let mut meta = self.meta.lock();
            let mut memtable = self.memtable.write();
            if let Some(segment) = &spilled {
                self.link_segments(&mut meta, 0, &[segment.root])?;
            }
            memtable.clear();
            self.pending.lock().clear(&self.allocator)?;
            meta.pending_rows_blkno = INVALID_BLKNO;
            self.persist_meta(&mut meta)?;
        }

        match &spilled {
            Some(segment) => tracing::info!(
                segment = segment.root,
                docs = segment.docs,
                postings = segment.postings,
                "spilled memtable"
            ),
            None => tracing::debug!("memtable held only deleted documents"),
        }
        self.compact_levels_locked()?;
        Ok(spilled.map(|segment| segment.root))
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{doc, small_option};
    use super::*;
    use crate::options::IndexingOption;
    use crate::page::Relation;
    use crate::segment::meta::read_meta;
    use crate::segment::pending::read_pending_rows;

    #[test]
    fn ids_are_dense_and_stats_follow() {
        let index = Bm25Index::create(Relation::new(), small_option()).unwrap();
        for i in 0..5u32 {
            assert_eq!(index.insert(&doc(i as u64, &[("a", i + 1)])).unwrap(), i);
        }
        let stats = index.stats();
        assert_eq!(stats.doc_cnt, 5);
        assert_eq!(stats.doc_term_cnt, 15);
        assert_eq!(stats.next_doc_id, 5);
        assert_eq!(stats.memtable_docs, 5);
    }

    #[test]
    fn full_memtable_spills_before_insert() {
        let option = IndexingOption {
            memtable_spill_threshold: 4,
            segments_per_level: 8,
            ..Default::default()
        };
        let index = Bm25Index::create(Relation::new(), option).unwrap();
        index.insert(&doc(0, &[("a", 1), ("b", 1)])).unwrap();
        // brings the memtable to exactly the threshold
        index.insert(&doc(1, &[("a", 1), ("c", 1)])).unwrap();
        assert_eq!(index.stats().segments, 0);
        assert_eq!(index.stats().memtable_postings, 4);

        index.insert(&doc(2, &[("a", 1)])).unwrap();
        let stats = index.stats();
        assert_eq!(stats.segments, 1);
        assert_eq!(stats.memtable_docs, 1);
        let segment = index.segments().level(0)[0].clone();
        assert_eq!(segment.num_docs(), 2);
        assert_eq!(index.resolve_row_ref(1).unwrap(), Some(1));
        assert_eq!(index.resolve_row_ref(2).unwrap(), Some(2));
        assert_eq!(index.topk(&["a"], 10).unwrap().len(), 3);
    }

    #[test]
    fn pending_log_tracks_memtable_rows() {
        let relation = Relation::new();
        let index = Bm25Index::create(relation.clone(), small_option()).unwrap();
        index.insert(&doc(7, &[("a", 1)])).unwrap();
        index.insert(&doc(9, &[("b", 1)])).unwrap();
        let meta = read_meta(&relation).unwrap();
        let rows = read_pending_rows(&relation, meta.pending_rows_blkno).unwrap();
        assert_eq!(
            rows,
            vec![
                PendingRow {
                    doc_id: 0,
                    row_ref: 7
                },
                PendingRow {
                    doc_id: 1,
                    row_ref: 9
                },
            ]
        );

        index.spill().unwrap();
        let meta = read_meta(&relation).unwrap();
        assert_eq!(meta.pending_rows_blkno, INVALID_BLKNO);
    }

    #[test]
    fn delete_hides_and_update_reinserts() {
        let index = Bm25Index::create(Relation::new(), small_option()).unwrap();
        let a = index.insert(&doc(1, &[("apple", 2)])).unwrap();
        let b = index.insert(&doc(2, &[("apple", 1), ("pie", 1)])).unwrap();
        index.spill().unwrap();

        index.delete_document(a).unwrap();
        assert!(matches!(
            index.delete_document(a),
            Err(Bm25Error::DocumentNotFound(id)) if id == a
        ));
        assert!(matches!(
            index.delete_document(99),
            Err(Bm25Error::DocumentNotFound(99))
        ));
        let hits = index.topk(&["apple"], 10).unwrap();
        assert_eq!(hits.iter().map(|h| h.0).collect::<Vec<_>>(), vec![b]);
        assert_eq!(index.stats().doc_cnt, 1);
        assert_eq!(index.stats().doc_term_cnt, 2);

        let c = index.update(b, &doc(2, &[("cherry", 1)])).unwrap();
        assert_eq!(c, b + 1);
        assert!(index.topk(&["apple"], 10).unwrap().is_empty());
        assert_eq!(index.topk(&["cherry"], 10).unwrap()[0].0, c);
        assert_eq!(index.resolve_row_ref(c).unwrap(), Some(2));
        assert_eq!(index.stats().deleted_docs, 2);
    }

    #[test]
    fn spill_drops_deleted_memtable_docs() {
        let index = Bm25Index::create(Relation::new(), small_option()).unwrap();
        let a = index.insert(&doc(1, &[("x", 1)])).unwrap();
        index.delete_document(a).unwrap();
        assert_eq!(index.spill().unwrap(), None);
        assert_eq!(index.stats().segments, 0);
        assert_eq!(index.stats().memtable_docs, 0);

        index.insert(&doc(2, &[("x", 1)])).unwrap();
        let root = index.spill().unwrap().unwrap();
        let segment = index.segments().level(0)[0].clone();
        assert_eq!(segment.segment_id(), root);
        assert_eq!(segment.num_docs(), 1);
    }

    #[test]
    fn failed_insert_leaves_index_usable() {
        let option = IndexingOption {
            memtable_spill_threshold: 1_000_000,
            ..small_option()
        };
        // the metapage and one page of pending rows
        let index = Bm25Index::create(Relation::with_max_pages(2), option).unwrap();
        let mut inserted = 0u32;
        let err = loop {
            match index.insert(&doc(u64::MAX, &[("a", 1)])) {
                Ok(id) => {
                    assert_eq!(id, inserted);
                    inserted += 1;
                }
                Err(e) => break e,
            }
            assert!(inserted < 10_000);
        };
        assert!(matches!(err, Bm25Error::StorageExhausted { max_pages: 2 }), "{:?}", err);
        assert!(inserted > 100);

        let stats = index.stats();
        assert_eq!(stats.doc_cnt, inserted as u64);
        assert_eq!(stats.next_doc_id, inserted);
        assert_eq!(stats.memtable_docs, inserted as usize);

        // the same id is tried again, the failure does not change
        assert!(matches!(
            index.insert(&doc(1, &[("a", 1)])),
            Err(Bm25Error::StorageExhausted { .. })
        ));
        assert_eq!(index.stats().next_doc_id, inserted);
        assert_eq!(index.topk(&["a"], 100_000).unwrap().len(), inserted as usize);

        // a failed update keeps the old document
        assert!(index.update(0, &doc(5, &[("b", 1)])).is_err());
        assert_eq!(index.resolve_row_ref(0).unwrap(), Some(u64::MAX));
        assert_eq!(index.stats().deleted_docs, 0);
        assert_eq!(index.stats().doc_cnt, inserted as u64);

        let meta = read_meta(index.relation()).unwrap();
        let rows = read_pending_rows(index.relation(), meta.pending_rows_blkno).unwrap();
        assert_eq!(rows.len(), inserted as usize);
        assert_eq!(rows.last().map(|r| r.doc_id), Some(inserted - 1));
    }
}
