use std::sync::Arc;

use crate::error::Result;
use crate::page::INVALID_BLKNO;
use crate::segment::free_segment;
use crate::segment::merge::merge_segments;
use crate::segment::meta::MAX_LEVELS;
use crate::segment::sealed::{set_next_segment, SealedSegmentReader, SealedSegmentWriter};

use super::Bm25Index;

impl Bm25Index {
    /// Merges every segment of `level` into one segment at `level + 1` when
    /// the level holds more than `segments_per_level` segments. Returns
    /// whether a merge happened.
    pub fn maybe_compact(&self, level: usize) -> Result<bool> {
        let _writer = self.writer_lock.lock();
        self.maybe_compact_locked(level)
    }

    /// Compacts from level 0 upward, so a merge that overfills the next
    /// level is merged in turn. Returns the number of merges.
    pub fn compact_levels(&self) -> Result<usize> {
        let _writer = self.writer_lock.lock();
        self.compact_levels_locked()
    }

    pub(super) fn compact_levels_locked(&self) -> Result<usize> {
        let mut merges = 0;
        for level in 0..MAX_LEVELS - 1 {
            if self.maybe_compact_locked(level)? {
                merges += 1;
            }
        }
        Ok(merges)
    }

    fn maybe_compact_locked(&self, level: usize) -> Result<bool> {
        if level + 1 >= MAX_LEVELS {
            return Ok(false);
        }
        let inputs = self.segments.read().level(level).to_vec();
        if inputs.len() <= self.option.segments_per_level as usize {
            return Ok(false);
        }
        let next_level = level + 1;
        let deletes = self.deletes.read().clone();

        let mut writer = SealedSegmentWriter::new(&self.allocator, next_level as u16, self.option.encode)?;
        let stats = match merge_segments(&inputs, &mut writer, &deletes) {
            Ok(stats) => stats,
            Err(e) => {
                writer.abandon()?;
                return Err(e);
            }
        };
        let output = if stats.docs == 0 {
            writer.abandon()?;
            None
        } else {
            let root = writer.segment_id();
            writer.finalize()?;
            Some(root)
        };

        {
            let mut meta = self.meta.lock();
            let mut set = (**self.segments.read()).clone();
            if let Some(root) = output {
                set_next_segment(&self.relation, root, meta.level_heads[next_level])?;
                let reader = Arc::new(SealedSegmentReader::open(&self.relation, root)?);
                set.levels[next_level].insert(0, reader);
                meta.level_heads[next_level] = root;
                meta.level_counts[next_level] += 1;
            }
            set.levels[level].clear();
            meta.level_heads[level] = INVALID_BLKNO;
            meta.level_counts[level] = 0;
            self.persist_meta(&mut meta)?;
            *self.segments.write() = Arc::new(set);
        }

        tracing::info!(
            level,
            inputs = inputs.len(),
            output = ?output,
            docs = stats.docs,
            purged = stats.purged_docs,
            "compacted level"
        );
        self.retired.lock().extend(inputs);
        self.reclaim_retired()?;
        Ok(true)
    }

    /// Frees the pages of retired segments no query holds any more.
    /// Returns the number of segments and pages freed.
    pub(super) fn reclaim_retired(&self) -> Result<(usize, usize)> {
        let unreferenced = {
            let mut retired = self.retired.lock();
            let (free, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut *retired)
                .into_iter()
                .partition(|segment| Arc::strong_count(segment) == 1);
            *retired = keep;
            free
        };
        let mut pages = 0;
        for segment in &unreferenced {
            pages += free_segment(&self.allocator, segment)?;
        }
        if !unreferenced.is_empty() {
            let mut meta = self.meta.lock();
            self.persist_meta(&mut meta)?;
            tracing::debug!(segments = unreferenced.len(), pages, "reclaimed retired segments");
        }
        Ok((unreferenced.len(), pages))
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{doc, small_option};
    use super::*;
    use crate::page::Relation;
    use crate::segment::meta::read_meta;

    fn spill_docs(index: &Bm25Index, spills: usize, docs_per_spill: u64) {
        for s in 0..spills as u64 {
            for i in 0..docs_per_spill {
                let row = s * docs_per_spill + i;
                let term = format!("w{}", row % 5);
                index.insert(&doc(row, &[(term.as_str(), 1), ("any", 2)])).unwrap();
            }
            index.spill().unwrap();
        }
    }

    #[test]
    fn level_merges_past_threshold() {
        let relation = Relation::new();
        let index = Bm25Index::create(relation.clone(), small_option()).unwrap();
        spill_docs(&index, 2, 10);
        assert_eq!(index.segments().level(0).len(), 2);
        assert!(index.segments().level(1).is_empty());

        spill_docs(&index, 1, 10);
        let set = index.segments();
        assert!(set.level(0).is_empty());
        assert_eq!(set.level(1).len(), 1);
        assert_eq!(set.level(1)[0].num_docs(), 30);
        assert_eq!(set.level(1)[0].level(), 1);

        let meta = read_meta(&relation).unwrap();
        assert_eq!(meta.level_counts[0], 0);
        assert_eq!(meta.level_heads[0], INVALID_BLKNO);
        assert_eq!(meta.level_counts[1], 1);
        assert_eq!(meta.level_heads[1], set.level(1)[0].segment_id());
        assert_eq!(index.topk(&["any"], 100).unwrap().len(), 30);
    }

    #[test]
    fn cascade_reaches_level_two() {
        let index = Bm25Index::create(Relation::new(), small_option()).unwrap();
        // three level-0 merges make three level-1 segments, one more than allowed
        spill_docs(&index, 9, 4);
        let set = index.segments();
        assert!(set.level(0).is_empty());
        assert!(set.level(1).is_empty());
        assert_eq!(set.level(2).len(), 1);
        assert_eq!(set.level(2)[0].num_docs(), 36);
    }

    #[test]
    fn compaction_is_idempotent() {
        let index = Bm25Index::create(Relation::new(), small_option()).unwrap();
        spill_docs(&index, 3, 6);
        let before = index.summary().unwrap();
        for level in 0..MAX_LEVELS {
            assert!(!index.maybe_compact(level).unwrap());
        }
        assert_eq!(index.compact_levels().unwrap(), 0);
        assert_eq!(index.summary().unwrap(), before);
    }

    #[test]
    fn merge_purges_deleted_docs() {
        let index = Bm25Index::create(Relation::new(), small_option()).unwrap();
        spill_docs(&index, 2, 5);
        for doc_id in 0..5 {
            index.delete_document(doc_id).unwrap();
        }
        spill_docs(&index, 1, 5);
        let merged = index.segments().level(1)[0].clone();
        assert_eq!(merged.num_docs(), 10);
        assert!(!merged.contains_doc(0));
        assert_eq!(index.stats().doc_cnt, 10);
    }

    #[test]
    fn merged_pages_are_reused() {
        let index = Bm25Index::create(Relation::new(), small_option()).unwrap();
        spill_docs(&index, 3, 20);
        let after_first = index.summary().unwrap();
        assert!(after_first.free_pages > 0);

        // the next spill fits in the freed pages
        let nblocks = index.relation().nblocks();
        spill_docs(&index, 1, 2);
        assert_eq!(index.relation().nblocks(), nblocks);
    }

    #[test]
    fn held_segments_are_freed_after_release() {
        let index = Bm25Index::create(Relation::new(), small_option()).unwrap();
        spill_docs(&index, 2, 5);
        let snapshot = index.segments();
        spill_docs(&index, 1, 5);
        // the newest input was never in the snapshot and is gone already
        assert_eq!(index.retired.lock().len(), 2);
        // the old snapshot still reads its segments
        let old = snapshot.level(0)[0].clone();
        assert_eq!(old.docmap().read_all().unwrap().len(), 5);
        drop(old);
        drop(snapshot);
        let (segments, pages) = index.reclaim_retired().unwrap();
        assert_eq!(segments, 2);
        assert!(pages >= 6);
        assert!(index.retired.lock().is_empty());
    }
}
