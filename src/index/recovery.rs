use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{Bm25Error, Result};
use crate::options::IndexingOption;
use crate::page::{Relation, INVALID_BLKNO};
use crate::segment::delete::DeleteBitmap;
use crate::segment::meta::{read_meta, MAX_LEVELS};
use crate::segment::pending::{pending_pages, read_pending_rows};
use crate::segment::sealed::SealedSegmentReader;

use super::{options, Bm25Index, SegmentSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub doc_cnt: u64,
    pub doc_term_cnt: u64,
    pub segments: usize,
    /// Row refs that were only in the memtable and not deleted. Insert them
    /// again.
    pub pending_rows: Vec<u64>,
    /// The stored corpus statistics did not match the segments.
    pub stats_corrected: bool,
    pub levels_repaired: usize,
    pub clean_shutdown: bool,
}

impl Bm25Index {
    /// Opens the index stored in `relation`.
    ///
    /// Level chains are walked and checked, corpus statistics are recomputed
    /// from the segments and the pending-row log is handed back, so the
    /// index is consistent before the first query whatever state it was
    /// left in.
    pub fn open(relation: Relation, option: IndexingOption) -> Result<(Self, RecoveryReport)> {
        options::validate(&option)?;
        let mut meta = read_meta(&relation)?;
        let clean_shutdown = meta.clean_shutdown == 1;

        let mut segments = SegmentSet::default();
        let mut visited = HashSet::new();
        let mut levels_repaired = 0;
        for level in 0..MAX_LEVELS {
            let mut root = meta.level_heads[level];
            let mut count = 0u32;
            while root != INVALID_BLKNO {
                if !visited.insert(root) {
                    return Err(Bm25Error::MetaCorrupt(format!(
                        "segment {} is linked twice (level {})",
                        root, level
                    )));
                }
                let segment = SealedSegmentReader::open(&relation, root)?;
                if segment.level() as usize != level {
                    return Err(Bm25Error::segment_corrupt(
                        root,
                        format!("written for level {}, linked at level {}", segment.level(), level),
                    ));
                }
                root = segment.header().next_segment;
                segments.levels[level].push(Arc::new(segment));
                count += 1;
            }
            if count != meta.level_counts[level] {
                tracing::warn!(
                    level,
                    stored = meta.level_counts[level],
                    actual = count,
                    "repaired level segment count"
                );
                meta.level_counts[level] = count;
                levels_repaired += 1;
            }
        }

        let deletes = DeleteBitmap::load(&relation, meta.delete_bitmap_blkno)?;
        let mut doc_cnt = 0u64;
        let mut doc_term_cnt = 0u64;
        let mut next_doc_id = meta.next_doc_id;
        for segment in segments.iter() {
            if deletes.is_empty() {
                doc_cnt += segment.num_docs() as u64;
                doc_term_cnt += segment.total_tokens();
            } else {
                for entry in segment.docmap().read_all()? {
                    if !deletes.is_deleted(entry.doc_id) {
                        doc_cnt += 1;
                        doc_term_cnt += entry.doc_len as u64;
                    }
                }
            }
            next_doc_id = next_doc_id.max(segment.header().max_doc.saturating_add(1));
        }
        // a deleted id must never be handed out again
        if let Some(max_deleted) = deletes.iter().last() {
            next_doc_id = next_doc_id.max(max_deleted.saturating_add(1));
        }

        let stats_corrected = doc_cnt != meta.doc_cnt || doc_term_cnt != meta.doc_term_cnt;
        if stats_corrected {
            tracing::warn!(
                stored_docs = meta.doc_cnt,
                stored_tokens = meta.doc_term_cnt,
                docs = doc_cnt,
                tokens = doc_term_cnt,
                "corrected corpus statistics"
            );
            meta.doc_cnt = doc_cnt;
            meta.doc_term_cnt = doc_term_cnt;
        }
        meta.next_doc_id = next_doc_id;

        // a row deleted while in the memtable stays deleted
        let pending_rows: Vec<u64> = read_pending_rows(&relation, meta.pending_rows_blkno)?
            .into_iter()
            .filter(|row| !deletes.is_deleted(row.doc_id))
            .map(|row| row.row_ref)
            .collect();
        let pending_chain = pending_pages(&relation, meta.pending_rows_blkno)?;
        meta.pending_rows_blkno = INVALID_BLKNO;
        meta.clean_shutdown = 0;

        let num_segments = segments.len();
        let index = Self::assemble(relation, option, meta, segments, deletes);
        let free_pages = index.allocator.free_list_len()?;
        index.allocator.free_pages(pending_chain)?;
        {
            let mut meta = index.meta.lock();
            index.persist_meta(&mut meta)?;
        }

        tracing::info!(
            docs = doc_cnt,
            segments = num_segments,
            free_pages,
            pending_rows = pending_rows.len(),
            clean_shutdown,
            "opened index"
        );
        let report = RecoveryReport {
            doc_cnt,
            doc_term_cnt,
            segments: num_segments,
            pending_rows,
            stats_corrected,
            levels_repaired,
            clean_shutdown,
        };
        Ok((index, report))
    }
}
