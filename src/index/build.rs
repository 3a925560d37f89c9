//! Bulk loading of an empty index, on one thread or across workers.
//!
//! Row `p` of the source always becomes doc id `base + p`, so every mode
//! assigns the same ids.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Bm25Error, Result};
use crate::page::{PageAllocator, INVALID_BLKNO};
use crate::segment::memtable::Memtable;
use crate::segment::posting::TERMINATED_DOC;
use crate::segment::free_segment_at;
use crate::segment::meta::MAX_LEVELS;

use super::{Bm25Index, SegmentSet};

/// Documents a scanner thread may run ahead of its indexer.
const SCAN_QUEUE_DEPTH: usize = 256;

/// One row of input: term frequencies of an already tokenized text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub row_ref: u64,
    pub terms: Vec<(String, u32)>,
    /// Token count, used for length normalization.
    pub length: u32,
}

impl Document {
    /// Counts a token stream. The length is the number of tokens.
    pub fn from_tokens<I, S>(row_ref: u64, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut terms: Vec<(String, u32)> = Vec::new();
        let mut length = 0u32;
        for token in tokens {
            let token = token.as_ref();
            length += 1;
            match positions.get(token) {
                Some(&i) => terms[i].1 += 1,
                None => {
                    positions.insert(token.to_string(), terms.len());
                    terms.push((token.to_string(), 1));
                }
            }
        }
        Self {
            row_ref,
            terms,
            length,
        }
    }

    fn estimated_bytes(&self) -> u64 {
        16 + self
            .terms
            .iter()
            .map(|(term, _)| term.len() as u64 + 8)
            .sum::<u64>()
    }
}

/// Where a build reads its rows from.
pub trait DocumentSource: Sync {
    fn num_rows(&self) -> usize;

    /// Calls `visit` for every row in `range`, in order, stopping at the
    /// first error.
    fn scan(&self, range: Range<usize>, visit: &mut dyn FnMut(Document) -> Result<()>) -> Result<()>;

    /// Rough size of the input, used to reserve pages up front.
    fn estimated_bytes(&self) -> u64;
}

impl DocumentSource for [Document] {
    fn num_rows(&self) -> usize {
        self.len()
    }

    fn scan(&self, range: Range<usize>, visit: &mut dyn FnMut(Document) -> Result<()>) -> Result<()> {
        let rows = self
            .get(range.clone())
            .ok_or_else(|| Bm25Error::InvalidState(format!("scan range {:?} out of bounds", range)))?;
        for document in rows {
            visit(document.clone())?;
        }
        Ok(())
    }

    fn estimated_bytes(&self) -> u64 {
        self.iter().map(Document::estimated_bytes).sum()
    }
}

impl DocumentSource for Vec<Document> {
    fn num_rows(&self) -> usize {
        self.as_slice().num_rows()
    }

    fn scan(&self, range: Range<usize>, visit: &mut dyn FnMut(Document) -> Result<()>) -> Result<()> {
        self.as_slice().scan(range, visit)
    }

    fn estimated_bytes(&self) -> u64 {
        self.as_slice().estimated_bytes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    Serial,
    /// `workers == 0` uses the configured `build_workers`.
    Parallel { workers: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildReport {
    pub docs: u64,
    pub tokens: u64,
    pub workers: usize,
    /// Level-0 segments written before compaction.
    pub segments: usize,
    pub merges: usize,
    pub reserved_pages: u32,
    pub released_pages: u32,
}

/// Feeds documents into a private memtable, spilling unlinked level-0
/// segments as it fills up.
struct RangeIndexer<'a> {
    index: &'a Bm25Index,
    memtable: Memtable,
    next_doc_id: u32,
    docs: u64,
    tokens: u64,
}

impl<'a> RangeIndexer<'a> {
    fn new(index: &'a Bm25Index, first_doc_id: u32, threshold: usize) -> Self {
        Self {
            index,
            memtable: Memtable::new(threshold),
            next_doc_id: first_doc_id,
            docs: 0,
            tokens: 0,
        }
    }

    fn add(&mut self, document: Document, on_spill: &mut dyn FnMut(u32) -> Result<()>) -> Result<()> {
        self.index.check_interrupt()?;
        let doc_id = self.next_doc_id;
        if doc_id == TERMINATED_DOC {
            return Err(Bm25Error::DocIdExhausted);
        }
        let inserted = self
            .memtable
            .insert(doc_id, &document.terms, document.length, document.row_ref);
        match inserted {
            Err(Bm25Error::CapacityExceeded { .. }) => {
                self.spill(on_spill)?;
                self.memtable
                    .insert(doc_id, &document.terms, document.length, document.row_ref)?;
            }
            other => other?,
        }
        self.next_doc_id += 1;
        self.docs += 1;
        self.tokens += document.length as u64;
        Ok(())
    }

    fn spill(&mut self, on_spill: &mut dyn FnMut(u32) -> Result<()>) -> Result<()> {
        let spilled = self.memtable.write_segment(
            &self.index.allocator,
            0,
            self.index.option.encode,
            |_| false,
        )?;
        self.memtable.clear();
        match spilled {
            Some(segment) => on_spill(segment.root),
            None => Ok(()),
        }
    }

    fn finish(mut self, on_spill: &mut dyn FnMut(u32) -> Result<()>) -> Result<(u64, u64)> {
        self.spill(on_spill)?;
        Ok((self.docs, self.tokens))
    }
}

struct WorkerReport {
    worker: usize,
    roots: Vec<u32>,
    result: Result<(u64, u64)>,
}

fn split_rows(rows: usize, workers: usize) -> Vec<Range<usize>> {
    let per_worker = rows / workers;
    let extra = rows % workers;
    let mut start = 0;
    (0..workers)
        .map(|worker| {
            let len = per_worker + usize::from(worker < extra);
            let range = start..start + len;
            start += len;
            range
        })
        .collect()
}

impl Bm25Index {
    /// Loads every row of `source` into this index, which must be empty.
    ///
    /// On any error everything written so far is freed and the index is
    /// left empty.
    pub fn build<S: DocumentSource + ?Sized>(&self, source: &S, mode: BuildMode) -> Result<BuildReport> {
        let _writer = self.writer_lock.lock();
        let base = {
            let meta = self.meta.lock();
            if meta.doc_cnt != 0
                || meta.num_segments() != 0
                || !self.memtable.read().is_empty()
                || !self.deletes.read().is_empty()
            {
                return Err(Bm25Error::InvalidState("build requires an empty index".into()));
            }
            meta.next_doc_id
        };
        let rows = source.num_rows();
        if rows as u64 > (TERMINATED_DOC - base) as u64 {
            return Err(Bm25Error::DocIdExhausted);
        }

        let reserved_pages = PageAllocator::estimate_pages(
            source.estimated_bytes(),
            self.option.pool_expansion_factor,
        );
        tracing::info!(rows, ?mode, reserved_pages, "building index");

        let mut unlinked = Vec::new();
        let built = self.allocator.reserve(reserved_pages).and_then(|()| match mode {
            BuildMode::Serial => self.build_serial(source, base),
            BuildMode::Parallel { workers } => {
                let workers = match workers {
                    0 => self.option.build_workers,
                    workers => workers,
                };
                self.build_parallel(source, base, workers, &mut unlinked)
            }
        });
        let mut report = match built {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(error = %e, "build failed, resetting index");
                self.abort_build(&unlinked, base);
                return Err(e);
            }
        };
        report.reserved_pages = reserved_pages;
        tracing::info!(
            docs = report.docs,
            segments = report.segments,
            merges = report.merges,
            released = report.released_pages,
            "built index"
        );
        Ok(report)
    }

    fn build_serial<S: DocumentSource + ?Sized>(&self, source: &S, base: u32) -> Result<BuildReport> {
        let mut report = BuildReport {
            workers: 1,
            ..Default::default()
        };
        let mut link = |root: u32| -> Result<()> {
            {
                let mut meta = self.meta.lock();
                self.link_segments(&mut meta, 0, &[root])?;
            }
            report.segments += 1;
            report.merges += self.compact_levels_locked()?;
            Ok(())
        };

        let mut indexer = RangeIndexer::new(self, base, self.option.memtable_spill_threshold);
        source.scan(0..source.num_rows(), &mut |document| indexer.add(document, &mut link))?;
        let (docs, tokens) = indexer.finish(&mut link)?;

        report.released_pages = self.allocator.release_unused()?;
        self.finish_build(base, docs, tokens)?;
        report.docs = docs;
        report.tokens = tokens;
        Ok(report)
    }

    fn build_parallel<S: DocumentSource + ?Sized>(
        &self,
        source: &S,
        base: u32,
        workers: usize,
        unlinked: &mut Vec<u32>,
    ) -> Result<BuildReport> {
        let rows = source.num_rows();
        let workers = workers.clamp(1, rows.max(1));
        let threshold = self.option.memtable_spill_threshold.div_ceil(workers);
        let ranges = split_rows(rows, workers);
        let failed = AtomicBool::new(false);
        let (report_tx, report_rx) = crossbeam_channel::unbounded::<WorkerReport>();

        std::thread::scope(|scope| {
            let helpers: Vec<_> = ranges
                .iter()
                .enumerate()
                .skip(1)
                .map(|(worker, range)| {
                    let range = range.clone();
                    let report_tx = report_tx.clone();
                    let failed = &failed;
                    scope.spawn(move || {
                        let report = self.run_worker(source, worker, range, base, threshold, failed);
                        let _ = report_tx.send(report);
                    })
                })
                .collect();
            // the coordinating thread is worker 0
            let report = self.run_worker(source, 0, ranges[0].clone(), base, threshold, &failed);
            let _ = report_tx.send(report);
            for helper in helpers {
                // a panicked worker sends no report
                let _ = helper.join();
            }
        });
        drop(report_tx);

        let mut reports: Vec<Option<WorkerReport>> = (0..workers).map(|_| None).collect();
        for report in report_rx.try_iter() {
            let worker = report.worker;
            reports[worker] = Some(report);
        }
        let mut error: Option<Bm25Error> = None;
        let mut docs = 0;
        let mut tokens = 0;
        for (worker, report) in reports.into_iter().enumerate() {
            let outcome = match report {
                Some(report) => {
                    unlinked.extend_from_slice(&report.roots);
                    report.result
                }
                None => Err(Bm25Error::WorkerFailed {
                    worker,
                    reason: "worker panicked".into(),
                }),
            };
            match outcome {
                Ok((worker_docs, worker_tokens)) => {
                    docs += worker_docs;
                    tokens += worker_tokens;
                }
                // the first real failure wins over the cancellations it caused
                Err(e) => match error {
                    None | Some(Bm25Error::Cancelled) => error = Some(e),
                    Some(_) => {}
                },
            }
        }
        if let Some(e) = error {
            return Err(e);
        }

        let released_pages = self.allocator.release_unused()?;
        let segments = unlinked.len();
        {
            let mut meta = self.meta.lock();
            self.link_segments(&mut meta, 0, unlinked)?;
        }
        unlinked.clear();
        self.finish_build(base, docs, tokens)?;
        let merges = self.compact_levels_locked()?;
        Ok(BuildReport {
            docs,
            tokens,
            workers,
            segments,
            merges,
            released_pages,
            reserved_pages: 0,
        })
    }

    /// Indexes one range. A scanner thread reads the rows and hands them
    /// over a bounded channel, so reading and indexing overlap.
    fn run_worker<S: DocumentSource + ?Sized>(
        &self,
        source: &S,
        worker: usize,
        range: Range<usize>,
        base: u32,
        threshold: usize,
        failed: &AtomicBool,
    ) -> WorkerReport {
        tracing::debug!(worker, start = range.start, end = range.end, "build worker started");
        let first_doc_id = base + range.start as u32;
        let mut roots = Vec::new();
        let result: Result<(u64, u64)> = std::thread::scope(|scope| {
            let (doc_tx, doc_rx) = crossbeam_channel::bounded::<Document>(SCAN_QUEUE_DEPTH);
            let scanner = scope.spawn(move || {
                source.scan(range, &mut |document| {
                    doc_tx.send(document).map_err(|_| Bm25Error::Cancelled)
                })
            });

            let mut indexer = RangeIndexer::new(self, first_doc_id, threshold);
            let mut indexed = Ok(());
            for document in doc_rx.iter() {
                if failed.load(Ordering::Relaxed) {
                    indexed = Err(Bm25Error::Cancelled);
                    break;
                }
                let added = indexer.add(document, &mut |root| {
                    roots.push(root);
                    Ok(())
                });
                if let Err(e) = added {
                    indexed = Err(e);
                    break;
                }
            }
            // unblocks a scanner still sending
            drop(doc_rx);
            let scanned = scanner.join().unwrap_or_else(|_| {
                Err(Bm25Error::WorkerFailed {
                    worker,
                    reason: "scanner panicked".into(),
                })
            });
            indexed?;
            scanned?;
            indexer.finish(&mut |root| {
                roots.push(root);
                Ok(())
            })
        });
        match &result {
            Ok((docs, _)) => {
                tracing::debug!(worker, docs, segments = roots.len(), "build worker finished")
            }
            Err(e) => {
                failed.store(true, Ordering::Relaxed);
                tracing::warn!(worker, error = %e, "build worker failed");
            }
        }
        WorkerReport {
            worker,
            roots,
            result,
        }
    }

    fn finish_build(&self, base: u32, docs: u64, tokens: u64) -> Result<()> {
        let mut meta = self.meta.lock();
        meta.doc_cnt += docs;
        meta.doc_term_cnt += tokens;
        meta.next_doc_id = base + docs as u32;
        self.persist_meta(&mut meta)
    }

    /// Unlinks and frees everything a failed build wrote. Errors here are
    /// logged; the caller reports the build's own error.
    fn abort_build(&self, unlinked: &[u32], base: u32) {
        let live = {
            let mut meta = self.meta.lock();
            let mut memtable = self.memtable.write();
            let live = std::mem::replace(&mut *self.segments.write(), Arc::new(SegmentSet::default()));
            memtable.clear();
            meta.doc_cnt = 0;
            meta.doc_term_cnt = 0;
            meta.next_doc_id = base;
            meta.level_heads = [INVALID_BLKNO; MAX_LEVELS];
            meta.level_counts = [0; MAX_LEVELS];
            if let Err(e) = self.persist_meta(&mut meta) {
                tracing::warn!(error = %e, "cannot reset metapage");
            }
            live
        };
        self.retired.lock().extend(live.iter().cloned());
        drop(live);

        for &root in unlinked {
            if let Err(e) = free_segment_at(&self.allocator, root) {
                tracing::warn!(segment = root, error = %e, "cannot free segment of failed build");
            }
        }
        if let Err(e) = self.reclaim_retired() {
            tracing::warn!(error = %e, "cannot reclaim segments of failed build");
        }
        if let Err(e) = self.allocator.release_unused() {
            tracing::warn!(error = %e, "cannot release page pool");
        }
        let mut meta = self.meta.lock();
        if let Err(e) = self.persist_meta(&mut meta) {
            tracing::warn!(error = %e, "cannot persist metapage");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use rand::{Rng, SeedableRng};

    use super::super::tests::small_option;
    use super::*;
    use crate::options::IndexingOption;
    use crate::page::Relation;
    use crate::segment::posting::PostingIterator;

    fn corpus(seed: u64, rows: usize) -> Vec<Document> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        (0..rows)
            .map(|row| {
                let tokens: Vec<String> = (0..rng.gen_range(1..20))
                    .map(|_| format!("k{}", rng.gen_range(0..50u32).min(rng.gen_range(0..50u32))))
                    .collect();
                Document::from_tokens(row as u64 * 3, tokens)
            })
            .collect()
    }

    /// Every (term, doc, tf) triple stored in the index, sorted.
    fn triples(index: &Bm25Index) -> Vec<(Vec<u8>, u32, u32)> {
        let mut out = Vec::new();
        for segment in index.segments().iter() {
            for (term, _) in segment.terms().unwrap() {
                let mut cursor = segment.postings(&term, false).unwrap().unwrap();
                while cursor.advance().unwrap() != TERMINATED_DOC {
                    out.push((term.clone(), cursor.docid(), cursor.freq()));
                }
            }
        }
        out.sort();
        out
    }

    fn built(rows: &[Document], mode: BuildMode) -> Bm25Index {
        let index = Bm25Index::create(Relation::new(), small_option()).unwrap();
        let report = index.build(rows, mode).unwrap();
        assert_eq!(report.docs, rows.len() as u64);
        index
    }

    #[test]
    fn from_tokens_counts() {
        let doc = Document::from_tokens(4, ["a", "b", "a", "c", "a"]);
        assert_eq!(doc.length, 5);
        assert_eq!(
            doc.terms,
            vec![("a".to_string(), 3), ("b".to_string(), 1), ("c".to_string(), 1)]
        );
    }

    #[test]
    fn split_covers_every_row() {
        assert_eq!(split_rows(10, 3), vec![0..4, 4..7, 7..10]);
        assert_eq!(split_rows(2, 2), vec![0..1, 1..2]);
        assert_eq!(split_rows(0, 1), vec![0..0]);
    }

    #[test]
    fn parallel_build_matches_serial() {
        let rows = corpus(21, 2000);
        let serial = built(&rows, BuildMode::Serial);
        let expected = triples(&serial);
        assert!(!expected.is_empty());

        for workers in [1, 2, 4] {
            let parallel = built(&rows, BuildMode::Parallel { workers });
            assert_eq!(triples(&parallel), expected, "workers={}", workers);
            assert_eq!(parallel.stats().doc_cnt, serial.stats().doc_cnt);
            assert_eq!(parallel.stats().doc_term_cnt, serial.stats().doc_term_cnt);
            assert_eq!(parallel.stats().next_doc_id, 2000);
            let queries: [&[&str]; 3] = [&["k0"], &["k1", "k7"], &["k30", "k3", "k30"]];
            for terms in queries {
                assert_eq!(parallel.topk(terms, 25).unwrap(), serial.topk(terms, 25).unwrap());
            }
            for doc_id in [0u32, 999, 1999] {
                assert_eq!(
                    parallel.resolve_row_ref(doc_id).unwrap(),
                    Some(doc_id as u64 * 3)
                );
            }
        }
    }

    #[test]
    fn build_compacts_like_spills() {
        let rows = corpus(8, 3000);
        let index = built(&rows, BuildMode::Parallel { workers: 3 });
        let per_level = index.option().segments_per_level as usize;
        let set = index.segments();
        for level in 0..MAX_LEVELS - 1 {
            assert!(set.level(level).len() <= per_level);
        }
        assert_eq!(index.stats().memtable_docs, 0);
        assert_eq!(index.stats().doc_cnt, 3000);
    }

    #[test]
    fn build_requires_empty_index() {
        let index = Bm25Index::create(Relation::new(), small_option()).unwrap();
        index.insert(&Document::from_tokens(0, ["x"])).unwrap();
        let rows = corpus(1, 10);
        assert!(matches!(
            index.build(&rows, BuildMode::Serial),
            Err(Bm25Error::InvalidState(_))
        ));
    }

    #[test]
    fn empty_source_builds_empty_index() {
        let index = Bm25Index::create(Relation::new(), small_option()).unwrap();
        let rows: Vec<Document> = Vec::new();
        let report = index.build(&rows, BuildMode::Parallel { workers: 4 }).unwrap();
        assert_eq!(report.docs, 0);
        assert_eq!(report.workers, 1);
        assert_eq!(index.stats().segments, 0);
        assert!(index.topk(&["k0"], 3).unwrap().is_empty());
    }

    #[test]
    fn exhausted_storage_leaves_empty_index() {
        let rows = corpus(3, 4000);
        for mode in [BuildMode::Serial, BuildMode::Parallel { workers: 3 }] {
            let option = IndexingOption {
                pool_expansion_factor: 0.1,
                ..small_option()
            };
            let index = Bm25Index::create(Relation::with_max_pages(12), option).unwrap();
            let err = index.build(&rows, mode).unwrap_err();
            assert!(matches!(err, Bm25Error::StorageExhausted { max_pages: 12 }), "{:?}", err);

            let stats = index.stats();
            assert_eq!(stats.doc_cnt, 0);
            assert_eq!(stats.segments, 0);
            assert_eq!(stats.memtable_docs, 0);
            assert_eq!(stats.next_doc_id, 0);
            assert!(index.topk(&["k0"], 5).unwrap().is_empty());
            // every page but the metapage is free again
            let summary = index.summary().unwrap();
            assert_eq!(summary.free_pages, summary.nblocks - 1);

            let id = index.insert(&Document::from_tokens(9, ["k0"])).unwrap();
            assert_eq!(id, 0);
            assert_eq!(index.topk(&["k0"], 5).unwrap().len(), 1);
        }
    }

    #[test]
    fn interrupted_build_is_cancelled() {
        let rows = corpus(4, 500);
        let index = Bm25Index::create(Relation::new(), IndexingOption::default()).unwrap();
        index.interrupt_handle().store(true, Ordering::Relaxed);
        assert!(matches!(
            index.build(&rows, BuildMode::Parallel { workers: 2 }),
            Err(Bm25Error::Cancelled)
        ));
        index.interrupt_handle().store(false, Ordering::Relaxed);
        assert_eq!(index.stats().doc_cnt, 0);
        index.build(&rows, BuildMode::Serial).unwrap();
        assert_eq!(index.stats().doc_cnt, 500);
    }
}
