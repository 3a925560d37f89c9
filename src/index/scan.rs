use std::collections::HashSet;

use crate::algorithm::{block_wand, exhaustive, Scorer};
use crate::error::Result;
use crate::segment::delete::DeleteBitmap;
use crate::segment::posting::{PostingCursor, PostingIterator};
use crate::utils::topk_computer::TopKComputer;
use crate::weight::{idf, Bm25Weight};

use super::Bm25Index;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    pub doc_id: u32,
    pub score: f32,
    pub row_ref: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilteredSearch {
    pub hits: Vec<SearchHit>,
    /// Number of top-k passes run.
    pub rounds: usize,
}

/// Distinct terms in first-seen order, each with its repeat count.
fn query_terms<'a>(terms: &[&'a str]) -> Vec<(&'a str, u32)> {
    let mut query: Vec<(&str, u32)> = Vec::with_capacity(terms.len());
    for &term in terms {
        match query.iter_mut().find(|(t, _)| *t == term) {
            Some((_, count)) => *count += 1,
            None => query.push((term, 1)),
        }
    }
    query
}

impl Bm25Index {
    /// The `k` best live documents for `terms` as `(doc_id, score)`, best
    /// first, ties broken by lower doc id. A term given twice counts twice.
    pub fn topk(&self, terms: &[&str], k: usize) -> Result<Vec<(u32, f32)>> {
        let query = query_terms(terms);
        if k == 0 || query.is_empty() {
            return Ok(Vec::new());
        }
        let names: Vec<&str> = query.iter().map(|(term, _)| *term).collect();

        let meta = *self.meta.lock();
        let (memtable_postings, segments, deletes) = {
            let memtable = self.memtable.read();
            let postings = memtable.search(&names)?;
            (postings, self.segments.read().clone(), self.deletes.read().clone())
        };
        let segment_postings = segments
            .iter()
            .map(|segment| {
                names
                    .iter()
                    .map(|term| segment.postings(term.as_bytes(), false))
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;

        let avgdl = meta.avgdl();
        let doc_freqs: Vec<u64> = (0..query.len())
            .map(|ord| {
                let mut doc_freq = memtable_postings[ord]
                    .as_ref()
                    .map_or(0, |p| p.doc_freq() as u64);
                for postings in &segment_postings {
                    doc_freq += postings[ord].as_ref().map_or(0, |p| p.doc_freq() as u64);
                }
                doc_freq
            })
            .collect();
        let weights: Vec<Bm25Weight> = query
            .iter()
            .zip(&doc_freqs)
            .map(|((_, count), &doc_freq)| {
                Bm25Weight::new(*count, idf(meta.doc_cnt, doc_freq), avgdl)
            })
            .collect();

        // no more documents can match than there are postings
        let candidates = doc_freqs.iter().sum::<u64>();
        if candidates == 0 {
            return Ok(Vec::new());
        }
        let capacity = usize::try_from(candidates).map_or(k, |candidates| k.min(candidates));
        let mut computer = TopKComputer::new(capacity);
        self.score_source(memtable_postings, &weights, &deletes, &mut computer)?;
        for postings in segment_postings {
            self.score_source::<PostingCursor>(postings, &weights, &deletes, &mut computer)?;
        }

        Ok(computer
            .to_sorted_slice()
            .iter()
            .map(|&(score, doc_id)| (doc_id, score))
            .collect())
    }

    fn score_source<P: PostingIterator>(
        &self,
        postings: Vec<Option<P>>,
        weights: &[Bm25Weight],
        deletes: &DeleteBitmap,
        computer: &mut TopKComputer,
    ) -> Result<()> {
        let scorers: Vec<Scorer<P>> = postings
            .into_iter()
            .zip(weights)
            .enumerate()
            .filter_map(|(ord, (posting, weight))| {
                posting.map(|posting| Scorer::new(posting, *weight, ord))
            })
            .collect();
        if scorers.is_empty() {
            return Ok(());
        }
        if self.option.query.wand_seek {
            block_wand(scorers, deletes, computer, &self.interrupt)
        } else {
            exhaustive(scorers, deletes, computer, &self.interrupt)
        }
    }

    /// [`Self::topk`] with row refs resolved.
    pub fn search(&self, terms: &[&str], k: usize) -> Result<Vec<SearchHit>> {
        let mut hits = Vec::new();
        for (doc_id, score) in self.topk(terms, k)? {
            if let Some(row_ref) = self.resolve_row_ref(doc_id)? {
                hits.push(SearchHit {
                    doc_id,
                    score,
                    row_ref,
                });
            }
        }
        Ok(hits)
    }

    /// Top-k under a predicate evaluated after ranking.
    ///
    /// Runs [`Self::topk`] with `initial_limit` (the configured `limit` when
    /// 0), doubling it up to `max_limit` until `k` hits pass `filter`. Stops
    /// early when a pass returns fewer documents than asked for: every
    /// match has then been seen. Each document is offered to `filter` once.
    pub fn search_filtered(
        &self,
        terms: &[&str],
        k: usize,
        initial_limit: usize,
        mut filter: impl FnMut(&SearchHit) -> bool,
    ) -> Result<FilteredSearch> {
        if k == 0 {
            return Ok(FilteredSearch {
                hits: Vec::new(),
                rounds: 0,
            });
        }
        let max_limit = self.option.query.max_limit.max(1);
        let mut limit = match initial_limit {
            0 => self.option.query.limit,
            limit => limit,
        }
        .clamp(1, max_limit);

        let mut seen = HashSet::new();
        let mut hits = Vec::new();
        let mut rounds = 0;
        loop {
            rounds += 1;
            let ranked = self.topk(terms, limit)?;
            let exhausted = ranked.len() < limit;
            for (doc_id, score) in ranked {
                if !seen.insert(doc_id) {
                    continue;
                }
                let Some(row_ref) = self.resolve_row_ref(doc_id)? else {
                    continue;
                };
                let hit = SearchHit {
                    doc_id,
                    score,
                    row_ref,
                };
                if filter(&hit) {
                    hits.push(hit);
                    if hits.len() == k {
                        break;
                    }
                }
            }
            if hits.len() >= k || exhausted || limit >= max_limit {
                break;
            }
            limit = limit.saturating_mul(2).min(max_limit);
        }
        tracing::debug!(rounds, limit, hits = hits.len(), "filtered search");
        Ok(FilteredSearch { hits, rounds })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BinaryHeap, HashMap};
    use std::sync::atomic::Ordering;

    use rand::{Rng, SeedableRng};

    use super::super::tests::{doc, small_option};
    use super::*;
    use crate::error::Bm25Error;
    use crate::options::{EncodeOption, IndexingOption, QueryOption};
    use crate::page::Relation;
    use crate::segment::field_norm::{fieldnorm_to_id, id_to_fieldnorm};
    use crate::utils::topk_computer::rank_order;
    use crate::weight::avgdl;

    use super::super::Document;

    fn with_wand(option: IndexingOption, wand_seek: bool) -> IndexingOption {
        IndexingOption {
            query: QueryOption {
                wand_seek,
                ..option.query
            },
            ..option
        }
    }

    fn random_corpus(seed: u64, docs: usize) -> Vec<Document> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let vocab: Vec<String> = (0..30).map(|i| format!("v{}", i)).collect();
        (0..docs)
            .map(|row| {
                let terms: Vec<(String, u32)> = (0..rng.gen_range(1..8))
                    .map(|_| {
                        // skewed so a few terms are frequent
                        let t = rng.gen_range(0..30usize).min(rng.gen_range(0..30usize));
                        (vocab[t].clone(), rng.gen_range(1..4))
                    })
                    .collect();
                let length = terms.iter().map(|(_, tf)| tf).sum::<u32>() + rng.gen_range(0..40);
                Document {
                    row_ref: row as u64,
                    terms,
                    length,
                }
            })
            .collect()
    }

    /// Brute force over the corpus with the same weights the index uses.
    fn reference_topk(
        corpus: &[Document],
        deleted: &HashSet<u32>,
        terms: &[&str],
        k: usize,
    ) -> Vec<(u32, f32)> {
        let query = query_terms(terms);
        let live: Vec<(u32, &Document)> = corpus
            .iter()
            .enumerate()
            .map(|(i, d)| (i as u32, d))
            .filter(|(i, _)| !deleted.contains(i))
            .collect();
        let doc_cnt = live.len() as u64;
        let tokens: u64 = live.iter().map(|(_, d)| d.length as u64).sum();
        let tf_of = |d: &Document, term: &str| -> u32 {
            d.terms.iter().filter(|(t, _)| t == term).map(|(_, tf)| tf).sum()
        };
        // doc freq counts every posting ever written, deleted or not
        let weights: Vec<Bm25Weight> = query
            .iter()
            .map(|(term, count)| {
                let df = corpus.iter().filter(|d| tf_of(d, term) > 0).count() as u64;
                Bm25Weight::new(*count, idf(doc_cnt, df), avgdl(doc_cnt, tokens))
            })
            .collect();
        let mut heap = BinaryHeap::new();
        for (doc_id, d) in live {
            let len = id_to_fieldnorm(fieldnorm_to_id(d.length));
            let mut matched = false;
            let mut score = 0.0f32;
            for ((term, _), weight) in query.iter().zip(&weights) {
                let tf = tf_of(d, term);
                if tf > 0 {
                    matched = true;
                    score += weight.score(len, tf);
                }
            }
            if matched {
                heap.push(std::cmp::Reverse(Ranked(score, doc_id)));
                if heap.len() > k {
                    heap.pop();
                }
            }
        }
        let mut out: Vec<(f32, u32)> = heap.into_iter().map(|r| (r.0 .0, r.0 .1)).collect();
        out.sort_by(rank_order);
        out.into_iter().map(|(s, d)| (d, s)).collect()
    }

    /// Orders by rank: greater is better.
    struct Ranked(f32, u32);

    impl PartialEq for Ranked {
        fn eq(&self, other: &Self) -> bool {
            self.cmp(other) == std::cmp::Ordering::Equal
        }
    }

    impl Eq for Ranked {}

    impl PartialOrd for Ranked {
        fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
            Some(self.cmp(other))
        }
    }

    impl Ord for Ranked {
        fn cmp(&self, other: &Self) -> std::cmp::Ordering {
            rank_order(&(other.0, other.1), &(self.0, self.1))
        }
    }

    fn fill(index: &Bm25Index, corpus: &[Document]) {
        for d in corpus {
            index.insert(d).unwrap();
        }
    }

    #[test]
    fn three_document_database_query() {
        let index = Bm25Index::create(Relation::new(), IndexingOption::default()).unwrap();
        let a = index.insert(&doc(10, &[("database", 1), ("other", 4)])).unwrap();
        let b = index.insert(&doc(20, &[("database", 2), ("other", 8)])).unwrap();
        let c = index.insert(&doc(30, &[("other", 4)])).unwrap();
        assert_eq!(index.stats().doc_term_cnt, 19);

        let weight = Bm25Weight::new(1, idf(3, 2), 19.0 / 3.0);
        let score_a = weight.score(5, 1);
        let score_b = weight.score(10, 2);
        let (first, second) = if score_a > score_b || (score_a == score_b && a < b) {
            ((a, score_a), (b, score_b))
        } else {
            ((b, score_b), (a, score_a))
        };

        for spilled in [false, true] {
            if spilled {
                index.flush().unwrap();
            }
            let hits = index.topk(&["database"], 2).unwrap();
            assert_eq!(hits.len(), 2);
            assert_eq!(hits[0].0, first.0);
            assert_eq!(hits[1].0, second.0);
            assert!((hits[0].1 - first.1).abs() < 1e-6);
            assert!((hits[1].1 - second.1).abs() < 1e-6);
            assert!(hits[0].1 >= hits[1].1);
            assert!(hits.iter().all(|(d, _)| *d != c));
        }
    }

    #[test]
    fn empty_queries() {
        let index = Bm25Index::create(Relation::new(), small_option()).unwrap();
        assert!(index.topk(&["nothing"], 5).unwrap().is_empty());
        index.insert(&doc(1, &[("a", 1)])).unwrap();
        assert!(index.topk(&[], 5).unwrap().is_empty());
        assert!(index.topk(&["a"], 0).unwrap().is_empty());
        assert!(index.topk(&["missing"], 5).unwrap().is_empty());
        assert!(index.search(&["missing"], 5).unwrap().is_empty());
    }

    #[test]
    fn huge_k_returns_every_match() {
        for wand_seek in [true, false] {
            let index =
                Bm25Index::create(Relation::new(), with_wand(small_option(), wand_seek)).unwrap();
            for row in 0..100u64 {
                index.insert(&doc(row, &[("a", 1 + (row % 5) as u32), ("b", 1)])).unwrap();
            }
            index.spill().unwrap();
            index.insert(&doc(100, &[("a", 9)])).unwrap();
            index.delete_document(3).unwrap();

            let hits = index.topk(&["a"], usize::MAX).unwrap();
            assert_eq!(hits.len(), 100);
            assert_eq!(hits, index.topk(&["a"], 1 << 40).unwrap());
            assert_eq!(hits[0].0, 100);
            assert_eq!(index.topk(&["a", "b"], usize::MAX).unwrap().len(), 100);
            assert!(index.topk(&["missing"], usize::MAX).unwrap().is_empty());
            assert_eq!(index.search(&["b"], usize::MAX).unwrap().len(), 99);
        }
    }

    #[test]
    fn wand_matches_exhaustive_and_reference() {
        let corpus = random_corpus(11, 1500);
        let mut deleted = HashSet::new();
        let mut indexes = Vec::new();
        for (wand, encode) in [
            (true, EncodeOption::DeltaBitpack),
            (false, EncodeOption::DeltaBitpack),
            (true, EncodeOption::Plain),
        ] {
            let option = IndexingOption {
                memtable_spill_threshold: 700,
                segments_per_level: 3,
                encode,
                ..Default::default()
            };
            let index = Bm25Index::create(Relation::new(), with_wand(option, wand)).unwrap();
            fill(&index, &corpus);
            indexes.push(index);
        }
        for doc_id in (0..1500u32).step_by(17) {
            deleted.insert(doc_id);
            for index in &indexes {
                index.delete_document(doc_id).unwrap();
            }
        }
        assert!(indexes[0].stats().segments > 1);
        assert!(indexes[0].stats().memtable_docs > 0);

        let queries: [&[&str]; 6] = [
            &["v0"],
            &["v0", "v1", "v2"],
            &["v29", "v28"],
            &["v3", "v3", "v10"],
            &["v5", "nope"],
            &["nope"],
        ];
        for terms in queries {
            for k in [1, 10, 100, 2000] {
                let expected = reference_topk(&corpus, &deleted, terms, k);
                for index in &indexes {
                    let got = index.topk(terms, k).unwrap();
                    assert_eq!(got.len(), expected.len(), "{:?} k={}", terms, k);
                    for (g, e) in got.iter().zip(&expected) {
                        assert_eq!(g.0, e.0, "{:?} k={}", terms, k);
                        assert!((g.1 - e.1).abs() <= 1e-4 * e.1.abs().max(1.0));
                    }
                }
                // pruned and exhaustive scoring agree bit for bit
                assert_eq!(indexes[0].topk(terms, k).unwrap(), indexes[1].topk(terms, k).unwrap());
            }
        }
    }

    #[test]
    fn search_resolves_row_refs() {
        let index = Bm25Index::create(Relation::new(), small_option()).unwrap();
        for i in 0..100u64 {
            let tf = (i % 4 + 1) as u32;
            index.insert(&doc(1000 + i, &[("t", tf), ("pad", 3)])).unwrap();
        }
        let hits = index.search(&["t"], 5).unwrap();
        assert_eq!(hits.len(), 5);
        for hit in &hits {
            assert_eq!(hit.row_ref, 1000 + hit.doc_id as u64);
        }
        let ranked = index.topk(&["t"], 5).unwrap();
        assert_eq!(
            hits.iter().map(|h| (h.doc_id, h.score)).collect::<Vec<_>>(),
            ranked
        );
    }

    #[test]
    fn rescan_backs_off_without_duplicates() {
        let option = IndexingOption {
            memtable_spill_threshold: 200,
            segments_per_level: 2,
            ..Default::default()
        };
        let index = Bm25Index::create(Relation::new(), option).unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(5);
        for row in 0..500u64 {
            index
                .insert(&doc(row, &[("common", rng.gen_range(1..5)), ("pad", rng.gen_range(1..9))]))
                .unwrap();
        }
        // 2% of the rows pass
        let passes = |hit: &SearchHit| hit.row_ref % 50 == 7;

        let mut offered = HashMap::new();
        let result = index
            .search_filtered(&["common"], 10, 5, |hit| {
                *offered.entry(hit.doc_id).or_insert(0) += 1;
                passes(hit)
            })
            .unwrap();
        assert_eq!(result.hits.len(), 10);
        assert!(result.hits.iter().all(passes));
        assert!(offered.values().all(|&n| n == 1));
        // 5, 10, 20, ..., 640: the last pass sees every document
        assert!(result.rounds <= 8);
        let ids: HashSet<u32> = result.hits.iter().map(|h| h.doc_id).collect();
        assert_eq!(ids.len(), 10);
        for pair in result.hits.windows(2) {
            assert!(rank_order(&(pair[0].score, pair[0].doc_id), &(pair[1].score, pair[1].doc_id)).is_lt());
        }

        let few = index.search_filtered(&["common"], 3, 5, passes).unwrap();
        assert_eq!(few.hits.len(), 3);
        assert_eq!(few.hits[..], result.hits[..3]);

        let none = index.search_filtered(&["common"], 3, 5, |_| false).unwrap();
        assert!(none.hits.is_empty());
        assert!(none.rounds <= 8);
    }

    #[test]
    fn rescan_stops_at_max_limit() {
        let option = IndexingOption {
            query: QueryOption {
                wand_seek: true,
                limit: 4,
                max_limit: 16,
            },
            ..small_option()
        };
        let index = Bm25Index::create(Relation::new(), option).unwrap();
        for row in 0..100u64 {
            index.insert(&doc(row, &[("x", 1)])).unwrap();
        }
        let result = index.search_filtered(&["x"], 5, 0, |_| false).unwrap();
        // 4, 8, 16
        assert_eq!(result.rounds, 3);
    }

    #[test]
    fn interrupted_query_is_cancelled() {
        let index = Bm25Index::create(Relation::new(), small_option()).unwrap();
        index.insert(&doc(1, &[("a", 1)])).unwrap();
        let interrupt = index.interrupt_handle();
        interrupt.store(true, Ordering::Relaxed);
        assert!(matches!(index.topk(&["a"], 1), Err(Bm25Error::Cancelled)));
        interrupt.store(false, Ordering::Relaxed);
        assert_eq!(index.topk(&["a"], 1).unwrap().len(), 1);
    }
}
