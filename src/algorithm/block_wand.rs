use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Bm25Error, Result};
use crate::segment::delete::DeleteBitmap;
use crate::segment::field_norm::id_to_fieldnorm;
use crate::segment::posting::{PostingIterator, TERMINATED_DOC};
use crate::utils::topk_computer::TopKComputer;
use crate::weight::Bm25Weight;

// Upper bounds are summed in doc order while exact scores are summed in term
// order, so they may round differently. A candidate is pruned only when its
// bound is below the threshold by more than this relative margin.
const BOUND_SLACK: f32 = 1e-5;

pub struct Scorer<P> {
    pub posting: P,
    pub weight: Bm25Weight,
    pub max_score: f32,
    /// Position of the term in the query; exact scores are summed in this order.
    pub term_ord: usize,
}

impl<P: PostingIterator> Scorer<P> {
    pub fn new(posting: P, weight: Bm25Weight, term_ord: usize) -> Self {
        let max_score = posting.max_score(&weight);
        Self {
            posting,
            weight,
            max_score,
            term_ord,
        }
    }

    fn score(&self) -> f32 {
        let len = id_to_fieldnorm(self.posting.fieldnorm_id());
        self.weight.score(len, self.posting.freq())
    }
}

#[inline]
fn competitive(bound: f32, threshold: f32) -> bool {
    bound * (1.0 + BOUND_SLACK) >= threshold
}

/// Doc id right after `doc`, saturating at [`TERMINATED_DOC`].
#[inline]
fn next_doc_after(doc: u32) -> u32 {
    if TERMINATED_DOC - doc <= 1 {
        TERMINATED_DOC
    } else {
        doc + 1
    }
}

fn check_interrupt(interrupt: &AtomicBool) -> Result<()> {
    if interrupt.load(Ordering::Relaxed) {
        return Err(Bm25Error::Cancelled);
    }
    Ok(())
}

/// Exact score of the document every scorer in `scorers` sits on.
fn exact_score<P: PostingIterator>(scorers: &mut [Scorer<P>]) -> f32 {
    scorers.sort_unstable_by_key(|s| s.term_ord);
    scorers.iter().fold(0.0, |acc, s| acc + s.score())
}

fn sort_scorers<P: PostingIterator>(scorers: &mut Vec<Scorer<P>>) {
    scorers.retain(|s| s.posting.docid() != TERMINATED_DOC);
    scorers.sort_unstable_by_key(|s| (s.posting.docid(), s.term_ord));
}

/// Block-Max WAND over one source. `computer` may already hold results of
/// other sources; its threshold prunes this one too.
pub fn block_wand<P: PostingIterator>(
    mut scorers: Vec<Scorer<P>>,
    deletes: &DeleteBitmap,
    computer: &mut TopKComputer,
    interrupt: &AtomicBool,
) -> Result<()> {
    for scorer in &mut scorers {
        scorer.posting.advance()?;
    }
    sort_scorers(&mut scorers);

    while let Some((before_pivot_len, pivot_len, pivot_doc)) =
        find_pivot_doc(&scorers, computer.threshold())
    {
        check_interrupt(interrupt)?;

        let block_max_score_upperbound: f32 = scorers[..pivot_len]
            .iter_mut()
            .map(|scorer| {
                scorer.posting.shallow_seek(pivot_doc);
                scorer.posting.block_max_score(&scorer.weight)
            })
            .sum();

        if !competitive(block_max_score_upperbound, computer.threshold()) {
            block_max_was_too_low_advance_one_scorer(&mut scorers, pivot_len)?;
            continue;
        }

        if !align_scorers(&mut scorers, pivot_doc, before_pivot_len)? {
            continue;
        }

        if !deletes.is_deleted(pivot_doc) {
            let score = exact_score(&mut scorers[..pivot_len]);
            computer.push(score, pivot_doc);
        }

        advance_all_scorers_on_pivot(&mut scorers, pivot_len)?;
    }
    Ok(())
}

/// Scores every posting of every term. Same results as [`block_wand`],
/// used when block-max pruning is turned off and as its reference.
pub fn exhaustive<P: PostingIterator>(
    mut scorers: Vec<Scorer<P>>,
    deletes: &DeleteBitmap,
    computer: &mut TopKComputer,
    interrupt: &AtomicBool,
) -> Result<()> {
    for scorer in &mut scorers {
        scorer.posting.advance()?;
    }
    scorers.sort_unstable_by_key(|s| s.term_ord);
    loop {
        let doc = scorers
            .iter()
            .map(|s| s.posting.docid())
            .min()
            .unwrap_or(TERMINATED_DOC);
        if doc == TERMINATED_DOC {
            return Ok(());
        }
        check_interrupt(interrupt)?;
        if !deletes.is_deleted(doc) {
            let score = scorers
                .iter()
                .filter(|s| s.posting.docid() == doc)
                .fold(0.0, |acc, s| acc + s.score());
            computer.push(score, doc);
        }
        for scorer in scorers.iter_mut().filter(|s| s.posting.docid() == doc) {
            scorer.posting.advance()?;
        }
    }
}

/// Scans scorers in doc order, accumulating their list-wide maxima until
/// the sum could enter the top-k. Returns the number of scorers before the
/// pivot, the number of scorers up to and including every scorer on the
/// pivot doc, and the pivot doc.
fn find_pivot_doc<P: PostingIterator>(
    scorers: &[Scorer<P>],
    threshold: f32,
) -> Option<(usize, usize, u32)> {
    let mut max_score = 0.0;
    let mut before_pivot_len = 0;
    let mut pivot_doc = TERMINATED_DOC;
    while before_pivot_len < scorers.len() {
        let scorer = &scorers[before_pivot_len];
        max_score += scorer.max_score;
        if competitive(max_score, threshold) {
            pivot_doc = scorer.posting.docid();
            break;
        }
        before_pivot_len += 1;
    }
    if pivot_doc == TERMINATED_DOC {
        return None;
    }

    let mut pivot_len = before_pivot_len + 1;
    pivot_len += scorers[pivot_len..]
        .iter()
        .take_while(|scorer| scorer.posting.docid() == pivot_doc)
        .count();
    Some((before_pivot_len, pivot_len, pivot_doc))
}

fn block_max_was_too_low_advance_one_scorer<P: PostingIterator>(
    scorers: &mut Vec<Scorer<P>>,
    pivot_len: usize,
) -> Result<()> {
    let mut scorer_to_seek = pivot_len - 1;
    let mut global_max_score = scorers[scorer_to_seek].max_score;
    let mut doc_to_seek_after = scorers[scorer_to_seek].posting.last_doc_in_block();

    for scorer_ord in (0..pivot_len - 1).rev() {
        let scorer = &scorers[scorer_ord];
        doc_to_seek_after = doc_to_seek_after.min(scorer.posting.last_doc_in_block());
        if scorer.max_score > global_max_score {
            global_max_score = scorer.max_score;
            scorer_to_seek = scorer_ord;
        }
    }
    let mut target = next_doc_after(doc_to_seek_after);

    for scorer in &scorers[pivot_len..] {
        target = target.min(scorer.posting.docid());
    }
    scorers[scorer_to_seek].posting.seek(target)?;
    sort_scorers(scorers);
    Ok(())
}

/// Moves the scorers before the pivot onto the pivot doc. Returns false if
/// one of them jumps past it; the scorers are then re-sorted.
fn align_scorers<P: PostingIterator>(
    scorers: &mut Vec<Scorer<P>>,
    pivot_doc: u32,
    before_pivot_len: usize,
) -> Result<bool> {
    for i in (0..before_pivot_len).rev() {
        let new_doc = scorers[i].posting.seek(pivot_doc)?;
        if new_doc != pivot_doc {
            sort_scorers(scorers);
            return Ok(false);
        }
    }
    Ok(true)
}

fn advance_all_scorers_on_pivot<P: PostingIterator>(
    scorers: &mut Vec<Scorer<P>>,
    pivot_len: usize,
) -> Result<()> {
    for scorer in &mut scorers[..pivot_len] {
        scorer.posting.advance()?;
    }
    sort_scorers(scorers);
    Ok(())
}
