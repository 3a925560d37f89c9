use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::error::Result;

use super::delete::DeleteBitmap;
use super::posting::{InvertedSerialize, PostingCursor, PostingIterator, TERMINATED_DOC};
use super::sealed::{DictEntry, SealedSegmentReader, SealedSegmentWriter};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub docs: u64,
    pub tokens: u64,
    pub terms: u64,
    pub postings: u64,
    pub purged_docs: u64,
}

/// Merges `inputs` into `writer`, dropping every document marked in
/// `deletes`. Terms come out of a heap over the input dictionaries and each
/// term's postings out of a heap over the input cursors, so both streams
/// stay sorted whatever the order of the inputs.
pub fn merge_segments(
    inputs: &[Arc<SealedSegmentReader>],
    writer: &mut SealedSegmentWriter<'_>,
    deletes: &DeleteBitmap,
) -> Result<MergeStats> {
    let mut stats = MergeStats::default();

    let mut docs = Vec::new();
    for input in inputs {
        docs.extend(input.docmap().read_all()?);
    }
    docs.sort_unstable_by_key(|entry| entry.doc_id);
    for entry in docs {
        if deletes.is_deleted(entry.doc_id) {
            stats.purged_docs += 1;
            continue;
        }
        writer.add_doc(entry.doc_id, entry.doc_len, entry.row_ref)?;
        stats.docs += 1;
        stats.tokens += entry.doc_len as u64;
    }
    if stats.docs == 0 {
        return Ok(stats);
    }

    let dictionaries: Vec<Vec<(Vec<u8>, DictEntry)>> = inputs
        .iter()
        .map(|input| input.terms())
        .collect::<Result<_>>()?;
    let mut terms = BinaryHeap::new();
    for (input, dictionary) in dictionaries.iter().enumerate() {
        if let Some((term, _)) = dictionary.first() {
            terms.push(Reverse((term.as_slice(), input, 0usize)));
        }
    }

    let mut cursors: Vec<PostingCursor> = Vec::new();
    while let Some(Reverse((term, input, ord))) = terms.pop() {
        let mut group = vec![(input, ord)];
        loop {
            let same = matches!(terms.peek(), Some(Reverse((other, _, _))) if *other == term);
            if !same {
                break;
            }
            if let Some(Reverse((_, input, ord))) = terms.pop() {
                group.push((input, ord));
            }
        }
        cursors.clear();
        for (input, ord) in group {
            let entry = dictionaries[input][ord].1;
            cursors.push(PostingCursor::new(inputs[input].clone(), entry, false)?);
            if let Some((next, _)) = dictionaries[input].get(ord + 1) {
                terms.push(Reverse((next.as_slice(), input, ord + 1)));
            }
        }

        writer.new_term(term)?;
        stats.postings += merge_postings(&mut cursors, writer, deletes)?;
        writer.close_term()?;
        stats.terms += 1;
    }
    Ok(stats)
}

fn merge_postings(
    cursors: &mut [PostingCursor],
    writer: &mut SealedSegmentWriter<'_>,
    deletes: &DeleteBitmap,
) -> Result<u64> {
    let mut heap = BinaryHeap::with_capacity(cursors.len());
    for (i, cursor) in cursors.iter_mut().enumerate() {
        let doc = cursor.advance()?;
        if doc != TERMINATED_DOC {
            heap.push(Reverse((doc, i)));
        }
    }
    let mut written = 0;
    while let Some(Reverse((doc, i))) = heap.pop() {
        let cursor = &mut cursors[i];
        if !deletes.is_deleted(doc) {
            writer.write_doc(doc, cursor.freq(), cursor.fieldnorm_id())?;
            written += 1;
        }
        let next = cursor.advance()?;
        if next != TERMINATED_DOC {
            heap.push(Reverse((next, i)));
        }
    }
    Ok(written)
}
