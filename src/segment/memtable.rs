use std::collections::HashMap;

use arrayvec::ArrayVec;

use crate::error::{Bm25Error, Result};
use crate::options::EncodeOption;
use crate::page::PageAllocator;
use crate::utils::arena::{ArenaAddr, PostingArena};
use crate::utils::vint::{decode_vint32, encode_vint32};
use crate::weight::Bm25Weight;

use super::field_norm::fieldnorm_to_id;
use super::posting::{
    InvertedSerialize, PostingIterator, SkipBlock, COMPRESSION_BLOCK_SIZE, TERMINATED_DOC,
};
use super::sealed::SealedSegmentWriter;

// slab header: next slab (u32), used bytes (u16), capacity (u16)
const SLAB_HEADER: usize = 8;
const MIN_SLAB: usize = 16;
const MAX_SLAB: usize = 1024;
const MAX_POSTING_BYTES: usize = 10;

/// One term's postings, stored as vint (doc delta, tf) pairs in a chain of
/// arena slabs. A posting never straddles two slabs.
#[derive(Debug, Clone, Copy)]
struct TermPostings {
    head: ArenaAddr,
    tail: ArenaAddr,
    last_doc: u32,
    doc_freq: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemDoc {
    pub doc_id: u32,
    pub len: u32,
    pub row_ref: u64,
}

/// A segment written from a memtable, not yet linked into any level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpilledSegment {
    pub root: u32,
    pub docs: u64,
    pub tokens: u64,
    pub postings: u64,
}

/// Sums duplicate terms and drops zero frequencies, sorted by term.
fn merge_terms<S: AsRef<str>>(term_frequencies: &[(S, u32)]) -> Vec<(&str, u32)> {
    let mut merged: Vec<(&str, u32)> = term_frequencies
        .iter()
        .filter(|(_, tf)| *tf > 0)
        .map(|(term, tf)| (term.as_ref(), *tf))
        .collect();
    merged.sort_unstable_by(|a, b| a.0.cmp(b.0));
    merged.dedup_by(|next, kept| {
        if next.0 == kept.0 {
            kept.1 = kept.1.saturating_add(next.1);
            true
        } else {
            false
        }
    });
    merged
}

/// A posting as stored in a slab: vint doc delta, vint `tf - 1`.
fn encode_posting(delta: u32, tf: u32) -> Result<ArrayVec<u8, MAX_POSTING_BYTES>> {
    let mut posting = ArrayVec::new();
    encode_vint32(delta, &mut posting)?;
    encode_vint32(tf - 1, &mut posting)?;
    Ok(posting)
}

/// The mutable write buffer: term -> postings, doc id -> (length, row ref).
pub struct Memtable {
    threshold: usize,
    arena: PostingArena,
    terms: HashMap<String, TermPostings>,
    docs: Vec<MemDoc>,
    postings: usize,
    total_tokens: u64,
}

impl Memtable {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            arena: PostingArena::new(),
            terms: HashMap::new(),
            docs: Vec::new(),
            postings: 0,
            total_tokens: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn num_docs(&self) -> usize {
        self.docs.len()
    }

    pub fn num_postings(&self) -> usize {
        self.postings
    }

    pub fn num_terms(&self) -> usize {
        self.terms.len()
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_tokens
    }

    pub fn arena_bytes(&self) -> usize {
        self.arena.allocated_bytes()
    }

    pub fn docs(&self) -> &[MemDoc] {
        &self.docs
    }

    pub fn doc(&self, doc_id: u32) -> Option<MemDoc> {
        self.docs
            .binary_search_by_key(&doc_id, |d| d.doc_id)
            .ok()
            .map(|i| self.docs[i])
    }

    /// Adds a document. Duplicate terms are summed and zero frequencies
    /// dropped. Nothing is inserted when the result is an error.
    pub fn insert<S: AsRef<str>>(
        &mut self,
        doc_id: u32,
        term_frequencies: &[(S, u32)],
        doc_len: u32,
        row_ref: u64,
    ) -> Result<()> {
        if doc_id == TERMINATED_DOC {
            return Err(Bm25Error::DocIdExhausted);
        }
        if let Some(last) = self.docs.last() {
            if doc_id <= last.doc_id {
                return Err(Bm25Error::DocIdOutOfOrder {
                    doc_id,
                    last: last.doc_id,
                });
            }
        }

        let merged = merge_terms(term_frequencies);
        if !self.fits(merged.len()) {
            return Err(Bm25Error::CapacityExceeded {
                postings: self.postings,
                limit: self.threshold,
            });
        }

        let encoded = merged
            .iter()
            .map(|&(term, tf)| encode_posting(doc_id - self.last_doc(term), tf))
            .collect::<Result<Vec<_>>>()?;
        for ((term, _), posting) in merged.iter().zip(encoded) {
            self.append(term, doc_id, &posting);
        }
        self.postings += merged.len();
        self.docs.push(MemDoc {
            doc_id,
            len: doc_len,
            row_ref,
        });
        self.total_tokens += doc_len as u64;
        Ok(())
    }

    /// Whether a document with `term_frequencies` is accepted without a
    /// spill.
    pub fn has_room<S: AsRef<str>>(&self, term_frequencies: &[(S, u32)]) -> bool {
        self.fits(merge_terms(term_frequencies).len())
    }

    fn fits(&self, postings: usize) -> bool {
        self.postings == 0 || self.postings + postings <= self.threshold
    }

    fn last_doc(&self, term: &str) -> u32 {
        self.terms.get(term).map_or(0, |entry| entry.last_doc)
    }

    fn append(&mut self, term: &str, doc_id: u32, posting: &[u8]) {
        let entry = match self.terms.get(term) {
            Some(entry) => *entry,
            None => {
                let slab = self.alloc_slab(MIN_SLAB);
                let entry = TermPostings {
                    head: slab,
                    tail: slab,
                    last_doc: 0,
                    doc_freq: 0,
                };
                self.terms.insert(term.to_owned(), entry);
                entry
            }
        };
        let len = posting.len();

        let mut tail = entry.tail;
        let (mut used, mut cap) = self.slab_header(tail);
        if used + len > cap {
            let next_cap = (cap * 2).min(MAX_SLAB);
            let next = self.alloc_slab(next_cap);
            self.set_slab_next(tail, next);
            tail = next;
            used = 0;
            cap = next_cap;
        }
        let slab = self.arena.slice_mut(tail, SLAB_HEADER + cap);
        slab[SLAB_HEADER + used..SLAB_HEADER + used + len].copy_from_slice(posting);
        slab[4..6].copy_from_slice(&((used + len) as u16).to_le_bytes());

        if let Some(entry) = self.terms.get_mut(term) {
            entry.tail = tail;
            entry.last_doc = doc_id;
            entry.doc_freq += 1;
        }
    }

    fn alloc_slab(&mut self, cap: usize) -> ArenaAddr {
        let addr = self.arena.alloc(SLAB_HEADER + cap);
        let slab = self.arena.slice_mut(addr, SLAB_HEADER);
        slab[..4].copy_from_slice(&u32::MAX.to_le_bytes());
        slab[4..6].copy_from_slice(&0u16.to_le_bytes());
        slab[6..8].copy_from_slice(&(cap as u16).to_le_bytes());
        addr
    }

    fn slab_header(&self, addr: ArenaAddr) -> (usize, usize) {
        let h = self.arena.slice(addr, SLAB_HEADER);
        let used = u16::from_le_bytes([h[4], h[5]]) as usize;
        let cap = u16::from_le_bytes([h[6], h[7]]) as usize;
        (used, cap)
    }

    fn set_slab_next(&mut self, addr: ArenaAddr, next: ArenaAddr) {
        let raw = next.to_raw();
        self.arena.slice_mut(addr, SLAB_HEADER)[..4].copy_from_slice(&raw.to_le_bytes());
    }

    fn decode_term(&self, entry: &TermPostings) -> Result<(Vec<u32>, Vec<u32>)> {
        let mut docids = Vec::with_capacity(entry.doc_freq as usize);
        let mut freqs = Vec::with_capacity(entry.doc_freq as usize);
        let corrupt = || Bm25Error::InvalidState("memtable posting slab is malformed".into());
        let mut addr = entry.head;
        let mut doc = 0u32;
        while !addr.is_null() {
            let (used, cap) = self.slab_header(addr);
            let slab = self.arena.slice(addr, SLAB_HEADER + cap);
            let mut data = &slab[SLAB_HEADER..SLAB_HEADER + used];
            while !data.is_empty() {
                let delta = decode_vint32(&mut data).ok_or_else(corrupt)?;
                let tf = decode_vint32(&mut data).ok_or_else(corrupt)?;
                doc = if docids.is_empty() { delta } else { doc + delta };
                docids.push(doc);
                freqs.push(tf + 1);
            }
            addr = ArenaAddr::from_raw(u32::from_le_bytes([slab[0], slab[1], slab[2], slab[3]]));
        }
        if docids.len() != entry.doc_freq as usize {
            return Err(corrupt());
        }
        Ok((docids, freqs))
    }

    fn fieldnorm_id_of(&self, doc_id: u32) -> u8 {
        self.doc(doc_id).map_or(0, |d| fieldnorm_to_id(d.len))
    }

    /// Owned snapshot of one term's postings.
    pub fn postings(&self, term: &str) -> Result<Option<MemtablePostings>> {
        let Some(entry) = self.terms.get(term) else {
            return Ok(None);
        };
        let (docids, freqs) = self.decode_term(entry)?;
        let fieldnorm_ids = docids.iter().map(|&d| self.fieldnorm_id_of(d)).collect();
        Ok(Some(MemtablePostings::new(docids, freqs, fieldnorm_ids)))
    }

    /// Snapshots for every term, aligned with `terms`.
    pub fn search(&self, terms: &[&str]) -> Result<Vec<Option<MemtablePostings>>> {
        terms.iter().map(|term| self.postings(term)).collect()
    }

    /// Releases every posting and document. The arena is dropped and
    /// recreated, so peak memory does not carry over between spills.
    pub fn clear(&mut self) {
        self.arena.reset();
        self.terms = HashMap::new();
        self.docs = Vec::new();
        self.postings = 0;
        self.total_tokens = 0;
    }

    /// Feeds documents and sorted terms into `writer`, skipping documents
    /// for which `is_deleted` holds. Returns the number of documents and
    /// postings written.
    pub fn serialize(
        &self,
        writer: &mut SealedSegmentWriter<'_>,
        is_deleted: impl Fn(u32) -> bool,
    ) -> Result<(u64, u64, u64)> {
        let mut docs = 0;
        let mut tokens = 0;
        for doc in self.docs.iter().filter(|d| !is_deleted(d.doc_id)) {
            writer.add_doc(doc.doc_id, doc.len, doc.row_ref)?;
            docs += 1;
            tokens += doc.len as u64;
        }
        if docs == 0 {
            return Ok((0, 0, 0));
        }

        let mut terms: Vec<(&String, &TermPostings)> = self.terms.iter().collect();
        terms.sort_unstable_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
        let mut postings = 0;
        for (term, entry) in terms {
            let (docids, freqs) = self.decode_term(entry)?;
            writer.new_term(term.as_bytes())?;
            for (&doc_id, &tf) in docids.iter().zip(&freqs) {
                if is_deleted(doc_id) {
                    continue;
                }
                writer.write_doc(doc_id, tf, self.fieldnorm_id_of(doc_id))?;
                postings += 1;
            }
            writer.close_term()?;
        }
        Ok((docs, tokens, postings))
    }

    /// Writes the memtable as one unlinked segment at `level`, or nothing
    /// when every document is deleted.
    pub fn write_segment(
        &self,
        allocator: &PageAllocator,
        level: u16,
        encode: EncodeOption,
        is_deleted: impl Fn(u32) -> bool,
    ) -> Result<Option<SpilledSegment>> {
        if self.is_empty() {
            return Ok(None);
        }
        let mut writer = SealedSegmentWriter::new(allocator, level, encode)?;
        let root = writer.segment_id();
        let (docs, tokens, postings) = match self.serialize(&mut writer, is_deleted) {
            Ok(counts) => counts,
            Err(e) => {
                writer.abandon()?;
                return Err(e);
            }
        };
        if docs == 0 {
            writer.abandon()?;
            return Ok(None);
        }
        writer.finalize()?;
        tracing::debug!(segment = root, docs, postings, "spilled memtable");
        Ok(Some(SpilledSegment {
            root,
            docs,
            tokens,
            postings,
        }))
    }
}

/// A memtable posting list copied out under the memtable lock, cut into
/// virtual blocks of [`COMPRESSION_BLOCK_SIZE`] postings for block-max
/// pruning.
#[derive(Debug, Clone)]
pub struct MemtablePostings {
    docids: Vec<u32>,
    freqs: Vec<u32>,
    fieldnorm_ids: Vec<u8>,
    blocks: Vec<SkipBlock>,
    pos: usize,
    started: bool,
    window: usize,
}

impl MemtablePostings {
    fn new(docids: Vec<u32>, freqs: Vec<u32>, fieldnorm_ids: Vec<u8>) -> Self {
        let blocks = docids
            .chunks(COMPRESSION_BLOCK_SIZE)
            .zip(freqs.chunks(COMPRESSION_BLOCK_SIZE))
            .zip(fieldnorm_ids.chunks(COMPRESSION_BLOCK_SIZE))
            .map(|((d, f), n)| SkipBlock {
                last_doc: d[d.len() - 1],
                blockwand_tf: f.iter().copied().max().unwrap_or(0),
                blockwand_fieldnorm_id: n.iter().copied().min().unwrap_or(0),
                doc_cnt: d.len() as u8,
                ..Default::default()
            })
            .collect();
        Self {
            docids,
            freqs,
            fieldnorm_ids,
            blocks,
            pos: 0,
            started: false,
            window: 0,
        }
    }

    fn positioned(&self) -> bool {
        self.started && self.pos < self.docids.len()
    }

    pub fn len(&self) -> usize {
        self.docids.len()
    }
}

impl PostingIterator for MemtablePostings {
    fn docid(&self) -> u32 {
        if self.positioned() {
            self.docids[self.pos]
        } else {
            TERMINATED_DOC
        }
    }

    fn advance(&mut self) -> Result<u32> {
        if !self.started {
            self.started = true;
        } else if self.pos < self.docids.len() {
            self.pos += 1;
        }
        self.window = self.pos / COMPRESSION_BLOCK_SIZE;
        Ok(self.docid())
    }

    fn seek(&mut self, target: u32) -> Result<u32> {
        if self.positioned() && self.docids[self.pos] >= target {
            return Ok(self.docid());
        }
        self.started = true;
        self.pos += self.docids[self.pos.min(self.docids.len())..].partition_point(|&d| d < target);
        self.window = self.pos / COMPRESSION_BLOCK_SIZE;
        Ok(self.docid())
    }

    fn shallow_seek(&mut self, target: u32) -> bool {
        let first = if self.started {
            self.pos / COMPRESSION_BLOCK_SIZE
        } else {
            0
        };
        let first = first.min(self.blocks.len());
        self.window = first + self.blocks[first..].partition_point(|b| b.last_doc < target);
        self.window < self.blocks.len()
    }

    fn freq(&self) -> u32 {
        if self.positioned() {
            self.freqs[self.pos]
        } else {
            0
        }
    }

    fn fieldnorm_id(&self) -> u8 {
        if self.positioned() {
            self.fieldnorm_ids[self.pos]
        } else {
            0
        }
    }

    fn block_max_score(&self, weight: &Bm25Weight) -> f32 {
        self.blocks
            .get(self.window)
            .map_or(0.0, |b| b.block_max_score(weight))
    }

    fn last_doc_in_block(&self) -> u32 {
        self.blocks.get(self.window).map_or(TERMINATED_DOC, |b| b.last_doc)
    }

    fn max_score(&self, weight: &Bm25Weight) -> f32 {
        self.blocks
            .iter()
            .map(|b| b.block_max_score(weight))
            .fold(0.0, f32::max)
    }

    fn doc_freq(&self) -> u32 {
        self.docids.len() as u32
    }
}
