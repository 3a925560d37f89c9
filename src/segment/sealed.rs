use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use super::docmap::{DocMapEntry, DocMapReader};
use super::posting::{InvertedSerialize, PostingCursor, PostingSerializer, SkipBlock};
use crate::error::{Bm25Error, Result};
use crate::options::EncodeOption;
use crate::page::{
    page_read, page_write, ChainReader, PageAllocator, PageFlags, PageWriter, Relation,
    SegmentPages, INVALID_BLKNO,
};

pub const SEGMENT_MAGIC: u32 = 0x25424D25;
pub const SEGMENT_VERSION: u32 = 1;

/// Stored at the start of a segment's root page. The root block number is
/// the segment id.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentHeader {
    pub magic: u32,
    pub version: u32,
    pub level: u32,
    pub encode: u32,
    pub next_segment: u32,
    pub page_index_blkno: u32,
    pub num_pages: u32,
    pub num_terms: u32,
    pub num_docs: u32,
    pub min_doc: u32,
    pub max_doc: u32,
    pub terms_offset: u32,
    pub terms_len: u32,
    pub dict_offset: u32,
    pub skip_offset: u32,
    pub num_skip_entries: u32,
    pub docmap_offset: u32,
    _reserved: u32,
    pub total_tokens: u64,
}

unsafe impl Zeroable for SegmentHeader {}
unsafe impl Pod for SegmentHeader {}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DictEntry {
    pub term_offset: u32,
    pub term_len: u32,
    pub skip_start: u32,
    pub block_count: u32,
    pub doc_freq: u32,
    _reserved: u32,
}

unsafe impl Zeroable for DictEntry {}
unsafe impl Pod for DictEntry {}

/// Writes one immutable segment.
///
/// Data stream layout: posting blocks, term strings, dictionary entries,
/// skip entries, document map. The fixed-size regions are written with
/// `write_no_cross` so no entry straddles a page.
pub struct SealedSegmentWriter<'a> {
    allocator: &'a PageAllocator,
    encode: EncodeOption,
    segment_id: u32,
    level: u16,
    data: PageWriter<'a>,
    postings: PostingSerializer,
    terms: Vec<u8>,
    dict: Vec<DictEntry>,
    current_term: Option<(u32, u32)>,
    docmap: Vec<DocMapEntry>,
    total_tokens: u64,
}

impl<'a> SealedSegmentWriter<'a> {
    pub fn new(allocator: &'a PageAllocator, level: u16, encode: EncodeOption) -> Result<Self> {
        let segment_id = {
            let mut root = allocator.alloc(PageFlags::SEGMENT_HEADER, INVALID_BLKNO, level)?;
            let segment_id = root.blkno();
            root.opaque.segment_id = segment_id;
            segment_id
        };
        Ok(Self {
            allocator,
            encode,
            segment_id,
            level,
            data: PageWriter::new(allocator, PageFlags::SEGMENT_DATA, segment_id, level),
            postings: PostingSerializer::new(encode),
            terms: Vec::new(),
            dict: Vec::new(),
            current_term: None,
            docmap: Vec::new(),
            total_tokens: 0,
        })
    }

    pub fn segment_id(&self) -> u32 {
        self.segment_id
    }

    pub fn num_docs(&self) -> usize {
        self.docmap.len()
    }

    /// Registers a document; doc ids must strictly increase.
    pub fn add_doc(&mut self, doc_id: u32, doc_len: u32, row_ref: u64) -> Result<()> {
        if let Some(last) = self.docmap.last() {
            if doc_id <= last.doc_id {
                return Err(Bm25Error::DocIdOutOfOrder {
                    doc_id,
                    last: last.doc_id,
                });
            }
        }
        self.docmap.push(DocMapEntry {
            doc_id,
            doc_len,
            row_ref,
        });
        self.total_tokens += doc_len as u64;
        Ok(())
    }

    fn last_term(&self) -> Option<&[u8]> {
        let last = self.dict.last()?;
        let start = last.term_offset as usize;
        Some(&self.terms[start..start + last.term_len as usize])
    }

    /// Frees every page written so far.
    pub fn abandon(self) -> Result<()> {
        let allocator = self.allocator;
        let mut pages = self.data.finalize();
        pages.push(self.segment_id);
        allocator.free_pages(pages)
    }

    /// Writes the trailing regions and the header. On error every page of
    /// the segment is freed.
    pub fn finalize(mut self) -> Result<SegmentHeader> {
        let mut index_pages = Vec::new();
        let sealed = self.seal(&mut index_pages);
        if sealed.is_err() {
            let allocator = self.allocator;
            let mut pages = self.data.finalize();
            pages.extend(index_pages);
            pages.push(self.segment_id);
            allocator.free_pages(pages)?;
        }
        sealed
    }

    fn seal(&mut self, index_pages: &mut Vec<u32>) -> Result<SegmentHeader> {
        if self.current_term.is_some() {
            self.close_term()?;
        }
        if self.docmap.is_empty() {
            return Err(Bm25Error::InvalidState(
                "cannot seal a segment without documents".into(),
            ));
        }
        let skips = std::mem::replace(&mut self.postings, PostingSerializer::new(self.encode))
            .into_skips();

        let terms_offset = self.data.offset();
        self.data.write(&self.terms)?;
        let dict_offset = self.data.offset();
        for entry in &self.dict {
            self.data.write_no_cross(bytemuck::bytes_of(entry))?;
        }
        let skip_offset = self.data.offset();
        for skip in &skips {
            self.data.write_no_cross(bytemuck::bytes_of(skip))?;
        }
        let docmap_offset = self.data.offset();
        for entry in &self.docmap {
            self.data.write_no_cross(bytemuck::bytes_of(entry))?;
        }
        let data_pages = self.data.pages().to_vec();

        let mut index_writer = PageWriter::new(
            self.allocator,
            PageFlags::PAGE_INDEX,
            self.segment_id,
            self.level,
        );
        let written = index_writer.write(bytemuck::cast_slice(&data_pages));
        *index_pages = index_writer.finalize();
        written?;

        let header = SegmentHeader {
            magic: SEGMENT_MAGIC,
            version: SEGMENT_VERSION,
            level: self.level as u32,
            encode: self.encode.to_raw(),
            next_segment: INVALID_BLKNO,
            page_index_blkno: index_pages.first().copied().unwrap_or(INVALID_BLKNO),
            num_pages: data_pages.len() as u32,
            num_terms: self.dict.len() as u32,
            num_docs: self.docmap.len() as u32,
            min_doc: self.docmap.first().map_or(0, |e| e.doc_id),
            max_doc: self.docmap.last().map_or(0, |e| e.doc_id),
            terms_offset,
            terms_len: self.terms.len() as u32,
            dict_offset,
            skip_offset,
            num_skip_entries: skips.len() as u32,
            docmap_offset,
            _reserved: 0,
            total_tokens: self.total_tokens,
        };
        let mut root = page_write(self.allocator.relation(), self.segment_id)?;
        root.write_pod(&header);
        Ok(header)
    }
}

impl InvertedSerialize for SealedSegmentWriter<'_> {
    fn new_term(&mut self, term: &[u8]) -> Result<()> {
        if self.current_term.is_some() {
            self.close_term()?;
        }
        if let Some(last) = self.last_term() {
            if last >= term {
                return Err(Bm25Error::InvalidState(format!(
                    "terms out of order: {:?} after {:?}",
                    String::from_utf8_lossy(term),
                    String::from_utf8_lossy(last)
                )));
            }
        }
        let term_offset = self.terms.len() as u32;
        self.terms.extend_from_slice(term);
        self.current_term = Some((term_offset, term.len() as u32));
        self.postings.new_term();
        Ok(())
    }

    fn write_doc(&mut self, doc_id: u32, freq: u32, fieldnorm_id: u8) -> Result<()> {
        if self.current_term.is_none() {
            return Err(Bm25Error::InvalidState("posting written outside a term".into()));
        }
        self.postings
            .write_doc(&mut self.data, doc_id, freq, fieldnorm_id)
    }

    fn close_term(&mut self) -> Result<()> {
        let Some((term_offset, term_len)) = self.current_term.take() else {
            return Ok(());
        };
        let location = self.postings.close_term(&mut self.data)?;
        if location.doc_freq == 0 {
            // every posting of the term was purged
            self.terms.truncate(term_offset as usize);
            return Ok(());
        }
        self.dict.push(DictEntry {
            term_offset,
            term_len,
            skip_start: location.skip_start,
            block_count: location.block_count,
            doc_freq: location.doc_freq,
            _reserved: 0,
        });
        Ok(())
    }
}

/// Reads the header of the segment rooted at `root`.
pub fn read_header(relation: &Relation, root: u32) -> Result<SegmentHeader> {
    let page = page_read(relation, root)?;
    page.check(root, PageFlags::SEGMENT_HEADER)
        .map_err(|e| Bm25Error::segment_corrupt(root, e.to_string()))?;
    if page.opaque.segment_id != root {
        return Err(Bm25Error::segment_corrupt(
            root,
            format!("root page claims segment {}", page.opaque.segment_id),
        ));
    }
    let header: SegmentHeader = page
        .read_pod()
        .ok_or_else(|| Bm25Error::segment_corrupt(root, "header is truncated"))?;
    if header.magic != SEGMENT_MAGIC {
        return Err(Bm25Error::segment_corrupt(root, "bad segment magic"));
    }
    if header.version != SEGMENT_VERSION {
        return Err(Bm25Error::segment_corrupt(
            root,
            format!("unsupported segment version {}", header.version),
        ));
    }
    Ok(header)
}

/// Points the segment at `root` to `next` in its level chain.
pub fn set_next_segment(relation: &Relation, root: u32, next: u32) -> Result<()> {
    let mut header = read_header(relation, root)?;
    header.next_segment = next;
    page_write(relation, root)?.write_pod(&header);
    Ok(())
}

pub struct SealedSegmentReader {
    segment_id: u32,
    header: SegmentHeader,
    encode: EncodeOption,
    pages: SegmentPages,
    index_pages: Vec<u32>,
}

impl std::fmt::Debug for SealedSegmentReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedSegmentReader")
            .field("segment_id", &self.segment_id)
            .field("level", &self.header.level)
            .field("num_docs", &self.header.num_docs)
            .field("num_terms", &self.header.num_terms)
            .finish()
    }
}

impl SealedSegmentReader {
    pub fn open(relation: &Relation, root: u32) -> Result<Self> {
        let header = read_header(relation, root)?;
        let corrupt = |reason: String| Bm25Error::segment_corrupt(root, reason);
        let encode = EncodeOption::from_raw(header.encode)
            .ok_or_else(|| corrupt(format!("unknown encoding {}", header.encode)))?;

        let chain = ChainReader::new(relation.clone(), PageFlags::PAGE_INDEX);
        let index_pages = chain
            .blknos(header.page_index_blkno)
            .map_err(|e| corrupt(e.to_string()))?;
        let mut bytes = Vec::new();
        chain
            .read_to_end(header.page_index_blkno, &mut bytes)
            .map_err(|e| corrupt(e.to_string()))?;
        let num_pages = header.num_pages as usize;
        if bytes.len() < num_pages * 4 {
            return Err(corrupt(format!(
                "page index lists {} pages, header says {}",
                bytes.len() / 4,
                num_pages
            )));
        }
        let pages = bytes[..num_pages * 4]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        Ok(Self {
            segment_id: root,
            header,
            encode,
            pages: SegmentPages::new(relation.clone(), root, pages),
            index_pages,
        })
    }

    pub fn segment_id(&self) -> u32 {
        self.segment_id
    }

    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    pub fn level(&self) -> u16 {
        self.header.level as u16
    }

    pub fn encode(&self) -> EncodeOption {
        self.encode
    }

    pub fn num_docs(&self) -> u32 {
        self.header.num_docs
    }

    pub fn num_terms(&self) -> u32 {
        self.header.num_terms
    }

    pub fn total_tokens(&self) -> u64 {
        self.header.total_tokens
    }

    pub fn pages(&self) -> &SegmentPages {
        &self.pages
    }

    /// Every page owned by the segment: root, data and page index.
    pub fn all_pages(&self) -> Vec<u32> {
        let mut pages = Vec::with_capacity(1 + self.pages.pages().len() + self.index_pages.len());
        pages.push(self.segment_id);
        pages.extend_from_slice(self.pages.pages());
        pages.extend_from_slice(&self.index_pages);
        pages
    }

    fn corrupt(&self, reason: impl Into<String>) -> Bm25Error {
        Bm25Error::segment_corrupt(self.segment_id, reason)
    }

    pub fn dict_entry(&self, ord: u32) -> Result<DictEntry> {
        if ord >= self.header.num_terms {
            return Err(self.corrupt(format!("term ordinal {} out of range", ord)));
        }
        self.pages.read_entry(self.header.dict_offset, ord)
    }

    pub fn term(&self, entry: &DictEntry) -> Result<Vec<u8>> {
        if entry.term_offset as u64 + entry.term_len as u64 > self.header.terms_len as u64 {
            return Err(self.corrupt("term string out of range"));
        }
        let mut term = vec![0; entry.term_len as usize];
        self.pages
            .read_at(self.header.terms_offset + entry.term_offset, &mut term)?;
        Ok(term)
    }

    pub fn find_term(&self, term: &[u8]) -> Result<Option<DictEntry>> {
        let (mut lo, mut hi) = (0, self.header.num_terms);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let entry = self.dict_entry(mid)?;
            match self.term(&entry)?.as_slice().cmp(term) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Ok(Some(entry)),
            }
        }
        Ok(None)
    }

    /// Every term with its dictionary entry, in term order.
    pub fn terms(&self) -> Result<Vec<(Vec<u8>, DictEntry)>> {
        let entries: Vec<DictEntry> =
            self.pages
                .read_entries(self.header.dict_offset, 0, self.header.num_terms)?;
        let mut strings = vec![0; self.header.terms_len as usize];
        self.pages.read_at(self.header.terms_offset, &mut strings)?;
        entries
            .into_iter()
            .map(|entry| {
                let start = entry.term_offset as usize;
                let term = strings
                    .get(start..start + entry.term_len as usize)
                    .ok_or_else(|| self.corrupt("term string out of range"))?;
                Ok((term.to_vec(), entry))
            })
            .collect()
    }

    pub fn postings(
        self: &Arc<Self>,
        term: &[u8],
        load_row_refs: bool,
    ) -> Result<Option<PostingCursor>> {
        match self.find_term(term)? {
            Some(entry) => Ok(Some(PostingCursor::new(self.clone(), entry, load_row_refs)?)),
            None => Ok(None),
        }
    }

    pub fn read_skips(&self, start: u32, count: u32) -> Result<Vec<SkipBlock>> {
        if start as u64 + count as u64 > self.header.num_skip_entries as u64 {
            return Err(self.corrupt("skip entries out of range"));
        }
        self.pages.read_entries(self.header.skip_offset, start, count)
    }

    pub fn docmap(&self) -> DocMapReader<'_> {
        DocMapReader::new(
            &self.pages,
            self.segment_id,
            self.header.docmap_offset,
            self.header.num_docs,
        )
    }

    pub fn contains_doc(&self, doc_id: u32) -> bool {
        self.header.min_doc <= doc_id && doc_id <= self.header.max_doc
    }

    pub fn doc_entry(&self, doc_id: u32) -> Result<Option<DocMapEntry>> {
        if !self.contains_doc(doc_id) {
            return Ok(None);
        }
        self.docmap().find(doc_id)
    }

    pub fn resolve_row_ref(&self, doc_id: u32) -> Result<Option<u64>> {
        Ok(self.doc_entry(doc_id)?.map(|e| e.row_ref))
    }

    pub fn resolve_row_refs(&self, docids: &[u32]) -> Result<Vec<u64>> {
        self.docmap().resolve_sorted(docids)
    }
}
