//! Row refs of documents that so far only live in the memtable.
//!
//! The memtable is not durable. Each document is appended here as a vint32
//! doc id and a vint64 row ref, so after a crash the embedding system
//! learns which rows to feed again. The log is dropped whenever the
//! memtable is spilled.

use crate::error::{Bm25Error, Result};
use crate::page::{
    page_read, page_write, ChainReader, PageAllocator, PageFlags, Relation, INVALID_BLKNO,
};
use crate::utils::vint::{decode_vint32, decode_vint64, encode_vint32, encode_vint64};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRow {
    pub doc_id: u32,
    pub row_ref: u64,
}

/// Where the log ended, for [`PendingLog::rollback`].
#[derive(Debug, Clone, Copy)]
pub struct PendingMark {
    log: PendingLog,
    lower: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingLog {
    head: u32,
    tail: u32,
    len: u64,
}

impl Default for PendingLog {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingLog {
    pub fn new() -> Self {
        Self {
            head: INVALID_BLKNO,
            tail: INVALID_BLKNO,
            len: 0,
        }
    }

    pub fn head(&self) -> u32 {
        self.head
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends one entry. On error the log is unchanged.
    pub fn append(&mut self, allocator: &PageAllocator, row: PendingRow) -> Result<()> {
        let mut buf = Vec::with_capacity(15);
        encode_vint32(row.doc_id, &mut buf)?;
        encode_vint64(row.row_ref, &mut buf)?;

        if self.tail == INVALID_BLKNO {
            let mut page = allocator.alloc(PageFlags::PENDING_ROWS, INVALID_BLKNO, 0)?;
            Self::push(&mut page, &buf);
            self.head = page.blkno();
            self.tail = page.blkno();
        } else {
            let mut page = page_write(allocator.relation(), self.tail)?;
            if page.freespace_mut().len() < buf.len() {
                let mut next = allocator.alloc(PageFlags::PENDING_ROWS, INVALID_BLKNO, 0)?;
                Self::push(&mut next, &buf);
                page.opaque.next_blkno = next.blkno();
                self.tail = next.blkno();
            } else {
                Self::push(&mut page, &buf);
            }
        }
        self.len += 1;
        Ok(())
    }

    fn push(page: &mut crate::page::PageData, bytes: &[u8]) {
        page.freespace_mut()[..bytes.len()].copy_from_slice(bytes);
        page.header.lower += bytes.len() as u16;
    }

    pub fn mark(&self, relation: &Relation) -> Result<PendingMark> {
        let lower = if self.tail == INVALID_BLKNO {
            0
        } else {
            page_read(relation, self.tail)?.header.lower
        };
        Ok(PendingMark { log: *self, lower })
    }

    /// Drops every entry appended since `mark` was taken.
    pub fn rollback(&mut self, allocator: &PageAllocator, mark: PendingMark) -> Result<()> {
        if mark.log.tail == INVALID_BLKNO {
            return self.clear(allocator);
        }
        let next = {
            let mut page = page_write(allocator.relation(), mark.log.tail)?;
            page.header.lower = mark.lower;
            std::mem::replace(&mut page.opaque.next_blkno, INVALID_BLKNO)
        };
        if next != INVALID_BLKNO {
            let pages = ChainReader::new(allocator.relation().clone(), PageFlags::PENDING_ROWS)
                .blknos(next)?;
            allocator.free_pages(pages)?;
        }
        *self = mark.log;
        Ok(())
    }

    /// Frees the chain; the log starts over empty.
    pub fn clear(&mut self, allocator: &PageAllocator) -> Result<()> {
        if self.head != INVALID_BLKNO {
            let pages = ChainReader::new(allocator.relation().clone(), PageFlags::PENDING_ROWS)
                .blknos(self.head)?;
            allocator.free_pages(pages)?;
        }
        *self = Self::new();
        Ok(())
    }
}

/// Every entry in the chain starting at `head`, in append order.
pub fn read_pending_rows(relation: &Relation, head: u32) -> Result<Vec<PendingRow>> {
    if head == INVALID_BLKNO {
        return Ok(Vec::new());
    }
    let mut bytes = Vec::new();
    ChainReader::new(relation.clone(), PageFlags::PENDING_ROWS).read_to_end(head, &mut bytes)?;
    let mut data = bytes.as_slice();
    let mut rows = Vec::new();
    let corrupt = || Bm25Error::page_corrupt(head, "malformed pending row");
    while !data.is_empty() {
        let doc_id = decode_vint32(&mut data).ok_or_else(corrupt)?;
        let row_ref = decode_vint64(&mut data).ok_or_else(corrupt)?;
        rows.push(PendingRow { doc_id, row_ref });
    }
    Ok(rows)
}

pub fn pending_pages(relation: &Relation, head: u32) -> Result<Vec<u32>> {
    if head == INVALID_BLKNO {
        return Ok(Vec::new());
    }
    ChainReader::new(relation.clone(), PageFlags::PENDING_ROWS).blknos(head)
}
