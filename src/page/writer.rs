use super::{bm25_page_size, PageAllocator, PageFlags, PageWriteGuard};
use crate::error::{Bm25Error, Result};

/// Writes a logical byte stream over a chain of pages.
///
/// Page `k` of the chain holds logical offsets `[k * bm25_page_size(), (k + 1) * bm25_page_size())`,
/// so a reader can map any offset to a page without walking the chain.
pub struct PageWriter<'a> {
    allocator: &'a PageAllocator,
    flag: PageFlags,
    segment_id: u32,
    level: u16,
    pages: Vec<u32>,
    page: Option<PageWriteGuard>,
    offset: u32,
}

impl<'a> PageWriter<'a> {
    pub fn new(allocator: &'a PageAllocator, flag: PageFlags, segment_id: u32, level: u16) -> Self {
        Self {
            allocator,
            flag,
            segment_id,
            level,
            pages: Vec::new(),
            page: None,
            offset: 0,
        }
    }

    /// Logical offset of the next byte written.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn pages(&self) -> &[u32] {
        &self.pages
    }

    /// Block numbers of the chain, in logical order.
    pub fn finalize(self) -> Vec<u32> {
        self.pages
    }

    fn change_page(&mut self) -> Result<()> {
        let new_page = self
            .allocator
            .alloc(self.flag, self.segment_id, self.level)?;
        if let Some(mut old_page) = self.page.take() {
            old_page.opaque.next_blkno = new_page.blkno();
        }
        self.pages.push(new_page.blkno());
        self.page = Some(new_page);
        Ok(())
    }

    fn current(&mut self) -> Result<&mut PageWriteGuard> {
        let full = match &self.page {
            Some(page) => page.header.lower as usize == bm25_page_size(),
            None => true,
        };
        if full {
            self.change_page()?;
        }
        self.page
            .as_mut()
            .ok_or_else(|| Bm25Error::InvalidState("page writer lost its page".into()))
    }

    pub fn write(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let page = self.current()?;
            let space = page.freespace_mut();
            let len = space.len().min(data.len());
            space[..len].copy_from_slice(&data[..len]);
            page.header.lower += len as u16;
            self.offset += len as u32;
            data = &data[len..];
        }
        Ok(())
    }

    // it will make sure the data is on the same page
    pub fn write_no_cross(&mut self, data: &[u8]) -> Result<()> {
        debug_assert!(data.len() <= bm25_page_size());
        let room = bm25_page_size() - self.offset as usize % bm25_page_size();
        if room < data.len() {
            let page = self.current()?;
            page.header.lower = bm25_page_size() as u16;
            self.offset += room as u32;
        }
        self.write(data)
    }
}
