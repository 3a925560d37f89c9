use super::{bm25_page_size, no_cross_offset, page_read, PageFlags, PageReadGuard, Relation};
use super::INVALID_BLKNO;
use crate::error::{Bm25Error, Result};

/// Random access to the logical byte stream of one segment.
#[derive(Clone)]
pub struct SegmentPages {
    relation: Relation,
    segment_id: u32,
    pages: Vec<u32>,
}

impl SegmentPages {
    pub fn new(relation: Relation, segment_id: u32, pages: Vec<u32>) -> Self {
        Self {
            relation,
            segment_id,
            pages,
        }
    }

    pub fn pages(&self) -> &[u32] {
        &self.pages
    }

    fn corrupt(&self, reason: impl Into<String>) -> Bm25Error {
        Bm25Error::segment_corrupt(self.segment_id, reason)
    }

    fn load(&self, page_no: usize) -> Result<PageReadGuard> {
        let blkno = *self
            .pages
            .get(page_no)
            .ok_or_else(|| self.corrupt(format!("logical page {} out of range", page_no)))?;
        let page = page_read(&self.relation, blkno)?;
        page.check(blkno, PageFlags::SEGMENT_DATA)
            .map_err(|e| self.corrupt(e.to_string()))?;
        if page.opaque.segment_id != self.segment_id {
            return Err(self.corrupt(format!(
                "page {} belongs to segment {}",
                blkno, page.opaque.segment_id
            )));
        }
        Ok(page)
    }

    /// Copies `buf.len()` bytes starting at logical `offset`.
    pub fn read_at(&self, offset: u32, buf: &mut [u8]) -> Result<()> {
        let page_size = bm25_page_size();
        let mut offset = offset as usize;
        let mut filled = 0;
        while filled < buf.len() {
            let page = self.load(offset / page_size)?;
            let within = offset % page_size;
            let data = page.data();
            let len = (buf.len() - filled).min(page_size - within);
            let src = data
                .get(within..within + len)
                .ok_or_else(|| self.corrupt(format!("read past end of data at {}", offset)))?;
            buf[filled..filled + len].copy_from_slice(src);
            filled += len;
            offset += len;
        }
        Ok(())
    }

    /// Reads the `index`-th fixed-size entry of a region written with
    /// `write_no_cross`.
    pub fn read_entry<T: bytemuck::Pod>(&self, start: u32, index: u32) -> Result<T> {
        let size = std::mem::size_of::<T>();
        let offset = no_cross_offset(start, index, size as u32) as usize;
        let page = self.load(offset / bm25_page_size())?;
        let within = offset % bm25_page_size();
        let bytes = page
            .data()
            .get(within..within + size)
            .ok_or_else(|| self.corrupt(format!("entry at {} past end of data", offset)))?;
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    /// Reads `count` consecutive entries starting at ordinal `first`.
    pub fn read_entries<T: bytemuck::Pod>(&self, start: u32, first: u32, count: u32) -> Result<Vec<T>> {
        let size = std::mem::size_of::<T>();
        let mut entries = Vec::with_capacity(count as usize);
        let mut cached: Option<(usize, PageReadGuard)> = None;
        for index in first..first + count {
            let offset = no_cross_offset(start, index, size as u32) as usize;
            let page_no = offset / bm25_page_size();
            let page = match cached.take() {
                Some((no, page)) if no == page_no => page,
                _ => self.load(page_no)?,
            };
            let within = offset % bm25_page_size();
            let bytes = page
                .data()
                .get(within..within + size)
                .ok_or_else(|| self.corrupt(format!("entry at {} past end of data", offset)))?;
            entries.push(bytemuck::pod_read_unaligned(bytes));
            cached = Some((page_no, page));
        }
        Ok(entries)
    }
}

/// Reads a chain of pages linked through `next_blkno`.
pub struct ChainReader {
    relation: Relation,
    flag: PageFlags,
}

impl ChainReader {
    pub fn new(relation: Relation, flag: PageFlags) -> Self {
        Self { relation, flag }
    }

    /// Returns the block numbers of the chain starting at `first`.
    pub fn blknos(&self, first: u32) -> Result<Vec<u32>> {
        let mut blknos = Vec::new();
        self.walk(first, |blkno, _| {
            blknos.push(blkno);
            Ok(())
        })?;
        Ok(blknos)
    }

    /// Concatenates the used bytes of every page in the chain.
    pub fn read_to_end(&self, first: u32, buf: &mut Vec<u8>) -> Result<usize> {
        let mut read_len = 0;
        self.walk(first, |_, page| {
            buf.extend_from_slice(page.data());
            read_len += page.data().len();
            Ok(())
        })?;
        Ok(read_len)
    }

    fn walk(&self, first: u32, mut f: impl FnMut(u32, &PageReadGuard) -> Result<()>) -> Result<()> {
        let limit = self.relation.nblocks();
        let mut visited = 0u32;
        let mut blkno = first;
        while blkno != INVALID_BLKNO {
            if visited > limit {
                return Err(Bm25Error::page_corrupt(blkno, "page chain contains a cycle"));
            }
            let page = page_read(&self.relation, blkno)?;
            page.check(blkno, self.flag)?;
            f(blkno, &page)?;
            blkno = page.opaque.next_blkno;
            visited += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{PageAllocator, PageWriter};

    fn written(entries: u32) -> (Relation, u32, Vec<u32>) {
        let relation = Relation::new();
        let allocator = PageAllocator::new(relation.clone(), INVALID_BLKNO);
        let mut writer = PageWriter::new(&allocator, PageFlags::SEGMENT_DATA, 3, 0);
        writer.write(&[0xAB; 100]).unwrap();
        let start = writer.offset();
        for i in 0..entries {
            writer.write_no_cross(bytemuck::bytes_of(&[i, i * 2, i * 3])).unwrap();
        }
        (relation, start, writer.finalize())
    }

    #[test]
    fn entries_read_back_across_pages() {
        let (relation, start, pages) = written(3000);
        assert!(pages.len() > 1);
        let reader = SegmentPages::new(relation, 3, pages);
        for i in [0u32, 1, 679, 680, 681, 2999] {
            let entry: [u32; 3] = reader.read_entry(start, i).unwrap();
            assert_eq!(entry, [i, i * 2, i * 3]);
        }
        let all: Vec<[u32; 3]> = reader.read_entries(start, 0, 3000).unwrap();
        assert!(all.iter().enumerate().all(|(i, e)| e[0] == i as u32));
        let mut head = [0u8; 100];
        reader.read_at(0, &mut head).unwrap();
        assert!(head.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn foreign_segment_is_corrupt() {
        let (relation, start, pages) = written(10);
        let reader = SegmentPages::new(relation, 4, pages);
        assert!(matches!(
            reader.read_entry::<[u32; 3]>(start, 0),
            Err(Bm25Error::SegmentCorrupt { segment: 4, .. })
        ));
    }

    #[test]
    fn read_past_end_is_corrupt() {
        let (relation, start, pages) = written(10);
        let reader = SegmentPages::new(relation, 3, pages);
        assert!(reader.read_entry::<[u32; 3]>(start, 10).is_err());
        assert!(reader.read_entry::<[u32; 3]>(start, 100_000).is_err());
    }

    #[test]
    fn chain_reader_concatenates() {
        let (relation, _, pages) = written(3000);
        let chain = ChainReader::new(relation, PageFlags::SEGMENT_DATA);
        assert_eq!(chain.blknos(pages[0]).unwrap(), pages);
        let mut buf = Vec::new();
        let len = chain.read_to_end(pages[0], &mut buf).unwrap();
        assert_eq!(len, buf.len());
        assert!(len >= 100 + 3000 * 12);
    }
}
