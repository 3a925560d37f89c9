mod pool;
mod reader;
mod relation;
mod writer;

use std::ops::{Deref, DerefMut};

use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, RawRwLock};

pub use pool::PageAllocator;
pub use reader::{ChainReader, SegmentPages};
pub use relation::Relation;
pub use writer::PageWriter;

use crate::error::{Bm25Error, Result};

pub const PAGE_SIZE: usize = 8192;
pub const METAPAGE_BLKNO: u32 = 0;
pub const INVALID_BLKNO: u32 = u32::MAX;
pub const BM25_PAGE_ID: u16 = 0xFF88;

const _: () = {
    assert!(std::mem::size_of::<PageHeader>() % 8 == 0);
    assert!(std::mem::size_of::<Bm25PageOpaqueData>() % 8 == 0);
    assert!(std::mem::size_of::<PageData>() == PAGE_SIZE);
};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u16 {
        const META = 1 << 0;
        const FREE = 1 << 1;
        const SEGMENT_HEADER = 1 << 2;
        const SEGMENT_DATA = 1 << 3;
        const PAGE_INDEX = 1 << 4;
        const DELETE_BITMAP = 1 << 5;
        const PENDING_ROWS = 1 << 6;
    }
}

#[repr(C, align(8))]
#[derive(Clone, Copy, Debug)]
pub struct PageHeader {
    pub lower: u16,
    _reserved: [u16; 3],
}

#[repr(C, align(8))]
#[derive(Clone, Copy, Debug)]
pub struct Bm25PageOpaqueData {
    pub next_blkno: u32,
    pub segment_id: u32,
    pub level: u16,
    pub page_flag: PageFlags,
    bm25_page_id: u16, // for identification of bm25 pages
    _reserved: u16,
}

#[repr(C, align(8))]
#[derive(Clone, Copy)]
pub struct PageData {
    pub header: PageHeader,
    pub content: [u8; bm25_page_size()],
    pub opaque: Bm25PageOpaqueData,
}

unsafe impl bytemuck::Zeroable for PageData {}
unsafe impl bytemuck::Pod for PageData {}

impl PageData {
    pub fn new(flag: PageFlags) -> Box<Self> {
        let mut page: Box<Self> = Box::new(bytemuck::Zeroable::zeroed());
        page.init(flag, INVALID_BLKNO, 0);
        page
    }

    pub fn init(&mut self, flag: PageFlags, segment_id: u32, level: u16) {
        self.header = PageHeader {
            lower: 0,
            _reserved: [0; 3],
        };
        self.content.fill(0);
        self.opaque = Bm25PageOpaqueData {
            next_blkno: INVALID_BLKNO,
            segment_id,
            level,
            page_flag: flag,
            bm25_page_id: BM25_PAGE_ID,
            _reserved: 0,
        };
    }

    pub fn data(&self) -> &[u8] {
        &self.content[..self.header.lower as usize]
    }

    pub fn freespace_mut(&mut self) -> &mut [u8] {
        &mut self.content[self.header.lower as usize..]
    }

    pub fn flag(&self) -> PageFlags {
        self.opaque.page_flag
    }

    pub fn is_bm25_page(&self) -> bool {
        self.opaque.bm25_page_id == BM25_PAGE_ID
    }

    /// Checks that this page carries the engine's magic and the expected type.
    pub fn check(&self, blkno: u32, flag: PageFlags) -> Result<()> {
        if !self.is_bm25_page() {
            return Err(Bm25Error::page_corrupt(blkno, "missing page magic"));
        }
        if self.opaque.page_flag != flag {
            return Err(Bm25Error::page_corrupt(
                blkno,
                format!(
                    "expected {:?} page, found {:?}",
                    flag, self.opaque.page_flag
                ),
            ));
        }
        if self.header.lower as usize > bm25_page_size() {
            return Err(Bm25Error::page_corrupt(blkno, "page lower out of range"));
        }
        Ok(())
    }

    pub fn read_pod<T: bytemuck::Pod>(&self) -> Option<T> {
        let bytes = self.data().get(..std::mem::size_of::<T>())?;
        Some(bytemuck::pod_read_unaligned(bytes))
    }

    pub fn write_pod<T: bytemuck::Pod>(&mut self, value: &T) {
        let bytes = bytemuck::bytes_of(value);
        self.content[..bytes.len()].copy_from_slice(bytes);
        self.header.lower = self.header.lower.max(bytes.len() as u16);
    }
}

/// What a single page says about itself, without any other context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    pub blkno: u32,
    pub flag: PageFlags,
    pub segment_id: u32,
    pub level: u16,
    pub next_blkno: u32,
    pub used_bytes: u16,
}

impl PageInfo {
    pub fn of(blkno: u32, page: &PageData) -> Result<Self> {
        if !page.is_bm25_page() {
            return Err(Bm25Error::page_corrupt(blkno, "missing page magic"));
        }
        Ok(Self {
            blkno,
            flag: page.opaque.page_flag,
            segment_id: page.opaque.segment_id,
            level: page.opaque.level,
            next_blkno: page.opaque.next_blkno,
            used_bytes: page.header.lower,
        })
    }
}

pub struct PageReadGuard {
    blkno: u32,
    guard: ArcRwLockReadGuard<RawRwLock, PageData>,
}

impl PageReadGuard {
    pub fn blkno(&self) -> u32 {
        self.blkno
    }
}

impl Deref for PageReadGuard {
    type Target = PageData;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

pub struct PageWriteGuard {
    blkno: u32,
    guard: ArcRwLockWriteGuard<RawRwLock, PageData>,
}

impl PageWriteGuard {
    pub fn blkno(&self) -> u32 {
        self.blkno
    }
}

impl Deref for PageWriteGuard {
    type Target = PageData;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for PageWriteGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

pub fn page_read(relation: &Relation, blkno: u32) -> Result<PageReadGuard> {
    let buffer = relation.buffer(blkno)?;
    Ok(PageReadGuard {
        blkno,
        guard: buffer.read_arc(),
    })
}

pub fn page_write(relation: &Relation, blkno: u32) -> Result<PageWriteGuard> {
    let buffer = relation.buffer(blkno)?;
    Ok(PageWriteGuard {
        blkno,
        guard: buffer.write_arc(),
    })
}

/// Extends the store by one page and initializes it.
pub fn page_alloc(
    relation: &Relation,
    flag: PageFlags,
    segment_id: u32,
    level: u16,
) -> Result<PageWriteGuard> {
    let blkno = relation.extend()?;
    let mut page = page_write(relation, blkno)?;
    page.init(flag, segment_id, level);
    Ok(page)
}

pub const fn bm25_page_size() -> usize {
    PAGE_SIZE - std::mem::size_of::<PageHeader>() - std::mem::size_of::<Bm25PageOpaqueData>()
}

/// Logical offset of the `index`-th entry of `entry_size` bytes in a region
/// starting at `start`, where an entry that does not fit in the rest of a page
/// starts on the next page.
pub fn no_cross_offset(start: u32, index: u32, entry_size: u32) -> u32 {
    let page = bm25_page_size() as u32;
    debug_assert!(entry_size > 0 && entry_size <= page);
    let first_room = (page - start % page) / entry_size;
    if index < first_room {
        return start + index * entry_size;
    }
    let rest = index - first_room;
    let per_page = page / entry_size;
    let next_page_start = start - start % page + page;
    next_page_start + (rest / per_page) * page + (rest % per_page) * entry_size
}
