use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::{
    bm25_page_size, page_alloc, page_read, page_write, PageFlags, PageWriteGuard, Relation,
    INVALID_BLKNO,
};
use crate::error::{Bm25Error, Result};

/// Hands out pages to segment writers.
///
/// Pages come from a pre-reserved pool first, then from the free list, and
/// finally by extending the relation. A build that outgrows its reservation
/// keeps going; the first extension is logged once.
pub struct PageAllocator {
    relation: Relation,
    state: Mutex<AllocState>,
    warned: AtomicBool,
}

struct AllocState {
    pool: Vec<u32>,
    reserving: bool,
    free_head: u32,
}

impl PageAllocator {
    pub fn new(relation: Relation, free_head: u32) -> Self {
        Self {
            relation,
            state: Mutex::new(AllocState {
                pool: Vec::new(),
                reserving: false,
                free_head,
            }),
            warned: AtomicBool::new(false),
        }
    }

    pub fn relation(&self) -> &Relation {
        &self.relation
    }

    pub fn free_head(&self) -> u32 {
        self.state.lock().free_head
    }

    pub fn pool_len(&self) -> usize {
        self.state.lock().pool.len()
    }

    /// Pages needed to hold `bytes` of source data, scaled by `factor`.
    pub fn estimate_pages(bytes: u64, factor: f32) -> u32 {
        let scaled = (bytes as f64 * factor as f64).ceil();
        let pages = (scaled / bm25_page_size() as f64).ceil();
        pages.clamp(1.0, u32::MAX as f64 / 2.0) as u32
    }

    /// Extends the relation by `n` pages and keeps them for [`Self::alloc`].
    pub fn reserve(&self, n: u32) -> Result<()> {
        let mut state = self.state.lock();
        state.pool.reserve(n as usize);
        for _ in 0..n {
            let page = page_alloc(&self.relation, PageFlags::FREE, INVALID_BLKNO, 0)?;
            state.pool.push(page.blkno());
        }
        // hand out low block numbers first
        state.pool.reverse();
        state.reserving = true;
        self.warned.store(false, Ordering::Relaxed);
        tracing::debug!(pages = n, "reserved page pool");
        Ok(())
    }

    pub fn alloc(&self, flag: PageFlags, segment_id: u32, level: u16) -> Result<PageWriteGuard> {
        let mut state = self.state.lock();
        let blkno = match Self::take_from_pool(&mut state) {
            Ok(blkno) => blkno,
            Err(Bm25Error::PoolExhausted) => {
                if state.free_head != INVALID_BLKNO {
                    let blkno = state.free_head;
                    let page = page_read(&self.relation, blkno)?;
                    page.check(blkno, PageFlags::FREE)?;
                    state.free_head = page.opaque.next_blkno;
                    blkno
                } else {
                    if state.reserving && !self.warned.swap(true, Ordering::Relaxed) {
                        tracing::warn!(
                            nblocks = self.relation.nblocks(),
                            "page pool exhausted, extending storage; consider raising pool_expansion_factor"
                        );
                    }
                    return page_alloc(&self.relation, flag, segment_id, level);
                }
            }
            Err(e) => return Err(e),
        };
        let mut page = page_write(&self.relation, blkno)?;
        page.init(flag, segment_id, level);
        Ok(page)
    }

    fn take_from_pool(state: &mut AllocState) -> Result<u32> {
        state.pool.pop().ok_or(Bm25Error::PoolExhausted)
    }

    /// Moves every page still in the pool onto the free list.
    ///
    /// The relation is never truncated: a following compaction would only
    /// extend it again.
    pub fn release_unused(&self) -> Result<u32> {
        let pool = {
            let mut state = self.state.lock();
            state.reserving = false;
            std::mem::take(&mut state.pool)
        };
        let n = pool.len() as u32;
        self.free_pages(pool)?;
        if n > 0 {
            tracing::debug!(pages = n, "released unused pool pages");
        }
        Ok(n)
    }

    pub fn free_pages(&self, blknos: impl IntoIterator<Item = u32>) -> Result<()> {
        let mut state = self.state.lock();
        for blkno in blknos {
            let mut page = page_write(&self.relation, blkno)?;
            page.init(PageFlags::FREE, INVALID_BLKNO, 0);
            page.opaque.next_blkno = state.free_head;
            state.free_head = blkno;
        }
        Ok(())
    }

    /// Block numbers on the free list, head first.
    pub fn free_list(&self) -> Result<Vec<u32>> {
        let state = self.state.lock();
        let limit = self.relation.nblocks() as usize;
        let mut blknos = Vec::new();
        let mut blkno = state.free_head;
        while blkno != INVALID_BLKNO {
            if blknos.len() > limit {
                return Err(Bm25Error::page_corrupt(blkno, "free list contains a cycle"));
            }
            let page = page_read(&self.relation, blkno)?;
            page.check(blkno, PageFlags::FREE)?;
            blknos.push(blkno);
            blkno = page.opaque.next_blkno;
        }
        Ok(blknos)
    }

    pub fn free_list_len(&self) -> Result<u32> {
        Ok(self.free_list()?.len() as u32)
    }
}
