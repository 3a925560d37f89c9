use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{PageData, PAGE_SIZE};
use crate::error::{Bm25Error, Result};

/// The backing store of an index: an extensible array of fixed-size pages.
///
/// Cloning is cheap and shares the pages. Each page is individually locked so
/// readers of one segment never block writers of another.
#[derive(Clone)]
pub struct Relation {
    inner: Arc<Inner>,
}

struct Inner {
    pages: RwLock<Vec<Arc<RwLock<PageData>>>>,
    max_pages: Option<u32>,
}

impl Relation {
    pub fn new() -> Self {
        Self::with_inner(Vec::new(), None)
    }

    /// A store that refuses to grow beyond `max_pages`.
    pub fn with_max_pages(max_pages: u32) -> Self {
        Self::with_inner(Vec::new(), Some(max_pages))
    }

    fn with_inner(pages: Vec<Arc<RwLock<PageData>>>, max_pages: Option<u32>) -> Self {
        Self {
            inner: Arc::new(Inner {
                pages: RwLock::new(pages),
                max_pages,
            }),
        }
    }

    pub fn nblocks(&self) -> u32 {
        self.inner.pages.read().len() as u32
    }

    pub(super) fn buffer(&self, blkno: u32) -> Result<Arc<RwLock<PageData>>> {
        self.inner
            .pages
            .read()
            .get(blkno as usize)
            .cloned()
            .ok_or_else(|| Bm25Error::page_corrupt(blkno, "block number out of range"))
    }

    pub(super) fn extend(&self) -> Result<u32> {
        let mut pages = self.inner.pages.write();
        let blkno = pages.len() as u32;
        if let Some(max_pages) = self.inner.max_pages {
            if blkno >= max_pages {
                return Err(Bm25Error::StorageExhausted { max_pages });
            }
        }
        pages.push(Arc::new(RwLock::new(bytemuck::Zeroable::zeroed())));
        Ok(blkno)
    }

    /// Deep copy of every page, as a crash would leave them.
    pub fn snapshot(&self) -> Self {
        let pages = self
            .inner
            .pages
            .read()
            .iter()
            .map(|page| Arc::new(RwLock::new(*page.read())))
            .collect();
        Self::with_inner(pages, self.inner.max_pages)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = BufWriter::new(File::create(path)?);
        for page in self.inner.pages.read().iter() {
            file.write_all(bytemuck::bytes_of(&*page.read()))?;
        }
        file.flush()?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = BufReader::new(File::open(path)?);
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        if bytes.len() % PAGE_SIZE != 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("file size {} is not a multiple of the page size", bytes.len()),
            )
            .into());
        }
        let pages = bytes
            .chunks_exact(PAGE_SIZE)
            .map(|chunk| Arc::new(RwLock::new(bytemuck::pod_read_unaligned::<PageData>(chunk))))
            .collect();
        Ok(Self::with_inner(pages, None))
    }
}
