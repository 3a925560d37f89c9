//! Tombstones for deleted documents, one bit per doc id.
//!
//! Queries skip marked documents; spills and merges drop them. The bitmap is
//! copied on write and published as a whole, so a query keeps the version it
//! started with.

use crate::error::{Bm25Error, Result};
use crate::page::{ChainReader, PageAllocator, PageFlags, PageWriter, Relation, INVALID_BLKNO};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteBitmap {
    words: Vec<u64>,
    count: u64,
}

impl DeleteBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn len(&self) -> u64 {
        self.count
    }

    #[inline]
    pub fn is_deleted(&self, doc_id: u32) -> bool {
        match self.words.get((doc_id / 64) as usize) {
            Some(&word) => word & (1u64 << (doc_id % 64)) != 0,
            None => false,
        }
    }

    /// Marks `doc_id`; returns false if it was already marked.
    pub fn delete(&mut self, doc_id: u32) -> bool {
        let index = (doc_id / 64) as usize;
        if index >= self.words.len() {
            self.words.resize(index + 1, 0);
        }
        let bit = 1u64 << (doc_id % 64);
        if self.words[index] & bit != 0 {
            return false;
        }
        self.words[index] |= bit;
        self.count += 1;
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &word)| {
            (0..64u32)
                .filter(move |bit| word & (1u64 << bit) != 0)
                .map(move |bit| i as u32 * 64 + bit)
        })
    }

    /// Writes the bitmap as a new page chain and returns its head.
    pub fn store(&self, allocator: &PageAllocator) -> Result<u32> {
        if self.is_empty() {
            return Ok(INVALID_BLKNO);
        }
        let mut writer = PageWriter::new(allocator, PageFlags::DELETE_BITMAP, INVALID_BLKNO, 0);
        writer.write(&self.count.to_le_bytes())?;
        for word in &self.words {
            writer.write(&word.to_le_bytes())?;
        }
        Ok(writer
            .finalize()
            .first()
            .copied()
            .unwrap_or(INVALID_BLKNO))
    }

    pub fn load(relation: &Relation, head: u32) -> Result<Self> {
        if head == INVALID_BLKNO {
            return Ok(Self::new());
        }
        let mut bytes = Vec::new();
        ChainReader::new(relation.clone(), PageFlags::DELETE_BITMAP).read_to_end(head, &mut bytes)?;
        if bytes.len() < 8 || bytes.len() % 8 != 0 {
            return Err(Bm25Error::page_corrupt(head, "delete bitmap has a partial word"));
        }
        let mut chunks = bytes
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]));
        let count = chunks.next().unwrap_or(0);
        let words: Vec<u64> = chunks.collect();
        let actual: u64 = words.iter().map(|w| w.count_ones() as u64).sum();
        if actual != count {
            return Err(Bm25Error::page_corrupt(
                head,
                format!("delete bitmap holds {} bits, header says {}", actual, count),
            ));
        }
        Ok(Self { words, count })
    }
}

/// Pages of the chain starting at `head`.
pub fn delete_bitmap_pages(relation: &Relation, head: u32) -> Result<Vec<u32>> {
    if head == INVALID_BLKNO {
        return Ok(Vec::new());
    }
    ChainReader::new(relation.clone(), PageFlags::DELETE_BITMAP).blknos(head)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_and_query() {
        let mut bitmap = DeleteBitmap::new();
        assert!(!bitmap.is_deleted(3));
        assert!(bitmap.delete(3));
        assert!(!bitmap.delete(3));
        assert!(bitmap.delete(1_000_001));
        assert!(bitmap.is_deleted(3));
        assert!(bitmap.is_deleted(1_000_001));
        assert!(!bitmap.is_deleted(4));
        assert_eq!(bitmap.len(), 2);
        assert_eq!(bitmap.iter().collect::<Vec<_>>(), vec![3, 1_000_001]);
    }

    #[test]
    fn store_and_load() {
        let relation = Relation::new();
        let allocator = PageAllocator::new(relation.clone(), INVALID_BLKNO);
        assert_eq!(DeleteBitmap::new().store(&allocator).unwrap(), INVALID_BLKNO);

        let mut bitmap = DeleteBitmap::new();
        for doc in (0..200_000).step_by(7) {
            bitmap.delete(doc);
        }
        let head = bitmap.store(&allocator).unwrap();
        assert!(delete_bitmap_pages(&relation, head).unwrap().len() > 1);
        assert_eq!(DeleteBitmap::load(&relation, head).unwrap(), bitmap);
        assert_eq!(DeleteBitmap::load(&relation, INVALID_BLKNO).unwrap(), DeleteBitmap::new());
    }
}
