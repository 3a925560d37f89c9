use thiserror::Error;

pub type Result<T, E = Bm25Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Bm25Error {
    #[error("memtable is full: {postings} postings buffered, limit {limit}")]
    CapacityExceeded { postings: usize, limit: usize },
    #[error("page pool exhausted")]
    PoolExhausted,
    #[error("storage exhausted: cannot grow beyond {max_pages} pages")]
    StorageExhausted { max_pages: u32 },
    #[error("segment {segment} is corrupt: {reason}")]
    SegmentCorrupt { segment: u32, reason: String },
    #[error("page {blkno} is corrupt: {reason}")]
    PageCorrupt { blkno: u32, reason: String },
    #[error("metapage is corrupt: {0}")]
    MetaCorrupt(String),
    #[error("document id {doc_id} does not follow {last}")]
    DocIdOutOfOrder { doc_id: u32, last: u32 },
    #[error("bm25 index can only store up to 2^32 - 1 documents")]
    DocIdExhausted,
    #[error("document {0} not found")]
    DocumentNotFound(u32),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("invalid options: {0}")]
    InvalidOptions(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("build worker {worker} failed: {reason}")]
    WorkerFailed { worker: usize, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Bm25Error {
    pub fn segment_corrupt(segment: u32, reason: impl Into<String>) -> Self {
        Bm25Error::SegmentCorrupt {
            segment,
            reason: reason.into(),
        }
    }

    pub fn page_corrupt(blkno: u32, reason: impl Into<String>) -> Self {
        Bm25Error::PageCorrupt {
            blkno,
            reason: reason.into(),
        }
    }
}
