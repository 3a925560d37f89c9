//! A leveled BM25 full-text index over a paged store.
//!
//! Documents land in an in-memory memtable and spill into immutable sealed
//! segments, which are merged level by level. Queries run block-max WAND
//! across the memtable and every live segment.

#![allow(clippy::len_without_is_empty)]

pub mod algorithm;
pub mod error;
pub mod index;
pub mod options;
pub mod page;
pub mod segment;
pub mod utils;
pub mod weight;

#[cfg(not(target_endian = "little"))]
compile_error!("Target is not supported.");

pub use error::{Bm25Error, Result};
pub use index::{
    parse_options, Bm25Index, BuildMode, BuildReport, BulkDeleteStats, Capabilities, Document,
    DocumentSource, FilteredSearch, IndexStats, IndexSummary, RecoveryReport, SearchHit,
    SegmentSummary, VacuumReport, CAPABILITIES,
};
pub use options::{EncodeOption, IndexingOption, QueryOption};
pub use page::Relation;
