use validator::Validate;

use crate::error::{Bm25Error, Result};
use crate::options::IndexingOption;

/// Parses index options from a TOML string. Missing keys take their
/// defaults; unknown keys are rejected.
///
/// ```toml
/// memtable_spill_threshold = 200000
/// segments_per_level = 4
///
/// [query]
/// wand_seek = true
/// limit = 500
/// ```
pub fn parse_options(s: &str) -> Result<IndexingOption> {
    let option: IndexingOption =
        toml::from_str(s).map_err(|e| Bm25Error::InvalidOptions(format!("failed to parse options: {}", e)))?;
    validate(&option)?;
    Ok(option)
}

pub(super) fn validate(option: &IndexingOption) -> Result<()> {
    option
        .validate()
        .map_err(|e| Bm25Error::InvalidOptions(e.to_string()))
}
