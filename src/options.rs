use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct IndexingOption {
    /// Number of buffered postings after which the memtable spills.
    #[serde(default = "IndexingOption::default_memtable_spill_threshold")]
    #[validate(range(min = 1))]
    pub memtable_spill_threshold: usize,
    #[serde(default = "IndexingOption::default_segments_per_level")]
    #[validate(range(min = 2, max = 64))]
    pub segments_per_level: u32,
    #[serde(default = "IndexingOption::default_pool_expansion_factor")]
    #[validate(range(min = 0.1, max = 64.0))]
    pub pool_expansion_factor: f32,
    #[serde(default = "IndexingOption::default_encode")]
    pub encode: EncodeOption,
    #[serde(default = "IndexingOption::default_build_workers")]
    #[validate(range(min = 1, max = 64))]
    pub build_workers: usize,
    #[serde(default)]
    #[validate(nested)]
    pub query: QueryOption,
}

impl IndexingOption {
    fn default_memtable_spill_threshold() -> usize {
        1_000_000
    }

    fn default_segments_per_level() -> u32 {
        8
    }

    fn default_pool_expansion_factor() -> f32 {
        1.5
    }

    fn default_encode() -> EncodeOption {
        EncodeOption::DeltaBitpack
    }

    fn default_build_workers() -> usize {
        4
    }
}

impl Default for IndexingOption {
    fn default() -> Self {
        Self {
            memtable_spill_threshold: Self::default_memtable_spill_threshold(),
            segments_per_level: Self::default_segments_per_level(),
            pool_expansion_factor: Self::default_pool_expansion_factor(),
            encode: Self::default_encode(),
            build_workers: Self::default_build_workers(),
            query: QueryOption::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = "validate_query_limits"))]
pub struct QueryOption {
    /// Use block-max pruning; `false` scores every posting.
    #[serde(default = "QueryOption::default_wand_seek")]
    pub wand_seek: bool,
    #[serde(default = "QueryOption::default_limit")]
    #[validate(range(min = 1))]
    pub limit: usize,
    #[serde(default = "QueryOption::default_max_limit")]
    #[validate(range(min = 1))]
    pub max_limit: usize,
}

impl QueryOption {
    fn default_wand_seek() -> bool {
        true
    }

    fn default_limit() -> usize {
        1000
    }

    fn default_max_limit() -> usize {
        100_000
    }
}

impl Default for QueryOption {
    fn default() -> Self {
        Self {
            wand_seek: Self::default_wand_seek(),
            limit: Self::default_limit(),
            max_limit: Self::default_max_limit(),
        }
    }
}

fn validate_query_limits(option: &QueryOption) -> Result<(), ValidationError> {
    if option.max_limit < option.limit {
        return Err(ValidationError::new("max_limit_below_limit"));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "snake_case")]
pub enum EncodeOption {
    DeltaBitpack,
    Plain,
}

impl EncodeOption {
    pub fn to_raw(self) -> u32 {
        match self {
            EncodeOption::DeltaBitpack => 0,
            EncodeOption::Plain => 1,
        }
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(EncodeOption::DeltaBitpack),
            1 => Some(EncodeOption::Plain),
            _ => None,
        }
    }
}
