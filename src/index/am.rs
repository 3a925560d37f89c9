/// What the index can do for a caller planning a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Results come out ordered by descending BM25 score.
    pub can_order_by_score: bool,
    pub can_backward_scan: bool,
    pub can_parallel_build: bool,
    /// A query may name no terms at all; it returns nothing.
    pub optional_key: bool,
    pub can_unique: bool,
    pub can_multi_column: bool,
}

pub static CAPABILITIES: Capabilities = Capabilities {
    can_order_by_score: true,
    can_backward_scan: false,
    can_parallel_build: true,
    optional_key: true,
    can_unique: false,
    can_multi_column: false,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::tests::{doc, small_option};
    use crate::index::{BuildMode, Bm25Index};
    use crate::page::Relation;

    #[test]
    fn advertised_capabilities_hold() {
        assert!(CAPABILITIES.can_order_by_score);
        assert!(!CAPABILITIES.can_backward_scan);

        let index = Bm25Index::create(Relation::new(), small_option()).unwrap();
        let docs: Vec<_> = (0..40u64)
            .map(|row| doc(row, &[("x", (row % 7 + 1) as u32), ("pad", 3)]))
            .collect();
        index.build(&docs, BuildMode::Parallel { workers: 2 }).unwrap();

        let hits = index.topk(&["x"], 40).unwrap();
        assert_eq!(hits.len(), 40);
        assert!(hits.windows(2).all(|w| w[0].1 >= w[1].1));
        assert!(index.topk(&[], 10).unwrap().is_empty());
    }
}
