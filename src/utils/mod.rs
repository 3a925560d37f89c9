pub mod arena;
pub mod compress_block;
pub mod topk_computer;
pub mod vint;
