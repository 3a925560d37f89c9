mod block_encode;
mod block_wand;

pub use block_encode::{BlockDecode, BlockDecodeTrait, BlockEncode, BlockEncodeTrait};
pub use block_wand::{block_wand, exhaustive, Scorer};
