//! In-memory building blocks: the block arena.

mod blist;

pub use blist::{Block, BlockList};
