//! Paged B-tree storage backend.
//!
//! A classic disk B-tree: fixed-size pages, a crash-consistent header on
//! page 0, and an LRU cache of decoded nodes. Mutations split, borrow and
//! merge nodes so every non-root node keeps between `t-1` and `2t-1` items
//! for minimum degree `t`.

pub mod node;
pub mod tree;

pub use node::{Header, Item, Node};
pub use tree::BtreeStore;
