//! The exception B-tree: a persistent, variable-payload B-tree mapping
//! origin chunk addresses to sets of `(share, snapshot-store chunk)`
//! exceptions.
//!
//! Submodules:
//! - [`leaf`]: exception-leaf encoding and in-leaf mutation/query.
//! - [`node`]: interior index-node encoding.
//! - [`engine`]: probe, insert-with-split, traversal, and range-delete.

pub mod engine;
pub mod leaf;
pub mod node;

pub use engine::{BTree, TreeRoot};
pub use leaf::{Exception, Leaf, LeafEntry};
pub use node::{IndexNode, NodeEntry};
