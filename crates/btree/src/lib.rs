//! The disk-backed B+ tree engine: node layout, pinned node handles, and
//! the search/insert/delete algorithms that drive them through the page
//! cache in `buffer`.

mod engine;
mod node;
mod visualize;

pub use engine::{BpTree, DeleteOutcome, InsertOutcome, SearchOutcome};
pub use node::{Capacities, NodeType};

#[cfg(test)]
mod tests;
