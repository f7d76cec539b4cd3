pub mod block_link;
pub mod chain;
pub mod fork_tree;
pub mod service;
