//! Chain-state core of a blockchain node.
//!
//! Maintains the fork tree of known blocks, records which branch is the
//! best (canonical) one, computes rollback/roll-forward sets when the
//! best branch changes, and resolves height-to-hash queries across the
//! irreversible/forkable boundary of the chain.
//!
//! Consensus, execution, networking and the HTTP surface live elsewhere;
//! this crate only exposes the in-process query and mutation API they
//! build on.

pub mod block;
pub mod blockchain;
pub mod chainparams;
pub mod error;
pub mod settings;
pub mod storage;

pub use block::{Block, BlockHash, BlockHeader, TransactionData, ZERO_HASH};
pub use blockchain::block_link::{AttachResult, ChainBlockLink, ExecutionStatus};
pub use blockchain::chain::Chain;
pub use chainparams::{genesis_block, ChainParams, GENESIS_HEIGHT, MAINNET_PARAMS};
pub use blockchain::fork_tree::ForkTreeIndex;
pub use blockchain::service::{BranchSwitch, ChainEvent, ChainService};
pub use error::ChainError;
pub use settings::NodeSettings;
pub use storage::{ChainStore, SqliteChainStore};

/// Result type for chain-state operations.
pub type Result<T> = std::result::Result<T, ChainError>;
