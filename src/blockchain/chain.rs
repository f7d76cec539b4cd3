// The chain singleton: summary pointers for the whole ledger instance.

use serde::{Deserialize, Serialize};

use crate::block::BlockHash;
use crate::error::ChainError;
use crate::Result;

/// Singleton record describing the current shape of the chain.
///
/// `best_chain_*` is the branch adopted as canonical by the external fork
/// choice; `longest_chain_*` is the highest linked branch known, whether
/// or not it has been adopted; `last_irreversible_*` (LIB) is the highest
/// block guaranteed never to be reverted. Readers clone the whole record
/// once and use that snapshot for any multi-step traversal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chain {
    pub genesis_hash: BlockHash,
    pub best_chain_hash: BlockHash,
    pub best_chain_height: u64,
    pub longest_chain_hash: BlockHash,
    pub longest_chain_height: u64,
    pub last_irreversible_hash: BlockHash,
    pub last_irreversible_height: u64,
}

impl Chain {
    /// Fresh chain where genesis is best, longest and irreversible at once.
    pub fn new(genesis_hash: BlockHash) -> Self {
        Chain {
            genesis_hash,
            best_chain_hash: genesis_hash,
            best_chain_height: 0,
            longest_chain_hash: genesis_hash,
            longest_chain_height: 0,
            last_irreversible_hash: genesis_hash,
            last_irreversible_height: 0,
        }
    }

    /// Ordering invariant: LIB height <= best height <= longest height.
    pub fn check_invariants(&self) -> Result<()> {
        if self.last_irreversible_height > self.best_chain_height {
            return Err(ChainError::corruption(format!(
                "irreversible height {} above best chain height {}",
                self.last_irreversible_height, self.best_chain_height
            )));
        }
        if self.best_chain_height > self.longest_chain_height {
            return Err(ChainError::corruption(format!(
                "best chain height {} above longest chain height {}",
                self.best_chain_height, self.longest_chain_height
            )));
        }
        Ok(())
    }
}
