// Chain orchestrator: cross-cutting queries that need both the fork-tree
// link graph and the stored ledger contents, plus the attach/best-chain
// entry points the rest of the node calls.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::block::{Block, BlockHash, BlockHeader, TransactionData, ZERO_HASH};
use crate::blockchain::block_link::{AttachResult, ChainBlockLink, ExecutionStatus};
use crate::blockchain::chain::Chain;
use crate::blockchain::fork_tree::ForkTreeIndex;
use crate::error::ChainError;
use crate::storage::ChainStore;
use crate::Result;

/// Rollback/roll-forward transition between two branch tips.
///
/// `roll_back` runs from the old tip down to (excluding) the common
/// ancestor, height-descending; `roll_forward` from (excluding) the
/// ancestor up to the new tip, height-ascending, ready to apply in order.
/// The two lists never share a hash.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BranchSwitch {
    pub roll_back: Vec<BlockHash>,
    pub roll_forward: Vec<BlockHash>,
}

/// Outbound notifications. Fire-and-forget: consumers re-synchronize
/// from the event rather than polling; lagging receivers are dropped by
/// the broadcast channel, never waited on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    BestChainChanged { block_hash: BlockHash, height: u64 },
}

const EVENT_CHANNEL_CAPACITY: usize = 64;

pub struct ChainService {
    fork_tree: Arc<ForkTreeIndex>,
    store: Arc<dyn ChainStore>,
    events: broadcast::Sender<ChainEvent>,
}

impl std::fmt::Debug for ChainService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainService")
            .field("fork_tree", &self.fork_tree)
            .finish()
    }
}

impl ChainService {
    /// Bootstraps a new chain from its genesis block.
    pub fn create(
        store: Arc<dyn ChainStore>,
        genesis: &Block,
        irreversible_window: u64,
    ) -> Result<Self> {
        store.save_block(genesis)?;
        let fork_tree = Arc::new(ForkTreeIndex::create(
            genesis.get_hash(),
            Arc::clone(&store),
            irreversible_window,
        )?);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let service = ChainService {
            fork_tree,
            store,
            events,
        };
        let chain = service.get_chain();
        service.publish(ChainEvent::BestChainChanged {
            block_hash: chain.best_chain_hash,
            height: chain.best_chain_height,
        });
        Ok(service)
    }

    /// Reopens an existing chain from the store.
    pub fn load(store: Arc<dyn ChainStore>, irreversible_window: u64) -> Result<Self> {
        let fork_tree = Arc::new(ForkTreeIndex::load(Arc::clone(&store), irreversible_window)?);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(ChainService {
            fork_tree,
            store,
            events,
        })
    }

    /// Loads the chain if the store holds one, otherwise creates it.
    pub fn load_or_create(
        store: Arc<dyn ChainStore>,
        genesis: &Block,
        irreversible_window: u64,
    ) -> Result<Self> {
        if store.load_chain()?.is_some() {
            Self::load(store, irreversible_window)
        } else {
            Self::create(store, genesis, irreversible_window)
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: ChainEvent) {
        // No subscribers is fine; the event is informational.
        let _ = self.events.send(event);
    }

    /// Snapshot of the chain singleton.
    pub fn get_chain(&self) -> Chain {
        self.fork_tree.chain()
    }

    /// Persists the block (idempotently) and attaches its link to the
    /// fork tree. The returned status tells the caller whether to run a
    /// best-chain evaluation.
    pub async fn attach_block(&self, block: &Block) -> Result<AttachResult> {
        let hash = block.get_hash();
        self.store.save_block(block)?;
        let link = ChainBlockLink::new(hash, block.header.previous_block_hash, block.header.height);
        let status = self.fork_tree.attach(link)?;
        log::debug!(
            "Attached block {} at height {}: {:?}",
            hex::encode(&hash[..8]),
            block.header.height,
            status
        );
        Ok(status)
    }

    pub async fn has_block(&self, hash: &BlockHash) -> Result<bool> {
        self.store.has_block(hash)
    }

    pub async fn get_block_by_hash(&self, hash: &BlockHash) -> Result<Option<Block>> {
        self.store.get_block(hash)
    }

    pub async fn get_block_header_by_hash(&self, hash: &BlockHash) -> Result<Option<BlockHeader>> {
        self.store.get_header(hash)
    }

    pub async fn get_block_by_height(&self, height: u64) -> Result<Option<Block>> {
        let chain = self.get_chain();
        match self.hash_at_height(&chain, height, None).await {
            Ok(hash) => self.store.get_block(&hash),
            Err(ChainError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Header of the current best-chain tip.
    pub async fn get_best_chain_last_header(&self) -> Result<BlockHeader> {
        let chain = self.get_chain();
        self.store
            .get_header(&chain.best_chain_hash)?
            .ok_or_else(|| {
                ChainError::corruption(format!(
                    "best chain tip {} has no stored header",
                    hex::encode(&chain.best_chain_hash[..8])
                ))
            })
    }

    pub async fn get_transaction(&self, txid: &BlockHash) -> Result<Option<TransactionData>> {
        self.store.get_transaction(txid)
    }

    /// Resolves the hash at `height`, searching from `from` (default: the
    /// longest-chain tip). Heights at or below the irreversible boundary
    /// answer from the height index; above it the branch is walked
    /// backward link by link. The boundary is invisible to the caller.
    pub async fn hash_at_height(
        &self,
        chain: &Chain,
        height: u64,
        from: Option<BlockHash>,
    ) -> Result<BlockHash> {
        if height <= chain.last_irreversible_height {
            return self.fork_tree.lookup_index(height)?.ok_or_else(|| {
                ChainError::corruption(format!(
                    "no irreversible index entry at height {height} (LIB {})",
                    chain.last_irreversible_height
                ))
            });
        }

        let start = from.unwrap_or(chain.longest_chain_hash);
        let mut link = self
            .fork_tree
            .lookup_link(&start)?
            .ok_or_else(|| ChainError::not_found(format!("link {}", hex::encode(&start[..8]))))?;
        if link.height < height {
            return Err(ChainError::not_found(format!(
                "height {} above branch tip {} at height {}",
                height,
                hex::encode(&start[..8]),
                link.height
            )));
        }
        // The walk can only shorten; any extra hop means a cycle.
        let mut budget = link.height - height;
        while link.height != height {
            if budget == 0 {
                return Err(ChainError::corruption(
                    "branch walk exceeded its height budget".to_string(),
                ));
            }
            budget -= 1;
            let parent = link.previous_block_hash;
            link = self.fork_tree.lookup_link(&parent)?.ok_or_else(|| {
                ChainError::not_found(format!("ancestor link {}", hex::encode(&parent[..8])))
            })?;
        }
        Ok(link.block_hash)
    }

    /// Computes the rollback/roll-forward transition from one tip to
    /// another without knowing either path length in advance. `from` may
    /// be the zero genesis sentinel, which has no stored header and an
    /// empty rollback side by definition.
    pub async fn branch_switch(&self, from: BlockHash, to: BlockHash) -> Result<BranchSwitch> {
        let from_genesis = from == ZERO_HASH;
        let from_header = self.store.get_header(&from)?;
        if from_header.is_none() && !from_genesis {
            return Err(ChainError::not_found(format!(
                "block {}",
                hex::encode(&from[..8])
            )));
        }
        let to_header = self
            .store
            .get_header(&to)?
            .ok_or_else(|| ChainError::not_found(format!("block {}", hex::encode(&to[..8]))))?;

        let mut roll_back = Vec::new();
        let mut reversed_new_branch = Vec::new();

        if from_genesis {
            let mut header = to_header;
            loop {
                reversed_new_branch.push(header.get_hash());
                if header.height == 0 {
                    break;
                }
                header = self.ancestor_header(&header)?;
            }
        } else {
            let mut from_header = from_header.expect("checked above");
            let mut to_header = to_header;

            while from_header.height > to_header.height {
                roll_back.push(from_header.get_hash());
                from_header = self.ancestor_header(&from_header)?;
            }
            while to_header.height > from_header.height {
                reversed_new_branch.push(to_header.get_hash());
                to_header = self.ancestor_header(&to_header)?;
            }
            // Heights equal: step both sides down in lockstep until the
            // common ancestor. The tree has a single root, so this
            // terminates unless the parent relation is corrupt.
            loop {
                let from_hash = from_header.get_hash();
                let to_hash = to_header.get_hash();
                if from_hash == to_hash {
                    break;
                }
                if from_header.height == 0 {
                    return Err(ChainError::corruption(format!(
                        "branches {} and {} share no ancestor",
                        hex::encode(&from_hash[..8]),
                        hex::encode(&to_hash[..8])
                    )));
                }
                roll_back.push(from_hash);
                reversed_new_branch.push(to_hash);
                from_header = self.ancestor_header(&from_header)?;
                to_header = self.ancestor_header(&to_header)?;
            }
        }

        reversed_new_branch.reverse();
        Ok(BranchSwitch {
            roll_back,
            roll_forward: reversed_new_branch,
        })
    }

    fn ancestor_header(&self, header: &BlockHeader) -> Result<BlockHeader> {
        self.store
            .get_header(&header.previous_block_hash)?
            .ok_or_else(|| {
                ChainError::not_found(format!(
                    "ancestor block {}",
                    hex::encode(&header.previous_block_hash[..8])
                ))
            })
    }

    /// Returns the `count` hashes directly above `first_hash` on the
    /// branch ending at `branch` (default: longest chain), ascending.
    /// The backward walk must land exactly on `first_hash`; anything else
    /// means the endpoints are on different branches, which is a
    /// consistency error rather than an empty result.
    pub async fn hashes_in_range(
        &self,
        chain: &Chain,
        first_hash: BlockHash,
        count: u64,
        branch: Option<BlockHash>,
    ) -> Result<Vec<BlockHash>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let first = self.store.get_header(&first_hash)?.ok_or_else(|| {
            ChainError::not_found(format!("block {}", hex::encode(&first_hash[..8])))
        })?;
        let target_height = first.height.checked_add(count).ok_or_else(|| {
            ChainError::InvalidArgument(format!(
                "height overflow: {} + {}",
                first.height, count
            ))
        })?;

        let last = self.hash_at_height(chain, target_height, branch).await?;
        let mut header = self
            .store
            .get_header(&last)?
            .ok_or_else(|| ChainError::not_found(format!("block {}", hex::encode(&last[..8]))))?;

        let mut hashes = Vec::with_capacity(count as usize);
        hashes.push(last);
        for _ in 0..count - 1 {
            header = self.ancestor_header(&header)?;
            hashes.push(header.get_hash());
        }
        if header.previous_block_hash != first_hash {
            return Err(ChainError::corruption(format!(
                "range walk from height {} landed on {}, expected {}",
                target_height,
                hex::encode(&header.previous_block_hash[..8]),
                hex::encode(&first_hash[..8])
            )));
        }
        hashes.reverse();
        Ok(hashes)
    }

    /// Up to `count` ancestors of `last_hash`, starting at its parent and
    /// walking away from the tip. Stops silently at the genesis boundary;
    /// returns `None` when `last_hash` is unknown or its immediate parent
    /// is genesis, so callers can tell "nothing linked yet" from "reached
    /// genesis after some results".
    pub async fn reversed_ancestors(
        &self,
        last_hash: BlockHash,
        count: u64,
    ) -> Result<Option<Vec<BlockHash>>> {
        if count == 0 {
            return Ok(Some(Vec::new()));
        }
        let chain = self.get_chain();
        let is_genesis =
            |hash: &BlockHash| *hash == chain.genesis_hash || *hash == ZERO_HASH;

        let Some(mut link) = self.fork_tree.lookup_link(&last_hash)? else {
            return Ok(None);
        };
        if is_genesis(&link.previous_block_hash) {
            return Ok(None);
        }
        let mut hashes = vec![link.previous_block_hash];
        for _ in 0..count - 1 {
            let Some(parent) = self.fork_tree.lookup_link(&link.previous_block_hash)? else {
                break;
            };
            link = parent;
            if is_genesis(&link.previous_block_hash) {
                break;
            }
            hashes.push(link.previous_block_hash);
        }
        Ok(Some(hashes))
    }

    /// Records the external fork-choice decision and announces it.
    pub async fn set_best_chain(&self, height: u64, hash: BlockHash) -> Result<Chain> {
        let chain = self.fork_tree.set_best_chain(height, hash)?;
        self.publish(ChainEvent::BestChainChanged {
            block_hash: hash,
            height,
        });
        Ok(chain)
    }

    pub async fn set_block_execution_status(
        &self,
        hash: &BlockHash,
        status: ExecutionStatus,
    ) -> Result<()> {
        self.fork_tree.set_execution_status(hash, status)
    }

    /// Opportunistic cleanup of links made unreachable by irreversibility.
    pub async fn prune_stale_links(&self) -> Result<usize> {
        self.fork_tree.prune_stale_links()
    }
}
