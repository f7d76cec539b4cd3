// Fork-tree index: owns structural correctness of the block tree and the
// chain singleton. Attach, best-chain updates, irreversibility promotion
// and pruning all serialize through one write lock; readers clone a
// consistent snapshot and never hold the lock across a walk.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use crate::block::BlockHash;
use crate::blockchain::block_link::{AttachResult, ChainBlockLink, ExecutionStatus};
use crate::blockchain::chain::Chain;
use crate::error::ChainError;
use crate::storage::ChainStore;
use crate::Result;

struct ForkTreeInner {
    chain: Chain,
    /// Every known link, keyed by hash. The "previous" relation is a
    /// lookup key, never an owning reference, so a cycle introduced by a
    /// bug shows up as an exceeded walk bound instead of a leak.
    links: HashMap<BlockHash, ChainBlockLink>,
    /// parent hash -> children that arrived before that parent was linked.
    pending_children: HashMap<BlockHash, Vec<BlockHash>>,
    /// height -> hash for the irreversible prefix. Append-only.
    index: HashMap<u64, BlockHash>,
}

pub struct ForkTreeIndex {
    inner: RwLock<ForkTreeInner>,
    store: Arc<dyn ChainStore>,
    irreversible_window: u64,
}

impl std::fmt::Debug for ForkTreeIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read().unwrap();
        f.debug_struct("ForkTreeIndex")
            .field("links", &inner.links.len())
            .field("best_chain_height", &inner.chain.best_chain_height)
            .field(
                "last_irreversible_height",
                &inner.chain.last_irreversible_height,
            )
            .finish()
    }
}

impl ForkTreeIndex {
    /// Initializes a fresh tree around the genesis block. Genesis is
    /// linked, executed and irreversible from the start.
    pub fn create(
        genesis_hash: BlockHash,
        store: Arc<dyn ChainStore>,
        irreversible_window: u64,
    ) -> Result<Self> {
        let chain = Chain::new(genesis_hash);
        let mut genesis_link = ChainBlockLink::new(genesis_hash, crate::block::ZERO_HASH, 0);
        genesis_link.is_linked = true;
        genesis_link.execution_status = ExecutionStatus::Executed;

        store.save_link(&genesis_link)?;
        store.save_index_entry(0, &genesis_hash)?;
        store.save_chain(&chain)?;

        let mut links = HashMap::new();
        links.insert(genesis_hash, genesis_link);
        let mut index = HashMap::new();
        index.insert(0, genesis_hash);

        log::info!(
            "Created chain with genesis {}",
            hex::encode(&genesis_hash[..8])
        );
        Ok(ForkTreeIndex {
            inner: RwLock::new(ForkTreeInner {
                chain,
                links,
                pending_children: HashMap::new(),
                index,
            }),
            store,
            irreversible_window,
        })
    }

    /// Rebuilds the in-memory tree from the store at startup.
    pub fn load(store: Arc<dyn ChainStore>, irreversible_window: u64) -> Result<Self> {
        let chain = store
            .load_chain()?
            .ok_or_else(|| ChainError::not_found("chain record"))?;
        chain.check_invariants()?;

        let mut links = HashMap::new();
        let mut pending_children: HashMap<BlockHash, Vec<BlockHash>> = HashMap::new();
        for link in store.load_links()? {
            if !link.is_linked {
                pending_children
                    .entry(link.previous_block_hash)
                    .or_default()
                    .push(link.block_hash);
            }
            links.insert(link.block_hash, link);
        }
        let index = store.load_index()?;

        log::info!(
            "Loaded chain: best height {}, {} links, irreversible height {}",
            chain.best_chain_height,
            links.len(),
            chain.last_irreversible_height
        );
        Ok(ForkTreeIndex {
            inner: RwLock::new(ForkTreeInner {
                chain,
                links,
                pending_children,
                index,
            }),
            store,
            irreversible_window,
        })
    }

    /// Snapshot of the chain singleton. Callers doing multi-step walks
    /// use one snapshot throughout rather than re-reading mid-traversal.
    pub fn chain(&self) -> Chain {
        self.inner.read().unwrap().chain.clone()
    }

    /// O(1) link lookup, memory first, store as fallback.
    pub fn lookup_link(&self, hash: &BlockHash) -> Result<Option<ChainBlockLink>> {
        {
            let inner = self.inner.read().unwrap();
            if let Some(link) = inner.links.get(hash) {
                return Ok(Some(link.clone()));
            }
        }
        self.store.get_link(hash)
    }

    /// O(1) irreversible-index lookup, memory first, store as fallback.
    pub fn lookup_index(&self, height: u64) -> Result<Option<BlockHash>> {
        {
            let inner = self.inner.read().unwrap();
            if let Some(hash) = inner.index.get(&height) {
                return Ok(Some(*hash));
            }
        }
        self.store.get_index_entry(height)
    }

    /// Inserts a link into the tree.
    ///
    /// Re-attaching an identical link is an idempotent no-op that reports
    /// the link's current status. The same hash with a different parent
    /// or height is `Corruption` and aborts without touching state, as is
    /// any height gap against a known parent.
    pub fn attach(&self, link: ChainBlockLink) -> Result<AttachResult> {
        let mut inner = self.inner.write().unwrap();

        if let Some(existing) = inner.links.get(&link.block_hash) {
            if existing.previous_block_hash != link.previous_block_hash
                || existing.height != link.height
            {
                return Err(ChainError::corruption(format!(
                    "block {} re-attached with parent {} height {}, but is stored with parent {} height {}",
                    hex::encode(&link.block_hash[..8]),
                    hex::encode(&link.previous_block_hash[..8]),
                    link.height,
                    hex::encode(&existing.previous_block_hash[..8]),
                    existing.height,
                )));
            }
            log::debug!(
                "Duplicate attach of block {} ignored",
                hex::encode(&link.block_hash[..8])
            );
            return Ok(if existing.is_linked {
                AttachResult::Linked
            } else {
                AttachResult::NotLinked
            });
        }

        // The only height-0 block is genesis, attached at creation.
        if link.height == 0 {
            return Err(ChainError::corruption(format!(
                "height-0 block {} attached besides genesis",
                hex::encode(&link.block_hash[..8])
            )));
        }

        let parent_is_linked = if let Some(parent) = inner.links.get(&link.previous_block_hash) {
            if parent.height + 1 != link.height {
                return Err(ChainError::corruption(format!(
                    "block {} at height {} names parent {} at height {}",
                    hex::encode(&link.block_hash[..8]),
                    link.height,
                    hex::encode(&parent.block_hash[..8]),
                    parent.height,
                )));
            }
            Some(parent.is_linked)
        } else if inner.index.get(&(link.height - 1)) == Some(&link.previous_block_hash) {
            // Parent was promoted into the irreversible index; its link
            // may already be pruned.
            Some(true)
        } else {
            None
        };

        let mut link = link;
        if parent_is_linked != Some(true) {
            // Orphan, or child of an orphan: keep it and wait.
            link.is_linked = false;
            self.store.save_link(&link)?;
            log::debug!(
                "Stored orphan block {} waiting for parent {}",
                hex::encode(&link.block_hash[..8]),
                hex::encode(&link.previous_block_hash[..8])
            );
            inner
                .pending_children
                .entry(link.previous_block_hash)
                .or_default()
                .push(link.block_hash);
            inner.links.insert(link.block_hash, link);
            return Ok(AttachResult::NotLinked);
        }

        link.is_linked = true;
        self.store.save_link(&link)?;
        let mut deepest = (link.height, link.block_hash);
        let attached_hash = link.block_hash;
        inner.links.insert(link.block_hash, link);

        // Resolve orphan descendants iteratively; a long orphan chain must
        // not grow the stack.
        let mut queue = VecDeque::from([attached_hash]);
        while let Some(parent_hash) = queue.pop_front() {
            let Some(children) = inner.pending_children.remove(&parent_hash) else {
                continue;
            };
            let parent_height = inner.links[&parent_hash].height;
            for child_hash in children {
                let Some(child) = inner.links.get_mut(&child_hash) else {
                    log::warn!(
                        "Pending child {} vanished before its parent arrived",
                        hex::encode(&child_hash[..8])
                    );
                    continue;
                };
                if child.height != parent_height + 1 {
                    return Err(ChainError::corruption(format!(
                        "orphan {} at height {} waited for parent at height {}",
                        hex::encode(&child_hash[..8]),
                        child.height,
                        parent_height,
                    )));
                }
                child.is_linked = true;
                let persisted = child.clone();
                self.store.save_link(&persisted)?;
                if persisted.height > deepest.0 {
                    deepest = (persisted.height, persisted.block_hash);
                }
                queue.push_back(child_hash);
            }
        }

        if deepest.0 > inner.chain.longest_chain_height {
            inner.chain.longest_chain_hash = deepest.1;
            inner.chain.longest_chain_height = deepest.0;
            self.store.save_chain(&inner.chain)?;
            log::info!(
                "New longest chain: height {}, tip {}",
                deepest.0,
                hex::encode(&deepest.1[..8])
            );
            return Ok(AttachResult::NewLongestChainFound);
        }
        Ok(AttachResult::Linked)
    }

    /// Records the caller's best-chain decision. The new height may be
    /// lower than the current best (fork choice is external); it may not
    /// drop below the irreversible height. Promotes irreversibility when
    /// the new best clears the finality window.
    pub fn set_best_chain(&self, height: u64, hash: BlockHash) -> Result<Chain> {
        let mut inner = self.inner.write().unwrap();

        let link = inner
            .links
            .get(&hash)
            .ok_or_else(|| ChainError::not_found(format!("link {}", hex::encode(&hash[..8]))))?;
        if !link.is_linked {
            return Err(ChainError::InvalidArgument(format!(
                "block {} is not linked to genesis",
                hex::encode(&hash[..8])
            )));
        }
        if link.height != height {
            return Err(ChainError::InvalidArgument(format!(
                "block {} has height {}, caller claimed {}",
                hex::encode(&hash[..8]),
                link.height,
                height,
            )));
        }
        if height < inner.chain.last_irreversible_height {
            return Err(ChainError::InvalidArgument(format!(
                "best chain height {} below irreversible height {}",
                height, inner.chain.last_irreversible_height
            )));
        }

        inner.chain.best_chain_hash = hash;
        inner.chain.best_chain_height = height;
        if height > inner.chain.longest_chain_height {
            inner.chain.longest_chain_hash = hash;
            inner.chain.longest_chain_height = height;
        }

        let lib_target = height.saturating_sub(self.irreversible_window);
        if lib_target > inner.chain.last_irreversible_height {
            Self::promote_irreversible(&mut inner, &*self.store, lib_target)?;
        }

        inner.chain.check_invariants()?;
        self.store.save_chain(&inner.chain)?;
        log::info!(
            "Best chain set to height {}, tip {}",
            height,
            hex::encode(&hash[..8])
        );
        Ok(inner.chain.clone())
    }

    /// Walks the best chain downward and writes every height up to
    /// `up_to_height` into the irreversible index, then advances LIB.
    fn promote_irreversible(
        inner: &mut ForkTreeInner,
        store: &dyn ChainStore,
        up_to_height: u64,
    ) -> Result<()> {
        let old_lib_hash = inner.chain.last_irreversible_hash;
        let old_lib_height = inner.chain.last_irreversible_height;

        let mut entries = Vec::new();
        let mut cursor = inner.chain.best_chain_hash;
        let mut steps = inner.chain.best_chain_height - old_lib_height;
        while cursor != old_lib_hash {
            if steps == 0 {
                // More hops than heights: the parent relation loops.
                return Err(ChainError::corruption(
                    "best-chain walk exceeded its height budget".to_string(),
                ));
            }
            steps -= 1;
            let link = inner.links.get(&cursor).ok_or_else(|| {
                ChainError::corruption(format!(
                    "best-chain walk hit missing link {}",
                    hex::encode(&cursor[..8])
                ))
            })?;
            if link.height <= up_to_height {
                entries.push((link.height, link.block_hash));
            }
            cursor = link.previous_block_hash;
        }

        // entries were collected tip-down; index writes are append-only
        // and never overwrite an existing height.
        for (height, hash) in entries.iter().rev() {
            inner.index.insert(*height, *hash);
            store.save_index_entry(*height, hash)?;
        }

        let lib_hash = *inner.index.get(&up_to_height).ok_or_else(|| {
            ChainError::corruption(format!(
                "no canonical block at height {up_to_height} after promotion"
            ))
        })?;
        inner.chain.last_irreversible_hash = lib_hash;
        inner.chain.last_irreversible_height = up_to_height;
        log::info!(
            "Irreversible block advanced to height {}, hash {}",
            up_to_height,
            hex::encode(&lib_hash[..8])
        );
        Ok(())
    }

    /// Marks the block's execution outcome. Only Pending links may move;
    /// repeating the current status is a no-op.
    pub fn set_execution_status(&self, hash: &BlockHash, status: ExecutionStatus) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let link = inner
            .links
            .get_mut(hash)
            .ok_or_else(|| ChainError::not_found(format!("link {}", hex::encode(&hash[..8]))))?;
        if link.execution_status == status {
            return Ok(());
        }
        if link.execution_status != ExecutionStatus::Pending {
            return Err(ChainError::InvalidArgument(format!(
                "block {} already has execution status {:?}",
                hex::encode(&hash[..8]),
                link.execution_status
            )));
        }
        link.execution_status = status;
        let persisted = link.clone();
        self.store.save_link(&persisted)?;
        Ok(())
    }

    /// Removes links made unreachable by irreversibility: everything
    /// strictly below LIB, plus competing siblings at LIB height. The
    /// irreversible index keeps answering queries for those heights.
    /// Safe to run opportunistically at any time.
    pub fn prune_stale_links(&self) -> Result<usize> {
        let mut inner = self.inner.write().unwrap();
        let lib_height = inner.chain.last_irreversible_height;
        let lib_hash = inner.chain.last_irreversible_hash;

        let removable: HashSet<BlockHash> = inner
            .links
            .values()
            .filter(|link| {
                link.height < lib_height || (link.height == lib_height && link.block_hash != lib_hash)
            })
            .map(|link| link.block_hash)
            .collect();

        for hash in &removable {
            inner.links.remove(hash);
            inner.pending_children.remove(hash);
            self.store.delete_link(hash)?;
        }
        for children in inner.pending_children.values_mut() {
            children.retain(|hash| !removable.contains(hash));
        }
        inner.pending_children.retain(|_, children| !children.is_empty());

        if !removable.is_empty() {
            log::info!(
                "Pruned {} stale links below irreversible height {}",
                removable.len(),
                lib_height
            );
        }
        Ok(removable.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteChainStore;

    fn h(n: u8) -> BlockHash {
        [n; 32]
    }

    fn tree(window: u64) -> ForkTreeIndex {
        let store: Arc<dyn ChainStore> = Arc::new(SqliteChainStore::open_in_memory().unwrap());
        ForkTreeIndex::create(h(0), store, window).unwrap()
    }

    fn link(hash: u8, parent: u8, height: u64) -> ChainBlockLink {
        ChainBlockLink::new(h(hash), h(parent), height)
    }

    #[test]
    fn attach_extends_longest_chain() {
        let tree = tree(8);
        assert_eq!(
            tree.attach(link(1, 0, 1)).unwrap(),
            AttachResult::NewLongestChainFound
        );
        assert_eq!(
            tree.attach(link(2, 1, 2)).unwrap(),
            AttachResult::NewLongestChainFound
        );
        // Competing branch of equal or lower height only links.
        assert_eq!(tree.attach(link(11, 0, 1)).unwrap(), AttachResult::Linked);
        assert_eq!(tree.attach(link(12, 11, 2)).unwrap(), AttachResult::Linked);
        assert_eq!(
            tree.attach(link(13, 12, 3)).unwrap(),
            AttachResult::NewLongestChainFound
        );

        let chain = tree.chain();
        assert_eq!(chain.longest_chain_height, 3);
        assert_eq!(chain.longest_chain_hash, h(13));
        // Best chain does not move on its own.
        assert_eq!(chain.best_chain_hash, h(0));
        chain.check_invariants().unwrap();
    }

    #[test]
    fn orphans_resolve_when_the_parent_arrives() {
        let tree = tree(8);
        assert_eq!(
            tree.attach(link(2, 1, 2)).unwrap(),
            AttachResult::NotLinked
        );
        assert_eq!(
            tree.attach(link(3, 2, 3)).unwrap(),
            AttachResult::NotLinked
        );
        assert!(!tree.lookup_link(&h(3)).unwrap().unwrap().is_linked);

        // The missing parent links the whole pending chain at once.
        assert_eq!(
            tree.attach(link(1, 0, 1)).unwrap(),
            AttachResult::NewLongestChainFound
        );
        assert!(tree.lookup_link(&h(2)).unwrap().unwrap().is_linked);
        assert!(tree.lookup_link(&h(3)).unwrap().unwrap().is_linked);
        let chain = tree.chain();
        assert_eq!(chain.longest_chain_height, 3);
        assert_eq!(chain.longest_chain_hash, h(3));
    }

    #[test]
    fn duplicate_attach_is_idempotent() {
        let tree = tree(8);
        tree.attach(link(1, 0, 1)).unwrap();
        let before = tree.chain();
        assert_eq!(tree.attach(link(1, 0, 1)).unwrap(), AttachResult::Linked);
        assert_eq!(tree.chain(), before);
    }

    #[test]
    fn conflicting_reattach_is_corruption() {
        let tree = tree(8);
        tree.attach(link(1, 0, 1)).unwrap();
        let err = tree.attach(link(1, 0, 2)).unwrap_err();
        assert!(matches!(err, ChainError::Corruption(_)));
        let err = tree.attach(ChainBlockLink::new(h(1), h(9), 1)).unwrap_err();
        assert!(matches!(err, ChainError::Corruption(_)));
    }

    #[test]
    fn height_gap_against_known_parent_is_corruption() {
        let tree = tree(8);
        tree.attach(link(1, 0, 1)).unwrap();
        let err = tree.attach(link(2, 1, 5)).unwrap_err();
        assert!(matches!(err, ChainError::Corruption(_)));
    }

    #[test]
    fn second_height_zero_block_is_corruption() {
        let tree = tree(8);
        let err = tree
            .attach(ChainBlockLink::new(h(9), crate::block::ZERO_HASH, 0))
            .unwrap_err();
        assert!(matches!(err, ChainError::Corruption(_)));
    }

    #[test]
    fn set_best_chain_validates_its_target() {
        let tree = tree(8);
        tree.attach(link(1, 0, 1)).unwrap();
        tree.attach(link(3, 2, 3)).unwrap(); // orphan

        assert!(matches!(
            tree.set_best_chain(1, h(42)).unwrap_err(),
            ChainError::NotFound(_)
        ));
        assert!(matches!(
            tree.set_best_chain(3, h(3)).unwrap_err(),
            ChainError::InvalidArgument(_)
        ));
        assert!(matches!(
            tree.set_best_chain(2, h(1)).unwrap_err(),
            ChainError::InvalidArgument(_)
        ));

        let chain = tree.set_best_chain(1, h(1)).unwrap();
        assert_eq!(chain.best_chain_hash, h(1));
        assert_eq!(chain.best_chain_height, 1);
    }

    #[test]
    fn best_chain_may_shrink_but_not_below_lib() {
        let tree = tree(1);
        for n in 1..=4 {
            tree.attach(link(n, n - 1, n as u64)).unwrap();
        }
        tree.set_best_chain(4, h(4)).unwrap(); // LIB moves to 3
        assert_eq!(tree.chain().last_irreversible_height, 3);

        // Shorter best is allowed as long as it stays at or above LIB.
        let chain = tree.set_best_chain(3, h(3)).unwrap();
        assert_eq!(chain.best_chain_height, 3);
        assert!(matches!(
            tree.set_best_chain(2, h(2)).unwrap_err(),
            ChainError::InvalidArgument(_)
        ));
    }

    #[test]
    fn promotion_fills_the_irreversible_index() {
        let tree = tree(2);
        for n in 1..=5 {
            tree.attach(link(n, n - 1, n as u64)).unwrap();
        }
        let chain = tree.set_best_chain(5, h(5)).unwrap();
        assert_eq!(chain.last_irreversible_height, 3);
        assert_eq!(chain.last_irreversible_hash, h(3));
        for height in 0..=3u64 {
            assert_eq!(tree.lookup_index(height).unwrap().unwrap(), h(height as u8));
        }
        assert!(tree.lookup_index(4).unwrap().is_none());
        chain.check_invariants().unwrap();
    }

    #[test]
    fn pruning_drops_dead_forks_and_keeps_the_index() {
        let tree = tree(1);
        for n in 1..=4 {
            tree.attach(link(n, n - 1, n as u64)).unwrap();
        }
        // Dead fork at heights 1-2.
        tree.attach(link(11, 0, 1)).unwrap();
        tree.attach(link(12, 11, 2)).unwrap();

        tree.set_best_chain(4, h(4)).unwrap(); // LIB = 3
        let pruned = tree.prune_stale_links().unwrap();
        // A1, A2, B1, B2 go; LIB block (height 3) and the tip stay.
        assert_eq!(pruned, 5); // includes genesis at height 0
        assert!(tree.lookup_link(&h(1)).unwrap().is_none());
        assert!(tree.lookup_link(&h(12)).unwrap().is_none());
        assert!(tree.lookup_link(&h(3)).unwrap().is_some());
        assert!(tree.lookup_link(&h(4)).unwrap().is_some());

        // Height queries below LIB still answer through the index.
        assert_eq!(tree.lookup_index(1).unwrap().unwrap(), h(1));
        assert_eq!(tree.lookup_index(2).unwrap().unwrap(), h(2));

        // A child of the pruned-but-irreversible block still links.
        assert_eq!(
            tree.attach(link(24, 3, 4)).unwrap(),
            AttachResult::Linked
        );
    }

    #[test]
    fn execution_status_moves_from_pending_once() {
        let tree = tree(8);
        tree.attach(link(1, 0, 1)).unwrap();
        tree.set_execution_status(&h(1), ExecutionStatus::Executed)
            .unwrap();
        // Same status again is a no-op.
        tree.set_execution_status(&h(1), ExecutionStatus::Executed)
            .unwrap();
        assert!(matches!(
            tree.set_execution_status(&h(1), ExecutionStatus::Invalid)
                .unwrap_err(),
            ChainError::InvalidArgument(_)
        ));
        assert!(matches!(
            tree.set_execution_status(&h(9), ExecutionStatus::Executed)
                .unwrap_err(),
            ChainError::NotFound(_)
        ));
    }

    #[test]
    fn load_restores_links_orphans_and_index() {
        let store: Arc<dyn ChainStore> = Arc::new(SqliteChainStore::open_in_memory().unwrap());
        {
            let tree = ForkTreeIndex::create(h(0), Arc::clone(&store), 1).unwrap();
            tree.attach(link(1, 0, 1)).unwrap();
            tree.attach(link(2, 1, 2)).unwrap();
            tree.attach(link(9, 8, 9)).unwrap(); // orphan
            tree.set_best_chain(2, h(2)).unwrap(); // LIB = 1
        }
        let tree = ForkTreeIndex::load(store, 1).unwrap();
        let chain = tree.chain();
        assert_eq!(chain.best_chain_height, 2);
        assert_eq!(chain.last_irreversible_height, 1);
        assert_eq!(tree.lookup_index(1).unwrap().unwrap(), h(1));
        assert!(!tree.lookup_link(&h(9)).unwrap().unwrap().is_linked);

        // The reloaded orphan map still resolves descendants.
        for n in 3..=8 {
            tree.attach(link(n, n - 1, n as u64)).unwrap();
        }
        assert!(tree.lookup_link(&h(9)).unwrap().unwrap().is_linked);
        assert_eq!(tree.chain().longest_chain_height, 9);
        assert_eq!(tree.chain().longest_chain_hash, h(9));
    }
}
