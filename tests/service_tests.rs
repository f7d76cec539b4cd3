// End-to-end exercises against an on-disk sqlite store, including
// restart and recovery paths that the in-memory unit tests cannot cover.

use std::sync::Arc;

use chain_core_rust::{
    genesis_block, AttachResult, Block, BlockHeader, ChainService, ChainStore, SqliteChainStore,
    TransactionData, ZERO_HASH,
};
use tempfile::TempDir;

fn open_store(dir: &TempDir) -> Arc<dyn ChainStore> {
    let path = dir.path().join("chain_node_data.sqlite");
    Arc::new(SqliteChainStore::new(path.to_str().unwrap()).unwrap())
}

fn child_of(parent: &Block, tag: u8) -> Block {
    Block {
        header: BlockHeader {
            version: 1,
            previous_block_hash: parent.get_hash(),
            merkle_root: [tag; 32],
            timestamp: parent.header.timestamp + 60,
            height: parent.header.height + 1,
        },
        transactions: vec![TransactionData {
            version: 1,
            payload: vec![tag],
        }],
    }
}

#[tokio::test]
async fn chain_survives_a_restart() {
    let dir = TempDir::new().unwrap();

    let genesis = genesis_block();
    let mut blocks = vec![genesis.clone()];
    let chain_before = {
        let service =
            ChainService::load_or_create(open_store(&dir), &genesis, 2).unwrap();
        for n in 1..=5u8 {
            let block = child_of(blocks.last().unwrap(), n);
            service.attach_block(&block).await.unwrap();
            blocks.push(block);
        }
        let tip = blocks.last().unwrap();
        service
            .set_best_chain(tip.header.height, tip.get_hash())
            .await
            .unwrap()
    };
    assert_eq!(chain_before.last_irreversible_height, 3);

    // Fresh process: same store, no in-memory state.
    let service = ChainService::load_or_create(open_store(&dir), &genesis, 2).unwrap();
    let chain = service.get_chain();
    assert_eq!(chain, chain_before);

    for block in &blocks {
        assert_eq!(
            service
                .hash_at_height(&chain, block.header.height, None)
                .await
                .unwrap(),
            block.get_hash()
        );
        assert_eq!(
            service.get_block_by_hash(&block.get_hash()).await.unwrap(),
            Some(block.clone())
        );
    }
    assert_eq!(
        service.get_best_chain_last_header().await.unwrap(),
        blocks.last().unwrap().header
    );
}

#[tokio::test]
async fn orphans_resolve_after_a_restart() {
    let dir = TempDir::new().unwrap();

    let genesis = genesis_block();
    let a1 = child_of(&genesis, 1);
    let a2 = child_of(&a1, 2);
    let a3 = child_of(&a2, 3);

    {
        let service =
            ChainService::load_or_create(open_store(&dir), &genesis, 8).unwrap();
        assert_eq!(
            service.attach_block(&a1).await.unwrap(),
            AttachResult::NewLongestChainFound
        );
        // Grandchild arrives before its parent and waits.
        assert_eq!(
            service.attach_block(&a3).await.unwrap(),
            AttachResult::NotLinked
        );
        assert_eq!(service.get_chain().longest_chain_height, 1);
    }

    let service = ChainService::load_or_create(open_store(&dir), &genesis, 8).unwrap();
    assert_eq!(service.get_chain().longest_chain_height, 1);

    // The missing parent links itself and the waiting orphan in one step.
    assert_eq!(
        service.attach_block(&a2).await.unwrap(),
        AttachResult::NewLongestChainFound
    );
    let chain = service.get_chain();
    assert_eq!(chain.longest_chain_height, 3);
    assert_eq!(chain.longest_chain_hash, a3.get_hash());
}

#[tokio::test]
async fn pruned_heights_still_answer_through_the_index() {
    let dir = TempDir::new().unwrap();

    let genesis = genesis_block();
    let service = ChainService::load_or_create(open_store(&dir), &genesis, 1).unwrap();

    // Losing fork off genesis, then a long winning chain.
    let stale = child_of(&genesis, 0xEE);
    service.attach_block(&stale).await.unwrap();

    let mut blocks = vec![genesis.clone()];
    for n in 1..=4u8 {
        let block = child_of(blocks.last().unwrap(), n);
        service.attach_block(&block).await.unwrap();
        blocks.push(block);
    }
    let tip = blocks.last().unwrap();
    let chain = service
        .set_best_chain(tip.header.height, tip.get_hash())
        .await
        .unwrap();
    assert_eq!(chain.last_irreversible_height, 3);

    let removed = service.prune_stale_links().await.unwrap();
    // Genesis, heights 1..=2 and the stale sibling at height 1 are gone.
    assert_eq!(removed, 4);

    // Height queries at and below the irreversible boundary keep working.
    for block in &blocks[..=3] {
        assert_eq!(
            service
                .hash_at_height(&chain, block.header.height, None)
                .await
                .unwrap(),
            block.get_hash()
        );
    }
    // The stale sibling's block body is still stored, only its link went.
    assert!(service.has_block(&stale.get_hash()).await.unwrap());

    // And the view survives another restart.
    drop(service);
    let service = ChainService::load_or_create(open_store(&dir), &genesis, 1).unwrap();
    let chain = service.get_chain();
    assert_eq!(chain.last_irreversible_height, 3);
    assert_eq!(
        service.hash_at_height(&chain, 2, None).await.unwrap(),
        blocks[2].get_hash()
    );
}

#[tokio::test]
async fn arrival_order_does_not_change_the_outcome() {
    use rand::seq::SliceRandom;

    let genesis = genesis_block();
    let mut blocks = vec![genesis.clone()];
    for n in 1..=6u8 {
        blocks.push(child_of(blocks.last().unwrap(), n));
    }
    let fork = child_of(&blocks[3], 0xFF);
    let mut arrivals: Vec<Block> = blocks[1..].iter().cloned().collect();
    arrivals.push(fork);

    let mut rng = rand::thread_rng();
    for _ in 0..5 {
        arrivals.shuffle(&mut rng);
        let dir = TempDir::new().unwrap();
        let service =
            ChainService::load_or_create(open_store(&dir), &genesis, 8).unwrap();
        for block in &arrivals {
            service.attach_block(block).await.unwrap();
        }
        let chain = service.get_chain();
        assert_eq!(chain.longest_chain_height, 6);
        assert_eq!(chain.longest_chain_hash, blocks[6].get_hash());
    }
}

#[tokio::test]
async fn branch_switch_spans_a_restart() {
    let dir = TempDir::new().unwrap();

    let genesis = genesis_block();
    let a1 = child_of(&genesis, 0xA1);
    let a2 = child_of(&a1, 0xA2);
    let b1 = child_of(&genesis, 0xB1);
    let b2 = child_of(&b1, 0xB2);
    let b3 = child_of(&b2, 0xB3);

    {
        let service =
            ChainService::load_or_create(open_store(&dir), &genesis, 8).unwrap();
        for block in [&a1, &a2, &b1, &b2, &b3] {
            service.attach_block(block).await.unwrap();
        }
        service.set_best_chain(2, a2.get_hash()).await.unwrap();
    }

    let service = ChainService::load_or_create(open_store(&dir), &genesis, 8).unwrap();
    let switch = service
        .branch_switch(a2.get_hash(), b3.get_hash())
        .await
        .unwrap();
    assert_eq!(switch.roll_back, vec![a2.get_hash(), a1.get_hash()]);
    assert_eq!(
        switch.roll_forward,
        vec![b1.get_hash(), b2.get_hash(), b3.get_hash()]
    );

    // From the sentinel the whole adopted branch rolls forward.
    let from_scratch = service.branch_switch(ZERO_HASH, b3.get_hash()).await.unwrap();
    assert!(from_scratch.roll_back.is_empty());
    assert_eq!(from_scratch.roll_forward.len(), 4);
    assert_eq!(from_scratch.roll_forward[0], genesis.get_hash());
}
