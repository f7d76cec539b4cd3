// Network parameters and the deterministic genesis block.

use crate::block::{Block, BlockHeader, ZERO_HASH};

pub const GENESIS_HEIGHT: u64 = 0;

#[derive(Debug, Clone)]
pub struct ChainParams {
    pub network_id_string: &'static str,
    /// Finality offset: a block becomes irreversible once the best chain
    /// reaches `height + irreversible_window`.
    pub irreversible_window: u64,
}

pub const MAINNET_PARAMS: ChainParams = ChainParams {
    network_id_string: "mainnet",
    irreversible_window: 8,
};

/// Builds the mainnet genesis block. Height 0, null parent, fixed
/// merkle root and timestamp, so every node derives the same hash.
pub fn genesis_block() -> Block {
    let mut merkle_root = [0u8; 32];
    hex::decode_to_slice(
        "4271a3d993d6157f960de646ce8dfad07989dfd0703064f8056d1a7287283d06",
        &mut merkle_root,
    )
    .expect("Failed to decode genesis merkle root");

    Block {
        header: BlockHeader {
            version: 1,
            previous_block_hash: ZERO_HASH,
            merkle_root,
            timestamp: 1_546_790_318,
            height: GENESIS_HEIGHT,
        },
        transactions: Vec::new(),
    }
}
