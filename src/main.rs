use std::sync::Arc;

use chain_core_rust::{
    genesis_block, ChainService, ChainStore, NodeSettings, SqliteChainStore,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let settings = NodeSettings::load()?;
    log::info!(
        "Chain node starting up (db: {}, irreversible window: {})",
        settings.db_path,
        settings.irreversible_window
    );

    let store: Arc<dyn ChainStore> = Arc::new(SqliteChainStore::new(&settings.db_path)?);
    let service = ChainService::load_or_create(store, &genesis_block(), settings.irreversible_window)?;

    let chain = service.get_chain();
    log::info!(
        "Chain ready: best height {}, longest height {}, irreversible height {}",
        chain.best_chain_height,
        chain.longest_chain_height,
        chain.last_irreversible_height
    );
    let tip = service.get_best_chain_last_header().await?;
    log::info!(
        "Best chain tip: {} (timestamp {})",
        hex::encode(tip.get_hash()),
        tip.timestamp
    );

    Ok(())
}
