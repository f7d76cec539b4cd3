// Node settings: defaults, optional `chain_node.toml`, then environment
// variables prefixed CHAIN_NODE_ (e.g. CHAIN_NODE_DB_PATH).

use serde::Deserialize;

use crate::Result;

#[derive(Debug, Clone, Deserialize)]
pub struct NodeSettings {
    /// Path of the sqlite database file.
    pub db_path: String,
    /// Finality offset applied when the best chain advances.
    pub irreversible_window: u64,
}

impl NodeSettings {
    pub fn load() -> Result<Self> {
        let settings = config::Config::builder()
            .set_default("db_path", "chain_node_data.sqlite")?
            .set_default("irreversible_window", 8i64)?
            .add_source(config::File::with_name("chain_node").required(false))
            .add_source(config::Environment::with_prefix("CHAIN_NODE"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}
