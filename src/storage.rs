// Sqlite-backed persistence for headers, blocks, transactions and the
// fork-tree records (chain singleton, links, irreversible index).

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Mutex;

use rusqlite::{params, Connection};

use crate::block::{Block, BlockHash, BlockHeader, Decodable, Encodable, TransactionData};
use crate::blockchain::block_link::{ChainBlockLink, ExecutionStatus};
use crate::blockchain::chain::Chain;
use crate::error::ChainError;
use crate::Result;

/// Storage contract for the chain-state core. All writes are idempotent:
/// re-adding an existing hash's header, body or transaction is a no-op.
pub trait ChainStore: Send + Sync + std::fmt::Debug {
    fn save_header(&self, header: &BlockHeader) -> Result<()>;
    fn get_header(&self, hash: &BlockHash) -> Result<Option<BlockHeader>>;
    fn save_block(&self, block: &Block) -> Result<()>;
    fn get_block(&self, hash: &BlockHash) -> Result<Option<Block>>;
    fn has_block(&self, hash: &BlockHash) -> Result<bool>;
    fn get_transaction(&self, txid: &BlockHash) -> Result<Option<TransactionData>>;

    fn save_chain(&self, chain: &Chain) -> Result<()>;
    fn load_chain(&self) -> Result<Option<Chain>>;

    fn save_link(&self, link: &ChainBlockLink) -> Result<()>;
    fn get_link(&self, hash: &BlockHash) -> Result<Option<ChainBlockLink>>;
    fn delete_link(&self, hash: &BlockHash) -> Result<()>;
    fn load_links(&self) -> Result<Vec<ChainBlockLink>>;

    fn save_index_entry(&self, height: u64, hash: &BlockHash) -> Result<()>;
    fn get_index_entry(&self, height: u64) -> Result<Option<BlockHash>>;
    fn load_index(&self) -> Result<HashMap<u64, BlockHash>>;
}

fn encode<T: Encodable>(value: &T) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    value.consensus_encode(&mut bytes)?;
    Ok(bytes)
}

fn hash_from_vec(bytes: Vec<u8>) -> Result<BlockHash> {
    if bytes.len() != 32 {
        return Err(ChainError::corruption(format!(
            "hash column holds {} bytes, expected 32",
            bytes.len()
        )));
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes);
    Ok(hash)
}

pub struct SqliteChainStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteChainStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteChainStore")
            .field("conn", &"Mutex<Connection>")
            .finish()
    }
}

impl SqliteChainStore {
    pub fn new(db_path: &str) -> Result<Self> {
        Self::from_connection(Connection::open(db_path)?)
    }

    /// Private in-memory database; used by tests and throwaway nodes.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS block_headers (hash BLOB PRIMARY KEY, height INTEGER NOT NULL, prev_hash BLOB NOT NULL, header_data BLOB NOT NULL)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS blocks (hash BLOB PRIMARY KEY, block_data BLOB NOT NULL)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS transactions (txid BLOB PRIMARY KEY, block_hash BLOB, tx_data BLOB NOT NULL)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS chain_metadata (key TEXT PRIMARY KEY, value_text TEXT)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS chain_block_links (hash BLOB PRIMARY KEY, prev_hash BLOB NOT NULL, height INTEGER NOT NULL, execution_status INTEGER NOT NULL, is_linked INTEGER NOT NULL)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS chain_block_index (height INTEGER PRIMARY KEY, hash BLOB NOT NULL)",
            [],
        )?;
        Ok(SqliteChainStore {
            conn: Mutex::new(conn),
        })
    }
}

impl ChainStore for SqliteChainStore {
    fn save_header(&self, header: &BlockHeader) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let hash = header.get_hash();
        conn.execute(
            "INSERT OR REPLACE INTO block_headers (hash, height, prev_hash, header_data) VALUES (?1, ?2, ?3, ?4)",
            params![
                hash.to_vec(),
                header.height as i64,
                header.previous_block_hash.to_vec(),
                encode(header)?,
            ],
        )?;
        Ok(())
    }

    fn get_header(&self, hash: &BlockHash) -> Result<Option<BlockHeader>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT header_data FROM block_headers WHERE hash = ?1")?;
        let mut rows = stmt.query(params![hash.to_vec()])?;
        if let Some(row) = rows.next()? {
            let bytes: Vec<u8> = row.get(0)?;
            Ok(Some(BlockHeader::consensus_decode(&mut Cursor::new(
                bytes,
            ))?))
        } else {
            Ok(None)
        }
    }

    fn save_block(&self, block: &Block) -> Result<()> {
        let hash = block.get_hash();
        self.save_header(&block.header)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO blocks (hash, block_data) VALUES (?1, ?2)",
            params![hash.to_vec(), encode(block)?],
        )?;
        for tx in &block.transactions {
            conn.execute(
                "INSERT OR REPLACE INTO transactions (txid, block_hash, tx_data) VALUES (?1, ?2, ?3)",
                params![tx.get_txid().to_vec(), hash.to_vec(), encode(tx)?],
            )?;
        }
        Ok(())
    }

    fn get_block(&self, hash: &BlockHash) -> Result<Option<Block>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT block_data FROM blocks WHERE hash = ?1")?;
        let mut rows = stmt.query(params![hash.to_vec()])?;
        if let Some(row) = rows.next()? {
            let bytes: Vec<u8> = row.get(0)?;
            Ok(Some(Block::consensus_decode(&mut Cursor::new(bytes))?))
        } else {
            Ok(None)
        }
    }

    fn has_block(&self, hash: &BlockHash) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM block_headers WHERE hash = ?1",
            params![hash.to_vec()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn get_transaction(&self, txid: &BlockHash) -> Result<Option<TransactionData>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT tx_data FROM transactions WHERE txid = ?1")?;
        let mut rows = stmt.query(params![txid.to_vec()])?;
        if let Some(row) = rows.next()? {
            let bytes: Vec<u8> = row.get(0)?;
            Ok(Some(TransactionData::consensus_decode(&mut Cursor::new(
                bytes,
            ))?))
        } else {
            Ok(None)
        }
    }

    fn save_chain(&self, chain: &Chain) -> Result<()> {
        let json = serde_json::to_string(chain)
            .map_err(|e| ChainError::corruption(format!("chain record encode failed: {e}")))?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO chain_metadata (key, value_text) VALUES ('chain', ?1)",
            params![json],
        )?;
        Ok(())
    }

    fn load_chain(&self) -> Result<Option<Chain>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT value_text FROM chain_metadata WHERE key = 'chain'")?;
        let mut rows = stmt.query([])?;
        if let Some(row) = rows.next()? {
            let json: String = row.get(0)?;
            let chain = serde_json::from_str(&json)
                .map_err(|e| ChainError::corruption(format!("chain record decode failed: {e}")))?;
            Ok(Some(chain))
        } else {
            Ok(None)
        }
    }

    fn save_link(&self, link: &ChainBlockLink) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO chain_block_links (hash, prev_hash, height, execution_status, is_linked) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                link.block_hash.to_vec(),
                link.previous_block_hash.to_vec(),
                link.height as i64,
                link.execution_status.to_i64(),
                link.is_linked as i64,
            ],
        )?;
        Ok(())
    }

    fn get_link(&self, hash: &BlockHash) -> Result<Option<ChainBlockLink>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT prev_hash, height, execution_status, is_linked FROM chain_block_links WHERE hash = ?1",
        )?;
        let mut rows = stmt.query(params![hash.to_vec()])?;
        if let Some(row) = rows.next()? {
            let prev: Vec<u8> = row.get(0)?;
            let height: i64 = row.get(1)?;
            let status: i64 = row.get(2)?;
            let is_linked: i64 = row.get(3)?;
            Ok(Some(ChainBlockLink {
                block_hash: *hash,
                previous_block_hash: hash_from_vec(prev)?,
                height: height as u64,
                execution_status: ExecutionStatus::from_i64(status)?,
                is_linked: is_linked != 0,
            }))
        } else {
            Ok(None)
        }
    }

    fn delete_link(&self, hash: &BlockHash) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM chain_block_links WHERE hash = ?1",
            params![hash.to_vec()],
        )?;
        Ok(())
    }

    fn load_links(&self) -> Result<Vec<ChainBlockLink>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT hash, prev_hash, height, execution_status, is_linked FROM chain_block_links",
        )?;
        let mut rows = stmt.query([])?;
        let mut links = Vec::new();
        while let Some(row) = rows.next()? {
            let hash: Vec<u8> = row.get(0)?;
            let prev: Vec<u8> = row.get(1)?;
            let height: i64 = row.get(2)?;
            let status: i64 = row.get(3)?;
            let is_linked: i64 = row.get(4)?;
            links.push(ChainBlockLink {
                block_hash: hash_from_vec(hash)?,
                previous_block_hash: hash_from_vec(prev)?,
                height: height as u64,
                execution_status: ExecutionStatus::from_i64(status)?,
                is_linked: is_linked != 0,
            });
        }
        Ok(links)
    }

    fn save_index_entry(&self, height: u64, hash: &BlockHash) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO chain_block_index (height, hash) VALUES (?1, ?2)",
            params![height as i64, hash.to_vec()],
        )?;
        Ok(())
    }

    fn get_index_entry(&self, height: u64) -> Result<Option<BlockHash>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT hash FROM chain_block_index WHERE height = ?1")?;
        let mut rows = stmt.query(params![height as i64])?;
        if let Some(row) = rows.next()? {
            let bytes: Vec<u8> = row.get(0)?;
            Ok(Some(hash_from_vec(bytes)?))
        } else {
            Ok(None)
        }
    }

    fn load_index(&self) -> Result<HashMap<u64, BlockHash>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT height, hash FROM chain_block_index")?;
        let mut rows = stmt.query([])?;
        let mut index = HashMap::new();
        while let Some(row) = rows.next()? {
            let height: i64 = row.get(0)?;
            let bytes: Vec<u8> = row.get(1)?;
            index.insert(height as u64, hash_from_vec(bytes)?);
        }
        Ok(index)
    }
}
