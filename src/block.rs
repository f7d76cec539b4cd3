// Block identities and the wire codec used for storage blobs.

use std::io::{Error as IoError, ErrorKind as IoErrorKind, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use sha2::{Digest, Sha256};

/// Content address of a block header or transaction.
pub type BlockHash = [u8; 32];

/// Null hash. Used as the genesis block's parent pointer and as the
/// genesis sentinel accepted by branch-switch queries.
pub const ZERO_HASH: BlockHash = [0u8; 32];

pub trait Encodable {
    fn consensus_encode<W: Write>(&self, w: &mut W) -> Result<usize, IoError>;
}

pub trait Decodable: Sized {
    fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, IoError>;
}

fn write_var_int<W: Write>(w: &mut W, n: u64) -> Result<usize, IoError> {
    if n < 0xfd {
        w.write_u8(n as u8)?;
        Ok(1)
    } else if n <= 0xffff {
        w.write_u8(0xfd)?;
        w.write_u16::<LittleEndian>(n as u16)?;
        Ok(3)
    } else if n <= 0xffff_ffff {
        w.write_u8(0xfe)?;
        w.write_u32::<LittleEndian>(n as u32)?;
        Ok(5)
    } else {
        w.write_u8(0xff)?;
        w.write_u64::<LittleEndian>(n)?;
        Ok(9)
    }
}

fn read_var_int<R: Read>(r: &mut R) -> Result<u64, IoError> {
    match r.read_u8()? {
        0xfd => Ok(r.read_u16::<LittleEndian>()? as u64),
        0xfe => Ok(r.read_u32::<LittleEndian>()? as u64),
        0xff => r.read_u64::<LittleEndian>(),
        n => Ok(n as u64),
    }
}

fn double_sha256(bytes: &[u8]) -> BlockHash {
    let first = Sha256::digest(bytes);
    let second = Sha256::digest(first);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&second);
    hash
}

/// Block header. Carries its own height so branch walks can compare
/// positions without consulting the fork tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub previous_block_hash: BlockHash,
    pub merkle_root: BlockHash,
    pub timestamp: u32,
    pub height: u64,
}

impl BlockHeader {
    pub fn get_hash(&self) -> BlockHash {
        let mut bytes = Vec::with_capacity(80);
        // Writing into a Vec cannot fail.
        self.consensus_encode(&mut bytes).unwrap();
        double_sha256(&bytes)
    }
}

impl Encodable for BlockHeader {
    fn consensus_encode<W: Write>(&self, w: &mut W) -> Result<usize, IoError> {
        w.write_i32::<LittleEndian>(self.version)?;
        w.write_all(&self.previous_block_hash)?;
        w.write_all(&self.merkle_root)?;
        w.write_u32::<LittleEndian>(self.timestamp)?;
        w.write_u64::<LittleEndian>(self.height)?;
        Ok(4 + 32 + 32 + 4 + 8)
    }
}

impl Decodable for BlockHeader {
    fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, IoError> {
        let version = r.read_i32::<LittleEndian>()?;
        let mut previous_block_hash = [0u8; 32];
        r.read_exact(&mut previous_block_hash)?;
        let mut merkle_root = [0u8; 32];
        r.read_exact(&mut merkle_root)?;
        let timestamp = r.read_u32::<LittleEndian>()?;
        let height = r.read_u64::<LittleEndian>()?;
        Ok(BlockHeader {
            version,
            previous_block_hash,
            merkle_root,
            timestamp,
            height,
        })
    }
}

/// Opaque transaction payload. Execution semantics are out of scope for
/// this crate; the ledger store only needs a content id per transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionData {
    pub version: i32,
    pub payload: Vec<u8>,
}

impl TransactionData {
    pub fn get_txid(&self) -> BlockHash {
        let mut bytes = Vec::with_capacity(4 + self.payload.len());
        self.consensus_encode(&mut bytes).unwrap();
        double_sha256(&bytes)
    }
}

impl Encodable for TransactionData {
    fn consensus_encode<W: Write>(&self, w: &mut W) -> Result<usize, IoError> {
        let mut written = 0;
        w.write_i32::<LittleEndian>(self.version)?;
        written += 4;
        written += write_var_int(w, self.payload.len() as u64)?;
        w.write_all(&self.payload)?;
        written += self.payload.len();
        Ok(written)
    }
}

impl Decodable for TransactionData {
    fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, IoError> {
        let version = r.read_i32::<LittleEndian>()?;
        let len = read_var_int(r)?;
        if len > 32 * 1024 * 1024 {
            return Err(IoError::new(
                IoErrorKind::InvalidData,
                "transaction payload length out of range",
            ));
        }
        let mut payload = vec![0u8; len as usize];
        r.read_exact(&mut payload)?;
        Ok(TransactionData { version, payload })
    }
}

/// Full block: header plus transaction list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<TransactionData>,
}

impl Block {
    pub fn get_hash(&self) -> BlockHash {
        self.header.get_hash()
    }

    pub fn tx_ids(&self) -> Vec<BlockHash> {
        self.transactions.iter().map(|tx| tx.get_txid()).collect()
    }
}

impl Encodable for Block {
    fn consensus_encode<W: Write>(&self, w: &mut W) -> Result<usize, IoError> {
        let mut written = self.header.consensus_encode(w)?;
        written += write_var_int(w, self.transactions.len() as u64)?;
        for tx in &self.transactions {
            written += tx.consensus_encode(w)?;
        }
        Ok(written)
    }
}

impl Decodable for Block {
    fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, IoError> {
        let header = BlockHeader::consensus_decode(r)?;
        let count = read_var_int(r)?;
        if count > 100_000 {
            return Err(IoError::new(
                IoErrorKind::InvalidData,
                "transaction count out of range",
            ));
        }
        let mut transactions = Vec::with_capacity(count as usize);
        for _ in 0..count {
            transactions.push(TransactionData::consensus_decode(r)?);
        }
        Ok(Block {
            header,
            transactions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_header() -> BlockHeader {
        BlockHeader {
            version: 1,
            previous_block_hash: [7u8; 32],
            merkle_root: [9u8; 32],
            timestamp: 1_546_790_318,
            height: 42,
        }
    }

    #[test]
    fn header_roundtrip() {
        let header = sample_header();
        let mut bytes = Vec::new();
        header.consensus_encode(&mut bytes).unwrap();
        let decoded = BlockHeader::consensus_decode(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn header_hash_depends_on_height() {
        let a = sample_header();
        let mut b = sample_header();
        b.height += 1;
        assert_ne!(a.get_hash(), b.get_hash());
    }

    #[test]
    fn block_roundtrip_with_transactions() {
        let block = Block {
            header: sample_header(),
            transactions: vec![
                TransactionData {
                    version: 1,
                    payload: vec![1, 2, 3],
                },
                TransactionData {
                    version: 1,
                    payload: Vec::new(),
                },
            ],
        };
        let mut bytes = Vec::new();
        block.consensus_encode(&mut bytes).unwrap();
        let decoded = Block::consensus_decode(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.tx_ids().len(), 2);
    }
}
