use thiserror::Error;

/// Error taxonomy for the chain-state core.
///
/// `NotFound` and `InvalidArgument` are ordinary flow-control outcomes the
/// caller handles; `Corruption` means the fork tree itself is inconsistent
/// and must stop automatic state mutation rather than self-repair.
#[derive(Debug, Error)]
pub enum ChainError {
    /// Referenced hash or height has no corresponding stored entity.
    #[error("{0} not found")]
    NotFound(String),

    /// Structural inconsistency in the fork tree or the stored chain.
    #[error("chain corruption: {0}")]
    Corruption(String),

    /// Malformed caller input.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Database failure, propagated unchanged; retry policy is the caller's.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Wire codec failure while encoding or decoding stored bytes.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Settings could not be loaded or deserialized.
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),
}

impl ChainError {
    pub fn not_found(what: impl Into<String>) -> Self {
        ChainError::NotFound(what.into())
    }

    pub fn corruption(msg: impl Into<String>) -> Self {
        ChainError::Corruption(msg.into())
    }
}
