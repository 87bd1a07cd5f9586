use thiserror::Error;

pub type TesseraResult<T> = Result<T, TesseraError>;

#[derive(Debug, Error)]
pub enum TesseraError {
    /// Malformed parameters or metadata, caught before any crypto or coding work.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("insufficient key shares for recombination: have {have}, need {need}")]
    InsufficientShares { have: usize, need: usize },

    #[error("insufficient shards for reconstruction: have {have}, need {need}")]
    InsufficientShards { have: usize, need: usize },

    #[error("invalid key share: {0}")]
    InvalidShare(String),

    #[error("key share recombination failed: {0}")]
    RecombinationFailure(String),

    #[error("authentication failed: ciphertext tampered or wrong key")]
    AuthenticationFailed,

    #[error("corrupt shard: {0}")]
    CorruptShard(String),

    #[error("short data: header declares {declared} bytes but only {available} were reconstructed")]
    ShortData { declared: u64, available: u64 },

    #[error("unsupported cipher suite: {0}")]
    UnsupportedCipher(String),

    #[error("no active master key")]
    NoActiveKey,

    #[error("master key not found: {0}")]
    KeyNotFound(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("no key fragments stored for file {0}")]
    NoFragments(String),

    #[error("incomplete key fragments for file {file_id}: found {found}, expected {expected}")]
    IncompleteFragments {
        file_id: String,
        found: usize,
        expected: usize,
    },

    #[error("integrity mismatch: {0}")]
    IntegrityMismatch(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TesseraError {
    /// Quorum failures: retrying once more nodes or shares are reachable may succeed.
    pub fn is_quorum(&self) -> bool {
        matches!(
            self,
            TesseraError::InsufficientShares { .. }
                | TesseraError::InsufficientShards { .. }
                | TesseraError::IncompleteFragments { .. }
        )
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        TesseraError::Validation(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_message_is_actionable() {
        let err = TesseraError::InsufficientShards { have: 3, need: 4 };
        assert_eq!(
            err.to_string(),
            "insufficient shards for reconstruction: have 3, need 4"
        );
        assert!(err.is_quorum());
    }

    #[test]
    fn corruption_is_not_quorum() {
        assert!(!TesseraError::CorruptShard("len".into()).is_quorum());
        assert!(!TesseraError::AuthenticationFailed.is_quorum());
    }
}
