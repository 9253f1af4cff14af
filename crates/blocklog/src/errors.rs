use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlockLogError {
    #[error("block {0} out of range")]
    OutOfRange(i64),

    #[error("tried to append block {got}, expected {expect}")]
    OutOfOrder { got: u64, expect: u64 },

    #[error("block store corrupt: {0}")]
    Corrupt(String),

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
