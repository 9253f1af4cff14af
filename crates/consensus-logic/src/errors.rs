use mirach_blocklog::BlockLogError;
use mirach_db::DbError;
use mirach_steemio::ClientError;
use mirach_txexec::TxError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("block {got} is not next (head {head})")]
    NotNextBlock { got: u64, head: u64 },

    #[error("invalid phash on block {0}")]
    InvalidPhash(u64),

    #[error("invalid hash on block {0}")]
    InvalidHash(u64),

    #[error("invalid signature on block {0}")]
    InvalidSignature(u64),

    #[error("witness '{0}' not authorized for block {1}")]
    UnauthorizedWitness(String, u64),

    #[error("block {id} too early: ts {ts} < min {min}")]
    BlockTooEarly { id: u64, ts: u64, min: u64 },

    #[error("block {0} anchors {1}, expected {2}")]
    BadAnchor(u64, u64, u64),

    #[error("upstream-bound txs of block {0} don't match upstream block {1}")]
    BoundTxMismatch(u64, u64),

    #[error("tx {0} failed: {1}")]
    TxFailed(String, TxError),

    #[error("upstream block {0} unavailable")]
    MissingUpstream(u64),

    #[error("genesis hash mismatch: computed {computed}, expected {expected}")]
    GenesisMismatch { computed: String, expected: String },

    #[error("steem client: {0}")]
    Steem(#[from] ClientError),

    #[error("block store: {0}")]
    BlockLog(#[from] BlockLogError),

    #[error("db: {0}")]
    Db(#[from] DbError),

    #[error("{0}")]
    Other(String),
}
