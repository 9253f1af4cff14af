use mirach_db::DbError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TxError {
    #[error("invalid tx: {0}")]
    Invalid(String),

    #[error("insufficient balance for '{0}'")]
    InsufficientBalance(String),

    #[error("unknown account '{0}'")]
    UnknownAccount(String),

    #[error("db: {0}")]
    Db(#[from] DbError),
}

pub type TxResult<T> = Result<T, TxError>;
