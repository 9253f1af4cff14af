use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("duplicate key '{0}' in collection '{1}'")]
    DuplicateKey(String, String),

    #[error("document is not an object")]
    NotAnObject,

    #[error("unsupported update operator '{0}'")]
    UnknownOperator(String),

    #[error("$inc target at '{0}' is not numeric")]
    IncNotNumeric(String),

    #[error("$inc at '{0}' out of range")]
    IncOutOfRange(String),

    #[error("$push target at '{0}' is not an array")]
    PushNotArray(String),

    #[error("malformed update document")]
    MalformedUpdate,

    #[error("rocksdb: {0}")]
    Rocks(#[from] rocksdb::Error),

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type DbResult<T> = Result<T, DbError>;
