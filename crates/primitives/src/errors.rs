use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid hex string '{0}'")]
    InvalidHex(String),

    #[error("invalid decimal amount '{0}'")]
    InvalidAmount(String),

    #[error("invalid base58 string")]
    InvalidBase58,

    #[error("unknown contract '{0}'")]
    UnknownContract(String),

    #[error("unknown tx type code {0}")]
    UnknownTxType(u32),
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid secret key")]
    InvalidSecretKey,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid signature encoding")]
    InvalidSignature,

    #[error("base58: {0}")]
    Base58(#[from] bs58::decode::Error),
}
