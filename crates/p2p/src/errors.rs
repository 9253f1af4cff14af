use thiserror::Error;

#[derive(Debug, Error)]
pub enum P2pError {
    #[error("websocket: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("origin mismatch from peer")]
    OriginMismatch,

    #[error("peer limit reached")]
    PeerLimit,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
