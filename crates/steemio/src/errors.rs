use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("empty response")]
    EmptyResponse,

    #[error("malformed response: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("all endpoints failed")]
    AllEndpointsFailed,
}
