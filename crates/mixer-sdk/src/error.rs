use thiserror::Error;

pub type Result<T> = std::result::Result<T, SdkError>;

/// Client-side failures. Server rejections arrive as
/// `Network(NetworkError::Api { .. })` with the HTTP status.
#[derive(Error, Debug)]
pub enum SdkError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Unknown mix duration: {0}")]
    UnknownDuration(String),

    #[error("Target sealing failed: {0}")]
    Crypto(String),

    #[error("Target encoding failed: {0}")]
    Serialization(String),

    #[error("Request failed: {0}")]
    Network(#[from] mixer_network::NetworkError),

    #[error("Cannot build completion tree: {0}")]
    MerkleTree(String),

    #[error("Completion proof rejected: {0}")]
    InvalidProof(String),

    #[error("Tor connection required: {0}")]
    TorRequired(String),
}
