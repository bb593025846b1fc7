pub mod amount;
pub mod api;
pub mod client;
pub mod crypto;
pub mod error;
pub mod merkle;

pub use api::{MixDuration, RequestStatus};
pub use client::{ClientConfig, MixerClient};
pub use error::{Result, SdkError};
pub use merkle::{MerkleProof, MerkleTree};
