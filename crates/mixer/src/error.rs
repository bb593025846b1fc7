use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::model::RequestStatus;

pub type Result<T> = std::result::Result<T, MixerError>;

#[derive(Error, Debug)]
pub enum MixerError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Target amounts sum to {actual}, expected {expected} (total minus fee)")]
    TargetAmountMismatch { expected: u64, actual: u64 },

    #[error("Invalid split count {0}: must be between 1 and 5")]
    InvalidSplitCount(u32),

    #[error("Insufficient bonded capacity: requested {requested}, available {available}")]
    InsufficientCapacity { requested: u64, available: u64 },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cannot {action} request {id} in status {status}")]
    InvalidState {
        id: String,
        status: RequestStatus,
        action: &'static str,
    },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Request not withdrawable until {0}")]
    NotWithdrawable(chrono::DateTime<chrono::Utc>),

    #[error("Deposit not confirmed: {0}")]
    DepositNotConfirmed(String),

    #[error("{0} target(s) not yet delivered")]
    TargetsNotDelivered(usize),

    #[error("Need at least {required} active pool accounts, have {available}")]
    InsufficientPools { available: usize, required: usize },

    #[error("Pool balance invariant violated: {0}")]
    BalanceInvariant(String),

    #[error("Chain error: {0}")]
    Chain(String),

    #[error("Chain call timed out: {0}")]
    ChainTimeout(String),

    #[error("Custodian error: {0}")]
    Custodian(String),

    #[error("Cryptographic error: {0}")]
    Crypto(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Solana client error: {0}")]
    SolanaClient(#[from] solana_client::client_error::ClientError),
}

impl MixerError {
    /// Infrastructure failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MixerError::Chain(_)
                | MixerError::ChainTimeout(_)
                | MixerError::Store(_)
                | MixerError::SolanaClient(_)
        )
    }
}

impl IntoResponse for MixerError {
    fn into_response(self) -> Response {
        let status = match &self {
            MixerError::InvalidAmount(_)
            | MixerError::TargetAmountMismatch { .. }
            | MixerError::InvalidSplitCount(_)
            | MixerError::InsufficientCapacity { .. }
            | MixerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            MixerError::AccountNotFound(_) => StatusCode::UNAUTHORIZED,
            MixerError::NotFound(_) => StatusCode::NOT_FOUND,
            MixerError::InvalidState { .. }
            | MixerError::Conflict(_)
            | MixerError::NotWithdrawable(_) => StatusCode::CONFLICT,
            MixerError::DepositNotConfirmed(_) | MixerError::TargetsNotDelivered(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            MixerError::InsufficientPools { .. } => StatusCode::SERVICE_UNAVAILABLE,
            MixerError::Chain(_) | MixerError::SolanaClient(_) => StatusCode::BAD_GATEWAY,
            MixerError::ChainTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            MixerError::BalanceInvariant(_)
            | MixerError::Custodian(_)
            | MixerError::Crypto(_)
            | MixerError::Store(_)
            | MixerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "success": false,
            "error": self.to_string(),
        }));

        (status, body).into_response()
    }
}
