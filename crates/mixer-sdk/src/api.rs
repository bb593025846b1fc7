//! Request and response bodies of the mixer HTTP API.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::amount::decimal;
use crate::crypto::EncryptedTargets;
use crate::error::SdkError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Deposited,
    Mixing,
    Completed,
    Withdrawable,
    Refunded,
    Disputed,
    Resolved,
}

impl RequestStatus {
    pub const ALL: [RequestStatus; 8] = [
        RequestStatus::Pending,
        RequestStatus::Deposited,
        RequestStatus::Mixing,
        RequestStatus::Completed,
        RequestStatus::Withdrawable,
        RequestStatus::Refunded,
        RequestStatus::Disputed,
        RequestStatus::Resolved,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Deposited => "deposited",
            RequestStatus::Mixing => "mixing",
            RequestStatus::Completed => "completed",
            RequestStatus::Withdrawable => "withdrawable",
            RequestStatus::Refunded => "refunded",
            RequestStatus::Disputed => "disputed",
            RequestStatus::Resolved => "resolved",
        }
    }

    /// No further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Refunded | RequestStatus::Resolved)
    }

    /// Scheduled transfers of a request in this status must not run.
    pub fn halts_execution(&self) -> bool {
        matches!(
            self,
            RequestStatus::Withdrawable
                | RequestStatus::Refunded
                | RequestStatus::Disputed
                | RequestStatus::Resolved
        )
    }

    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, next),
            (Pending, Deposited)
                | (Deposited, Mixing)
                | (Deposited, Withdrawable)
                | (Mixing, Completed)
                | (Mixing, Withdrawable)
                | (Withdrawable, Refunded)
                | (Completed, Disputed)
                | (Disputed, Resolved)
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Length of the mixing window chosen by the user.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MixDuration {
    #[serde(rename = "30m", alias = "30min")]
    ThirtyMinutes,
    #[default]
    #[serde(rename = "1h", alias = "1hour")]
    OneHour,
    #[serde(rename = "24h", alias = "24hour", alias = "1d")]
    OneDay,
    #[serde(rename = "7d", alias = "7day")]
    SevenDays,
}

impl MixDuration {
    pub const ALL: [MixDuration; 4] = [
        MixDuration::ThirtyMinutes,
        MixDuration::OneHour,
        MixDuration::OneDay,
        MixDuration::SevenDays,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MixDuration::ThirtyMinutes => "30m",
            MixDuration::OneHour => "1h",
            MixDuration::OneDay => "24h",
            MixDuration::SevenDays => "7d",
        }
    }

    pub fn as_secs(&self) -> i64 {
        match self {
            MixDuration::ThirtyMinutes => 30 * 60,
            MixDuration::OneHour => 60 * 60,
            MixDuration::OneDay => 24 * 60 * 60,
            MixDuration::SevenDays => 7 * 24 * 60 * 60,
        }
    }

    pub fn as_chrono(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.as_secs())
    }

    /// Internal obfuscation hops scheduled for a window of this length.
    pub fn hop_count(&self) -> u32 {
        match self {
            MixDuration::ThirtyMinutes | MixDuration::OneHour => 5,
            MixDuration::OneDay => 10,
            MixDuration::SevenDays => 20,
        }
    }
}

impl FromStr for MixDuration {
    type Err = SdkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "30m" | "30min" => Ok(MixDuration::ThirtyMinutes),
            "1h" | "1hour" => Ok(MixDuration::OneHour),
            "24h" | "24hour" | "1d" => Ok(MixDuration::OneDay),
            "7d" | "7day" => Ok(MixDuration::SevenDays),
            other => Err(SdkError::UnknownDuration(other.to_string())),
        }
    }
}

impl fmt::Display for MixDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TargetSpec {
    pub address: String,
    /// Decimal string, minor units.
    pub amount: String,
}

/// Body of `POST /request`. Amounts stay strings here so malformed input
/// surfaces as a validation error instead of a JSON rejection.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct CreateMixRequest {
    #[serde(default)]
    pub token: Option<String>,
    pub amount: String,
    #[serde(default)]
    pub targets: Vec<TargetSpec>,
    /// Targets sealed to the service's encryption key, used instead of `targets`.
    #[serde(default)]
    pub encrypted_targets: Option<EncryptedTargets>,
    #[serde(default)]
    pub split_count: Option<u32>,
    #[serde(default)]
    pub mix_duration: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ConfirmDepositRequest {
    pub tx_refs: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ClaimRequest {
    pub claim_address: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TargetView {
    pub address: String,
    #[serde(with = "decimal")]
    pub amount: u64,
    pub delivered: bool,
    pub delivery_txs: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MixRequestView {
    pub id: String,
    pub status: RequestStatus,
    pub token: String,
    #[serde(with = "decimal")]
    pub total_amount: u64,
    #[serde(with = "decimal")]
    pub service_fee: u64,
    #[serde(with = "decimal")]
    pub net_amount: u64,
    pub split_count: u32,
    pub mix_duration: MixDuration,
    pub deposit_address: String,
    pub deposit_txs: Vec<String>,
    pub targets: Vec<TargetView>,
    pub request_commitment: Option<String>,
    pub tee_signature: Option<String>,
    pub mix_start: Option<DateTime<Utc>>,
    pub mix_end: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub has_completion_proof: bool,
    pub refund_tx: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ListRequestsResponse {
    pub requests: Vec<MixRequestView>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

/// Inclusion proof of one delivered output in the completion Merkle tree.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct OutputProof {
    pub index: usize,
    pub address: String,
    #[serde(with = "decimal")]
    pub amount: u64,
    pub nonce: String,
    pub leaf: String,
    pub siblings: Vec<String>,
    /// `true` when the sibling at that depth sits to the right.
    pub sibling_is_right: Vec<bool>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CompletionProofResponse {
    pub request_id: String,
    pub service_id: String,
    pub merkle_root: String,
    pub signature: String,
    pub signer: String,
    pub timestamp: i64,
    pub output_count: usize,
    pub outputs: Vec<OutputProof>,
    pub submission_tx: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DisputeResponse {
    pub request_id: String,
    pub status: RequestStatus,
    pub submission_tx: String,
    pub resolution_deadline: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ClaimResponse {
    pub claim_id: String,
    pub request_id: String,
    #[serde(with = "decimal")]
    pub amount: u64,
    pub claim_address: String,
    pub claimable_at: DateTime<Utc>,
    pub status: RequestStatus,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct StatsResponse {
    pub total_requests: u64,
    pub by_status: std::collections::BTreeMap<String, u64>,
    #[serde(with = "decimal")]
    pub total_volume: u64,
    #[serde(with = "decimal")]
    pub completed_volume: u64,
    pub active_pools: u64,
    pub retiring_pools: u64,
    #[serde(with = "decimal")]
    pub pool_balance: u64,
    pub scheduled_transactions: u64,
    pub failed_transactions: u64,
    #[serde(with = "decimal")]
    pub bond_amount: u64,
    #[serde(with = "decimal")]
    pub outstanding_amount: u64,
    #[serde(with = "decimal")]
    pub available_capacity: u64,
    /// Completed / (completed + refunded), 1.0 when nothing has finished yet.
    pub success_rate: f64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct InfoResponse {
    pub service_id: String,
    /// Custodian signing key (base58).
    pub custodian_pubkey: String,
    /// X25519 key for sealing targets (hex).
    pub encryption_pubkey: String,
    pub fee_bps: u16,
    pub min_split_count: u32,
    pub max_split_count: u32,
    pub durations: Vec<MixDuration>,
    pub grace_period_secs: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}
