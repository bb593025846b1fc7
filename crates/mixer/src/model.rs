//! Durable records kept by the [`Store`](crate::store::Store).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mixer_sdk::api::{MixRequestView, TargetView};
pub use mixer_sdk::{MixDuration, RequestStatus};

use crate::error::{MixerError, Result};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Target {
    pub address: String,
    pub amount: u64,
    /// Blinds the target's completion leaf.
    pub nonce: String,
    /// Number of delivery transfers the amount is split into.
    pub parts: u32,
    pub parts_delivered: u32,
    pub delivered: bool,
    pub delivery_txs: Vec<String>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl Target {
    pub fn new(address: String, amount: u64, nonce: String, parts: u32) -> Self {
        Self {
            address,
            amount,
            nonce,
            parts,
            parts_delivered: 0,
            delivered: false,
            delivery_txs: Vec::new(),
            delivered_at: None,
        }
    }

    /// Records one confirmed delivery part; flips `delivered` on the last one.
    pub fn record_delivery(&mut self, tx_ref: &str, now: DateTime<Utc>) {
        if self.delivered || self.delivery_txs.iter().any(|t| t == tx_ref) {
            return;
        }
        self.delivery_txs.push(tx_ref.to_string());
        self.parts_delivered += 1;
        if self.parts_delivered >= self.parts {
            self.delivered = true;
            self.delivered_at = Some(now);
        }
    }
}

/// Splits `amount` into `parts` pieces, remainder on the last.
pub fn split_amount(amount: u64, parts: u32) -> Vec<u64> {
    let parts = parts.max(1) as u64;
    let base = amount / parts;
    let mut out = vec![base; parts as usize];
    if let Some(last) = out.last_mut() {
        *last += amount - base * parts;
    }
    out
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompletionProof {
    pub merkle_root: String,
    pub signature: String,
    pub signer: String,
    pub service_id: String,
    pub timestamp: i64,
    pub output_count: usize,
    pub submission_tx: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RefundInfo {
    pub claim_id: String,
    pub refund_tx: String,
    pub refunded_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MixRequest {
    pub id: String,
    pub account_id: String,
    pub token: String,
    pub total_amount: u64,
    pub service_fee: u64,
    pub net_amount: u64,
    pub mix_duration: MixDuration,
    pub split_count: u32,
    pub targets: Vec<Target>,
    pub deposit_address: String,
    pub deposit_pool_id: String,
    pub deposit_txs: Vec<String>,
    pub request_commitment: Option<String>,
    pub tee_signature: Option<String>,
    pub mix_start: Option<DateTime<Utc>>,
    pub mix_end: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub completion_proof: Option<CompletionProof>,
    pub refund: Option<RefundInfo>,
    pub error: Option<String>,
    pub early_warning_logged: bool,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl MixRequest {
    pub fn all_delivered(&self) -> bool {
        self.targets.iter().all(|t| t.delivered)
    }

    pub fn undelivered_count(&self) -> usize {
        self.targets.iter().filter(|t| !t.delivered).count()
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }

    /// Moves to `next` if the lifecycle allows it.
    pub fn transition(&mut self, next: RequestStatus, action: &'static str, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(MixerError::InvalidState {
                id: self.id.clone(),
                status: self.status,
                action,
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn require_status(&self, expected: RequestStatus, action: &'static str) -> Result<()> {
        if self.status != expected {
            return Err(MixerError::InvalidState {
                id: self.id.clone(),
                status: self.status,
                action,
            });
        }
        Ok(())
    }

    pub fn to_view(&self) -> MixRequestView {
        MixRequestView {
            id: self.id.clone(),
            status: self.status,
            token: self.token.clone(),
            total_amount: self.total_amount,
            service_fee: self.service_fee,
            net_amount: self.net_amount,
            split_count: self.split_count,
            mix_duration: self.mix_duration,
            deposit_address: self.deposit_address.clone(),
            deposit_txs: self.deposit_txs.clone(),
            targets: self
                .targets
                .iter()
                .map(|t| TargetView {
                    address: t.address.clone(),
                    amount: t.amount,
                    delivered: t.delivered,
                    delivery_txs: t.delivery_txs.clone(),
                })
                .collect(),
            request_commitment: self.request_commitment.clone(),
            tee_signature: self.tee_signature.clone(),
            mix_start: self.mix_start,
            mix_end: self.mix_end,
            deadline: self.deadline,
            has_completion_proof: self.completion_proof.is_some(),
            refund_tx: self.refund.as_ref().map(|r| r.refund_tx.clone()),
            error: self.error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolStatus {
    Active,
    Retiring,
}

/// Balance change applied to a pool account. Every variant is checked; a
/// mutation that would underflow is refused as a whole.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolMutation {
    ExpectIncoming(u64),
    CancelIncoming(u64),
    SettleIncoming(u64),
    ReserveOutgoing(u64),
    ReleaseOutgoing(u64),
    SettleOutgoing(u64),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolAccount {
    pub id: String,
    pub pool_index: u32,
    pub custodian_pubkey: String,
    pub master_pubkey: String,
    pub policy_script: String,
    pub address: String,
    pub status: PoolStatus,
    pub balance: u64,
    pub pending_in: u64,
    pub pending_out: u64,
    pub total_received: u64,
    pub total_sent: u64,
    pub transaction_count: u64,
    pub created_at: DateTime<Utc>,
    pub retire_after: DateTime<Utc>,
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl PoolAccount {
    /// Balance not already promised to an outgoing transfer.
    pub fn spendable(&self) -> u64 {
        self.balance.saturating_sub(self.pending_out)
    }

    pub fn is_drained(&self) -> bool {
        self.balance == 0 && self.pending_in == 0 && self.pending_out == 0
    }

    pub fn due_for_rotation(&self, now: DateTime<Utc>, tx_threshold: u64) -> bool {
        self.status == PoolStatus::Active
            && (now >= self.retire_after || self.transaction_count >= tx_threshold)
    }

    pub fn apply(&mut self, mutation: PoolMutation, now: DateTime<Utc>) -> Result<()> {
        let underflow = |what: &str, have: u64, amount: u64| {
            MixerError::BalanceInvariant(format!(
                "pool {}: {} {} < {}",
                self.id, what, have, amount
            ))
        };

        match mutation {
            PoolMutation::ExpectIncoming(a) => {
                self.pending_in = self.pending_in.saturating_add(a);
            }
            PoolMutation::CancelIncoming(a) => {
                self.pending_in = self
                    .pending_in
                    .checked_sub(a)
                    .ok_or_else(|| underflow("pending_in", self.pending_in, a))?;
            }
            PoolMutation::SettleIncoming(a) => {
                let pending_in = self
                    .pending_in
                    .checked_sub(a)
                    .ok_or_else(|| underflow("pending_in", self.pending_in, a))?;
                self.pending_in = pending_in;
                self.balance = self.balance.saturating_add(a);
                self.total_received = self.total_received.saturating_add(a);
                self.transaction_count += 1;
                self.last_activity_at = Some(now);
            }
            PoolMutation::ReserveOutgoing(a) => {
                if self.spendable() < a {
                    return Err(underflow("spendable", self.spendable(), a));
                }
                self.pending_out += a;
            }
            PoolMutation::ReleaseOutgoing(a) => {
                self.pending_out = self
                    .pending_out
                    .checked_sub(a)
                    .ok_or_else(|| underflow("pending_out", self.pending_out, a))?;
            }
            PoolMutation::SettleOutgoing(a) => {
                let pending_out = self
                    .pending_out
                    .checked_sub(a)
                    .ok_or_else(|| underflow("pending_out", self.pending_out, a))?;
                let balance = self
                    .balance
                    .checked_sub(a)
                    .ok_or_else(|| underflow("balance", self.balance, a))?;
                self.pending_out = pending_out;
                self.balance = balance;
                self.total_sent = self.total_sent.saturating_add(a);
                self.transaction_count += 1;
                self.last_activity_at = Some(now);
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxKind {
    /// User deposit into a pool, observed rather than sent.
    Deposit,
    /// Pool to pool obfuscation hop or migration.
    Internal,
    /// Pool to target address.
    Delivery,
    /// Small request-less pool to pool transfer that only adds cover traffic.
    Decoy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MixTxStatus {
    Scheduled,
    Executing,
    Executed,
    Confirmed,
    Failed,
    Cancelled,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Destination {
    Pool(String),
    External(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MixTransaction {
    pub id: String,
    pub kind: TxKind,
    pub status: MixTxStatus,
    /// `None` for pool migrations and decoys.
    pub request_id: Option<String>,
    /// `None` for deposits.
    pub source_pool_id: Option<String>,
    pub destination: Destination,
    pub target_index: Option<usize>,
    pub amount: u64,
    pub scheduled_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub tx_ref: Option<String>,
    /// Signed bytes (base58) kept so an unknown outcome is resent verbatim.
    pub raw_tx: Option<String>,
    pub confirmation_block: Option<u64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl MixTransaction {
    #[allow(clippy::too_many_arguments)]
    pub fn scheduled(
        kind: TxKind,
        request_id: Option<String>,
        source_pool_id: Option<String>,
        destination: Destination,
        amount: u64,
        scheduled_at: DateTime<Utc>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            status: MixTxStatus::Scheduled,
            request_id,
            source_pool_id,
            destination,
            target_index: None,
            amount,
            scheduled_at,
            attempts: 0,
            max_attempts,
            tx_ref: None,
            raw_tx: None,
            confirmation_block: None,
            error: None,
            created_at: now,
            updated_at: now,
            executed_at: None,
            confirmed_at: None,
        }
    }

    pub fn destination_pool(&self) -> Option<&str> {
        match &self.destination {
            Destination::Pool(id) => Some(id),
            Destination::External(_) => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimStatus {
    Pending,
    Paid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WithdrawalClaim {
    pub id: String,
    pub request_id: String,
    pub account_id: String,
    pub amount: u64,
    pub claim_address: String,
    pub status: ClaimStatus,
    pub claimable_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub refund_tx: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Active,
    Suspended,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub service_id: String,
    pub custodian_pubkey: String,
    pub bond_amount: u64,
    pub outstanding_amount: u64,
    pub max_outstanding: u64,
    pub status: ServiceStatus,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServiceRegistration {
    pub fn capacity_limit(&self) -> u64 {
        self.bond_amount.min(self.max_outstanding)
    }

    pub fn available_capacity(&self) -> u64 {
        if self.status != ServiceStatus::Active {
            return 0;
        }
        self.capacity_limit().saturating_sub(self.outstanding_amount)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisputeStatus {
    Open,
    Upheld,
    Rejected,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DisputeRecord {
    pub request_id: String,
    pub request_commitment: Option<String>,
    pub merkle_root: String,
    pub custodian_signature: String,
    pub submission_tx: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub resolution_deadline: DateTime<Utc>,
    pub status: DisputeStatus,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> PoolAccount {
        let now = Utc::now();
        PoolAccount {
            id: "pool-1".into(),
            pool_index: 0,
            custodian_pubkey: String::new(),
            master_pubkey: String::new(),
            policy_script: String::new(),
            address: String::new(),
            status: PoolStatus::Active,
            balance: 0,
            pending_in: 0,
            pending_out: 0,
            total_received: 0,
            total_sent: 0,
            transaction_count: 0,
            created_at: now,
            retire_after: now + chrono::Duration::days(30),
            last_activity_at: None,
        }
    }

    #[test]
    fn test_split_amount_remainder_on_last() {
        assert_eq!(split_amount(1000, 3), vec![333, 333, 334]);
        assert_eq!(split_amount(995, 1), vec![995]);
        assert_eq!(split_amount(2, 5), vec![0, 0, 0, 0, 2]);
        assert_eq!(split_amount(10, 0), vec![10]);
    }

    #[test]
    fn test_pool_balance_never_negative() {
        let now = Utc::now();
        let mut p = pool();
        p.apply(PoolMutation::ExpectIncoming(100), now).unwrap();
        p.apply(PoolMutation::SettleIncoming(100), now).unwrap();
        p.apply(PoolMutation::ReserveOutgoing(60), now).unwrap();

        // only 40 spendable now
        assert!(p.apply(PoolMutation::ReserveOutgoing(50), now).is_err());
        assert!(p.apply(PoolMutation::SettleOutgoing(70), now).is_err());
        assert_eq!(p.balance, 100);
        assert_eq!(p.pending_out, 60);

        p.apply(PoolMutation::SettleOutgoing(60), now).unwrap();
        assert_eq!(p.balance, 40);
        assert_eq!(p.total_sent, 60);
        assert_eq!(p.transaction_count, 2);
    }

    #[test]
    fn test_failed_settle_leaves_pool_untouched() {
        let now = Utc::now();
        let mut p = pool();
        p.pending_out = 50;
        p.balance = 10;
        let before = (p.balance, p.pending_out, p.total_sent);
        assert!(matches!(
            p.apply(PoolMutation::SettleOutgoing(50), now),
            Err(MixerError::BalanceInvariant(_))
        ));
        assert_eq!((p.balance, p.pending_out, p.total_sent), before);
    }

    #[test]
    fn test_target_delivered_after_all_parts() {
        let now = Utc::now();
        let mut t = Target::new("addr".into(), 900, "n".into(), 3);
        t.record_delivery("tx1", now);
        t.record_delivery("tx1", now);
        t.record_delivery("tx2", now);
        assert!(!t.delivered);
        t.record_delivery("tx3", now);
        assert!(t.delivered);
        assert_eq!(t.delivery_txs, vec!["tx1", "tx2", "tx3"]);
    }

    #[test]
    fn test_capacity_bounded_by_bond_and_max() {
        let now = Utc::now();
        let mut reg = ServiceRegistration {
            service_id: "svc".into(),
            custodian_pubkey: String::new(),
            bond_amount: 5_000,
            outstanding_amount: 1_000,
            max_outstanding: 100_000,
            status: ServiceStatus::Active,
            registered_at: now,
            updated_at: now,
        };
        assert_eq!(reg.available_capacity(), 4_000);
        reg.status = ServiceStatus::Suspended;
        assert_eq!(reg.available_capacity(), 0);
    }
}
