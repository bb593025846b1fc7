use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chain::{with_timeout, ChainClient, ChainTxStatus, SignedTx, TransferRequest};
use crate::clock::Clock;
use crate::config::{MixerConfig, DEFAULT_TOKEN};
use crate::custodian::KeyCustodian;
use crate::error::{MixerError, Result};
use crate::model::{Destination, MixTransaction, MixTxStatus, PoolAccount, PoolMutation, TxKind};
use crate::service::MixerService;
use crate::store::Store;

const MAX_TX_PER_TICK: usize = 64;
/// An executed transfer the ledger still has not seen after this long is
/// treated as dropped and resent.
const DROPPED_AFTER_SECS: i64 = 120;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub executed: usize,
    pub deferred: usize,
    pub retried: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub confirmed: usize,
    pub reverted: usize,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        *self == TickReport::default()
    }

    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Executed => self.executed += 1,
            Outcome::Deferred => self.deferred += 1,
            Outcome::Retried => self.retried += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Cancelled => self.cancelled += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Executed,
    Deferred,
    Retried,
    Failed,
    Cancelled,
}

/// Sends due transfers and settles them once the ledger confirms them.
///
/// A transaction's source reservation (`pending_out`) is held from the
/// moment it is signed until it is confirmed or definitively rejected.
/// While the outcome of a send is unknown the signed bytes stay in
/// `raw_tx` and are only ever resent verbatim.
pub struct MixingExecutor {
    config: MixerConfig,
    store: Arc<dyn Store>,
    chain: Arc<dyn ChainClient>,
    custodian: Arc<dyn KeyCustodian>,
    service: Arc<MixerService>,
    clock: Arc<dyn Clock>,
}

impl MixingExecutor {
    pub fn new(
        config: MixerConfig,
        store: Arc<dyn Store>,
        chain: Arc<dyn ChainClient>,
        custodian: Arc<dyn KeyCustodian>,
        service: Arc<MixerService>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            chain,
            custodian,
            service,
            clock,
        }
    }

    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.executor_poll);
        info!("Mixing executor started (poll {:?})", self.config.executor_poll);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(report) if report.is_idle() => {}
                        Ok(report) => info!("Executor tick: {:?}", report),
                        Err(e) => error!("Executor tick failed: {}", e),
                    }
                }
                _ = token.cancelled() => {
                    warn!("Mixing executor shutting down");
                    break;
                }
            }
        }
    }

    pub async fn tick(&self) -> Result<TickReport> {
        let mut report = TickReport::default();

        for _ in 0..MAX_TX_PER_TICK {
            let Some(tx) = self.store.claim_due_transaction(self.clock.now()).await? else {
                break;
            };
            let id = tx.id.clone();
            let mut reserved = false;
            let result = self.execute(tx, &mut reserved).await;
            match result {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    error!("Executing {} failed: {}", id, e);
                    self.recover(&id, reserved, e.to_string()).await;
                    report.retried += 1;
                }
            }
        }

        self.confirm_executed(&mut report).await?;
        Ok(report)
    }

    /// Puts a transaction whose execution errored back on the schedule.
    /// `reserved` means this attempt holds a reservation that no stored
    /// signed bytes account for yet.
    async fn recover(&self, id: &str, reserved: bool, reason: String) {
        let mut tx = match self.store.get_transaction(id).await {
            Ok(Some(tx)) => tx,
            Ok(None) => return,
            Err(e) => {
                error!("Cannot reload {} for recovery: {}", id, e);
                return;
            }
        };
        if reserved {
            self.release(&tx).await;
        }
        let now = self.clock.now();
        tx.status = MixTxStatus::Scheduled;
        tx.scheduled_at = now + self.backoff(1);
        tx.error = Some(reason);
        tx.updated_at = now;
        if let Err(e) = self.store.update_transaction(&tx).await {
            error!("Transaction {} left executing: {}", id, e);
        }
    }

    async fn execute(&self, mut tx: MixTransaction, reserved: &mut bool) -> Result<Outcome> {
        let now = self.clock.now();

        let Some(source_id) = tx.source_pool_id.clone() else {
            // deposits are observed, never sent
            tx.status = MixTxStatus::Executed;
            tx.executed_at = Some(now);
            tx.updated_at = now;
            self.store.update_transaction(&tx).await?;
            return Ok(Outcome::Executed);
        };

        let halted = match &tx.request_id {
            Some(request_id) => self
                .store
                .get_request(request_id)
                .await?
                .map_or(true, |r| r.status.halts_execution()),
            None => false,
        };

        let raw = match tx.raw_tx.clone() {
            Some(raw) => {
                let tx_ref = tx.tx_ref.clone().unwrap_or_default();
                let status = with_timeout(
                    self.config.rpc_timeout,
                    "transaction status",
                    self.chain.get_transaction_status(&tx_ref),
                )
                .await;
                match status {
                    Ok(ChainTxStatus::Landed { .. }) => return self.mark_executed(tx).await,
                    Ok(ChainTxStatus::Failed(reason)) => return self.retry_or_fail(tx, reason, true).await,
                    Ok(ChainTxStatus::NotFound) => {}
                    Err(e) => return self.reschedule_unknown(tx, e.to_string()).await,
                }
                if halted {
                    return self.cancel(tx, true).await;
                }
                match bs58::decode(&raw).into_vec() {
                    Ok(bytes) => bytes,
                    Err(e) => return self.retry_or_fail(tx, format!("stored raw tx: {}", e), true).await,
                }
            }
            None => {
                if halted {
                    return self.cancel(tx, false).await;
                }
                let Some(source) = self.store.get_pool(&source_id).await? else {
                    return self.retry_or_fail(tx, format!("source pool {} missing", source_id), false).await;
                };
                match self
                    .store
                    .mutate_pool(&source_id, PoolMutation::ReserveOutgoing(tx.amount), now)
                    .await
                {
                    Ok(_) => *reserved = true,
                    Err(MixerError::BalanceInvariant(reason)) => {
                        debug!("Deferring {}: {}", tx.id, reason);
                        return self.defer(tx).await;
                    }
                    Err(e) => {
                        self.defer(tx).await?;
                        return Err(e);
                    }
                }
                match self.sign(&tx, &source).await {
                    Ok(signed) => {
                        tx.raw_tx = Some(bs58::encode(&signed.raw).into_string());
                        tx.tx_ref = Some(signed.tx_ref);
                        tx.updated_at = now;
                        // persisted before the send so a crash never loses the bytes
                        self.store.update_transaction(&tx).await?;
                        *reserved = false;
                        signed.raw
                    }
                    Err(e) => {
                        *reserved = false;
                        return self.retry_or_fail(tx, e.to_string(), true).await;
                    }
                }
            }
        };

        match with_timeout(self.config.rpc_timeout, "send", self.chain.send_transaction(&raw)).await {
            Ok(_) => self.mark_executed(tx).await,
            Err(e @ MixerError::ChainTimeout(_)) => self.reschedule_unknown(tx, e.to_string()).await,
            Err(e) => self.retry_or_fail(tx, e.to_string(), true).await,
        }
    }

    async fn sign(&self, tx: &MixTransaction, source: &PoolAccount) -> Result<SignedTx> {
        let destination = match &tx.destination {
            Destination::External(address) => address.clone(),
            Destination::Pool(pool_id) => {
                self.store
                    .get_pool(pool_id)
                    .await?
                    .ok_or_else(|| MixerError::NotFound(format!("destination pool {}", pool_id)))?
                    .address
            }
        };
        let token = match &tx.request_id {
            Some(request_id) => self
                .store
                .get_request(request_id)
                .await?
                .map(|r| r.token)
                .unwrap_or_else(|| DEFAULT_TOKEN.to_string()),
            None => DEFAULT_TOKEN.to_string(),
        };
        let script = hex::decode(&source.policy_script)
            .map_err(|e| MixerError::Internal(format!("pool {} policy script: {}", source.id, e)))?;

        let transfer = TransferRequest {
            vault: source.address.clone(),
            policy_script_hash: Sha256::digest(&script).into(),
            authority: source.custodian_pubkey.clone(),
            destination,
            token,
            amount: tx.amount,
        };
        let unsigned = with_timeout(
            self.config.rpc_timeout,
            "build transfer",
            self.chain.build_transfer_tx(&transfer),
        )
        .await?;
        let signature = self
            .custodian
            .sign_transaction(source.pool_index, &unsigned.message)
            .await?;
        self.chain.assemble(&unsigned, &signature)
    }

    async fn mark_executed(&self, mut tx: MixTransaction) -> Result<Outcome> {
        let now = self.clock.now();
        if let Some(pool_id) = tx.destination_pool() {
            self.store
                .mutate_pool(pool_id, PoolMutation::ExpectIncoming(tx.amount), now)
                .await?;
        }
        tx.status = MixTxStatus::Executed;
        tx.executed_at = Some(now);
        tx.error = None;
        tx.updated_at = now;
        self.store.update_transaction(&tx).await?;
        debug!("Executed {} ({:?}, {})", tx.id, tx.kind, tx.amount);
        Ok(Outcome::Executed)
    }

    fn backoff(&self, attempts: u32) -> chrono::Duration {
        let base = chrono::Duration::from_std(self.config.retry_base)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        base * (1i32 << attempts.saturating_sub(1).min(10))
    }

    async fn defer(&self, mut tx: MixTransaction) -> Result<Outcome> {
        let now = self.clock.now();
        tx.status = MixTxStatus::Scheduled;
        tx.scheduled_at = now + self.backoff(1);
        tx.updated_at = now;
        self.store.update_transaction(&tx).await?;
        Ok(Outcome::Deferred)
    }

    /// Outcome unknown: keep the signed bytes and the reservation.
    async fn reschedule_unknown(&self, mut tx: MixTransaction, reason: String) -> Result<Outcome> {
        warn!("Outcome of {} unknown, will check again: {}", tx.id, reason);
        let now = self.clock.now();
        tx.status = MixTxStatus::Scheduled;
        tx.scheduled_at = now + self.backoff(1);
        tx.error = Some(reason);
        tx.updated_at = now;
        self.store.update_transaction(&tx).await?;
        Ok(Outcome::Retried)
    }

    async fn release(&self, tx: &MixTransaction) {
        let Some(source) = &tx.source_pool_id else {
            return;
        };
        if let Err(e) = self
            .store
            .mutate_pool(source, PoolMutation::ReleaseOutgoing(tx.amount), self.clock.now())
            .await
        {
            error!("Releasing reservation of {} on {}: {}", tx.id, source, e);
        }
    }

    /// Definite failure: drops the signed bytes and counts an attempt.
    async fn retry_or_fail(&self, mut tx: MixTransaction, reason: String, reserved: bool) -> Result<Outcome> {
        if reserved {
            self.release(&tx).await;
        }
        let now = self.clock.now();
        tx.raw_tx = None;
        tx.tx_ref = None;
        tx.attempts += 1;
        tx.error = Some(reason.clone());
        tx.updated_at = now;

        if tx.attempts >= tx.max_attempts {
            tx.status = MixTxStatus::Failed;
            self.store.update_transaction(&tx).await?;
            error!("Transaction {} failed after {} attempts: {}", tx.id, tx.attempts, reason);
            if let Some(request_id) = &tx.request_id {
                let message = format!("transaction {} failed: {}", tx.id, reason);
                if let Err(e) = self.service.record_transaction_failure(request_id, message).await {
                    error!("Annotating {} failed: {}", request_id, e);
                }
            }
            return Ok(Outcome::Failed);
        }

        tx.status = MixTxStatus::Scheduled;
        tx.scheduled_at = now + self.backoff(tx.attempts);
        self.store.update_transaction(&tx).await?;
        warn!(
            "Transaction {} attempt {}/{} failed, retry at {}: {}",
            tx.id, tx.attempts, tx.max_attempts, tx.scheduled_at, reason
        );
        Ok(Outcome::Retried)
    }

    async fn cancel(&self, mut tx: MixTransaction, reserved: bool) -> Result<Outcome> {
        if reserved {
            self.release(&tx).await;
        }
        let now = self.clock.now();
        tx.status = MixTxStatus::Cancelled;
        tx.raw_tx = None;
        tx.updated_at = now;
        self.store.update_transaction(&tx).await?;
        info!("Cancelled {}: request no longer mixing", tx.id);
        Ok(Outcome::Cancelled)
    }

    async fn confirm_executed(&self, report: &mut TickReport) -> Result<()> {
        let now = self.clock.now();

        for mut tx in self.store.list_transactions_by_status(MixTxStatus::Executed).await? {
            let Some(tx_ref) = tx.tx_ref.clone() else {
                continue;
            };
            let status = match with_timeout(
                self.config.rpc_timeout,
                "transaction status",
                self.chain.get_transaction_status(&tx_ref),
            )
            .await
            {
                Ok(status) => status,
                Err(e) => {
                    debug!("Status of {} unavailable: {}", tx_ref, e);
                    continue;
                }
            };

            match status {
                ChainTxStatus::Landed { block_height, .. }
                    if status.is_confirmed(self.config.required_confirmations) =>
                {
                    self.settle(tx, &tx_ref, block_height).await?;
                    report.confirmed += 1;
                }
                ChainTxStatus::Landed { .. } => {}
                ChainTxStatus::Failed(reason) => {
                    if let Some(pool_id) = tx.destination_pool() {
                        self.store
                            .mutate_pool(pool_id, PoolMutation::CancelIncoming(tx.amount), now)
                            .await?;
                    }
                    if tx.kind == TxKind::Deposit {
                        error!("Credited deposit {} failed on chain: {}", tx_ref, reason);
                        tx.status = MixTxStatus::Failed;
                        tx.error = Some(reason);
                        tx.updated_at = now;
                        self.store.update_transaction(&tx).await?;
                    } else {
                        self.retry_or_fail(tx, reason, true).await?;
                    }
                    report.reverted += 1;
                }
                ChainTxStatus::NotFound => {
                    let dropped = tx.kind != TxKind::Deposit
                        && tx
                            .executed_at
                            .is_some_and(|at| now - at >= chrono::Duration::seconds(DROPPED_AFTER_SECS));
                    if dropped {
                        // resent verbatim by the next execution
                        if let Some(pool_id) = tx.destination_pool() {
                            self.store
                                .mutate_pool(pool_id, PoolMutation::CancelIncoming(tx.amount), now)
                                .await?;
                        }
                        warn!("Transaction {} ({}) not seen by the ledger, resending", tx.id, tx_ref);
                        tx.status = MixTxStatus::Scheduled;
                        tx.scheduled_at = now;
                        tx.updated_at = now;
                        self.store.update_transaction(&tx).await?;
                        report.reverted += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// Books a confirmed transfer. The ledger has spoken, so the transfer
    /// is Confirmed even if the pool books disagree; the disagreement is
    /// kept on the transaction and its request.
    async fn settle(&self, mut tx: MixTransaction, tx_ref: &str, block_height: u64) -> Result<()> {
        let now = self.clock.now();
        let mut drift = Vec::new();
        if let Some(source) = &tx.source_pool_id {
            if let Err(e) = self
                .store
                .mutate_pool(source, PoolMutation::SettleOutgoing(tx.amount), now)
                .await
            {
                error!("Settling {} out of {}: {}", tx.id, source, e);
                drift.push(e.to_string());
            }
        }
        if let Some(pool_id) = tx.destination_pool() {
            if let Err(e) = self
                .store
                .mutate_pool(pool_id, PoolMutation::SettleIncoming(tx.amount), now)
                .await
            {
                error!("Settling {} into {}: {}", tx.id, pool_id, e);
                drift.push(e.to_string());
            }
        }

        tx.status = MixTxStatus::Confirmed;
        tx.confirmation_block = Some(block_height);
        tx.confirmed_at = Some(now);
        tx.raw_tx = None;
        tx.error = None;
        tx.updated_at = now;
        if !drift.is_empty() {
            let message = format!("pool books out of sync after {}: {}", tx.id, drift.join("; "));
            if let Some(request_id) = &tx.request_id {
                if let Err(e) = self.service.record_transaction_failure(request_id, message.clone()).await {
                    error!("Annotating {} failed: {}", request_id, e);
                }
            }
            tx.error = Some(message);
        }
        self.store.update_transaction(&tx).await?;
        debug!("Confirmed {} in block {}", tx.id, block_height);

        if tx.kind != TxKind::Delivery {
            return Ok(());
        }
        let (Some(request_id), Some(index)) = (&tx.request_id, tx.target_index) else {
            return Ok(());
        };
        if self.service.record_delivery(request_id, index, tx_ref).await? {
            if let Err(e) = self.service.complete_mix_request(request_id).await {
                warn!("Completing {} failed: {}", request_id, e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RequestStatus;
    use crate::testing::Harness;

    #[tokio::test]
    async fn test_happy_path_completes_request() {
        let h = Harness::new().await;
        let request = h.mixing_request("1000", &[("target-a", "500"), ("target-b", "495")]).await;

        let done = h.run_until(&request.id, RequestStatus::Completed, 40).await;
        assert_eq!(done.status, RequestStatus::Completed);
        assert!(done.all_delivered());
        assert!(done.completion_proof.is_some());

        for tx in h.store.list_transactions_for_request(&request.id).await.unwrap() {
            assert_eq!(tx.status, MixTxStatus::Confirmed, "{:?} {}", tx.kind, tx.id);
            assert!(tx.raw_tx.is_none());
        }
        for pool in h.store.list_pools(None).await.unwrap() {
            assert_eq!(pool.pending_in, 0);
            assert_eq!(pool.pending_out, 0);
        }
        // only the fee is left behind in the pools
        let left: u64 = h.store.list_pools(None).await.unwrap().iter().map(|p| p.balance).sum();
        assert_eq!(left, 5);
        let reg = h.store.get_registration().await.unwrap().unwrap();
        assert_eq!(reg.outstanding_amount, 0);
    }

    #[tokio::test]
    async fn test_rejected_send_retries_then_fails() {
        let h = Harness::new().await;
        let request = h.mixing_request("1000", &[("target-a", "995")]).await;
        h.chain.fail_next_sends(u32::MAX);

        h.run_until(&request.id, RequestStatus::Completed, 12).await;

        // only hops out of the funded deposit pool get as far as a send;
        // with three pools the chain leaves it twice
        let mut expected: Vec<String> = h
            .store
            .list_transactions_for_request(&request.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|t| {
                t.kind == TxKind::Internal
                    && t.source_pool_id.as_deref() == Some(request.deposit_pool_id.as_str())
            })
            .map(|t| t.id)
            .collect();
        assert_eq!(expected.len(), 2);

        let failed = h.store.list_transactions_by_status(MixTxStatus::Failed).await.unwrap();
        let mut failed_ids: Vec<String> = failed.iter().map(|t| t.id.clone()).collect();
        expected.sort();
        failed_ids.sort();
        assert_eq!(failed_ids, expected);
        for tx in &failed {
            assert_eq!(tx.attempts, h.config.max_tx_attempts);
            assert!(tx.raw_tx.is_none());
        }

        let stored = h.store.get_request(&request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Mixing);
        assert!(stored.error.is_some());
        for pool in h.store.list_pools(None).await.unwrap() {
            assert_eq!(pool.pending_out, 0);
        }
    }

    #[tokio::test]
    async fn test_timed_out_send_is_resent_verbatim() {
        let h = Harness::new().await;
        let request = h.mixing_request("1000", &[("target-a", "995")]).await;
        h.clock.advance(chrono::Duration::hours(1));

        // first tick settles the deposit, second executes the first hop
        h.executor.tick().await.unwrap();
        h.clock.advance(chrono::Duration::minutes(1));
        h.chain.hang_sends(true);
        let report = h.executor.tick().await.unwrap();
        assert_eq!(report.retried, 1);

        let pending = h.store.list_transactions_for_request(&request.id).await.unwrap();
        let hop = pending
            .iter()
            .find(|t| t.raw_tx.is_some())
            .cloned()
            .unwrap();
        let first_ref = hop.tx_ref.clone().unwrap();
        let source = h.store.get_pool(hop.source_pool_id.as_ref().unwrap()).await.unwrap().unwrap();
        assert_eq!(source.pending_out, hop.amount);

        h.chain.hang_sends(false);
        h.clock.advance(chrono::Duration::minutes(1));
        h.executor.tick().await.unwrap();

        let hop = h.store.get_transaction(&hop.id).await.unwrap().unwrap();
        assert_eq!(hop.tx_ref.as_deref(), Some(first_ref.as_str()));
        assert_eq!(hop.attempts, 0);
        assert_eq!(h.chain.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_withdrawable_request_stops_execution() {
        let h = Harness::new().await;
        let request = h.mixing_request("1000", &[("target-a", "995")]).await;
        h.clock.advance(chrono::Duration::days(8) + chrono::Duration::hours(1));
        assert!(h.service.mark_refund_eligible(&request.id).await.unwrap());

        let report = h.executor.tick().await.unwrap();
        assert_eq!(report.executed, 0);
        assert_eq!(h.chain.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_error_after_send_reschedules_and_keeps_reservation() {
        let h = Harness::new().await;
        let request = h.mixing_request("1000", &[("target-a", "995")]).await;
        h.clock.advance(chrono::Duration::hours(1));
        h.executor.tick().await.unwrap();

        // leave the first hop signed but unsent
        h.clock.advance(chrono::Duration::minutes(1));
        h.chain.hang_sends(true);
        h.executor.tick().await.unwrap();
        h.chain.hang_sends(false);
        let hop = h
            .store
            .list_transactions_for_request(&request.id)
            .await
            .unwrap()
            .into_iter()
            .find(|t| t.raw_tx.is_some())
            .unwrap();
        let source_id = hop.source_pool_id.clone().unwrap();

        // the send goes through but booking the incoming side cannot
        let destination = h.store.get_pool(hop.destination_pool().unwrap()).await.unwrap().unwrap();
        h.store.delete_pool(&destination.id).await.unwrap();
        h.clock.advance(chrono::Duration::minutes(1));
        h.executor.tick().await.unwrap();

        let stuck = h.store.get_transaction(&hop.id).await.unwrap().unwrap();
        assert_eq!(stuck.status, MixTxStatus::Scheduled);
        assert_eq!(stuck.tx_ref, hop.tx_ref);
        assert!(stuck.raw_tx.is_some());
        assert!(stuck.error.is_some());
        assert_eq!(h.chain.sent_count(), 1);
        let source = h.store.get_pool(&source_id).await.unwrap().unwrap();
        assert_eq!(source.pending_out, hop.amount);

        h.store.insert_pool(&destination).await.unwrap();
        h.clock.advance(chrono::Duration::minutes(1));
        h.executor.tick().await.unwrap();

        let landed = h.store.get_transaction(&hop.id).await.unwrap().unwrap();
        assert!(matches!(landed.status, MixTxStatus::Executed | MixTxStatus::Confirmed));
        assert_eq!(h.chain.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_books_drift_is_flagged_on_request() {
        let h = Harness::new().await;
        let request = h.mixing_request("1000", &[("target-a", "995")]).await;
        h.clock.advance(chrono::Duration::hours(1));
        h.executor.tick().await.unwrap();

        h.chain.set_auto_confirm(false);
        h.clock.advance(chrono::Duration::minutes(1));
        h.executor.tick().await.unwrap();
        let hop = h
            .store
            .list_transactions_by_status(MixTxStatus::Executed)
            .await
            .unwrap()
            .into_iter()
            .find(|t| t.kind == TxKind::Internal)
            .unwrap();

        let mut source = h.store.get_pool(hop.source_pool_id.as_ref().unwrap()).await.unwrap().unwrap();
        source.pending_out = 0;
        h.store.update_pool(&source).await.unwrap();

        h.chain.confirm(hop.tx_ref.as_ref().unwrap());
        h.clock.advance(chrono::Duration::seconds(10));
        h.executor.tick().await.unwrap();

        let hop = h.store.get_transaction(&hop.id).await.unwrap().unwrap();
        assert_eq!(hop.status, MixTxStatus::Confirmed);
        assert!(hop.error.as_deref().unwrap().contains("out of sync"));
        let stored = h.store.get_request(&request.id).await.unwrap().unwrap();
        assert!(stored.error.as_deref().unwrap().contains("out of sync"));
    }
}
