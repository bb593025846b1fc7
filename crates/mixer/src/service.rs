//! Request lifecycle. Every mutation of a request runs under that request's
//! lock, so the HTTP handlers, the executor and the monitor never interleave
//! on the same record.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use mixer_sdk::amount::parse_amount;
use mixer_sdk::api::{
    CompletionProofResponse, CreateMixRequest, InfoResponse, ListRequestsResponse, OutputProof,
    StatsResponse, TargetSpec,
};
use mixer_sdk::crypto::random_nonce_hex;
use mixer_sdk::merkle::{decode_node, leaf_hash, MerkleTree};

use crate::accounts::AccountChecker;
use crate::chain::{with_timeout, ChainClient, ProofSubmission};
use crate::clock::Clock;
use crate::config::{
    calculate_fee, resolve_split_count, MixerConfig, DEFAULT_LIST_LIMIT, DEFAULT_TOKEN,
    DELIVERY_LEAD_MINUTES, DISPUTE_RESOLUTION_DAYS, GRACE_PERIOD_DAYS, MAX_LIST_LIMIT,
    MAX_SPLIT_COUNT, MIN_MIXING_POOLS, MIN_SPLIT_COUNT,
};
use crate::custodian::KeyCustodian;
use crate::error::{MixerError, Result};
use crate::model::{
    split_amount, ClaimStatus, Destination, DisputeRecord, DisputeStatus, MixDuration,
    MixRequest, MixTransaction, MixTxStatus, PoolStatus, RefundInfo,
    RequestStatus, ServiceRegistration, ServiceStatus, Target, TxKind, WithdrawalClaim,
};
use crate::registry::PoolRegistry;
use crate::store::Store;

/// Holds one request's lock. On drop the lock entry is removed again unless
/// another task is already waiting on it.
struct RequestGuard<'a> {
    id: String,
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks.remove_if(&self.id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Seconds between the delivery parts of one target.
const DELIVERY_PART_SPACING_SECS: i64 = 60;

/// Notifications from the custody and dispute programs.
#[derive(Clone, Debug)]
pub enum ContractEvent {
    RefundClaimed {
        request_id: String,
        claim_address: String,
        refund_tx: String,
    },
    DisputeResolved {
        request_id: String,
        /// The complaint was upheld and the service is at fault.
        service_at_fault: bool,
    },
    BondDeposited {
        amount: u64,
    },
    BondSlashed {
        amount: u64,
        reason: String,
    },
}

pub struct MixerService {
    config: MixerConfig,
    store: Arc<dyn Store>,
    chain: Arc<dyn ChainClient>,
    custodian: Arc<dyn KeyCustodian>,
    accounts: Arc<dyn AccountChecker>,
    registry: Arc<PoolRegistry>,
    clock: Arc<dyn Clock>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl MixerService {
    pub fn new(
        config: MixerConfig,
        store: Arc<dyn Store>,
        chain: Arc<dyn ChainClient>,
        custodian: Arc<dyn KeyCustodian>,
        accounts: Arc<dyn AccountChecker>,
        registry: Arc<PoolRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            chain,
            custodian,
            accounts,
            registry,
            clock,
            locks: DashMap::new(),
        }
    }

    pub fn config(&self) -> &MixerConfig {
        &self.config
    }

    async fn lock(&self, id: &str) -> RequestGuard<'_> {
        let mutex = self.locks.entry(id.to_string()).or_default().clone();
        let guard = mutex.lock_owned().await;
        RequestGuard {
            id: id.to_string(),
            locks: &self.locks,
            guard: Some(guard),
        }
    }

    async fn load(&self, id: &str) -> Result<MixRequest> {
        self.store
            .get_request(id)
            .await?
            .ok_or_else(|| MixerError::NotFound(format!("request {}", id)))
    }

    /// Requests of other accounts look exactly like missing ones.
    async fn load_owned(&self, id: &str, account_id: &str) -> Result<MixRequest> {
        let request = self.load(id).await?;
        if request.account_id != account_id {
            return Err(MixerError::NotFound(format!("request {}", id)));
        }
        Ok(request)
    }

    async fn save(&self, request: &MixRequest) -> Result<()> {
        self.store.update_request(request).await
    }

    /// Registers the bonded service on first start. Later starts keep the
    /// stored bond and outstanding amount.
    pub async fn register_service(&self) -> Result<ServiceRegistration> {
        let now = self.clock.now();
        if let Some(existing) = self.store.get_registration().await? {
            if existing.custodian_pubkey != self.custodian.public_key() {
                warn!(
                    "Registered custodian key {} differs from current {}",
                    existing.custodian_pubkey,
                    self.custodian.public_key()
                );
            }
            return Ok(existing);
        }

        let registration = ServiceRegistration {
            service_id: self.config.service_id.clone(),
            custodian_pubkey: self.custodian.public_key(),
            bond_amount: self.config.bond_amount,
            outstanding_amount: 0,
            max_outstanding: self.config.max_outstanding,
            status: ServiceStatus::Active,
            registered_at: now,
            updated_at: now,
        };
        self.store.put_registration(&registration).await?;
        info!(
            "Registered service {} with bond {}",
            registration.service_id, registration.bond_amount
        );
        Ok(registration)
    }

    pub fn info(&self) -> InfoResponse {
        InfoResponse {
            service_id: self.config.service_id.clone(),
            custodian_pubkey: self.custodian.public_key(),
            encryption_pubkey: hex::encode(self.custodian.encryption_public_key()),
            fee_bps: self.config.fee_bps,
            min_split_count: MIN_SPLIT_COUNT,
            max_split_count: MAX_SPLIT_COUNT,
            durations: MixDuration::ALL.to_vec(),
            grace_period_secs: chrono::Duration::days(GRACE_PERIOD_DAYS).num_seconds(),
        }
    }

    fn resolve_targets(&self, body: &CreateMixRequest) -> Result<Vec<TargetSpec>> {
        match &body.encrypted_targets {
            Some(_) if !body.targets.is_empty() => Err(MixerError::InvalidRequest(
                "give either targets or encrypted_targets, not both".into(),
            )),
            Some(sealed) => self.custodian.decrypt_targets(sealed),
            None => Ok(body.targets.clone()),
        }
    }

    pub async fn create_mix_request(&self, account_id: &str, body: CreateMixRequest) -> Result<MixRequest> {
        self.accounts.account_exists(account_id).await?;

        let total_amount =
            parse_amount(&body.amount).map_err(|e| MixerError::InvalidAmount(e.to_string()))?;
        if total_amount == 0 {
            return Err(MixerError::InvalidAmount("amount must be positive".into()));
        }

        let specs = self.resolve_targets(&body)?;
        if specs.is_empty() {
            return Err(MixerError::InvalidRequest("at least one target is required".into()));
        }

        let mut parsed = Vec::with_capacity(specs.len());
        let mut target_sum: u128 = 0;
        for spec in &specs {
            let address = spec.address.trim();
            if address.is_empty() {
                return Err(MixerError::InvalidRequest("target address is empty".into()));
            }
            let amount = parse_amount(&spec.amount)
                .map_err(|e| MixerError::InvalidAmount(format!("target {}: {}", address, e)))?;
            if amount == 0 {
                return Err(MixerError::InvalidAmount(format!("target {} amount is zero", address)));
            }
            target_sum += amount as u128;
            parsed.push((address.to_string(), amount));
        }

        let service_fee = calculate_fee(total_amount, self.config.fee_bps);
        let net_amount = total_amount - service_fee;
        if target_sum != net_amount as u128 {
            return Err(MixerError::TargetAmountMismatch {
                expected: net_amount,
                actual: target_sum.min(u64::MAX as u128) as u64,
            });
        }

        let split_count =
            resolve_split_count(body.split_count, total_amount, self.config.auto_split_threshold)?;
        let mix_duration = match body.mix_duration.as_deref() {
            None | Some("") => MixDuration::default(),
            Some(s) => s
                .parse()
                .map_err(|e: mixer_sdk::SdkError| MixerError::InvalidRequest(e.to_string()))?,
        };
        let token = match body.token.as_deref().map(str::trim) {
            None | Some("") => DEFAULT_TOKEN.to_string(),
            Some(t) => t.to_string(),
        };

        let now = self.clock.now();
        self.store.reserve_capacity(total_amount, now).await?;

        let pool = match self.registry.select_deposit_pool().await {
            Ok(pool) => pool,
            Err(e) => {
                self.store.release_capacity(total_amount, now).await?;
                return Err(e);
            }
        };

        let mix_end = now + mix_duration.as_chrono();
        let targets = parsed
            .into_iter()
            .map(|(address, amount)| {
                // a part must never be a zero-amount transfer
                let parts = (split_count as u64).min(amount).max(1) as u32;
                Target::new(address, amount, random_nonce_hex(), parts)
            })
            .collect();

        let mut request = MixRequest {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            token,
            total_amount,
            service_fee,
            net_amount,
            mix_duration,
            split_count,
            targets,
            deposit_address: pool.address.clone(),
            deposit_pool_id: pool.id.clone(),
            deposit_txs: Vec::new(),
            request_commitment: None,
            tee_signature: None,
            mix_start: None,
            mix_end,
            deadline: mix_end + chrono::Duration::days(GRACE_PERIOD_DAYS),
            completion_proof: None,
            refund: None,
            error: None,
            early_warning_logged: false,
            status: RequestStatus::Pending,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        match self.custodian.generate_request_commitment(&request).await {
            Ok(commitment) => request.request_commitment = Some(hex::encode(commitment)),
            Err(e) => warn!("Request commitment for {} failed: {}", request.id, e),
        }

        if let Err(e) = self.store.insert_request(&request).await {
            self.store.release_capacity(total_amount, now).await?;
            return Err(e);
        }

        info!(
            "Created request {}: {} ({} fee) to {} target(s), {} window, deposit at {}",
            request.id,
            total_amount,
            service_fee,
            request.targets.len(),
            mix_duration,
            request.deposit_address
        );
        Ok(request)
    }

    pub async fn get_request(&self, account_id: &str, id: &str) -> Result<MixRequest> {
        self.load_owned(id, account_id).await
    }

    pub async fn list_requests(
        &self,
        account_id: &str,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<ListRequestsResponse> {
        let limit = match limit {
            None | Some(0) => DEFAULT_LIST_LIMIT,
            Some(n) => n.min(MAX_LIST_LIMIT),
        };
        let (requests, total) = self
            .store
            .list_requests_by_account(account_id, offset, limit)
            .await?;
        Ok(ListRequestsResponse {
            requests: requests.iter().map(MixRequest::to_view).collect(),
            total,
            offset,
            limit,
        })
    }

    /// Verifies the deposit transactions on the ledger, moves the request to
    /// Deposited and tries to start mixing right away. If mixing cannot
    /// start yet the request stays Deposited with the reason in `error`.
    pub async fn confirm_deposit(&self, account_id: &str, id: &str, tx_refs: Vec<String>) -> Result<MixRequest> {
        let _guard = self.lock(id).await;
        let mut request = self.load_owned(id, account_id).await?;
        request.require_status(RequestStatus::Pending, "confirm deposit for")?;

        let mut seen = HashSet::new();
        let tx_refs: Vec<String> = tx_refs
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty() && seen.insert(t.clone()))
            .collect();
        if tx_refs.is_empty() {
            return Err(MixerError::InvalidRequest("no deposit transactions given".into()));
        }

        for tx_ref in &tx_refs {
            let status = with_timeout(
                self.config.rpc_timeout,
                "deposit status",
                self.chain.get_transaction_status(tx_ref),
            )
            .await?;
            if !status.is_confirmed(self.config.required_confirmations) {
                debug!("Deposit {} for {} not confirmed: {:?}", tx_ref, id, status);
                return Err(MixerError::DepositNotConfirmed(tx_ref.clone()));
            }
        }

        let now = self.clock.now();
        let amounts = split_amount(request.total_amount, tx_refs.len() as u32);
        let deposits: Vec<MixTransaction> = tx_refs
            .iter()
            .zip(amounts)
            .map(|(tx_ref, amount)| {
                let mut tx = MixTransaction::scheduled(
                    TxKind::Deposit,
                    Some(request.id.clone()),
                    None,
                    Destination::Pool(request.deposit_pool_id.clone()),
                    amount,
                    now,
                    self.config.max_tx_attempts,
                    now,
                );
                tx.status = MixTxStatus::Executed;
                tx.tx_ref = Some(tx_ref.clone());
                tx.executed_at = Some(now);
                tx
            })
            .collect();

        self.store
            .credit_deposits(&request.deposit_pool_id, request.total_amount, &deposits, now)
            .await?;

        request.deposit_txs = tx_refs;
        request.transition(RequestStatus::Deposited, "confirm deposit for", now)?;
        self.sign_commitment(&mut request).await;
        self.save(&request).await?;
        info!("Deposit confirmed for {} ({} tx)", request.id, request.deposit_txs.len());

        if let Err(e) = self.start_mixing_locked(&mut request).await {
            warn!("Mixing for {} not started: {}", request.id, e);
            request.error = Some(e.to_string());
            request.updated_at = self.clock.now();
            self.save(&request).await?;
        }
        Ok(request)
    }

    /// The custodian's signature over the commitment is what a user takes to
    /// the dispute program.
    async fn sign_commitment(&self, request: &mut MixRequest) {
        if request.request_commitment.is_none() {
            match self.custodian.generate_request_commitment(request).await {
                Ok(c) => request.request_commitment = Some(hex::encode(c)),
                Err(e) => {
                    warn!("Request commitment for {} failed: {}", request.id, e);
                    return;
                }
            }
        }
        let Some(commitment) = request.request_commitment.as_deref().and_then(|c| hex::decode(c).ok())
        else {
            return;
        };
        match self.custodian.sign_attestation(&commitment).await {
            Ok(sig) => request.tee_signature = Some(bs58::encode(sig).into_string()),
            Err(e) => warn!("Signing commitment for {} failed: {}", request.id, e),
        }
    }

    pub async fn start_mixing(&self, id: &str) -> Result<MixRequest> {
        let _guard = self.lock(id).await;
        let mut request = self.load(id).await?;
        self.start_mixing_locked(&mut request).await?;
        Ok(request)
    }

    /// Schedules the hop chain and the deliveries. Hops are spaced evenly
    /// between now and the delivery time and walk the active pools
    /// round-robin from the deposit pool; deliveries leave from the last hop.
    async fn start_mixing_locked(&self, request: &mut MixRequest) -> Result<()> {
        request.require_status(RequestStatus::Deposited, "start mixing")?;

        let pools = self.registry.active_pools().await?;
        if pools.len() < MIN_MIXING_POOLS {
            return Err(MixerError::InsufficientPools {
                available: pools.len(),
                required: MIN_MIXING_POOLS,
            });
        }

        let now = self.clock.now();
        let delivery_at = (request.mix_end - chrono::Duration::minutes(DELIVERY_LEAD_MINUTES)).max(now);
        let hops = request.mix_duration.hop_count();
        let spacing = (delivery_at - now) / (hops as i32 + 1);
        let max_attempts = self.config.max_tx_attempts;

        let start = pools.iter().position(|p| p.id == request.deposit_pool_id);
        let mut current = request.deposit_pool_id.clone();
        let mut txs = Vec::new();

        for hop in 0..hops as usize {
            let next = match start {
                Some(s) => &pools[(s + hop + 1) % pools.len()],
                None => &pools[hop % pools.len()],
            };
            txs.push(MixTransaction::scheduled(
                TxKind::Internal,
                Some(request.id.clone()),
                Some(current.clone()),
                Destination::Pool(next.id.clone()),
                request.net_amount,
                now + spacing * (hop as i32 + 1),
                max_attempts,
                now,
            ));
            current = next.id.clone();
        }

        for (index, target) in request.targets.iter().enumerate() {
            for (part, amount) in split_amount(target.amount, target.parts).into_iter().enumerate() {
                let mut tx = MixTransaction::scheduled(
                    TxKind::Delivery,
                    Some(request.id.clone()),
                    Some(current.clone()),
                    Destination::External(target.address.clone()),
                    amount,
                    delivery_at + chrono::Duration::seconds(DELIVERY_PART_SPACING_SECS * part as i64),
                    max_attempts,
                    now,
                );
                tx.target_index = Some(index);
                txs.push(tx);
            }
        }

        self.store.insert_transactions(&txs).await?;
        request.mix_start = Some(now);
        request.error = None;
        request.transition(RequestStatus::Mixing, "start mixing", now)?;
        self.save(request).await?;

        info!(
            "Mixing {}: {} hops, {} transactions, deliveries from {}",
            request.id,
            hops,
            txs.len(),
            delivery_at
        );
        Ok(())
    }

    /// Records a confirmed delivery part. Returns true once every target
    /// of a still-mixing request has been delivered.
    pub async fn record_delivery(&self, request_id: &str, target_index: usize, tx_ref: &str) -> Result<bool> {
        let _guard = self.lock(request_id).await;
        let mut request = self.load(request_id).await?;
        let now = self.clock.now();
        let target = request.targets.get_mut(target_index).ok_or_else(|| {
            MixerError::Internal(format!("request {} has no target {}", request_id, target_index))
        })?;
        target.record_delivery(tx_ref, now);
        request.updated_at = now;
        self.save(&request).await?;
        Ok(request.status == RequestStatus::Mixing && request.all_delivered())
    }

    /// Annotates a request with a transaction failure without changing its
    /// status.
    pub async fn record_transaction_failure(&self, request_id: &str, message: String) -> Result<()> {
        let _guard = self.lock(request_id).await;
        let mut request = self.load(request_id).await?;
        request.error = Some(message);
        request.updated_at = self.clock.now();
        self.save(&request).await
    }

    pub async fn complete_mix_request(&self, id: &str) -> Result<MixRequest> {
        let _guard = self.lock(id).await;
        let mut request = self.load(id).await?;
        self.complete_locked(&mut request).await?;
        Ok(request)
    }

    async fn complete_locked(&self, request: &mut MixRequest) -> Result<()> {
        request.require_status(RequestStatus::Mixing, "complete")?;
        if !request.all_delivered() {
            return Err(MixerError::TargetsNotDelivered(request.undelivered_count()));
        }

        let now = self.clock.now();
        match self
            .custodian
            .generate_completion_proof(request, &self.config.service_id, now.timestamp())
            .await
        {
            Ok(proof) => request.completion_proof = Some(proof),
            Err(e) => warn!("Completion proof for {} failed: {}", request.id, e),
        }

        request.transition(RequestStatus::Completed, "complete", now)?;
        request.completed_at = Some(now);
        request.error = None;
        self.save(request).await?;
        self.store.release_capacity(request.total_amount, now).await?;

        info!("Request {} completed", request.id);
        Ok(())
    }

    /// Resumes a request stalled by a failed transaction or a missing pool.
    pub async fn resume_request(&self, account_id: &str, id: &str) -> Result<MixRequest> {
        let _guard = self.lock(id).await;
        let mut request = self.load_owned(id, account_id).await?;

        match request.status {
            RequestStatus::Deposited => {
                self.start_mixing_locked(&mut request).await?;
            }
            RequestStatus::Mixing => {
                let now = self.clock.now();
                let mut retried = 0;
                for mut tx in self.store.list_transactions_for_request(id).await? {
                    if tx.status != MixTxStatus::Failed {
                        continue;
                    }
                    tx.status = MixTxStatus::Scheduled;
                    tx.attempts = 0;
                    tx.error = None;
                    tx.scheduled_at = now;
                    tx.updated_at = now;
                    self.store.update_transaction(&tx).await?;
                    retried += 1;
                }
                request.error = None;
                request.updated_at = now;
                self.save(&request).await?;
                info!("Resumed {}: {} failed transaction(s) rescheduled", id, retried);

                if request.all_delivered() {
                    self.complete_locked(&mut request).await?;
                }
            }
            _ => {
                return Err(MixerError::InvalidState {
                    id: request.id.clone(),
                    status: request.status,
                    action: "resume",
                })
            }
        }
        Ok(request)
    }

    async fn cancel_pending_transactions(&self, request_id: &str, now: DateTime<Utc>) -> Result<usize> {
        let mut cancelled = 0;
        for mut tx in self.store.list_transactions_for_request(request_id).await? {
            // Executing and Executed transfers may already be on the ledger
            if matches!(tx.status, MixTxStatus::Scheduled | MixTxStatus::Failed) {
                tx.status = MixTxStatus::Cancelled;
                tx.updated_at = now;
                self.store.update_transaction(&tx).await?;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    /// Called by the monitor for requests past their deadline. Returns true
    /// only for the call that flags the request.
    pub async fn mark_refund_eligible(&self, id: &str) -> Result<bool> {
        let _guard = self.lock(id).await;
        let mut request = self.load(id).await?;
        let now = self.clock.now();
        if !matches!(request.status, RequestStatus::Deposited | RequestStatus::Mixing)
            || !request.is_past_deadline(now)
        {
            return Ok(false);
        }

        request.transition(RequestStatus::Withdrawable, "mark withdrawable", now)?;
        self.save(&request).await?;
        let cancelled = self.cancel_pending_transactions(id, now).await?;
        warn!(
            "Request {} missed its deadline {}; withdrawable ({} transaction(s) cancelled)",
            id, request.deadline, cancelled
        );
        Ok(true)
    }

    pub async fn note_early_warning(&self, id: &str) -> Result<()> {
        let _guard = self.lock(id).await;
        let mut request = self.load(id).await?;
        request.early_warning_logged = true;
        self.save(&request).await
    }

    pub async fn create_withdrawal_claim(
        &self,
        account_id: &str,
        id: &str,
        claim_address: &str,
    ) -> Result<WithdrawalClaim> {
        let _guard = self.lock(id).await;
        let mut request = self.load_owned(id, account_id).await?;
        self.claim_locked(&mut request, claim_address).await
    }

    async fn claim_locked(&self, request: &mut MixRequest, claim_address: &str) -> Result<WithdrawalClaim> {
        let claim_address = claim_address.trim();
        if claim_address.is_empty() {
            return Err(MixerError::InvalidRequest("claim address is empty".into()));
        }

        match request.status {
            RequestStatus::Deposited | RequestStatus::Mixing | RequestStatus::Withdrawable => {}
            RequestStatus::Pending => {
                return Err(MixerError::InvalidState {
                    id: request.id.clone(),
                    status: request.status,
                    action: "claim",
                })
            }
            status => {
                return Err(MixerError::Conflict(format!(
                    "request {} is {} and cannot be claimed",
                    request.id, status
                )))
            }
        }

        let now = self.clock.now();
        if !request.is_past_deadline(now) {
            return Err(MixerError::NotWithdrawable(request.deadline));
        }

        let claim = WithdrawalClaim {
            id: uuid::Uuid::new_v4().to_string(),
            request_id: request.id.clone(),
            account_id: request.account_id.clone(),
            amount: request.total_amount,
            claim_address: claim_address.to_string(),
            status: ClaimStatus::Pending,
            claimable_at: request.deadline,
            created_at: now,
            refund_tx: None,
            paid_at: None,
        };
        self.store.create_claim(&claim).await?;

        if request.status != RequestStatus::Withdrawable {
            request.transition(RequestStatus::Withdrawable, "claim", now)?;
            self.save(request).await?;
            self.cancel_pending_transactions(&request.id, now).await?;
        }

        info!(
            "Withdrawal claim {} for {}: {} to {}",
            claim.id, request.id, claim.amount, claim.claim_address
        );
        Ok(claim)
    }

    pub async fn process_refund(&self, id: &str, refund_tx: &str) -> Result<MixRequest> {
        let _guard = self.lock(id).await;
        let mut request = self.load(id).await?;
        self.refund_locked(&mut request, refund_tx).await?;
        Ok(request)
    }

    async fn refund_locked(&self, request: &mut MixRequest, refund_tx: &str) -> Result<()> {
        request.require_status(RequestStatus::Withdrawable, "refund")?;
        let mut claim = self
            .store
            .get_claim_for_request(&request.id)
            .await?
            .ok_or_else(|| MixerError::NotFound(format!("claim for request {}", request.id)))?;

        let now = self.clock.now();
        request.transition(RequestStatus::Refunded, "refund", now)?;
        request.refund = Some(RefundInfo {
            claim_id: claim.id.clone(),
            refund_tx: refund_tx.to_string(),
            refunded_at: now,
        });

        claim.status = ClaimStatus::Paid;
        claim.refund_tx = Some(refund_tx.to_string());
        claim.paid_at = Some(now);
        self.store.update_claim(&claim).await?;
        self.save(request).await?;

        // the refund is paid out of the bond
        self.store.release_capacity(request.total_amount, now).await?;
        let registration = self.store.adjust_bond(-(request.total_amount as i128), now).await?;

        info!(
            "Request {} refunded by {}; bond now {}",
            request.id, refund_tx, registration.bond_amount
        );
        Ok(())
    }

    /// Opens a dispute on a completed request: anchors the request commitment
    /// and the completion proof on the dispute program.
    pub async fn dispute_request(&self, account_id: &str, id: &str) -> Result<DisputeRecord> {
        let _guard = self.lock(id).await;
        let mut request = self.load_owned(id, account_id).await?;
        request.require_status(RequestStatus::Completed, "dispute")?;

        if self.store.get_dispute(id).await?.is_some() {
            return Err(MixerError::Conflict(format!("request {} is already disputed", id)));
        }

        if request.completion_proof.is_none() {
            let now = self.clock.now();
            let proof = self
                .custodian
                .generate_completion_proof(&request, &self.config.service_id, now.timestamp())
                .await?;
            request.completion_proof = Some(proof);
        }

        if let Err(e) = self.submit_mix_proof_locked(&request).await {
            warn!("Anchoring commitment of {} failed: {}", id, e);
        }
        let submission_tx = self.submit_completion_proof_locked(&mut request).await?;

        let now = self.clock.now();
        let (merkle_root, custodian_signature) = request
            .completion_proof
            .as_ref()
            .map(|p| (p.merkle_root.clone(), p.signature.clone()))
            .unwrap_or_default();
        let dispute = DisputeRecord {
            request_id: request.id.clone(),
            request_commitment: request.request_commitment.clone(),
            merkle_root,
            custodian_signature,
            submission_tx: Some(submission_tx),
            opened_at: now,
            resolution_deadline: now + chrono::Duration::days(DISPUTE_RESOLUTION_DAYS),
            status: DisputeStatus::Open,
            resolved_at: None,
        };
        self.store.insert_dispute(&dispute).await?;

        request.transition(RequestStatus::Disputed, "dispute", now)?;
        self.save(&request).await?;
        warn!("Request {} disputed; resolution due {}", id, dispute.resolution_deadline);
        Ok(dispute)
    }

    pub async fn submit_completion_proof_on_chain(&self, id: &str) -> Result<String> {
        let _guard = self.lock(id).await;
        let mut request = self.load(id).await?;
        let tx = self.submit_completion_proof_locked(&mut request).await?;
        self.save(&request).await?;
        Ok(tx)
    }

    async fn submit_completion_proof_locked(&self, request: &mut MixRequest) -> Result<String> {
        let proof = request
            .completion_proof
            .as_mut()
            .ok_or_else(|| MixerError::NotFound(format!("completion proof for {}", request.id)))?;

        let merkle_root =
            decode_node(&proof.merkle_root).map_err(|e| MixerError::Internal(e.to_string()))?;
        let signature = bs58::decode(&proof.signature)
            .into_vec()
            .map_err(|e| MixerError::Internal(format!("stored proof signature: {}", e)))?;
        let submission = ProofSubmission::Completion {
            request_id: request.id.clone(),
            merkle_root,
            signature,
            timestamp: proof.timestamp,
            output_count: proof.output_count as u32,
        };

        let tx = with_timeout(
            self.config.rpc_timeout,
            "completion proof submission",
            self.chain.submit_completion_proof(&submission, self.custodian.as_ref()),
        )
        .await?;

        let now = self.clock.now();
        proof.submission_tx = Some(tx.clone());
        proof.submitted_at = Some(now);
        request.updated_at = now;
        info!("Completion proof for {} submitted in {}", request.id, tx);
        Ok(tx)
    }

    async fn submit_mix_proof_locked(&self, request: &MixRequest) -> Result<String> {
        let (Some(commitment), Some(signature)) = (&request.request_commitment, &request.tee_signature) else {
            return Err(MixerError::NotFound(format!("signed commitment for {}", request.id)));
        };
        let commitment = decode_node(commitment).map_err(|e| MixerError::Internal(e.to_string()))?;
        let signature = bs58::decode(signature)
            .into_vec()
            .map_err(|e| MixerError::Internal(format!("stored commitment signature: {}", e)))?;

        let submission = ProofSubmission::Mix {
            request_id: request.id.clone(),
            commitment,
            signature,
        };
        with_timeout(
            self.config.rpc_timeout,
            "mix proof submission",
            self.chain.submit_mix_proof(&submission, self.custodian.as_ref()),
        )
        .await
    }

    /// Closes a dispute. A complaint upheld against the service slashes the
    /// request's full amount from the bond.
    pub async fn resolve_dispute(&self, id: &str, service_at_fault: bool) -> Result<MixRequest> {
        let _guard = self.lock(id).await;
        let mut request = self.load(id).await?;
        request.require_status(RequestStatus::Disputed, "resolve dispute for")?;

        let mut dispute = self
            .store
            .get_dispute(id)
            .await?
            .ok_or_else(|| MixerError::NotFound(format!("dispute for {}", id)))?;

        let now = self.clock.now();
        dispute.status = if service_at_fault {
            DisputeStatus::Upheld
        } else {
            DisputeStatus::Rejected
        };
        dispute.resolved_at = Some(now);
        self.store.update_dispute(&dispute).await?;

        request.transition(RequestStatus::Resolved, "resolve dispute for", now)?;
        self.save(&request).await?;

        if service_at_fault {
            let registration = self.store.adjust_bond(-(request.total_amount as i128), now).await?;
            warn!(
                "Dispute on {} upheld; bond slashed by {} to {}",
                id, request.total_amount, registration.bond_amount
            );
        } else {
            info!("Dispute on {} rejected", id);
        }
        Ok(request)
    }

    pub async fn handle_contract_event(&self, event: ContractEvent) -> Result<()> {
        let now = self.clock.now();
        match event {
            ContractEvent::RefundClaimed {
                request_id,
                claim_address,
                refund_tx,
            } => {
                let _guard = self.lock(&request_id).await;
                let mut request = self.load(&request_id).await?;
                if self.store.get_claim_for_request(&request_id).await?.is_none() {
                    self.claim_locked(&mut request, &claim_address).await?;
                }
                self.refund_locked(&mut request, &refund_tx).await?;
            }
            ContractEvent::DisputeResolved {
                request_id,
                service_at_fault,
            } => {
                self.resolve_dispute(&request_id, service_at_fault).await?;
            }
            ContractEvent::BondDeposited { amount } => {
                let registration = self.store.adjust_bond(amount as i128, now).await?;
                info!("Bond topped up by {} to {}", amount, registration.bond_amount);
            }
            ContractEvent::BondSlashed { amount, reason } => {
                let registration = self.store.adjust_bond(-(amount as i128), now).await?;
                warn!(
                    "Bond slashed by {} ({}); now {}",
                    amount, reason, registration.bond_amount
                );
            }
        }
        Ok(())
    }

    /// Completion proof with one inclusion proof per output.
    pub async fn get_completion_proof(&self, account_id: &str, id: &str) -> Result<CompletionProofResponse> {
        let request = self.load_owned(id, account_id).await?;
        if !matches!(
            request.status,
            RequestStatus::Completed | RequestStatus::Disputed | RequestStatus::Resolved
        ) {
            return Err(MixerError::InvalidState {
                id: request.id.clone(),
                status: request.status,
                action: "fetch the proof of",
            });
        }
        let proof = request
            .completion_proof
            .as_ref()
            .ok_or_else(|| MixerError::NotFound(format!("completion proof for {}", id)))?;

        let leaves: Vec<[u8; 32]> = request
            .targets
            .iter()
            .map(|t| leaf_hash(&t.address, t.amount, &t.nonce, &request.id))
            .collect();
        let tree = MerkleTree::new(leaves).map_err(|e| MixerError::Internal(e.to_string()))?;

        let mut outputs = Vec::with_capacity(request.targets.len());
        for (index, target) in request.targets.iter().enumerate() {
            let inclusion = tree.proof(index).map_err(|e| MixerError::Internal(e.to_string()))?;
            outputs.push(OutputProof {
                index,
                address: target.address.clone(),
                amount: target.amount,
                nonce: target.nonce.clone(),
                leaf: hex::encode(inclusion.leaf),
                siblings: inclusion.siblings.iter().map(hex::encode).collect(),
                sibling_is_right: inclusion.sibling_is_right,
            });
        }

        Ok(CompletionProofResponse {
            request_id: request.id.clone(),
            service_id: proof.service_id.clone(),
            merkle_root: proof.merkle_root.clone(),
            signature: proof.signature.clone(),
            signer: proof.signer.clone(),
            timestamp: proof.timestamp,
            output_count: proof.output_count,
            outputs,
            submission_tx: proof.submission_tx.clone(),
        })
    }

    pub async fn stats(&self) -> Result<StatsResponse> {
        let requests = self.store.list_requests_by_status(&RequestStatus::ALL).await?;
        let mut by_status: BTreeMap<String, u64> =
            RequestStatus::ALL.iter().map(|s| (s.as_str().to_string(), 0)).collect();
        let mut total_volume = 0u64;
        let mut completed_volume = 0u64;
        let mut completed = 0u64;
        let mut refunded = 0u64;

        for request in &requests {
            *by_status.entry(request.status.as_str().to_string()).or_default() += 1;
            total_volume = total_volume.saturating_add(request.total_amount);
            match request.status {
                RequestStatus::Completed | RequestStatus::Disputed | RequestStatus::Resolved => {
                    completed += 1;
                    completed_volume = completed_volume.saturating_add(request.total_amount);
                }
                RequestStatus::Refunded => refunded += 1,
                _ => {}
            }
        }

        let pools = self.store.list_pools(None).await?;
        let scheduled = self.store.list_transactions_by_status(MixTxStatus::Scheduled).await?;
        let failed = self.store.list_transactions_by_status(MixTxStatus::Failed).await?;
        let registration = self.store.get_registration().await?;

        Ok(StatsResponse {
            total_requests: requests.len() as u64,
            by_status,
            total_volume,
            completed_volume,
            active_pools: pools.iter().filter(|p| p.status == PoolStatus::Active).count() as u64,
            retiring_pools: pools.iter().filter(|p| p.status == PoolStatus::Retiring).count() as u64,
            pool_balance: pools.iter().map(|p| p.balance).fold(0, u64::saturating_add),
            scheduled_transactions: scheduled.len() as u64,
            failed_transactions: failed.len() as u64,
            bond_amount: registration.as_ref().map_or(0, |r| r.bond_amount),
            outstanding_amount: registration.as_ref().map_or(0, |r| r.outstanding_amount),
            available_capacity: registration.as_ref().map_or(0, |r| r.available_capacity()),
            success_rate: if completed + refunded == 0 {
                1.0
            } else {
                completed as f64 / (completed + refunded) as f64
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainTxStatus;
    use crate::testing::{create_body, Harness, ACCOUNT};

    #[tokio::test]
    async fn test_fee_must_match_targets() {
        let h = Harness::new().await;

        let err = h
            .service
            .create_mix_request(ACCOUNT, create_body("1000", &[("a", "600"), ("b", "400")]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MixerError::TargetAmountMismatch {
                expected: 995,
                actual: 1000
            }
        ));

        let ok = h
            .service
            .create_mix_request(ACCOUNT, create_body("1005", &[("a", "600"), ("b", "400")]))
            .await;
        // 0.5% of 1005 rounds down to 5
        assert!(ok.is_ok());

        let ok = h
            .service
            .create_mix_request(ACCOUNT, create_body("1000", &[("a", "600"), ("b", "395")]))
            .await
            .unwrap();
        assert_eq!(ok.service_fee, 5);
        assert_eq!(ok.status, RequestStatus::Pending);
    }

    #[tokio::test]
    async fn test_window_fixed_at_creation() {
        let h = Harness::new().await;
        let mut body = create_body("1000", &[("a", "995")]);
        body.mix_duration = Some("24h".into());
        let request = h.service.create_mix_request(ACCOUNT, body).await.unwrap();

        assert_eq!(request.mix_end, request.created_at + chrono::Duration::hours(24));
        assert_eq!(request.deadline, request.mix_end + chrono::Duration::days(7));
        assert!(request.request_commitment.is_some());
    }

    #[tokio::test]
    async fn test_invalid_split_count_rejected() {
        let h = Harness::new().await;
        let mut body = create_body("1000", &[("a", "995")]);
        body.split_count = Some(6);
        assert!(matches!(
            h.service.create_mix_request(ACCOUNT, body).await,
            Err(MixerError::InvalidSplitCount(6))
        ));
    }

    #[tokio::test]
    async fn test_capacity_reserved_and_refused() {
        let h = Harness::new().await;
        let big = (h.config.bond_amount + 1).to_string();
        let net = (h.config.bond_amount + 1 - calculate_fee(h.config.bond_amount + 1, h.config.fee_bps)).to_string();
        let err = h
            .service
            .create_mix_request(ACCOUNT, create_body(&big, &[("a", &net)]))
            .await
            .unwrap_err();
        assert!(matches!(err, MixerError::InsufficientCapacity { .. }));

        h.service
            .create_mix_request(ACCOUNT, create_body("1000", &[("a", "995")]))
            .await
            .unwrap();
        let stats = h.service.stats().await.unwrap();
        assert_eq!(stats.outstanding_amount, 1000);
    }

    #[tokio::test]
    async fn test_unconfirmed_deposit_stays_pending() {
        let h = Harness::new().await;
        let request = h
            .service
            .create_mix_request(ACCOUNT, create_body("1000", &[("a", "995")]))
            .await
            .unwrap();

        let err = h
            .service
            .confirm_deposit(ACCOUNT, &request.id, vec!["unknown-tx".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, MixerError::DepositNotConfirmed(_)));

        let stored = h.service.get_request(ACCOUNT, &request.id).await.unwrap();
        assert_eq!(stored.status, RequestStatus::Pending);
        assert!(stored.deposit_txs.is_empty());
    }

    #[tokio::test]
    async fn test_deposit_starts_mixing() {
        let h = Harness::new().await;
        let request = h
            .service
            .create_mix_request(ACCOUNT, create_body("1000", &[("a", "995")]))
            .await
            .unwrap();
        h.chain.set_status("dep-1", ChainTxStatus::Landed { block_height: 1, confirmations: 5 });

        let request = h
            .service
            .confirm_deposit(ACCOUNT, &request.id, vec!["dep-1".into()])
            .await
            .unwrap();
        assert_eq!(request.status, RequestStatus::Mixing);
        assert!(request.tee_signature.is_some());

        let txs = h.store.list_transactions_for_request(&request.id).await.unwrap();
        let hops = txs.iter().filter(|t| t.kind == TxKind::Internal).count();
        let deliveries = txs.iter().filter(|t| t.kind == TxKind::Delivery).count();
        assert_eq!(hops, 5);
        assert_eq!(deliveries, 1);
        let delivery = txs.iter().find(|t| t.kind == TxKind::Delivery).unwrap();
        assert!(delivery.scheduled_at <= request.mix_end - chrono::Duration::minutes(DELIVERY_LEAD_MINUTES));

        // the same deposit cannot fund a second request
        let other = h
            .service
            .create_mix_request(ACCOUNT, create_body("1000", &[("a", "995")]))
            .await
            .unwrap();
        assert!(matches!(
            h.service.confirm_deposit(ACCOUNT, &other.id, vec!["dep-1".into()]).await,
            Err(MixerError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_complete_requires_every_target() {
        let h = Harness::new().await;
        let request = h.mixing_request("1000", &[("a", "500"), ("b", "495")]).await;

        let err = h.service.complete_mix_request(&request.id).await.unwrap_err();
        assert!(matches!(err, MixerError::TargetsNotDelivered(2)));
        let stored = h.store.get_request(&request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Mixing);
        assert!(stored.completion_proof.is_none());
    }

    #[tokio::test]
    async fn test_other_accounts_cannot_see_request() {
        let h = Harness::new().await;
        let request = h
            .service
            .create_mix_request(ACCOUNT, create_body("1000", &[("a", "995")]))
            .await
            .unwrap();
        assert!(matches!(
            h.service.get_request("someone-else", &request.id).await,
            Err(MixerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_limit_clamped() {
        let h = Harness::new().await;
        let page = h.service.list_requests(ACCOUNT, 0, Some(5_000)).await.unwrap();
        assert_eq!(page.limit, MAX_LIST_LIMIT);
        let page = h.service.list_requests(ACCOUNT, 0, None).await.unwrap();
        assert_eq!(page.limit, DEFAULT_LIST_LIMIT);
    }

    #[tokio::test]
    async fn test_bond_events() {
        let h = Harness::new().await;
        h.service
            .handle_contract_event(ContractEvent::BondDeposited { amount: 500 })
            .await
            .unwrap();
        h.service
            .handle_contract_event(ContractEvent::BondSlashed {
                amount: 200,
                reason: "late delivery".into(),
            })
            .await
            .unwrap();
        let reg = h.store.get_registration().await.unwrap().unwrap();
        assert_eq!(reg.bond_amount, h.config.bond_amount + 300);
    }

    #[tokio::test]
    async fn test_slash_below_outstanding_suspends_service() {
        let h = Harness::new().await;
        h.service
            .create_mix_request(ACCOUNT, create_body("1000", &[("a", "995")]))
            .await
            .unwrap();
        h.service
            .handle_contract_event(ContractEvent::BondSlashed {
                amount: h.config.bond_amount - 500,
                reason: "upheld dispute".into(),
            })
            .await
            .unwrap();

        let reg = h.store.get_registration().await.unwrap().unwrap();
        assert_eq!(reg.status, ServiceStatus::Suspended);
        assert!(matches!(
            h.service
                .create_mix_request(ACCOUNT, create_body("1000", &[("a", "995")]))
                .await,
            Err(MixerError::InsufficientCapacity { available: 0, .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_deposits_credit_once() {
        let h = Harness::new().await;
        let body = || create_body("1000", &[("a", "995")]);
        let a = h.service.create_mix_request(ACCOUNT, body()).await.unwrap();
        let b = h.service.create_mix_request(ACCOUNT, body()).await.unwrap();
        h.chain.confirm("dep-shared");

        let (ra, rb) = tokio::join!(
            h.service.confirm_deposit(ACCOUNT, &a.id, vec!["dep-shared".into()]),
            h.service.confirm_deposit(ACCOUNT, &b.id, vec!["dep-shared".into()]),
        );
        assert_eq!(ra.is_ok() as u8 + rb.is_ok() as u8, 1);
        let loser = if ra.is_ok() { &b.id } else { &a.id };
        assert!(matches!(ra.err().or(rb.err()), Some(MixerError::Conflict(_))));
        assert_eq!(h.store.get_request(loser).await.unwrap().unwrap().status, RequestStatus::Pending);

        let credited = h
            .store
            .list_transactions_by_status(MixTxStatus::Confirmed)
            .await
            .unwrap()
            .into_iter()
            .chain(h.store.list_transactions_by_status(MixTxStatus::Executed).await.unwrap())
            .filter(|t| t.kind == TxKind::Deposit)
            .count();
        assert_eq!(credited, 1);
    }

    fn lock_holders(service: &MixerService, id: &str) -> usize {
        service.locks.get(id).map(|m| Arc::strong_count(m.value())).unwrap_or(0)
    }

    #[tokio::test]
    async fn test_request_locks_are_dropped_when_idle() {
        let h = Harness::new().await;
        let request = h.mixing_request("1000", &[("a", "995")]).await;
        h.run_until(&request.id, RequestStatus::Completed, 40).await;
        assert!(h.service.locks.is_empty());

        // a waiter keeps the entry alive
        let held = h.service.lock("req-x").await;
        let service = h.service.clone();
        let waiter = tokio::spawn(async move {
            let _guard = service.lock("req-x").await;
        });
        while lock_holders(&h.service, "req-x") < 3 {
            tokio::task::yield_now().await;
        }
        drop(held);
        assert_eq!(lock_holders(&h.service, "req-x"), 2);

        waiter.await.unwrap();
        assert!(h.service.locks.is_empty());
    }
}
