use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use solana_sdk::pubkey::Pubkey;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chain::{with_timeout, ChainClient};
use crate::clock::Clock;
use crate::config::{MixerConfig, MIN_MIXING_POOLS, POOL_RETIRE_DAYS, POOL_ROTATION_TX_THRESHOLD};
use crate::custodian::KeyCustodian;
use crate::error::{MixerError, Result};
use crate::master_keys::MasterKeyProvider;
use crate::model::{
    Destination, MixTransaction, MixTxStatus, PoolAccount, PoolStatus, RequestStatus, TxKind,
};
use crate::multisig::MultisigPolicy;
use crate::store::Store;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RotationReport {
    pub retired: usize,
    pub created: usize,
    pub migrations: usize,
    pub deleted: usize,
}

/// Creates, hands out and retires the ephemeral 1-of-2 pool accounts.
pub struct PoolRegistry {
    config: MixerConfig,
    store: Arc<dyn Store>,
    chain: Arc<dyn ChainClient>,
    custodian: Arc<dyn KeyCustodian>,
    master_keys: Arc<dyn MasterKeyProvider>,
    clock: Arc<dyn Clock>,
    cursor: AtomicUsize,
    /// Serializes pool creation, rotation and decoy scheduling.
    lifecycle: Mutex<()>,
}

impl PoolRegistry {
    pub fn new(
        config: MixerConfig,
        store: Arc<dyn Store>,
        chain: Arc<dyn ChainClient>,
        custodian: Arc<dyn KeyCustodian>,
        master_keys: Arc<dyn MasterKeyProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            chain,
            custodian,
            master_keys,
            clock,
            cursor: AtomicUsize::new(0),
            lifecycle: Mutex::new(()),
        }
    }

    /// Moves the custodian's index counter past every index already used.
    pub async fn init(&self) -> Result<()> {
        if let Some(highest) = self.store.highest_pool_index().await? {
            self.custodian.advance_pool_index(highest + 1);
            info!("Pool index resumes at {}", highest + 1);
        }
        Ok(())
    }

    pub async fn create_pool_account(&self) -> Result<PoolAccount> {
        let _guard = self.lifecycle.lock().await;
        self.create_pool_locked().await
    }

    async fn create_pool_locked(&self) -> Result<PoolAccount> {
        let index = self.custodian.next_pool_index();
        let master_pubkey = self.master_keys.master_public_key(index).await?;
        let custodian_pubkey = self
            .custodian
            .derive_pool_keys(index, &master_pubkey.to_string())
            .await?;
        let custodian_key = Pubkey::from_str(&custodian_pubkey)
            .map_err(|e| MixerError::Custodian(format!("bad pool key {}: {}", custodian_pubkey, e)))?;

        let policy = MultisigPolicy::one_of_two(custodian_key, master_pubkey)?;
        let address = policy.vault_address(&self.config.custody_program_id);
        let now = self.clock.now();

        let pool = PoolAccount {
            id: uuid::Uuid::new_v4().to_string(),
            pool_index: index,
            custodian_pubkey,
            master_pubkey: master_pubkey.to_string(),
            policy_script: hex::encode(policy.script()),
            address: address.to_string(),
            status: PoolStatus::Active,
            balance: 0,
            pending_in: 0,
            pending_out: 0,
            total_received: 0,
            total_sent: 0,
            transaction_count: 0,
            created_at: now,
            retire_after: now + chrono::Duration::days(POOL_RETIRE_DAYS),
            last_activity_at: None,
        };
        self.store.insert_pool(&pool).await?;

        info!("Created pool account {} (index {}) at {}", pool.id, index, pool.address);
        Ok(pool)
    }

    pub async fn active_pools(&self) -> Result<Vec<PoolAccount>> {
        self.store.list_pools(Some(PoolStatus::Active)).await
    }

    /// Round-robin over active pools, creating one if none exist.
    pub async fn select_deposit_pool(&self) -> Result<PoolAccount> {
        let active = self.active_pools().await?;
        if active.is_empty() {
            return self.create_pool_account().await;
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % active.len();
        Ok(active[i].clone())
    }

    /// Returns how many pools were created.
    pub async fn ensure_minimum_pools(&self, min_active: usize) -> Result<usize> {
        let _guard = self.lifecycle.lock().await;
        self.top_up_locked(min_active).await
    }

    async fn top_up_locked(&self, min_active: usize) -> Result<usize> {
        let active = self.active_pools().await?.len();
        let mut created = 0;
        for _ in active..min_active {
            self.create_pool_locked().await?;
            created += 1;
        }
        Ok(created)
    }

    /// Pools that a live request or an unfinished transfer still refers to.
    async fn pools_in_use(&self) -> Result<HashSet<String>> {
        let live = [RequestStatus::Pending, RequestStatus::Deposited, RequestStatus::Mixing];
        let requests = self.store.list_requests_by_status(&live).await?;
        let live_ids: HashSet<&str> = requests.iter().map(|r| r.id.as_str()).collect();
        let mut in_use: HashSet<String> = requests.iter().map(|r| r.deposit_pool_id.clone()).collect();

        for status in [
            MixTxStatus::Scheduled,
            MixTxStatus::Executing,
            MixTxStatus::Executed,
            MixTxStatus::Failed,
        ] {
            for tx in self.store.list_transactions_by_status(status).await? {
                // failed transfers only matter while their request can resume
                if status == MixTxStatus::Failed
                    && !tx.request_id.as_deref().is_some_and(|id| live_ids.contains(id))
                {
                    continue;
                }
                in_use.extend(tx.source_pool_id.clone());
                in_use.extend(tx.destination_pool().map(str::to_string));
            }
        }
        Ok(in_use)
    }

    /// Retires pools past their age or usage limit, provisions replacements,
    /// migrates idle balances off retiring pools and deletes drained ones.
    /// A pool still referenced by a request or transfer is left alone, and
    /// one the ledger still reports funds for is never deleted.
    pub async fn rotate_pools(&self, min_active: usize) -> Result<RotationReport> {
        let _guard = self.lifecycle.lock().await;
        let now = self.clock.now();
        let mut report = RotationReport::default();

        for mut pool in self.active_pools().await? {
            if pool.due_for_rotation(now, POOL_ROTATION_TX_THRESHOLD) {
                pool.status = PoolStatus::Retiring;
                self.store.update_pool(&pool).await?;
                info!(
                    "Retiring pool {} (index {}, {} txs)",
                    pool.id, pool.pool_index, pool.transaction_count
                );
                report.retired += 1;
            }
        }

        report.created = self.top_up_locked(min_active).await?;
        let active = self.active_pools().await?;
        let in_use = self.pools_in_use().await?;

        for pool in self.store.list_pools(Some(PoolStatus::Retiring)).await? {
            if in_use.contains(&pool.id) {
                continue;
            }

            if pool.is_drained() {
                match with_timeout(
                    self.config.rpc_timeout,
                    "pool balance",
                    self.chain.get_balance(&pool.address),
                )
                .await
                {
                    Ok(0) => {
                        self.store.delete_pool(&pool.id).await?;
                        info!("Deleted drained pool {} (index {})", pool.id, pool.pool_index);
                        report.deleted += 1;
                    }
                    Ok(held) => warn!(
                        "Pool {} is drained in the books but holds {} on the ledger, keeping it",
                        pool.id, held
                    ),
                    Err(e) => warn!("Balance of retiring pool {} unavailable: {}", pool.id, e),
                }
                continue;
            }

            if pool.spendable() == 0 || active.is_empty() {
                continue;
            }

            let target = &active[pool.pool_index as usize % active.len()];
            let migration = MixTransaction::scheduled(
                TxKind::Internal,
                None,
                Some(pool.id.clone()),
                Destination::Pool(target.id.clone()),
                pool.spendable(),
                now,
                self.config.max_tx_attempts,
                now,
            );
            self.store.insert_transactions(&[migration]).await?;
            info!(
                "Scheduled migration of {} from retiring pool {} to {}",
                pool.spendable(),
                pool.id,
                target.id
            );
            report.migrations += 1;
        }

        Ok(report)
    }

    /// Schedules one decoy between two active pools, due now. It only moves
    /// balance that no scheduled transfer is counting on, so it never holds
    /// up a request. Returns `None` when there is nothing free to move.
    pub async fn schedule_decoy(&self) -> Result<Option<MixTransaction>> {
        let _guard = self.lifecycle.lock().await;
        let active = self.active_pools().await?;
        if active.len() < MIN_MIXING_POOLS {
            return Ok(None);
        }

        // transfers signed already hold their amount in pending_out
        let mut committed: HashMap<String, u64> = HashMap::new();
        for status in [MixTxStatus::Scheduled, MixTxStatus::Executing] {
            for tx in self.store.list_transactions_by_status(status).await? {
                if let (Some(source), None) = (&tx.source_pool_id, &tx.raw_tx) {
                    *committed.entry(source.clone()).or_default() += tx.amount;
                }
            }
        }

        let free: Vec<(usize, u64)> = active
            .iter()
            .enumerate()
            .map(|(i, p)| (i, p.spendable().saturating_sub(committed.get(&p.id).copied().unwrap_or(0))))
            .filter(|(_, f)| *f > 0)
            .collect();
        if free.is_empty() {
            debug!("No free pool balance for a decoy");
            return Ok(None);
        }

        let (source, destination, amount) = {
            let mut rng = rand::thread_rng();
            let (source, free) = free[rng.gen_range(0..free.len())];
            let mut destination = rng.gen_range(0..active.len() - 1);
            if destination >= source {
                destination += 1;
            }
            let amount = rng.gen_range(1..=free.min(self.config.decoy_max_amount.max(1)));
            (&active[source], &active[destination], amount)
        };

        let now = self.clock.now();
        let decoy = MixTransaction::scheduled(
            TxKind::Decoy,
            None,
            Some(source.id.clone()),
            Destination::Pool(destination.id.clone()),
            amount,
            now,
            self.config.max_tx_attempts,
            now,
        );
        self.store.insert_transactions(&[decoy.clone()]).await?;
        debug!("Scheduled decoy {} of {} from {} to {}", decoy.id, amount, source.id, destination.id);
        Ok(Some(decoy))
    }

    fn next_decoy_delay(&self) -> Duration {
        let min = self.config.decoy_interval_min.as_secs();
        let max = self.config.decoy_interval_max.as_secs().max(min);
        Duration::from_secs(rand::thread_rng().gen_range(min..=max))
    }

    pub async fn run_decoys(self: Arc<Self>, token: CancellationToken) {
        info!(
            "Decoy scheduler started (every {:?} to {:?})",
            self.config.decoy_interval_min, self.config.decoy_interval_max
        );

        loop {
            let delay = self.next_decoy_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = self.schedule_decoy().await {
                        error!("Decoy scheduling failed: {}", e);
                    }
                }
                _ = token.cancelled() => {
                    warn!("Decoy scheduler shutting down");
                    break;
                }
            }
        }
    }

    pub async fn run_rotation(self: Arc<Self>, token: CancellationToken, every: Duration, min_active: usize) {
        let mut interval = tokio::time::interval(every);
        info!("Pool rotation started (every {:?})", every);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.rotate_pools(min_active).await {
                        Ok(report) if report != RotationReport::default() => {
                            info!("Pool rotation: {:?}", report)
                        }
                        Ok(_) => {}
                        Err(e) => error!("Pool rotation failed: {}", e),
                    }
                }
                _ = token.cancelled() => {
                    warn!("Pool rotation shutting down");
                    break;
                }
            }
        }
    }
}
