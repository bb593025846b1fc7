use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{MixerError, Result};
use crate::model::{
    DisputeRecord, MixRequest, MixTransaction, MixTxStatus, PoolAccount, PoolMutation, PoolStatus,
    RequestStatus, ServiceRegistration, ServiceStatus, WithdrawalClaim,
};

/// Durable record of requests, pool accounts, scheduled transfers, claims,
/// disputes and the service bond. Every method is a single atomic step.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_request(&self, request: &MixRequest) -> Result<()>;
    async fn get_request(&self, id: &str) -> Result<Option<MixRequest>>;
    async fn update_request(&self, request: &MixRequest) -> Result<()>;
    /// Newest first.
    async fn list_requests_by_account(
        &self,
        account_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<MixRequest>, usize)>;
    async fn list_requests_by_status(&self, statuses: &[RequestStatus]) -> Result<Vec<MixRequest>>;

    async fn insert_pool(&self, pool: &PoolAccount) -> Result<()>;
    async fn get_pool(&self, id: &str) -> Result<Option<PoolAccount>>;
    async fn update_pool(&self, pool: &PoolAccount) -> Result<()>;
    async fn delete_pool(&self, id: &str) -> Result<()>;
    /// Ordered by pool index.
    async fn list_pools(&self, status: Option<PoolStatus>) -> Result<Vec<PoolAccount>>;
    /// Highest pool index ever stored, deleted pools included.
    async fn highest_pool_index(&self) -> Result<Option<u32>>;
    /// Applies a checked balance mutation; the pool is untouched on error.
    async fn mutate_pool(&self, id: &str, mutation: PoolMutation, now: DateTime<Utc>) -> Result<PoolAccount>;

    async fn insert_transactions(&self, txs: &[MixTransaction]) -> Result<()>;
    async fn get_transaction(&self, id: &str) -> Result<Option<MixTransaction>>;
    async fn update_transaction(&self, tx: &MixTransaction) -> Result<()>;
    /// Atomically moves the earliest due `Scheduled` transaction to
    /// `Executing` and returns it. No two callers ever get the same one.
    async fn claim_due_transaction(&self, now: DateTime<Utc>) -> Result<Option<MixTransaction>>;
    async fn list_transactions_by_status(&self, status: MixTxStatus) -> Result<Vec<MixTransaction>>;
    async fn list_transactions_for_request(&self, request_id: &str) -> Result<Vec<MixTransaction>>;
    /// Credits observed deposits to `pool_id` in one step: fails with
    /// `Conflict` if any of their tx refs was ever credited before,
    /// otherwise records the refs, inserts `deposits` and expects `amount`
    /// incoming on the pool.
    async fn credit_deposits(
        &self,
        pool_id: &str,
        amount: u64,
        deposits: &[MixTransaction],
        now: DateTime<Utc>,
    ) -> Result<PoolAccount>;

    /// Fails with `Conflict` when the request already has a claim.
    async fn create_claim(&self, claim: &WithdrawalClaim) -> Result<()>;
    async fn get_claim_for_request(&self, request_id: &str) -> Result<Option<WithdrawalClaim>>;
    async fn update_claim(&self, claim: &WithdrawalClaim) -> Result<()>;

    /// Fails with `Conflict` when the request already has a dispute.
    async fn insert_dispute(&self, dispute: &DisputeRecord) -> Result<()>;
    async fn get_dispute(&self, request_id: &str) -> Result<Option<DisputeRecord>>;
    async fn update_dispute(&self, dispute: &DisputeRecord) -> Result<()>;

    async fn get_registration(&self) -> Result<Option<ServiceRegistration>>;
    async fn put_registration(&self, registration: &ServiceRegistration) -> Result<()>;
    /// Raises the outstanding amount if it stays within capacity.
    async fn reserve_capacity(&self, amount: u64, now: DateTime<Utc>) -> Result<ServiceRegistration>;
    async fn release_capacity(&self, amount: u64, now: DateTime<Utc>) -> Result<ServiceRegistration>;
    /// Adds (`delta > 0`) or slashes (`delta < 0`) bond. The service is
    /// suspended while its bond is below the outstanding amount and
    /// reactivated once a top-up covers it again.
    async fn adjust_bond(&self, delta: i128, now: DateTime<Utc>) -> Result<ServiceRegistration>;
}

#[derive(Clone, Default, Serialize, Deserialize)]
struct Tables {
    requests: BTreeMap<String, MixRequest>,
    pools: BTreeMap<String, PoolAccount>,
    transactions: BTreeMap<String, MixTransaction>,
    claims: BTreeMap<String, WithdrawalClaim>,
    disputes: BTreeMap<String, DisputeRecord>,
    registration: Option<ServiceRegistration>,
    highest_pool_index: Option<u32>,
    /// Deposit tx ref to the request it was credited to.
    #[serde(default)]
    deposit_refs: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize)]
struct StoreSnapshot {
    tables: serde_json::Value,
    checksum: String,
}

impl StoreSnapshot {
    fn compute_checksum(tables: &serde_json::Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"mixer_store_state_v1:");
        hasher.update(tables.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    fn new(tables: serde_json::Value) -> Self {
        let checksum = Self::compute_checksum(&tables);
        Self { tables, checksum }
    }

    fn verify(&self) -> bool {
        Self::compute_checksum(&self.tables) == self.checksum
    }
}

/// In-process store. Writers are serialized; each one edits a copy of the
/// tables, persists the copy (temp file + rename, on the blocking pool)
/// and only then makes it visible. A failed write changes nothing.
pub struct MemoryStore {
    tables: RwLock<Tables>,
    snapshot_path: Option<PathBuf>,
    writer: Mutex<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            snapshot_path: None,
            writer: Mutex::new(()),
        }
    }

    /// Loads the snapshot at `path` if present. A checksum mismatch is an
    /// error: starting empty over a corrupted file would forget live funds.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut tables = Tables::default();

        if path.exists() {
            let data = std::fs::read_to_string(&path)
                .map_err(|e| MixerError::Store(format!("read {}: {}", path.display(), e)))?;
            let snapshot: StoreSnapshot = serde_json::from_str(&data)
                .map_err(|e| MixerError::Store(format!("parse {}: {}", path.display(), e)))?;
            if !snapshot.verify() {
                error!("Checksum mismatch for store snapshot {} - data corrupted", path.display());
                return Err(MixerError::Store("snapshot checksum mismatch".into()));
            }
            tables = serde_json::from_value(snapshot.tables)
                .map_err(|e| MixerError::Store(format!("decode tables: {}", e)))?;

            // A crash between claim and send leaves Executing rows behind;
            // their raw bytes make a resend idempotent.
            let mut recovered = 0;
            for tx in tables.transactions.values_mut() {
                if tx.status == MixTxStatus::Executing {
                    tx.status = MixTxStatus::Scheduled;
                    recovered += 1;
                }
            }

            info!(
                "Loaded store snapshot: {} requests, {} pools, {} transactions ({} recovered)",
                tables.requests.len(),
                tables.pools.len(),
                tables.transactions.len(),
                recovered
            );
        }

        Ok(Self {
            tables: RwLock::new(tables),
            snapshot_path: Some(path),
            writer: Mutex::new(()),
        })
    }

    async fn persist(&self, tables: &Tables) -> Result<()> {
        let Some(path) = self.snapshot_path.clone() else {
            return Ok(());
        };

        let value = serde_json::to_value(tables)
            .map_err(|e| MixerError::Store(format!("Serialize failed: {}", e)))?;
        let json = serde_json::to_string_pretty(&StoreSnapshot::new(value))
            .map_err(|e| MixerError::Store(format!("Serialize failed: {}", e)))?;

        tokio::task::spawn_blocking(move || write_snapshot(&path, json))
            .await
            .map_err(|e| MixerError::Store(format!("snapshot writer: {}", e)))?
    }

    /// Applies `f` to a copy of the tables and swaps the copy in once it is
    /// persisted.
    async fn write<T: Send>(&self, f: impl FnOnce(&mut Tables) -> Result<T> + Send) -> Result<T> {
        let _writer = self.writer.lock().await;
        let mut next = self.tables.read().clone();
        let out = f(&mut next)?;
        self.persist(&next).await?;
        *self.tables.write() = next;
        Ok(out)
    }
}

fn write_snapshot(path: &Path, json: String) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    std::fs::write(&temp_path, json)
        .map_err(|e| MixerError::Store(format!("write {}: {}", temp_path.display(), e)))?;
    std::fs::rename(&temp_path, path).map_err(|e| {
        warn!("Failed to move snapshot into place: {}", e);
        MixerError::Store(format!("rename {}: {}", path.display(), e))
    })
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn missing(kind: &str, id: &str) -> MixerError {
    MixerError::NotFound(format!("{} {}", kind, id))
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_request(&self, request: &MixRequest) -> Result<()> {
        self.write(|t| {
            if t.requests.contains_key(&request.id) {
                return Err(MixerError::Conflict(format!("request {} exists", request.id)));
            }
            t.requests.insert(request.id.clone(), request.clone());
            Ok(())
        })
        .await
    }

    async fn get_request(&self, id: &str) -> Result<Option<MixRequest>> {
        Ok(self.tables.read().requests.get(id).cloned())
    }

    async fn update_request(&self, request: &MixRequest) -> Result<()> {
        self.write(|t| match t.requests.get_mut(&request.id) {
            Some(slot) => {
                *slot = request.clone();
                Ok(())
            }
            None => Err(missing("request", &request.id)),
        })
        .await
    }

    async fn list_requests_by_account(
        &self,
        account_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<MixRequest>, usize)> {
        let tables = self.tables.read();
        let mut owned: Vec<&MixRequest> = tables
            .requests
            .values()
            .filter(|r| r.account_id == account_id)
            .collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        let total = owned.len();
        let page = owned.into_iter().skip(offset).take(limit).cloned().collect();
        Ok((page, total))
    }

    async fn list_requests_by_status(&self, statuses: &[RequestStatus]) -> Result<Vec<MixRequest>> {
        Ok(self
            .tables
            .read()
            .requests
            .values()
            .filter(|r| statuses.contains(&r.status))
            .cloned()
            .collect())
    }

    async fn insert_pool(&self, pool: &PoolAccount) -> Result<()> {
        self.write(|t| {
            if t.pools.contains_key(&pool.id) {
                return Err(MixerError::Conflict(format!("pool {} exists", pool.id)));
            }
            t.highest_pool_index = Some(
                t.highest_pool_index
                    .map_or(pool.pool_index, |h| h.max(pool.pool_index)),
            );
            t.pools.insert(pool.id.clone(), pool.clone());
            Ok(())
        })
        .await
    }

    async fn get_pool(&self, id: &str) -> Result<Option<PoolAccount>> {
        Ok(self.tables.read().pools.get(id).cloned())
    }

    async fn update_pool(&self, pool: &PoolAccount) -> Result<()> {
        self.write(|t| match t.pools.get_mut(&pool.id) {
            Some(slot) => {
                *slot = pool.clone();
                Ok(())
            }
            None => Err(missing("pool", &pool.id)),
        })
        .await
    }

    async fn delete_pool(&self, id: &str) -> Result<()> {
        self.write(|t| {
            t.pools.remove(id).map(|_| ()).ok_or_else(|| missing("pool", id))
        })
        .await
    }

    async fn list_pools(&self, status: Option<PoolStatus>) -> Result<Vec<PoolAccount>> {
        let mut pools: Vec<PoolAccount> = self
            .tables
            .read()
            .pools
            .values()
            .filter(|p| status.map_or(true, |s| p.status == s))
            .cloned()
            .collect();
        pools.sort_by_key(|p| p.pool_index);
        Ok(pools)
    }

    async fn highest_pool_index(&self) -> Result<Option<u32>> {
        Ok(self.tables.read().highest_pool_index)
    }

    async fn mutate_pool(&self, id: &str, mutation: PoolMutation, now: DateTime<Utc>) -> Result<PoolAccount> {
        self.write(|t| {
            let pool = t.pools.get_mut(id).ok_or_else(|| missing("pool", id))?;
            let mut updated = pool.clone();
            updated.apply(mutation, now)?;
            *pool = updated.clone();
            Ok(updated)
        })
        .await
    }

    async fn insert_transactions(&self, txs: &[MixTransaction]) -> Result<()> {
        self.write(|t| {
            for tx in txs {
                t.transactions.insert(tx.id.clone(), tx.clone());
            }
            Ok(())
        })
        .await
    }

    async fn get_transaction(&self, id: &str) -> Result<Option<MixTransaction>> {
        Ok(self.tables.read().transactions.get(id).cloned())
    }

    async fn update_transaction(&self, tx: &MixTransaction) -> Result<()> {
        self.write(|t| match t.transactions.get_mut(&tx.id) {
            Some(slot) => {
                *slot = tx.clone();
                Ok(())
            }
            None => Err(missing("transaction", &tx.id)),
        })
        .await
    }

    async fn claim_due_transaction(&self, now: DateTime<Utc>) -> Result<Option<MixTransaction>> {
        self.write(|t| {
            let due = t
                .transactions
                .values()
                .filter(|tx| tx.status == MixTxStatus::Scheduled && tx.scheduled_at <= now)
                .min_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at).then_with(|| a.id.cmp(&b.id)))
                .map(|tx| tx.id.clone());

            Ok(due.and_then(|id| {
                t.transactions.get_mut(&id).map(|tx| {
                    tx.status = MixTxStatus::Executing;
                    tx.updated_at = now;
                    tx.clone()
                })
            }))
        })
        .await
    }

    async fn list_transactions_by_status(&self, status: MixTxStatus) -> Result<Vec<MixTransaction>> {
        let mut txs: Vec<MixTransaction> = self
            .tables
            .read()
            .transactions
            .values()
            .filter(|tx| tx.status == status)
            .cloned()
            .collect();
        txs.sort_by_key(|tx| tx.scheduled_at);
        Ok(txs)
    }

    async fn list_transactions_for_request(&self, request_id: &str) -> Result<Vec<MixTransaction>> {
        let mut txs: Vec<MixTransaction> = self
            .tables
            .read()
            .transactions
            .values()
            .filter(|tx| tx.request_id.as_deref() == Some(request_id))
            .cloned()
            .collect();
        txs.sort_by_key(|tx| tx.scheduled_at);
        Ok(txs)
    }

    async fn credit_deposits(
        &self,
        pool_id: &str,
        amount: u64,
        deposits: &[MixTransaction],
        now: DateTime<Utc>,
    ) -> Result<PoolAccount> {
        self.write(|t| {
            for tx in deposits {
                let Some(tx_ref) = &tx.tx_ref else {
                    return Err(MixerError::Internal(format!("deposit {} has no tx ref", tx.id)));
                };
                if t.deposit_refs.contains_key(tx_ref) {
                    return Err(MixerError::Conflict(format!(
                        "deposit {} already credited to another request",
                        tx_ref
                    )));
                }
            }

            let pool = t.pools.get_mut(pool_id).ok_or_else(|| missing("pool", pool_id))?;
            pool.apply(PoolMutation::ExpectIncoming(amount), now)?;
            let pool = pool.clone();

            for tx in deposits {
                if let Some(tx_ref) = &tx.tx_ref {
                    let owner = tx.request_id.clone().unwrap_or_default();
                    t.deposit_refs.insert(tx_ref.clone(), owner);
                }
                t.transactions.insert(tx.id.clone(), tx.clone());
            }
            Ok(pool)
        })
        .await
    }

    async fn create_claim(&self, claim: &WithdrawalClaim) -> Result<()> {
        self.write(|t| {
            if t.claims.contains_key(&claim.request_id) {
                return Err(MixerError::Conflict(format!(
                    "withdrawal claim already exists for request {}",
                    claim.request_id
                )));
            }
            t.claims.insert(claim.request_id.clone(), claim.clone());
            Ok(())
        })
        .await
    }

    async fn get_claim_for_request(&self, request_id: &str) -> Result<Option<WithdrawalClaim>> {
        Ok(self.tables.read().claims.get(request_id).cloned())
    }

    async fn update_claim(&self, claim: &WithdrawalClaim) -> Result<()> {
        self.write(|t| match t.claims.get_mut(&claim.request_id) {
            Some(slot) => {
                *slot = claim.clone();
                Ok(())
            }
            None => Err(missing("claim for request", &claim.request_id)),
        })
        .await
    }

    async fn insert_dispute(&self, dispute: &DisputeRecord) -> Result<()> {
        self.write(|t| {
            if t.disputes.contains_key(&dispute.request_id) {
                return Err(MixerError::Conflict(format!(
                    "dispute already open for request {}",
                    dispute.request_id
                )));
            }
            t.disputes.insert(dispute.request_id.clone(), dispute.clone());
            Ok(())
        })
        .await
    }

    async fn get_dispute(&self, request_id: &str) -> Result<Option<DisputeRecord>> {
        Ok(self.tables.read().disputes.get(request_id).cloned())
    }

    async fn update_dispute(&self, dispute: &DisputeRecord) -> Result<()> {
        self.write(|t| match t.disputes.get_mut(&dispute.request_id) {
            Some(slot) => {
                *slot = dispute.clone();
                Ok(())
            }
            None => Err(missing("dispute for request", &dispute.request_id)),
        })
        .await
    }

    async fn get_registration(&self) -> Result<Option<ServiceRegistration>> {
        Ok(self.tables.read().registration.clone())
    }

    async fn put_registration(&self, registration: &ServiceRegistration) -> Result<()> {
        self.write(|t| {
            t.registration = Some(registration.clone());
            Ok(())
        })
        .await
    }

    async fn reserve_capacity(&self, amount: u64, now: DateTime<Utc>) -> Result<ServiceRegistration> {
        self.write(|t| {
            let reg = t
                .registration
                .as_mut()
                .ok_or_else(|| MixerError::Internal("service not registered".into()))?;
            let available = reg.available_capacity();
            if amount > available {
                return Err(MixerError::InsufficientCapacity {
                    requested: amount,
                    available,
                });
            }
            reg.outstanding_amount += amount;
            reg.updated_at = now;
            Ok(reg.clone())
        })
        .await
    }

    async fn release_capacity(&self, amount: u64, now: DateTime<Utc>) -> Result<ServiceRegistration> {
        self.write(|t| {
            let reg = t
                .registration
                .as_mut()
                .ok_or_else(|| MixerError::Internal("service not registered".into()))?;
            if amount > reg.outstanding_amount {
                warn!(
                    "Releasing {} exceeds outstanding {}, clamping",
                    amount, reg.outstanding_amount
                );
            }
            reg.outstanding_amount = reg.outstanding_amount.saturating_sub(amount);
            reg.updated_at = now;
            Ok(reg.clone())
        })
        .await
    }

    async fn adjust_bond(&self, delta: i128, now: DateTime<Utc>) -> Result<ServiceRegistration> {
        self.write(|t| {
            let reg = t
                .registration
                .as_mut()
                .ok_or_else(|| MixerError::Internal("service not registered".into()))?;
            let bond = (reg.bond_amount as i128 + delta).clamp(0, u64::MAX as i128) as u64;
            reg.bond_amount = bond;
            reg.updated_at = now;

            if bond < reg.outstanding_amount && reg.status == ServiceStatus::Active {
                warn!(
                    "Bond {} below outstanding {}, suspending service {}",
                    bond, reg.outstanding_amount, reg.service_id
                );
                reg.status = ServiceStatus::Suspended;
            } else if bond >= reg.outstanding_amount && delta > 0 && reg.status == ServiceStatus::Suspended {
                info!("Bond {} covers outstanding again, reactivating {}", bond, reg.service_id);
                reg.status = ServiceStatus::Active;
            }
            Ok(reg.clone())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Destination, TxKind};
    use std::sync::Arc;

    fn tx_at(now: DateTime<Utc>, offset_secs: i64) -> MixTransaction {
        MixTransaction::scheduled(
            TxKind::Internal,
            Some("req".into()),
            Some("pool-a".into()),
            Destination::Pool("pool-b".into()),
            10,
            now + chrono::Duration::seconds(offset_secs),
            3,
            now,
        )
    }

    fn registration(bond: u64, now: DateTime<Utc>) -> ServiceRegistration {
        ServiceRegistration {
            service_id: "svc".into(),
            custodian_pubkey: "key".into(),
            bond_amount: bond,
            outstanding_amount: 0,
            max_outstanding: 100_000,
            status: ServiceStatus::Active,
            registered_at: now,
            updated_at: now,
        }
    }

    fn pool(id: &str, now: DateTime<Utc>) -> PoolAccount {
        PoolAccount {
            id: id.into(),
            pool_index: 0,
            custodian_pubkey: "custodian".into(),
            master_pubkey: "master".into(),
            policy_script: String::new(),
            address: format!("addr-{}", id),
            status: PoolStatus::Active,
            balance: 0,
            pending_in: 0,
            pending_out: 0,
            total_received: 0,
            total_sent: 0,
            transaction_count: 0,
            created_at: now,
            retire_after: now,
            last_activity_at: None,
        }
    }

    fn deposit(request_id: &str, tx_ref: &str, amount: u64, now: DateTime<Utc>) -> MixTransaction {
        let mut tx = MixTransaction::scheduled(
            TxKind::Deposit,
            Some(request_id.into()),
            None,
            Destination::Pool("pool-a".into()),
            amount,
            now,
            3,
            now,
        );
        tx.status = MixTxStatus::Executed;
        tx.tx_ref = Some(tx_ref.into());
        tx
    }

    #[tokio::test]
    async fn test_claim_due_respects_schedule() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let early = tx_at(now, -10);
        let later = tx_at(now, 3600);
        store.insert_transactions(&[later.clone(), early.clone()]).await.unwrap();

        let claimed = store.claim_due_transaction(now).await.unwrap().unwrap();
        assert_eq!(claimed.id, early.id);
        assert_eq!(claimed.status, MixTxStatus::Executing);
        assert!(store.claim_due_transaction(now).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_claims_never_share_a_transaction() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let txs: Vec<MixTransaction> = (0..200).map(|i| tx_at(now, -i)).collect();
        store.insert_transactions(&txs).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                while let Some(tx) = store.claim_due_transaction(now).await.unwrap() {
                    mine.push(tx.id);
                    tokio::task::yield_now().await;
                }
                mine
            }));
        }

        let mut all = Vec::new();
        for h in handles {
            all.extend(h.await.unwrap());
        }
        let unique: std::collections::HashSet<_> = all.iter().cloned().collect();
        assert_eq!(all.len(), 200);
        assert_eq!(unique.len(), 200);
    }

    #[tokio::test]
    async fn test_capacity_reservation() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.put_registration(&registration(1_000, now)).await.unwrap();

        store.reserve_capacity(600, now).await.unwrap();
        let err = store.reserve_capacity(500, now).await.unwrap_err();
        assert!(matches!(
            err,
            MixerError::InsufficientCapacity { requested: 500, available: 400 }
        ));

        let reg = store.release_capacity(600, now).await.unwrap();
        assert_eq!(reg.outstanding_amount, 0);
        let reg = store.adjust_bond(-2_000, now).await.unwrap();
        assert_eq!(reg.bond_amount, 0);
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip_and_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let now = Utc::now();

        {
            let store = MemoryStore::open(&path).unwrap();
            store.put_registration(&registration(5_000, now)).await.unwrap();
            store.insert_transactions(&[tx_at(now, -1)]).await.unwrap();
            store.claim_due_transaction(now).await.unwrap().unwrap();
        }

        let reopened = MemoryStore::open(&path).unwrap();
        assert_eq!(reopened.get_registration().await.unwrap().unwrap().bond_amount, 5_000);
        let scheduled = reopened.list_transactions_by_status(MixTxStatus::Scheduled).await.unwrap();
        assert_eq!(scheduled.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_persist_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let now = Utc::now();
        let store = MemoryStore::open(&path).unwrap();
        store.put_registration(&registration(5_000, now)).await.unwrap();
        store.insert_transactions(&[tx_at(now, -1)]).await.unwrap();

        // the temp file can no longer be written
        std::fs::create_dir(path.with_extension("tmp")).unwrap();

        assert!(matches!(store.reserve_capacity(1_000, now).await, Err(MixerError::Store(_))));
        assert_eq!(store.get_registration().await.unwrap().unwrap().outstanding_amount, 0);

        assert!(store.claim_due_transaction(now).await.is_err());
        let scheduled = store.list_transactions_by_status(MixTxStatus::Scheduled).await.unwrap();
        assert_eq!(scheduled.len(), 1);
    }

    #[tokio::test]
    async fn test_deposit_ref_credited_once() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.insert_pool(&pool("pool-a", now)).await.unwrap();

        let credited = store
            .credit_deposits("pool-a", 700, &[deposit("req-1", "dep-1", 700, now)], now)
            .await
            .unwrap();
        assert_eq!(credited.pending_in, 700);

        let reused = [deposit("req-2", "dep-2", 300, now), deposit("req-2", "dep-1", 400, now)];
        let err = store.credit_deposits("pool-a", 700, &reused, now).await.unwrap_err();
        assert!(matches!(err, MixerError::Conflict(_)));

        assert_eq!(store.get_pool("pool-a").await.unwrap().unwrap().pending_in, 700);
        assert!(store.list_transactions_for_request("req-2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_slash_below_outstanding_suspends() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.put_registration(&registration(1_000, now)).await.unwrap();
        store.reserve_capacity(800, now).await.unwrap();

        let reg = store.adjust_bond(-500, now).await.unwrap();
        assert_eq!(reg.status, ServiceStatus::Suspended);
        assert_eq!(reg.available_capacity(), 0);
        assert!(matches!(
            store.reserve_capacity(1, now).await,
            Err(MixerError::InsufficientCapacity { available: 0, .. })
        ));

        let reg = store.adjust_bond(300, now).await.unwrap();
        assert_eq!(reg.status, ServiceStatus::Active);
        assert_eq!(reg.available_capacity(), 0);
        let reg = store.adjust_bond(200, now).await.unwrap();
        assert_eq!(reg.available_capacity(), 200);
    }

    #[tokio::test]
    async fn test_corrupted_snapshot_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let now = Utc::now();
        {
            let store = MemoryStore::open(&path).unwrap();
            store.put_registration(&registration(5_000, now)).await.unwrap();
        }

        let data = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, data.replace("5000", "9000")).unwrap();
        assert!(matches!(MemoryStore::open(&path), Err(MixerError::Store(_))));
    }
}
