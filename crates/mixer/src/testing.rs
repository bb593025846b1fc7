//! In-process ledger and a fully wired service for tests.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;

use mixer_sdk::api::{CreateMixRequest, TargetSpec};

use crate::app::Mixer;
use crate::chain::{ChainClient, ChainTxStatus, ProofSubmission, SignedTx, TransferRequest, UnsignedTx};
use crate::clock::{Clock, ManualClock};
use crate::config::MixerConfig;
use crate::custodian::SealedSeedCustodian;
use crate::error::{MixerError, Result};
use crate::executor::MixingExecutor;
use crate::master_keys::MasterKeyBundle;
use crate::model::{MixRequest, RequestStatus};
use crate::monitor::DisputeMonitor;
use crate::registry::PoolRegistry;
use crate::service::MixerService;
use crate::store::MemoryStore;

pub const ACCOUNT: &str = "acct-test";

/// Ledger double. Signatures are checked against the declared signer, sends
/// can be made to fail or hang, and sent transfers land immediately unless
/// auto-confirm is off.
pub struct MockChain {
    statuses: DashMap<String, ChainTxStatus>,
    balances: DashMap<String, u64>,
    refs: DashMap<Vec<u8>, String>,
    sent: Mutex<Vec<Vec<u8>>>,
    proofs: Mutex<Vec<ProofSubmission>>,
    fail_sends: AtomicU32,
    hang_sends: AtomicBool,
    auto_confirm: AtomicBool,
    counter: AtomicU64,
}

impl Default for MockChain {
    fn default() -> Self {
        Self {
            statuses: DashMap::new(),
            balances: DashMap::new(),
            refs: DashMap::new(),
            sent: Mutex::new(Vec::new()),
            proofs: Mutex::new(Vec::new()),
            fail_sends: AtomicU32::new(0),
            hang_sends: AtomicBool::new(false),
            auto_confirm: AtomicBool::new(true),
            counter: AtomicU64::new(1),
        }
    }
}

impl MockChain {
    pub fn set_status(&self, tx_ref: &str, status: ChainTxStatus) {
        self.statuses.insert(tx_ref.to_string(), status);
    }

    pub fn confirm(&self, tx_ref: &str) {
        let block_height = self.counter.fetch_add(1, Ordering::SeqCst);
        self.set_status(
            tx_ref,
            ChainTxStatus::Landed {
                block_height,
                confirmations: 32,
            },
        );
    }

    pub fn set_balance(&self, address: &str, lamports: u64) {
        self.balances.insert(address.to_string(), lamports);
    }

    pub fn fail_next_sends(&self, n: u32) {
        self.fail_sends.store(n, Ordering::SeqCst);
    }

    pub fn hang_sends(&self, hang: bool) {
        self.hang_sends.store(hang, Ordering::SeqCst);
    }

    pub fn set_auto_confirm(&self, on: bool) {
        self.auto_confirm.store(on, Ordering::SeqCst);
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn proof_submissions(&self) -> Vec<ProofSubmission> {
        self.proofs.lock().clone()
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn get_balance(&self, address: &str) -> Result<u64> {
        Ok(self.balances.get(address).map(|b| *b).unwrap_or(0))
    }

    async fn build_transfer_tx(&self, transfer: &TransferRequest) -> Result<UnsignedTx> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(UnsignedTx {
            message: format!(
                "transfer:{}:{}:{}:{}",
                transfer.vault, transfer.destination, transfer.amount, n
            )
            .into_bytes(),
            signer: transfer.authority.clone(),
        })
    }

    async fn build_proof_tx(&self, submission: &ProofSubmission, payer: &str) -> Result<UnsignedTx> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        self.proofs.lock().push(submission.clone());
        Ok(UnsignedTx {
            message: format!("proof:{}", n).into_bytes(),
            signer: payer.to_string(),
        })
    }

    fn assemble(&self, unsigned: &UnsignedTx, signature: &[u8]) -> Result<SignedTx> {
        let signer = Pubkey::from_str(&unsigned.signer).map_err(|e| MixerError::Chain(e.to_string()))?;
        let bytes: [u8; 64] = signature
            .try_into()
            .map_err(|_| MixerError::Crypto("signature must be 64 bytes".into()))?;
        let signature = Signature::from(bytes);
        if !signature.verify(signer.as_ref(), &unsigned.message) {
            return Err(MixerError::Crypto(format!("bad signature for {}", signer)));
        }

        let mut raw = unsigned.message.clone();
        raw.extend_from_slice(signature.as_ref());
        let tx_ref = signature.to_string();
        self.refs.insert(raw.clone(), tx_ref.clone());
        Ok(SignedTx { raw, tx_ref })
    }

    async fn send_transaction(&self, raw: &[u8]) -> Result<String> {
        if self.hang_sends.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self
            .fail_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(MixerError::Chain("transaction rejected by node".into()));
        }

        let tx_ref = self
            .refs
            .get(raw)
            .map(|r| r.clone())
            .ok_or_else(|| MixerError::Chain("unknown transaction bytes".into()))?;
        self.sent.lock().push(raw.to_vec());
        if self.auto_confirm.load(Ordering::SeqCst) {
            self.confirm(&tx_ref);
        }
        Ok(tx_ref)
    }

    async fn get_transaction_status(&self, tx_ref: &str) -> Result<ChainTxStatus> {
        Ok(self
            .statuses
            .get(tx_ref)
            .map(|s| s.clone())
            .unwrap_or(ChainTxStatus::NotFound))
    }
}

pub fn create_body(amount: &str, targets: &[(&str, &str)]) -> CreateMixRequest {
    CreateMixRequest {
        amount: amount.to_string(),
        targets: targets
            .iter()
            .map(|(address, amount)| TargetSpec {
                address: address.to_string(),
                amount: amount.to_string(),
            })
            .collect(),
        ..Default::default()
    }
}

pub struct Harness {
    pub config: MixerConfig,
    pub store: Arc<MemoryStore>,
    pub chain: Arc<MockChain>,
    pub custodian: Arc<SealedSeedCustodian>,
    pub clock: Arc<ManualClock>,
    pub registry: Arc<PoolRegistry>,
    pub service: Arc<MixerService>,
    pub executor: Arc<MixingExecutor>,
    pub monitor: Arc<DisputeMonitor>,
}

impl Harness {
    pub fn test_config() -> MixerConfig {
        let mut config = MixerConfig::with_seed(vec![42u8; 32]);
        config.rpc_timeout = Duration::from_millis(100);
        config
    }

    pub async fn new() -> Self {
        Self::with_config(Self::test_config()).await
    }

    pub async fn with_config(config: MixerConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let chain = Arc::new(MockChain::default());
        let custodian = Arc::new(SealedSeedCustodian::new(config.tee_seed.clone()).expect("custodian"));
        let master_keys =
            Arc::new(MasterKeyBundle::derive_from_cold_seed(&[7u8; 32], 0, 256).expect("master keys"));
        let clock = Arc::new(ManualClock::new(Utc::now()));

        let mixer = Mixer::assemble(
            config.clone(),
            store.clone(),
            chain.clone(),
            custodian.clone(),
            master_keys,
            clock.clone(),
        )
        .await
        .expect("assemble");

        Self {
            config,
            store,
            chain,
            custodian,
            clock,
            registry: mixer.registry,
            service: mixer.service,
            executor: mixer.executor,
            monitor: mixer.monitor,
        }
    }

    /// Creates a request and confirms a landed deposit for it.
    pub async fn mixing_request(&self, amount: &str, targets: &[(&str, &str)]) -> MixRequest {
        let request = self
            .service
            .create_mix_request(ACCOUNT, create_body(amount, targets))
            .await
            .expect("create");
        let deposit = format!("deposit-{}", request.id);
        self.chain.confirm(&deposit);
        let request = self
            .service
            .confirm_deposit(ACCOUNT, &request.id, vec![deposit])
            .await
            .expect("deposit");
        assert_eq!(request.status, RequestStatus::Mixing);
        request
    }

    /// Ticks the executor, ten minutes apart, until the request reaches
    /// `status` or `max_ticks` run out.
    pub async fn run_until(&self, id: &str, status: RequestStatus, max_ticks: usize) -> MixRequest {
        for _ in 0..max_ticks {
            self.executor.tick().await.expect("tick");
            let request = self.store_request(id).await;
            if request.status == status {
                return request;
            }
            self.clock.advance(chrono::Duration::minutes(10));
        }
        self.store_request(id).await
    }

    async fn store_request(&self, id: &str) -> MixRequest {
        use crate::store::Store;
        self.store.get_request(id).await.expect("store").expect("request")
    }

    pub fn now(&self) -> chrono::DateTime<Utc> {
        self.clock.now()
    }
}
