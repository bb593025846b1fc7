//! Trusted key custodian. Holds the sealed root seed and everything derived
//! from it: per-pool signing keys, the service attestation key and the
//! X25519 key clients seal their targets to. Key material never leaves
//! this module; callers get public keys and signatures.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};
use solana_sdk::signature::Keypair;
use solana_sdk::signer::keypair::keypair_from_seed;
use solana_sdk::signer::Signer;
use tracing::{debug, info};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use mixer_sdk::api::TargetSpec;
use mixer_sdk::crypto::{open_targets, EncryptedTargets};
use mixer_sdk::merkle::{completion_digest, leaf_hash, MerkleTree};

use crate::error::{MixerError, Result};
use crate::model::{CompletionProof, MixRequest};

type HmacSha512 = Hmac<Sha512>;

const HARDENED: u32 = 0x8000_0000;
const PURPOSE: u32 = 44;
const COIN_TYPE: u32 = 501;
const POOL_ACCOUNT: u32 = 0;
const SERVICE_ACCOUNT: u32 = 1;
const ENCRYPTION_ACCOUNT: u32 = 2;

/// Path of the custodian key for a pool: m/44'/501'/0'/0'/index'
pub fn pool_key_path(index: u32) -> [u32; 5] {
    [PURPOSE, COIN_TYPE, POOL_ACCOUNT, 0, index]
}

/// SLIP-10 ed25519 derivation. Every level is hardened.
pub fn derive_ed25519_secret(seed: &[u8], path: &[u32]) -> Result<[u8; 32]> {
    let (mut key, mut chain_code) = hmac_split(b"ed25519 seed", seed)?;
    for &segment in path {
        if segment >= HARDENED {
            return Err(MixerError::Custodian(format!("path segment {} out of range", segment)));
        }
        let mut data = Vec::with_capacity(37);
        data.push(0u8);
        data.extend_from_slice(&key);
        data.extend_from_slice(&(segment | HARDENED).to_be_bytes());
        (key, chain_code) = hmac_split(&chain_code, &data)?;
    }
    Ok(key)
}

fn hmac_split(key: &[u8], data: &[u8]) -> Result<([u8; 32], [u8; 32])> {
    let mut mac = HmacSha512::new_from_slice(key)
        .map_err(|e| MixerError::Crypto(format!("HMAC init failed: {}", e)))?;
    mac.update(data);
    let out = mac.finalize().into_bytes();

    let mut left = [0u8; 32];
    let mut right = [0u8; 32];
    left.copy_from_slice(&out[..32]);
    right.copy_from_slice(&out[32..]);
    Ok((left, right))
}

pub fn keypair_at(seed: &[u8], path: &[u32]) -> Result<Keypair> {
    let secret = derive_ed25519_secret(seed, path)?;
    keypair_from_seed(&secret).map_err(|e| MixerError::Crypto(format!("keypair from seed: {}", e)))
}

#[async_trait]
pub trait KeyCustodian: Send + Sync {
    /// Service attestation key (base58).
    fn public_key(&self) -> String;
    fn encryption_public_key(&self) -> [u8; 32];
    /// Hands out the next pool index. Never repeats within a process.
    fn next_pool_index(&self) -> u32;
    /// Raises the index counter to at least `next`, e.g. after a restart.
    fn advance_pool_index(&self, next: u32);
    /// Custodian half of the pool keypair at `index` (base58). The
    /// counterparty key must be a different key.
    async fn derive_pool_keys(&self, index: u32, counterparty_pubkey: &str) -> Result<String>;
    async fn sign_transaction(&self, index: u32, message: &[u8]) -> Result<Vec<u8>>;
    /// Opaque commitment binding the request's amounts, targets and deadline.
    async fn generate_request_commitment(&self, request: &MixRequest) -> Result<[u8; 32]>;
    async fn sign_attestation(&self, data: &[u8]) -> Result<Vec<u8>>;
    async fn generate_completion_proof(
        &self,
        request: &MixRequest,
        service_id: &str,
        timestamp: i64,
    ) -> Result<CompletionProof>;
    fn decrypt_targets(&self, sealed: &EncryptedTargets) -> Result<Vec<TargetSpec>>;
}

/// Custodian backed by a root seed sealed into the process at startup.
pub struct SealedSeedCustodian {
    seed: Arc<Vec<u8>>,
    service_key: Keypair,
    encryption_secret: StaticSecret,
    pool_keys: DashMap<u32, Arc<Keypair>>,
    next_index: AtomicU32,
}

impl SealedSeedCustodian {
    pub fn new(seed: Arc<Vec<u8>>) -> Result<Self> {
        if !(16..=64).contains(&seed.len()) {
            return Err(MixerError::Custodian(format!(
                "root seed must be 16 to 64 bytes, got {}",
                seed.len()
            )));
        }

        let service_key = keypair_at(&seed, &[PURPOSE, COIN_TYPE, SERVICE_ACCOUNT, 0])?;
        let encryption_secret = StaticSecret::from(derive_ed25519_secret(
            &seed,
            &[PURPOSE, COIN_TYPE, ENCRYPTION_ACCOUNT, 0],
        )?);
        info!("Custodian service key: {}", service_key.pubkey());

        Ok(Self {
            seed,
            service_key,
            encryption_secret,
            pool_keys: DashMap::new(),
            next_index: AtomicU32::new(0),
        })
    }

    fn pool_key(&self, index: u32) -> Result<Arc<Keypair>> {
        if let Some(key) = self.pool_keys.get(&index) {
            return Ok(key.clone());
        }
        let key = Arc::new(keypair_at(&self.seed, &pool_key_path(index))?);
        self.pool_keys.insert(index, key.clone());
        debug!("Derived pool key {} -> {}", index, key.pubkey());
        Ok(key)
    }
}

pub fn request_commitment(request: &MixRequest) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"mixer_request_commitment_v1:");
    hasher.update(request.id.as_bytes());
    hasher.update([0u8]);
    hasher.update(request.account_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(request.token.as_bytes());
    hasher.update(request.total_amount.to_le_bytes());
    hasher.update(request.service_fee.to_le_bytes());
    hasher.update(request.deadline.timestamp().to_le_bytes());
    hasher.update((request.targets.len() as u32).to_le_bytes());
    for target in &request.targets {
        hasher.update(leaf_hash(&target.address, target.amount, &target.nonce, &request.id));
    }
    hasher.finalize().into()
}

#[async_trait]
impl KeyCustodian for SealedSeedCustodian {
    fn public_key(&self) -> String {
        self.service_key.pubkey().to_string()
    }

    fn encryption_public_key(&self) -> [u8; 32] {
        X25519PublicKey::from(&self.encryption_secret).to_bytes()
    }

    fn next_pool_index(&self) -> u32 {
        self.next_index.fetch_add(1, Ordering::SeqCst)
    }

    fn advance_pool_index(&self, next: u32) {
        self.next_index.fetch_max(next, Ordering::SeqCst);
    }

    async fn derive_pool_keys(&self, index: u32, counterparty_pubkey: &str) -> Result<String> {
        let key = self.pool_key(index)?.pubkey().to_string();
        if key == counterparty_pubkey {
            return Err(MixerError::Custodian(format!(
                "counterparty key for pool {} equals custodian key",
                index
            )));
        }
        Ok(key)
    }

    async fn sign_transaction(&self, index: u32, message: &[u8]) -> Result<Vec<u8>> {
        let key = self.pool_key(index)?;
        Ok(key.sign_message(message).as_ref().to_vec())
    }

    async fn generate_request_commitment(&self, request: &MixRequest) -> Result<[u8; 32]> {
        if request.targets.is_empty() {
            return Err(MixerError::Custodian("request has no targets".into()));
        }
        Ok(request_commitment(request))
    }

    async fn sign_attestation(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(self.service_key.sign_message(data).as_ref().to_vec())
    }

    async fn generate_completion_proof(
        &self,
        request: &MixRequest,
        service_id: &str,
        timestamp: i64,
    ) -> Result<CompletionProof> {
        if !request.all_delivered() {
            return Err(MixerError::TargetsNotDelivered(request.undelivered_count()));
        }

        let leaves = request
            .targets
            .iter()
            .map(|t| leaf_hash(&t.address, t.amount, &t.nonce, &request.id))
            .collect();
        let tree = MerkleTree::new(leaves).map_err(|e| MixerError::Custodian(e.to_string()))?;
        let root = tree.root();
        let digest = completion_digest(&root, &request.id, service_id, timestamp);
        let signature = self.service_key.sign_message(&digest);

        Ok(CompletionProof {
            merkle_root: hex::encode(root),
            signature: signature.to_string(),
            signer: self.public_key(),
            service_id: service_id.to_string(),
            timestamp,
            output_count: tree.len(),
            submission_tx: None,
            submitted_at: None,
        })
    }

    fn decrypt_targets(&self, sealed: &EncryptedTargets) -> Result<Vec<TargetSpec>> {
        open_targets(sealed, &self.encryption_secret)
            .map_err(|e| MixerError::InvalidRequest(format!("cannot open sealed targets: {}", e)))
    }
}
