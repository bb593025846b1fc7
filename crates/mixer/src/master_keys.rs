//! Offline (cold) half of each pool keypair. Production deployments only
//! ever see a bundle of public keys; the private halves stay offline and are
//! needed solely for emergency recovery.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_sdk::signer::Signer;
use tracing::info;

use crate::custodian::keypair_at;
use crate::error::{MixerError, Result};

#[async_trait]
pub trait MasterKeyProvider: Send + Sync {
    async fn master_public_key(&self, index: u32) -> Result<Pubkey>;
    async fn verify_master_signature(&self, index: u32, data: &[u8], signature: &[u8]) -> Result<bool>;
}

#[derive(Serialize, Deserialize)]
struct BundleEntry {
    index: u32,
    public_key: String,
}

#[derive(Serialize, Deserialize)]
struct BundleFile {
    keys: Vec<BundleEntry>,
}

/// Public-key-only bundle exported from the offline signer.
pub struct MasterKeyBundle {
    keys: BTreeMap<u32, Pubkey>,
}

impl MasterKeyBundle {
    pub fn from_keys(keys: BTreeMap<u32, Pubkey>) -> Self {
        Self { keys }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            MixerError::Internal(format!("Failed to read master keys from {}: {}", path.display(), e))
        })?;
        let file: BundleFile = serde_json::from_str(&data)
            .map_err(|e| MixerError::Internal(format!("Invalid master key bundle: {}", e)))?;

        let mut keys = BTreeMap::new();
        for entry in file.keys {
            let key = Pubkey::from_str(&entry.public_key).map_err(|e| {
                MixerError::Internal(format!("Invalid master key {}: {}", entry.index, e))
            })?;
            if keys.insert(entry.index, key).is_some() {
                return Err(MixerError::Internal(format!("Duplicate master key index {}", entry.index)));
            }
        }

        info!("Loaded {} master public keys from {}", keys.len(), path.display());
        Ok(Self { keys })
    }

    /// What the offline signer runs to export a bundle: public keys for
    /// `count` indices starting at `start`, derived from the cold seed.
    pub fn derive_from_cold_seed(cold_seed: &[u8], start: u32, count: u32) -> Result<Self> {
        let mut keys = BTreeMap::new();
        for index in start..start.saturating_add(count) {
            let keypair = keypair_at(cold_seed, &[44, 501, 0, 1, index])?;
            keys.insert(index, keypair.pubkey());
        }
        Ok(Self { keys })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = BundleFile {
            keys: self
                .keys
                .iter()
                .map(|(index, key)| BundleEntry {
                    index: *index,
                    public_key: key.to_string(),
                })
                .collect(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| MixerError::Internal(format!("Serialize failed: {}", e)))?;
        std::fs::write(path, json).map_err(|e| MixerError::Internal(e.to_string()))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[async_trait]
impl MasterKeyProvider for MasterKeyBundle {
    async fn master_public_key(&self, index: u32) -> Result<Pubkey> {
        self.keys
            .get(&index)
            .copied()
            .ok_or_else(|| MixerError::NotFound(format!("master key for pool index {}", index)))
    }

    async fn verify_master_signature(&self, index: u32, data: &[u8], signature: &[u8]) -> Result<bool> {
        let key = self.master_public_key(index).await?;
        let Ok(bytes) = <[u8; 64]>::try_from(signature) else {
            return Ok(false);
        };
        Ok(Signature::from(bytes).verify(key.as_ref(), data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bundle_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master_keys.json");

        let bundle = MasterKeyBundle::derive_from_cold_seed(&[9u8; 32], 0, 4).unwrap();
        bundle.save(&path).unwrap();
        let loaded = MasterKeyBundle::load(&path).unwrap();

        assert_eq!(loaded.len(), 4);
        assert_eq!(
            loaded.master_public_key(2).await.unwrap(),
            bundle.master_public_key(2).await.unwrap()
        );
        assert!(loaded.master_public_key(4).await.is_err());
    }

    #[tokio::test]
    async fn test_verify_master_signature() {
        let cold_seed = [5u8; 32];
        let bundle = MasterKeyBundle::derive_from_cold_seed(&cold_seed, 0, 2).unwrap();
        let cold_key = keypair_at(&cold_seed, &[44, 501, 0, 1, 1]).unwrap();

        let sig = cold_key.sign_message(b"recover pool 1");
        assert!(bundle.verify_master_signature(1, b"recover pool 1", sig.as_ref()).await.unwrap());
        assert!(!bundle.verify_master_signature(0, b"recover pool 1", sig.as_ref()).await.unwrap());
        assert!(!bundle.verify_master_signature(1, b"recover pool 1", &[0u8; 10]).await.unwrap());
    }
}
