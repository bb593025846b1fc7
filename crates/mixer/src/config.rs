use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use solana_sdk::pubkey::Pubkey;

use crate::error::{MixerError, Result};

pub const MIN_SPLIT_COUNT: u32 = 1;
pub const MAX_SPLIT_COUNT: u32 = 5;
/// Split count chosen automatically above the auto-split threshold.
pub const AUTO_SPLIT_COUNT: u32 = 3;

/// Grace between the end of the mixing window and the withdrawable deadline.
pub const GRACE_PERIOD_DAYS: i64 = 7;
pub const POOL_RETIRE_DAYS: i64 = 30;
pub const POOL_ROTATION_TX_THRESHOLD: u64 = 1000;
/// Deliveries land this long before the mixing window closes.
pub const DELIVERY_LEAD_MINUTES: i64 = 5;
pub const MIN_MIXING_POOLS: usize = 2;
pub const DISPUTE_RESOLUTION_DAYS: i64 = 7;

pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 1000;

pub const DEFAULT_TOKEN: &str = "So11111111111111111111111111111111111111112";

#[derive(Clone)]
pub struct MixerConfig {
    pub rpc_url: String,
    pub custody_program_id: Pubkey,
    pub dispute_program_id: Pubkey,
    pub service_id: String,
    /// Sealed root seed of the key custodian (16..=64 bytes)
    pub tee_seed: Arc<Vec<u8>>,
    pub master_keys_path: String,
    /// Snapshot file for the request store; in-memory only when unset
    pub store_path: Option<String>,
    pub host: String,
    pub port: u16,
    pub fee_bps: u16,
    pub auto_split_threshold: u64,
    pub bond_amount: u64,
    pub max_outstanding: u64,
    pub min_active_pools: usize,
    pub executor_poll: Duration,
    pub monitor_poll: Duration,
    pub rotation_poll: Duration,
    pub max_tx_attempts: u32,
    pub retry_base: Duration,
    pub required_confirmations: u64,
    pub rpc_timeout: Duration,
    pub early_warning: chrono::Duration,
    pub decoys_enabled: bool,
    /// Decoys are scheduled at random intervals within these bounds
    pub decoy_interval_min: Duration,
    pub decoy_interval_max: Duration,
    /// Largest decoy transfer, in minor units
    pub decoy_max_amount: u64,
    /// Accounts allowed to create requests; empty admits any non-empty id
    pub allowed_accounts: Vec<String>,
}

impl MixerConfig {
    /// Defaults for everything except the custodian seed.
    pub fn with_seed(tee_seed: Vec<u8>) -> Self {
        Self {
            rpc_url: "https://api.devnet.solana.com".to_string(),
            custody_program_id: Pubkey::new_from_array([7u8; 32]),
            dispute_program_id: Pubkey::new_from_array([8u8; 32]),
            service_id: "mixer-main".to_string(),
            tee_seed: Arc::new(tee_seed),
            master_keys_path: shellexpand::tilde("~/.config/mixer/master_keys.json").to_string(),
            store_path: None,
            host: "0.0.0.0".to_string(),
            port: 8080,
            fee_bps: 50, // 0.5% default
            auto_split_threshold: 10_000,
            bond_amount: 100_000,
            max_outstanding: 100_000,
            min_active_pools: 3,
            executor_poll: Duration::from_secs(10),
            monitor_poll: Duration::from_secs(60),
            rotation_poll: Duration::from_secs(3600),
            max_tx_attempts: 3,
            retry_base: Duration::from_secs(30),
            required_confirmations: 1,
            rpc_timeout: Duration::from_secs(15),
            early_warning: chrono::Duration::hours(24),
            decoys_enabled: true,
            decoy_interval_min: Duration::from_secs(5 * 60),
            decoy_interval_max: Duration::from_secs(30 * 60),
            decoy_max_amount: 100,
            allowed_accounts: Vec::new(),
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let tee_seed = load_seed()?;
        let mut config = Self::with_seed(tee_seed);

        if let Ok(url) = std::env::var("RPC_URL") {
            config.rpc_url = url;
        }
        if let Ok(id) = std::env::var("CUSTODY_PROGRAM_ID") {
            config.custody_program_id = Pubkey::from_str(&id)
                .map_err(|e| anyhow::anyhow!("Invalid CUSTODY_PROGRAM_ID: {}", e))?;
        }
        if let Ok(id) = std::env::var("DISPUTE_PROGRAM_ID") {
            config.dispute_program_id = Pubkey::from_str(&id)
                .map_err(|e| anyhow::anyhow!("Invalid DISPUTE_PROGRAM_ID: {}", e))?;
        }
        if let Ok(id) = std::env::var("SERVICE_ID") {
            config.service_id = id;
        }
        if let Ok(path) = std::env::var("MASTER_KEYS_PATH") {
            config.master_keys_path = shellexpand::tilde(&path).to_string();
        }
        config.store_path = std::env::var("STORE_PATH")
            .ok()
            .map(|p| shellexpand::tilde(&p).to_string());
        if let Ok(host) = std::env::var("HOST") {
            config.host = host;
        }
        if let Ok(accounts) = std::env::var("ALLOWED_ACCOUNTS") {
            config.allowed_accounts = accounts
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        config.port = env_parse("PORT", config.port);
        config.fee_bps = env_parse("FEE_BPS", config.fee_bps);
        config.auto_split_threshold = env_parse("AUTO_SPLIT_THRESHOLD", config.auto_split_threshold);
        config.bond_amount = env_parse("BOND_AMOUNT", config.bond_amount);
        config.max_outstanding = env_parse("MAX_OUTSTANDING", config.max_outstanding);
        config.min_active_pools = env_parse("MIN_ACTIVE_POOLS", config.min_active_pools);
        config.max_tx_attempts = env_parse("MAX_TX_ATTEMPTS", config.max_tx_attempts);
        config.required_confirmations = env_parse("REQUIRED_CONFIRMATIONS", config.required_confirmations);
        config.executor_poll = Duration::from_secs(env_parse("EXECUTOR_POLL_SECS", 10));
        config.monitor_poll = Duration::from_secs(env_parse("MONITOR_POLL_SECS", 60));
        config.rotation_poll = Duration::from_secs(env_parse("ROTATION_POLL_SECS", 3600));
        config.retry_base = Duration::from_secs(env_parse("RETRY_BASE_SECS", 30));
        config.rpc_timeout = Duration::from_secs(env_parse("RPC_TIMEOUT_SECS", 15));
        config.early_warning = chrono::Duration::hours(env_parse("EARLY_WARNING_HOURS", 24));
        config.decoys_enabled = env_parse("DECOYS_ENABLED", config.decoys_enabled);
        config.decoy_interval_min = Duration::from_secs(env_parse("DECOY_MIN_SECS", 5 * 60));
        config.decoy_interval_max = Duration::from_secs(env_parse("DECOY_MAX_SECS", 30 * 60));
        config.decoy_max_amount = env_parse("DECOY_MAX_AMOUNT", config.decoy_max_amount);

        if config.fee_bps >= 10_000 {
            anyhow::bail!("FEE_BPS must be below 10000, got {}", config.fee_bps);
        }
        if config.decoy_interval_min > config.decoy_interval_max {
            anyhow::bail!(
                "DECOY_MIN_SECS ({:?}) exceeds DECOY_MAX_SECS ({:?})",
                config.decoy_interval_min,
                config.decoy_interval_max
            );
        }

        Ok(config)
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Reads the custodian root seed from `TEE_SEED_HEX` or the hex file at
/// `TEE_SEED_PATH`.
fn load_seed() -> anyhow::Result<Vec<u8>> {
    let hex_seed = match std::env::var("TEE_SEED_HEX") {
        Ok(s) => s,
        Err(_) => {
            let path = std::env::var("TEE_SEED_PATH")
                .unwrap_or_else(|_| shellexpand::tilde("~/.config/mixer/tee_seed").to_string());
            std::fs::read_to_string(&path)
                .map_err(|e| anyhow::anyhow!("Failed to read TEE seed from {}: {}", path, e))?
        }
    };

    let seed = hex::decode(hex_seed.trim())
        .map_err(|e| anyhow::anyhow!("TEE seed is not valid hex: {}", e))?;
    if !(16..=64).contains(&seed.len()) {
        anyhow::bail!("TEE seed must be 16 to 64 bytes, got {}", seed.len());
    }
    Ok(seed)
}

/// `amount * fee_bps / 10000`, rounded down.
pub fn calculate_fee(amount: u64, fee_bps: u16) -> u64 {
    (amount as u128 * fee_bps as u128 / 10_000) as u64
}

/// `None` and `Some(0)` pick automatically: 1 for small amounts, 3 above
/// the threshold.
pub fn resolve_split_count(requested: Option<u32>, amount: u64, auto_threshold: u64) -> Result<u32> {
    match requested {
        None | Some(0) => Ok(if amount > auto_threshold {
            AUTO_SPLIT_COUNT
        } else {
            MIN_SPLIT_COUNT
        }),
        Some(n) if (MIN_SPLIT_COUNT..=MAX_SPLIT_COUNT).contains(&n) => Ok(n),
        Some(n) => Err(MixerError::InvalidSplitCount(n)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fee_calculation() {
        // 0.5% fee
        assert_eq!(calculate_fee(1000, 50), 5);
        assert_eq!(calculate_fee(1005, 50), 5);
        assert_eq!(calculate_fee(199, 50), 0);
        assert_eq!(calculate_fee(1_000_000_000, 50), 5_000_000);
        assert_eq!(calculate_fee(u64::MAX, 10_000), u64::MAX);
    }

    #[test]
    fn test_split_count_resolution() {
        assert_eq!(resolve_split_count(None, 500, 10_000).unwrap(), 1);
        assert_eq!(resolve_split_count(Some(0), 50_000, 10_000).unwrap(), 3);
        assert_eq!(resolve_split_count(Some(5), 500, 10_000).unwrap(), 5);
        assert!(matches!(
            resolve_split_count(Some(6), 500, 10_000),
            Err(MixerError::InvalidSplitCount(6))
        ));
    }

    #[test]
    fn test_defaults() {
        let config = MixerConfig::with_seed(vec![1u8; 32]);
        assert_eq!(config.fee_bps, 50);
        assert_eq!(config.max_tx_attempts, 3);
        assert!(config.allowed_accounts.is_empty());
    }
}
