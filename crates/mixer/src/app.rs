use std::sync::Arc;

use solana_client::nonblocking::rpc_client::RpcClient;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::accounts::AllowListChecker;
use crate::chain::{ChainClient, SolanaChainClient};
use crate::clock::{Clock, SystemClock};
use crate::config::MixerConfig;
use crate::custodian::{KeyCustodian, SealedSeedCustodian};
use crate::executor::MixingExecutor;
use crate::master_keys::{MasterKeyBundle, MasterKeyProvider};
use crate::monitor::DisputeMonitor;
use crate::registry::PoolRegistry;
use crate::server::MixerState;
use crate::service::MixerService;
use crate::store::{MemoryStore, Store};

/// Every component of a running mixer, wired together.
pub struct Mixer {
    pub config: MixerConfig,
    pub store: Arc<dyn Store>,
    pub registry: Arc<PoolRegistry>,
    pub service: Arc<MixerService>,
    pub executor: Arc<MixingExecutor>,
    pub monitor: Arc<DisputeMonitor>,
}

impl Mixer {
    pub async fn new(config: MixerConfig) -> anyhow::Result<Self> {
        let rpc_client = Arc::new(RpcClient::new_with_timeout(
            config.rpc_url.clone(),
            config.rpc_timeout,
        ));
        let chain = Arc::new(SolanaChainClient::new(
            rpc_client,
            config.custody_program_id,
            config.dispute_program_id,
        ));

        let store: Arc<dyn Store> = match &config.store_path {
            Some(path) => Arc::new(MemoryStore::open(shellexpand::tilde(path).as_ref())?),
            None => {
                warn!("STORE_PATH not set, state will not survive a restart");
                Arc::new(MemoryStore::new())
            }
        };

        let custodian = Arc::new(SealedSeedCustodian::new(config.tee_seed.clone())?);
        let master_keys = Arc::new(MasterKeyBundle::load(&config.master_keys_path)?);

        Self::assemble(config, store, chain, custodian, master_keys, Arc::new(SystemClock)).await
    }

    /// Wires the components around the given backends, registers the
    /// service and provisions the minimum pool set.
    pub async fn assemble(
        config: MixerConfig,
        store: Arc<dyn Store>,
        chain: Arc<dyn ChainClient>,
        custodian: Arc<dyn KeyCustodian>,
        master_keys: Arc<dyn MasterKeyProvider>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let registry = Arc::new(PoolRegistry::new(
            config.clone(),
            store.clone(),
            chain.clone(),
            custodian.clone(),
            master_keys,
            clock.clone(),
        ));
        let service = Arc::new(MixerService::new(
            config.clone(),
            store.clone(),
            chain.clone(),
            custodian.clone(),
            Arc::new(AllowListChecker::new(config.allowed_accounts.clone())),
            registry.clone(),
            clock.clone(),
        ));
        let executor = Arc::new(MixingExecutor::new(
            config.clone(),
            store.clone(),
            chain,
            custodian,
            service.clone(),
            clock.clone(),
        ));
        let monitor = Arc::new(DisputeMonitor::new(
            store.clone(),
            service.clone(),
            clock,
            config.early_warning,
            config.monitor_poll,
        ));

        registry.init().await?;
        service.register_service().await?;
        let created = registry.ensure_minimum_pools(config.min_active_pools).await?;
        if created > 0 {
            info!("Provisioned {} pool account(s)", created);
        }

        Ok(Self {
            config,
            store,
            registry,
            service,
            executor,
            monitor,
        })
    }

    pub fn state(&self) -> Arc<MixerState> {
        Arc::new(MixerState {
            config: self.config.clone(),
            service: self.service.clone(),
        })
    }

    /// Starts the executor, the deadline monitor, pool rotation and, when
    /// enabled, the decoy scheduler. They stop when `token` is cancelled.
    pub fn spawn_workers(&self, token: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut workers = vec![
            tokio::spawn(self.executor.clone().run(token.clone())),
            tokio::spawn(self.monitor.clone().run(token.clone())),
            tokio::spawn(self.registry.clone().run_rotation(
                token.clone(),
                self.config.rotation_poll,
                self.config.min_active_pools,
            )),
        ];
        if self.config.decoys_enabled {
            workers.push(tokio::spawn(self.registry.clone().run_decoys(token.clone())));
        }
        workers
    }
}
