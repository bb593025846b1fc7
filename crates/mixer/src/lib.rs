//! Privacy-preserving mixing service: request lifecycle, double-blind pool
//! custody, scheduled multi-hop execution and the dispute/refund safety net.

pub mod accounts;
pub mod app;
pub mod chain;
pub mod clock;
pub mod config;
pub mod custodian;
pub mod error;
pub mod executor;
pub mod master_keys;
pub mod model;
pub mod monitor;
pub mod multisig;
pub mod registry;
pub mod server;
pub mod service;
pub mod store;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use app::Mixer;
pub use config::MixerConfig;
pub use error::{MixerError, Result};
pub use service::{ContractEvent, MixerService};
