//! JSON-over-HTTP transport used by mixer clients. When a SOCKS5 address is
//! configured every request is routed through it, so the service never learns
//! the caller's network origin.
//!
//! ```rust,no_run
//! use mixer_network::{Config, HttpClient};
//!
//! #[tokio::main]
//! async fn main() -> mixer_network::Result<()> {
//!     let client = HttpClient::new(Config::tor().with_header("x-account-id", "acct-1"))?;
//!     if !client.verify_tor_connection().await? {
//!         eprintln!("not routed through Tor");
//!     }
//!
//!     let stats: serde_json::Value = client.get_json("http://mixer.onion/stats").await?;
//!     println!("{}", stats);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod http_client;

pub use config::{Config, DEFAULT_TOR_SOCKS_ADDR};
pub use error::{NetworkError, Result};
pub use http_client::HttpClient;
