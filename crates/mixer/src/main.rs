use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mixer::{server, Mixer, MixerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mixer=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting mixer");

    dotenvy::dotenv().ok();
    let config = MixerConfig::from_env()?;

    info!("RPC endpoint: {}", config.rpc_url);
    info!("Service id: {} (fee {} bps)", config.service_id, config.fee_bps);
    info!("Listening on: {}:{}", config.host, config.port);

    let mixer = Mixer::new(config).await?;
    let token = CancellationToken::new();
    let workers = mixer.spawn_workers(&token);

    let shutdown = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Shutdown requested");
                shutdown.cancel();
            }
            Err(e) => warn!("Cannot listen for shutdown signal: {}", e),
        }
    });

    let result = server::run(mixer.state(), token.clone()).await;
    token.cancel();
    for worker in workers {
        let _ = worker.await;
    }
    info!("Mixer stopped");
    result
}
