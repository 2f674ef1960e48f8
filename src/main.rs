use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use solpay::hooks::OutboxHooks;
use solpay::{initialize_store, Config, PaymentCore};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,solpay=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Standalone settlement worker. Runs the deposit scan and recovery loops
/// against the shared database; callback side effects land in the outbox
/// tables for the bot process to drain.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    dotenv::dotenv().ok();

    info!("🚀 Starting payment settlement worker");

    let config = Config::from_env()?;
    let store = initialize_store(&config).await?;
    let hooks = Arc::new(OutboxHooks::new(store.clone()));

    let core = PaymentCore::new(config, store, hooks)?;
    let _handles = core.start();

    info!("✓ Worker running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    Ok(())
}
