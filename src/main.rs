//! Binary entrypoint: wires C1-C8 into a running strategy instance.
//! Mission: load config + credentials, build one adapter per scan venue,
//! and drive the orchestrator loop until SIGINT/SIGTERM.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dotenv::dotenv;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use funding_arb_core::config::{AccountCredentials, StrategyConfig};
use funding_arb_core::db::Db;
use funding_arb_core::executor::TwoLegExecutor;
use funding_arb_core::funding::FundingCollector;
use funding_arb_core::models::VenueId;
use funding_arb_core::orchestrator::{CancellationToken, Orchestrator};
use funding_arb_core::position::LifecycleManager;
use funding_arb_core::venues::{
    aster::AsterAdapter, edgex::EdgexAdapter, grvt::GrvtAdapter, lighter::LighterAdapter,
    paradex::ParadexAdapter, VenueAdapter,
};

#[derive(Debug, Parser)]
#[command(name = "funding-arb", about = "Multi-exchange perpetual funding-rate arbitrage strategy core")]
struct Cli {
    /// Path to the strategy's TOML config document.
    #[arg(long, env = "FUNDING_ARB_CONFIG", default_value = "config.toml")]
    config: std::path::PathBuf,

    /// Path to the SQLite database file (created if absent).
    #[arg(long, env = "FUNDING_ARB_DB", default_value = "funding_arb.db")]
    db_path: std::path::PathBuf,

    /// Overrides `dry_run` in the config document without editing the file.
    #[arg(long)]
    dry_run: bool,
}

fn build_adapter(venue: &VenueId, credentials: &AccountCredentials) -> anyhow::Result<Arc<dyn VenueAdapter>> {
    let adapter: Arc<dyn VenueAdapter> = match venue.as_str() {
        "aster" => {
            let aster = AsterAdapter::new(
                credentials.api_key.clone(),
                credentials.api_secret.clone(),
                Some(credentials.account_id.clone()),
            );
            aster.spawn_order_stream();
            Arc::new(aster)
        }
        "edgex" => Arc::new(EdgexAdapter::new()),
        "grvt" => Arc::new(GrvtAdapter::new()),
        "lighter" => Arc::new(LighterAdapter::new()),
        "paradex" => Arc::new(ParadexAdapter::new()),
        other => anyhow::bail!("no adapter implementation registered for venue '{other}'"),
    };
    Ok(adapter)
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "funding_arb_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv();
    init_tracing();
    let cli = Cli::parse();

    let mut config = StrategyConfig::from_file(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;
    if cli.dry_run {
        config.dry_run = true;
    }
    info!(config = %cli.config.display(), dry_run = config.dry_run, "config loaded");

    let pool_size = config.max_concurrent_position_evaluations + 4;
    let db = Arc::new(Db::open(&cli.db_path, pool_size).with_context(|| format!("opening database at {}", cli.db_path.display()))?);

    let mut adapters: HashMap<VenueId, Arc<dyn VenueAdapter>> = HashMap::new();
    for venue in &config.scan_venues {
        let credentials = AccountCredentials::from_env(venue);
        let adapter = build_adapter(venue, &credentials)
            .with_context(|| format!("building adapter for venue '{venue}'"))?;
        adapters.insert(venue.clone(), adapter);
    }
    let account_id = std::env::var("FUNDING_ARB_ACCOUNT_ID").unwrap_or_else(|_| "default".to_string());

    let collector = Arc::new(FundingCollector::new(adapters.values().cloned().collect(), db.clone()));
    let executor = Arc::new(TwoLegExecutor::new(adapters.clone(), db.clone()));
    let lifecycle = Arc::new(LifecycleManager::new(adapters.clone(), db.clone(), config.risk_config()));
    let orchestrator = Orchestrator::new(collector, executor, lifecycle, db.clone(), config, account_id);

    let cancel = CancellationToken::new();
    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install ctrl-c handler");
            return;
        }
        info!("shutdown signal received; draining in-flight ticks");
        shutdown_cancel.cancel();
    });

    orchestrator.run(cancel).await;
    info!("orchestrator loop exited cleanly");
    Ok(())
}
