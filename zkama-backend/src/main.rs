use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use zkama_backend::{
    app_router, spawn_orphan_reaper, AppState, ReaperConfig, DB_PATH_ENV, DEFAULT_DB_PATH,
};
use zkama_chain::{AmaContractClient, ChainConfig};
use zkama_store::AmaStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let db_path = env::var(DB_PATH_ENV).unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());
    let store = AmaStore::open(&db_path).context("failed to open session cache")?;

    let chain_config = ChainConfig::from_env().context("chain configuration incomplete")?;
    let chain = Arc::new(AmaContractClient::new(&chain_config)?);

    let state = AppState::new(store, chain, ReaperConfig::from_env());
    spawn_orphan_reaper(state.clone());

    let port: u16 = env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(3000);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("zkama backend listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app_router(state).into_make_service()).await?;

    Ok(())
}
