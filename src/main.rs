use anyhow::Context;
use std::sync::Arc;
use subswap::chain::WATCHONLY_WALLET;
use subswap::store::memory::MemoryPendingStore;
use subswap::store::sqlite::SqliteDurableStore;
use subswap::{
    BitcoindRpcClient, ChainWatcher, Config, Coordinator, LndRestClient, Network, SwapLimits,
    SwapStore, api, watcher,
};

/// Depth of the raw-transaction queue between the ZMQ thread and the watcher.
const RAW_TX_QUEUE: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let config = Config::from_env().context("loading configuration")?;

    let node = BitcoindRpcClient::new(&config.btc_url)?;
    let network: Network = match node.chain_name().await {
        Ok(chain) => chain.parse()?,
        Err(e) => {
            log::error!("Bitcoin Core RPC not running: {}", e);
            std::process::exit(1);
        }
    };
    log::info!("bitcoin node is on the {} chain", network);

    match node.create_watchonly_wallet().await {
        Ok(()) => log::info!("created watch-only wallet"),
        Err(e) => log::debug!("watch-only wallet not created: {}", e),
    }

    // Default wallet for key material, dedicated wallet for descriptor imports.
    let chain = Arc::new(node.with_wallet(""));
    let watchonly = Arc::new(node.with_wallet(WATCHONLY_WALLET));
    let lightning = Arc::new(LndRestClient::new(
        config.lnd_host.as_str(),
        config.lnd_macaroon.clone(),
        config.lnd_certificate.clone(),
    )?);

    let durable = SqliteDurableStore::open(&config.data_dir.join("swaps.db")).await?;
    let store = Arc::new(SwapStore::new(MemoryPendingStore::new(), durable));

    let coordinator = Arc::new(Coordinator::new(
        store.clone(),
        lightning.clone(),
        chain.clone(),
        watchonly,
        network,
        SwapLimits {
            min_amount: config.min_amount,
            max_amount: config.max_amount,
            service_feerate: config.service_feerate,
        },
    ));

    let raw_tx = watcher::subscribe_raw_tx(&config.btc_zmq_raw_tx, RAW_TX_QUEUE)?;
    let chain_watcher = ChainWatcher::new(store, lightning, chain);
    tokio::spawn(chain_watcher.run(raw_tx));

    let addr = format!("{}:{}", config.api_host, config.api_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    log::info!("api listening on {}", addr);
    axum::serve(listener, api::router(coordinator))
        .await
        .context("serving api")?;

    Ok(())
}
