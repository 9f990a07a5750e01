use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use alloy::providers::{Provider, ProviderBuilder};
use clap::Parser;
use eyre::{eyre, WrapErr};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chainflood_core::config::Config;
use chainflood_core::dispatcher::Dispatcher;
use chainflood_core::keystore::DiskKeystore;
use chainflood_core::provider::{ChainClient, RpcClient};

/// Transaction load generator for EVM chains. Sustains a target aggregate
/// rate against one or more RPC endpoints, funding and cycling through
/// keystore accounts as it goes.
#[derive(Parser, Debug)]
#[command(name = "chainflood", version)]
struct Cli {
    /// Expected chain id. Endpoints reporting a different id are dropped.
    #[arg(long = "chain-id", default_value_t = 1234)]
    chain_id: u64,

    /// Comma-separated RPC endpoint URLs.
    #[arg(long, default_value = "http://localhost:8545", value_delimiter = ',')]
    urls: Vec<String>,

    /// Aggregate target transactions per second.
    #[arg(long, default_value_t = 1)]
    tps: u64,

    /// Concurrent sender workers. Defaults to the tps target.
    #[arg(long, default_value_t = 0)]
    senders: u64,

    /// How often each sender rotates to a fresh account (each cycle
    /// actually lasts between 1x and 2x this value).
    #[arg(long, value_parser = humantime::parse_duration, default_value = "5m")]
    cycle: Duration,

    /// Total runtime. Omit for an unlimited run.
    #[arg(long, value_parser = humantime::parse_duration)]
    duration: Option<Duration>,

    /// Passphrase for keystore accounts.
    #[arg(long, default_value = "")]
    password: String,

    /// Approximate gas limit per tx, sampled in [gas, 2*gas].
    #[arg(long, default_value_t = 200_000)]
    gas: u64,

    /// Approximate value per tx, sampled in [amount, 2*amount].
    #[arg(long, default_value_t = 10)]
    amount: u64,

    /// Amplitude of injected rate variability. Pass 0s to disable.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "30s")]
    variable: Duration,

    /// Keystore directory.
    #[arg(long, default_value = "keystore")]
    keystore: PathBuf,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    info!(version = env!("CARGO_PKG_VERSION"), config = ?cli, "starting chainflood");

    let keystore = Arc::new(
        DiskKeystore::open(&cli.keystore)
            .wrap_err_with(|| format!("failed to open keystore at {}", cli.keystore.display()))?,
    );

    let clients = dial_endpoints(&cli.urls, cli.chain_id).await;
    if clients.is_empty() {
        return Err(eyre!("no usable endpoints among {:?}", cli.urls));
    }

    let config = Config {
        chain_id: cli.chain_id,
        tps: cli.tps,
        senders: cli.senders,
        cycle: cli.cycle,
        duration: cli.duration.filter(|d| !d.is_zero()),
        password: cli.password,
        gas: cli.gas,
        amount: cli.amount,
        variable: cli.variable,
    };
    let dispatcher = Dispatcher::new(config, clients, keystore)?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            warn!("shutdown signal received");
            cancel.cancel();
        });
    }

    let start = Instant::now();
    dispatcher.run(cancel).await?;
    info!(elapsed_secs = start.elapsed().as_secs(), "run complete");
    Ok(())
}

/// Dials every URL and keeps the endpoints that answer with the expected
/// chain id.
async fn dial_endpoints(urls: &[String], chain_id: u64) -> Vec<Arc<dyn ChainClient>> {
    let mut clients: Vec<Arc<dyn ChainClient>> = Vec::new();
    for url in urls {
        let parsed = match url.parse() {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(url, %err, "dropping unparseable endpoint url");
                continue;
            }
        };
        let provider = ProviderBuilder::new().connect_http(parsed);
        let client = RpcClient::new(url, provider.erased());
        match client.chain_id().await {
            Ok(id) if id == chain_id => {
                info!(url, "endpoint ready");
                clients.push(Arc::new(client));
            }
            Ok(id) => {
                warn!(
                    url,
                    chain_id = id,
                    expected = chain_id,
                    "dropping endpoint with mismatched chain id"
                );
            }
            Err(err) => {
                warn!(url, %err, "dropping unreachable endpoint");
            }
        }
    }
    clients
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
