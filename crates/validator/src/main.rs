//! Payment Attestation Validator
//!
//! Main entry point for a validator node. Wires the signer, coordinator,
//! peer network, attestation batch engine and HTTP gateway together and
//! runs them until Ctrl+C.

use anyhow::Result;
use attest_consensus::{Coordinator, Ed25519Signer, Signer, ValidatorService};
use attest_network::PeerNetwork;
use batch_engine::{BatchEngine, BatchProcessor};
use chain_bridge::{AttestationCommitter, CompletedAttestation, LocalStakeRegistry};
use clap::Parser;
use gateway::{GatewayContext, GatewayServer};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

use config::NodeConfig;

/// Payment attestation validator node
#[derive(Parser, Debug)]
#[command(name = "attest-node")]
#[command(about = "Threshold-signing validator for cross-chain payment attestations", long_about = None)]
struct Args {
    /// JSON config file; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Gateway HTTP bind address
    #[arg(long)]
    http_addr: Option<String>,

    /// Peer network bind address
    #[arg(long)]
    p2p_addr: Option<String>,

    /// Bootstrap peer address (repeatable)
    #[arg(long = "bootstrap")]
    bootstrap: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Passphrase for a deterministic signing key
    #[arg(long)]
    key_seed: Option<String>,

    /// Quorum multiplier for high-value payments
    #[arg(long)]
    high_value_multiplier: Option<u32>,

    /// Seconds from admission until a request expires
    #[arg(long)]
    validation_window_secs: Option<u64>,
}

impl Args {
    fn node_config(&self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::load(path)?,
            None => NodeConfig::default(),
        };

        if let Some(addr) = &self.http_addr {
            config.http_addr = addr.clone();
        }
        if let Some(addr) = &self.p2p_addr {
            config.p2p_addr = addr.clone();
        }
        if !self.bootstrap.is_empty() {
            config.bootstrap_peers = self.bootstrap.clone();
        }
        if let Some(seed) = &self.key_seed {
            config.key_seed = Some(seed.clone());
        }
        if let Some(multiplier) = self.high_value_multiplier {
            config.high_value_multiplier = multiplier;
        }
        if let Some(secs) = self.validation_window_secs {
            config.validation_window_secs = secs;
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = args.node_config()?;
    run(config).await
}

async fn run(config: NodeConfig) -> Result<()> {
    let signer: Arc<dyn Signer> = match &config.key_seed {
        Some(seed) => Arc::new(Ed25519Signer::from_passphrase(seed)),
        None => Arc::new(Ed25519Signer::generate()),
    };
    let node_id = signer.signer_id().to_string();

    tracing::info!("Starting payment attestation validator");
    tracing::info!("  Node ID: {}", node_id);
    tracing::info!("  Gateway: {}", config.http_addr);
    tracing::info!("  Peer network: {}", config.p2p_addr);
    tracing::info!("  Bootstrap peers: {:?}", config.bootstrap_peers);
    tracing::info!("  Known payments: {}", config.known_payments.len());
    tracing::info!(
        "  Quorum: {} (x{} for high value), window {}s",
        config.default_quorum,
        config.high_value_multiplier,
        config.validation_window_secs
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Attestation commits run through the batch engine
    let mut committer = AttestationCommitter::new(&config.chain_rpc_url);
    if let Some(contract) = &config.attestation_contract {
        committer = committer.with_contract(contract);
    }
    let processor: Arc<dyn BatchProcessor<CompletedAttestation>> = Arc::new(committer);
    let attestations = Arc::new(BatchEngine::new(config.batch_config(), Some(processor)));
    let batch_worker = attestations.start(shutdown_rx.clone())?;

    let coordinator = Arc::new(Coordinator::new(config.coordinator_config()));
    let sweeper = tokio::spawn(coordinator.clone().run_sweeper(shutdown_rx.clone()));

    let service = Arc::new(
        ValidatorService::new(
            coordinator,
            signer,
            Arc::new(config.payment_ledger()),
            config.high_value_threshold,
        )
        .with_attestation_engine(attestations.clone()),
    );

    // Failing to bind either listener aborts startup
    let network = Arc::new(PeerNetwork::new(
        config.network_config(),
        node_id.clone(),
        service.clone(),
    ));
    network.start().await?;

    let gateway_config = config.gateway_config();
    let listener = tokio::net::TcpListener::bind(&gateway_config.http_addr).await?;
    let gateway = GatewayServer::new(Arc::new(GatewayContext {
        service,
        network: network.clone(),
        registry: Arc::new(LocalStakeRegistry::new(config.min_stake)),
        node_id,
    }));
    let http_server = tokio::spawn(gateway.serve(listener, shutdown_rx));

    tracing::info!("Validator running. Press Ctrl+C to stop.");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down...");
    shutdown_tx.send_replace(true);
    attestations.stop();
    network.shutdown();

    match http_server.await {
        Ok(Err(e)) => tracing::error!("Gateway error: {}", e),
        Err(e) => tracing::error!("Gateway task failed: {}", e),
        Ok(Ok(())) => {}
    }
    if let Err(e) = batch_worker.await {
        tracing::error!("Batch worker failed: {}", e);
    }
    if let Err(e) = sweeper.await {
        tracing::error!("Sweeper failed: {}", e);
    }

    let stats = attestations.stats();
    tracing::info!(
        "Validator stopped: {} attestation batches, {} attestations processed",
        stats.batches_flushed,
        stats.items_processed
    );

    Ok(())
}
