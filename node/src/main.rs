use chain_sync::cli::NodeConfig;
use chain_sync::logging::init_tracing;
use chain_sync::p2p::PeerId;
use chain_sync::sim::{SimChain, SimPeer, SimStateSyncer};
use chain_sync::sync::{Downloader, SyncError, SyncEvent};
use eyre::{Result, WrapErr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const REMOTE_SEED: u64 = 1;
const LOCAL_FORK_SEED: u64 = 2;

#[tokio::main]
async fn main() -> Result<()> {
    let config = NodeConfig::from_args();
    init_tracing(config.verbosity, config.log_format);
    debug!(config = %serde_json::to_string(&config.sync)?, "loaded sync config");

    let remote = Arc::new(SimChain::new(config.sim_remote_blocks, REMOTE_SEED));
    let local = match config.sim_fork_at {
        Some(at) => remote.fork(at, config.sim_local_blocks, LOCAL_FORK_SEED),
        None => remote.truncated(config.sim_local_blocks),
    };
    let store = Arc::new(local.to_store(config.sim_local_blocks));
    let state = Arc::new(SimStateSyncer::new(Duration::from_millis(
        config.sim_state_delay_ms,
    )));
    info!(
        mode = %config.mode,
        local = local.height(),
        remote = remote.height(),
        peers = config.sim_peers,
        "starting simulated sync"
    );

    let downloader = Downloader::new(store, state, config.sync.clone(), |id: PeerId| {
        warn!(peer_id = %id, "disconnecting peer");
    });
    let latency = Duration::from_millis(config.sim_latency_ms);
    let mut ids = Vec::with_capacity(config.sim_peers);
    for n in 1..=config.sim_peers as u64 {
        let id = PeerId::left_padding_from(&n.to_be_bytes());
        let peer = SimPeer::new(id, remote.clone()).with_latency(latency);
        downloader
            .register_peer(id, 68, Arc::new(peer))
            .wrap_err("failed to register simulated peer")?;
        ids.push(id);
    }
    let Some(&master) = ids.first() else {
        eyre::bail!("at least one simulated peer is required");
    };

    let mut events = downloader.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SyncEvent::Started => info!("sync started"),
                SyncEvent::Done { head } => info!(number = head.number, hash = %head.hash, "sync done"),
                SyncEvent::Failed { error } => warn!(%error, "sync failed"),
            }
        }
    });

    let head = remote.head();
    let outcome = tokio::select! {
        result = downloader.synchronise(master, head.hash, remote.td(head.number), config.mode) => result,
        _ = tokio::signal::ctrl_c() => Err(SyncError::Canceled),
    };
    downloader.terminate().await;

    println!("{}", serde_json::to_string_pretty(&downloader.progress())?);
    outcome.wrap_err("synchronisation failed")?;
    info!(head = head.number, "synchronisation complete");
    Ok(())
}
