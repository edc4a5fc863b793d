//! Node bootstrap and event loop: wires `Config`, the seven consensus-core
//! components, the `jsonrpsee` admin surface, and the sharding reporter
//! (spec §2 item 9, SPEC_FULL.md §6). Modeled on the teacher's `main.rs`
//! `tokio::select!` loop, but self-consistent end to end.

use jsonrpsee::server::Server;
use std::collections::BTreeMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use triarch::block_pool::BlockPool;
use triarch::blockchain::Blockchain;
use triarch::config::Config;
use triarch::consensus::{ConsensusAction, ConsensusEngine, NodeStatus};
use triarch::crypto::generate_keypair_from_id;
use triarch::network::{DispatchAction, LibP2pTransport, PeerDispatcher, Transport, TransportEvent};
use triarch::reporter::{HttpShardReporter, NoopReporter, ShardReporter};
use triarch::rpc::{TriarchRpcImpl, TriarchRpcServer};
use triarch::state::StateVersionManager;
use triarch::tx_pool::TransactionPool;
use triarch::types::Block;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let node_id: u64 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(0);
    let config_path = args.iter().position(|a| a == "--config").and_then(|i| args.get(i + 1));

    let mut config = match config_path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    config = config.apply_cli_overrides(&args);

    let (my_pk, my_key) = generate_keypair_from_id(node_id);
    log::info!("starting node {node_id} as {}", my_pk.to_address());

    // Devnet genesis: five deterministic validators with equal stake, unless
    // the loaded config already names one.
    let genesis_validators: BTreeMap<_, _> = if config.genesis_validators.is_empty() {
        (0..5).map(|i| (generate_keypair_from_id(i).0.to_address(), 100)).collect()
    } else {
        config.genesis_validators.clone()
    };

    let state = Arc::new(StateVersionManager::new());
    state.init_finalized("final-0");

    let db_path = format!("{}/node_{node_id}", config.storage_dir);
    std::fs::create_dir_all(&db_path)?;
    let chain = Arc::new(Blockchain::open(format!("{db_path}/chain.redb"))?);
    let blocks = Arc::new(BlockPool::new());
    let pool = Arc::new(TransactionPool::new());

    let genesis = match chain.tip()? {
        Some(tip) => tip,
        None => {
            let genesis = Block::genesis(genesis_validators.clone(), config.genesis_timestamp);
            chain.append(&genesis)?;
            genesis
        }
    };

    let engine = Arc::new(ConsensusEngine::new(
        my_pk.to_address(),
        my_key.clone(),
        config.genesis_timestamp,
        config.epoch_ms,
        config.lightweight.strict_state_proof,
        state.clone(),
        blocks.clone(),
        pool.clone(),
        chain.clone(),
    ));
    engine.init(genesis);
    engine.set_node_status(NodeStatus::Serving);

    let reporter: Arc<dyn ShardReporter> = match &config.reporter.parent_chain_endpoint {
        Some(endpoint) => {
            Arc::new(HttpShardReporter::new(endpoint.clone(), my_key.clone(), "/sharding/shard/main"))
        }
        None => Arc::new(NoopReporter),
    };

    let rpc_impl = TriarchRpcImpl::new(chain.clone(), engine.clone(), pool.clone());
    let server = Server::builder().build(&config.rpc_bind).await?;
    let handle = server.start(rpc_impl.into_rpc());
    log::info!("RPC server listening on {}", config.rpc_bind);

    let transport = Arc::new(LibP2pTransport::new(config.p2p_port).await?);
    for bootnode in &config.bootnodes {
        transport.dial(bootnode).await;
    }

    let dispatcher = PeerDispatcher::new(my_pk.to_address(), my_key.clone());

    let mut epoch_timer = tokio::time::interval(Duration::from_millis(config.epoch_ms as u64));
    let mut connected_peers: std::collections::HashSet<libp2p::PeerId> = std::collections::HashSet::new();

    loop {
        tokio::select! {
            Some(event) = transport.next_event() => {
                let now_ms = wall_clock_ms();
                match event {
                    TransportEvent::PeerConnected(peer) => {
                        log::info!("peer connected: {peer}");
                        connected_peers.insert(peer);
                        transport.send(peer, dispatcher.handshake(now_ms)).await;
                    }
                    TransportEvent::Inbound { msg, from } => {
                        match dispatcher.dispatch(msg, from, now_ms, &engine, &pool, &chain, &blocks) {
                            Ok(actions) => run_dispatch_actions(&transport, &connected_peers, actions).await,
                            Err(e) => log::warn!("dropping message from {from}: {e}"),
                        }
                    }
                }
            }
            _ = epoch_timer.tick() => {
                let now_ms = wall_clock_ms();
                match engine.tick(now_ms) {
                    Ok(actions) => run_consensus_actions(&transport, &reporter, &connected_peers, now_ms, actions).await,
                    Err(e) => log::error!("consensus tick error: {e}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("shutdown signal received");
                engine.stop();
                let _ = handle.stop();
                handle.stopped().await;
                break;
            }
        }
    }

    log::info!("node {node_id} shutdown complete");
    Ok(())
}

async fn run_dispatch_actions(
    transport: &Arc<LibP2pTransport>,
    connected_peers: &std::collections::HashSet<libp2p::PeerId>,
    actions: Vec<DispatchAction>,
) {
    for action in actions {
        match action {
            DispatchAction::Broadcast(msg) => transport.broadcast(msg).await,
            DispatchAction::SendTo(peer, msg) => transport.send(peer, msg).await,
            DispatchAction::RequestChainSegment(last) => {
                request_chain_segment_from_all(transport, connected_peers, last).await;
            }
        }
    }
}

async fn run_consensus_actions(
    transport: &Arc<LibP2pTransport>,
    reporter: &Arc<dyn ShardReporter>,
    connected_peers: &std::collections::HashSet<libp2p::PeerId>,
    now_ms: i64,
    actions: Vec<ConsensusAction>,
) {
    for action in actions {
        match action {
            ConsensusAction::BroadcastProposal(block, tx) => {
                transport.broadcast(triarch::network::WireMessage::propose(block, tx, now_ms)).await;
            }
            ConsensusAction::BroadcastVote(tx) => {
                transport.broadcast(triarch::network::WireMessage::vote(tx, now_ms)).await;
            }
            ConsensusAction::RequestChainSegment(last) => {
                request_chain_segment_from_all(transport, connected_peers, last).await;
            }
            ConsensusAction::ReportFinalized { state_proof_hash, block_number } => {
                reporter.report_finalized(state_proof_hash, block_number).await;
            }
        }
    }
}

/// Ask every connected peer for a chain segment after `last` (spec §4.7:
/// catch-up fans out rather than targeting one peer, since any peer might
/// be behind or unreachable).
async fn request_chain_segment_from_all(
    transport: &Arc<LibP2pTransport>,
    connected_peers: &std::collections::HashSet<libp2p::PeerId>,
    last: Block,
) {
    for peer in connected_peers {
        transport.request_chain_segment(*peer, Some(last.clone())).await;
    }
}

fn wall_clock_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
