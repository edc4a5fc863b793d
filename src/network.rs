//! `PeerDispatcher`: the wire envelope, version gating, and the one concrete
//! `Transport` this crate ships on top of `libp2p` (spec §1, §4.7, §6).
//!
//! The consensus core never touches `libp2p` directly — it only calls
//! `Transport::broadcast`/`send`/`request_chain_segment`. `PeerDispatcher`
//! owns message parsing into the tagged six-message-kind envelope, version
//! gating, the acceptance-timestamp window, and routing into
//! `ConsensusEngine`/`TransactionPool`, independent of which transport is
//! wired in by `main`.

use crate::block_pool::{BlockInfo, BlockPool};
use crate::blockchain::Blockchain;
use crate::consensus::ConsensusEngine;
use crate::crypto::{Address, PrivateKey, Signature, recover, sign};
use crate::tx_pool::TransactionPool;
use crate::types::Block;
use crate::types::Transaction;
use async_trait::async_trait;
use futures::StreamExt;
use libp2p::request_response::{self, ProtocolSupport, ResponseChannel, cbor};
use libp2p::swarm::{NetworkBehaviour, SwarmEvent};
use libp2p::{Multiaddr, PeerId, StreamProtocol, gossipsub, mdns, noise, tcp, yamux};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash as StdHash, Hasher};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Major version this build speaks. A peer whose `dataProtoVer` carries a
/// different major is incompatible (spec §6 "version gating").
pub const DATA_PROTO_VER: &str = "1.0.0";
pub const CONSENSUS_PROTO_VER: &str = "1.0.0";

/// A message older or newer than this many ms from our clock is dropped
/// outright, independent of epoch bookkeeping (spec §6).
pub const ACCEPTANCE_WINDOW_MS: i64 = 60_000;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("dataProtoVer {0} is a different major version than this node's {DATA_PROTO_VER}")]
    VersionIncompatible(String),
    #[error("timestamp {0} is outside the acceptance window")]
    Stale(i64),
    #[error("handshake signature does not recover to the claimed address")]
    BadHandshakeSignature,
}

fn major(ver: &str) -> Option<&str> {
    ver.split('.').next()
}

fn version_compatible(their_ver: &str) -> bool {
    major(their_ver) == major(DATA_PROTO_VER)
}

fn within_window(timestamp: i64, now_ms: i64) -> bool {
    (now_ms - timestamp).abs() <= ACCEPTANCE_WINDOW_MS
}

fn wall_clock_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// The body of an `ADDRESS_REQUEST`/`ADDRESS_RESPONSE` handshake: a signed
/// claim of identity (spec §9 open question (b): handshakes must be signed).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandshakeBody {
    pub address: Address,
    pub timestamp: i64,
    pub signature: Signature,
}

impl HandshakeBody {
    pub fn new_signed(address: Address, timestamp: i64, key: &PrivateKey) -> Self {
        let payload = handshake_payload(&address, timestamp);
        let signature = sign(key, &payload);
        HandshakeBody { address, timestamp, signature }
    }

    pub fn verify(&self) -> bool {
        let payload = handshake_payload(&self.address, self.timestamp);
        recover(&payload, &self.signature) == Some(self.address)
    }
}

fn handshake_payload(address: &Address, timestamp: i64) -> Vec<u8> {
    let mut out = Vec::with_capacity(28);
    out.extend_from_slice(&address.0);
    out.extend_from_slice(&timestamp.to_be_bytes());
    out
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConsensusMessage {
    #[serde(rename = "PROPOSE")]
    Propose {
        value: ProposeValue,
        consensus_proto_ver: String,
    },
    #[serde(rename = "VOTE")]
    Vote {
        value: Transaction,
        consensus_proto_ver: String,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProposeValue {
    pub block: Block,
    pub proposal_tx: Transaction,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransactionPayload {
    Single(Transaction),
    List { tx_list: Vec<Transaction> },
}

impl TransactionPayload {
    pub fn into_vec(self) -> Vec<Transaction> {
        match self {
            TransactionPayload::Single(tx) => vec![tx],
            TransactionPayload::List { tx_list } => tx_list,
        }
    }
}

/// One wire-visible entry of `catchUpInfo`: a fragment of a `BlockInfo` the
/// requester didn't have, fed back through the normal proposal/vote path
/// (spec §4.7).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CatchUpFragment {
    pub block: Block,
    pub proposal: Option<Transaction>,
    pub votes: Vec<Transaction>,
}

impl From<BlockInfo> for CatchUpFragment {
    fn from(info: BlockInfo) -> Self {
        CatchUpFragment { block: info.block, proposal: info.proposal, votes: info.votes }
    }
}

/// The closed set of six wire messages (spec §6), each carrying the common
/// envelope fields (`dataProtoVer`, `timestamp`) inline rather than as a
/// separately-typed wrapper, so `serde`'s internally tagged enum does the
/// parse-once/dispatch-by-match the spec calls for (spec §9).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessage {
    #[serde(rename = "ADDRESS_REQUEST")]
    AddressRequest { data_proto_ver: String, timestamp: i64, data: HandshakeBody },
    #[serde(rename = "ADDRESS_RESPONSE")]
    AddressResponse { data_proto_ver: String, timestamp: i64, data: HandshakeBody },
    #[serde(rename = "CONSENSUS")]
    Consensus { data_proto_ver: String, timestamp: i64, message: ConsensusMessage },
    #[serde(rename = "TRANSACTION")]
    Transaction { data_proto_ver: String, timestamp: i64, transaction: TransactionPayload },
    #[serde(rename = "CHAIN_SEGMENT_REQUEST")]
    ChainSegmentRequest { data_proto_ver: String, timestamp: i64, last_block: Option<Block> },
    #[serde(rename = "CHAIN_SEGMENT_RESPONSE")]
    ChainSegmentResponse {
        data_proto_ver: String,
        timestamp: i64,
        chain_segment: Option<Vec<Block>>,
        number: u64,
        catch_up_info: Option<Vec<CatchUpFragment>>,
    },
}

impl WireMessage {
    fn data_proto_ver(&self) -> &str {
        match self {
            WireMessage::AddressRequest { data_proto_ver, .. }
            | WireMessage::AddressResponse { data_proto_ver, .. }
            | WireMessage::Consensus { data_proto_ver, .. }
            | WireMessage::Transaction { data_proto_ver, .. }
            | WireMessage::ChainSegmentRequest { data_proto_ver, .. }
            | WireMessage::ChainSegmentResponse { data_proto_ver, .. } => data_proto_ver,
        }
    }

    fn timestamp(&self) -> i64 {
        match self {
            WireMessage::AddressRequest { timestamp, .. }
            | WireMessage::AddressResponse { timestamp, .. }
            | WireMessage::Consensus { timestamp, .. }
            | WireMessage::Transaction { timestamp, .. }
            | WireMessage::ChainSegmentRequest { timestamp, .. }
            | WireMessage::ChainSegmentResponse { timestamp, .. } => *timestamp,
        }
    }

    fn is_handshake(&self) -> bool {
        matches!(self, WireMessage::AddressRequest { .. } | WireMessage::AddressResponse { .. })
    }

    pub fn consensus(message: ConsensusMessage, now_ms: i64) -> Self {
        WireMessage::Consensus { data_proto_ver: DATA_PROTO_VER.into(), timestamp: now_ms, message }
    }

    pub fn propose(block: Block, proposal_tx: Transaction, now_ms: i64) -> Self {
        Self::consensus(
            ConsensusMessage::Propose {
                value: ProposeValue { block, proposal_tx },
                consensus_proto_ver: CONSENSUS_PROTO_VER.into(),
            },
            now_ms,
        )
    }

    pub fn vote(tx: Transaction, now_ms: i64) -> Self {
        Self::consensus(
            ConsensusMessage::Vote { value: tx, consensus_proto_ver: CONSENSUS_PROTO_VER.into() },
            now_ms,
        )
    }

    pub fn chain_segment_request(last_block: Option<Block>, now_ms: i64) -> Self {
        WireMessage::ChainSegmentRequest { data_proto_ver: DATA_PROTO_VER.into(), timestamp: now_ms, last_block }
    }
}

/// Effects routing a `WireMessage` can ask `main`'s event loop to perform:
/// an outbound broadcast/send, or a higher-level request like "fetch a
/// segment from this peer".
#[derive(Debug)]
pub enum DispatchAction {
    Broadcast(WireMessage),
    SendTo(PeerId, WireMessage),
    /// Ask every outbound peer for a chain segment after this block (spec
    /// §4.7); the event loop fans this out, since the dispatcher itself
    /// doesn't track which peers are connected.
    RequestChainSegment(Block),
}

/// Version-gates and routes one inbound `WireMessage`. This is the "dynamic
/// dispatch on message type is a tagged variant over a closed set of 6 wire
/// messages" design note (spec §9) made concrete: parse once (by `serde`),
/// dispatch by `match` here.
pub struct PeerDispatcher {
    my_address: Address,
    key: PrivateKey,
}

impl PeerDispatcher {
    pub fn new(my_address: Address, key: PrivateKey) -> Self {
        PeerDispatcher { my_address, key }
    }

    fn gate(&self, msg: &WireMessage, now_ms: i64) -> Result<(), NetworkError> {
        if !version_compatible(msg.data_proto_ver()) {
            return Err(NetworkError::VersionIncompatible(msg.data_proto_ver().to_string()));
        }
        if !within_window(msg.timestamp(), now_ms) {
            return Err(NetworkError::Stale(msg.timestamp()));
        }
        if msg.is_handshake() {
            let ok = match msg {
                WireMessage::AddressRequest { data, .. } | WireMessage::AddressResponse { data, .. } => {
                    data.verify()
                }
                _ => unreachable!(),
            };
            if !ok {
                return Err(NetworkError::BadHandshakeSignature);
            }
        }
        Ok(())
    }

    /// Build a signed `ADDRESS_REQUEST` for a fresh peer we just dialed or
    /// that dialed us (spec §9 open question (b)).
    pub fn handshake(&self, now_ms: i64) -> WireMessage {
        let body = HandshakeBody::new_signed(self.my_address, now_ms, &self.key);
        WireMessage::AddressRequest { data_proto_ver: DATA_PROTO_VER.into(), timestamp: now_ms, data: body }
    }

    pub fn handshake_response(&self, now_ms: i64) -> WireMessage {
        let body = HandshakeBody::new_signed(self.my_address, now_ms, &self.key);
        WireMessage::AddressResponse { data_proto_ver: DATA_PROTO_VER.into(), timestamp: now_ms, data: body }
    }

    /// Route one inbound message. Errors are the "swallow, log, drop" path
    /// (spec §7): the caller logs `Err` and moves on, never propagating it.
    pub fn dispatch(
        &self,
        msg: WireMessage,
        from: PeerId,
        now_ms: i64,
        engine: &ConsensusEngine,
        pool: &TransactionPool,
        chain: &Blockchain,
        blocks: &BlockPool,
    ) -> Result<Vec<DispatchAction>, NetworkError> {
        self.gate(&msg, now_ms)?;
        match msg {
            WireMessage::AddressRequest { .. } => Ok(vec![DispatchAction::SendTo(from, self.handshake_response(now_ms))]),
            WireMessage::AddressResponse { .. } => Ok(vec![]),
            WireMessage::Consensus { message, .. } => Ok(self.dispatch_consensus(message, now_ms, engine)),
            WireMessage::Transaction { transaction, .. } => {
                for tx in transaction.into_vec() {
                    let _ = pool.admit(tx);
                }
                Ok(vec![])
            }
            WireMessage::ChainSegmentRequest { last_block, .. } => {
                Ok(vec![self.chain_segment_response(last_block, from, now_ms, chain, blocks)])
            }
            WireMessage::ChainSegmentResponse { chain_segment, catch_up_info, .. } => {
                if let Some(segment) = chain_segment {
                    let _ = engine.apply_chain_segment(segment);
                }
                let mut actions = Vec::new();
                for fragment in catch_up_info.unwrap_or_default() {
                    if let Some(proposal) = fragment.proposal {
                        if let Ok(more) = engine.on_proposal(fragment.block, proposal, now_ms) {
                            actions.extend(more.into_iter().filter_map(Self::action_from_consensus));
                        }
                    }
                    for vote in fragment.votes {
                        if let Ok(more) = engine.on_vote(vote) {
                            actions.extend(more.into_iter().filter_map(Self::action_from_consensus));
                        }
                    }
                }
                Ok(actions)
            }
        }
    }

    fn dispatch_consensus(&self, message: ConsensusMessage, now_ms: i64, engine: &ConsensusEngine) -> Vec<DispatchAction> {
        let result = match message {
            ConsensusMessage::Propose { value, .. } => engine.on_proposal(value.block, value.proposal_tx, now_ms),
            ConsensusMessage::Vote { value, .. } => engine.on_vote(value),
        };
        match result {
            Ok(actions) => actions
                .into_iter()
                .filter_map(|a| Self::action_from_consensus(a, now_ms))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    fn action_from_consensus(action: crate::consensus::ConsensusAction, now_ms: i64) -> Option<DispatchAction> {
        use crate::consensus::ConsensusAction as CA;
        match action {
            CA::BroadcastProposal(block, tx) => {
                Some(DispatchAction::Broadcast(WireMessage::propose(block, tx, now_ms)))
            }
            CA::BroadcastVote(tx) => Some(DispatchAction::Broadcast(WireMessage::vote(tx, now_ms))),
            CA::RequestChainSegment(last) => Some(DispatchAction::RequestChainSegment(last)),
            CA::ReportFinalized { .. } => None,
        }
    }

    /// Up to `CHAIN_SEGMENT_LIMIT` consecutive blocks beginning right after
    /// the requester's tip, plus the notarized-chain DAG fragments beyond
    /// the finalized chain as `catchUpInfo` (spec §4.7).
    fn chain_segment_response(
        &self,
        last_block: Option<Block>,
        to: PeerId,
        now_ms: i64,
        chain: &Blockchain,
        blocks: &BlockPool,
    ) -> DispatchAction {
        let after = last_block.map(|b| b.number).unwrap_or(0);
        let segment = chain.segment(after, crate::types::CHAIN_SEGMENT_LIMIT).unwrap_or_default();
        let number = chain.tip_number().ok().flatten().unwrap_or(0);
        let catch_up_info = blocks.catch_up_fragments().into_iter().map(CatchUpFragment::from).collect();
        let msg = WireMessage::ChainSegmentResponse {
            data_proto_ver: DATA_PROTO_VER.into(),
            timestamp: now_ms,
            chain_segment: Some(segment),
            number,
            catch_up_info: Some(catch_up_info),
        };
        DispatchAction::SendTo(to, msg)
    }
}

/// Collaborator interface the consensus core depends on (spec §6): broadcast
/// a message to every connected peer, send one to a specific peer, or ask a
/// peer for a chain segment starting after our own tip.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn broadcast(&self, msg: WireMessage);
    async fn send(&self, peer: PeerId, msg: WireMessage);
    async fn request_chain_segment(&self, peer: PeerId, last_block: Option<Block>);
    async fn dial(&self, addr: &str);
}

#[derive(NetworkBehaviour)]
struct TriarchBehaviour {
    gossipsub: gossipsub::Behaviour,
    mdns: mdns::tokio::Behaviour,
    request_response: cbor::Behaviour<WireMessage, WireMessage>,
}

#[derive(Debug)]
pub enum TransportEvent {
    Inbound { msg: WireMessage, from: PeerId },
    PeerConnected(PeerId),
}

enum TransportCommand {
    Broadcast(WireMessage),
    Send(PeerId, WireMessage),
    RequestChainSegment(PeerId, Option<Block>),
    Dial(Multiaddr),
}

/// Concrete `Transport`: gossipsub for broadcast (PROPOSE/VOTE/TRANSACTION),
/// `request_response` for the inherently point-to-point handshake and
/// catch-up exchange (spec §4.7's `CHAIN_SEGMENT_REQUEST`/`RESPONSE`).
pub struct LibP2pTransport {
    command_sender: mpsc::Sender<TransportCommand>,
    event_receiver: tokio::sync::Mutex<mpsc::Receiver<TransportEvent>>,
}

const GOSSIP_TOPIC: &str = "triarch-consensus";

impl LibP2pTransport {
    pub async fn new(port: u16) -> Result<Self, Box<dyn std::error::Error>> {
        let (command_sender, mut command_receiver) = mpsc::channel(256);
        let (event_sender, event_receiver) = mpsc::channel(256);

        let mut swarm = libp2p::SwarmBuilder::with_new_identity()
            .with_tokio()
            .with_tcp(tcp::Config::default(), noise::Config::new, yamux::Config::default)?
            .with_behaviour(|key| {
                let message_id_fn = |message: &gossipsub::Message| {
                    let mut s = DefaultHasher::new();
                    message.data.hash(&mut s);
                    gossipsub::MessageId::from(s.finish().to_string())
                };
                let gossipsub_config = gossipsub::ConfigBuilder::default()
                    .heartbeat_interval(Duration::from_secs(1))
                    .validation_mode(gossipsub::ValidationMode::Strict)
                    .message_id_fn(message_id_fn)
                    .build()
                    .map_err(std::io::Error::other)?;
                let gossipsub =
                    gossipsub::Behaviour::new(gossipsub::MessageAuthenticity::Signed(key.clone()), gossipsub_config)?;
                let mdns = mdns::tokio::Behaviour::new(mdns::Config::default(), key.public().to_peer_id())?;
                let request_response = cbor::Behaviour::new(
                    [(StreamProtocol::new("/triarch/catchup/1"), ProtocolSupport::Full)],
                    request_response::Config::default(),
                );
                Ok(TriarchBehaviour { gossipsub, mdns, request_response })
            })?
            .build();

        let addr: Multiaddr = format!("/ip4/0.0.0.0/tcp/{port}").parse()?;
        swarm.listen_on(addr)?;

        let topic = gossipsub::IdentTopic::new(GOSSIP_TOPIC);
        swarm.behaviour_mut().gossipsub.subscribe(&topic)?;

        tokio::spawn(async move {
            // Inbound requests awaiting a reply. `request_response` forces a
            // response before the stream closes, but the actual answer is
            // computed by `PeerDispatcher` in the caller's event loop, which
            // only ever sees this as an ordinary `Send`. Queue the channel
            // per peer and drain it the next time `Send` targets that peer.
            let mut pending_responses: HashMap<PeerId, VecDeque<ResponseChannel<WireMessage>>> = HashMap::new();

            loop {
                tokio::select! {
                    event = swarm.select_next_some() => match event {
                        SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                            swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer_id);
                            let _ = event_sender.send(TransportEvent::PeerConnected(peer_id)).await;
                        }
                        SwarmEvent::Behaviour(TriarchBehaviourEvent::Mdns(mdns::Event::Discovered(list))) => {
                            for (peer_id, _addr) in list {
                                swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer_id);
                            }
                        }
                        SwarmEvent::Behaviour(TriarchBehaviourEvent::Mdns(mdns::Event::Expired(list))) => {
                            for (peer_id, _addr) in list {
                                swarm.behaviour_mut().gossipsub.remove_explicit_peer(&peer_id);
                            }
                        }
                        SwarmEvent::Behaviour(TriarchBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                            propagation_source,
                            message,
                            ..
                        })) => {
                            if let Ok(msg) = serde_json::from_slice::<WireMessage>(&message.data) {
                                let _ = event_sender
                                    .send(TransportEvent::Inbound { msg, from: propagation_source })
                                    .await;
                            }
                        }
                        SwarmEvent::Behaviour(TriarchBehaviourEvent::RequestResponse(
                            request_response::Event::Message { peer, message, .. },
                        )) => match message {
                            request_response::Message::Request { request, channel, .. } => {
                                pending_responses.entry(peer).or_default().push_back(channel);
                                let _ = event_sender.send(TransportEvent::Inbound { msg: request, from: peer }).await;
                            }
                            request_response::Message::Response { response, .. } => {
                                let _ = event_sender.send(TransportEvent::Inbound { msg: response, from: peer }).await;
                            }
                        },
                        _ => {}
                    },
                    command = command_receiver.recv() => match command {
                        Some(TransportCommand::Broadcast(msg)) => {
                            if let Ok(data) = serde_json::to_vec(&msg) {
                                let topic = gossipsub::IdentTopic::new(GOSSIP_TOPIC);
                                let _ = swarm.behaviour_mut().gossipsub.publish(topic, data);
                            }
                        }
                        Some(TransportCommand::Send(peer, msg)) => {
                            match pending_responses.get_mut(&peer).and_then(VecDeque::pop_front) {
                                Some(channel) => {
                                    let _ = swarm.behaviour_mut().request_response.send_response(channel, msg);
                                }
                                None => {
                                    swarm.behaviour_mut().request_response.send_request(&peer, msg);
                                }
                            }
                        }
                        Some(TransportCommand::RequestChainSegment(peer, last_block)) => {
                            let msg = WireMessage::chain_segment_request(last_block, wall_clock_ms());
                            swarm.behaviour_mut().request_response.send_request(&peer, msg);
                        }
                        Some(TransportCommand::Dial(addr)) => {
                            let _ = swarm.dial(addr);
                        }
                        None => break,
                    }
                }
            }
        });

        Ok(LibP2pTransport { command_sender, event_receiver: tokio::sync::Mutex::new(event_receiver) })
    }

    pub async fn next_event(&self) -> Option<TransportEvent> {
        self.event_receiver.lock().await.recv().await
    }
}

#[async_trait]
impl Transport for LibP2pTransport {
    async fn broadcast(&self, msg: WireMessage) {
        let _ = self.command_sender.send(TransportCommand::Broadcast(msg)).await;
    }

    async fn send(&self, peer: PeerId, msg: WireMessage) {
        let _ = self.command_sender.send(TransportCommand::Send(peer, msg)).await;
    }

    async fn request_chain_segment(&self, peer: PeerId, last_block: Option<Block>) {
        let _ = self.command_sender.send(TransportCommand::RequestChainSegment(peer, last_block)).await;
    }

    async fn dial(&self, addr: &str) {
        if let Ok(multiaddr) = addr.parse() {
            let _ = self.command_sender.send(TransportCommand::Dial(multiaddr)).await;
        }
    }
}
