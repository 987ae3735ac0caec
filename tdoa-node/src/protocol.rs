//! protocol.rs — time-reference exchange between nodes
//!
//! Broadcasts the local time reference every second and the node status every
//! five seconds from a 100 ms tick; ingests peer references and statuses,
//! answers point-to-point sync/status requests, and raises alerts when a peer
//! degrades (error/holdover status, blown uncertainty, or silence).
//!
//! The protocol is state-free beyond the last-received reference and status
//! per peer: out-of-order messages are accepted, exact duplicates are dropped
//! by per-sender sequence tracking.
//!
//! Consensus rounds exchange proposal/vote messages and are counted, but no
//! clock adjustment is derived from them; the voting rule is future work.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tdoa_types::{MessageType, NodeStatus, SyncStatus, TimeReference};

use crate::time_base::TimeBase;
use crate::transport::{Incoming, ProtocolMessage, UdpTransport};

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Interval between time-reference broadcasts
    pub reference_interval: Duration,
    /// Interval between status broadcasts
    pub status_interval: Duration,
    /// Peer uncertainty (ns) above which it is flagged degraded
    pub degraded_uncertainty_ns: f64,
    /// Seconds of silence after which a peer is flagged stale
    pub stale_after_s: f64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            reference_interval: Duration::from_secs(1),
            status_interval: Duration::from_secs(5),
            degraded_uncertainty_ns: 1.0e6,
            stale_after_s: 15.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProtocolStatistics {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_rejected: u64,
    pub references_sent: u64,
    pub references_received: u64,
    pub consensus_rounds: u32,
    pub consensus_votes_received: u32,
    pub alerts_sent: u64,
    pub alerts_received: u64,
}

/// Alert raised by a peer or by local degradation monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertPayload {
    pub node_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VotePayload {
    accept: bool,
}

// ── Peer state ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PeerState {
    pub node_id: String,
    pub last_reference: Option<TimeReference>,
    pub status: Option<NodeStatus>,
    /// Local receive time of the last message, ns
    pub last_seen_ns: u64,
    /// Whether a degradation alert is currently outstanding for this peer
    pub degraded: bool,
}

struct ProtocolState {
    peers: HashMap<String, PeerState>,
    /// Last accepted sequence per sender, for duplicate rejection
    last_sequences: HashMap<String, u32>,
    stats: ProtocolStatistics,
    consensus_active: bool,
    last_reference_broadcast_ns: u64,
    last_status_broadcast_ns: u64,
}

// ── Protocol ──────────────────────────────────────────────────────────────────

pub struct TimeReferenceProtocol {
    time_base: Arc<TimeBase>,
    transport: Arc<UdpTransport>,
    config: ProtocolConfig,
    state: Mutex<ProtocolState>,
    running: AtomicBool,
    alerts_tx: mpsc::UnboundedSender<AlertPayload>,
}

impl TimeReferenceProtocol {
    pub fn new(
        time_base: Arc<TimeBase>,
        transport: Arc<UdpTransport>,
        config: ProtocolConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<AlertPayload>) {
        let (alerts_tx, alerts_rx) = mpsc::unbounded_channel();
        let protocol = Arc::new(Self {
            time_base,
            transport,
            config,
            state: Mutex::new(ProtocolState {
                peers: HashMap::new(),
                last_sequences: HashMap::new(),
                stats: ProtocolStatistics::default(),
                consensus_active: false,
                last_reference_broadcast_ns: 0,
                last_status_broadcast_ns: 0,
            }),
            running: AtomicBool::new(false),
            alerts_tx,
        });
        (protocol, alerts_rx)
    }

    /// Spawn the receive and periodic tasks.
    pub fn start(self: &Arc<Self>, mut incoming: mpsc::Receiver<Incoming>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let recv_proto = self.clone();
        tokio::spawn(async move {
            while let Some(incoming) = incoming.recv().await {
                recv_proto.handle_message(incoming.message, incoming.from).await;
            }
            debug!("protocol receive loop ended");
        });

        let tick_proto = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(100));
            while tick_proto.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                tick_proto.tick(now_ns()).await;
            }
        });
        info!("time-reference protocol started as '{}'", self.transport.node_id());
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn statistics(&self) -> ProtocolStatistics {
        self.state.lock().unwrap().stats.clone()
    }

    pub fn peer(&self, node_id: &str) -> Option<PeerState> {
        self.state.lock().unwrap().peers.get(node_id).cloned()
    }

    pub fn peers(&self) -> HashMap<String, PeerState> {
        self.state.lock().unwrap().peers.clone()
    }

    /// Signed remote − local clock difference in ns, with combined
    /// uncertainty, from the peer's last reference.
    pub fn time_difference_to(&self, node_id: &str) -> Option<(f64, f64)> {
        let remote = self.state.lock().unwrap().peers.get(node_id)?.last_reference.clone()?;
        let local = self.time_base.time_reference();
        Some(TimeBase::time_difference(&local, &remote))
    }

    /// Begin a consensus round: broadcast a proposal carrying the local
    /// reference. Votes are collected and counted; no clock adjustment is
    /// applied from the round.
    pub async fn initiate_consensus(&self) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if state.consensus_active {
                return false;
            }
            state.consensus_active = true;
            state.stats.consensus_rounds += 1;
        }
        let reference = self.time_base.time_reference();
        self.broadcast(MessageType::ConsensusProposal, to_json(&reference)).await;
        true
    }

    /// Force an immediate reference broadcast.
    pub async fn broadcast_time_reference(&self) -> bool {
        self.state.lock().unwrap().stats.references_sent += 1;
        let reference = self.time_base.time_reference();
        self.broadcast(MessageType::TimeReference, to_json(&reference)).await
    }

    // ── Periodic work ─────────────────────────────────────────────────────────

    /// One scheduler step at `now`: flush due broadcasts and check peers.
    pub async fn tick(&self, now: u64) {
        let (send_reference, send_status) = {
            let mut state = self.state.lock().unwrap();
            let reference_due = now.saturating_sub(state.last_reference_broadcast_ns)
                >= self.config.reference_interval.as_nanos() as u64;
            let status_due = now.saturating_sub(state.last_status_broadcast_ns)
                >= self.config.status_interval.as_nanos() as u64;
            if reference_due {
                state.last_reference_broadcast_ns = now;
            }
            if status_due {
                state.last_status_broadcast_ns = now;
            }
            (reference_due, status_due)
        };

        if send_reference {
            self.broadcast_time_reference().await;
        }
        if send_status {
            let status = self.time_base.node_status(self.transport.node_id());
            self.broadcast(MessageType::StatusUpdate, to_json(&status)).await;
        }
        self.check_peer_health(now).await;
    }

    /// Flag peers that report a bad status, blown uncertainty, or have gone
    /// silent; clears the flag when they recover.
    async fn check_peer_health(&self, now: u64) {
        let mut alerts = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            for peer in state.peers.values_mut() {
                let stale =
                    (now.saturating_sub(peer.last_seen_ns)) as f64 / 1.0e9 > self.config.stale_after_s;
                let unhealthy = peer
                    .status
                    .as_ref()
                    .map(|s| {
                        matches!(s.sync_status, SyncStatus::Error | SyncStatus::Holdover)
                            || s.uncertainty_ns > self.config.degraded_uncertainty_ns
                    })
                    .unwrap_or(false);

                let degraded = stale || unhealthy;
                if degraded && !peer.degraded {
                    peer.degraded = true;
                    let reason = if stale { "silent" } else { "degraded sync" };
                    alerts.push(AlertPayload {
                        node_id: peer.node_id.clone(),
                        message: format!("peer '{}' is {reason}", peer.node_id),
                    });
                } else if !degraded && peer.degraded {
                    peer.degraded = false;
                    info!("peer '{}' recovered", peer.node_id);
                }
            }
        }

        for alert in alerts {
            warn!("time sync alert: {}", alert.message);
            let _ = self.alerts_tx.send(alert.clone());
            self.state.lock().unwrap().stats.alerts_sent += 1;
            self.broadcast(MessageType::Alert, to_json(&alert)).await;
        }
    }

    // ── Inbound ───────────────────────────────────────────────────────────────

    async fn handle_message(&self, message: ProtocolMessage, _from: SocketAddr) {
        let now = now_ns();
        {
            let mut state = self.state.lock().unwrap();
            state.stats.messages_received += 1;

            // Duplicate rejection: out-of-order is fine, same sequence twice
            // from one sender is not.
            match state.last_sequences.get(&message.source_id) {
                Some(last) if *last == message.sequence => {
                    state.stats.messages_rejected += 1;
                    debug!(
                        "duplicate message seq {} from '{}' rejected",
                        message.sequence, message.source_id
                    );
                    return;
                }
                _ => {
                    state
                        .last_sequences
                        .insert(message.source_id.clone(), message.sequence);
                }
            }

            let peer = state.peers.entry(message.source_id.clone()).or_insert(PeerState {
                node_id: message.source_id.clone(),
                last_reference: None,
                status: None,
                last_seen_ns: now,
                degraded: false,
            });
            peer.last_seen_ns = now;
        }

        match message.msg_type {
            MessageType::TimeReference | MessageType::SyncResponse => {
                if let Some(reference) = from_json::<TimeReference>(&message.payload) {
                    let mut state = self.state.lock().unwrap();
                    state.stats.references_received += 1;
                    if let Some(peer) = state.peers.get_mut(&message.source_id) {
                        peer.last_reference = Some(reference);
                    }
                } else {
                    self.reject(&message, "unparseable time reference");
                }
            }
            MessageType::SyncRequest => {
                let reference = self.time_base.time_reference();
                self.respond(&message.source_id, MessageType::SyncResponse, to_json(&reference))
                    .await;
            }
            MessageType::StatusUpdate | MessageType::StatusResponse => {
                if let Some(status) = from_json::<NodeStatus>(&message.payload) {
                    let mut state = self.state.lock().unwrap();
                    if let Some(peer) = state.peers.get_mut(&message.source_id) {
                        peer.status = Some(status);
                    }
                } else {
                    self.reject(&message, "unparseable node status");
                }
            }
            MessageType::StatusRequest => {
                let status = self.time_base.node_status(self.transport.node_id());
                self.respond(&message.source_id, MessageType::StatusResponse, to_json(&status))
                    .await;
            }
            MessageType::ConsensusProposal => {
                let join = {
                    let mut state = self.state.lock().unwrap();
                    if state.consensus_active {
                        false
                    } else {
                        state.consensus_active = true;
                        state.stats.consensus_rounds += 1;
                        true
                    }
                };
                if join {
                    debug!("joining consensus round from '{}'", message.source_id);
                    self.respond(
                        &message.source_id,
                        MessageType::ConsensusVote,
                        to_json(&VotePayload { accept: true }),
                    )
                    .await;
                }
            }
            MessageType::ConsensusVote => {
                let mut state = self.state.lock().unwrap();
                if state.consensus_active {
                    state.stats.consensus_votes_received += 1;
                }
            }
            MessageType::Alert => {
                if let Some(alert) = from_json::<AlertPayload>(&message.payload) {
                    let mut state = self.state.lock().unwrap();
                    state.stats.alerts_received += 1;
                    drop(state);
                    warn!("alert from '{}': {}", message.source_id, alert.message);
                    let _ = self.alerts_tx.send(alert);
                }
            }
        }
    }

    // ── Outbound helpers ──────────────────────────────────────────────────────

    /// Counters track hand-off to the transport; a failed datagram is logged
    /// and retried at the next interval.
    async fn broadcast(&self, msg_type: MessageType, payload: Bytes) -> bool {
        self.state.lock().unwrap().stats.messages_sent += 1;
        let message = ProtocolMessage::broadcast(msg_type, self.transport.node_id(), payload);
        match self.transport.send(message).await {
            Ok(()) => true,
            Err(e) => {
                warn!("broadcast of {msg_type:?} failed: {e}");
                false
            }
        }
    }

    async fn respond(&self, dest: &str, msg_type: MessageType, payload: Bytes) {
        self.state.lock().unwrap().stats.messages_sent += 1;
        let message = ProtocolMessage::to(msg_type, self.transport.node_id(), dest, payload);
        if let Err(e) = self.transport.send(message).await {
            warn!("response {msg_type:?} to '{dest}' failed: {e}");
        }
    }

    fn reject(&self, message: &ProtocolMessage, reason: &str) {
        let mut state = self.state.lock().unwrap();
        state.stats.messages_rejected += 1;
        debug!("rejected {:?} from '{}': {reason}", message.msg_type, message.source_id);
    }
}

fn to_json<T: Serialize>(value: &T) -> Bytes {
    Bytes::from(serde_json::to_vec(value).unwrap_or_default())
}

fn from_json<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Option<T> {
    serde_json::from_slice(payload).ok()
}

fn now_ns() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as u64
}
