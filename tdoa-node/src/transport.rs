//! transport.rs — UDP transport for the time-reference protocol
//!
//! Little-endian frame, explicit field by field (no struct casts):
//!
//! ```text
//! u8  msg_type
//! u16 src_id_len ; src_id bytes
//! u16 dst_id_len ; dst_id bytes      (empty = broadcast)
//! u64 timestamp_ns
//! u32 sequence
//! u32 payload_len ; payload bytes
//! u16 sig_len     ; signature bytes  (reserved)
//! ```
//!
//! Unicast goes to known peers; an empty destination goes to the multicast
//! group. Peers are auto-learned from incoming traffic. Receive errors are
//! logged and counted, never fatal.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tdoa_types::MessageType;

use crate::error::{PipelineError, Result};

// ── Message ───────────────────────────────────────────────────────────────────

/// One protocol message. `dest_id` empty means broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolMessage {
    pub msg_type: MessageType,
    pub source_id: String,
    pub dest_id: String,
    pub timestamp_ns: u64,
    pub sequence: u32,
    pub payload: Bytes,
    /// Reserved for future message authentication; sent empty
    pub signature: Bytes,
}

impl ProtocolMessage {
    pub fn broadcast(msg_type: MessageType, source_id: impl Into<String>, payload: Bytes) -> Self {
        Self {
            msg_type,
            source_id: source_id.into(),
            dest_id: String::new(),
            timestamp_ns: 0,
            sequence: 0,
            payload,
            signature: Bytes::new(),
        }
    }

    pub fn to(
        msg_type: MessageType,
        source_id: impl Into<String>,
        dest_id: impl Into<String>,
        payload: Bytes,
    ) -> Self {
        Self { dest_id: dest_id.into(), ..Self::broadcast(msg_type, source_id, payload) }
    }

    pub fn is_broadcast(&self) -> bool {
        self.dest_id.is_empty()
    }
}

// ── Frame codec ───────────────────────────────────────────────────────────────

pub fn encode_message(message: &ProtocolMessage) -> Bytes {
    let mut buf = BytesMut::with_capacity(
        1 + 2 + message.source_id.len() + 2 + message.dest_id.len() + 8 + 4 + 4
            + message.payload.len()
            + 2
            + message.signature.len(),
    );
    buf.put_u8(message.msg_type as u8);
    buf.put_u16_le(message.source_id.len() as u16);
    buf.put_slice(message.source_id.as_bytes());
    buf.put_u16_le(message.dest_id.len() as u16);
    buf.put_slice(message.dest_id.as_bytes());
    buf.put_u64_le(message.timestamp_ns);
    buf.put_u32_le(message.sequence);
    buf.put_u32_le(message.payload.len() as u32);
    buf.put_slice(&message.payload);
    buf.put_u16_le(message.signature.len() as u16);
    buf.put_slice(&message.signature);
    buf.freeze()
}

pub fn decode_message(data: &[u8]) -> Result<ProtocolMessage> {
    let mut buf = data;

    need(buf, 1, "msg_type")?;
    let type_byte = buf.get_u8();
    let msg_type = MessageType::from_u8(type_byte)
        .ok_or_else(|| PipelineError::Precondition(format!("unknown msg_type {type_byte}")))?;

    let source_id = String::from_utf8(read_block(&mut buf, 2, "src_id")?)
        .map_err(|_| PipelineError::Precondition("src_id is not UTF-8".into()))?;
    let dest_id = String::from_utf8(read_block(&mut buf, 2, "dst_id")?)
        .map_err(|_| PipelineError::Precondition("dst_id is not UTF-8".into()))?;

    need(buf, 12, "timestamp+sequence")?;
    let timestamp_ns = buf.get_u64_le();
    let sequence = buf.get_u32_le();

    let payload = Bytes::from(read_block(&mut buf, 4, "payload")?);
    let signature = Bytes::from(read_block(&mut buf, 2, "signature")?);

    if buf.has_remaining() {
        return Err(PipelineError::Precondition(format!(
            "{} trailing bytes after frame",
            buf.remaining()
        )));
    }

    Ok(ProtocolMessage { msg_type, source_id, dest_id, timestamp_ns, sequence, payload, signature })
}

fn need(buf: &[u8], n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(PipelineError::Precondition(format!("frame truncated in {what}")));
    }
    Ok(())
}

fn read_block(buf: &mut &[u8], len_width: usize, what: &str) -> Result<Vec<u8>> {
    need(buf, len_width, what)?;
    let len = match len_width {
        2 => buf.get_u16_le() as usize,
        4 => buf.get_u32_le() as usize,
        _ => unreachable!(),
    };
    need(buf, len, what)?;
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

// ── Transport configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Local unicast bind port (0 = ephemeral)
    pub local_port: u16,
    pub multicast_group: Ipv4Addr,
    pub multicast_port: u16,
    pub multicast_ttl: u32,
    pub multicast_loopback: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            local_port: 0,
            multicast_group: Ipv4Addr::new(239, 255, 77, 77),
            multicast_port: 7777,
            multicast_ttl: 1,
            multicast_loopback: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub sent: u64,
    pub received: u64,
    pub rejected: u64,
}

// ── UDP transport ─────────────────────────────────────────────────────────────

/// Received message plus the peer address it came from.
pub struct Incoming {
    pub message: ProtocolMessage,
    pub from: SocketAddr,
}

pub struct UdpTransport {
    node_id: String,
    socket: Arc<UdpSocket>,
    config: TransportConfig,
    peers: Arc<Mutex<HashMap<String, SocketAddr>>>,
    next_sequence: AtomicU32,
    sent: AtomicU64,
    received: Arc<AtomicU64>,
    rejected: Arc<AtomicU64>,
}

impl UdpTransport {
    /// Bind the local socket and join the multicast group. Returns the
    /// transport and the channel on which received messages arrive.
    pub async fn bind(
        node_id: impl Into<String>,
        config: TransportConfig,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Incoming>)> {
        let node_id = node_id.into();
        let socket = UdpSocket::bind(("0.0.0.0", config.local_port)).await?;
        // A host without a multicast route can still run unicast-only
        if let Err(e) = socket.join_multicast_v4(config.multicast_group, Ipv4Addr::UNSPECIFIED) {
            warn!("could not join multicast group {}: {e}", config.multicast_group);
        }
        let _ = socket.set_multicast_ttl_v4(config.multicast_ttl);
        let _ = socket.set_multicast_loop_v4(config.multicast_loopback);
        info!(
            "time-reference transport on udp:{} (multicast {}:{})",
            socket.local_addr()?.port(),
            config.multicast_group,
            config.multicast_port
        );

        let transport = Arc::new(Self {
            node_id,
            socket: Arc::new(socket),
            config,
            peers: Arc::new(Mutex::new(HashMap::new())),
            next_sequence: AtomicU32::new(0),
            sent: AtomicU64::new(0),
            received: Arc::new(AtomicU64::new(0)),
            rejected: Arc::new(AtomicU64::new(0)),
        });

        let (tx, rx) = mpsc::channel(256);
        transport.spawn_receive_loop(tx);
        Ok((transport, rx))
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn local_port(&self) -> u16 {
        self.socket.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Register a peer address for unicast delivery.
    pub fn add_peer(&self, node_id: impl Into<String>, addr: SocketAddr) {
        self.peers.lock().unwrap().insert(node_id.into(), addr);
    }

    pub fn remove_peer(&self, node_id: &str) -> bool {
        self.peers.lock().unwrap().remove(node_id).is_some()
    }

    pub fn peers(&self) -> HashMap<String, SocketAddr> {
        self.peers.lock().unwrap().clone()
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Stamp sequence/timestamp and send: unicast for a known destination,
    /// multicast for broadcast.
    pub async fn send(&self, mut message: ProtocolMessage) -> Result<()> {
        message.source_id = self.node_id.clone();
        message.sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        if message.timestamp_ns == 0 {
            message.timestamp_ns = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64;
        }
        let frame = encode_message(&message);

        let target: SocketAddr = if message.is_broadcast() {
            (self.config.multicast_group, self.config.multicast_port).into()
        } else {
            match self.peers.lock().unwrap().get(&message.dest_id) {
                Some(addr) => *addr,
                None => {
                    return Err(PipelineError::Configuration(format!(
                        "unknown destination node '{}'",
                        message.dest_id
                    )))
                }
            }
        };

        self.socket.send_to(&frame, target).await?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn spawn_receive_loop(self: &Arc<Self>, tx: mpsc::Sender<Incoming>) {
        let socket = self.socket.clone();
        let peers = self.peers.clone();
        let node_id = self.node_id.clone();
        let received = self.received.clone();
        let rejected = self.rejected.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                let (len, from) = match socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(e) => {
                        // Never crash the protocol on a socket hiccup
                        warn!("transport recv error: {e}");
                        continue;
                    }
                };
                let message = match decode_message(&buf[..len]) {
                    Ok(m) => m,
                    Err(e) => {
                        rejected.fetch_add(1, Ordering::Relaxed);
                        debug!("dropping malformed frame from {from}: {e}");
                        continue;
                    }
                };
                // Multicast loopback returns our own frames
                if message.source_id == node_id {
                    continue;
                }
                received.fetch_add(1, Ordering::Relaxed);

                // Learn the sender's address for future unicast
                if !message.source_id.is_empty() {
                    peers
                        .lock()
                        .unwrap()
                        .entry(message.source_id.clone())
                        .or_insert(from);
                }

                if tx.send(Incoming { message, from }).await.is_err() {
                    // Protocol layer is gone, stop receiving
                    return;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample_message() -> ProtocolMessage {
        ProtocolMessage {
            msg_type: MessageType::TimeReference,
            source_id: "node-a".into(),
            dest_id: "node-b".into(),
            timestamp_ns: 1_234_567_890_123,
            sequence: 42,
            payload: Bytes::from_static(b"{\"k\":1}"),
            signature: Bytes::new(),
        }
    }

    #[test]
    fn frame_round_trips() {
        let message = sample_message();
        let frame = encode_message(&message);
        let decoded = decode_message(&frame).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn frame_layout_is_little_endian_per_field() {
        let message = ProtocolMessage {
            msg_type: MessageType::Alert,
            source_id: "ab".into(),
            dest_id: String::new(),
            timestamp_ns: 0x0102030405060708,
            sequence: 0x0A0B0C0D,
            payload: Bytes::from_static(&[0xFF]),
            signature: Bytes::new(),
        };
        let frame = encode_message(&message);
        let mut expected = vec![8u8]; // Alert
        expected.extend_from_slice(&[2, 0]); // src len
        expected.extend_from_slice(b"ab");
        expected.extend_from_slice(&[0, 0]); // dst len (broadcast)
        expected.extend_from_slice(&0x0102030405060708u64.to_le_bytes());
        expected.extend_from_slice(&0x0A0B0C0Du32.to_le_bytes());
        expected.extend_from_slice(&1u32.to_le_bytes());
        expected.push(0xFF);
        expected.extend_from_slice(&[0, 0]); // sig len
        assert_eq!(&frame[..], &expected[..]);
    }

    #[test]
    fn truncated_and_garbled_frames_are_rejected() {
        let frame = encode_message(&sample_message());
        for cut in [0, 1, 5, frame.len() - 1] {
            assert!(decode_message(&frame[..cut]).is_err(), "cut at {cut} must fail");
        }
        // Unknown message type
        let mut bad = frame.to_vec();
        bad[0] = 200;
        assert!(decode_message(&bad).is_err());
        // Trailing junk
        let mut long = frame.to_vec();
        long.push(0);
        assert!(decode_message(&long).is_err());
    }

    #[test]
    fn empty_dest_means_broadcast() {
        let message = ProtocolMessage::broadcast(
            MessageType::StatusUpdate,
            "node-a",
            Bytes::from_static(b"x"),
        );
        assert!(message.is_broadcast());
        let direct =
            ProtocolMessage::to(MessageType::SyncRequest, "node-a", "node-b", Bytes::new());
        assert!(!direct.is_broadcast());
    }

    #[tokio::test]
    async fn transport_delivers_unicast_and_learns_peers() {
        let (a, _rx_a) = UdpTransport::bind("node-a", TransportConfig::default()).await.unwrap();
        let (b, mut rx_b) = UdpTransport::bind("node-b", TransportConfig::default()).await.unwrap();

        a.add_peer("node-b", format!("127.0.0.1:{}", b.local_port()).parse().unwrap());
        a.send(ProtocolMessage::to(
            MessageType::SyncRequest,
            "ignored",
            "node-b",
            Bytes::from_static(b"ping"),
        ))
        .await
        .unwrap();

        let incoming =
            tokio::time::timeout(Duration::from_secs(2), rx_b.recv()).await.unwrap().unwrap();
        assert_eq!(incoming.message.msg_type, MessageType::SyncRequest);
        assert_eq!(incoming.message.source_id, "node-a");
        assert_eq!(incoming.message.payload, Bytes::from_static(b"ping"));

        // node-b learned node-a's address from the traffic
        assert!(b.peers().contains_key("node-a"));
        assert_eq!(a.stats().sent, 1);
        assert_eq!(b.stats().received, 1);

        // Unknown destination is a configuration error
        assert!(a
            .send(ProtocolMessage::to(MessageType::Alert, "x", "ghost", Bytes::new()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn sequence_numbers_increase_per_sender() {
        let (a, _rx_a) = UdpTransport::bind("node-a", TransportConfig::default()).await.unwrap();
        let (b, mut rx_b) = UdpTransport::bind("node-b", TransportConfig::default()).await.unwrap();
        a.add_peer("node-b", format!("127.0.0.1:{}", b.local_port()).parse().unwrap());

        for _ in 0..3 {
            a.send(ProtocolMessage::to(MessageType::StatusUpdate, "", "node-b", Bytes::new()))
                .await
                .unwrap();
        }
        let mut sequences = Vec::new();
        for _ in 0..3 {
            let incoming =
                tokio::time::timeout(Duration::from_secs(2), rx_b.recv()).await.unwrap().unwrap();
            sequences.push(incoming.message.sequence);
        }
        assert_eq!(sequences, vec![0, 1, 2]);
    }
}
