//! Per-peer WireGuard Tunnel
//!
//! Each configured peer gets a [`PeerTunnel`]: a background task that owns
//! the peer's boringtun [`Tunn`] and is fed the datagrams the engine
//! demultiplexes to it.
//!
//! # Timers
//!
//! boringtun's `update_timers` runs every 250 ms and takes care of handshake
//! retransmission (every 5 s), persistent keepalives and session expiry. On
//! top of that:
//!
//! - a new handshake is started `REKEY_AFTER` the last one completed
//! - a peer whose handshake attempts expire starts over, so unreachable
//!   peers keep retrying
//! - with no completed handshake for `handshake_timeout` the peer is
//!   `ConnectionLost`

use crate::config::PeerConfig;
use crate::error::EngineError;
use crate::keys::{PresharedKey, PrivateKey, PublicKey};
use boringtun::noise::errors::WireGuardError;
use boringtun::noise::{Packet, Tunn, TunnResult};
use boringtun::x25519;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Session age after which a new handshake is started
pub const REKEY_AFTER: Duration = Duration::from_secs(120);

const TICK: Duration = Duration::from_millis(250);

/// Largest datagram handled
pub(crate) const MAX_PACKET: usize = 65536;

/// Queue depth between the engine's socket reader and a peer task
pub(crate) const INBOX_DEPTH: usize = 64;

/// Tunnel state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Tunnel is not running
    Disconnected,
    /// Waiting for the first handshake response
    Connecting,
    /// Tunnel is active
    Connected,
    /// Handshake failed
    HandshakeFailed,
    /// No handshake completed within the handshake timeout
    ConnectionLost,
}

impl TunnelState {
    /// Check if tunnel is usable
    pub fn is_connected(&self) -> bool {
        matches!(self, TunnelState::Connected)
    }

    /// Check if tunnel is in an error state
    pub fn is_error(&self) -> bool {
        matches!(self, TunnelState::HandshakeFailed | TunnelState::ConnectionLost)
    }
}

/// Tunnel statistics
#[derive(Debug, Clone, Default)]
pub struct TunnelStats {
    /// Bytes sent to the peer
    pub bytes_sent: u64,
    /// Bytes received from the peer
    pub bytes_received: u64,
    /// Datagrams sent
    pub packets_sent: u64,
    /// Datagrams received
    pub packets_received: u64,
    /// Handshakes completed
    pub handshakes: u64,
    /// Last handshake time
    pub last_handshake: Option<Instant>,
}

impl TunnelStats {
    /// Format as human-readable string
    pub fn format(&self) -> String {
        let since = self
            .last_handshake
            .map(|t| format!("{}s ago", t.elapsed().as_secs()))
            .unwrap_or_else(|| "never".to_string());
        format!(
            "TX: {:.2}MB ({} pkts), RX: {:.2}MB ({} pkts), handshakes: {} (last {})",
            self.bytes_sent as f64 / (1024.0 * 1024.0),
            self.packets_sent,
            self.bytes_received as f64 / (1024.0 * 1024.0),
            self.packets_received,
            self.handshakes,
            since
        )
    }

    /// Add another peer's counters into this one
    pub fn merge(&mut self, other: &TunnelStats) {
        self.bytes_sent += other.bytes_sent;
        self.bytes_received += other.bytes_received;
        self.packets_sent += other.packets_sent;
        self.packets_received += other.packets_received;
        self.handshakes += other.handshakes;
        self.last_handshake = match (self.last_handshake, other.last_handshake) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }
}

/// Static secret in boringtun's key type
pub(crate) fn static_secret(key: &PrivateKey) -> x25519::StaticSecret {
    x25519::StaticSecret::from(key.to_bytes())
}

/// Create the boringtun state for one peer. Indices it allocates carry
/// `index` in their upper 24 bits.
pub(crate) fn new_tunn(
    local: &PrivateKey,
    remote: &PublicKey,
    psk: Option<&PresharedKey>,
    keepalive: Option<u16>,
    index: u32,
) -> Result<Tunn, EngineError> {
    Tunn::new(
        static_secret(local),
        x25519::PublicKey::from(remote.to_bytes()),
        psk.map(|k| *k.as_bytes()),
        keepalive,
        index,
        None,
    )
    .map_err(|e| EngineError::InvalidKey(format!("peer {}: {}", remote, e)))
}

/// Running tunnel to one peer
pub struct PeerTunnel {
    public_key: PublicKey,
    endpoint: SocketAddr,
    state: watch::Receiver<TunnelState>,
    stats: Arc<RwLock<TunnelStats>>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PeerTunnel {
    /// Start the peer task. Incoming datagrams for this peer arrive on
    /// `inbox`; `index` is the peer's 24-bit receiver index slot.
    pub(crate) fn spawn(
        local: &PrivateKey,
        peer: &PeerConfig,
        endpoint: SocketAddr,
        socket: Arc<UdpSocket>,
        inbox: mpsc::Receiver<Vec<u8>>,
        index: u32,
        handshake_timeout: Duration,
    ) -> Result<Self, EngineError> {
        let keepalive = peer
            .keepalive_interval()
            .and_then(|d| u16::try_from(d.as_secs()).ok());
        let tunn = new_tunn(
            local,
            &peer.public_key,
            peer.preshared_key.as_ref(),
            keepalive,
            index,
        )?;

        let (state_tx, state_rx) = watch::channel(TunnelState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(RwLock::new(TunnelStats::default()));

        let driver = Driver {
            tunn,
            remote: peer.public_key,
            endpoint,
            socket,
            inbox,
            shutdown: shutdown_rx,
            state: state_tx,
            stats: stats.clone(),
            handshake_timeout,
        };

        info!(peer = %peer.public_key, %endpoint, "Starting peer tunnel");
        let task = tokio::spawn(driver.run());

        Ok(Self {
            public_key: peer.public_key,
            endpoint,
            state: state_rx,
            stats,
            shutdown: shutdown_tx,
            task,
        })
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// Get current state
    pub fn state(&self) -> TunnelState {
        *self.state.borrow()
    }

    /// Get statistics
    pub async fn stats(&self) -> TunnelStats {
        self.stats.read().await.clone()
    }

    /// Wait until the first handshake completes; `false` on timeout.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.state.clone();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(TunnelState::is_connected)).await,
            Ok(Ok(_))
        )
    }

    /// Stop the peer task and wait for it to finish
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(peer = %self.public_key, "Peer task ended abnormally: {}", e);
        }
        debug!(peer = %self.public_key, "Peer tunnel stopped");
    }
}

struct Driver {
    tunn: Tunn,
    remote: PublicKey,
    endpoint: SocketAddr,
    socket: Arc<UdpSocket>,
    inbox: mpsc::Receiver<Vec<u8>>,
    shutdown: watch::Receiver<bool>,
    state: watch::Sender<TunnelState>,
    stats: Arc<RwLock<TunnelStats>>,
    handshake_timeout: Duration,
}

impl Driver {
    async fn run(mut self) {
        let mut buf = vec![0u8; MAX_PACKET];
        self.initiate(&mut buf, false).await;

        let mut tick = tokio::time::interval(TICK);
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,
                Some(packet) = self.inbox.recv() => self.handle(&packet, &mut buf).await,
                _ = tick.tick() => self.on_tick(&mut buf).await,
            }
        }

        self.state.send_replace(TunnelState::Disconnected);
    }

    async fn send(&mut self, msg: &[u8]) {
        match self.socket.send_to(msg, self.endpoint).await {
            Ok(n) => {
                let mut stats = self.stats.write().await;
                stats.bytes_sent += n as u64;
                stats.packets_sent += 1;
            }
            Err(e) => warn!(peer = %self.remote, "Send to {} failed: {}", self.endpoint, e),
        }
    }

    async fn initiate(&mut self, buf: &mut [u8], force: bool) {
        match self.tunn.format_handshake_initiation(buf, force) {
            TunnResult::WriteToNetwork(msg) => {
                debug!(peer = %self.remote, "Sending handshake initiation");
                self.send(msg).await;
            }
            TunnResult::Err(e) => {
                warn!(peer = %self.remote, "Cannot build handshake: {:?}", e);
                self.state.send_replace(TunnelState::HandshakeFailed);
            }
            _ => {}
        }
    }

    async fn handle(&mut self, packet: &[u8], buf: &mut [u8]) {
        {
            let mut stats = self.stats.write().await;
            stats.bytes_received += packet.len() as u64;
            stats.packets_received += 1;
        }

        let (completes_handshake, is_data) = match Tunn::parse_incoming_packet(packet) {
            Ok(Packet::HandshakeResponse(_)) | Ok(Packet::HandshakeInit(_)) => (true, false),
            Ok(Packet::PacketCookieReply(_)) => (false, false),
            Ok(Packet::PacketData(_)) => (false, true),
            Err(e) => {
                debug!(peer = %self.remote, len = packet.len(), "Ignoring malformed datagram: {:?}", e);
                return;
            }
        };

        let mut first = true;
        loop {
            let result = if first {
                self.tunn.decapsulate(Some(self.endpoint.ip()), packet, buf)
            } else {
                self.tunn.decapsulate(None, &[], buf)
            };

            match result {
                TunnResult::WriteToNetwork(msg) => {
                    if first && completes_handshake {
                        self.on_handshake().await;
                    }
                    self.send(msg).await;
                }
                TunnResult::WriteToTunnelV4(data, _) | TunnResult::WriteToTunnelV6(data, _) => {
                    debug!(peer = %self.remote, len = data.len(), "Transport data received");
                    break;
                }
                TunnResult::Done => {
                    if first && completes_handshake {
                        self.on_handshake().await;
                    } else if first && is_data {
                        debug!(peer = %self.remote, "Keepalive received");
                    }
                    break;
                }
                TunnResult::Err(e) => {
                    debug!(peer = %self.remote, "Dropped datagram: {:?}", e);
                    break;
                }
            }
            first = false;
        }
    }

    async fn on_handshake(&mut self) {
        {
            let mut stats = self.stats.write().await;
            stats.handshakes += 1;
            stats.last_handshake = Some(Instant::now());
        }
        if self.state.send_replace(TunnelState::Connected) != TunnelState::Connected {
            info!(peer = %self.remote, "Handshake completed, peer connected");
        } else {
            debug!(peer = %self.remote, "Session rekeyed");
        }
    }

    async fn on_tick(&mut self, buf: &mut [u8]) {
        match self.tunn.update_timers(buf) {
            TunnResult::WriteToNetwork(msg) => self.send(msg).await,
            TunnResult::Err(WireGuardError::ConnectionExpired) => {
                debug!(peer = %self.remote, "Handshake attempts expired, starting over");
                self.initiate(buf, true).await;
            }
            TunnResult::Err(e) => debug!(peer = %self.remote, "Timer error: {:?}", e),
            _ => {}
        }

        let current = *self.state.borrow();
        if current == TunnelState::HandshakeFailed {
            return;
        }

        let age = self.tunn.time_since_last_handshake();
        if age.is_some_and(|a| a >= REKEY_AFTER) {
            // No-op while a handshake is already in flight
            self.initiate(buf, false).await;
        }

        let lost = match age {
            Some(a) => a >= self.handshake_timeout,
            None => current == TunnelState::Connected,
        };
        if lost && current == TunnelState::Connected {
            warn!(peer = %self.remote, "No handshake for {:?}, connection lost", self.handshake_timeout);
            self.state.send_replace(TunnelState::ConnectionLost);
        }
    }
}
