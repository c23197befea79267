//! Tunnel Engine
//!
//! The [`TunnelEngine`] trait is the seam between session bookkeeping and
//! the machinery that actually moves packets. [`WireGuardEngine`] is the
//! userspace implementation: one UDP socket per address family shared by
//! all peers, with datagrams routed to the owning [`PeerTunnel`] by the
//! receiver index in their header.

use crate::config::{Configuration, Endpoint};
use crate::error::EngineError;
use crate::keys::PublicKey;
use crate::routes::RouteTable;
use crate::system::SystemConfiguration;
use crate::tunnel::{static_secret, PeerTunnel, TunnelState, TunnelStats, INBOX_DEPTH, MAX_PACKET};
use async_trait::async_trait;
use boringtun::noise::handshake::parse_handshake_anon;
use boringtun::noise::{Packet, Tunn};
use boringtun::x25519;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// MTU used when neither the interface nor the system configuration sets one
pub const DEFAULT_MTU: u16 = 1420;

/// How many of a tunnel's peers currently have a live session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connectivity {
    pub connected: usize,
    pub total: usize,
}

impl Connectivity {
    /// Every peer connected (trivially true with no peers)
    pub fn is_complete(&self) -> bool {
        self.connected == self.total
    }
}

/// Snapshot of one peer of a running tunnel
#[derive(Debug, Clone)]
pub struct PeerStatus {
    pub public_key: PublicKey,
    pub endpoint: Endpoint,
    pub state: TunnelState,
}

/// Starts tunnels from validated configurations
#[async_trait]
pub trait TunnelEngine: Send + Sync {
    /// Bring a tunnel up. Returns once it is usable or has definitely failed.
    async fn start(
        &self,
        config: Arc<Configuration>,
        system: &SystemConfiguration,
    ) -> Result<Box<dyn ActiveTunnel>, EngineError>;
}

/// A running tunnel, owned by exactly one session
#[async_trait]
pub trait ActiveTunnel: Send + Sync {
    fn connectivity(&self) -> Connectivity;

    /// Peer whose allowed IPs cover `dst`
    fn route(&self, dst: IpAddr) -> Option<PublicKey>;

    fn peers(&self) -> Vec<PeerStatus>;

    /// Effective interface MTU
    fn mtu(&self) -> u16;

    /// Counters summed over all peers
    async fn stats(&self) -> TunnelStats;

    /// Tear down and wait until every background task has finished
    async fn stop(self: Box<Self>) -> Result<(), EngineError>;
}

/// Userspace WireGuard engine
#[derive(Debug, Default)]
pub struct WireGuardEngine;

impl WireGuardEngine {
    pub fn new() -> Self {
        Self
    }
}

/// Reject peer keys that can never complete a handshake with us
fn validate_keys(config: &Configuration) -> Result<(), EngineError> {
    let own = config.interface.public_key();
    for peer in &config.peers {
        if peer.public_key == own {
            return Err(EngineError::InvalidKey(format!(
                "peer {} is the interface's own key",
                peer.public_key
            )));
        }
        if config.interface.private_key.diffie_hellman(&peer.public_key).is_none() {
            return Err(EngineError::InvalidKey(format!(
                "peer {} is not a usable Curve25519 point",
                peer.public_key
            )));
        }
    }
    Ok(())
}

/// Routes datagrams from the shared sockets to peer tasks
struct Demux {
    secret: x25519::StaticSecret,
    public: x25519::PublicKey,
    /// Receiver index slot -> peer inbox
    inboxes: HashMap<u32, mpsc::Sender<Vec<u8>>>,
    /// Peer static key -> slot, for initiations the peer sends us
    slots: HashMap<[u8; 32], u32>,
}

impl Demux {
    fn slot(&self, packet: &[u8]) -> Option<u32> {
        match Tunn::parse_incoming_packet(packet).ok()? {
            Packet::HandshakeInit(init) => {
                let half = parse_handshake_anon(&self.secret, &self.public, &init).ok()?;
                self.slots.get(&half.peer_static_public).copied()
            }
            Packet::HandshakeResponse(p) => Some(p.receiver_idx >> 8),
            Packet::PacketCookieReply(p) => Some(p.receiver_idx >> 8),
            Packet::PacketData(p) => Some(p.receiver_idx >> 8),
        }
    }

    fn inbox(&self, packet: &[u8]) -> Option<&mpsc::Sender<Vec<u8>>> {
        self.inboxes.get(&self.slot(packet)?)
    }
}

/// Bind one socket per address family. IPv6 sockets are v6-only so both
/// families can share a fixed `ListenPort`.
fn bind(family_v6: bool, port: u16) -> Result<Arc<UdpSocket>, EngineError> {
    let (domain, addr): (Domain, SocketAddr) = if family_v6 {
        (Domain::IPV6, (Ipv6Addr::UNSPECIFIED, port).into())
    } else {
        (Domain::IPV4, (Ipv4Addr::UNSPECIFIED, port).into())
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if family_v6 {
        socket.set_only_v6(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    let socket = UdpSocket::from_std(socket.into())?;
    debug!("Bound tunnel socket {}", socket.local_addr()?);
    Ok(Arc::new(socket))
}

/// Read datagrams and hand each to the peer it belongs to
fn spawn_reader(
    socket: Arc<UdpSocket>,
    demux: Arc<Demux>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_PACKET];
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok((n, from)) => {
                        let packet = &buf[..n];
                        match demux.inbox(packet) {
                            Some(inbox) => {
                                if inbox.try_send(packet.to_vec()).is_err() {
                                    debug!("Peer inbox full, dropping datagram from {}", from);
                                }
                            }
                            None => debug!(len = n, "Unroutable datagram from {}", from),
                        }
                    }
                    Err(e) => {
                        // ICMP errors surface here on some platforms
                        debug!("Socket receive error: {}", e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
            }
        }
    })
}

#[async_trait]
impl TunnelEngine for WireGuardEngine {
    async fn start(
        &self,
        config: Arc<Configuration>,
        system: &SystemConfiguration,
    ) -> Result<Box<dyn ActiveTunnel>, EngineError> {
        validate_keys(&config)?;

        // A peer whose endpoint does not resolve is failed, not fatal
        let mut reachable = Vec::with_capacity(config.peers.len());
        let mut unresolved = Vec::new();
        for peer in &config.peers {
            match peer.endpoint.resolve().await {
                Ok(addr) => reachable.push((peer, addr)),
                Err(e) => {
                    let err = EngineError::Resolve {
                        endpoint: peer.endpoint.to_string(),
                        reason: e.to_string(),
                    };
                    warn!(peer = %peer.public_key, "{}", err);
                    unresolved.push((peer.public_key, peer.endpoint.clone(), err));
                }
            }
        }

        let port = config.interface.listen_port.unwrap_or(0);
        let mut sockets: HashMap<bool, Arc<UdpSocket>> = HashMap::new();
        for (_, addr) in &reachable {
            let v6 = addr.is_ipv6();
            if !sockets.contains_key(&v6) {
                sockets.insert(v6, bind(v6, port)?);
            }
        }

        // Random 24-bit offset so indices differ between tunnels
        let offset: u32 = rand::random::<u32>() & 0x00ff_ffff;
        let secret = static_secret(&config.interface.private_key);
        let mut demux = Demux {
            public: x25519::PublicKey::from(&secret),
            secret,
            inboxes: HashMap::new(),
            slots: HashMap::new(),
        };
        let mut peers = Vec::with_capacity(reachable.len());
        for (i, (peer, addr)) in reachable.iter().enumerate() {
            let Some(socket) = sockets.get(&addr.is_ipv6()).cloned() else {
                continue;
            };
            let slot = (offset.wrapping_add(i as u32)) & 0x00ff_ffff;
            let (tx, rx) = mpsc::channel(INBOX_DEPTH);
            demux.inboxes.insert(slot, tx);
            demux.slots.insert(peer.public_key.to_bytes(), slot);

            let spawned = PeerTunnel::spawn(
                &config.interface.private_key,
                peer,
                *addr,
                socket,
                rx,
                slot,
                system.handshake_timeout(),
            );
            match spawned {
                Ok(tunnel) => peers.push((tunnel, peer.endpoint.clone())),
                Err(e) => {
                    for (tunnel, _) in peers {
                        tunnel.stop().await;
                    }
                    return Err(e);
                }
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let demux = Arc::new(demux);
        let readers = sockets
            .into_values()
            .map(|socket| spawn_reader(socket, demux.clone(), shutdown_rx.clone()))
            .collect();

        let tunnel = WireGuardTunnel {
            routes: RouteTable::from_config(&config),
            mtu: config
                .interface
                .mtu
                .or(system.default_mtu)
                .unwrap_or(DEFAULT_MTU),
            peers,
            unresolved: unresolved
                .iter()
                .map(|(key, endpoint, _)| (*key, endpoint.clone()))
                .collect(),
            readers,
            shutdown: shutdown_tx,
        };

        // Peers handshake concurrently; share one deadline
        let connect_timeout = system.connect_timeout();
        let deadline = tokio::time::Instant::now().checked_add(connect_timeout);
        for (peer, _) in &tunnel.peers {
            let remaining = match deadline {
                Some(d) => d.saturating_duration_since(tokio::time::Instant::now()),
                None => connect_timeout,
            };
            if !peer.wait_connected(remaining).await {
                warn!(peer = %peer.public_key(), "No handshake response from {}", peer.endpoint());
            }
        }

        let connectivity = tunnel.connectivity();
        if connectivity.total > 0 && connectivity.connected == 0 {
            error!("No peer answered within {:?}", connect_timeout);
            let total = connectivity.total;
            Box::new(tunnel).stop().await?;

            let mut reason = format!(
                "none of {} peer(s) answered within {}s",
                total, system.connect_timeout_secs
            );
            for (_, _, err) in &unresolved {
                reason.push_str(&format!("; {}", err));
            }
            return Err(EngineError::HandshakeFailed(reason));
        }

        info!(
            connected = connectivity.connected,
            total = connectivity.total,
            mtu = tunnel.mtu,
            "Tunnel up"
        );
        Ok(Box::new(tunnel))
    }
}

/// A running WireGuard tunnel
pub struct WireGuardTunnel {
    routes: RouteTable,
    mtu: u16,
    peers: Vec<(PeerTunnel, Endpoint)>,
    /// Peers whose endpoint could not be resolved at start
    unresolved: Vec<(PublicKey, Endpoint)>,
    readers: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

#[async_trait]
impl ActiveTunnel for WireGuardTunnel {
    fn connectivity(&self) -> Connectivity {
        Connectivity {
            connected: self
                .peers
                .iter()
                .filter(|(p, _)| p.state().is_connected())
                .count(),
            total: self.peers.len() + self.unresolved.len(),
        }
    }

    fn route(&self, dst: IpAddr) -> Option<PublicKey> {
        self.routes.lookup(dst).copied()
    }

    fn peers(&self) -> Vec<PeerStatus> {
        let running = self.peers.iter().map(|(p, endpoint)| PeerStatus {
            public_key: *p.public_key(),
            endpoint: endpoint.clone(),
            state: p.state(),
        });
        let failed = self.unresolved.iter().map(|(key, endpoint)| PeerStatus {
            public_key: *key,
            endpoint: endpoint.clone(),
            state: TunnelState::HandshakeFailed,
        });
        running.chain(failed).collect()
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    async fn stats(&self) -> TunnelStats {
        let mut total = TunnelStats::default();
        for (peer, _) in &self.peers {
            total.merge(&peer.stats().await);
        }
        total
    }

    async fn stop(self: Box<Self>) -> Result<(), EngineError> {
        let this = *self;
        let _ = this.shutdown.send(true);

        for (peer, _) in this.peers {
            peer.stop().await;
        }

        let mut failed = 0;
        for reader in this.readers {
            if let Err(e) = reader.await {
                warn!("Socket reader ended abnormally: {}", e);
                failed += 1;
            }
        }

        if failed > 0 {
            return Err(EngineError::Io(format!("{} socket reader(s) failed", failed)));
        }
        debug!("Tunnel stopped");
        Ok(())
    }
}
