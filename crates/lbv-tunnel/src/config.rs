//! Tunnel Configuration
//!
//! The validated, in-memory form of an `[Interface]` / `[Peer]`
//! configuration block. Values of these types are produced by
//! [`parse`](crate::parse) and written back out by their `Display`
//! implementations in the same textual format.

use crate::keys::{PresharedKey, PrivateKey, PublicKey};
use ipnet::IpNet;
use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::time::Duration;

/// Standard WireGuard UDP port, used when an endpoint omits one
pub const DEFAULT_PORT: u16 = 51820;

/// Peer endpoint (host + UDP port)
///
/// The host is kept as written: either a literal address or a name that is
/// resolved when the tunnel starts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Address literal or host name
    pub host: String,
    /// UDP port
    pub port: u16,
}

impl Endpoint {
    /// Create a new endpoint
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Create from a socket address
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }

    /// The host as an IP address, if it is a literal
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    /// Resolve to the first socket address for this endpoint
    pub async fn resolve(&self) -> std::io::Result<SocketAddr> {
        if let Some(ip) = self.ip() {
            return Ok(SocketAddr::new(ip, self.port));
        }

        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no addresses for {}", self.host),
                )
            })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parse `host:port`, `[v6]:port`, or a bare host (default port).
pub(crate) fn parse_endpoint(value: &str) -> Option<Endpoint> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Some(rest) = value.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        host.parse::<Ipv6Addr>().ok()?;
        let port = match after {
            "" => DEFAULT_PORT,
            p => p.strip_prefix(':')?.parse().ok()?,
        };
        return Some(Endpoint::new(host, port));
    }

    // Unbracketed v6 literal without a port
    if value.parse::<Ipv6Addr>().is_ok() {
        return Some(Endpoint::new(value, DEFAULT_PORT));
    }

    match value.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !host.contains(':') => {
            Some(Endpoint::new(host, port.parse().ok()?))
        }
        Some(_) => None,
        None => Some(Endpoint::new(value, DEFAULT_PORT)),
    }
}

/// One entry of the interface `DNS` list
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DnsEntry {
    /// Name server address
    Server(IpAddr),
    /// Search domain
    SearchDomain(String),
}

impl fmt::Display for DnsEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DnsEntry::Server(ip) => write!(f, "{}", ip),
            DnsEntry::SearchDomain(domain) => f.write_str(domain),
        }
    }
}

/// Classify a `DNS` list item; `None` if it is neither an address nor a
/// plausible domain name.
pub(crate) fn parse_dns_entry(value: &str) -> Option<DnsEntry> {
    if let Ok(ip) = value.parse::<IpAddr>() {
        return Some(DnsEntry::Server(ip));
    }

    let valid_domain = !value.is_empty()
        && value.len() <= 253
        && value.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        });

    valid_domain.then(|| DnsEntry::SearchDomain(value.to_string()))
}

/// The local side of the tunnel (`[Interface]`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    /// Our private key
    pub private_key: PrivateKey,
    /// Addresses assigned to the tunnel interface
    pub addresses: Vec<IpNet>,
    /// DNS servers and search domains to use inside the tunnel
    pub dns: Vec<DnsEntry>,
    /// Fixed local UDP port (random if unset)
    pub listen_port: Option<u16>,
    /// Interface MTU
    pub mtu: Option<u16>,
}

impl InterfaceConfig {
    /// Create an interface with a key and one address
    pub fn new(private_key: PrivateKey, address: IpNet) -> Self {
        Self {
            private_key,
            addresses: vec![address],
            dns: Vec::new(),
            listen_port: None,
            mtu: None,
        }
    }

    /// Our public key, derived from the private key
    pub fn public_key(&self) -> PublicKey {
        self.private_key.public_key()
    }

    /// DNS server addresses only
    pub fn dns_servers(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.dns.iter().filter_map(|d| match d {
            DnsEntry::Server(ip) => Some(*ip),
            DnsEntry::SearchDomain(_) => None,
        })
    }

    /// DNS search domains only
    pub fn search_domains(&self) -> impl Iterator<Item = &str> + '_ {
        self.dns.iter().filter_map(|d| match d {
            DnsEntry::Server(_) => None,
            DnsEntry::SearchDomain(domain) => Some(domain.as_str()),
        })
    }
}

/// WireGuard peer configuration (`[Peer]`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// Peer's public key
    pub public_key: PublicKey,
    /// Peer's endpoint
    pub endpoint: Endpoint,
    /// Allowed IPs (what traffic to route through this peer)
    pub allowed_ips: Vec<IpNet>,
    /// Persistent keepalive interval (seconds)
    pub persistent_keepalive: Option<u16>,
    /// Preshared key mixed into the handshake
    pub preshared_key: Option<PresharedKey>,
}

impl PeerConfig {
    /// Create a new peer configuration with no allowed IPs
    pub fn new(public_key: PublicKey, endpoint: Endpoint) -> Self {
        Self {
            public_key,
            endpoint,
            allowed_ips: Vec::new(),
            persistent_keepalive: None,
            preshared_key: None,
        }
    }

    /// Add an allowed IP range
    pub fn with_allowed_ip(mut self, net: IpNet) -> Self {
        self.allowed_ips.push(net);
        self
    }

    /// Set persistent keepalive
    pub fn with_keepalive(mut self, seconds: u16) -> Self {
        self.persistent_keepalive = Some(seconds);
        self
    }

    /// Keepalive as a duration
    pub fn keepalive_interval(&self) -> Option<Duration> {
        self.persistent_keepalive
            .filter(|s| *s > 0)
            .map(|s| Duration::from_secs(u64::from(s)))
    }
}

/// Complete tunnel configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    pub interface: InterfaceConfig,
    pub peers: Vec<PeerConfig>,
}

impl Configuration {
    /// Create a configuration with no peers
    pub fn new(interface: InterfaceConfig) -> Self {
        Self {
            interface,
            peers: Vec::new(),
        }
    }

    /// Add a peer
    pub fn with_peer(mut self, peer: PeerConfig) -> Self {
        self.peers.push(peer);
        self
    }

    /// Find a peer by public key
    pub fn peer(&self, public_key: &PublicKey) -> Option<&PeerConfig> {
        self.peers.iter().find(|p| &p.public_key == public_key)
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for InterfaceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[Interface]")?;
        writeln!(f, "PrivateKey = {}", self.private_key.to_base64())?;
        writeln!(f, "Address = {}", join(&self.addresses))?;
        if !self.dns.is_empty() {
            writeln!(f, "DNS = {}", join(&self.dns))?;
        }
        if let Some(port) = self.listen_port {
            writeln!(f, "ListenPort = {}", port)?;
        }
        if let Some(mtu) = self.mtu {
            writeln!(f, "MTU = {}", mtu)?;
        }
        Ok(())
    }
}

impl fmt::Display for PeerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[Peer]")?;
        writeln!(f, "PublicKey = {}", self.public_key)?;
        if let Some(psk) = &self.preshared_key {
            writeln!(f, "PresharedKey = {}", psk.to_base64())?;
        }
        writeln!(f, "Endpoint = {}", self.endpoint)?;
        if let Some(keepalive) = self.persistent_keepalive {
            writeln!(f, "PersistentKeepalive = {}", keepalive)?;
        }
        if !self.allowed_ips.is_empty() {
            writeln!(f, "AllowedIPs = {}", join(&self.allowed_ips))?;
        }
        Ok(())
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.interface)?;
        for peer in &self.peers {
            writeln!(f)?;
            write!(f, "{}", peer)?;
        }
        Ok(())
    }
}
