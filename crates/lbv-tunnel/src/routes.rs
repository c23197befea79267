//! Allowed-IP routing
//!
//! Maps a destination address to the peer whose `AllowedIPs` contain it,
//! preferring the most specific range.

use crate::config::Configuration;
use crate::keys::PublicKey;
use ipnet::IpNet;
use std::net::IpAddr;

/// Longest-prefix match table over every peer's allowed ranges
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    // Sorted by prefix length, longest first; ties keep configuration order
    entries: Vec<(IpNet, PublicKey)>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the peers of a configuration
    pub fn from_config(config: &Configuration) -> Self {
        let mut table = Self::new();
        for peer in &config.peers {
            for net in &peer.allowed_ips {
                table.insert(*net, peer.public_key);
            }
        }
        table
    }

    /// Add a range owned by `peer`
    pub fn insert(&mut self, net: IpNet, peer: PublicKey) {
        let net = net.trunc();
        let pos = self
            .entries
            .iter()
            .position(|(n, _)| n.prefix_len() < net.prefix_len())
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, (net, peer));
    }

    /// Peer responsible for `dst`, if any
    pub fn lookup(&self, dst: IpAddr) -> Option<&PublicKey> {
        self.entries
            .iter()
            .find(|(net, _)| net.contains(&dst))
            .map(|(_, peer)| peer)
    }

    /// Drop every range owned by `peer`
    pub fn remove_peer(&mut self, peer: &PublicKey) {
        self.entries.retain(|(_, p)| p != peer);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_longest_prefix_wins() {
        let default = KeyPair::generate().public;
        let office = KeyPair::generate().public;
        let host = KeyPair::generate().public;

        let mut table = RouteTable::new();
        table.insert("0.0.0.0/0".parse().unwrap(), default);
        table.insert("192.168.91.0/24".parse().unwrap(), office);
        table.insert("192.168.91.7/32".parse().unwrap(), host);

        assert_eq!(table.lookup(ip("8.8.8.8")), Some(&default));
        assert_eq!(table.lookup(ip("192.168.91.1")), Some(&office));
        assert_eq!(table.lookup(ip("192.168.91.7")), Some(&host));
        assert_eq!(table.lookup(ip("fd00::1")), None);
    }

    #[test]
    fn test_host_bits_ignored() {
        let peer = KeyPair::generate().public;
        let mut table = RouteTable::new();
        table.insert("10.1.2.3/16".parse().unwrap(), peer);
        assert_eq!(table.lookup(ip("10.1.200.1")), Some(&peer));
    }

    #[test]
    fn test_first_peer_keeps_equal_range() {
        let a = KeyPair::generate().public;
        let b = KeyPair::generate().public;
        let mut table = RouteTable::new();
        table.insert("10.0.0.0/8".parse().unwrap(), a);
        table.insert("10.0.0.0/8".parse().unwrap(), b);
        assert_eq!(table.lookup(ip("10.9.9.9")), Some(&a));

        table.remove_peer(&a);
        assert_eq!(table.lookup(ip("10.9.9.9")), Some(&b));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_v6() {
        let peer = KeyPair::generate().public;
        let mut table = RouteTable::new();
        table.insert("fd00::/64".parse().unwrap(), peer);
        assert_eq!(table.lookup(ip("fd00::42")), Some(&peer));
        assert_eq!(table.lookup(ip("fd01::42")), None);
    }
}
