//! Configuration Parser
//!
//! Reads the `[Interface]` / `[Peer]` text format:
//!
//! ```text
//! [Interface]
//! PrivateKey = yLXz...=
//! Address = 172.16.0.1
//! DNS = 172.16.1.101, corp.local
//!
//! [Peer]
//! PublicKey = K69d...=
//! Endpoint = 92.233.249.6:51820
//! PersistentKeepalive = 35
//! AllowedIPs = 127.0.0.53, 172.16.0.0/24, 192.168.91.0/24
//! ```
//!
//! Rules:
//! - section names and keys are case-insensitive, values are trimmed
//! - `#` starts a comment that runs to the end of the line
//! - a repeated key within one section replaces the earlier value
//! - unknown keys are ignored

use crate::config::{
    parse_dns_entry, parse_endpoint, Configuration, InterfaceConfig, PeerConfig,
};
use crate::error::ParseError;
use crate::keys::{PresharedKey, PrivateKey, PublicKey};
use ipnet::IpNet;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use tracing::debug;

const INTERFACE: &str = "Interface";
const PEER: &str = "Peer";

const INTERFACE_KEYS: &[&str] = &["privatekey", "address", "dns", "listenport", "mtu"];
const PEER_KEYS: &[&str] = &[
    "publickey",
    "endpoint",
    "allowedips",
    "persistentkeepalive",
    "presharedkey",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SectionKind {
    Interface,
    Peer,
}

impl SectionKind {
    fn name(self) -> &'static str {
        match self {
            SectionKind::Interface => INTERFACE,
            SectionKind::Peer => PEER,
        }
    }

    fn known_keys(self) -> &'static [&'static str] {
        match self {
            SectionKind::Interface => INTERFACE_KEYS,
            SectionKind::Peer => PEER_KEYS,
        }
    }
}

/// One bracketed section with its raw values, keyed by lowercased key
struct RawSection {
    kind: SectionKind,
    values: HashMap<String, String>,
}

impl RawSection {
    fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    fn require(&self, key: &'static str) -> Result<&str, ParseError> {
        self.get(key).ok_or(ParseError::MissingField {
            section: self.kind.name(),
            key,
        })
    }

    fn list(&self, key: &str) -> Vec<&str> {
        self.get(key)
            .map(|v| v.split(',').map(str::trim).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default()
    }

    fn number(&self, key: &'static str) -> Result<Option<u16>, ParseError> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => v.parse().map(Some).map_err(|_| ParseError::InvalidValue {
                section: self.kind.name(),
                key,
                value: v.to_string(),
            }),
        }
    }
}

/// Parse configuration text into a validated [`Configuration`].
///
/// Nothing is returned unless the whole text is valid.
pub fn parse(text: &str) -> Result<Configuration, ParseError> {
    let sections = split_sections(text)?;

    let mut interface = None;
    let mut peers = Vec::new();
    let mut seen_keys = HashSet::new();

    for section in &sections {
        match section.kind {
            SectionKind::Interface => interface = Some(build_interface(section)?),
            SectionKind::Peer => {
                let peer = build_peer(section)?;
                if !seen_keys.insert(peer.public_key) {
                    return Err(ParseError::DuplicatePeer(peer.public_key.to_base64()));
                }
                peers.push(peer);
            }
        }
    }

    let interface = interface.ok_or(ParseError::MissingSection(INTERFACE))?;
    debug!(peers = peers.len(), "Parsed tunnel configuration");

    Ok(Configuration { interface, peers })
}

fn split_sections(text: &str) -> Result<Vec<RawSection>, ParseError> {
    let mut sections: Vec<RawSection> = Vec::new();
    let mut has_interface = false;

    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = match raw_line.split_once('#') {
            Some((before, _)) => before,
            None => raw_line,
        }
        .trim();

        if line.is_empty() {
            continue;
        }

        if let Some(header) = line.strip_prefix('[') {
            let name = header
                .strip_suffix(']')
                .ok_or_else(|| ParseError::Syntax {
                    line: line_no,
                    text: raw_line.trim().to_string(),
                })?
                .trim();

            let kind = if name.eq_ignore_ascii_case(INTERFACE) {
                if has_interface {
                    return Err(ParseError::DuplicateInterface { line: line_no });
                }
                has_interface = true;
                SectionKind::Interface
            } else if name.eq_ignore_ascii_case(PEER) {
                SectionKind::Peer
            } else {
                return Err(ParseError::UnknownSection {
                    line: line_no,
                    name: name.to_string(),
                });
            };

            sections.push(RawSection {
                kind,
                values: HashMap::new(),
            });
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| ParseError::Syntax {
            line: line_no,
            text: raw_line.trim().to_string(),
        })?;
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();

        let section = match sections.last_mut() {
            Some(section) if !key.is_empty() => section,
            _ => {
                return Err(ParseError::Syntax {
                    line: line_no,
                    text: raw_line.trim().to_string(),
                });
            }
        };

        if !section.kind.known_keys().contains(&key.as_str()) {
            debug!(section = section.kind.name(), key = %key, line = line_no, "Ignoring unknown key");
            continue;
        }

        if section.values.insert(key.clone(), value.to_string()).is_some() {
            debug!(section = section.kind.name(), key = %key, line = line_no, "Duplicate key, last value wins");
        }
    }

    Ok(sections)
}

fn parse_net(section: &'static str, key: &'static str, value: &str) -> Result<IpNet, ParseError> {
    if let Ok(net) = value.parse::<IpNet>() {
        return Ok(net);
    }
    value
        .parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| ParseError::InvalidCidr {
            section,
            key,
            value: value.to_string(),
        })
}

fn build_interface(section: &RawSection) -> Result<InterfaceConfig, ParseError> {
    let private_key = PrivateKey::from_base64(section.require("PrivateKey")?)
        .map_err(|_| ParseError::InvalidKey {
            section: INTERFACE,
            key: "PrivateKey",
        })?;

    section.require("Address")?;
    let addresses = section
        .list("Address")
        .into_iter()
        .map(|a| parse_net(INTERFACE, "Address", a))
        .collect::<Result<Vec<_>, _>>()?;
    if addresses.is_empty() {
        return Err(ParseError::MissingField {
            section: INTERFACE,
            key: "Address",
        });
    }

    let dns = section
        .list("DNS")
        .into_iter()
        .map(|d| {
            parse_dns_entry(d).ok_or_else(|| ParseError::InvalidValue {
                section: INTERFACE,
                key: "DNS",
                value: d.to_string(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(InterfaceConfig {
        private_key,
        addresses,
        dns,
        listen_port: section.number("ListenPort")?,
        mtu: section.number("MTU")?,
    })
}

fn build_peer(section: &RawSection) -> Result<PeerConfig, ParseError> {
    let public_key = PublicKey::from_base64(section.require("PublicKey")?)
        .map_err(|_| ParseError::InvalidKey {
            section: PEER,
            key: "PublicKey",
        })?;

    let endpoint_text = section.require("Endpoint")?;
    let endpoint = parse_endpoint(endpoint_text).ok_or_else(|| ParseError::InvalidValue {
        section: PEER,
        key: "Endpoint",
        value: endpoint_text.to_string(),
    })?;

    let allowed_ips = section
        .list("AllowedIPs")
        .into_iter()
        .map(|a| parse_net(PEER, "AllowedIPs", a))
        .collect::<Result<Vec<_>, _>>()?;

    let persistent_keepalive = match section.get("PersistentKeepalive") {
        Some(v) if v.eq_ignore_ascii_case("off") => None,
        _ => section.number("PersistentKeepalive")?.filter(|s| *s > 0),
    };

    let preshared_key = section
        .get("PresharedKey")
        .map(|v| {
            PresharedKey::from_base64(v).map_err(|_| ParseError::InvalidKey {
                section: PEER,
                key: "PresharedKey",
            })
        })
        .transpose()?;

    Ok(PeerConfig {
        public_key,
        endpoint,
        allowed_ips,
        persistent_keepalive,
        preshared_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DnsEntry, Endpoint};
    use crate::keys::KeyPair;

    fn sample(private: &PrivateKey, peer: &PublicKey) -> String {
        format!(
            "[Interface]\n\
             PrivateKey = {}\n\
             Address = 172.16.0.1\n\
             \n\
             [Peer]\n\
             PublicKey = {}\n\
             Endpoint = 92.233.249.6:51820\n\
             PersistentKeepalive = 35\n\
             AllowedIPs = 127.0.0.53, 172.16.0.0/24, 192.168.91.0/24\n",
            private.to_base64(),
            peer.to_base64()
        )
    }

    #[test]
    fn test_parse_example_configuration() {
        let local = KeyPair::generate();
        let remote = KeyPair::generate();

        let config = parse(&sample(&local.private, &remote.public)).unwrap();

        assert_eq!(config.interface.private_key, local.private);
        assert_eq!(config.interface.addresses, vec!["172.16.0.1/32".parse::<IpNet>().unwrap()]);
        assert_eq!(config.peers.len(), 1);

        let peer = &config.peers[0];
        assert_eq!(peer.public_key, remote.public);
        assert_eq!(peer.endpoint, Endpoint::new("92.233.249.6", 51820));
        assert_eq!(peer.persistent_keepalive, Some(35));
        assert_eq!(
            peer.allowed_ips,
            vec![
                "127.0.0.53/32".parse::<IpNet>().unwrap(),
                "172.16.0.0/24".parse().unwrap(),
                "192.168.91.0/24".parse().unwrap(),
            ]
        );
    }

    #[test]
    fn test_round_trip() {
        let local = KeyPair::generate();
        let mut text = sample(&local.private, &KeyPair::generate().public);
        text.push_str(&format!(
            "\n[Peer]\nPublicKey = {}\nPresharedKey = {}\nEndpoint = [fd00::1]:4500\nAllowedIPs = fd00::/64\n",
            KeyPair::generate().public,
            PresharedKey::generate().to_base64()
        ));
        text = text.replace(
            "Address = 172.16.0.1",
            "Address = 172.16.0.1, fd00::2/64\nDNS = 172.16.1.101,logonbox.local\nListenPort = 51000\nMTU = 1380",
        );

        let config = parse(&text).unwrap();
        assert_eq!(config.interface.dns[1], DnsEntry::SearchDomain("logonbox.local".into()));

        let reparsed = parse(&config.to_string()).unwrap();
        assert_eq!(reparsed, config);
    }

    #[test]
    fn test_missing_required_fields() {
        let local = KeyPair::generate();
        let remote = KeyPair::generate();
        let text = sample(&local.private, &remote.public);

        let cases = [
            ("PrivateKey", INTERFACE),
            ("Address", INTERFACE),
            ("PublicKey", PEER),
            ("Endpoint", PEER),
        ];

        for (key, section) in cases {
            let stripped: String = text
                .lines()
                .filter(|l| !l.starts_with(&format!("{} ", key)))
                .map(|l| format!("{}\n", l))
                .collect();

            match parse(&stripped) {
                Err(ParseError::MissingField { section: s, key: k }) => {
                    assert_eq!((s, k), (section, key));
                }
                other => panic!("expected MissingField for {}, got {:?}", key, other),
            }
        }
    }

    #[test]
    fn test_unknown_section() {
        let err = parse("[Interface]\n[Wat]\n").unwrap_err();
        assert!(matches!(err, ParseError::UnknownSection { line: 2, ref name } if name == "Wat"));
    }

    #[test]
    fn test_missing_interface() {
        let text = format!(
            "[Peer]\nPublicKey = {}\nEndpoint = 1.2.3.4:1\n",
            KeyPair::generate().public
        );
        assert!(matches!(parse(&text), Err(ParseError::MissingSection("Interface"))));
    }

    #[test]
    fn test_duplicate_interface() {
        let key = KeyPair::generate().private.to_base64();
        let text = format!(
            "[Interface]\nPrivateKey = {key}\nAddress = 10.0.0.1\n[Interface]\nPrivateKey = {key}\n"
        );
        assert!(matches!(parse(&text), Err(ParseError::DuplicateInterface { line: 4 })));
    }

    #[test]
    fn test_invalid_cidr() {
        let text = sample(&KeyPair::generate().private, &KeyPair::generate().public)
            .replace("192.168.91.0/24", "192.168.91.0/33");
        assert!(matches!(
            parse(&text),
            Err(ParseError::InvalidCidr { key: "AllowedIPs", ref value, .. }) if value == "192.168.91.0/33"
        ));

        let text = sample(&KeyPair::generate().private, &KeyPair::generate().public)
            .replace("Address = 172.16.0.1", "Address = not-an-ip");
        assert!(matches!(parse(&text), Err(ParseError::InvalidCidr { key: "Address", .. })));
    }

    #[test]
    fn test_invalid_key() {
        let text = sample(&KeyPair::generate().private, &KeyPair::generate().public);
        let bad = text.replacen("PrivateKey = ", "PrivateKey = AAAA", 1);
        assert!(matches!(
            parse(&bad),
            Err(ParseError::InvalidKey { section: "Interface", key: "PrivateKey" })
        ));
    }

    #[test]
    fn test_invalid_numbers() {
        let text = sample(&KeyPair::generate().private, &KeyPair::generate().public)
            .replace("PersistentKeepalive = 35", "PersistentKeepalive = soon");
        assert!(matches!(
            parse(&text),
            Err(ParseError::InvalidValue { key: "PersistentKeepalive", .. })
        ));
    }

    #[test]
    fn test_keepalive_off() {
        let text = sample(&KeyPair::generate().private, &KeyPair::generate().public)
            .replace("PersistentKeepalive = 35", "PersistentKeepalive = off");
        assert_eq!(parse(&text).unwrap().peers[0].persistent_keepalive, None);
    }

    #[test]
    fn test_duplicate_peer() {
        let remote = KeyPair::generate();
        let mut text = sample(&KeyPair::generate().private, &remote.public);
        text.push_str(&format!("[Peer]\nPublicKey = {}\nEndpoint = 10.0.0.9:1\n", remote.public));
        assert!(matches!(parse(&text), Err(ParseError::DuplicatePeer(_))));
    }

    #[test]
    fn test_last_write_wins() {
        let text = sample(&KeyPair::generate().private, &KeyPair::generate().public)
            .replace(
                "PersistentKeepalive = 35",
                "PersistentKeepalive = 35\npersistentkeepalive = 10",
            );
        assert_eq!(parse(&text).unwrap().peers[0].persistent_keepalive, Some(10));
    }

    #[test]
    fn test_comments_case_and_unknown_keys() {
        let local = KeyPair::generate();
        let remote = KeyPair::generate();
        let text = format!(
            "# generated\n\
             [interface]\n\
             privatekey = {}   # ours\n\
             ADDRESS=10.1.0.2/24\n\
             PostUp = iptables -A FORWARD\n\
             \n\
             [PEER]\n\
             publickey={}\n\
             endpoint = vpn.example.com:443\n\
             FutureKnob = 7\n",
            local.private.to_base64(),
            remote.public
        );

        let config = parse(&text).unwrap();
        assert_eq!(config.interface.addresses[0], "10.1.0.2/24".parse::<IpNet>().unwrap());
        assert_eq!(config.peers[0].endpoint, Endpoint::new("vpn.example.com", 443));
        assert!(config.peers[0].allowed_ips.is_empty());
    }

    #[test]
    fn test_syntax_errors() {
        assert!(matches!(parse("PrivateKey = x\n"), Err(ParseError::Syntax { line: 1, .. })));
        assert!(matches!(parse("[Interface\n"), Err(ParseError::Syntax { line: 1, .. })));
        assert!(matches!(
            parse("[Interface]\njust some words\n"),
            Err(ParseError::Syntax { line: 2, .. })
        ));
    }

    #[test]
    fn test_no_peers_is_valid() {
        let text = format!(
            "[Interface]\nPrivateKey = {}\nAddress = 10.0.0.1\n",
            KeyPair::generate().private.to_base64()
        );
        assert!(parse(&text).unwrap().peers.is_empty());
    }
}
