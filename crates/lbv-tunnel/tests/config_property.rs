use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use lbv_tunnel::{
    parse, Configuration, DnsEntry, Endpoint, InterfaceConfig, PeerConfig, PresharedKey,
    PrivateKey, PublicKey,
};
use proptest::collection::vec;
use proptest::option;
use proptest::prelude::*;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

fn ipv4() -> impl Strategy<Value = Ipv4Addr> {
    any::<[u8; 4]>().prop_map(Ipv4Addr::from)
}

fn ipv6() -> impl Strategy<Value = Ipv6Addr> {
    any::<[u16; 8]>().prop_map(Ipv6Addr::from)
}

fn ip() -> impl Strategy<Value = IpAddr> {
    prop_oneof![ipv4().prop_map(IpAddr::V4), ipv6().prop_map(IpAddr::V6)]
}

fn net() -> impl Strategy<Value = IpNet> {
    prop_oneof![
        (ipv4(), 0u8..=32).prop_map(|(a, p)| IpNet::V4(Ipv4Net::new(a, p).unwrap())),
        (ipv6(), 0u8..=128).prop_map(|(a, p)| IpNet::V6(Ipv6Net::new(a, p).unwrap())),
    ]
}

fn endpoint() -> impl Strategy<Value = Endpoint> {
    let host = prop_oneof![
        ipv4().prop_map(|a| a.to_string()),
        ipv6().prop_map(|a| a.to_string()),
        "[a-z][a-z0-9-]{0,12}(\\.[a-z][a-z0-9]{0,6}){0,2}",
    ];
    (host, any::<u16>()).prop_map(|(host, port)| Endpoint::new(host, port))
}

fn dns() -> impl Strategy<Value = DnsEntry> {
    prop_oneof![
        ip().prop_map(DnsEntry::Server),
        "[a-z][a-z0-9]{0,10}(\\.[a-z][a-z0-9]{0,10}){0,3}".prop_map(DnsEntry::SearchDomain),
    ]
}

fn interface() -> impl Strategy<Value = InterfaceConfig> {
    (
        any::<[u8; 32]>(),
        vec(net(), 1..4),
        vec(dns(), 0..4),
        option::of(any::<u16>()),
        option::of(any::<u16>()),
    )
        .prop_map(|(key, addresses, dns, listen_port, mtu)| InterfaceConfig {
            private_key: PrivateKey::from_bytes(key),
            addresses,
            dns,
            listen_port,
            mtu,
        })
}

fn peer() -> impl Strategy<Value = PeerConfig> {
    (
        any::<[u8; 32]>(),
        endpoint(),
        vec(net(), 0..4),
        option::of(1u16..),
        option::of(any::<[u8; 32]>()),
    )
        .prop_map(|(key, endpoint, allowed_ips, keepalive, psk)| PeerConfig {
            public_key: PublicKey::from_bytes(key),
            endpoint,
            allowed_ips,
            persistent_keepalive: keepalive,
            preshared_key: psk.map(PresharedKey::from_bytes),
        })
}

fn configuration() -> impl Strategy<Value = Configuration> {
    (interface(), vec(peer(), 0..4)).prop_map(|(interface, peers)| {
        let mut config = Configuration::new(interface);
        for (i, mut peer) in peers.into_iter().enumerate() {
            // Peer keys must be unique within one configuration
            let mut key = peer.public_key.to_bytes();
            key[0] = i as u8;
            peer.public_key = PublicKey::from_bytes(key);
            config = config.with_peer(peer);
        }
        config
    })
}

proptest! {
    #[test]
    fn display_parse_roundtrip(config in configuration()) {
        let text = config.to_string();
        let reparsed = parse(&text);
        prop_assert!(reparsed.is_ok(), "{:?}\n{}", reparsed, text);
        prop_assert_eq!(reparsed.unwrap(), config);
    }

    #[test]
    fn roundtrip_is_stable(config in configuration()) {
        let once = parse(&config.to_string()).unwrap().to_string();
        prop_assert_eq!(once, config.to_string());
    }
}
