use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use parking_lot::RwLock;

use crate::peer::Peer;

/// Longest-prefix-match delegation table: which peer is authorized to
/// source traffic from a given inner IP. Queried by the data post-processor
/// (4.E step 6, "cryptokey routing") and, in the reference client, by the
/// send path to pick a destination peer for an outbound packet.
///
/// Built the same way `examples/tun.rs` builds its lookup trie: an
/// `iptrie::RTrieMap` with a default root, compressed into an
/// `LCTrieMap` for lookup — one such trie per address family, since
/// `iptrie`'s trie types are parameterized over a single prefix width.
/// Peer delegations change rarely relative to lookups, so mutation
/// rebuilds the whole trie under a write lock rather than keeping it
/// mutable on the hot path.
pub struct RoutingTable {
    inner: RwLock<RoutingInner>,
}

struct RoutingInner {
    v4_entries: Vec<(Ipv4Net, Arc<Peer>)>,
    v6_entries: Vec<(Ipv6Net, Arc<Peer>)>,
    v4: iptrie::LCTrieMap<Ipv4Net, Option<Arc<Peer>>>,
    v6: iptrie::LCTrieMap<Ipv6Net, Option<Arc<Peer>>>,
}

impl RoutingInner {
    fn rebuild(v4_entries: Vec<(Ipv4Net, Arc<Peer>)>, v6_entries: Vec<(Ipv6Net, Arc<Peer>)>) -> Self {
        let mut v4_map = iptrie::RTrieMap::with_root(None);
        for (net, peer) in &v4_entries {
            v4_map.insert(*net, Some(peer.clone()));
        }
        let mut v6_map = iptrie::RTrieMap::with_root(None);
        for (net, peer) in &v6_entries {
            v6_map.insert(*net, Some(peer.clone()));
        }
        Self {
            v4_entries,
            v6_entries,
            v4: v4_map.compress(),
            v6: v6_map.compress(),
        }
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self {
            inner: RwLock::new(RoutingInner::rebuild(Vec::new(), Vec::new())),
        }
    }
}

impl RoutingTable {
    /// Delegate every network in `nets` to `peer`, IPv4 and IPv6 alike.
    pub fn insert(&self, nets: &[IpNet], peer: Arc<Peer>) {
        let mut guard = self.inner.write();
        let mut v4_entries = std::mem::take(&mut guard.v4_entries);
        let mut v6_entries = std::mem::take(&mut guard.v6_entries);
        for net in nets {
            match net {
                IpNet::V4(v4) => v4_entries.push((*v4, peer.clone())),
                IpNet::V6(v6) => v6_entries.push((*v6, peer.clone())),
            }
        }
        *guard = RoutingInner::rebuild(v4_entries, v6_entries);
    }

    /// Remove every delegation pointing at `peer`.
    pub fn remove_peer(&self, peer: &Peer) {
        let mut guard = self.inner.write();
        let v4_entries = std::mem::take(&mut guard.v4_entries)
            .into_iter()
            .filter(|(_, p)| p.id() != peer.id())
            .collect();
        let v6_entries = std::mem::take(&mut guard.v6_entries)
            .into_iter()
            .filter(|(_, p)| p.id() != peer.id())
            .collect();
        *guard = RoutingInner::rebuild(v4_entries, v6_entries);
    }

    /// The "cryptokey routing" lookup: which peer, if any, is delegated
    /// the inner source address `addr`.
    pub fn lookup_src(&self, addr: IpAddr) -> Option<Arc<Peer>> {
        match addr {
            IpAddr::V4(v4) => self.lookup_v4(v4),
            IpAddr::V6(v6) => self.lookup_v6(v6),
        }
    }

    fn lookup_v4(&self, addr: Ipv4Addr) -> Option<Arc<Peer>> {
        let guard = self.inner.read();
        let (_, delegate) = guard.v4.lookup(&addr);
        delegate.clone()
    }

    fn lookup_v6(&self, addr: Ipv6Addr) -> Option<Arc<Peer>> {
        let guard = self.inner.read();
        let (_, delegate) = guard.v6.lookup(&addr);
        delegate.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_support::test_peer;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn lookup_finds_delegated_peer() {
        let table = RoutingTable::default();
        let peer = test_peer(1);
        let net: IpNet = "10.10.0.0/24".parse().unwrap();
        table.insert(&[net], peer.clone());

        let found = table
            .lookup_src(IpAddr::V4(Ipv4Addr::new(10, 10, 0, 5)))
            .unwrap();
        assert_eq!(found.id(), peer.id());
        assert!(table
            .lookup_src(IpAddr::V4(Ipv4Addr::new(10, 20, 0, 5)))
            .is_none());
    }

    #[test]
    fn lookup_finds_delegated_peer_over_ipv6() {
        let table = RoutingTable::default();
        let peer = test_peer(3);
        let net: IpNet = "fd00::/64".parse().unwrap();
        table.insert(&[net], peer.clone());

        let found = table
            .lookup_src(IpAddr::V6("fd00::5".parse::<Ipv6Addr>().unwrap()))
            .unwrap();
        assert_eq!(found.id(), peer.id());
        assert!(table
            .lookup_src(IpAddr::V6("fd01::5".parse::<Ipv6Addr>().unwrap()))
            .is_none());
    }

    #[test]
    fn remove_peer_clears_its_delegations() {
        let table = RoutingTable::default();
        let peer = test_peer(2);
        let v4: IpNet = "10.30.0.0/24".parse().unwrap();
        let v6: IpNet = "fd30::/64".parse().unwrap();
        table.insert(&[v4, v6], peer.clone());
        table.remove_peer(&peer);
        assert!(table
            .lookup_src(IpAddr::V4(Ipv4Addr::new(10, 30, 0, 5)))
            .is_none());
        assert!(table
            .lookup_src(IpAddr::V6("fd30::5".parse::<Ipv6Addr>().unwrap()))
            .is_none());
    }
}
