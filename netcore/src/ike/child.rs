//! Child SAs and their entries in the association database.
use crate::time::{Duration, Expiration};
use crate::wire::{Ipv4Address, Ipv4Subnet};
use crate::wire::ike::TrafficSelector;

use super::{Error, Result};
use super::keys::ChildKeys;
use super::proposal::EspSuite;
use super::store::{self, Direction, Mode, SaData, SaId, Selector, Store, Tunnel};

/// One negotiated ESP association pair.
///
/// Owned by its IKE SA, which holds it in exactly one of its negotiating, established or
/// deleting lists.
pub(crate) struct ChildSa {
    /// The SPI the peer sends with, chosen by us and unique in the engine.
    pub(crate) local_spi: u32,
    /// The SPI we send with, zero until the peer chose it.
    pub(crate) peer_spi: u32,
    /// We sent the request creating this SA.
    pub(crate) initiator: bool,
    pub(crate) suite: Option<EspSuite>,
    /// Our nonce of the creating exchange when we initiated it.
    pub(crate) nonce: Vec<u8>,
    pub(crate) ts_local: Vec<TrafficSelector>,
    pub(crate) ts_remote: Vec<TrafficSelector>,
    pub(crate) keys: Option<ChildKeys>,
    pub(crate) mode: Mode,
    pub(crate) tunnel: Option<Tunnel>,
    pub(crate) lifetime: Duration,
    pub(crate) expires: Expiration,
}

impl ChildSa {
    /// A new Child SA for traffic between the hosts, shaped by the first matching policy.
    ///
    /// Without a policy the selectors cover exactly the two hosts in transport mode.
    pub(crate) fn new<S: Store>(
        store: &S,
        local: Ipv4Address,
        remote: Ipv4Address,
        local_spi: u32,
        default_lifetime: Duration,
    ) -> Self {
        let (ts_local, ts_remote, mode, tunnel, lifetime) = match store::find_policy(store, local, remote) {
            Some((selector, policy)) => (
                vec![selector_of(selector.local, selector.protocol)],
                vec![selector_of(selector.remote, selector.protocol)],
                policy.mode,
                policy.tunnel,
                policy.child_lifetime.unwrap_or(default_lifetime),
            ),
            None => (
                vec![TrafficSelector::host(local)],
                vec![TrafficSelector::host(remote)],
                Mode::Transport,
                None,
                default_lifetime,
            ),
        };

        ChildSa {
            local_spi,
            peer_spi: 0,
            initiator: false,
            suite: None,
            nonce: Vec::new(),
            ts_local,
            ts_remote,
            keys: None,
            mode,
            tunnel,
            lifetime,
            expires: Expiration::Never,
        }
    }

    /// The traffic selectors in the order of the initiator of the creating exchange.
    pub(crate) fn ts_pair(&self) -> (Vec<TrafficSelector>, Vec<TrafficSelector>) {
        if self.initiator {
            (self.ts_local.clone(), self.ts_remote.clone())
        } else {
            (self.ts_remote.clone(), self.ts_local.clone())
        }
    }

    /// Take over the selectors of the exchange, as the responder may have narrowed them.
    pub(crate) fn set_ts_pair(&mut self, ts_i: Vec<TrafficSelector>, ts_r: Vec<TrafficSelector>) {
        if self.initiator {
            self.ts_local = ts_i;
            self.ts_remote = ts_r;
        } else {
            self.ts_local = ts_r;
            self.ts_remote = ts_i;
        }
    }

    fn selector(&self, local: Ipv4Address, remote: Ipv4Address) -> Selector {
        let protocol = self.ts_local.first().map(|ts| ts.ip_protocol).unwrap_or(0);
        Selector {
            local: subnet_of(&self.ts_local, local),
            remote: subnet_of(&self.ts_remote, remote),
            protocol,
        }
    }
}

fn selector_of(subnet: Ipv4Subnet, protocol: u8) -> TrafficSelector {
    let (start_addr, end_addr) = subnet.range();
    TrafficSelector { ip_protocol: protocol, start_port: 0, end_port: 0xffff, start_addr, end_addr }
}

/// The smallest block containing the first selector's range.
fn subnet_of(list: &[TrafficSelector], fallback: Ipv4Address) -> Ipv4Subnet {
    match list.first() {
        Some(ts) => {
            let start = ts.start_addr.to_network_integer();
            let end = ts.end_addr.to_network_integer();
            let prefix = (start ^ end).leading_zeros() as u8;
            Ipv4Subnet::new(ts.start_addr, prefix)
        },
        None => Ipv4Subnet::host(fallback),
    }
}

/// Write both directions of an established Child SA to the association database.
///
/// The outbound entry is keyed by the SPI the peer chose and carries the keys we send with. The
/// inbound entry is keyed by our SPI, carries the keys the peer sends with and has local and
/// remote swapped, as it describes traffic from the peer's point of view.
pub(crate) fn store_sa_data<S: Store>(
    store: &mut S,
    local: Ipv4Address,
    remote: Ipv4Address,
    child: &ChildSa,
) -> Result<()> {
    let (suite, keys) = match (child.suite, child.keys.as_ref()) {
        (Some(suite), Some(keys)) => (suite, keys),
        _ => return Err(Error::InvalidState("child SA without keys")),
    };
    let (send, receive) = if child.initiator {
        ((&keys.encr_i, &keys.integ_i), (&keys.encr_r, &keys.integ_r))
    } else {
        ((&keys.encr_r, &keys.integ_r), (&keys.encr_i, &keys.integ_i))
    };

    let outbound_selector = child.selector(local, remote);
    let inbound_selector = Selector {
        local: outbound_selector.remote,
        remote: outbound_selector.local,
        ..outbound_selector
    };
    let reversed = child.tunnel.map(|tunnel| Tunnel { local: tunnel.remote, remote: tunnel.local });

    let outbound = SaData {
        selector: outbound_selector,
        direction: Direction::Outbound,
        mode: child.mode,
        tunnel: child.tunnel,
        encryption: suite.encryption,
        encryption_key: send.0.clone(),
        integrity: suite.integrity,
        integrity_key: send.1.clone(),
        lifetime: child.lifetime,
    };
    let inbound = SaData {
        selector: inbound_selector,
        direction: Direction::Inbound,
        mode: child.mode,
        tunnel: reversed,
        encryption: suite.encryption,
        encryption_key: receive.0.clone(),
        integrity: suite.integrity,
        integrity_key: receive.1.clone(),
        lifetime: child.lifetime,
    };

    store.set_sa(SaId { spi: child.peer_spi, dst: remote }, Some(outbound))?;
    if let Err(err) = store.set_sa(SaId { spi: child.local_spi, dst: local }, Some(inbound)) {
        let _ = store.set_sa(SaId { spi: child.peer_spi, dst: remote }, None);
        return Err(err);
    }
    Ok(())
}

/// Remove both entries of a Child SA.
pub(crate) fn remove_sa_data<S: Store>(
    store: &mut S,
    local: Ipv4Address,
    remote: Ipv4Address,
    child: &ChildSa,
) -> Result<()> {
    let outbound = store.set_sa(SaId { spi: child.peer_spi, dst: remote }, None);
    let inbound = store.set_sa(SaId { spi: child.local_spi, dst: local }, None);
    outbound.and(inbound)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ike::proposal::{Encryption, Integrity};
    use crate::ike::store::{Action, MemoryStore, Policy};

    const LOCAL: Ipv4Address = Ipv4Address::new(10, 0, 0, 1);
    const REMOTE: Ipv4Address = Ipv4Address::new(10, 0, 0, 2);

    fn established(store: &MemoryStore, initiator: bool) -> ChildSa {
        let mut child = ChildSa::new(store, LOCAL, REMOTE, 0x1111, Duration::from_secs(1800));
        child.peer_spi = 0x2222;
        child.initiator = initiator;
        child.suite = Some(EspSuite { encryption: Encryption::AesCbc128, integrity: Integrity::HmacSha1_96 });
        child.keys = Some(ChildKeys {
            encr_i: vec![1; 16],
            integ_i: vec![2; 20],
            encr_r: vec![3; 16],
            integ_r: vec![4; 20],
        });
        child
    }

    #[test]
    fn dual_write() {
        let mut store = MemoryStore::new();
        let child = established(&store, true);
        store_sa_data(&mut store, LOCAL, REMOTE, &child).unwrap();
        assert_eq!(store.sas().len(), 2);

        let outbound = store.sa(&SaId { spi: 0x2222, dst: REMOTE }).expect("outbound entry");
        assert_eq!(outbound.direction, Direction::Outbound);
        assert_eq!(outbound.selector.local, Ipv4Subnet::host(LOCAL));
        assert_eq!(outbound.selector.remote, Ipv4Subnet::host(REMOTE));
        assert_eq!(outbound.encryption_key, vec![1; 16]);

        let inbound = store.sa(&SaId { spi: 0x1111, dst: LOCAL }).expect("inbound entry");
        assert_eq!(inbound.direction, Direction::Inbound);
        assert_eq!(inbound.selector.local, Ipv4Subnet::host(REMOTE));
        assert_eq!(inbound.selector.remote, Ipv4Subnet::host(LOCAL));
        assert_eq!(inbound.integrity_key, vec![4; 20]);

        remove_sa_data(&mut store, LOCAL, REMOTE, &child).unwrap();
        assert!(store.sas().is_empty());
    }

    #[test]
    fn responder_sends_with_responder_keys() {
        let mut store = MemoryStore::new();
        let child = established(&store, false);
        store_sa_data(&mut store, LOCAL, REMOTE, &child).unwrap();
        let outbound = store.sa(&SaId { spi: 0x2222, dst: REMOTE }).expect("outbound entry");
        assert_eq!(outbound.encryption_key, vec![3; 16]);
    }

    #[test]
    fn tunnel_policy_shapes_the_child() {
        let mut store = MemoryStore::new();
        let selector = Selector {
            local: Ipv4Subnet::new(Ipv4Address::new(192, 168, 1, 0), 24),
            remote: Ipv4Subnet::new(Ipv4Address::new(192, 168, 2, 0), 24),
            protocol: 0,
        };
        store.set_policy(Selector { local: Ipv4Subnet::ANY, remote: Ipv4Subnet::ANY, ..selector }, Some(Policy {
            action: Action::Protect,
            mode: Mode::Tunnel,
            tunnel: Some(Tunnel { local: LOCAL, remote: REMOTE }),
            ike_lifetime: None,
            child_lifetime: Some(Duration::from_secs(60)),
        })).unwrap();

        let mut child = established(&store, true);
        assert_eq!(child.mode, Mode::Tunnel);
        assert_eq!(child.lifetime, Duration::from_secs(60));
        child.set_ts_pair(vec![selector_of(selector.local, 0)], vec![selector_of(selector.remote, 0)]);
        store_sa_data(&mut store, LOCAL, REMOTE, &child).unwrap();

        let inbound = store.sa(&SaId { spi: 0x1111, dst: LOCAL }).expect("inbound entry");
        assert_eq!(inbound.selector.remote, selector.local);
        assert_eq!(inbound.tunnel, Some(Tunnel { local: REMOTE, remote: LOCAL }));
    }
}
