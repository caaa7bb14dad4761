//! The security policy, security association and peer authorization databases.
//!
//! The engine reads policies to find traffic selectors, modes and lifetimes, reads the peer
//! authorization table for pre-shared keys and writes an association for each direction of every
//! established Child SA. The ESP data path is the other consumer of the association table and
//! looks entries up by SPI and destination.
use std::collections::BTreeMap;

use zeroize::Zeroize;

use crate::time::Duration;
use crate::wire::{Ipv4Address, Ipv4Subnet};

use super::Result;
use super::proposal::{Encryption, Integrity};

/// What to do with matching traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Protect,
    Bypass,
    Discard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Transport,
    Tunnel,
}

/// The outer addresses of a tunnel mode association.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tunnel {
    pub local: Ipv4Address,
    pub remote: Ipv4Address,
}

/// Selects traffic between two address blocks, all protocols if `protocol` is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Selector {
    pub local: Ipv4Subnet,
    pub remote: Ipv4Subnet,
    pub protocol: u8,
}

/// An entry of the security policy database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub action: Action,
    pub mode: Mode,
    pub tunnel: Option<Tunnel>,
    /// Overrides the configured lifetime of the IKE SA with the peer.
    pub ike_lifetime: Option<Duration>,
    /// Overrides the configured lifetime of Child SAs.
    pub child_lifetime: Option<Duration>,
}

/// The key of an association: its SPI and the destination of the traffic it protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SaId {
    pub spi: u32,
    pub dst: Ipv4Address,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// An entry of the security association database, one direction of a Child SA.
#[derive(Clone, PartialEq, Eq)]
pub struct SaData {
    /// Local and remote as seen by the sender of the protected traffic.
    pub selector: Selector,
    pub direction: Direction,
    pub mode: Mode,
    pub tunnel: Option<Tunnel>,
    pub encryption: Encryption,
    pub encryption_key: Vec<u8>,
    pub integrity: Integrity,
    pub integrity_key: Vec<u8>,
    pub lifetime: Duration,
}

/// An entry of the peer authorization database.
#[derive(Clone, PartialEq, Eq)]
pub struct PeerAuth {
    pub psk: Vec<u8>,
}

/// The persisted switch of the whole IPsec service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Enabled,
    Disabled,
}

/// Access to the three databases and the status flag.
pub trait Store {
    fn policy(&self, selector: &Selector) -> Option<&Policy>;
    fn set_policy(&mut self, selector: Selector, policy: Option<Policy>) -> Result<()>;
    fn policies(&self) -> Vec<Selector>;

    fn sa(&self, id: &SaId) -> Option<&SaData>;
    fn set_sa(&mut self, id: SaId, data: Option<SaData>) -> Result<()>;
    fn sas(&self) -> Vec<SaId>;

    fn peer(&self, remote: &Ipv4Subnet) -> Option<&PeerAuth>;
    fn set_peer(&mut self, remote: Ipv4Subnet, auth: Option<PeerAuth>) -> Result<()>;
    fn peers(&self) -> Vec<Ipv4Subnet>;

    fn status(&self) -> Status;
    fn set_status(&mut self, status: Status) -> Result<()>;
}

/// A store kept in memory.
pub struct MemoryStore {
    spd: BTreeMap<Selector, Policy>,
    sad: BTreeMap<SaId, SaData>,
    pad: BTreeMap<Ipv4Subnet, PeerAuth>,
    status: Status,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            spd: BTreeMap::new(),
            sad: BTreeMap::new(),
            pad: BTreeMap::new(),
            status: Status::Enabled,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new()
    }
}

fn update<K: Ord, V>(map: &mut BTreeMap<K, V>, key: K, value: Option<V>) {
    match value {
        Some(value) => { map.insert(key, value); },
        None => { map.remove(&key); },
    }
}

impl Store for MemoryStore {
    fn policy(&self, selector: &Selector) -> Option<&Policy> {
        self.spd.get(selector)
    }

    fn set_policy(&mut self, selector: Selector, policy: Option<Policy>) -> Result<()> {
        update(&mut self.spd, selector, policy);
        Ok(())
    }

    fn policies(&self) -> Vec<Selector> {
        self.spd.keys().cloned().collect()
    }

    fn sa(&self, id: &SaId) -> Option<&SaData> {
        self.sad.get(id)
    }

    fn set_sa(&mut self, id: SaId, data: Option<SaData>) -> Result<()> {
        update(&mut self.sad, id, data);
        Ok(())
    }

    fn sas(&self) -> Vec<SaId> {
        self.sad.keys().cloned().collect()
    }

    fn peer(&self, remote: &Ipv4Subnet) -> Option<&PeerAuth> {
        self.pad.get(remote)
    }

    fn set_peer(&mut self, remote: Ipv4Subnet, auth: Option<PeerAuth>) -> Result<()> {
        update(&mut self.pad, remote, auth);
        Ok(())
    }

    fn peers(&self) -> Vec<Ipv4Subnet> {
        self.pad.keys().cloned().collect()
    }

    fn status(&self) -> Status {
        self.status
    }

    fn set_status(&mut self, status: Status) -> Result<()> {
        self.status = status;
        Ok(())
    }
}

/// The first protecting policy covering traffic between the two hosts.
pub(crate) fn find_policy<S: Store>(store: &S, local: Ipv4Address, remote: Ipv4Address)
    -> Option<(Selector, Policy)>
{
    store.policies().into_iter().find_map(|selector| {
        let policy = store.policy(&selector)?;
        let matches = policy.action == Action::Protect
            && selector.local.contains(local)
            && selector.remote.contains(remote);
        if matches { Some((selector, policy.clone())) } else { None }
    })
}

/// The pre-shared key of the first authorization entry covering `remote`.
pub(crate) fn find_psk<S: Store>(store: &S, remote: Ipv4Address) -> Option<Vec<u8>> {
    store.peers().into_iter()
        .find(|subnet| subnet.contains(remote))
        .and_then(|subnet| store.peer(&subnet))
        .map(|auth| auth.psk.clone())
}

impl Drop for SaData {
    fn drop(&mut self) {
        self.encryption_key.zeroize();
        self.integrity_key.zeroize();
    }
}

impl Drop for PeerAuth {
    fn drop(&mut self) {
        self.psk.zeroize();
    }
}
