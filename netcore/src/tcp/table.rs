//! Lookup lists of control blocks and the local port space.
//!
//! A control block is inserted into exactly one list once it has its endpoints: listeners into
//! the listening list and everything else into the active list. The endpoints are recorded with
//! the handle, they never change while the block is inserted.
use crate::socket;
use crate::wire::{Ipv4Address, Ipv4Endpoint};

use super::{TcbHandle, TCP_PORT_KNOWN};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Entry {
    handle: TcbHandle,
    local: Ipv4Endpoint,
    remote: Ipv4Endpoint,
}

/// The connection table.
#[derive(Debug)]
pub(crate) struct Table {
    listening: Vec<Entry>,
    /// Most recently hit first.
    active: Vec<Entry>,
    /// Next candidate for an ephemeral port.
    port: u16,
}

/// Whether the endpoint of a segment matches a possibly wildcarded endpoint of a block.
fn peer_match(segment: Ipv4Endpoint, block: Ipv4Endpoint) -> bool {
    (segment.port == block.port || block.port == 0)
        && (segment.addr == block.addr || block.addr.is_unspecified())
}

impl Entry {
    fn wildcards(&self) -> u32 {
        self.remote.addr.is_unspecified() as u32
            + (self.remote.port == 0) as u32
            + self.local.addr.is_unspecified() as u32
    }
}

impl Table {
    pub fn new(port: u16) -> Self {
        Table {
            listening: Vec::new(),
            active: Vec::new(),
            port: port.max(TCP_PORT_KNOWN + 1),
        }
    }

    /// Find the block a segment from `remote` to `local` belongs to.
    ///
    /// Exact matches on connected blocks win. Only a SYN falls back to the listeners, where the
    /// match with the fewest wildcards is taken.
    pub fn lookup(&mut self, local: Ipv4Endpoint, remote: Ipv4Endpoint, syn: bool)
        -> Option<TcbHandle>
    {
        let hit = self.active.iter()
            .position(|entry| entry.local == local && entry.remote == remote);
        if let Some(pos) = hit {
            let entry = self.active.remove(pos);
            self.active.insert(0, entry);
            return Some(entry.handle);
        }

        if !syn {
            return None;
        }

        let mut best: Option<(u32, TcbHandle)> = None;
        for entry in &self.listening {
            if !peer_match(remote, entry.remote) || !peer_match(local, entry.local) {
                continue;
            }

            let wildcards = entry.wildcards();
            if wildcards == 0 {
                return Some(entry.handle);
            }
            match best {
                Some((least, _)) if least <= wildcards => (),
                _ => best = Some((wildcards, entry.handle)),
            }
        }

        best.map(|(_, handle)| handle)
    }

    /// Insert a block at the head of its list.
    ///
    /// Fails if the local port is unset or a block with the same endpoints is in the list.
    pub fn insert(&mut self, handle: TcbHandle, local: Ipv4Endpoint, remote: Ipv4Endpoint, listen: bool)
        -> bool
    {
        if local.port == 0 {
            return false;
        }

        let list = if listen { &mut self.listening } else { &mut self.active };
        if list.iter().any(|entry| entry.local == local && entry.remote == remote) {
            return false;
        }

        list.insert(0, Entry { handle, local, remote });
        true
    }

    /// Remove a block from whichever list holds it.
    pub fn remove(&mut self, handle: TcbHandle) {
        self.listening.retain(|entry| entry.handle != handle);
        self.active.retain(|entry| entry.handle != handle);
    }

    pub fn contains(&self, handle: TcbHandle) -> bool {
        self.listening.iter().chain(&self.active).any(|entry| entry.handle == handle)
    }

    /// All inserted blocks, listeners first.
    pub fn handles(&self) -> impl Iterator<Item=TcbHandle> + '_ {
        self.listening.iter().chain(&self.active).map(|entry| entry.handle)
    }

    fn in_use(&self, addr: Ipv4Address, port: u16) -> bool {
        self.listening.iter().chain(&self.active)
            .any(|entry| entry.local.addr == addr && entry.local.port == port)
    }

    /// Reserve the local port for a socket about to be inserted.
    ///
    /// An explicit port must be unused on `addr`. Port `0` draws the next free ephemeral port
    /// above the well-known range, giving up after one full cycle.
    pub fn bind(&mut self, addr: Ipv4Address, port: u16) -> socket::Result<u16> {
        if port != 0 {
            if self.in_use(addr, port) {
                return Err(socket::Error::AccessDenied);
            }
            return Ok(port);
        }

        let mut cycled = false;
        while self.in_use(addr, self.port) {
            self.port = self.port.wrapping_add(1);
            if self.port == 0 {
                if cycled {
                    return Err(socket::Error::OutOfResources);
                }
                cycled = true;
                self.port = TCP_PORT_KNOWN + 1;
            }
        }

        let port = self.port;
        self.port = match self.port.wrapping_add(1) {
            0 => TCP_PORT_KNOWN + 1,
            next => next,
        };
        Ok(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::managed::SlotMap;

    fn handles(count: usize) -> Vec<TcbHandle> {
        let mut keys = SlotMap::new();
        (0..count).map(|_| TcbHandle(keys.insert(()))).collect()
    }

    fn ep(last: u8, port: u16) -> Ipv4Endpoint {
        let addr = if last == 0 { Ipv4Address::UNSPECIFIED } else { Ipv4Address::new(10, 0, 0, last) };
        Ipv4Endpoint::new(addr, port)
    }

    #[test]
    fn exact_match_beats_listener() {
        let h = handles(2);
        let mut table = Table::new(40000);
        assert!(table.insert(h[0], ep(1, 80), ep(0, 0), true));
        assert!(table.insert(h[1], ep(1, 80), ep(2, 5555), false));

        assert_eq!(table.lookup(ep(1, 80), ep(2, 5555), true), Some(h[1]));
        assert_eq!(table.lookup(ep(1, 80), ep(3, 5555), true), Some(h[0]));
        // Listeners only take connection requests.
        assert_eq!(table.lookup(ep(1, 80), ep(3, 5555), false), None);
    }

    #[test]
    fn fewest_wildcards_win() {
        let h = handles(3);
        let mut table = Table::new(40000);
        assert!(table.insert(h[0], ep(0, 80), ep(0, 0), true));
        assert!(table.insert(h[1], ep(1, 80), ep(0, 0), true));
        assert!(table.insert(h[2], ep(1, 80), ep(2, 0), true));

        assert_eq!(table.lookup(ep(1, 80), ep(2, 7), true), Some(h[2]));
        assert_eq!(table.lookup(ep(1, 80), ep(3, 7), true), Some(h[1]));
        assert_eq!(table.lookup(ep(9, 80), ep(3, 7), true), Some(h[0]));
        assert_eq!(table.lookup(ep(9, 81), ep(3, 7), true), None);
    }

    #[test]
    fn hit_moves_to_front() {
        let h = handles(2);
        let mut table = Table::new(40000);
        table.insert(h[0], ep(1, 80), ep(2, 1), false);
        table.insert(h[1], ep(1, 80), ep(2, 2), false);
        assert_eq!(table.active[0].handle, h[1]);
        table.lookup(ep(1, 80), ep(2, 1), false);
        assert_eq!(table.active[0].handle, h[0]);
    }

    #[test]
    fn duplicates_and_unbound_are_refused() {
        let h = handles(3);
        let mut table = Table::new(40000);
        assert!(table.insert(h[0], ep(1, 80), ep(2, 1), false));
        assert!(!table.insert(h[1], ep(1, 80), ep(2, 1), false));
        assert!(!table.insert(h[2], ep(1, 0), ep(2, 1), false));
        table.remove(h[0]);
        assert!(!table.contains(h[0]));
        assert!(table.insert(h[1], ep(1, 80), ep(2, 1), false));
    }

    #[test]
    fn ephemeral_ports_skip_used_and_wrap() {
        let h = handles(2);
        let addr = Ipv4Address::new(10, 0, 0, 1);
        let mut table = Table::new(u16::max_value());
        table.insert(h[0], Ipv4Endpoint::new(addr, u16::max_value()), ep(2, 1), false);

        let port = table.bind(addr, 0).unwrap();
        assert_eq!(port, TCP_PORT_KNOWN + 1);
        assert_eq!(table.bind(addr, 0).unwrap(), TCP_PORT_KNOWN + 2);

        table.insert(h[1], Ipv4Endpoint::new(addr, 8080), ep(0, 0), true);
        assert_eq!(table.bind(addr, 8080), Err(socket::Error::AccessDenied));
        // The same port on another address is free.
        assert_eq!(table.bind(Ipv4Address::new(10, 0, 0, 9), 8080), Ok(8080));
    }
}
