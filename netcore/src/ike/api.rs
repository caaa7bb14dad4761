//! Operations of the engine's owner.
use crate::wire::Ipv4Address;

use super::{Config, Engine, Error, Informational, Rekey, Result, UdpTransport};
use super::crypto::Crypto;
use super::session::{IkeSa, Role, State};
use super::store::{self, Status, Store};

impl<T: UdpTransport, C: Crypto, S: Store> Engine<T, C, S> {
    /// Start negotiating an IKE SA with `remote` as initiator.
    ///
    /// Does nothing while a negotiation with the peer is already under way. The peer must have a
    /// pre-shared key in the peer authorization table.
    pub fn negotiate_sa(&mut self, remote: Ipv4Address) -> Result<()> {
        if self.negotiating.contains_key(&remote) {
            return Ok(());
        }
        if self.cx.disable_requested || self.cx.store.status() == Status::Disabled {
            return Err(Error::InvalidState("disabled"));
        }
        if store::find_psk(&self.cx.store, remote).is_none() {
            return Err(Error::InvalidState("no pre-shared key for the peer"));
        }

        let spi = self.cx.ike_spi();
        let mut sa = IkeSa::new(Role::Initiator, self.cx.config.local, remote, spi);
        sa.start(&mut self.cx)?;
        self.file(sa);
        Ok(())
    }

    /// Negotiate an additional Child SA with the established peer.
    ///
    /// Rekeying of either the IKE SA or a Child SA is not implemented.
    pub fn negotiate_child_sa(&mut self, remote: Ipv4Address, rekey: Option<Rekey>) -> Result<()> {
        if rekey.is_some() {
            return Err(Error::Unsupported);
        }
        let mut sa = self.established.remove(&remote).ok_or(Error::SaNotFound)?;
        let result = sa.create_child(&mut self.cx);
        self.file(sa);
        result
    }

    /// Send the next informational exchange queued for the peer.
    ///
    /// That is the deletion of the IKE SA once it is being deleted, else the deletion of the next
    /// queued Child SA. Notifications and liveness checks are not implemented.
    pub fn negotiate_info(&mut self, remote: Ipv4Address, info: Option<Informational>) -> Result<()> {
        if info.is_some() {
            return Err(Error::Unsupported);
        }
        let mut sa = self.take(remote)?;
        let result = sa.send_info(&mut self.cx);
        self.file(sa);
        result
    }

    /// Delete the IKE SA with `remote` and all Child SAs under it.
    pub fn delete_sa(&mut self, remote: Ipv4Address) -> Result<()> {
        let mut sa = self.take(remote)?;
        let result = sa.begin_delete(&mut self.cx);
        self.file(sa);
        result
    }

    /// Delete the Child SA with our inbound `spi`.
    pub fn delete_child_sa(&mut self, remote: Ipv4Address, spi: u32) -> Result<()> {
        let mut sa = self.established.remove(&remote).ok_or(Error::SaNotFound)?;
        let result = sa.queue_child_delete(&mut self.cx, spi);
        self.file(sa);
        result
    }

    /// Delete every session and persist the disabled status once the last one is gone.
    ///
    /// New sessions are refused from now on until `enable` is called.
    pub fn disable(&mut self) -> Result<()> {
        self.cx.disable_requested = true;
        let remotes: Vec<Ipv4Address> = self.negotiating.keys()
            .chain(self.established.keys())
            .cloned()
            .collect();
        for remote in remotes {
            if let Err(err) = self.delete_sa(remote) {
                net_debug!("IKE: delete of {} on disable failed: {}", remote, err);
            }
        }
        if self.negotiating.is_empty() && self.established.is_empty() {
            self.cx.store.set_status(Status::Disabled)?;
        }
        Ok(())
    }

    /// Accept and start sessions again.
    pub fn enable(&mut self) -> Result<()> {
        self.cx.disable_requested = false;
        self.cx.store.set_status(Status::Enabled)
    }

    /// The state of the session with `remote`, a negotiation taking precedence.
    pub fn state(&self, remote: Ipv4Address) -> Option<State> {
        self.negotiating.get(&remote)
            .or_else(|| self.established.get(&remote))
            .map(|sa| sa.state)
    }

    /// Inbound and outbound SPI of each established Child SA with `remote`.
    pub fn child_spis(&self, remote: Ipv4Address) -> Vec<(u32, u32)> {
        self.established.get(&remote)
            .map(|sa| sa.established.iter().map(|child| (child.local_spi, child.peer_spi)).collect())
            .unwrap_or_default()
    }

    pub fn config(&self) -> &Config {
        &self.cx.config
    }

    pub fn store(&self) -> &S {
        &self.cx.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.cx.store
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.cx.transport
    }

    /// Take the session with `remote` out of its table, an established one first.
    fn take(&mut self, remote: Ipv4Address) -> Result<IkeSa> {
        match self.established.remove(&remote) {
            Some(sa) => Ok(sa),
            None => self.negotiating.remove(&remote).ok_or(Error::SaNotFound),
        }
    }
}
