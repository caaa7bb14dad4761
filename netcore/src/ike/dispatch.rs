//! Demultiplexing of inbound datagrams onto sessions.
use crate::time::Expiration;
use crate::wire::{self, Ipv4Address, Ipv4Endpoint};
use crate::wire::ike::{self, ExchangeType, Message, Packet};

use super::{logging, Engine, Error, Result, UdpTransport};
use super::crypto::Crypto;
use super::session::{IkeSa, Inbound, Role};
use super::store::{self, Store};

impl<T: UdpTransport, C: Crypto, S: Store> Engine<T, C, S> {
    /// Process one UDP datagram received from `src`.
    ///
    /// Datagrams from a port other than 500 are ignored. Messages that do not fit any session are
    /// dropped and the reason returned, nothing is ever sent in response to them.
    pub fn receive(&mut self, src: Ipv4Endpoint, data: &[u8]) -> Result<()> {
        if src.port != ike::PORT {
            return Ok(());
        }
        let result = self.dispatch(src.addr, data);
        if let Err(err) = &result {
            logging::dropped(src.addr, err);
        }
        result
    }

    fn dispatch(&mut self, remote: Ipv4Address, data: &[u8]) -> Result<()> {
        let message = match Message::parse(data) {
            Ok(message) => message,
            // Only raised after the length check, the version octet is there.
            Err(wire::Error::Unrecognized) =>
                return Err(Error::UnsupportedVersion(Packet::new_unchecked(data).version())),
            Err(err) => return Err(err.into()),
        };
        logging::message("in", remote, &message.header);

        match message.header.exchange_type {
            ExchangeType::IkeSaInit | ExchangeType::IkeAuth => self.handle_sa(remote, data, &message),
            ExchangeType::CreateChildSa => self.handle_child_sa(remote, data, &message),
            exchange if exchange.is_informational() => self.handle_info(remote, data, &message),
            exchange => Err(Error::UnsupportedExchangeType(exchange.into())),
        }
    }

    /// Messages of `IKE_SA_INIT` and `IKE_AUTH`.
    ///
    /// A fresh `IKE_SA_INIT` request from an authorized peer without a negotiating session opens
    /// one as responder.
    fn handle_sa(&mut self, remote: Ipv4Address, raw: &[u8], message: &Message) -> Result<()> {
        if let Some(mut sa) = self.negotiating.remove(&remote) {
            let result = sa.on_negotiation(&mut self.cx, raw, message);
            self.file(sa);
            return result;
        }

        // The last IKE_AUTH response may have been lost after we established.
        if let Some(sa) = self.established.get(&remote) {
            if let Ok(Inbound::Duplicate) = sa.classify(&message.header) {
                return sa.replay(&mut self.cx, &message.header);
            }
        }

        let header = &message.header;
        let fresh = header.exchange_type == ExchangeType::IkeSaInit
            && !header.flags.response()
            && header.flags.initiator()
            && header.message_id == 0
            && header.spi_r == 0;
        if !fresh {
            return Err(Error::SaNotFound);
        }
        if store::find_psk(&self.cx.store, remote).is_none() {
            return Err(Error::AuthenticationFailed);
        }
        if self.cx.disable_requested {
            return Err(Error::InvalidState("disabled"));
        }

        let spi = self.cx.ike_spi();
        let mut sa = IkeSa::new(Role::Responder, self.cx.config.local, remote, spi);
        sa.spi_i = header.spi_i;
        let deadline = self.cx.config.retry_interval * (self.cx.config.max_retries + 1);
        sa.expires = Expiration::after(self.cx.now, deadline);
        let result = sa.on_negotiation(&mut self.cx, raw, message);
        if result.is_err() {
            sa.kill("negotiation failed");
        }
        self.file(sa);
        result
    }

    /// Messages of `CREATE_CHILD_SA`, only valid on established sessions.
    fn handle_child_sa(&mut self, remote: Ipv4Address, raw: &[u8], message: &Message) -> Result<()> {
        let mut sa = self.established.remove(&remote).ok_or(Error::SaNotFound)?;
        let result = sa.on_child_message(&mut self.cx, raw, message);
        self.file(sa);
        result
    }

    /// Informational messages.
    ///
    /// A session still negotiating can only use them once its keys are derived.
    fn handle_info(&mut self, remote: Ipv4Address, raw: &[u8], message: &Message) -> Result<()> {
        let mut sa = match self.established.remove(&remote) {
            Some(sa) => sa,
            None => self.negotiating.remove(&remote).ok_or(Error::SaNotFound)?,
        };
        let result = sa.on_info_message(&mut self.cx, raw, message);
        self.file(sa);
        result
    }
}
