//! The exchanges of RFC 7296 and how they advance a session.
//!
//! Every handler works on a session taken out of its table. Handlers that give the session up
//! mark it dead, the engine tears it down when filing it back.
use zeroize::Zeroize;

use crate::time::Expiration;
use crate::wire::ike::{Delete, ExchangeType, Identification, Message, Notify, NotifyType};
use crate::wire::ike::{Payload, Proposal, ProtocolId, TrafficSelector};
use crate::wire::ike::payload::AUTH_SHARED_KEY;

use super::{logging, Context, Error, Result, UdpTransport, NONCE_LEN_MAX, NONCE_LEN_MIN};
use super::child::{self, ChildSa};
use super::crypto::Crypto;
use super::keys::{ChildKeys, IkeKeys};
use super::proposal::{self, EspSuite, PREFERRED_GROUP};
use super::session::{self, error_notify, find, IkeSa, Inbound, Pending, Role, State};
use super::store::{self, Store};

impl IkeSa {
    /// Send the `IKE_SA_INIT` request of a new initiator.
    pub(crate) fn start<T: UdpTransport, C: Crypto, S: Store>(&mut self, cx: &mut Context<T, C, S>)
        -> Result<()>
    {
        let dh = cx.crypto.dh_generate(PREFERRED_GROUP)?;
        self.nonce_i = cx.nonce();
        let packet = Message {
            header: self.header(ExchangeType::IkeSaInit, 0, false),
            payloads: vec![
                Payload::SecurityAssociation(proposal::ike_offer()),
                Payload::KeyExchange { group: dh.group().id(), data: dh.public().to_vec() },
                Payload::Nonce(self.nonce_i.clone()),
            ],
        }.emit();
        self.init_request = packet.clone();
        self.dh = Some(dh);
        self.send_request(cx, 0, Pending::SaInit, packet);
        Ok(())
    }

    /// Process a message of `IKE_SA_INIT` or `IKE_AUTH`.
    pub(crate) fn on_negotiation<T: UdpTransport, C: Crypto, S: Store>(
        &mut self,
        cx: &mut Context<T, C, S>,
        raw: &[u8],
        message: &Message,
    ) -> Result<()> {
        let exchange = message.header.exchange_type;
        match self.classify(&message.header)? {
            Inbound::Duplicate => self.replay(cx, &message.header),
            Inbound::Request => match (self.role, self.state, exchange) {
                (Role::Responder, State::Init, ExchangeType::IkeSaInit) => self.respond_init(cx, raw, message),
                (Role::Responder, State::Auth, ExchangeType::IkeAuth) => self.respond_auth(cx, raw, message),
                _ => Err(Error::InvalidMessage("unexpected request")),
            },
            Inbound::Response(Pending::SaInit) if exchange == ExchangeType::IkeSaInit =>
                self.on_init_response(cx, raw, message),
            Inbound::Response(Pending::Auth) if exchange == ExchangeType::IkeAuth =>
                self.on_auth_response(cx, raw, message),
            Inbound::Response(_) => Err(Error::InvalidMessage("unexpected response")),
        }
    }

    fn respond_init<T: UdpTransport, C: Crypto, S: Store>(
        &mut self,
        cx: &mut Context<T, C, S>,
        raw: &[u8],
        message: &Message,
    ) -> Result<()> {
        let mid = message.header.message_id;
        let offered = sa_payload(&message.payloads)?;
        let (group, public) = ke_payload(&message.payloads)?;
        let nonce = nonce_payload(&message.payloads)?;

        let (answer, suite) = match proposal::select_ike(offered, &cx.crypto) {
            Ok(chosen) => chosen,
            Err(err) => {
                self.refuse(cx, mid, Notify::new(NotifyType::NoProposalChosen));
                return Err(err);
            },
        };
        if group != suite.dh.id() {
            let mut notify = Notify::new(NotifyType::InvalidKePayload);
            notify.data = suite.dh.id().to_be_bytes().to_vec();
            self.refuse(cx, mid, notify);
            return Err(Error::InvalidPayload("key exchange group"));
        }

        let dh = cx.crypto.dh_generate(suite.dh)?;
        let mut shared = cx.crypto.dh_compute(&dh, public)?;
        self.nonce_i = nonce.to_vec();
        self.nonce_r = cx.nonce();
        let keys = IkeKeys::derive(
            &cx.crypto, &suite, &self.nonce_i, &self.nonce_r, &shared, self.spi_i, self.spi_r);
        shared.zeroize();
        self.keys = Some(keys?);
        self.suite = Some(suite);

        let response = Message {
            header: self.header(ExchangeType::IkeSaInit, mid, true),
            payloads: vec![
                Payload::SecurityAssociation(vec![answer]),
                Payload::KeyExchange { group: suite.dh.id(), data: dh.public().to_vec() },
                Payload::Nonce(self.nonce_r.clone()),
            ],
        }.emit();
        self.init_request = session::message_bytes(raw, &message.header).to_vec();
        self.init_response = response.clone();
        self.respond(cx, mid, response);
        self.set_state(State::Auth);
        Ok(())
    }

    /// Answer an `IKE_SA_INIT` request with an error and give the session up.
    fn refuse<T: UdpTransport, C: Crypto, S: Store>(
        &mut self,
        cx: &mut Context<T, C, S>,
        mid: u32,
        notify: Notify,
    ) {
        let packet = Message {
            header: self.header(ExchangeType::IkeSaInit, mid, true),
            payloads: vec![Payload::Notify(notify)],
        }.emit();
        self.respond(cx, mid, packet);
        self.kill("no acceptable IKE proposal");
    }

    fn on_init_response<T: UdpTransport, C: Crypto, S: Store>(
        &mut self,
        cx: &mut Context<T, C, S>,
        raw: &[u8],
        message: &Message,
    ) -> Result<()> {
        let payloads = &message.payloads;
        if let Some(kind) = error_notify(payloads) {
            self.outstanding = None;
            self.kill(match kind {
                NotifyType::NoProposalChosen => "peer chose no proposal",
                NotifyType::InvalidKePayload => "peer requires another key exchange group",
                _ => "peer refused IKE_SA_INIT",
            });
            return Ok(());
        }

        let suite = proposal::accept_ike(sa_payload(payloads)?, &cx.crypto)?;
        let (group, public) = ke_payload(payloads)?;
        let nonce = nonce_payload(payloads)?;
        let psk = store::find_psk(&cx.store, self.remote).ok_or(Error::AuthenticationFailed)?;
        let dh = match &self.dh {
            Some(dh) if dh.group() == suite.dh && group == suite.dh.id() => dh,
            _ => return Err(Error::InvalidPayload("key exchange group")),
        };
        let mut shared = cx.crypto.dh_compute(dh, public)?;
        let keys = IkeKeys::derive(
            &cx.crypto, &suite, &self.nonce_i, nonce, &shared, self.spi_i, message.header.spi_r);
        shared.zeroize();
        let keys = keys?;

        self.spi_r = message.header.spi_r;
        self.nonce_r = nonce.to_vec();
        self.keys = Some(keys);
        self.suite = Some(suite);
        self.dh = None;
        self.init_response = session::message_bytes(raw, &message.header).to_vec();

        // The first Child SA rides on IKE_AUTH.
        let spi = cx.alloc_spi()?;
        let mut child = ChildSa::new(&cx.store, self.local, self.remote, spi, cx.config.child_lifetime);
        child.initiator = true;
        let (ts_i, ts_r) = child.ts_pair();

        let id = Identification::ipv4(self.local);
        let mid = self.next_request_id;
        let packet = self.auth_data(&cx.crypto, &psk, true, &id).and_then(|auth| {
            let inner = [
                Payload::IdInitiator(id),
                Payload::Authentication { method: AUTH_SHARED_KEY, data: auth },
                Payload::SecurityAssociation(proposal::esp_offer(spi)),
                Payload::TsInitiator(ts_i),
                Payload::TsResponder(ts_r),
            ];
            self.seal(&mut cx.crypto, ExchangeType::IkeAuth, mid, false, &inner)
        });
        let packet = match packet {
            Ok(packet) => packet,
            Err(err) => {
                cx.release_spi(spi);
                return Err(err);
            },
        };
        self.negotiating.push(child);
        self.send_request(cx, mid, Pending::Auth, packet);
        self.set_state(State::Auth);
        Ok(())
    }

    fn respond_auth<T: UdpTransport, C: Crypto, S: Store>(
        &mut self,
        cx: &mut Context<T, C, S>,
        raw: &[u8],
        message: &Message,
    ) -> Result<()> {
        let mid = message.header.message_id;
        let payloads = self.open(&cx.crypto, raw, message)?;
        let id = find(&payloads, |payload| match payload {
            Payload::IdInitiator(id) => Some(id),
            _ => None,
        }).ok_or(Error::InvalidPayload("missing initiator identification"))?;
        let (method, data) = auth_payload(&payloads)?;
        let psk = store::find_psk(&cx.store, self.remote).ok_or(Error::AuthenticationFailed)?;
        let expected = self.auth_data(&cx.crypto, &psk, true, id)?;
        if method != AUTH_SHARED_KEY || !session::verify(&expected, data) {
            self.notify_error(cx, ExchangeType::IkeAuth, mid, NotifyType::AuthenticationFailed)?;
            self.kill("authentication failed");
            return Err(Error::AuthenticationFailed);
        }

        let (answer, mut child) = match self.accept_child(cx, &payloads) {
            Ok(accepted) => accepted,
            Err(err) => {
                self.notify_error(cx, ExchangeType::IkeAuth, mid, NotifyType::NoProposalChosen)?;
                self.kill("no acceptable Child SA");
                return Err(err);
            },
        };

        let id = Identification::ipv4(self.local);
        let head = match self.auth_data(&cx.crypto, &psk, false, &id) {
            Ok(auth) => vec![
                Payload::IdResponder(id),
                Payload::Authentication { method: AUTH_SHARED_KEY, data: auth },
            ],
            Err(err) => {
                cx.release_spi(child.local_spi);
                return Err(err);
            },
        };
        let packet = self.child_response(
            &mut cx.crypto, ExchangeType::IkeAuth, mid, head, answer, &self.nonce_i, &self.nonce_r, &mut child);
        let packet = match packet {
            Ok(packet) => packet,
            Err(err) => {
                cx.release_spi(child.local_spi);
                return Err(err);
            },
        };
        self.respond(cx, mid, packet);
        self.establish(cx, child)
    }

    fn on_auth_response<T: UdpTransport, C: Crypto, S: Store>(
        &mut self,
        cx: &mut Context<T, C, S>,
        raw: &[u8],
        message: &Message,
    ) -> Result<()> {
        let payloads = self.open(&cx.crypto, raw, message)?;
        if let Some(kind) = error_notify(&payloads) {
            self.outstanding = None;
            self.kill(match kind {
                NotifyType::AuthenticationFailed => "peer rejected our authentication",
                _ => "peer refused IKE_AUTH",
            });
            return Ok(());
        }

        let id = find(&payloads, |payload| match payload {
            Payload::IdResponder(id) => Some(id),
            _ => None,
        }).ok_or(Error::InvalidPayload("missing responder identification"))?;
        let (method, data) = auth_payload(&payloads)?;
        let psk = store::find_psk(&cx.store, self.remote).ok_or(Error::AuthenticationFailed)?;
        let expected = self.auth_data(&cx.crypto, &psk, false, id)?;
        if method != AUTH_SHARED_KEY || !session::verify(&expected, data) {
            self.outstanding = None;
            self.kill("authentication failed");
            return Err(Error::AuthenticationFailed);
        }

        let accepted = sa_payload(&payloads)
            .and_then(|chosen| proposal::accept_esp(chosen, &cx.crypto))
            .and_then(|(esp, peer_spi)| {
                let (ts_i, ts_r) = ts_payloads(&payloads)?;
                let keys = self.child_keys(&cx.crypto, &esp, &self.nonce_i, &self.nonce_r)?;
                Ok((esp, peer_spi, ts_i.to_vec(), ts_r.to_vec(), keys))
            });
        let (esp, peer_spi, ts_i, ts_r, keys) = match accepted {
            Ok(accepted) => accepted,
            Err(err) => {
                self.outstanding = None;
                self.kill("no acceptable Child SA");
                return Err(err);
            },
        };
        let mut child = self.negotiating.pop().ok_or(Error::InvalidState("no Child SA negotiating"))?;
        child.peer_spi = peer_spi;
        child.suite = Some(esp);
        child.keys = Some(keys);
        child.set_ts_pair(ts_i, ts_r);
        self.outstanding = None;
        self.establish(cx, child)
    }

    /// Take a Child SA proposed by the peer, allocating our SPI for it.
    fn accept_child<T: UdpTransport, C: Crypto, S: Store>(
        &self,
        cx: &mut Context<T, C, S>,
        payloads: &[Payload],
    ) -> Result<(Proposal, ChildSa)> {
        let offered = sa_payload(payloads)?;
        let (ts_i, ts_r) = ts_payloads(payloads)?;
        let spi = cx.alloc_spi()?;
        let (answer, suite, peer_spi) = match proposal::select_esp(offered, &cx.crypto, spi) {
            Ok(chosen) => chosen,
            Err(err) => {
                cx.release_spi(spi);
                return Err(err);
            },
        };
        let mut child = ChildSa::new(&cx.store, self.local, self.remote, spi, cx.config.child_lifetime);
        child.peer_spi = peer_spi;
        child.suite = Some(suite);
        child.set_ts_pair(ts_i.to_vec(), ts_r.to_vec());
        Ok((answer, child))
    }

    fn child_keys<C: Crypto>(&self, crypto: &C, esp: &EspSuite, nonce_i: &[u8], nonce_r: &[u8])
        -> Result<ChildKeys>
    {
        let (suite, keys) = self.keys()?;
        keys.child(crypto, suite, esp, nonce_i, nonce_r)
    }

    /// Derive the keys of an accepted Child SA and seal the response announcing it.
    fn child_response<C: Crypto>(
        &self,
        crypto: &mut C,
        exchange: ExchangeType,
        mid: u32,
        mut payloads: Vec<Payload>,
        answer: Proposal,
        nonce_i: &[u8],
        nonce_r: &[u8],
        child: &mut ChildSa,
    ) -> Result<Vec<u8>> {
        let esp = child.suite.ok_or(Error::InvalidState("Child SA without suite"))?;
        child.keys = Some(self.child_keys(&*crypto, &esp, nonce_i, nonce_r)?);
        let (ts_i, ts_r) = child.ts_pair();
        payloads.push(Payload::SecurityAssociation(vec![answer]));
        payloads.push(Payload::TsInitiator(ts_i));
        payloads.push(Payload::TsResponder(ts_r));
        self.seal(crypto, exchange, mid, true, &payloads)
    }

    /// Answer the current request with a sealed error notification.
    fn notify_error<T: UdpTransport, C: Crypto, S: Store>(
        &mut self,
        cx: &mut Context<T, C, S>,
        exchange: ExchangeType,
        mid: u32,
        kind: NotifyType,
    ) -> Result<()> {
        let inner = [Payload::Notify(Notify::new(kind))];
        let packet = self.seal(&mut cx.crypto, exchange, mid, true, &inner)?;
        self.respond(cx, mid, packet);
        Ok(())
    }

    /// Write a negotiated Child SA to the association database and start its lifetime.
    ///
    /// The first Child SA completes the session.
    fn establish<T: UdpTransport, C: Crypto, S: Store>(
        &mut self,
        cx: &mut Context<T, C, S>,
        mut child: ChildSa,
    ) -> Result<()> {
        if let Err(err) = child::store_sa_data(&mut cx.store, self.local, self.remote, &child) {
            cx.release_spi(child.local_spi);
            if self.state != State::Established {
                self.kill("association database refused the Child SA");
            }
            return Err(err);
        }
        child.expires = Expiration::after(cx.now, child.lifetime);
        logging::child_established(self.remote, child.local_spi, child.peer_spi);
        self.established.push(child);

        if self.state != State::Established {
            let lifetime = store::find_policy(&cx.store, self.local, self.remote)
                .and_then(|(_, policy)| policy.ike_lifetime)
                .unwrap_or(cx.config.ike_lifetime);
            self.expires = Expiration::after(cx.now, lifetime);
            self.dh = None;
            self.set_state(State::Established);
        }
        Ok(())
    }

    /// Request a new Child SA under the established session.
    pub(crate) fn create_child<T: UdpTransport, C: Crypto, S: Store>(&mut self, cx: &mut Context<T, C, S>)
        -> Result<()>
    {
        if self.state != State::Established {
            return Err(Error::InvalidState("IKE SA not established"));
        }
        if self.outstanding.is_some() {
            return Err(Error::InvalidState("exchange in progress"));
        }

        let spi = cx.alloc_spi()?;
        let mut child = ChildSa::new(&cx.store, self.local, self.remote, spi, cx.config.child_lifetime);
        child.initiator = true;
        child.nonce = cx.nonce();
        let (ts_i, ts_r) = child.ts_pair();
        let inner = [
            Payload::SecurityAssociation(proposal::esp_offer(spi)),
            Payload::Nonce(child.nonce.clone()),
            Payload::TsInitiator(ts_i),
            Payload::TsResponder(ts_r),
        ];
        let mid = self.next_request_id;
        match self.seal(&mut cx.crypto, ExchangeType::CreateChildSa, mid, false, &inner) {
            Ok(packet) => {
                self.negotiating.push(child);
                self.send_request(cx, mid, Pending::CreateChild, packet);
                Ok(())
            },
            Err(err) => {
                cx.release_spi(spi);
                Err(err)
            },
        }
    }

    /// Process a message of `CREATE_CHILD_SA`.
    pub(crate) fn on_child_message<T: UdpTransport, C: Crypto, S: Store>(
        &mut self,
        cx: &mut Context<T, C, S>,
        raw: &[u8],
        message: &Message,
    ) -> Result<()> {
        match self.classify(&message.header)? {
            Inbound::Duplicate => self.replay(cx, &message.header),
            Inbound::Request => self.on_create_child_request(cx, raw, message),
            Inbound::Response(Pending::CreateChild) => self.on_create_child_response(cx, raw, message),
            Inbound::Response(_) => Err(Error::InvalidMessage("unexpected response")),
        }
    }

    /// Create a Child SA for the peer.
    ///
    /// A request carrying a `REKEY_SA` notification, or none of the traffic selectors of a new
    /// Child SA, asks for a rekey. Rekeying is not implemented and refused.
    fn on_create_child_request<T: UdpTransport, C: Crypto, S: Store>(
        &mut self,
        cx: &mut Context<T, C, S>,
        raw: &[u8],
        message: &Message,
    ) -> Result<()> {
        let mid = message.header.message_id;
        let payloads = self.open(&cx.crypto, raw, message)?;
        let rekey = payloads.iter().any(|payload| match payload {
            Payload::Notify(notify) => notify.kind == NotifyType::RekeySa,
            _ => false,
        });
        let selectors = find(&payloads, |payload| match payload {
            Payload::TsInitiator(_) => Some(()),
            _ => None,
        }).is_some();
        if rekey || !selectors {
            self.notify_error(cx, ExchangeType::CreateChildSa, mid, NotifyType::NoProposalChosen)?;
            return Err(Error::Unsupported);
        }
        if self.state != State::Established {
            self.notify_error(cx, ExchangeType::CreateChildSa, mid, NotifyType::NoAdditionalSas)?;
            return Err(Error::InvalidState("IKE SA is being deleted"));
        }

        let nonce_i = nonce_payload(&payloads)?.to_vec();
        let (answer, mut child) = match self.accept_child(cx, &payloads) {
            Ok(accepted) => accepted,
            Err(err) => {
                self.notify_error(cx, ExchangeType::CreateChildSa, mid, NotifyType::NoProposalChosen)?;
                return Err(err);
            },
        };
        let nonce_r = cx.nonce();
        let head = vec![Payload::Nonce(nonce_r.clone())];
        let packet = self.child_response(
            &mut cx.crypto, ExchangeType::CreateChildSa, mid, head, answer, &nonce_i, &nonce_r, &mut child);
        let packet = match packet {
            Ok(packet) => packet,
            Err(err) => {
                cx.release_spi(child.local_spi);
                return Err(err);
            },
        };
        self.respond(cx, mid, packet);
        self.establish(cx, child)
    }

    fn on_create_child_response<T: UdpTransport, C: Crypto, S: Store>(
        &mut self,
        cx: &mut Context<T, C, S>,
        raw: &[u8],
        message: &Message,
    ) -> Result<()> {
        let payloads = self.open(&cx.crypto, raw, message)?;
        self.outstanding = None;
        let mut child = self.negotiating.pop().ok_or(Error::InvalidState("no Child SA negotiating"))?;
        let completed = match error_notify(&payloads) {
            Some(_) => Err(Error::NoProposalChosen),
            None => self.complete_child(&cx.crypto, &payloads, &mut child),
        };
        match completed {
            Ok(()) => self.establish(cx, child)?,
            Err(err) => {
                cx.release_spi(child.local_spi);
                self.kick(cx)?;
                return Err(err);
            },
        }
        self.kick(cx)
    }

    /// Take over what the responder chose for a Child SA we requested.
    fn complete_child<C: Crypto>(&self, crypto: &C, payloads: &[Payload], child: &mut ChildSa)
        -> Result<()>
    {
        let (esp, peer_spi) = proposal::accept_esp(sa_payload(payloads)?, crypto)?;
        let nonce_r = nonce_payload(payloads)?;
        let (ts_i, ts_r) = ts_payloads(payloads)?;
        let keys = self.child_keys(crypto, &esp, &child.nonce, nonce_r)?;
        child.keys = Some(keys);
        child.peer_spi = peer_spi;
        child.suite = Some(esp);
        child.set_ts_pair(ts_i.to_vec(), ts_r.to_vec());
        Ok(())
    }

    /// Send the next queued deletion.
    ///
    /// Deleting the IKE SA takes precedence over deleting single Child SAs. With nothing queued
    /// there is nothing to say, liveness checks are not implemented.
    pub(crate) fn send_info<T: UdpTransport, C: Crypto, S: Store>(&mut self, cx: &mut Context<T, C, S>)
        -> Result<()>
    {
        if self.outstanding.is_some() {
            return Ok(());
        }
        let (delete, pending) = if self.state == State::Deleting {
            (Delete { protocol: ProtocolId::Ike, spis: Vec::new() }, Pending::DeleteIke)
        } else if let Some(child) = self.deleting.first() {
            let spis = vec![child.local_spi.to_be_bytes().to_vec()];
            (Delete { protocol: ProtocolId::Esp, spis }, Pending::DeleteChild(child.local_spi))
        } else {
            return Err(Error::Unsupported);
        };
        let mid = self.next_request_id;
        let packet = self.seal(&mut cx.crypto, ExchangeType::Informational, mid, false, &[Payload::Delete(delete)])?;
        self.send_request(cx, mid, pending, packet);
        Ok(())
    }

    /// Start the next queued deletion once nothing is in flight.
    pub(crate) fn kick<T: UdpTransport, C: Crypto, S: Store>(&mut self, cx: &mut Context<T, C, S>)
        -> Result<()>
    {
        let queued = self.state == State::Deleting || !self.deleting.is_empty();
        if self.outstanding.is_none() && self.dead.is_none() && queued {
            self.send_info(cx)
        } else {
            Ok(())
        }
    }

    /// Delete the IKE SA with everything under it.
    ///
    /// Traffic of the Child SAs stops at once. A session still negotiating has no keys to tell the
    /// peer and is dropped silently.
    pub(crate) fn begin_delete<T: UdpTransport, C: Crypto, S: Store>(&mut self, cx: &mut Context<T, C, S>)
        -> Result<()>
    {
        match self.state {
            State::Init | State::Auth => {
                self.kill("deleted during negotiation");
                return Ok(());
            },
            State::Deleting => return Ok(()),
            State::Established => {},
        }
        for child in self.established.drain(..) {
            if let Err(err) = child::remove_sa_data(&mut cx.store, self.local, self.remote, &child) {
                logging::store_failed(self.remote, &err);
            }
            logging::child_removed(self.remote, child.local_spi);
            self.deleting.push(child);
        }
        self.set_state(State::Deleting);
        // Our request in flight is abandoned, the delete replaces it.
        self.outstanding = None;
        self.send_info(cx)
    }

    /// Queue the deletion of the Child SA with our inbound `spi`.
    pub(crate) fn queue_child_delete<T: UdpTransport, C: Crypto, S: Store>(
        &mut self,
        cx: &mut Context<T, C, S>,
        spi: u32,
    ) -> Result<()> {
        if self.state != State::Established {
            return Err(Error::InvalidState("IKE SA not established"));
        }
        let pos = self.established.iter()
            .position(|child| child.local_spi == spi)
            .ok_or(Error::SaNotFound)?;
        let child = self.established.remove(pos);
        if let Err(err) = child::remove_sa_data(&mut cx.store, self.local, self.remote, &child) {
            logging::store_failed(self.remote, &err);
        }
        logging::child_removed(self.remote, spi);
        self.deleting.push(child);
        self.kick(cx)
    }

    /// A queued Child SA deletion finished, acknowledged or not.
    ///
    /// Deleting the last Child SA we own deletes the IKE SA as well.
    pub(crate) fn child_deleted<T: UdpTransport, C: Crypto, S: Store>(
        &mut self,
        cx: &mut Context<T, C, S>,
        spi: u32,
    ) {
        if let Some(pos) = self.deleting.iter().position(|child| child.local_spi == spi) {
            self.deleting.remove(pos);
            cx.release_spi(spi);
        }
        let empty = self.negotiating.is_empty() && self.established.is_empty() && self.deleting.is_empty();
        if empty && self.state == State::Established {
            self.set_state(State::Deleting);
        }
    }

    /// Process an informational message.
    pub(crate) fn on_info_message<T: UdpTransport, C: Crypto, S: Store>(
        &mut self,
        cx: &mut Context<T, C, S>,
        raw: &[u8],
        message: &Message,
    ) -> Result<()> {
        match self.classify(&message.header)? {
            Inbound::Duplicate => self.replay(cx, &message.header),
            Inbound::Request => self.on_info_request(cx, raw, message),
            Inbound::Response(pending) => self.on_info_response(cx, raw, message, pending),
        }
    }

    /// Answer an informational request, carrying out the deletions in it.
    ///
    /// Deleted Child SAs are answered with our SPIs of the same pairs. A deletion of the IKE SA
    /// gets an empty answer and removes the session.
    fn on_info_request<T: UdpTransport, C: Crypto, S: Store>(
        &mut self,
        cx: &mut Context<T, C, S>,
        raw: &[u8],
        message: &Message,
    ) -> Result<()> {
        let mid = message.header.message_id;
        let payloads = self.open(&cx.crypto, raw, message)?;
        let mut ike_deleted = false;
        let mut deleted = Vec::new();
        for payload in &payloads {
            let delete = match payload {
                Payload::Delete(delete) => delete,
                _ => continue,
            };
            match delete.protocol {
                ProtocolId::Ike => ike_deleted = true,
                ProtocolId::Esp => {
                    for peer_spi in delete.spis.iter().filter_map(|spi| esp_spi(spi)) {
                        if let Some(spi) = self.remove_child(cx, peer_spi) {
                            deleted.push(spi.to_be_bytes().to_vec());
                        }
                    }
                },
                _ => {},
            }
        }

        let reply = if ike_deleted || deleted.is_empty() {
            Vec::new()
        } else {
            vec![Payload::Delete(Delete { protocol: ProtocolId::Esp, spis: deleted })]
        };
        let packet = self.seal(&mut cx.crypto, ExchangeType::Informational, mid, true, &reply)?;
        self.respond(cx, mid, packet);
        if ike_deleted {
            self.kill("deleted by peer");
        }
        Ok(())
    }

    /// Remove the Child SA the peer sends with `peer_spi`, returning our SPI of it.
    fn remove_child<T: UdpTransport, C: Crypto, S: Store>(
        &mut self,
        cx: &mut Context<T, C, S>,
        peer_spi: u32,
    ) -> Option<u32> {
        if let Some(pos) = self.established.iter().position(|child| child.peer_spi == peer_spi) {
            let child = self.established.remove(pos);
            if let Err(err) = child::remove_sa_data(&mut cx.store, self.local, self.remote, &child) {
                logging::store_failed(self.remote, &err);
            }
            logging::child_removed(self.remote, child.local_spi);
            cx.release_spi(child.local_spi);
            return Some(child.local_spi);
        }
        // Both ends deleting the same pair. Our own exchange finishes it.
        self.deleting.iter()
            .find(|child| child.peer_spi == peer_spi)
            .map(|child| child.local_spi)
    }

    fn on_info_response<T: UdpTransport, C: Crypto, S: Store>(
        &mut self,
        cx: &mut Context<T, C, S>,
        raw: &[u8],
        message: &Message,
        pending: Pending,
    ) -> Result<()> {
        match pending {
            Pending::DeleteIke | Pending::DeleteChild(_) => {},
            _ => return Err(Error::InvalidMessage("unexpected response")),
        }
        self.open(&cx.crypto, raw, message)?;
        self.outstanding = None;
        match pending {
            Pending::DeleteChild(spi) => {
                self.child_deleted(cx, spi);
                self.kick(cx)
            },
            _ => {
                self.kill("deleted");
                Ok(())
            },
        }
    }
}

fn sa_payload(payloads: &[Payload]) -> Result<&[Proposal]> {
    find(payloads, |payload| match payload {
        Payload::SecurityAssociation(proposals) => Some(&proposals[..]),
        _ => None,
    }).ok_or(Error::InvalidPayload("missing security association"))
}

fn ke_payload(payloads: &[Payload]) -> Result<(u16, &[u8])> {
    find(payloads, |payload| match payload {
        Payload::KeyExchange { group, data } => Some((*group, &data[..])),
        _ => None,
    }).ok_or(Error::InvalidPayload("missing key exchange"))
}

fn nonce_payload(payloads: &[Payload]) -> Result<&[u8]> {
    let nonce = find(payloads, |payload| match payload {
        Payload::Nonce(nonce) => Some(&nonce[..]),
        _ => None,
    }).ok_or(Error::InvalidPayload("missing nonce"))?;
    if nonce.len() < NONCE_LEN_MIN || nonce.len() > NONCE_LEN_MAX {
        return Err(Error::InvalidPayload("nonce length"));
    }
    Ok(nonce)
}

fn auth_payload(payloads: &[Payload]) -> Result<(u8, &[u8])> {
    find(payloads, |payload| match payload {
        Payload::Authentication { method, data } => Some((*method, &data[..])),
        _ => None,
    }).ok_or(Error::InvalidPayload("missing authentication"))
}

/// Both traffic selector lists, neither of them empty.
fn ts_payloads(payloads: &[Payload]) -> Result<(&[TrafficSelector], &[TrafficSelector])> {
    let ts_i = find(payloads, |payload| match payload {
        Payload::TsInitiator(list) => Some(&list[..]),
        _ => None,
    });
    let ts_r = find(payloads, |payload| match payload {
        Payload::TsResponder(list) => Some(&list[..]),
        _ => None,
    });
    match (ts_i, ts_r) {
        (Some(ts_i), Some(ts_r)) if !ts_i.is_empty() && !ts_r.is_empty() => Ok((ts_i, ts_r)),
        _ => Err(Error::InvalidPayload("traffic selectors")),
    }
}

fn esp_spi(raw: &[u8]) -> Option<u32> {
    match *raw {
        [a, b, c, d] => Some(u32::from_be_bytes([a, b, c, d])),
        _ => None,
    }
}
