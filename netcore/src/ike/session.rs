//! The IKE SA and the message protection it provides.
use zeroize::Zeroize;

use crate::time::Expiration;
use crate::wire::{self, Ipv4Address};
use crate::wire::ike::{payload, ExchangeType, Flags, Header, Identification, Message, NotifyType};
use crate::wire::ike::{Payload, PayloadType};

use super::{logging, Context, Error, Result, UdpTransport};
use super::child::ChildSa;
use super::crypto::{Crypto, DhSecret};
use super::keys::IkeKeys;
use super::proposal::IkeSuite;
use super::store::Store;

/// The end of the IKE SA, fixed by who sent the first IKE_SA_INIT request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// The state of an IKE SA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    /// The IKE_SA_INIT exchange is in progress.
    Init,
    /// The IKE_AUTH exchange is in progress.
    Auth,
    Established,
    /// The SA is being torn down. This state is never left.
    Deleting,
}

impl State {
    fn name(self) -> &'static str {
        match self {
            State::Init => "INIT",
            State::Auth => "AUTH",
            State::Established => "IKE_SA_ESTABLISHED",
            State::Deleting => "SA_DELETING",
        }
    }
}

/// What the outstanding request of an IKE SA asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pending {
    SaInit,
    Auth,
    CreateChild,
    DeleteIke,
    /// Deletion of the Child SA with our SPI.
    DeleteChild(u32),
}

/// Our request waiting for its response.
///
/// At most one request is in flight per IKE SA. The packet is kept as sent for retransmission.
pub(crate) struct Outstanding {
    pub(crate) message_id: u32,
    pub(crate) pending: Pending,
    pub(crate) packet: Vec<u8>,
    pub(crate) retries: u32,
    pub(crate) due: Expiration,
}

/// How an inbound message relates to the exchanges of its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Inbound {
    /// The next request of the peer.
    Request,
    /// A retransmission of the last request we answered.
    Duplicate,
    /// The response to our outstanding request.
    Response(Pending),
}

pub(crate) struct IkeSa {
    pub(crate) role: Role,
    pub(crate) state: State,
    pub(crate) local: Ipv4Address,
    pub(crate) remote: Ipv4Address,
    pub(crate) spi_i: u64,
    pub(crate) spi_r: u64,
    /// Message id of our next request.
    pub(crate) next_request_id: u32,
    /// Message id of the next request we expect from the peer.
    pub(crate) next_peer_id: u32,
    pub(crate) outstanding: Option<Outstanding>,
    /// Message id and packet of our last response, resent for duplicate requests.
    pub(crate) last_response: Option<(u32, Vec<u8>)>,
    pub(crate) suite: Option<IkeSuite>,
    pub(crate) dh: Option<DhSecret>,
    pub(crate) nonce_i: Vec<u8>,
    pub(crate) nonce_r: Vec<u8>,
    /// The IKE_SA_INIT messages as sent, signed by the authentication payloads.
    pub(crate) init_request: Vec<u8>,
    pub(crate) init_response: Vec<u8>,
    pub(crate) keys: Option<IkeKeys>,
    pub(crate) negotiating: Vec<ChildSa>,
    pub(crate) established: Vec<ChildSa>,
    pub(crate) deleting: Vec<ChildSa>,
    /// End of the negotiation for a responder, end of the lifetime once established.
    pub(crate) expires: Expiration,
    /// Set when the SA is to be removed with everything under it.
    pub(crate) dead: Option<&'static str>,
}

impl IkeSa {
    pub(crate) fn new(role: Role, local: Ipv4Address, remote: Ipv4Address, spi: u64) -> Self {
        let (spi_i, spi_r) = match role {
            Role::Initiator => (spi, 0),
            Role::Responder => (0, spi),
        };
        IkeSa {
            role,
            state: State::Init,
            local,
            remote,
            spi_i,
            spi_r,
            next_request_id: 0,
            next_peer_id: 0,
            outstanding: None,
            last_response: None,
            suite: None,
            dh: None,
            nonce_i: Vec::new(),
            nonce_r: Vec::new(),
            init_request: Vec::new(),
            init_response: Vec::new(),
            keys: None,
            negotiating: Vec::new(),
            established: Vec::new(),
            deleting: Vec::new(),
            expires: Expiration::Never,
            dead: None,
        }
    }

    pub(crate) fn is_initiator(&self) -> bool {
        self.role == Role::Initiator
    }

    pub(crate) fn set_state(&mut self, state: State) {
        if self.state != state {
            logging::state_transition(self.spi_i, self.spi_r, self.state.name(), state.name());
            self.state = state;
        }
    }

    /// Mark the SA for removal.
    pub(crate) fn kill(&mut self, reason: &'static str) {
        if self.dead.is_none() {
            self.dead = Some(reason);
        }
    }

    pub(crate) fn header(&self, exchange_type: ExchangeType, message_id: u32, response: bool) -> Header {
        Header {
            spi_i: self.spi_i,
            spi_r: self.spi_r,
            next_payload: PayloadType::None,
            exchange_type,
            flags: Flags::new(self.is_initiator(), response),
            message_id,
            length: 0,
        }
    }

    pub(crate) fn keys(&self) -> Result<(&IkeSuite, &IkeKeys)> {
        match (&self.suite, &self.keys) {
            (Some(suite), Some(keys)) => Ok((suite, keys)),
            _ => Err(Error::InvalidState("no keys yet")),
        }
    }

    /// Relate the header of an inbound message to our exchanges.
    pub(crate) fn classify(&self, header: &Header) -> Result<Inbound> {
        if header.flags.initiator() == self.is_initiator() {
            return Err(Error::InvalidMessage("initiator flag does not match the role"));
        }
        if header.spi_i != self.spi_i {
            return Err(Error::InvalidMessage("initiator SPI"));
        }
        // The first request and the first response carry no responder SPI we could compare.
        let first = header.exchange_type == ExchangeType::IkeSaInit
            && (self.spi_r == 0 || header.spi_r == 0);
        if !first && header.spi_r != self.spi_r {
            return Err(Error::InvalidMessage("responder SPI"));
        }

        if header.flags.response() {
            match &self.outstanding {
                Some(out) if out.message_id == header.message_id => Ok(Inbound::Response(out.pending)),
                _ => Err(Error::InvalidMessage("unexpected response")),
            }
        } else if header.message_id == self.next_peer_id {
            Ok(Inbound::Request)
        } else {
            match &self.last_response {
                Some((id, _)) if *id == header.message_id => Ok(Inbound::Duplicate),
                _ => Err(Error::InvalidMessage("message id out of window")),
            }
        }
    }

    /// Resend the cached response to a retransmitted request.
    pub(crate) fn replay<T: UdpTransport, C: Crypto, S: Store>(
        &self,
        cx: &mut Context<T, C, S>,
        header: &Header,
    ) -> Result<()> {
        match &self.last_response {
            Some((id, packet)) if *id == header.message_id => {
                cx.send(self.remote, packet);
                Ok(())
            },
            _ => Err(Error::InvalidMessage("message id out of window")),
        }
    }

    /// Send a new request and arm its retransmission.
    pub(crate) fn send_request<T: UdpTransport, C: Crypto, S: Store>(
        &mut self,
        cx: &mut Context<T, C, S>,
        message_id: u32,
        pending: Pending,
        packet: Vec<u8>,
    ) {
        cx.send(self.remote, &packet);
        self.next_request_id = message_id.wrapping_add(1);
        self.outstanding = Some(Outstanding {
            message_id,
            pending,
            packet,
            retries: 0,
            due: Expiration::after(cx.now, cx.config.retry_interval),
        });
    }

    /// Send the response to the peer's current request and remember it.
    pub(crate) fn respond<T: UdpTransport, C: Crypto, S: Store>(
        &mut self,
        cx: &mut Context<T, C, S>,
        message_id: u32,
        packet: Vec<u8>,
    ) {
        cx.send(self.remote, &packet);
        self.next_peer_id = message_id.wrapping_add(1);
        self.last_response = Some((message_id, packet));
    }

    /// Build a message whose payloads are all inside an encrypted payload.
    ///
    /// ```text
    /// SK { IV | E(inner | padding | pad length) | ICV }
    /// ```
    pub(crate) fn seal<C: Crypto>(
        &self,
        crypto: &mut C,
        exchange_type: ExchangeType,
        message_id: u32,
        response: bool,
        inner: &[Payload],
    ) -> Result<Vec<u8>> {
        let (suite, keys) = self.keys()?;
        let (encr_key, integ_key) = keys.protect(self.is_initiator());
        let block = suite.encryption.block_len();
        let icv_len = suite.integrity.icv_len();

        let (first, mut plain) = payload::emit_chain(inner);
        let pad_len = (block - (plain.len() + 1) % block) % block;
        plain.resize(plain.len() + pad_len, 0);
        plain.push(pad_len as u8);

        let mut data = vec![0; block];
        crypto.random_bytes(&mut data);
        let sealed = crypto.encrypt(suite.encryption, encr_key, &data, &plain)?;
        data.extend_from_slice(&sealed);
        data.resize(data.len() + icv_len, 0);

        let message = Message {
            header: self.header(exchange_type, message_id, response),
            payloads: vec![Payload::Encrypted { first, data }],
        };
        let mut packet = message.emit();
        let covered = packet.len() - icv_len;
        let icv = suite.integrity.compute(crypto, integ_key, &packet[..covered])?;
        packet[covered..].copy_from_slice(&icv);
        Ok(packet)
    }

    /// Check and decrypt the encrypted payload of an inbound message.
    pub(crate) fn open<C: Crypto>(&self, crypto: &C, raw: &[u8], message: &Message) -> Result<Vec<Payload>> {
        let (suite, keys) = self.keys()?;
        let (first, data) = match message.payloads.last() {
            Some(Payload::Encrypted { first, data }) => (*first, data),
            _ => return Err(Error::InvalidPayload("missing encrypted payload")),
        };
        let (encr_key, integ_key) = keys.protect(message.header.flags.initiator());
        let block = suite.encryption.block_len();
        let icv_len = suite.integrity.icv_len();

        let raw = message_bytes(raw, &message.header);
        if data.len() < block + icv_len || raw.len() < icv_len {
            return Err(Error::InvalidPayload("encrypted payload too short"));
        }
        let covered = raw.len() - icv_len;
        let expected = suite.integrity.compute(crypto, integ_key, &raw[..covered])?;
        if !verify(&expected, &raw[covered..]) {
            return Err(Error::Wire(wire::Error::WrongChecksum));
        }

        let iv = &data[..block];
        let sealed = &data[block..data.len() - icv_len];
        let mut plain = crypto.decrypt(suite.encryption, encr_key, iv, sealed)?;
        let pad_len = match plain.last() {
            Some(&len) if (len as usize) < plain.len() => len as usize,
            _ => return Err(Error::InvalidPayload("padding")),
        };
        plain.truncate(plain.len() - pad_len - 1);
        Ok(payload::parse_chain(first, &plain)?)
    }

    /// The authentication data of RFC 7296 section 2.15 for a pre-shared key.
    ///
    /// ```text
    /// prf(prf(psk, "Key Pad for IKEv2"), init message | peer nonce | prf(SK_p, ID))
    /// ```
    ///
    /// The initiator signs its `IKE_SA_INIT` request and the responder's nonce, the responder its
    /// response and the initiator's nonce.
    pub(crate) fn auth_data<C: Crypto>(
        &self,
        crypto: &C,
        psk: &[u8],
        from_initiator: bool,
        id: &Identification,
    ) -> Result<Vec<u8>> {
        let (suite, keys) = self.keys()?;
        let prf = suite.prf;
        let (message, nonce, sk_p) = if from_initiator {
            (&self.init_request, &self.nonce_r, &keys.sk_pi)
        } else {
            (&self.init_response, &self.nonce_i, &keys.sk_pr)
        };
        let signed_id = prf.compute(crypto, sk_p, &[&id.body()[..]])?;
        let mut secret = prf.compute(crypto, psk, &[KEY_PAD])?;
        let auth = prf.compute(crypto, &secret, &[&message[..], &nonce[..], &signed_id[..]]);
        secret.zeroize();
        auth
    }

    /// Every Child SA of the session, whatever its state.
    pub(crate) fn children(&self) -> impl Iterator<Item=&ChildSa> + '_ {
        self.negotiating.iter().chain(&self.established).chain(&self.deleting)
    }
}

const KEY_PAD: &[u8] = b"Key Pad for IKEv2";

/// The octets of a message as covered by its length field.
pub(crate) fn message_bytes<'a>(raw: &'a [u8], header: &Header) -> &'a [u8] {
    raw.get(..header.length as usize).unwrap_or(raw)
}

/// Compare authentication data without an early exit.
pub(crate) fn verify(expected: &[u8], received: &[u8]) -> bool {
    expected.len() == received.len()
        && expected.iter().zip(received).fold(0, |acc, (a, b)| acc | (a ^ b)) == 0
}

/// The first payload matching the projection.
pub(crate) fn find<'a, U, F>(payloads: &'a [Payload], f: F) -> Option<U>
    where F: FnMut(&'a Payload) -> Option<U>
{
    payloads.iter().filter_map(f).next()
}

/// The first error notification, if the peer sent one.
pub(crate) fn error_notify(payloads: &[Payload]) -> Option<NotifyType> {
    find(payloads, |payload| match payload {
        Payload::Notify(notify) if notify.is_error() => Some(notify.kind),
        _ => None,
    })
}
