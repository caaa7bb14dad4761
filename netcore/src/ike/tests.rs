use std::collections::VecDeque;

use super::*;
use super::crypto::DhSecret;
use super::proposal::{self, DhGroup, Encryption};
use super::store::{Direction, PeerAuth, SaId};
use crate::time::Instant;
use crate::wire::{self, Ipv4Endpoint, Ipv4Subnet};
use crate::wire::ike::{ExchangeType, Message, Notify, Payload, TrafficSelector};

const A: Ipv4Address = Ipv4Address::new(10, 0, 0, 1);
const B: Ipv4Address = Ipv4Address::new(10, 0, 0, 2);
const PSK: &[u8] = b"correct horse battery staple";

/// A transport recording every datagram.
#[derive(Default)]
struct Wire {
    sent: VecDeque<(Ipv4Address, Ipv4Address, Vec<u8>)>,
    fail: bool,
}

impl UdpTransport for Wire {
    fn send(&mut self, src: Ipv4Address, dst: Ipv4Address, datagram: &[u8]) -> Result<()> {
        if self.fail {
            return Err(Error::Transport);
        }
        self.sent.push_back((src, dst, datagram.to_vec()));
        Ok(())
    }
}

type TestEngine = Engine<Wire>;

/// Software crypto whose ciphers can be switched off.
struct Breakable {
    soft: SoftCrypto,
    broken: bool,
}

impl Crypto for Breakable {
    fn random_bytes(&mut self, buf: &mut [u8]) {
        self.soft.random_bytes(buf)
    }

    fn supports(&self, encryption: Encryption) -> bool {
        self.soft.supports(encryption)
    }

    fn hmac_sha1(&self, key: &[u8], data: &[&[u8]]) -> Result<Vec<u8>> {
        self.soft.hmac_sha1(key, data)
    }

    fn encrypt(&self, encryption: Encryption, key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        if self.broken {
            return Err(Error::CryptoError("broken"));
        }
        self.soft.encrypt(encryption, key, iv, data)
    }

    fn decrypt(&self, encryption: Encryption, key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        self.soft.decrypt(encryption, key, iv, data)
    }

    fn dh_generate(&mut self, group: DhGroup) -> Result<DhSecret> {
        self.soft.dh_generate(group)
    }

    fn dh_compute(&self, secret: &DhSecret, peer: &[u8]) -> Result<Vec<u8>> {
        self.soft.dh_compute(secret, peer)
    }
}

fn engine_with(config: Config, peer: Ipv4Address, psk: Option<&[u8]>, seed: u64) -> TestEngine {
    let mut store = MemoryStore::new();
    if let Some(psk) = psk {
        store.set_peer(Ipv4Subnet::host(peer), Some(PeerAuth { psk: psk.to_vec() })).unwrap();
    }
    Engine::new(config, Wire::default(), SoftCrypto::new(seed), store)
}

fn pair() -> (TestEngine, TestEngine) {
    (engine_with(Config::new(A), B, Some(PSK), 1), engine_with(Config::new(B), A, Some(PSK), 2))
}

fn from(addr: Ipv4Address) -> Ipv4Endpoint {
    Ipv4Endpoint::new(addr, 500)
}

fn next_sent(engine: &mut TestEngine) -> Vec<u8> {
    let (_, _, data) = engine.transport_mut().sent.pop_front().expect("a datagram was sent");
    data
}

/// Deliver datagrams both ways until both engines are quiet.
fn pump(a: &mut TestEngine, b: &mut TestEngine) {
    loop {
        let from_a: Vec<_> = a.transport_mut().sent.drain(..).collect();
        let from_b: Vec<_> = b.transport_mut().sent.drain(..).collect();
        if from_a.is_empty() && from_b.is_empty() {
            return;
        }
        for (src, _, data) in from_a {
            let _ = b.receive(from(src), &data);
        }
        for (src, _, data) in from_b {
            let _ = a.receive(from(src), &data);
        }
    }
}

fn established() -> (TestEngine, TestEngine) {
    let (mut a, mut b) = pair();
    a.negotiate_sa(B).unwrap();
    pump(&mut a, &mut b);
    assert_eq!(a.state(B), Some(State::Established));
    assert_eq!(b.state(A), Some(State::Established));
    (a, b)
}

#[test]
fn establish_ike_sa() {
    let (mut a, mut b) = pair();
    a.negotiate_sa(B).unwrap();
    assert_eq!(a.state(B), Some(State::Init));

    let init = next_sent(&mut a);
    let message = Message::parse(&init).unwrap();
    assert_eq!(message.header.exchange_type, ExchangeType::IkeSaInit);
    assert_eq!(message.header.message_id, 0);
    match &message.payloads[0] {
        Payload::SecurityAssociation(proposals) => assert_eq!(proposals.len(), 2),
        other => panic!("expected proposals, got {:?}", other),
    }

    b.receive(from(A), &init).unwrap();
    assert_eq!(b.state(A), Some(State::Auth));
    let response = next_sent(&mut b);
    a.receive(from(B), &response).unwrap();
    assert_eq!(a.state(B), Some(State::Auth));

    pump(&mut a, &mut b);
    assert_eq!(a.state(B), Some(State::Established));
    assert_eq!(b.state(A), Some(State::Established));

    let children = a.child_spis(B);
    assert_eq!(children.len(), 1);
    let (a_in, a_out) = children[0];
    assert_eq!(b.child_spis(A), vec![(a_out, a_in)]);

    // Two records on each side, and what one side sends with the other receives with.
    assert_eq!(a.store().sas().len(), 2);
    assert_eq!(b.store().sas().len(), 2);
    let id = SaId { spi: a_out, dst: B };
    let sending = a.store().sa(&id).expect("outbound entry of A");
    let receiving = b.store().sa(&id).expect("inbound entry of B");
    assert_eq!(sending.direction, Direction::Outbound);
    assert_eq!(receiving.direction, Direction::Inbound);
    assert_eq!(sending.selector, receiving.selector);
    assert_eq!(sending.selector.local, Ipv4Subnet::host(A));
    assert_eq!(sending.encryption, Encryption::TripleDesCbc);
    assert_eq!(sending.encryption_key.len(), 24);
    assert_eq!(sending.encryption_key, receiving.encryption_key);
    assert_eq!(sending.integrity_key, receiving.integrity_key);

    let back = SaId { spi: a_in, dst: A };
    let returning = a.store().sa(&back).expect("inbound entry of A");
    assert_eq!(returning.encryption_key, b.store().sa(&back).expect("outbound entry of B").encryption_key);
    assert_ne!(returning.encryption_key, sending.encryption_key);
}

#[test]
fn triple_des_session_seals_and_opens() {
    let (mut a, mut b) = established();
    let suite = a.established[&B].suite.expect("suite of the IKE SA");
    assert_eq!(suite.encryption, Encryption::TripleDesCbc);
    assert_eq!(b.established[&A].suite, Some(suite));

    // Lengths around the eight octet block, so padding takes every value.
    for len in 0..9 {
        let inner = [
            Payload::Notify(Notify::new(NotifyType::UseTransportMode)),
            Payload::Nonce(vec![0x5a; 16 + len]),
        ];
        let packet = a.established[&B]
            .seal(&mut a.cx.crypto, ExchangeType::Informational, 9, false, &inner)
            .unwrap();
        let message = Message::parse(&packet).unwrap();
        let opened = b.established[&A].open(&b.cx.crypto, &packet, &message).unwrap();
        assert_eq!(opened, inner.to_vec());

        let mut tampered = packet.clone();
        let last = tampered.len() - 13;
        tampered[last] ^= 1;
        let message = Message::parse(&tampered).unwrap();
        assert_eq!(b.established[&A].open(&b.cx.crypto, &tampered, &message),
            Err(Error::Wire(wire::Error::WrongChecksum)));
    }
}

#[test]
fn failed_auth_request_releases_the_child() {
    let mut store = MemoryStore::new();
    store.set_peer(Ipv4Subnet::host(B), Some(PeerAuth { psk: PSK.to_vec() })).unwrap();
    let crypto = Breakable { soft: SoftCrypto::new(1), broken: false };
    let mut a = Engine::new(Config::new(A), Wire::default(), crypto, store);
    let mut b = engine_with(Config::new(B), A, Some(PSK), 2);

    a.negotiate_sa(B).unwrap();
    let (_, _, init) = a.transport_mut().sent.pop_front().expect("IKE_SA_INIT request");
    b.receive(from(A), &init).unwrap();
    let response = next_sent(&mut b);

    // Sealing the IKE_AUTH request fails after the first Child SA got its SPI.
    a.cx.crypto.broken = true;
    assert_eq!(a.receive(from(B), &response), Err(Error::CryptoError("broken")));
    assert!(a.cx.spis.is_empty());
    assert!(a.negotiating[&B].negotiating.is_empty());
    assert!(a.transport_mut().sent.is_empty());
    assert!(a.store().sas().is_empty());
    assert_eq!(a.state(B), Some(State::Init));
}

#[test]
fn negotiate_twice_is_a_no_op() {
    let (mut a, _) = pair();
    a.negotiate_sa(B).unwrap();
    a.negotiate_sa(B).unwrap();
    assert_eq!(a.transport_mut().sent.len(), 1);
}

#[test]
fn negotiate_needs_a_key() {
    let mut a = engine_with(Config::new(A), B, None, 1);
    assert!(matches!(a.negotiate_sa(B), Err(Error::InvalidState(_))));
    assert!(a.transport_mut().sent.is_empty());
}

#[test]
fn newest_session_wins() {
    let (mut a, mut b) = established();
    let old = a.child_spis(B);

    a.negotiate_sa(B).unwrap();
    pump(&mut a, &mut b);
    assert_eq!(a.state(B), Some(State::Established));
    assert_eq!(b.state(A), Some(State::Established));

    let new = a.child_spis(B);
    assert_eq!(new.len(), 1);
    assert_ne!(new, old);
    assert_eq!(a.store().sas().len(), 2);
    assert_eq!(b.store().sas().len(), 2);
}

#[test]
fn psk_mismatch() {
    let mut a = engine_with(Config::new(A), B, Some(PSK), 1);
    let mut b = engine_with(Config::new(B), A, Some(b"something else"), 2);
    a.negotiate_sa(B).unwrap();
    let init = next_sent(&mut a);
    b.receive(from(A), &init).unwrap();
    let response = next_sent(&mut b);
    a.receive(from(B), &response).unwrap();

    let auth = next_sent(&mut a);
    assert_eq!(b.receive(from(A), &auth), Err(Error::AuthenticationFailed));
    assert_eq!(b.state(A), None);

    let refusal = next_sent(&mut b);
    a.receive(from(B), &refusal).unwrap();
    assert_eq!(a.state(B), None);
    assert!(a.store().sas().is_empty());
    assert!(b.store().sas().is_empty());
}

#[test]
fn unknown_peer_is_ignored() {
    let mut a = engine_with(Config::new(A), B, Some(PSK), 1);
    let mut b = engine_with(Config::new(B), A, None, 2);
    a.negotiate_sa(B).unwrap();
    let init = next_sent(&mut a);
    assert_eq!(b.receive(from(A), &init), Err(Error::AuthenticationFailed));
    assert_eq!(b.state(A), None);
    assert!(b.transport_mut().sent.is_empty());
}

#[test]
fn drop_ikev1_and_foreign_ports() {
    let (mut a, mut b) = pair();
    a.negotiate_sa(B).unwrap();
    let init = next_sent(&mut a);

    assert_eq!(b.receive(Ipv4Endpoint::new(A, 4500), &init), Ok(()));
    assert_eq!(b.state(A), None);

    let mut legacy = init.clone();
    legacy[17] = 0x10;
    assert_eq!(b.receive(from(A), &legacy), Err(Error::UnsupportedVersion(0x10)));
    assert_eq!(b.state(A), None);
    assert!(b.transport_mut().sent.is_empty());
}

#[test]
fn duplicate_requests_get_the_cached_response() {
    let (mut a, mut b) = pair();
    a.negotiate_sa(B).unwrap();
    let init = next_sent(&mut a);
    b.receive(from(A), &init).unwrap();
    let first = next_sent(&mut b);
    b.receive(from(A), &init).unwrap();
    assert_eq!(next_sent(&mut b), first);

    a.receive(from(B), &first).unwrap();
    let auth = next_sent(&mut a);
    b.receive(from(A), &auth).unwrap();
    assert_eq!(b.state(A), Some(State::Established));
    let answer = next_sent(&mut b);

    // The answer got lost, the retransmission reaches an established session.
    b.receive(from(A), &auth).unwrap();
    assert_eq!(next_sent(&mut b), answer);
    assert_eq!(b.child_spis(A).len(), 1);
}

#[test]
fn send_failure_is_a_loss() {
    let (mut a, mut b) = pair();
    a.transport_mut().fail = true;
    a.negotiate_sa(B).unwrap();
    assert!(a.transport_mut().sent.is_empty());

    a.transport_mut().fail = false;
    a.on_tick(Instant::from_secs(10));
    assert_eq!(a.transport_mut().sent.len(), 1);
    pump(&mut a, &mut b);
    assert_eq!(a.state(B), Some(State::Established));
}

#[test]
fn retry_exhaustion_drops_negotiation() {
    let (mut a, _) = pair();
    a.negotiate_sa(B).unwrap();
    for secs in 1..=MAX_RETRIES as i64 {
        a.on_tick(Instant::from_secs(10 * secs));
        assert_eq!(a.state(B), Some(State::Init));
    }
    assert_eq!(a.transport_mut().sent.len(), 1 + MAX_RETRIES as usize);

    a.on_tick(Instant::from_secs(10 * (MAX_RETRIES as i64 + 1)));
    assert_eq!(a.state(B), None);
}

#[test]
fn stale_responder_times_out() {
    let (mut a, mut b) = pair();
    a.negotiate_sa(B).unwrap();
    let init = next_sent(&mut a);
    b.receive(from(A), &init).unwrap();
    assert_eq!(b.state(A), Some(State::Auth));

    b.on_tick(Instant::from_secs(10 * (MAX_RETRIES as i64 + 1)));
    assert_eq!(b.state(A), None);
}

#[test]
fn retry_exhaustion_drops_deleted_session() {
    let (mut a, b) = established();
    a.delete_sa(B).unwrap();
    assert_eq!(a.state(B), Some(State::Deleting));
    assert!(a.store().sas().is_empty());

    for secs in 1..=MAX_RETRIES as i64 + 1 {
        a.on_tick(Instant::from_secs(10 * secs));
    }
    assert_eq!(a.state(B), None);
    assert_eq!(b.state(A), Some(State::Established));
}

#[test]
fn delete_sa() {
    let (mut a, mut b) = established();
    a.delete_sa(B).unwrap();
    pump(&mut a, &mut b);
    assert_eq!(a.state(B), None);
    assert_eq!(b.state(A), None);
    assert!(a.store().sas().is_empty());
    assert!(b.store().sas().is_empty());
}

#[test]
fn deleting_the_last_child_deletes_the_session() {
    let (mut a, mut b) = established();
    let (spi, _) = a.child_spis(B)[0];
    a.delete_child_sa(B, spi).unwrap();
    assert!(a.store().sas().is_empty());
    assert_eq!(a.delete_child_sa(B, spi), Err(Error::SaNotFound));

    pump(&mut a, &mut b);
    assert_eq!(a.state(B), None);
    assert_eq!(b.state(A), None);
    assert!(b.store().sas().is_empty());
}

#[test]
fn create_child_sa() {
    let (mut a, mut b) = established();
    a.negotiate_child_sa(B, None).unwrap();
    assert_eq!(a.negotiate_child_sa(B, None), Err(Error::InvalidState("exchange in progress")));
    pump(&mut a, &mut b);
    assert_eq!(a.child_spis(B).len(), 2);

    b.negotiate_child_sa(A, None).unwrap();
    pump(&mut a, &mut b);
    assert_eq!(a.child_spis(B).len(), 3);
    assert_eq!(b.child_spis(A).len(), 3);
    assert_eq!(a.store().sas().len(), 6);
    assert_eq!(b.store().sas().len(), 6);

    // Deleting one of several keeps the session.
    let (spi, _) = a.child_spis(B)[1];
    a.delete_child_sa(B, spi).unwrap();
    pump(&mut a, &mut b);
    assert_eq!(a.state(B), Some(State::Established));
    assert_eq!(b.child_spis(A).len(), 2);
    assert_eq!(b.store().sas().len(), 4);
}

#[test]
fn rekey_is_refused() {
    let (mut a, mut b) = established();
    let (spi, _) = a.child_spis(B)[0];
    assert_eq!(a.negotiate_child_sa(B, Some(Rekey::Child(spi))), Err(Error::Unsupported));
    assert_eq!(a.negotiate_child_sa(B, Some(Rekey::Ike)), Err(Error::Unsupported));
    assert!(a.transport_mut().sent.is_empty());

    let packet = {
        let sa = &a.established[&B];
        let inner = [
            Payload::Notify(Notify::new(NotifyType::RekeySa)),
            Payload::SecurityAssociation(proposal::esp_offer(0x1234)),
            Payload::Nonce(vec![9; 16]),
            Payload::TsInitiator(vec![TrafficSelector::host(A)]),
            Payload::TsResponder(vec![TrafficSelector::host(B)]),
        ];
        sa.seal(&mut a.cx.crypto, ExchangeType::CreateChildSa, sa.next_request_id, false, &inner).unwrap()
    };
    assert_eq!(b.receive(from(A), &packet), Err(Error::Unsupported));
    assert_eq!(b.child_spis(A).len(), 1);

    let reply = next_sent(&mut b);
    let message = Message::parse(&reply).unwrap();
    let payloads = a.established[&B].open(&a.cx.crypto, &reply, &message).unwrap();
    assert_eq!(payloads, vec![Payload::Notify(Notify::new(NotifyType::NoProposalChosen))]);
}

#[test]
fn informational_without_deletion_is_unsupported() {
    let (mut a, _) = established();
    assert_eq!(a.negotiate_info(B, None), Err(Error::Unsupported));
    let notify = Informational::Notify(NotifyType::UseTransportMode);
    assert_eq!(a.negotiate_info(B, Some(notify)), Err(Error::Unsupported));
    assert_eq!(a.negotiate_info(A, None), Err(Error::SaNotFound));
}

#[test]
fn child_lifetime_expiry() {
    let (mut a, mut b) = established();
    a.on_tick(Instant::from_secs(1799));
    b.on_tick(Instant::from_secs(1799));
    assert!(a.transport_mut().sent.is_empty());

    // Both ends expire the same pair at once.
    a.on_tick(Instant::from_secs(1800));
    b.on_tick(Instant::from_secs(1800));
    pump(&mut a, &mut b);
    assert_eq!(a.state(B), None);
    assert_eq!(b.state(A), None);
    assert!(a.store().sas().is_empty());
    assert!(b.store().sas().is_empty());
}

#[test]
fn ike_lifetime_expiry() {
    let mut config = Config::new(A);
    config.ike_lifetime = Duration::from_secs(600);
    let mut a = engine_with(config, B, Some(PSK), 1);
    let mut b = engine_with(Config::new(B), A, Some(PSK), 2);
    a.negotiate_sa(B).unwrap();
    pump(&mut a, &mut b);
    assert_eq!(a.state(B), Some(State::Established));

    a.on_tick(Instant::from_secs(600));
    assert_eq!(a.state(B), Some(State::Deleting));
    pump(&mut a, &mut b);
    assert_eq!(a.state(B), None);
    assert_eq!(b.state(A), None);
}

#[test]
fn disable_persists_once_idle() {
    let (mut a, mut b) = established();
    b.disable().unwrap();
    assert_eq!(b.store().status(), Status::Enabled);
    assert!(matches!(b.negotiate_sa(A), Err(Error::InvalidState(_))));

    pump(&mut a, &mut b);
    assert_eq!(a.state(B), None);
    assert_eq!(b.state(A), None);
    assert_eq!(b.store().status(), Status::Disabled);

    b.enable().unwrap();
    assert_eq!(b.store().status(), Status::Enabled);
    b.negotiate_sa(A).unwrap();
    pump(&mut a, &mut b);
    assert_eq!(b.state(A), Some(State::Established));
}
