//! Connection tests with two engines wired back to back.
//!
//! Each engine sends into a `Wire` that only records datagrams. The tests move them across by
//! hand, which lets a test drop, hold back or reorder single segments.
use std::mem;

use crate::socket::{self, CompletionKind, ConnectionState, SocketHandle, TxData};
use crate::wire::{Ipv4Address, Ipv4Endpoint, Ipv4Subnet, TcpChecksum, TcpFlags, TcpPacket, TcpRepr, TcpSeqNumber};

use super::*;
use super::timer::Timer;

const ADDR_A: Ipv4Address = Ipv4Address::new(10, 0, 0, 1);
const ADDR_B: Ipv4Address = Ipv4Address::new(10, 0, 0, 2);
const PORT_B: u16 = 80;

struct Datagram {
    src: Ipv4Address,
    dst: Ipv4Address,
    data: Vec<u8>,
}

struct Wire {
    station: Option<Ipv4Subnet>,
    sent: Vec<Datagram>,
}

impl Transport for Wire {
    fn send(&mut self, _: &IpInstance, src: Ipv4Address, dst: Ipv4Address, segment: &[u8])
        -> socket::Result<()>
    {
        self.sent.push(Datagram { src, dst, data: segment.to_vec() });
        Ok(())
    }

    fn default_address(&self) -> Option<Ipv4Subnet> {
        self.station
    }
}

impl Datagram {
    fn repr(&self) -> TcpRepr {
        let packet = TcpPacket::new_checked(&self.data[..]).expect("valid segment");
        TcpRepr::parse(&packet, TcpChecksum::Manual { src_addr: self.src, dst_addr: self.dst })
            .expect("valid header")
    }

    fn payload(&self) -> &[u8] {
        let header_len = TcpPacket::new_unchecked(&self.data[..]).header_len() as usize;
        &self.data[header_len..]
    }
}

fn stack(addr: Ipv4Address, seed: u64) -> Stack<Wire> {
    Stack::with_seed(Wire { station: Some(Ipv4Subnet::new(addr, 24)), sent: Vec::new() }, seed)
}

fn take(stack: &mut Stack<Wire>) -> Vec<Datagram> {
    mem::replace(&mut stack.transport_mut().sent, Vec::new())
}

fn deliver(stack: &mut Stack<Wire>, datagrams: impl IntoIterator<Item=Datagram>) {
    for datagram in datagrams {
        stack.receive(datagram.src, datagram.dst, &datagram.data);
    }
}

/// Move datagrams in both directions until both sides are quiet.
fn pump(a: &mut Stack<Wire>, b: &mut Stack<Wire>) {
    for _ in 0..64 {
        let from_a = take(a);
        let from_b = take(b);
        if from_a.is_empty() && from_b.is_empty() {
            return;
        }
        deliver(b, from_a);
        deliver(a, from_b);
    }
    panic!("connection did not settle");
}

fn tick(a: &mut Stack<Wire>, b: &mut Stack<Wire>, count: usize) {
    for _ in 0..count {
        a.on_tick();
        b.on_tick();
        pump(a, b);
    }
}

fn listener(b: &mut Stack<Wire>, options: Options) -> SocketHandle {
    let handle = b.create_socket().expect("socket");
    let mut config = Config::passive(Ipv4Subnet::new(ADDR_B, 24), PORT_B);
    config.options = options;
    b.configure(handle, Some(config)).expect("configure listener");
    handle
}

fn client(a: &mut Stack<Wire>) -> SocketHandle {
    let handle = a.create_socket().expect("socket");
    let remote = Ipv4Endpoint::new(ADDR_B, PORT_B);
    a.configure(handle, Some(Config::active(Ipv4Subnet::new(ADDR_A, 24), remote)))
        .expect("configure client");
    handle
}

/// Connect a fresh client to a fresh listener and return `(client, accepted child)`.
fn connected(a: &mut Stack<Wire>, b: &mut Stack<Wire>) -> (SocketHandle, SocketHandle) {
    let server = listener(b, Options::default());
    let client = client(a);
    a.connect(client).expect("connect");
    b.accept(server).expect("accept");
    pump(a, b);

    let connect = a.next_completion().expect("connect completion");
    assert_eq!(connect.kind, CompletionKind::Connect);
    assert_eq!(connect.status, Ok(()));

    let accept = b.next_completion().expect("accept completion");
    let child = match accept.kind {
        CompletionKind::Accept { child: Some(child) } => child,
        other => panic!("unexpected completion {:?}", other),
    };
    (client, child)
}

fn received(stack: &mut Stack<Wire>, handle: SocketHandle) -> Vec<u8> {
    let mut data = Vec::new();
    for completion in stack.completions() {
        if completion.socket != handle {
            continue;
        }
        if let CompletionKind::Receive(rx) = completion.kind {
            data.extend(rx.concat());
        }
    }
    data
}

/// An ACK segment from the client side towards the server port.
fn segment(src_port: u16, seq: TcpSeqNumber, ack: TcpSeqNumber, payload: &[u8]) -> Datagram {
    let repr = TcpRepr {
        src_port,
        dst_port: PORT_B,
        flags: TcpFlags::ACK,
        seq_number: seq,
        ack_number: Some(ack),
        window_len: 1000,
        urgent_at: 0,
        window_scale: None,
        max_seg_size: None,
        timestamp: None,
        payload_len: payload.len() as u16,
    };
    let mut data = vec![0; repr.buffer_len()];
    let mut packet = TcpPacket::new_unchecked(&mut data[..]);
    packet.set_header_len(repr.header_len() as u8);
    packet.payload_mut().copy_from_slice(payload);
    repr.emit(&mut packet, TcpChecksum::Manual { src_addr: ADDR_A, dst_addr: ADDR_B });
    Datagram { src: ADDR_A, dst: ADDR_B, data }
}

#[test]
fn active_and_passive_open() {
    let mut a = stack(ADDR_A, 1);
    let mut b = stack(ADDR_B, 2);
    let (client, child) = connected(&mut a, &mut b);

    assert_eq!(a.state(client), Some(State::Established));
    assert_eq!(b.state(child), Some(State::Established));
    assert_eq!(a.socket(client).map(socket::Socket::state), Some(ConnectionState::Connected));

    let mode = a.mode(client).expect("mode");
    assert_eq!(mode.remote, Ipv4Endpoint::new(ADDR_B, PORT_B));
    assert!(mode.local.port > TCP_PORT_KNOWN);
    assert_eq!(mode.send_unacked, mode.send_next);
    // Both sides offered timestamps, so the segment size makes room for them.
    assert_eq!(mode.send_mss, 1460 - 12);
}

#[test]
fn connection_waits_for_accept() {
    let mut a = stack(ADDR_A, 3);
    let mut b = stack(ADDR_B, 4);
    let server = listener(&mut b, Options::default());
    let client = client(&mut a);
    a.connect(client).expect("connect");
    pump(&mut a, &mut b);

    assert_eq!(a.state(client), Some(State::Established));
    assert!(b.next_completion().is_none());
    assert_eq!(b.socket_count(), 2);

    b.accept(server).expect("accept");
    match b.next_completion().map(|completion| completion.kind) {
        Some(CompletionKind::Accept { child: Some(child) }) => {
            assert_eq!(b.state(child), Some(State::Established));
            assert_eq!(b.socket(child).and_then(|socket| socket.parent), None);
        },
        other => panic!("unexpected completion {:?}", other),
    }
}

#[test]
fn data_in_both_directions() {
    let mut a = stack(ADDR_A, 5);
    let mut b = stack(ADDR_B, 6);
    let (client, child) = connected(&mut a, &mut b);

    let sent = a.transmit(client, TxData::new(&b"hello world"[..])).expect("transmit");
    b.receive_into(child, vec![4, 64]).expect("receive");
    pump(&mut a, &mut b);
    // The delayed acknowledgment goes out with the next tick.
    tick(&mut a, &mut b, 1);

    let transmit = a.completions()
        .find(|completion| completion.token == sent)
        .expect("transmit completion");
    assert_eq!(transmit.status, Ok(()));
    assert_eq!(transmit.kind, CompletionKind::Transmit { len: 11 });
    assert_eq!(received(&mut b, child), b"hello world".to_vec());

    let reply = TxData { fragments: vec![b"ok".to_vec()], push: true, urgent: false };
    b.transmit(child, reply).expect("transmit");
    a.receive_into(client, vec![16]).expect("receive");
    pump(&mut a, &mut b);
    assert_eq!(received(&mut a, client), b"ok".to_vec());
    assert_eq!(b.socket(child).map(socket::Socket::unacked_len), Some(0));
}

#[test]
fn buffered_data_is_read_later() {
    let mut a = stack(ADDR_A, 7);
    let mut b = stack(ADDR_B, 8);
    let (client, child) = connected(&mut a, &mut b);

    a.transmit(client, TxData::new(vec![7; 100])).expect("transmit");
    pump(&mut a, &mut b);
    assert_eq!(b.socket(child).map(socket::Socket::received_len), Some(100));

    b.receive_into(child, vec![60]).expect("receive");
    b.receive_into(child, vec![60]).expect("receive");
    let lens: Vec<usize> = b.completions()
        .filter_map(|completion| match completion.kind {
            CompletionKind::Receive(rx) => Some(rx.len()),
            _ => None,
        })
        .collect();
    assert_eq!(lens, vec![60, 40]);
}

#[test]
fn reordered_segments_are_reassembled() {
    let mut a = stack(ADDR_A, 9);
    let mut b = stack(ADDR_B, 10);
    let (client, child) = connected(&mut a, &mut b);

    a.transmit(client, TxData::new(&b"first "[..])).expect("transmit");
    let first = take(&mut a);
    assert_eq!(first.len(), 1);
    // Forge the segment that follows the first one.
    let mut second = first[0].repr();
    second.seq_number = second.seq_number + first[0].payload().len();
    second.payload_len = 7;
    let mut buffer = vec![0; second.buffer_len()];
    let mut packet = TcpPacket::new_unchecked(&mut buffer[..]);
    packet.set_header_len(second.header_len() as u8);
    packet.payload_mut().copy_from_slice(b"second!");
    second.emit(&mut packet, TcpChecksum::Manual { src_addr: ADDR_A, dst_addr: ADDR_B });

    b.receive(ADDR_A, ADDR_B, &buffer);
    // Out of order, acknowledged at once with the old sequence number.
    let acks = take(&mut b);
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].repr().ack_number, Some(first[0].repr().seq_number));
    assert_eq!(b.socket(child).map(socket::Socket::received_len), Some(0));

    deliver(&mut b, first);
    assert_eq!(b.socket(child).map(socket::Socket::received_len), Some(13));
    b.receive_into(child, vec![64]).expect("receive");
    assert_eq!(received(&mut b, child), b"first second!".to_vec());
}

#[test]
fn graceful_close_through_time_wait() {
    let mut a = stack(ADDR_A, 11);
    let mut b = stack(ADDR_B, 12);
    let (client, child) = connected(&mut a, &mut b);

    b.receive_into(child, vec![16]).expect("receive");
    let closing = a.close(client, false).expect("close");
    pump(&mut a, &mut b);
    assert_eq!(a.state(client), Some(State::FinWait2));
    assert_eq!(b.state(child), Some(State::CloseWait));

    // The peer's FIN fails the pending read.
    let fin = b.next_completion().expect("receive completion");
    assert_eq!(fin.status, Err(socket::Error::ConnectionFin));
    assert_eq!(b.receive_into(child, vec![16]), Err(socket::Error::ConnectionFin));

    let closed = b.close(child, false).expect("close");
    pump(&mut a, &mut b);
    assert_eq!(a.state(client), Some(State::TimeWait));
    assert_eq!(b.state(child), Some(State::Closed));
    let done = b.next_completion().expect("close completion");
    assert_eq!((done.token, done.status), (closed, Ok(())));

    assert!(a.next_completion().is_none());
    tick(&mut a, &mut b, (TCP_TIME_WAIT_TIME + 1) as usize);
    assert_eq!(a.state(client), Some(State::Closed));
    let done = a.next_completion().expect("close completion");
    assert_eq!((done.token, done.status), (closing, Ok(())));
}

#[test]
fn abort_resets_the_peer() {
    let mut a = stack(ADDR_A, 13);
    let mut b = stack(ADDR_B, 14);
    let (client, child) = connected(&mut a, &mut b);

    let pending = b.receive_into(child, vec![16]).expect("receive");
    a.close(client, true).expect("abort");
    let rst = take(&mut a);
    assert_eq!(rst.len(), 1);
    assert!(rst[0].repr().flags.rst());
    deliver(&mut b, rst);

    assert_eq!(b.state(child), Some(State::Closed));
    let failed = b.next_completion().expect("receive completion");
    assert_eq!((failed.token, failed.status), (pending, Err(socket::Error::ConnectionReset)));
}

#[test]
fn connect_to_closed_port_is_reset() {
    let mut a = stack(ADDR_A, 15);
    let mut b = stack(ADDR_B, 16);
    let client = client(&mut a);
    let token = a.connect(client).expect("connect");
    pump(&mut a, &mut b);

    assert_eq!(a.state(client), Some(State::Closed));
    let done = a.next_completion().expect("connect completion");
    assert_eq!(done.token, token);
    assert_eq!(done.status, Err(socket::Error::ConnectionReset));
}

#[test]
fn back_log_bounds_children() {
    let mut a = stack(ADDR_A, 17);
    let mut b = stack(ADDR_B, 18);
    let options = Options { max_syn_back_log: TCP_BACKLOG_MIN, ..Options::default() };
    let server = listener(&mut b, options);

    let clients: Vec<_> = (0..TCP_BACKLOG_MIN + 1)
        .map(|_| {
            let handle = client(&mut a);
            a.connect(handle).expect("connect");
            handle
        })
        .collect();
    pump(&mut a, &mut b);

    assert_eq!(b.socket(server).map(|socket| socket.children.len()), Some(TCP_BACKLOG_MIN));
    let established = clients.iter()
        .filter(|&&handle| a.state(handle) == Some(State::Established))
        .count();
    assert_eq!(established, TCP_BACKLOG_MIN);
    // The dropped request is still waiting for an answer.
    assert_eq!(a.state(clients[TCP_BACKLOG_MIN]), Some(State::SynSent));
}

#[test]
fn closing_listener_destroys_unaccepted_children() {
    let mut a = stack(ADDR_A, 19);
    let mut b = stack(ADDR_B, 20);
    let server = listener(&mut b, Options::default());
    let client = client(&mut a);
    a.connect(client).expect("connect");
    pump(&mut a, &mut b);
    assert_eq!(b.socket_count(), 2);

    b.close(server, false).expect("close");
    assert_eq!(b.socket_count(), 1);
    // The child was reset on its way out.
    pump(&mut a, &mut b);
    assert_eq!(a.state(client), Some(State::Closed));
}

#[test]
fn port_unreachable_fails_the_connect() {
    let mut a = stack(ADDR_A, 21);
    let client = client(&mut a);
    let token = a.connect(client).expect("connect");
    let syn = take(&mut a);
    assert_eq!(syn.len(), 1);
    assert!(syn[0].repr().flags.syn());

    // A stale quote is ignored.
    let mut stale = syn[0].data[..8].to_vec();
    stale[4] = stale[4].wrapping_add(0x80);
    a.icmp_error(IcmpError::PortUnreachable, ADDR_A, ADDR_B, &stale);
    assert_eq!(a.state(client), Some(State::SynSent));

    a.icmp_error(IcmpError::PortUnreachable, ADDR_A, ADDR_B, &syn[0].data[..8]);
    assert_eq!(a.state(client), Some(State::Closed));
    let done = a.next_completion().expect("connect completion");
    assert_eq!((done.token, done.status), (token, Err(socket::Error::PortUnreachable)));
}

#[test]
fn soft_icmp_error_is_only_recorded() {
    let mut a = stack(ADDR_A, 22);
    let client = client(&mut a);
    a.connect(client).expect("connect");
    let syn = take(&mut a);

    a.icmp_error(IcmpError::HostUnreachable, ADDR_A, ADDR_B, &syn[0].data[..8]);
    assert_eq!(a.state(client), Some(State::SynSent));
    assert_eq!(a.socket(client).and_then(socket::Socket::error), Some(socket::Error::HostUnreachable));
}

#[test]
fn cancel_single_and_all() {
    let mut a = stack(ADDR_A, 23);
    let mut b = stack(ADDR_B, 24);
    let (client, _) = connected(&mut a, &mut b);

    let first = a.receive_into(client, vec![8]).expect("receive");
    let second = a.receive_into(client, vec![8]).expect("receive");
    a.cancel(client, Some(first)).expect("cancel");
    let done = a.next_completion().expect("cancelled");
    assert_eq!((done.token, done.status), (first, Err(socket::Error::Aborted)));
    assert_eq!(a.cancel(client, Some(first)), Err(socket::Error::NotFound));

    a.cancel(client, None).expect("cancel all");
    let done = a.next_completion().expect("cancelled");
    assert_eq!((done.token, done.status), (second, Err(socket::Error::Aborted)));
    assert!(a.next_completion().is_none());
}

#[test]
fn admission_checks() {
    let mut a = stack(ADDR_A, 25);
    let handle = a.create_socket().expect("socket");
    assert_eq!(a.connect(handle), Err(socket::Error::NotStarted));
    assert_eq!(a.transmit(handle, TxData::new(&b"x"[..])), Err(socket::Error::NotStarted));
    assert_eq!(a.transmit(handle, TxData::default()), Err(socket::Error::InvalidParameter));

    let mut config = Config::active(Ipv4Subnet::new(ADDR_A, 24), Ipv4Endpoint::new(ADDR_B, 0));
    assert_eq!(a.configure(handle, Some(config)), Err(socket::Error::InvalidParameter));
    config.remote.port = PORT_B;
    a.configure(handle, Some(config)).expect("configure");
    assert_eq!(a.configure(handle, Some(config)), Err(socket::Error::AccessDenied));
    // Not connected yet.
    assert_eq!(a.receive_into(handle, vec![1]), Err(socket::Error::AccessDenied));
    assert_eq!(a.accept(handle), Err(socket::Error::AccessDenied));

    a.configure(handle, None).expect("unconfigure");
    assert_eq!(a.socket(handle).map(socket::Socket::is_configured), Some(false));
    a.destroy_socket(handle).expect("destroy");
    assert_eq!(a.destroy_socket(handle), Err(socket::Error::NotFound));
}

#[test]
fn explicit_port_conflict() {
    let mut b = stack(ADDR_B, 26);
    listener(&mut b, Options::default());
    let other = b.create_socket().expect("socket");
    let config = Config::passive(Ipv4Subnet::new(ADDR_B, 24), PORT_B);
    assert_eq!(b.configure(other, Some(config)), Err(socket::Error::AccessDenied));
}

#[test]
fn unknown_station_has_no_mapping() {
    let mut a = stack(ADDR_A, 27);
    a.transport_mut().station = None;
    let handle = a.create_socket().expect("socket");
    let mut config = Config::active(Ipv4Subnet::new(ADDR_A, 24), Ipv4Endpoint::new(ADDR_B, PORT_B));
    config.station = None;
    assert_eq!(a.configure(handle, Some(config)), Err(socket::Error::NoMapping));
    assert_eq!(a.connect(handle), Err(socket::Error::NoMapping));
}

#[test]
fn segment_without_connection_is_reset() {
    let mut b = stack(ADDR_B, 28);
    let repr = TcpRepr {
        src_port: 4000,
        dst_port: 9,
        flags: TcpFlags::ACK,
        seq_number: 100.into(),
        ack_number: Some(200.into()),
        window_len: 1000,
        urgent_at: 0,
        window_scale: None,
        max_seg_size: None,
        timestamp: None,
        payload_len: 0,
    };
    let mut buffer = vec![0; repr.buffer_len()];
    let mut packet = TcpPacket::new_unchecked(&mut buffer[..]);
    packet.set_header_len(repr.header_len() as u8);
    repr.emit(&mut packet, TcpChecksum::Manual { src_addr: ADDR_A, dst_addr: ADDR_B });
    b.receive(ADDR_A, ADDR_B, &buffer);

    let sent = take(&mut b);
    assert_eq!(sent.len(), 1);
    let rst = sent[0].repr();
    assert!(rst.flags.rst());
    assert_eq!(rst.seq_number, TcpSeqNumber::from(200));
    assert_eq!(rst.ack_number, None);

    // A reset is never answered.
    let mut packet = TcpPacket::new_unchecked(&mut buffer[..]);
    packet.set_flags(TcpFlags::RST | TcpFlags::ACK);
    packet.fill_checksum(ADDR_A, ADDR_B);
    b.receive(ADDR_A, ADDR_B, &buffer);
    assert!(take(&mut b).is_empty());
}

#[test]
fn syn_is_retransmitted_until_connect_timeout() {
    let mut a = stack(ADDR_A, 29);
    let client = client(&mut a);
    a.connect(client).expect("connect");
    assert_eq!(take(&mut a).len(), 1);

    for _ in 0..TCP_RTO_INIT + 1 {
        a.on_tick();
    }
    let again = take(&mut a);
    assert_eq!(again.len(), 1);
    assert!(again[0].repr().flags.syn());

    for _ in 0..TCP_CONNECT_TIME {
        a.on_tick();
    }
    assert_eq!(a.state(client), Some(State::Closed));
    let done = a.completions().last().expect("connect completion");
    assert_eq!(done.status, Err(socket::Error::Timeout));
}

#[test]
fn three_duplicate_acks_trigger_fast_retransmit() {
    let mut a = stack(ADDR_A, 31);
    let mut b = stack(ADDR_B, 32);
    let (client, child) = connected(&mut a, &mut b);
    let mss = a.mode(client).expect("mode").send_mss as usize;

    a.transmit(client, TxData::new(vec![0x5a; 64 * mss])).expect("transmit");
    // Let slow start open the window.
    let mut rounds = 0;
    while a.mode(client).expect("mode").congestion_window < 5 * mss as u32 {
        rounds += 1;
        assert!(rounds < 32, "window never opened");
        let segments = take(&mut a);
        deliver(&mut b, segments);
        b.on_tick();
        let acks = take(&mut b);
        deliver(&mut a, acks);
    }

    let burst: Vec<Datagram> = take(&mut a)
        .into_iter()
        .filter(|datagram| !datagram.payload().is_empty())
        .collect();
    assert!(burst.len() >= 4, "burst of {} segments", burst.len());
    let lost = burst[0].repr().seq_number;

    deliver(&mut b, burst.into_iter().skip(1));
    let duplicates = take(&mut b);
    assert!(duplicates.len() >= 3);
    assert!(duplicates.iter().all(|ack| ack.repr().ack_number == Some(lost)));

    deliver(&mut a, duplicates);
    let mode = a.mode(client).expect("mode");
    assert_eq!(mode.congestion, Congestion::Recover);
    let mss32 = mss as u32;
    assert!(mode.ssthresh >= 2 * mss32);
    // Inflated by the three duplicates and any further ones.
    assert!(mode.congestion_window >= mode.ssthresh + 3 * mss32);
    let resent = take(&mut a);
    assert!(resent.iter().any(|datagram| datagram.repr().seq_number == lost
        && !datagram.payload().is_empty()));

    // The retransmission fills the hole, the peer acknowledges everything it holds.
    deliver(&mut b, resent);
    assert!(b.socket(child).map_or(0, socket::Socket::received_len) > mss);
    let acks = take(&mut b);
    assert!(acks.iter().all(|ack| ack.repr().ack_number.map_or(false, |ack| ack > lost)));

    deliver(&mut a, acks);
    let mode = a.mode(client).expect("mode");
    assert!(mode.congestion_window >= mss32);
    assert!(mode.ssthresh >= 2 * mss32);
}

#[test]
fn retransmission_timeout_collapses_the_window() {
    let mut a = stack(ADDR_A, 35);
    let mut b = stack(ADDR_B, 36);
    let (client, child) = connected(&mut a, &mut b);
    let mss = a.mode(client).expect("mode").send_mss;

    a.transmit(client, TxData::new(vec![0x3c; mss as usize])).expect("transmit");
    let lost: Vec<Datagram> = take(&mut a)
        .into_iter()
        .filter(|datagram| !datagram.payload().is_empty())
        .collect();
    assert_eq!(lost.len(), 1);
    let seq = lost[0].repr().seq_number;

    let mut resent = Vec::new();
    for _ in 0..TCP_RTO_MAX {
        a.on_tick();
        resent = take(&mut a);
        if !resent.is_empty() {
            break;
        }
    }
    assert_eq!(resent.len(), 1);
    assert_eq!(resent[0].repr().seq_number, seq);

    // A flight of a single segment leaves the threshold at its floor.
    let mode = a.mode(client).expect("mode");
    assert_eq!(mode.congestion, Congestion::Loss);
    assert_eq!(mode.congestion_window, mss);
    assert_eq!(mode.ssthresh, 2 * mss);

    deliver(&mut b, resent);
    b.on_tick();
    let acks = take(&mut b);
    assert!(!acks.is_empty());
    deliver(&mut a, acks);

    let mode = a.mode(client).expect("mode");
    assert_eq!(mode.congestion, Congestion::Open);
    assert_eq!(mode.send_unacked, mode.send_next);
    assert!(mode.congestion_window >= mss);
    assert!(mode.ssthresh >= 2 * mss);
    assert_eq!(b.socket(child).map_or(0, socket::Socket::received_len), mss as usize);
}

#[test]
fn receive_window_across_the_sequence_wrap() {
    let mut a = stack(ADDR_A, 37);
    let mut b = stack(ADDR_B, 38);
    let (client, child) = connected(&mut a, &mut b);
    let port = a.mode(client).expect("mode").local.port;
    let ack = b.mode(child).expect("mode").send_next;

    // Move the receive sequence space of the child just short of the 32 bit limit.
    let left = TcpSeqNumber::from(0xffff_fff0);
    let tcb = b.socket(child).and_then(|socket| socket.tcb).expect("tcb");
    let window = {
        let tcb = b.tcbs.get_mut(tcb.0).expect("tcb");
        tcb.recv.next = left;
        tcb.recv.wl2 = left;
        tcb.recv.urgent = left;
        tcb.recv.window
    };
    assert!(window > 64);

    // Past the right edge, and wholly before the left edge. Both only get an ACK.
    for &(seq, len) in &[(left.wrapping_add(window), 1), (left - 8usize, 4)] {
        deliver(&mut b, vec![segment(port, seq, ack, &vec![0x11; len])]);
        let sent = take(&mut b);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].repr().ack_number, Some(left));
        assert!(sent[0].payload().is_empty());
    }
    assert_eq!(b.socket(child).map_or(0, socket::Socket::received_len), 0);

    // Data crossing the wrap is in sequence.
    let data: Vec<u8> = (0..32).collect();
    deliver(&mut b, vec![segment(port, left, ack, &data)]);
    assert_eq!(b.socket(child).map_or(0, socket::Socket::received_len), 32);
    let mode = b.mode(child).expect("mode");
    assert_eq!(mode.receive_next, TcpSeqNumber::from(0x10));
    assert_eq!(mode.state, State::Established);
}

#[test]
fn connect_timer_spares_an_established_connection() {
    let mut a = stack(ADDR_A, 39);
    let mut b = stack(ADDR_B, 40);
    let (client, child) = connected(&mut a, &mut b);

    let now = a.now();
    let tcb = a.socket(client).and_then(|socket| socket.tcb).expect("tcb");
    a.tcbs.get_mut(tcb.0).expect("tcb").set_timer(Timer::Connect, now, 1);
    tick(&mut a, &mut b, 2);

    assert_eq!(a.state(client), Some(State::Established));
    assert_eq!(b.state(child), Some(State::Established));
    assert!(a.completions().all(|done| done.status.is_ok()));
}

#[test]
fn destroyed_socket_flushes_tokens() {
    let mut a = stack(ADDR_A, 33);
    let mut b = stack(ADDR_B, 34);
    let (client, child) = connected(&mut a, &mut b);

    let read = a.receive_into(client, vec![8]).expect("receive");
    a.destroy_socket(client).expect("destroy");
    let done = a.next_completion().expect("flushed");
    assert_eq!((done.token, done.status), (read, Err(socket::Error::Aborted)));
    assert!(a.socket(client).is_none());

    // The peer learns about it through a reset.
    pump(&mut a, &mut b);
    assert_eq!(b.state(child), Some(State::Closed));
}
