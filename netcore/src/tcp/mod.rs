//! The TCP protocol engine.
//!
//! The engine keeps two parallel tables: [`Socket`]s that own the byte queues and the outstanding
//! application tokens, and transmission control blocks (TCBs) that own the protocol state of one
//! connection. A socket holds the handle of its TCB and the TCB holds the handle of its socket.
//! Neither side holds a reference into the other table.
//!
//! ## Driving the engine
//!
//! Everything happens in calls on [`Stack`], which run to completion:
//!
//! * Application operations (`configure`, `connect`, `transmit`, ...) admit or queue a token.
//! * [`Stack::receive`] feeds one inbound segment and [`Stack::icmp_error`] one ICMP error.
//! * [`Stack::on_tick`] advances the periodic timer, `TCP_TICK_HZ` times per second.
//!
//! Results of queued tokens are collected from [`Stack::completions`].
//!
//! Outbound segments leave through the [`Transport`] trait. The engine never waits for it, a
//! failed send is the same as a segment lost on the wire.
//!
//! ## Structure
//!
//! The state machine follows RFC 793 with NewReno (RFC 3782), the RTO computation of RFC 2988 and
//! the window scale and timestamp options of RFC 1323. Input processing is in `input`,
//! segment construction and the send policy in `output`, timers and RTT estimation in `timer`,
//! the out-of-order queue in `reassembly` and the lookup lists and port space in `table`. Requests
//! from the socket layer to the protocol are the closed enumeration [`Request`].
//!
//! [`Socket`]: ../socket/struct.Socket.html
//! [`Stack`]: struct.Stack.html
//! [`Stack::receive`]: struct.Stack.html#method.receive
//! [`Stack::icmp_error`]: struct.Stack.html#method.icmp_error
//! [`Stack::on_tick`]: struct.Stack.html#method.on_tick
//! [`Stack::completions`]: struct.Stack.html#method.completions
//! [`Transport`]: trait.Transport.html
//! [`Request`]: enum.Request.html
use core::fmt;
use std::collections::VecDeque;
use std::rc::Rc;

use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;

use crate::managed::{Key, SlotMap};
use crate::socket::{self, Completion, Socket, SocketHandle, TokenId};
use crate::time::Tick;
use crate::wire::{Ipv4Address, Ipv4Endpoint, Ipv4Subnet};

mod api;
mod dispatch;
mod input;
mod output;
mod reassembly;
mod siphash;
mod table;
mod tcb;
mod timer;

#[cfg(test)]
mod tests;

pub use self::dispatch::{Group, ModeData, Request, Response, Route};
pub use self::input::IcmpError;
pub use self::siphash::IsnGenerator;
pub use self::tcb::{Congestion, State};

use self::table::Table;
use self::tcb::Tcb;

/// Timer ticks per second.
pub const TCP_TICK_HZ: u32 = 5;

/// Lower bound of the retransmission timeout, in ticks.
pub const TCP_RTO_MIN: u32 = TCP_TICK_HZ;
/// Upper bound of the retransmission timeout, in ticks.
pub const TCP_RTO_MAX: u32 = 60 * TCP_TICK_HZ;
/// Retransmission timeout before the first RTT sample, in ticks.
pub const TCP_RTO_INIT: u32 = 3 * TCP_TICK_HZ;
/// Fixed point shift of the smoothed RTT.
pub const TCP_RTT_SHIFT: u32 = 3;
/// Consecutive losses after which the RTT estimate is folded.
pub const TCP_FOLD_RTT: u32 = 4;

pub const TCP_MAX_LOSS: u32 = 12;
pub const TCP_MAX_LOSS_MIN: u32 = 6;

pub const TCP_CONNECT_TIME: u32 = 75 * TCP_TICK_HZ;
pub const TCP_CONNECT_TIME_MIN: u32 = 60 * TCP_TICK_HZ;
pub const TCP_FIN_WAIT2_TIME: u32 = 2 * TCP_TICK_HZ;
pub const TCP_FIN_WAIT2_TIME_MAX: u32 = 4 * TCP_TICK_HZ;
pub const TCP_TIME_WAIT_TIME: u32 = 2 * TCP_TICK_HZ;
pub const TCP_TIME_WAIT_TIME_MAX: u32 = 60 * TCP_TICK_HZ;

pub const TCP_KEEPALIVE_IDLE_MIN: u32 = 2 * 60 * 60 * TCP_TICK_HZ;
pub const TCP_KEEPALIVE_IDLE_MAX: u32 = 4 * 60 * 60 * TCP_TICK_HZ;
pub const TCP_KEEPALIVE_PERIOD: u32 = 60 * TCP_TICK_HZ;
pub const TCP_KEEPALIVE_PERIOD_MIN: u32 = 30 * TCP_TICK_HZ;
pub const TCP_MAX_KEEPALIVE: u32 = 8;
pub const TCP_MAX_KEEPALIVE_MIN: u32 = 4;

/// The segment size assumed when the peer announced none, RFC 1122.
pub const TCP_DEFAULT_MSS: u32 = 536;
/// The smallest segment size accepted from an MSS option.
pub const TCP_MIN_MSS: u32 = 64;
/// The largest unscaled window.
pub const TCP_MAX_WIN: u32 = 0xffff;

/// Ports below are never handed out as ephemeral ports.
pub const TCP_PORT_KNOWN: u16 = 1024;

pub const TCP_BACKLOG: usize = 10;
pub const TCP_BACKLOG_MIN: usize = 5;
pub const TCP_BUF_SIZE: usize = socket::DEFAULT_BUFFER_SIZE;
pub const TCP_BUF_SIZE_MIN: usize = 8 * 1024;

/// Length of IPv4 plus TCP headers without options.
const HEADERS_LEN: usize = 40;

/// A handle to a transmission control block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TcbHandle(pub(crate) Key);

impl fmt::Display for TcbHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "tcb{}", self.0)
    }
}

/// The IP layer instance a socket sends through.
///
/// Children accepted by a listener share the listener's instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpInstance {
    pub id: usize,
    /// Local address and subnet.
    pub station: Ipv4Subnet,
    pub ttl: u8,
    pub tos: u8,
}

/// The IP layer below the engine.
pub trait Transport {
    /// Send one IP datagram with protocol TCP.
    ///
    /// Delivery is best effort. An error is logged and otherwise treated like a loss.
    fn send(&mut self, ip: &IpInstance, src: Ipv4Address, dst: Ipv4Address, segment: &[u8])
        -> socket::Result<()>;

    /// The largest IP datagram the interface of `ip` carries.
    fn mtu(&self, _ip: &IpInstance) -> usize {
        1500
    }

    /// The address used by sockets configured without a station address.
    fn default_address(&self) -> Option<Ipv4Subnet> {
        None
    }

    /// Add or remove a route.
    fn route(&mut self, _ip: &IpInstance, _route: &Route) -> socket::Result<()> {
        Err(socket::Error::Unsupported)
    }

    /// Join or leave a multicast group.
    fn group(&mut self, _ip: &IpInstance, _group: &Group) -> socket::Result<()> {
        Err(socket::Error::Unsupported)
    }

    /// Give the layer below a chance to deliver pending datagrams.
    fn poll(&mut self, _ip: &IpInstance) -> socket::Result<()> {
        Ok(())
    }
}

/// Per socket tuning, in seconds and octets.
///
/// A value outside of its permitted range is replaced by the default when configured.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Options {
    pub receive_buffer_size: usize,
    pub send_buffer_size: usize,
    /// Connections a listener holds that were not yet accepted.
    pub max_syn_back_log: usize,
    pub connection_timeout: u32,
    pub data_retries: u32,
    pub fin_timeout: u32,
    /// Zero skips `TIME_WAIT` entirely.
    pub time_wait_timeout: u32,
    /// Zero disables keep-alive probing.
    pub keep_alive_probes: u32,
    pub keep_alive_time: u32,
    pub keep_alive_interval: u32,
    pub enable_nagle: bool,
    pub enable_time_stamp: bool,
    pub enable_window_scaling: bool,
}

/// The configuration of one socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// The local address, or `None` for the transport's default address.
    pub station: Option<Ipv4Subnet>,
    /// The local port, `0` picks an ephemeral port.
    pub local_port: u16,
    /// The peer. Unspecified parts act as wildcards for a listener.
    pub remote: Ipv4Endpoint,
    /// Open actively instead of listening.
    pub active: bool,
    pub ttl: u8,
    pub tos: u8,
    pub options: Options,
}

/// The TCP engine.
pub struct Stack<T> {
    tcbs: SlotMap<Tcb>,
    cx: Context<T>,
}

/// Everything of the engine except the control blocks.
///
/// Split off so that a control block can be borrowed mutably together with the rest.
pub(crate) struct Context<T> {
    pub(crate) transport: T,
    pub(crate) sockets: SlotMap<Socket>,
    /// Lookup lists of inserted control blocks and the port space.
    pub(crate) table: Table,
    pub(crate) tick: Tick,
    pub(crate) isn: IsnGenerator,
    pub(crate) completions: VecDeque<Completion>,
    /// Child sockets to destroy once the current operation finished.
    pub(crate) doomed: Vec<SocketHandle>,
    /// Used to answer segments no control block owns.
    pub(crate) default_ip: Rc<IpInstance>,
    next_token: u64,
    next_ip: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            receive_buffer_size: TCP_BUF_SIZE,
            send_buffer_size: TCP_BUF_SIZE,
            max_syn_back_log: TCP_BACKLOG,
            connection_timeout: TCP_CONNECT_TIME / TCP_TICK_HZ,
            data_retries: TCP_MAX_LOSS,
            fin_timeout: TCP_FIN_WAIT2_TIME / TCP_TICK_HZ,
            time_wait_timeout: TCP_TIME_WAIT_TIME / TCP_TICK_HZ,
            keep_alive_probes: TCP_MAX_KEEPALIVE,
            keep_alive_time: TCP_KEEPALIVE_IDLE_MIN / TCP_TICK_HZ,
            keep_alive_interval: TCP_KEEPALIVE_PERIOD / TCP_TICK_HZ,
            enable_nagle: true,
            enable_time_stamp: true,
            enable_window_scaling: true,
        }
    }
}

/// Take `val` if it lies in `[min, max]`, else `default`.
pub(crate) fn comp_val<V: PartialOrd>(min: V, max: V, default: V, val: V) -> V {
    if val >= min && val <= max { val } else { default }
}

impl Options {
    pub(crate) fn receive_buffer(&self) -> usize {
        comp_val(TCP_BUF_SIZE_MIN, TCP_BUF_SIZE, TCP_BUF_SIZE, self.receive_buffer_size)
    }

    pub(crate) fn send_buffer(&self) -> usize {
        comp_val(TCP_BUF_SIZE_MIN, TCP_BUF_SIZE, TCP_BUF_SIZE, self.send_buffer_size)
    }

    pub(crate) fn back_log(&self) -> usize {
        comp_val(TCP_BACKLOG_MIN, TCP_BACKLOG, TCP_BACKLOG, self.max_syn_back_log)
    }
}

impl Config {
    /// Actively connect from an ephemeral port to `remote`.
    pub fn active(station: Ipv4Subnet, remote: Ipv4Endpoint) -> Self {
        Config {
            station: Some(station),
            local_port: 0,
            remote,
            active: true,
            ttl: 64,
            tos: 0,
            options: Options::default(),
        }
    }

    /// Listen on `port` for any peer.
    pub fn passive(station: Ipv4Subnet, port: u16) -> Self {
        Config {
            station: Some(station),
            local_port: port,
            remote: Ipv4Endpoint::new(Ipv4Address::UNSPECIFIED, 0),
            active: false,
            ttl: 64,
            tos: 0,
            options: Options::default(),
        }
    }
}

impl<T: Transport> Stack<T> {
    /// Create an engine with keys drawn from the operating system.
    pub fn new(transport: T) -> Self {
        Stack::from_rng(transport, StdRng::from_entropy())
    }

    /// Create an engine with reproducible sequence numbers and ports.
    pub fn with_seed(transport: T, seed: u64) -> Self {
        Stack::from_rng(transport, StdRng::seed_from_u64(seed))
    }

    fn from_rng(transport: T, mut rng: StdRng) -> Self {
        let isn = IsnGenerator::from_rng(&mut rng);
        let port = rng.gen_range(TCP_PORT_KNOWN + 1..=u16::max_value());
        let default_ip = Rc::new(IpInstance {
            id: 0,
            station: transport.default_address().unwrap_or(Ipv4Subnet::ANY),
            ttl: 64,
            tos: 0,
        });

        Stack {
            tcbs: SlotMap::new(),
            cx: Context {
                transport,
                sockets: SlotMap::new(),
                table: Table::new(port),
                tick: Tick::default(),
                isn,
                completions: VecDeque::new(),
                doomed: Vec::new(),
                default_ip,
                next_token: 1,
                next_ip: 1,
            },
        }
    }

    pub fn transport(&self) -> &T {
        &self.cx.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.cx.transport
    }

    /// The current timer tick.
    pub fn now(&self) -> Tick {
        self.cx.tick
    }

    /// Inspect a socket.
    pub fn socket(&self, handle: SocketHandle) -> Option<&Socket> {
        self.cx.sockets.get(handle.0)
    }

    /// The protocol state of a socket's connection.
    pub fn state(&self, handle: SocketHandle) -> Option<State> {
        let tcb = self.socket(handle)?.tcb?;
        self.tcbs.get(tcb.0).map(|tcb| tcb.state)
    }

    /// Number of live sockets, including unaccepted children.
    pub fn socket_count(&self) -> usize {
        self.cx.sockets.len()
    }

    /// Take all completions signalled so far, oldest first.
    pub fn completions(&mut self) -> impl Iterator<Item=Completion> + '_ {
        self.cx.completions.drain(..)
    }

    /// Take the oldest signalled completion.
    pub fn next_completion(&mut self) -> Option<Completion> {
        self.cx.completions.pop_front()
    }
}

impl<T> Context<T> {
    pub(crate) fn token(&mut self) -> TokenId {
        let id = TokenId(self.next_token);
        self.next_token += 1;
        id
    }

    pub(crate) fn ip_instance(&mut self, station: Ipv4Subnet, ttl: u8, tos: u8) -> Rc<IpInstance> {
        let id = self.next_ip;
        self.next_ip += 1;
        Rc::new(IpInstance { id, station, ttl, tos })
    }

    /// The socket owned by a control block.
    pub(crate) fn socket_of(&mut self, tcb: &Tcb) -> Option<&mut Socket> {
        self.sockets.get_mut(tcb.socket.0)
    }
}
