//! The transmission control block and its state machine.
use core::fmt;
use std::rc::Rc;

use crate::socket::SocketHandle;
use crate::time::Tick;
use crate::wire::{Ipv4Endpoint, TcpFlags, TcpRepr, TcpSeqNumber};
use crate::wire::tcp::{MAX_WINDOW_SCALE, TIMESTAMP_ALIGNED_LEN};

use super::*;
use super::reassembly::{Reassembly, Segment};
use super::timer::{RttEstimator, Timers};

/// State enum of the statemachine.
///
/// The order matters, every state after `SynReceived` is synchronized.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum State {
    /// No connection, either not yet opened or already torn down.
    Closed,

    /// A listening connection.
    ///
    /// Akin to an open server socket. Every acceptable SYN spawns a child in `SynReceived`.
    Listen,

    /// An open connection request.
    SynSent,

    /// Connection request we intend to answer, waiting on ack.
    SynReceived,

    /// An open connection.
    Established,

    /// Closed our side of the connection.
    FinWait1,

    /// Closing connection nicely, initiated by us and acknowledged.
    FinWait2,

    /// Closed both sides but we don't know the other knows.
    Closing,

    /// Both sides recognized connection as closed.
    TimeWait,

    /// Other side closed its connection.
    CloseWait,

    /// Connection closed after other side closed its already.
    LastAck,
}

/// The congestion control phase of NewReno.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Congestion {
    /// Slow start or congestion avoidance.
    Open,
    /// Fast recovery after three duplicate acks.
    Recover,
    /// Recovery after a retransmission timeout.
    Loss,
}

/// Control flags of a connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub(crate) struct Control(u16);

impl Control {
    pub const NO_NAGLE: Control = Control(0x0001);
    pub const NO_KEEPALIVE: Control = Control(0x0002);
    pub const NO_WS: Control = Control(0x0004);
    pub const RCVD_WS: Control = Control(0x0008);
    pub const NO_TS: Control = Control(0x0010);
    pub const RCVD_TS: Control = Control(0x0020);
    pub const SND_TS: Control = Control(0x0040);
    pub const SND_URG: Control = Control(0x0080);
    pub const RCVD_URG: Control = Control(0x0100);
    pub const SND_PSH: Control = Control(0x0200);
    pub const FIN_SENT: Control = Control(0x0400);
    pub const FIN_ACKED: Control = Control(0x0800);
    pub const ACK_NOW: Control = Control(0x1000);
    pub const RTT_ON: Control = Control(0x2000);

    /// Flags chosen by configuration, inherited by accepted children.
    const CONFIGURED: Control = Control(0x0001 | 0x0002 | 0x0004 | 0x0010);

    pub fn contains(self, flag: Control) -> bool {
        self.0 & flag.0 == flag.0
    }

    pub fn insert(&mut self, flag: Control) {
        self.0 |= flag.0;
    }

    pub fn remove(&mut self, flag: Control) {
        self.0 &= !flag.0;
    }

    pub fn set(&mut self, flag: Control, value: bool) {
        if value { self.insert(flag) } else { self.remove(flag) }
    }
}

#[derive(Clone, Copy, Debug, Default, Hash)]
pub struct Send {
    /// The initial sequence number, `ISS` in RFC793.
    pub initial_seq: TcpSeqNumber,

    /// The next not yet acknowledged sequence number, `SND.UNA` in RFC793.
    pub unacked: TcpSeqNumber,

    /// The next sequence number to use for transmission, `SND.NXT` in RFC793.
    ///
    /// May move backwards when the peer shrinks its window.
    pub next: TcpSeqNumber,

    /// The send window size indicated by the receiver, already scaled.
    pub window: u32,

    /// The largest window the peer ever offered, for sender side silly window avoidance.
    pub window_max: u32,

    /// Shift applied to window fields received from the peer.
    pub window_scale: u8,

    /// Sequence number of the segment used for the last window update, `SND.WL1`.
    pub wl1: TcpSeqNumber,

    /// Acknowledgment of the segment used for the last window update, `SND.WL2`.
    ///
    /// The usable window ends at `wl2 + window`.
    pub wl2: TcpSeqNumber,

    /// Last urgent octet queued by the application, `SND.UP`.
    pub urgent: TcpSeqNumber,

    /// End of the data the application asked to push.
    pub push: TcpSeqNumber,

    /// Largest segment we send, without TCP/IP headers.
    pub mss: u32,
}

#[derive(Clone, Copy, Debug, Default, Hash)]
pub struct Receive {
    /// The initial receive sequence number, `IRS` in RFC793.
    pub initial_seq: TcpSeqNumber,

    /// The next expected sequence number, `RCV.NXT` in RFC793.
    pub next: TcpSeqNumber,

    /// The receive window size last advertised by us.
    pub window: u32,

    /// Shift applied to window fields we send.
    pub window_scale: u8,

    /// `RCV.NXT` as last announced to the peer.
    ///
    /// Acceptance and trimming of incoming segments happen relative to this value instead of
    /// `next` so that delayed acknowledgments appear consistent to the outside.
    pub wl2: TcpSeqNumber,

    /// The last urgent octet announced by the peer.
    pub urgent: TcpSeqNumber,

    /// Largest segment we are willing to receive.
    pub mss: u32,

    /// Most recent timestamp to echo, `TS.Recent` in RFC1323.
    pub ts_recent: u32,

    /// When `ts_recent` was recorded.
    pub ts_recent_age: Tick,
}

/// Models TCP NewReno flow control and congestion avoidance.
#[derive(Clone, Copy, Debug, Hash)]
pub struct NewReno {
    pub state: Congestion,

    /// The window dictated by congestion.
    pub congestion_window: u32,

    /// Decider between slow-start and congestion avoidance.
    ///
    /// Set to MAX initially, then updated on occurance of congestion.
    pub ssthresh: u32,

    /// The sent sequence number that must be acknowledged to end fast recovery.
    pub recover: TcpSeqNumber,

    /// The sent sequence number that must be acknowledged to end loss recovery.
    pub loss_recover: TcpSeqNumber,

    /// Consecutive duplicate acknowledgments.
    pub duplicate_acks: u32,
}

/// Timeouts and retry bounds of one connection, in ticks.
#[derive(Clone, Copy, Debug, Hash)]
pub(crate) struct Limits {
    pub connect_timeout: u32,
    pub max_rexmit: u32,
    pub fin_wait2_timeout: u32,
    pub time_wait_timeout: u32,
    pub keepalive_idle: u32,
    pub keepalive_period: u32,
    pub max_keepalive: u32,
}

/// The protocol state of one connection.
pub(crate) struct Tcb {
    pub(crate) me: TcbHandle,
    pub(crate) socket: SocketHandle,
    pub(crate) ip: Rc<IpInstance>,
    pub(crate) config: Option<Config>,
    pub(crate) state: State,
    pub(crate) local: Ipv4Endpoint,
    pub(crate) remote: Ipv4Endpoint,
    pub(crate) ctrl: Control,
    pub(crate) send: Send,
    pub(crate) recv: Receive,
    pub(crate) flow_control: NewReno,
    pub(crate) rtt: RttEstimator,
    pub(crate) timers: Timers,
    pub(crate) limits: Limits,
    /// Acknowledgments owed to the peer.
    pub(crate) delayed_ack: u32,
    /// Ticks since the last accepted segment.
    pub(crate) idle: u32,
    pub(crate) keepalive_probes: u32,
    /// Interval of the next window probe.
    pub(crate) probe_time: u32,
    pub(crate) reassembly: Reassembly,
}

impl State {
    /// Whether the handshake completed.
    pub fn is_synchronized(self) -> bool {
        self > State::SynReceived
    }

    /// Whether the peer's FIN was processed.
    pub fn fin_received(self) -> bool {
        match self {
            State::CloseWait | State::LastAck | State::Closing | State::TimeWait => true,
            _ => false,
        }
    }

    /// Whether the application closed its side.
    pub fn local_closed(self) -> bool {
        match self {
            State::FinWait1 | State::FinWait2 | State::Closing | State::TimeWait
                | State::LastAck => true,
            _ => false,
        }
    }

    /// Flags of a segment sent in this state.
    pub(crate) fn out_flags(self) -> TcpFlags {
        match self {
            State::Closed | State::Listen => TcpFlags::default(),
            State::SynSent => TcpFlags::SYN,
            State::SynReceived => TcpFlags::SYN | TcpFlags::ACK,
            State::FinWait1 | State::Closing | State::LastAck => TcpFlags::FIN | TcpFlags::ACK,
            State::Established | State::FinWait2 | State::TimeWait | State::CloseWait
                => TcpFlags::ACK,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            State::Closed => "CLOSED",
            State::Listen => "LISTEN",
            State::SynSent => "SYN-SENT",
            State::SynReceived => "SYN-RECEIVED",
            State::Established => "ESTABLISHED",
            State::FinWait1 => "FIN-WAIT-1",
            State::FinWait2 => "FIN-WAIT-2",
            State::Closing => "CLOSING",
            State::TimeWait => "TIME-WAIT",
            State::CloseWait => "CLOSE-WAIT",
            State::LastAck => "LAST-ACK",
        };
        f.write_str(name)
    }
}

impl Default for NewReno {
    fn default() -> Self {
        NewReno {
            state: Congestion::Open,
            congestion_window: TCP_DEFAULT_MSS,
            ssthresh: u32::max_value(),
            recover: TcpSeqNumber::default(),
            loss_recover: TcpSeqNumber::default(),
            duplicate_acks: 0,
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            connect_timeout: TCP_CONNECT_TIME,
            max_rexmit: TCP_MAX_LOSS,
            fin_wait2_timeout: TCP_FIN_WAIT2_TIME,
            time_wait_timeout: TCP_TIME_WAIT_TIME,
            keepalive_idle: TCP_KEEPALIVE_IDLE_MIN,
            keepalive_period: TCP_KEEPALIVE_PERIOD,
            max_keepalive: TCP_MAX_KEEPALIVE,
        }
    }
}

impl Tcb {
    /// A fresh, unconfigured control block attached to `socket`.
    pub(crate) fn new(me: TcbHandle, socket: SocketHandle, ip: Rc<IpInstance>) -> Self {
        let unspecified = Ipv4Endpoint::new(ip.station.address(), 0);
        Tcb {
            me,
            socket,
            ip,
            config: None,
            state: State::Closed,
            local: unspecified,
            remote: unspecified,
            ctrl: Control::NO_KEEPALIVE,
            send: Send { mss: TCP_DEFAULT_MSS, ..Send::default() },
            recv: Receive { mss: TCP_DEFAULT_MSS, ..Receive::default() },
            flow_control: NewReno::default(),
            rtt: RttEstimator::default(),
            timers: Timers::default(),
            limits: Limits::default(),
            delayed_ack: 0,
            idle: 0,
            keepalive_probes: 0,
            probe_time: 0,
            reassembly: Reassembly::default(),
        }
    }

    /// Reset the operating information from a configuration.
    ///
    /// `rcv_mss` is the largest segment the IP instance carries.
    pub(crate) fn configure(&mut self, config: &Config, ip: Rc<IpInstance>, rcv_mss: u32) {
        let options = &config.options;
        self.ip = ip;
        self.state = State::Closed;
        self.ctrl = Control::NO_KEEPALIVE;
        self.send = Send { mss: TCP_DEFAULT_MSS, ..Send::default() };
        self.recv = Receive { mss: rcv_mss, ..Receive::default() };
        self.flow_control = NewReno::default();
        self.rtt = RttEstimator::default();
        self.timers = Timers::default();
        self.reassembly = Reassembly::default();
        self.delayed_ack = 0;
        self.idle = 0;
        self.keepalive_probes = 0;
        self.probe_time = 0;

        let mut limits = Limits::default();
        limits.max_rexmit = comp_val(TCP_MAX_LOSS_MIN, TCP_MAX_LOSS, TCP_MAX_LOSS, options.data_retries);
        limits.fin_wait2_timeout = comp_val(
            TCP_FIN_WAIT2_TIME,
            TCP_FIN_WAIT2_TIME_MAX,
            TCP_FIN_WAIT2_TIME,
            options.fin_timeout.saturating_mul(TCP_TICK_HZ));
        limits.time_wait_timeout = if options.time_wait_timeout == 0 {
            0
        } else {
            comp_val(
                TCP_TIME_WAIT_TIME,
                TCP_TIME_WAIT_TIME_MAX,
                TCP_TIME_WAIT_TIME,
                options.time_wait_timeout.saturating_mul(TCP_TICK_HZ))
        };
        if options.keep_alive_probes != 0 {
            self.ctrl.remove(Control::NO_KEEPALIVE);
            limits.max_keepalive = comp_val(
                TCP_MAX_KEEPALIVE_MIN,
                TCP_MAX_KEEPALIVE,
                TCP_MAX_KEEPALIVE,
                options.keep_alive_probes);
            limits.keepalive_idle = comp_val(
                TCP_KEEPALIVE_IDLE_MIN,
                TCP_KEEPALIVE_IDLE_MAX,
                TCP_KEEPALIVE_IDLE_MIN,
                options.keep_alive_time.saturating_mul(TCP_TICK_HZ));
            limits.keepalive_period = comp_val(
                TCP_KEEPALIVE_PERIOD_MIN,
                TCP_KEEPALIVE_PERIOD,
                TCP_KEEPALIVE_PERIOD,
                options.keep_alive_interval.saturating_mul(TCP_TICK_HZ));
        }
        limits.connect_timeout = comp_val(
            TCP_CONNECT_TIME_MIN,
            TCP_CONNECT_TIME,
            TCP_CONNECT_TIME,
            options.connection_timeout.saturating_mul(TCP_TICK_HZ));
        self.limits = limits;

        self.ctrl.set(Control::NO_NAGLE, !options.enable_nagle);
        self.ctrl.set(Control::NO_TS, !options.enable_time_stamp);
        self.ctrl.set(Control::NO_WS, !options.enable_window_scaling);

        self.local = Ipv4Endpoint::new(self.ip.station.address(), config.local_port);
        self.remote = config.remote;
        self.config = Some(*config);
    }

    /// A child for a connection request arriving at this listener.
    ///
    /// Only the configuration derived parts are copied. Sequence space, timers, queues and the
    /// congestion state start fresh. The child still carries the listener's handle in `me` until
    /// it is inserted.
    pub(crate) fn spawn_child(&self, socket: SocketHandle) -> Tcb {
        let mut child = Tcb::new(self.me, socket, Rc::clone(&self.ip));
        child.config = self.config;
        child.local = self.local;
        child.remote = self.remote;
        child.ctrl = Control(self.ctrl.0 & Control::CONFIGURED.0);
        child.recv.mss = self.recv.mss;
        child.limits = self.limits;
        child
    }

    /// Initialize the local half of the sequence space.
    pub(crate) fn init_local(&mut self, iss: TcpSeqNumber, rcv_buffer: usize) {
        self.send.initial_seq = iss;
        self.send.unacked = iss;
        self.send.next = iss;
        self.send.wl2 = iss;
        self.send.window = TCP_DEFAULT_MSS;
        self.recv.window = rcv_buffer.min(u32::max_value() as usize) as u32;
        // The first window is never scaled.
        self.recv.window_scale = 0;
    }

    /// Initialize the peer half from its SYN.
    pub(crate) fn init_peer(&mut self, seg: &Segment, repr: &TcpRepr, rcv_buffer: usize, now: Tick) {
        self.send.window = seg.window;
        self.send.window_max = seg.window;
        self.send.wl1 = seg.seq;
        self.send.wl2 = if seg.flags.ack() { seg.ack } else { self.send.initial_seq + 1 };

        self.send.mss = match repr.max_seg_size {
            Some(mss) => u32::from(mss).max(TCP_MIN_MSS).min(self.recv.mss),
            None => TCP_DEFAULT_MSS,
        };

        self.recv.initial_seq = seg.seq;
        self.recv.next = seg.seq + 1;
        self.recv.wl2 = self.recv.next;

        match repr.window_scale {
            Some(scale) if !self.ctrl.contains(Control::NO_WS) => {
                self.send.window_scale = scale.min(MAX_WINDOW_SCALE);
                self.recv.window_scale = compute_scale(rcv_buffer);
                self.ctrl.insert(Control::RCVD_WS);
            },
            _ => {
                self.send.window_scale = 0;
                self.recv.window_scale = 0;
            },
        }

        match repr.timestamp {
            Some((value, _)) if !self.ctrl.contains(Control::NO_TS) => {
                self.ctrl.insert(Control::SND_TS);
                self.ctrl.insert(Control::RCVD_TS);
                self.recv.ts_recent = value;
                self.recv.ts_recent_age = now;
                // Every segment carries the option, it takes up space of the payload.
                self.send.mss = self.send.mss.saturating_sub(TIMESTAMP_ALIGNED_LEN as u32).max(1);
            },
            _ => (),
        }

        self.flow_control.congestion_window = self.send.mss;
    }

    /// Switch state and inform the socket of establishment or closure.
    pub(crate) fn set_state<T: Transport>(&mut self, cx: &mut Context<T>, state: State) {
        net_debug!("{}: {} -> {}", self.me, self.state, state);
        self.state = state;
        match state {
            State::Established => self.established(cx),
            State::Closed => self.closed(cx),
            _ => (),
        }
    }

    /// The unified teardown: drop queued segments and force `Closed`.
    pub(crate) fn close<T: Transport>(&mut self, cx: &mut Context<T>) {
        self.reassembly.clear();
        self.set_state(cx, State::Closed);
    }
}

/// The smallest window scale that lets the window cover the whole receive buffer.
pub(crate) fn compute_scale(rcv_buffer: usize) -> u8 {
    let mut scale = 0;
    while scale < MAX_WINDOW_SCALE && ((TCP_MAX_WIN as usize) << scale) < rcv_buffer {
        scale += 1;
    }
    scale
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_covers_buffer() {
        assert_eq!(compute_scale(0xffff), 0);
        assert_eq!(compute_scale(0x10000), 1);
        assert_eq!(compute_scale(2 * 1024 * 1024), 6);
        assert_eq!(compute_scale(usize::max_value()), MAX_WINDOW_SCALE);
    }

    #[test]
    fn state_classes() {
        assert!(!State::SynReceived.is_synchronized());
        assert!(State::Established.is_synchronized());
        assert!(State::CloseWait.fin_received());
        assert!(!State::FinWait2.fin_received());
        assert!(State::LastAck.local_closed());
        assert!(!State::CloseWait.local_closed());
        assert_eq!(State::SynReceived.out_flags(), TcpFlags::SYN | TcpFlags::ACK);
    }

    #[test]
    fn control_flags() {
        let mut ctrl = Control::default();
        ctrl.insert(Control::ACK_NOW);
        ctrl.insert(Control::NO_TS);
        assert!(ctrl.contains(Control::ACK_NOW));
        ctrl.remove(Control::ACK_NOW);
        assert!(!ctrl.contains(Control::ACK_NOW));
        assert!(ctrl.contains(Control::NO_TS));
        assert_eq!(Control(ctrl.0 & Control::CONFIGURED.0), Control::NO_TS);
    }
}
