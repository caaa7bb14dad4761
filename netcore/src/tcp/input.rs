//! Processing of inbound segments and ICMP errors.
//!
//! A segment first finds its control block through the [table]. Listeners spawn a child for each
//! acceptable SYN, the child processes the SYN as if it had been in `SYN-RECEIVED` all along and
//! is only inserted into the table once the segment was accepted.
//!
//! Synchronized connections follow the steps of RFC 793 section 3.9: sequence acceptance, RST,
//! SYN, ACK processing with NewReno congestion control and window update, then urgent data,
//! segment text and FIN in sequence order through the reassembly queue.
//!
//! [table]: ../table/index.html
use crate::socket;
use crate::wire::{self, Ipv4Address, Ipv4Endpoint, TcpChecksum, TcpPacket, TcpRepr};
use crate::wire::TcpSeqNumber;

use super::*;
use super::output::send_reset;
use super::reassembly::Segment;
use super::tcb::{Congestion, Control};
use super::timer::Timer;

/// An ICMP error reported by the IP layer for a segment we sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IcmpError {
    NetUnreachable,
    HostUnreachable,
    ProtocolUnreachable,
    PortUnreachable,
    FragmentationNeeded,
    SourceRouteFailed,
    TimeExceeded,
    ParameterProblem,
    SourceQuench,
}

/// What to do with a segment after the state machine looked at it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// Accepted, the connection may answer.
    Accept,
    /// Dropped without further effect.
    Discard,
}

/// Where processing of a synchronized segment continues.
enum Step {
    /// Urgent data and segment text.
    Text,
    /// Stop with a verdict.
    Done(Verdict),
}

impl IcmpError {
    /// The socket error to record, if any, and whether the error tears the connection down.
    pub(crate) fn classify(self) -> (Option<socket::Error>, bool) {
        use socket::Error;
        match self {
            IcmpError::NetUnreachable => (Some(Error::NetworkUnreachable), false),
            IcmpError::HostUnreachable
                | IcmpError::SourceRouteFailed
                | IcmpError::TimeExceeded => (Some(Error::HostUnreachable), false),
            IcmpError::ProtocolUnreachable => (Some(Error::ProtocolUnreachable), true),
            IcmpError::PortUnreachable => (Some(Error::PortUnreachable), true),
            IcmpError::FragmentationNeeded => (Some(Error::IcmpError), true),
            IcmpError::ParameterProblem => (Some(Error::IcmpError), false),
            IcmpError::SourceQuench => (None, false),
        }
    }
}

/// Reconstruct the header fields of a segment whose options could not be parsed.
fn raw_repr<T: AsRef<[u8]>>(packet: &TcpPacket<T>) -> TcpRepr {
    let flags = packet.flags();
    TcpRepr {
        src_port: packet.src_port(),
        dst_port: packet.dst_port(),
        flags,
        seq_number: packet.seq_number(),
        ack_number: if flags.ack() { Some(packet.ack_number()) } else { None },
        window_len: packet.window_len(),
        urgent_at: packet.urgent_at(),
        window_scale: None,
        max_seg_size: None,
        timestamp: None,
        payload_len: packet.payload().len().min(usize::from(u16::max_value())) as u16,
    }
}

impl<T: Transport> Stack<T> {
    /// Feed one TCP segment received from `src` for `dst`.
    ///
    /// Segments with a bad header or checksum are dropped silently. Segments no connection takes
    /// are answered with a reset.
    pub fn receive(&mut self, src: Ipv4Address, dst: Ipv4Address, data: &[u8]) {
        let packet = match TcpPacket::new_checked(data) {
            Ok(packet) => packet,
            Err(err) => {
                net_debug!("{} -> {}: dropping segment: {}", src, dst, err);
                return;
            },
        };

        let repr = TcpRepr::parse(&packet, TcpChecksum::Manual { src_addr: src, dst_addr: dst });
        let repr = match repr {
            Ok(repr) => repr,
            // Ports and checksum passed, so the options are at fault.
            Err(wire::Error::Malformed) | Err(wire::Error::Truncated)
                if packet.src_port() != 0 && packet.dst_port() != 0
                    && packet.verify_checksum(src, dst) =>
            {
                net_debug!("{} -> {}: malformed options, resetting", src, dst);
                let local = Ipv4Endpoint::new(dst, packet.dst_port());
                let remote = Ipv4Endpoint::new(src, packet.src_port());
                let repr = raw_repr(&packet);
                let handle = self.cx.table.lookup(local, remote, repr.flags.syn());
                let ip = handle
                    .and_then(|handle| self.tcbs.get(handle.0))
                    .map(|tcb| Rc::clone(&tcb.ip))
                    .unwrap_or_else(|| Rc::clone(&self.cx.default_ip));
                send_reset(&mut self.cx.transport, &ip, local, remote, &repr);
                return;
            },
            Err(err) => {
                net_debug!("{} -> {}: dropping segment: {}", src, dst, err);
                return;
            },
        };

        self.process(src, dst, &repr, packet.payload());
        self.reap();
    }

    fn process(&mut self, src: Ipv4Address, dst: Ipv4Address, repr: &TcpRepr, payload: &[u8]) {
        let local = Ipv4Endpoint::new(dst, repr.dst_port);
        let remote = Ipv4Endpoint::new(src, repr.src_port);
        net_trace!("{} -> {}: {}", remote, local, repr);

        let found = self.cx.table.lookup(local, remote, repr.flags.syn())
            .filter(|handle| self.tcbs.get(handle.0)
                .map_or(false, |tcb| tcb.state != State::Closed));

        let handle = match found {
            Some(handle) => handle,
            None => {
                net_debug!("{} -> {}: no connection, resetting", remote, local);
                let ip = Rc::clone(&self.cx.default_ip);
                send_reset(&mut self.cx.transport, &ip, local, remote, repr);
                return;
            },
        };

        let (handle, child) = match self.tcbs.get(handle.0) {
            Some(tcb) if tcb.state == State::Listen => {
                if repr.flags.rst() {
                    return;
                }
                if repr.flags.ack() {
                    net_debug!("{}: ack to listener, resetting", handle);
                    let ip = Rc::clone(&tcb.ip);
                    send_reset(&mut self.cx.transport, &ip, local, remote, repr);
                    return;
                }
                if !repr.flags.syn() {
                    return;
                }
                match self.spawn_child(handle, local, remote) {
                    Some(child) => (child, true),
                    None => return,
                }
            },
            Some(_) => (handle, false),
            None => return,
        };

        let Stack { tcbs, cx } = self;
        let tcb = match tcbs.get_mut(handle.0) {
            Some(tcb) => tcb,
            None => return,
        };

        let seg = Segment::new(repr, payload, tcb.send.window_scale);
        let verdict = if child {
            tcb.on_connection_request(cx, seg, repr)
        } else {
            tcb.process(cx, seg, repr)
        };

        match verdict {
            Verdict::Accept => {
                if child && !cx.table.insert(tcb.me, tcb.local, tcb.remote, false) {
                    net_debug!("{}: duplicate connection", tcb.me);
                    tcb.close(cx);
                }
                if tcb.state != State::Closed
                    && tcb.to_send_data(cx, false) == 0
                    && (tcb.ctrl.contains(Control::ACK_NOW) || !payload.is_empty())
                {
                    tcb.to_send_ack(cx);
                }
            },
            Verdict::Discard => if child {
                tcb.close(cx);
            },
        }
    }

    /// Create the socket and control block of a connection request on `listener`.
    fn spawn_child(&mut self, listener: TcbHandle, local: Ipv4Endpoint, remote: Ipv4Endpoint)
        -> Option<TcbHandle>
    {
        let parent = self.tcbs.get(listener.0)?;
        let parent_socket = parent.socket;
        let socket = self.cx.sockets.get(parent_socket.0)?;
        if !socket.can_admit_child() {
            net_debug!("{}: back-log full, dropping request from {}", listener, remote);
            return None;
        }

        let child_socket = socket.new_child(parent_socket);
        let child_socket = SocketHandle(self.cx.sockets.insert(child_socket));
        let mut tcb = parent.spawn_child(child_socket);
        tcb.local = local;
        tcb.remote = remote;
        let key = self.tcbs.insert_with(move |key| {
            tcb.me = TcbHandle(key);
            tcb
        });
        let child = TcbHandle(key);

        if let Some(socket) = self.cx.sockets.get_mut(child_socket.0) {
            socket.tcb = Some(child);
        }
        if let Some(socket) = self.cx.sockets.get_mut(parent_socket.0) {
            socket.children.push(child_socket);
        }
        net_debug!("{}: child {} for {}", listener, child, remote);
        Some(child)
    }

    /// Feed an ICMP error quoting the start of a segment we sent from `src` to `dst`.
    ///
    /// `quoted` must hold at least the first 8 octets of the TCP header.
    pub fn icmp_error(&mut self, kind: IcmpError, src: Ipv4Address, dst: Ipv4Address, quoted: &[u8]) {
        if quoted.len() < 8 {
            return;
        }

        let packet = TcpPacket::new_unchecked(quoted);
        let local = Ipv4Endpoint::new(src, packet.src_port());
        let remote = Ipv4Endpoint::new(dst, packet.dst_port());
        let seq = packet.seq_number();

        let handle = match self.cx.table.lookup(local, remote, false) {
            Some(handle) => handle,
            None => return,
        };

        let Stack { tcbs, cx } = self;
        if let Some(tcb) = tcbs.get_mut(handle.0) {
            tcb.on_icmp_error(cx, kind, seq);
        }
        self.reap();
    }
}

impl Tcb {
    /// Process the SYN that created this child of a listener.
    fn on_connection_request<T: Transport>(&mut self, cx: &mut Context<T>, mut seg: Segment, repr: &TcpRepr)
        -> Verdict
    {
        let rcv_buffer = self.rcv_buffer_size(cx);
        let iss = cx.isn.get_isn(self.local, self.remote, cx.tick);
        self.init_local(iss, rcv_buffer);
        self.init_peer(&seg, repr, rcv_buffer, cx.tick);
        self.set_state(cx, State::SynReceived);
        let timeout = self.limits.connect_timeout;
        self.set_timer(Timer::Connect, cx.tick, timeout);
        self.trim_in_window(&mut seg);
        self.process_text(cx, seg, repr)
    }

    /// Run one segment through the state machine.
    pub(crate) fn process<T: Transport>(&mut self, cx: &mut Context<T>, seg: Segment, repr: &TcpRepr)
        -> Verdict
    {
        match self.state {
            State::Closed | State::Listen => Verdict::Discard,
            State::SynSent => self.process_syn_sent(cx, seg, repr),
            _ => self.process_synchronized(cx, seg, repr),
        }
    }

    fn reset_peer<T: Transport>(&self, cx: &mut Context<T>, repr: &TcpRepr) {
        send_reset(&mut cx.transport, &self.ip, self.local, self.remote, repr);
    }

    /// Trim a segment to the receive window, left edge `RCV.NXT`.
    fn trim_in_window(&self, seg: &mut Segment) {
        let right = self.recv.wl2.wrapping_add(self.recv.window);
        seg.trim(self.recv.next, right);
    }

    fn process_syn_sent<T: Transport>(&mut self, cx: &mut Context<T>, mut seg: Segment, repr: &TcpRepr)
        -> Verdict
    {
        if seg.flags.ack() && !(self.send.initial_seq < seg.ack && seg.ack <= self.send.next) {
            net_debug!("{}: unacceptable ack in SYN-SENT, resetting", self.me);
            self.reset_peer(cx, repr);
            return Verdict::Discard;
        }

        if seg.flags.rst() {
            if seg.flags.ack() {
                net_debug!("{}: connection refused by peer", self.me);
                self.set_socket_error(cx, socket::Error::ConnectionReset);
                self.close(cx);
            }
            return Verdict::Discard;
        }

        if !seg.flags.syn() {
            return Verdict::Discard;
        }

        let rcv_buffer = self.rcv_buffer_size(cx);
        self.init_peer(&seg, repr, rcv_buffer, cx.tick);
        if seg.flags.ack() {
            self.send.unacked = seg.ack;
        }
        self.clear_timer(Timer::Rexmit, cx.tick);

        if self.send.unacked > self.send.initial_seq {
            self.clear_timer(Timer::Connect, cx.tick);
            if self.flow_control.state == Congestion::Open && self.ctrl.contains(Control::RTT_ON) {
                self.rtt.sample(self.rtt.measure);
                self.ctrl.remove(Control::RTT_ON);
            }
            self.trim_in_window(&mut seg);
            self.ctrl.insert(Control::ACK_NOW);
            net_debug!("{}: connection established", self.me);
            self.set_state(cx, State::Established);
        } else {
            net_debug!("{}: simultaneous open", self.me);
            self.set_state(cx, State::SynReceived);
            self.trim_in_window(&mut seg);
        }

        self.process_text(cx, seg, repr)
    }

    fn process_synchronized<T: Transport>(&mut self, cx: &mut Context<T>, mut seg: Segment, repr: &TcpRepr)
        -> Verdict
    {
        // Sequence acceptance relative to the window as last announced.
        let wl2 = self.recv.wl2;
        if !in_window(wl2, self.recv.window, seg.seq, seg.end) {
            net_trace!("{}: segment outside of window", self.me);
            if !seg.flags.rst() {
                self.send_ack(cx);
            }
            return Verdict::Discard;
        }

        if let Some((value, _)) = repr.timestamp {
            if seg.seq <= wl2 && wl2 < seg.end {
                self.recv.ts_recent = value;
                self.recv.ts_recent_age = cx.tick;
            }
        }

        if seg.flags.rst() {
            let error = match self.state {
                State::SynReceived => Some(socket::Error::ConnectionRefused),
                State::Established | State::FinWait1 | State::FinWait2 | State::CloseWait
                    => Some(socket::Error::ConnectionReset),
                _ => None,
            };
            net_debug!("{}: reset by peer in {}", self.me, self.state);
            if let Some(error) = error {
                self.set_socket_error(cx, error);
            }
            self.close(cx);
            return Verdict::Discard;
        }

        self.trim_in_window(&mut seg);

        if seg.flags.syn() {
            net_debug!("{}: SYN in window, resetting", self.me);
            self.set_socket_error(cx, socket::Error::ConnectionReset);
            self.reset_peer(cx, repr);
            self.close(cx);
            return Verdict::Discard;
        }

        if !seg.flags.ack() {
            return Verdict::Discard;
        }

        match self.process_ack(cx, &seg, repr) {
            Step::Text => self.process_text(cx, seg, repr),
            Step::Done(verdict) => verdict,
        }
    }

    /// Step five of RFC 793: the acknowledgment field.
    fn process_ack<T: Transport>(&mut self, cx: &mut Context<T>, seg: &Segment, repr: &TcpRepr) -> Step {
        if self.state == State::SynReceived {
            if self.send.unacked < seg.ack && seg.ack <= self.send.next {
                self.send.window = seg.window;
                self.send.window_max = self.send.window_max.max(seg.window);
                self.send.wl1 = seg.seq;
                self.send.wl2 = seg.ack;
                self.clear_timer(Timer::Connect, cx.tick);
                net_debug!("{}: connection established", self.me);
                self.set_state(cx, State::Established);
                if let Err(err) = self.deliver_data(cx) {
                    return self.reset_and_drop(cx, repr, err);
                }
            } else {
                net_debug!("{}: unacceptable ack in SYN-RECEIVED, resetting", self.me);
                self.reset_peer(cx, repr);
                return Step::Done(Verdict::Discard);
            }
        }

        if seg.ack < self.send.unacked {
            // Old duplicate, the text may still be new.
            return Step::Text;
        }
        if seg.ack > self.send.next {
            net_debug!("{}: ack for unsent data", self.me);
            self.send_ack(cx);
            return Step::Done(Verdict::Discard);
        }

        // From here on SND.UNA <= SEG.ACK <= SND.NXT.
        if let Some((_, echo)) = repr.timestamp {
            let measure = cx.tick.0.wrapping_sub(echo);
            if measure <= TCP_RTO_MAX {
                self.rtt.sample(measure);
            }
        } else if self.ctrl.contains(Control::RTT_ON) && self.rtt.seq < seg.ack {
            self.rtt.sample(self.rtt.measure);
            self.ctrl.remove(Control::RTT_ON);
        }

        if seg.ack == self.send.next {
            self.clear_timer(Timer::Rexmit, cx.tick);
        } else {
            let rto = self.rtt.rto;
            self.set_timer(Timer::Rexmit, cx.tick, rto);
        }

        let duplicate = seg.ack == self.send.unacked
            && self.send.unacked != self.send.next
            && seg.is_empty()
            && seg.window == self.send.window;
        if duplicate {
            self.flow_control.duplicate_acks += 1;
        } else {
            self.flow_control.duplicate_acks = 0;
        }

        let congestion = self.flow_control.state;
        if (congestion == Congestion::Open && self.flow_control.duplicate_acks < 3)
            || congestion == Congestion::Loss
        {
            if seg.ack > self.send.unacked {
                self.grow_congestion_window();
            }
            if congestion == Congestion::Loss {
                self.fast_loss_recover(cx, seg);
            }
        } else {
            self.fast_recover(cx, seg);
        }

        let mut acked = 0;
        if seg.ack > self.send.unacked {
            let base = self.data_base();
            if seg.ack > base {
                acked = seg.ack.distance_from(base) as usize;
            }
            self.send.unacked = seg.ack;
            if self.ctrl.contains(Control::SND_URG) && self.send.urgent < seg.ack {
                self.ctrl.remove(Control::SND_URG);
            }
            if acked > 0 {
                let me = self.socket;
                if let Some(socket) = cx.sockets.get_mut(me.0) {
                    let count = acked.min(socket.snd_buffer.len());
                    socket.data_acked(me, count, &mut cx.completions);
                }
            }
        }

        self.update_window(cx, seg);

        if self.ctrl.contains(Control::FIN_SENT) && self.send.unacked == self.send.next {
            net_debug!("{}: FIN acknowledged", self.me);
            self.ctrl.insert(Control::FIN_ACKED);
        }

        let fin_acked = self.ctrl.contains(Control::FIN_ACKED);
        match self.state {
            State::FinWait1 if fin_acked => {
                self.set_state(cx, State::FinWait2);
                self.timers.clear_all();
                let timeout = self.limits.fin_wait2_timeout;
                self.set_timer(Timer::FinWait2, cx.tick, timeout);
            },
            State::Closing if fin_acked => self.enter_time_wait(cx),
            State::LastAck if fin_acked => self.set_state(cx, State::Closed),
            State::TimeWait => {
                self.send_ack(cx);
                if self.limits.time_wait_timeout != 0 {
                    let timeout = self.limits.time_wait_timeout;
                    self.set_timer(Timer::TimeWait, cx.tick, timeout);
                } else {
                    self.close(cx);
                }
            },
            _ => (),
        }

        if acked > 0 && self.state != State::Closed {
            self.process_send_tokens(cx);
        }

        Step::Text
    }

    /// Slow start below `ssthresh`, congestion avoidance above.
    fn grow_congestion_window(&mut self) {
        let mss = self.send.mss;
        let flow = &mut self.flow_control;
        if flow.congestion_window < flow.ssthresh {
            flow.congestion_window = flow.congestion_window.saturating_add(mss);
        } else {
            let step = (mss.saturating_mul(mss) / flow.congestion_window.max(1)).max(1);
            flow.congestion_window = flow.congestion_window.saturating_add(step);
        }
        let limit = TCP_MAX_WIN << self.send.window_scale;
        flow.congestion_window = flow.congestion_window.min(limit);
    }

    /// Fast retransmit and fast recovery of RFC 3782.
    fn fast_recover<T: Transport>(&mut self, cx: &mut Context<T>, seg: &Segment) {
        let mss = self.send.mss;
        let flight = self.send.next.distance_from(self.send.unacked);

        if self.flow_control.state == Congestion::Open {
            self.flow_control.ssthresh = (flight / 2).max(2 * mss);
            self.flow_control.recover = self.send.next;
            self.flow_control.state = Congestion::Recover;
            self.ctrl.remove(Control::RTT_ON);
            let unacked = self.send.unacked;
            let _ = self.retransmit(cx, unacked);
            self.flow_control.congestion_window = self.flow_control.ssthresh + 3 * mss;
            net_debug!("{}: fast retransmit, cwnd {}", self.me, self.flow_control.congestion_window);
            return;
        }

        if seg.ack == self.send.unacked {
            // Each further duplicate means another segment left the network.
            self.flow_control.congestion_window += mss;
        } else if seg.ack >= self.flow_control.recover {
            self.flow_control.congestion_window = self.flow_control.ssthresh.min(flight + mss);
            self.flow_control.state = Congestion::Open;
            net_debug!("{}: full ack, leaving fast recovery", self.me);
        } else {
            let _ = self.retransmit(cx, seg.ack);
            let mut acked = seg.ack.distance_from(self.send.unacked);
            if acked >= mss {
                acked -= mss;
            }
            let window = self.flow_control.congestion_window.saturating_sub(acked);
            self.flow_control.congestion_window = window.max(mss);
            net_debug!("{}: partial ack, cwnd {}", self.me, self.flow_control.congestion_window);
        }
    }

    /// Recovery after a retransmission timeout.
    fn fast_loss_recover<T: Transport>(&mut self, cx: &mut Context<T>, seg: &Segment) {
        if seg.ack <= self.send.unacked {
            return;
        }

        self.rtt.loss_times = 0;
        if seg.ack >= self.flow_control.loss_recover {
            self.flow_control.state = Congestion::Open;
            net_debug!("{}: loss recovered", self.me);
        } else {
            let _ = self.retransmit(cx, seg.ack);
        }
    }

    /// Take the offered window of a segment that is newer than the last update.
    fn update_window<T: Transport>(&mut self, cx: &mut Context<T>, seg: &Segment) {
        let newer = self.send.wl1 < seg.seq
            || (self.send.wl1 == seg.seq && self.send.wl2 <= seg.ack);
        if !newer {
            return;
        }

        self.send.window_max = self.send.window_max.max(seg.window);
        let right = seg.ack.wrapping_add(seg.window);
        let old_right = self.send.wl2.wrapping_add(self.send.window);
        if right < old_right {
            if self.send.wl1 == seg.seq && self.send.wl2 == seg.ack && seg.data.is_empty() {
                return;
            }

            net_debug!("{}: peer shrank its window", self.me);
            let flow = &mut self.flow_control;
            if flow.state == Congestion::Recover && right < flow.recover {
                flow.recover = right;
            }
            if flow.state == Congestion::Loss && right < flow.loss_recover {
                flow.loss_recover = right;
            }
            if right < self.send.next {
                self.send.next = right;
                if right == self.send.unacked {
                    self.clear_timer(Timer::Rexmit, cx.tick);
                    self.set_probe_timer(cx.tick, false);
                }
            }
        }

        self.send.window = seg.window;
        self.send.wl1 = seg.seq;
        self.send.wl2 = seg.ack;
    }

    fn enter_time_wait<T: Transport>(&mut self, cx: &mut Context<T>) {
        self.set_state(cx, State::TimeWait);
        self.timers.clear_all();
        if self.limits.time_wait_timeout != 0 {
            let timeout = self.limits.time_wait_timeout;
            self.set_timer(Timer::TimeWait, cx.tick, timeout);
        } else {
            net_debug!("{}: TIME-WAIT disabled, closing", self.me);
            self.send_ack(cx);
            self.close(cx);
        }
    }

    fn reset_and_drop<T: Transport>(&mut self, cx: &mut Context<T>, repr: &TcpRepr, err: socket::Error) -> Step {
        self.set_socket_error(cx, err);
        self.reset_peer(cx, repr);
        self.close(cx);
        Step::Done(Verdict::Discard)
    }

    /// Steps six to eight of RFC 793: urgent pointer, segment text and FIN.
    fn process_text<T: Transport>(&mut self, cx: &mut Context<T>, seg: Segment, repr: &TcpRepr) -> Verdict {
        if self.state == State::Closed {
            return Verdict::Accept;
        }

        self.idle = 0;
        self.set_keepalive_timer(cx.tick);

        if seg.flags.urg() && !self.state.fin_received() {
            let urgent = seg.seq + usize::from(seg.urgent);
            if !self.ctrl.contains(Control::RCVD_URG) || urgent > self.recv.urgent {
                self.recv.urgent = urgent;
            }
            self.ctrl.insert(Control::RCVD_URG);
        }

        if seg.is_empty() {
            return Verdict::Accept;
        }

        if self.state.fin_received() {
            net_debug!("{}: data after FIN, resetting", self.me);
            self.reset_and_drop(cx, repr, socket::Error::ConnectionReset);
            return Verdict::Discard;
        }
        if self.state.local_closed() && !seg.data.is_empty() {
            net_debug!("{}: data for a closed receiver, resetting", self.me);
            self.reset_and_drop(cx, repr, socket::Error::ConnectionReset);
            return Verdict::Discard;
        }

        if self.reassembly.queue(seg) {
            self.ctrl.insert(Control::ACK_NOW);
        }
        if let Err(err) = self.deliver_data(cx) {
            self.reset_and_drop(cx, repr, err);
            return Verdict::Discard;
        }
        if !self.reassembly.is_empty() {
            self.ctrl.insert(Control::ACK_NOW);
        }

        Verdict::Accept
    }

    /// Hand in-order data to the socket and process a FIN in sequence.
    pub(crate) fn deliver_data<T: Transport>(&mut self, cx: &mut Context<T>) -> socket::Result<()> {
        if self.reassembly.is_empty() || !self.state.is_synchronized() {
            return Ok(());
        }

        while let Some(mut seg) = self.reassembly.pop_in_order(self.recv.next) {
            self.recv.next = seg.end;
            let fin = seg.flags.fin();

            if fin {
                if !self.reassembly.is_empty() {
                    net_debug!("{}: data beyond FIN", self.me);
                    return Err(socket::Error::ConnectionReset);
                }
                seg.end = seg.end - 1usize;
            }

            if seg.flags.psh() {
                self.ctrl.insert(Control::ACK_NOW);
            }

            if !seg.data.is_empty() {
                let mut urgent = 0;
                if self.ctrl.contains(Control::RCVD_URG) && seg.seq <= self.recv.urgent {
                    urgent = if seg.end <= self.recv.urgent {
                        seg.data.len()
                    } else {
                        self.recv.urgent.distance_from(seg.seq) as usize + 1
                    };
                }
                if self.recv.urgent < seg.end {
                    self.ctrl.remove(Control::RCVD_URG);
                }

                let me = self.socket;
                let data = core::mem::replace(&mut seg.data, Vec::new());
                if let Some(socket) = cx.sockets.get_mut(me.0) {
                    socket.append_received(me, data, urgent, &mut cx.completions);
                }
            }

            if fin {
                net_debug!("{}: FIN received in {}", self.me, self.state);
                match self.state {
                    State::SynReceived | State::Established => self.set_state(cx, State::CloseWait),
                    State::FinWait1 if !self.ctrl.contains(Control::FIN_ACKED) => {
                        self.set_state(cx, State::Closing)
                    },
                    State::FinWait1 | State::FinWait2 => self.enter_time_wait(cx),
                    _ => return Err(socket::Error::ConnectionReset),
                }
                self.ctrl.insert(Control::ACK_NOW);
            }

            if self.state.fin_received() {
                let me = self.socket;
                if let Some(socket) = cx.sockets.get_mut(me.0) {
                    socket.set_no_more_data(me, &mut cx.completions);
                }
            }

            if self.state == State::Closed {
                break;
            }
        }

        Ok(())
    }

    /// React to an ICMP error quoting `seq`.
    pub(crate) fn on_icmp_error<T: Transport>(&mut self, cx: &mut Context<T>, kind: IcmpError, seq: TcpSeqNumber) {
        if self.state == State::Closed {
            return;
        }
        if !(self.send.unacked <= seq && seq < self.send.next) {
            net_trace!("{}: ICMP {:?} for stale sequence number", self.me, kind);
            return;
        }

        let (error, hard) = kind.classify();
        net_debug!("{}: ICMP {:?}, hard: {}", self.me, kind, hard);
        if let Some(error) = error {
            self.set_socket_error(cx, error);
        }
        if hard {
            self.close(cx);
        }
    }
}

/// Whether a segment spanning `seq..end` touches the receive window `left..left + window`.
///
/// All comparisons are modulo 2<sup>32</sup>. A segment ending exactly on the left edge still
/// counts, it carries nothing new but its acknowledgment.
fn in_window(left: TcpSeqNumber, window: u32, seq: TcpSeqNumber, end: TcpSeqNumber) -> bool {
    left <= end && seq < left.wrapping_add(window)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::TcpFlags;

    #[test]
    fn icmp_classification() {
        assert_eq!(IcmpError::NetUnreachable.classify(), (Some(socket::Error::NetworkUnreachable), false));
        assert_eq!(IcmpError::TimeExceeded.classify(), (Some(socket::Error::HostUnreachable), false));
        assert_eq!(IcmpError::PortUnreachable.classify(), (Some(socket::Error::PortUnreachable), true));
        assert_eq!(IcmpError::FragmentationNeeded.classify(), (Some(socket::Error::IcmpError), true));
        assert_eq!(IcmpError::ParameterProblem.classify(), (Some(socket::Error::IcmpError), false));
        assert_eq!(IcmpError::SourceQuench.classify(), (None, false));
    }

    #[test]
    fn window_edges_across_the_wrap() {
        let seq = |raw: u32| TcpSeqNumber::from(raw);
        for &left in &[0u32, 0x7fff_fff0, 0xffff_fff0, 0xffff_ffff] {
            let at = |offset: i64| seq((i64::from(left) + offset) as u32);
            let window = 0x40;
            // Empty segments on either edge.
            assert!(in_window(at(0), window, at(0), at(0)));
            assert!(!in_window(at(0), window, at(0x40), at(0x40)));
            // Old data, one octet short of and exactly touching the left edge.
            assert!(!in_window(at(0), window, at(-8), at(-1)));
            assert!(in_window(at(0), window, at(-8), at(0)));
            // Straddling either edge.
            assert!(in_window(at(0), window, at(-4), at(4)));
            assert!(in_window(at(0), window, at(0x3f), at(0x50)));
            assert!(!in_window(at(0), window, at(0x40), at(0x41)));
            // Wholly inside, crossing the 32 bit limit for the upper start values.
            assert!(in_window(at(0), window, at(0x08), at(0x20)));
            assert!(in_window(at(0), window, at(0x0e), at(0x12)));
        }

        // Nothing fits a closed window.
        assert!(!in_window(seq(0xffff_fff0), 0, seq(0xffff_fff0), seq(0xffff_fff0)));
        // Far ahead lies behind after the wrap.
        assert!(!in_window(seq(0xffff_fff0), 0x40, seq(0x8000_0000), seq(0x8000_0010)));
    }

    #[test]
    fn options_survive_raw_reconstruction() {
        let repr = TcpRepr {
            src_port: 1234,
            dst_port: 80,
            flags: TcpFlags::SYN,
            seq_number: TcpSeqNumber::from(7),
            ack_number: None,
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
        repr.emit(&mut packet, TcpChecksum::Ignored);
        let raw = raw_repr(&TcpPacket::new_unchecked(&buffer[..]));
        assert_eq!(raw.src_port, 1234);
        assert_eq!(raw.seq_number, TcpSeqNumber::from(7));
        assert_eq!(raw.ack_number, None);
        assert!(raw.flags.syn());
    }
}
