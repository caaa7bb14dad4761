//! Segment construction and the send policy.
//!
//! The send queue of a connection is the send buffer of its socket. Octets stay there until the
//! peer acknowledges them. Offsets into the buffer are counted from the first sequence number of
//! data, which is `SND.UNA` once the SYN is acknowledged and `ISS + 1` before.
use crate::socket;
use crate::wire::{Ipv4Address, Ipv4Endpoint, TcpChecksum, TcpFlags, TcpPacket, TcpRepr, TcpSeqNumber};

use super::*;
use super::tcb::{compute_scale, Congestion, Control};
use super::timer::Timer;

/// Serialize one segment and hand it to the transport.
pub(crate) fn emit<T: Transport>(
    transport: &mut T,
    ip: &IpInstance,
    src: Ipv4Address,
    dst: Ipv4Address,
    repr: &TcpRepr,
    payload: &[u8],
) -> socket::Result<()> {
    debug_assert_eq!(usize::from(repr.payload_len), payload.len());
    let mut buffer = vec![0; repr.buffer_len()];
    let mut packet = TcpPacket::new_unchecked(&mut buffer[..]);
    packet.set_header_len(repr.header_len() as u8);
    packet.payload_mut().copy_from_slice(payload);
    repr.emit(&mut packet, TcpChecksum::Manual { src_addr: src, dst_addr: dst });

    net_trace!("{} -> {}: {}", src, dst, repr);
    transport.send(ip, src, dst, &buffer).map_err(|err| {
        net_debug!("{} -> {}: send failed: {}", src, dst, err);
        err
    })
}

/// Answer a segment that no connection accepts.
///
/// Never answers a reset. The reply is derived from the offending segment alone.
pub(crate) fn send_reset<T: Transport>(
    transport: &mut T,
    ip: &IpInstance,
    local: Ipv4Endpoint,
    remote: Ipv4Endpoint,
    incoming: &TcpRepr,
) {
    if incoming.flags.rst() {
        return;
    }

    let (seq_number, ack_number) = match incoming.ack_number {
        Some(ack) => (ack, None),
        None => (
            TcpSeqNumber::default(),
            Some(incoming.seq_number + incoming.sequence_len()),
        ),
    };

    let repr = TcpRepr {
        src_port: local.port,
        dst_port: remote.port,
        flags: TcpFlags::RST,
        seq_number,
        ack_number,
        window_len: TCP_MAX_WIN as u16,
        urgent_at: 0,
        window_scale: None,
        max_seg_size: None,
        timestamp: None,
        payload_len: 0,
    };

    let _ = emit(transport, ip, local.addr, remote.addr, &repr, &[]);
}

impl Tcb {
    /// The sequence number of the first octet in the send buffer.
    pub(crate) fn data_base(&self) -> TcpSeqNumber {
        if self.send.unacked == self.send.initial_seq {
            self.send.initial_seq + 1
        } else {
            self.send.unacked
        }
    }

    /// Offset of `SND.NXT` into the send buffer.
    fn sent_offset(&self) -> usize {
        let base = self.data_base();
        if self.send.next > base {
            self.send.next.distance_from(base) as usize
        } else {
            0
        }
    }

    pub(crate) fn queued_len<T>(&self, cx: &mut Context<T>) -> usize {
        cx.socket_of(self).map_or(0, |socket| socket.snd_buffer.len())
    }

    /// Octets at or after `SND.NXT`, including those sent before the window shrank.
    pub(crate) fn unsent<T>(&self, cx: &mut Context<T>) -> usize {
        self.queued_len(cx).saturating_sub(self.sent_offset())
    }

    pub(crate) fn rcv_buffer_size<T>(&self, cx: &mut Context<T>) -> usize {
        cx.socket_of(self).map_or(0, |socket| socket.rcv_buffer.high_water())
    }

    /// The receive window as last advertised, measured from `RCV.NXT`.
    pub(crate) fn rcv_win_old(&self) -> u32 {
        let right = self.recv.wl2.wrapping_add(self.recv.window);
        if right > self.recv.next {
            right.distance_from(self.recv.next)
        } else {
            0
        }
    }

    /// The window to advertise now.
    ///
    /// Receiver side silly window avoidance: the window only grows by at least one segment or
    /// half the buffer at a time.
    pub(crate) fn rcv_win_now<T>(&self, cx: &mut Context<T>) -> u32 {
        let old = self.rcv_win_old();
        let (free, size) = match cx.socket_of(self) {
            Some(socket) => (socket.rcv_buffer.free_space(), socket.rcv_buffer.high_water()),
            None => return old,
        };
        let free = free.min(u32::max_value() as usize) as u32;
        let increase = free.saturating_sub(old);

        if increase > self.send.mss || 2 * increase as usize >= size {
            free
        } else {
            old
        }
    }

    /// Emit one segment of this connection with its options, window and acknowledgment.
    fn transmit<T: Transport>(
        &mut self,
        cx: &mut Context<T>,
        seq: TcpSeqNumber,
        flags: TcpFlags,
        urgent: u16,
        payload: &[u8],
    ) -> socket::Result<()> {
        let mut repr = TcpRepr {
            src_port: self.local.port,
            dst_port: self.remote.port,
            flags,
            seq_number: seq,
            ack_number: if flags.ack() { Some(self.recv.next) } else { None },
            window_len: 0,
            urgent_at: urgent,
            window_scale: None,
            max_seg_size: None,
            timestamp: None,
            payload_len: payload.len() as u16,
        };

        if flags.syn() {
            let rcv_buffer = self.rcv_buffer_size(cx);
            repr.max_seg_size = Some(self.recv.mss.min(0xffff) as u16);
            if !self.ctrl.contains(Control::NO_WS)
                && (!flags.ack() || self.ctrl.contains(Control::RCVD_WS))
            {
                self.recv.window_scale = compute_scale(rcv_buffer);
                repr.window_scale = Some(self.recv.window_scale);
            }
            if !self.ctrl.contains(Control::NO_TS)
                && (!flags.ack() || self.ctrl.contains(Control::RCVD_TS))
            {
                repr.timestamp = Some((cx.tick.0, self.recv.ts_recent));
            }
            // The window of a SYN is never scaled.
            repr.window_len = rcv_buffer.min(TCP_MAX_WIN as usize) as u16;
        } else {
            if self.ctrl.contains(Control::SND_TS) && !flags.rst() {
                repr.timestamp = Some((cx.tick.0, self.recv.ts_recent));
            }
            let window = self.rcv_win_now(cx);
            self.recv.window = window;
            repr.window_len = (window >> self.recv.window_scale).min(TCP_MAX_WIN) as u16;
        }

        self.recv.wl2 = self.recv.next;
        if flags.ack() {
            self.ctrl.remove(Control::ACK_NOW);
            self.delayed_ack = 0;
        }

        emit(&mut cx.transport, &self.ip, self.local.addr, self.remote.addr, &repr, payload)
    }

    /// The urgent pointer for a segment `[seq, end)`, setting URG if it covers urgent data.
    fn urgent_pointer(&self, seq: TcpSeqNumber, end: TcpSeqNumber, flags: &mut TcpFlags) -> u16 {
        if !self.ctrl.contains(Control::SND_URG) || self.send.urgent < seq {
            return 0;
        }
        flags.set_urg(true);
        let offset = self.send.urgent.distance_from(seq);
        if self.send.urgent < end {
            offset as u16
        } else {
            offset.min(0xffff) as u16
        }
    }

    /// How much new data may be sent now.
    ///
    /// Applies the congestion window, the peer window and the segment size, then sender side
    /// silly window avoidance and Nagle unless `force` is set. Arms the probe timer when data
    /// waits but nothing may go out.
    pub(crate) fn data_to_send<T: Transport>(&mut self, cx: &mut Context<T>, force: bool) -> usize {
        let mut limit = self.send.wl2.wrapping_add(self.send.window);
        let congestion_limit = self.send.unacked.wrapping_add(self.flow_control.congestion_window);
        if limit > congestion_limit {
            limit = congestion_limit;
        }

        let window = if limit > self.send.next {
            limit.distance_from(self.send.next) as usize
        } else {
            0
        };
        let left = self.unsent(cx);
        let mss = self.send.mss as usize;
        let len = window.min(left).min(mss);

        if force || (len == 0 && left == 0) {
            return len;
        }

        if len != 0 {
            if len == mss || 2 * len >= self.send.window_max as usize {
                return len;
            }
            let idle = self.send.next == self.send.unacked;
            if len == left && (idle || self.ctrl.contains(Control::NO_NAGLE)) {
                return len;
            }
        }

        if !self.timers.is_on(Timer::Rexmit) && !self.timers.is_on(Timer::Probe) {
            self.set_probe_timer(cx.tick, false);
        }
        0
    }

    /// Send as much as the policy permits, including SYN and FIN.
    ///
    /// Returns the sequence space sent.
    pub(crate) fn to_send_data<T: Transport>(&mut self, cx: &mut Context<T>, force: bool) -> usize {
        if self.state == State::Closed || self.ctrl.contains(Control::FIN_SENT) {
            return 0;
        }

        let mss = self.send.mss as usize;
        let mut sent = 0;
        loop {
            let mut len = self.data_to_send(cx, force);
            let mut seq = self.send.next;
            let mut flags = self.state.out_flags();

            if flags.syn() {
                seq = self.send.initial_seq;
                len = 0;
            }

            if len == 0 && !flags.syn() && !flags.fin() {
                return sent;
            }

            let mut end = seq + len;
            if flags.syn() {
                end += 1;
            }
            if flags.fin() {
                // Only with the last octet of data and only inside the window.
                let right = self.send.wl2.wrapping_add(self.send.window);
                if len == self.unsent(cx) && end < right {
                    end += 1;
                } else {
                    flags.set_fin(false);
                }
            }

            if end == seq {
                return sent;
            }

            let mut payload = vec![0; len];
            if len != 0 {
                let offset = self.sent_offset();
                let copied = cx.socket_of(self)
                    .map_or(0, |socket| socket.snd_buffer.read_at(offset, &mut payload));
                payload.truncate(copied);
            }

            if self.ctrl.contains(Control::SND_PSH)
                && seq <= self.send.push
                && self.send.push <= end
            {
                flags.set_psh(true);
                self.ctrl.remove(Control::SND_PSH);
            }
            let urgent = self.urgent_pointer(seq, end, &mut flags);

            // A failed send is a loss, retransmission covers it.
            let _ = self.transmit(cx, seq, flags, urgent, &payload);
            sent += end.distance_from(seq) as usize;
            self.delayed_ack = 0;

            if flags.fin() {
                self.ctrl.insert(Control::FIN_SENT);
            }
            if end > self.send.next {
                self.send.next = end;
            }
            if !self.timers.is_on(Timer::Rexmit) {
                let rto = self.rtt.rto;
                self.set_timer(Timer::Rexmit, cx.tick, rto);
            }
            // Karn: no samples from retransmitted data.
            if self.flow_control.state == Congestion::Open && !self.ctrl.contains(Control::RTT_ON) {
                self.ctrl.insert(Control::RTT_ON);
                self.rtt.seq = seq;
                self.rtt.measure = 0;
            }

            if len != mss {
                return sent;
            }
        }
    }

    /// Retransmit one segment starting at `seq`.
    pub(crate) fn retransmit<T: Transport>(&mut self, cx: &mut Context<T>, seq: TcpSeqNumber)
        -> socket::Result<()>
    {
        let right = self.send.wl2.wrapping_add(self.send.window);
        if right < seq {
            net_debug!("{}: window shrank below {}, not retransmitting", self.me, seq);
            return Ok(());
        }
        let len = right.distance_from(seq).min(self.send.mss) as usize;

        let handshake = self.state == State::SynSent || self.state == State::SynReceived;
        if handshake && seq == self.send.initial_seq {
            let flags = self.state.out_flags();
            net_trace!("{}: retransmit {}", self.me, flags);
            return self.transmit(cx, seq, flags, 0, &[]);
        }

        let base = self.data_base();
        if seq < base {
            return Ok(());
        }
        let offset = seq.distance_from(base) as usize;
        let queued = self.queued_len(cx);
        let take = queued.saturating_sub(offset).min(len);

        let mut flags = TcpFlags::ACK;
        if self.ctrl.contains(Control::FIN_SENT)
            && !self.ctrl.contains(Control::FIN_ACKED)
            && offset + take >= queued
            && take < len
        {
            flags.set_fin(true);
        }
        if take == 0 && !flags.fin() {
            return Ok(());
        }

        let mut payload = vec![0; take];
        let copied = cx.socket_of(self)
            .map_or(0, |socket| socket.snd_buffer.read_at(offset, &mut payload));
        payload.truncate(copied);

        let end = seq + payload.len() + flags.sequence_len();
        let urgent = self.urgent_pointer(seq, end, &mut flags);
        net_trace!("{}: retransmit {} len {}", self.me, seq, payload.len());
        self.transmit(cx, seq, flags, urgent, &payload)
    }

    /// An empty acknowledgment at `SND.NXT`.
    pub(crate) fn send_ack<T: Transport>(&mut self, cx: &mut Context<T>) {
        let seq = self.send.next;
        let _ = self.transmit(cx, seq, TcpFlags::ACK, 0, &[]);
    }

    /// An acknowledgment with an old sequence number, eliciting an acknowledgment from the peer.
    pub(crate) fn send_zero_probe<T: Transport>(&mut self, cx: &mut Context<T>) {
        let seq = self.send.next - 1;
        net_trace!("{}: zero probe", self.me);
        let _ = self.transmit(cx, seq, TcpFlags::ACK, 0, &[]);
    }

    /// Acknowledge now or schedule a delayed acknowledgment.
    pub(crate) fn to_send_ack<T: Transport>(&mut self, cx: &mut Context<T>) {
        if self.ctrl.contains(Control::ACK_NOW) || self.delayed_ack >= 1 {
            self.send_ack(cx);
            return;
        }

        if self.rcv_win_now(cx) > self.rcv_win_old() {
            self.send_ack(cx);
            return;
        }

        net_trace!("{}: delaying ack", self.me);
        self.delayed_ack += 1;
    }

    /// Abort the connection towards the peer.
    pub(crate) fn reset_connection<T: Transport>(&mut self, cx: &mut Context<T>) {
        let repr = TcpRepr {
            src_port: self.local.port,
            dst_port: self.remote.port,
            flags: TcpFlags::RST,
            seq_number: self.send.next,
            ack_number: Some(self.recv.next),
            window_len: TCP_MAX_WIN as u16,
            urgent_at: 0,
            window_scale: None,
            max_seg_size: None,
            timestamp: None,
            payload_len: 0,
        };
        net_debug!("{}: reset in {}", self.me, self.state);
        let _ = emit(&mut cx.transport, &self.ip, self.local.addr, self.remote.addr, &repr, &[]);
    }
}
