//! The six per-connection timers, the periodic tick and RTT estimation.
//!
//! Every timer stores an absolute expiry [`Tick`]. After each change the control block recomputes
//! the distance to the earliest enabled timer so that the tick can skip connections with nothing
//! due by counting that distance down.
//!
//! A handler runs with its own timer already disabled, it may arm it again.
//!
//! [`Tick`]: ../../time/struct.Tick.html
use crate::socket;
use crate::time::Tick;
use crate::wire::TcpSeqNumber;

use super::*;
use super::tcb::{Congestion, Control};

/// The timers of one control block, in firing order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Timer {
    Connect = 0,
    Rexmit = 1,
    Probe = 2,
    Keepalive = 3,
    FinWait2 = 4,
    TimeWait = 5,
}

const TIMER_COUNT: usize = 6;

/// Distance reported while no timer is enabled.
const EXPIRE_NEVER: i32 = 0xffff;

#[derive(Clone, Copy, Debug, Hash)]
pub(crate) struct Timers {
    enabled: u8,
    expire: [Tick; TIMER_COUNT],
    /// Ticks until the earliest enabled timer.
    next_expire: i32,
    timer_on: bool,
}

/// RFC 2988 round trip time estimation, in ticks.
#[derive(Clone, Copy, Debug, Hash)]
pub(crate) struct RttEstimator {
    /// Smoothed RTT, scaled by `1 << TCP_RTT_SHIFT`.
    pub srtt: u32,
    /// RTT variation, scaled by 4.
    pub rttvar: u32,
    pub rto: u32,
    /// Consecutive retransmission timeouts.
    pub loss_times: u32,
    /// The sequence number whose acknowledgment ends the running sample.
    pub seq: TcpSeqNumber,
    /// Ticks since the running sample started.
    pub measure: u32,
}

impl Timer {
    const ALL: [Timer; TIMER_COUNT] = [
        Timer::Connect,
        Timer::Rexmit,
        Timer::Probe,
        Timer::Keepalive,
        Timer::FinWait2,
        Timer::TimeWait,
    ];

    fn bit(self) -> u8 {
        1 << self as u8
    }
}

impl Default for Timers {
    fn default() -> Self {
        Timers {
            enabled: 0,
            expire: [Tick::default(); TIMER_COUNT],
            next_expire: EXPIRE_NEVER,
            timer_on: false,
        }
    }
}

impl Timers {
    pub fn is_on(&self, timer: Timer) -> bool {
        self.enabled & timer.bit() != 0
    }

    pub fn any_on(&self) -> bool {
        self.enabled != 0
    }

    /// The expiry of an enabled timer.
    pub fn expiry(&self, timer: Timer) -> Option<Tick> {
        if self.is_on(timer) { Some(self.expire[timer as usize]) } else { None }
    }

    pub fn set(&mut self, timer: Timer, now: Tick, timeout: u32) {
        self.enabled |= timer.bit();
        self.expire[timer as usize] = now + timeout;
        self.update(now);
    }

    pub fn clear(&mut self, timer: Timer, now: Tick) {
        self.enabled &= !timer.bit();
        self.update(now);
    }

    pub fn clear_all(&mut self) {
        self.enabled = 0;
        self.next_expire = EXPIRE_NEVER;
        self.timer_on = false;
    }

    /// Recompute the distance to the earliest enabled timer.
    pub fn update(&mut self, now: Tick) {
        self.next_expire = EXPIRE_NEVER;
        self.timer_on = false;

        for &timer in Timer::ALL.iter() {
            if !self.is_on(timer) {
                continue;
            }
            let delta = now.until(self.expire[timer as usize]);
            if delta < self.next_expire {
                self.next_expire = delta;
                self.timer_on = true;
            }
        }
    }

    /// Count one tick down, reporting whether some timer may be due.
    fn countdown(&mut self) -> bool {
        if !self.timer_on {
            return false;
        }
        self.next_expire -= 1;
        self.next_expire <= 0
    }

    /// Disable and return the first enabled timer at or past its expiry.
    fn take_due(&mut self, now: Tick) -> Option<Timer> {
        let due = Timer::ALL.iter()
            .cloned()
            .find(|&timer| self.is_on(timer) && self.expire[timer as usize] <= now)?;
        self.enabled &= !due.bit();
        Some(due)
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        RttEstimator {
            srtt: 0,
            rttvar: 0,
            rto: TCP_RTO_INIT,
            loss_times: 0,
            seq: TcpSeqNumber::default(),
            measure: 0,
        }
    }
}

impl RttEstimator {
    /// Feed one measurement, in ticks.
    pub fn sample(&mut self, measure: u32) {
        if self.srtt != 0 {
            let scaled = measure << TCP_RTT_SHIFT;
            let var = if self.srtt > scaled { self.srtt - scaled } else { scaled - self.srtt };
            self.rttvar = (3 * self.rttvar + var) >> 2;
            self.srtt = 7 * (self.srtt >> 3) + measure;
        } else {
            self.srtt = measure << TCP_RTT_SHIFT;
            self.rttvar = measure << 1;
        }

        let rto = (self.srtt + (4 * self.rttvar).max(8)) >> TCP_RTT_SHIFT;
        self.rto = rto.max(TCP_RTO_MIN).min(TCP_RTO_MAX);
    }

    /// Double the timeout after a loss, folding the estimate after repeated losses.
    pub fn backoff(&mut self) {
        if self.loss_times >= TCP_FOLD_RTT && self.srtt != 0 {
            self.rttvar += self.srtt >> 2;
            self.srtt = 0;
        }
        self.rto = self.rto.saturating_mul(2).max(TCP_RTO_MIN).min(TCP_RTO_MAX);
    }
}

impl Tcb {
    pub(crate) fn set_timer(&mut self, timer: Timer, now: Tick, timeout: u32) {
        net_trace!("{}: arm {:?} in {}", self.me, timer, timeout);
        self.timers.set(timer, now, timeout);
    }

    pub(crate) fn clear_timer(&mut self, timer: Timer, now: Tick) {
        self.timers.clear(timer, now);
    }

    /// Arm the keep-alive timer after traffic from the peer.
    pub(crate) fn set_keepalive_timer(&mut self, now: Tick) {
        if self.ctrl.contains(Control::NO_KEEPALIVE) {
            return;
        }

        // Traffic since the last probe restarts the idle period.
        if !self.timers.is_on(Timer::Keepalive) || self.idle < self.limits.keepalive_idle {
            self.set_timer(Timer::Keepalive, now, self.limits.keepalive_idle);
            self.keepalive_probes = 0;
        } else {
            self.set_timer(Timer::Keepalive, now, self.limits.keepalive_period);
        }
    }

    /// Arm the window probe timer.
    ///
    /// A fresh probe waits one RTO, each unanswered probe doubles the interval.
    pub(crate) fn set_probe_timer(&mut self, now: Tick, backoff: bool) {
        self.probe_time = if backoff && self.probe_time != 0 {
            self.probe_time.saturating_mul(2)
        } else {
            self.rtt.rto
        };
        self.probe_time = self.probe_time.max(TCP_RTO_MIN).min(TCP_RTO_MAX);
        self.set_timer(Timer::Probe, now, self.probe_time);
    }

    /// Account one tick and run every timer that came due.
    pub(crate) fn on_tick<T: Transport>(&mut self, cx: &mut Context<T>) {
        if self.state == State::Closed {
            return;
        }

        if self.ctrl.contains(Control::RTT_ON) {
            self.rtt.measure += 1;
        }
        self.idle = self.idle.saturating_add(1);

        if self.delayed_ack != 0 {
            self.send_ack(cx);
        }

        if !self.timers.countdown() {
            return;
        }

        while let Some(timer) = self.timers.take_due(cx.tick) {
            match timer {
                Timer::Connect => self.connect_timeout(cx),
                Timer::Rexmit => self.rexmit_timeout(cx),
                Timer::Probe => self.probe_timeout(cx),
                Timer::Keepalive => self.keepalive_timeout(cx),
                Timer::FinWait2 => self.fin_wait2_timeout(cx),
                Timer::TimeWait => self.time_wait_timeout(cx),
            }

            if self.state == State::Closed || !self.timers.any_on() {
                break;
            }
        }

        if self.state != State::Closed {
            self.timers.update(cx.tick);
        }
    }

    pub(crate) fn set_socket_error<T>(&self, cx: &mut Context<T>, error: socket::Error) {
        if let Some(socket) = cx.socket_of(self) {
            socket.set_error(error);
        }
    }

    fn connect_timeout<T: Transport>(&mut self, cx: &mut Context<T>) {
        net_debug!("{}: connect timeout in {}", self.me, self.state);
        if !self.state.is_synchronized() {
            self.set_socket_error(cx, socket::Error::Timeout);
            if self.state == State::SynReceived {
                self.reset_connection(cx);
            }
            self.close(cx);
        }
    }

    fn rexmit_timeout<T: Transport>(&mut self, cx: &mut Context<T>) {
        let flight = self.send.next.distance_from(self.send.unacked);
        let mss = self.send.mss;
        self.flow_control.ssthresh = (2 * mss).max(flight / 2);
        self.flow_control.congestion_window = mss;
        self.flow_control.loss_recover = self.send.next;
        self.rtt.loss_times += 1;

        net_debug!("{}: retransmission timeout #{}, rto {}", self.me, self.rtt.loss_times, self.rtt.rto);

        if self.rtt.loss_times > self.limits.max_rexmit && !self.timers.is_on(Timer::Connect) {
            self.set_socket_error(cx, socket::Error::Timeout);
            self.close(cx);
            return;
        }

        self.rtt.backoff();
        let unacked = self.send.unacked;
        // A failed retransmission is handled like a lost one, the timer stays armed.
        let _ = self.retransmit(cx, unacked);
        let rto = self.rtt.rto;
        self.set_timer(Timer::Rexmit, cx.tick, rto);
        self.flow_control.state = Congestion::Loss;
        self.ctrl.remove(Control::RTT_ON);
    }

    fn probe_timeout<T: Transport>(&mut self, cx: &mut Context<T>) {
        // The window may have opened meanwhile.
        if self.data_to_send(cx, true) != 0 && self.to_send_data(cx, true) > 0 {
            return;
        }

        self.send_zero_probe(cx);
        self.set_probe_timer(cx.tick, true);
    }

    fn keepalive_timeout<T: Transport>(&mut self, cx: &mut Context<T>) {
        self.keepalive_probes += 1;
        if self.keepalive_probes > self.limits.max_keepalive {
            net_debug!("{}: keep-alive exhausted", self.me);
            self.set_socket_error(cx, socket::Error::Timeout);
            self.close(cx);
            return;
        }

        self.send_zero_probe(cx);
        let period = self.limits.keepalive_period;
        self.set_timer(Timer::Keepalive, cx.tick, period);
    }

    fn fin_wait2_timeout<T: Transport>(&mut self, cx: &mut Context<T>) {
        net_debug!("{}: FIN-WAIT-2 timeout", self.me);
        self.close(cx);
    }

    fn time_wait_timeout<T: Transport>(&mut self, cx: &mut Context<T>) {
        net_debug!("{}: TIME-WAIT done", self.me);
        self.close(cx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn earliest_timer_drives_countdown() {
        let now = Tick(100);
        let mut timers = Timers::default();
        assert!(!timers.countdown());

        timers.set(Timer::Keepalive, now, 10);
        timers.set(Timer::Rexmit, now, 3);
        assert_eq!(timers.next_expire, 3);

        assert!(!timers.countdown());
        assert!(!timers.countdown());
        assert!(timers.countdown());
        assert_eq!(timers.take_due(now + 3), Some(Timer::Rexmit));
        assert_eq!(timers.take_due(now + 3), None);
        assert!(timers.is_on(Timer::Keepalive));

        timers.update(now + 3);
        assert_eq!(timers.next_expire, 7);
        timers.clear(Timer::Keepalive, now + 3);
        assert!(!timers.any_on());
        assert_eq!(timers.next_expire, EXPIRE_NEVER);
    }

    #[test]
    fn timers_fire_in_index_order() {
        let now = Tick(u32::max_value() - 1);
        let mut timers = Timers::default();
        timers.set(Timer::TimeWait, now, 2);
        timers.set(Timer::Connect, now, 2);
        assert_eq!(timers.expiry(Timer::Connect), Some(Tick(0)));
        assert_eq!(timers.take_due(Tick(0)), Some(Timer::Connect));
        assert_eq!(timers.take_due(Tick(0)), Some(Timer::TimeWait));
    }

    #[test]
    fn rto_follows_samples() {
        let mut rtt = RttEstimator::default();
        assert_eq!(rtt.rto, TCP_RTO_INIT);

        rtt.sample(10);
        assert_eq!(rtt.srtt, 80);
        assert_eq!(rtt.rttvar, 20);
        assert_eq!(rtt.rto, (80 + 80) >> 3);

        // A stable path shrinks the variation.
        for _ in 0..20 {
            rtt.sample(10);
        }
        assert!(rtt.rttvar < 20);
        assert!(rtt.rto >= TCP_RTO_MIN);

        rtt.sample(1000);
        assert_eq!(rtt.rto, TCP_RTO_MAX);
    }

    #[test]
    fn backoff_doubles_and_folds() {
        let mut rtt = RttEstimator::default();
        rtt.sample(5);
        let rto = rtt.rto;
        rtt.backoff();
        assert_eq!(rtt.rto, (rto * 2).min(TCP_RTO_MAX));

        rtt.loss_times = TCP_FOLD_RTT;
        let srtt = rtt.srtt;
        let rttvar = rtt.rttvar;
        rtt.backoff();
        assert_eq!(rtt.srtt, 0);
        assert_eq!(rtt.rttvar, rttvar + (srtt >> 2));

        for _ in 0..20 {
            rtt.backoff();
        }
        assert_eq!(rtt.rto, TCP_RTO_MAX);
    }
}
