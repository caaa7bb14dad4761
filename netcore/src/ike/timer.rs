//! Retransmission and lifetime timers.
use crate::time::{Expiration, Instant};
use crate::wire::Ipv4Address;

use super::{logging, Context, Engine, UdpTransport};
use super::crypto::Crypto;
use super::session::{IkeSa, Pending, State};
use super::store::Store;

impl<T: UdpTransport, C: Crypto, S: Store> Engine<T, C, S> {
    /// Advance the clock to `now` and fire all due timers.
    pub fn on_tick(&mut self, now: Instant) {
        self.cx.now = now;

        let remotes: Vec<Ipv4Address> = self.negotiating.keys().cloned().collect();
        for remote in remotes {
            if let Some(mut sa) = self.negotiating.remove(&remote) {
                sa.on_tick(&mut self.cx);
                self.file(sa);
            }
        }

        let remotes: Vec<Ipv4Address> = self.established.keys().cloned().collect();
        for remote in remotes {
            if let Some(mut sa) = self.established.remove(&remote) {
                sa.on_tick(&mut self.cx);
                self.file(sa);
            }
        }
    }
}

impl IkeSa {
    fn on_tick<T: UdpTransport, C: Crypto, S: Store>(&mut self, cx: &mut Context<T, C, S>) {
        self.retransmit(cx);
        if self.dead.is_some() {
            return;
        }

        if self.expires.is_due(cx.now) {
            self.expires = Expiration::Never;
            match self.state {
                // Only a responder has a deadline for the negotiation.
                State::Init | State::Auth => return self.kill("negotiation timed out"),
                State::Established => {
                    if let Err(err) = self.begin_delete(cx) {
                        net_debug!("IKE: delete of expired SA with {} failed: {}", self.remote, err);
                    }
                    return;
                },
                State::Deleting => {},
            }
        }

        if self.state == State::Established {
            let now = cx.now;
            let expired: Vec<u32> = self.established.iter()
                .filter(|child| child.expires.is_due(now))
                .map(|child| child.local_spi)
                .collect();
            for spi in expired {
                if let Err(err) = self.queue_child_delete(cx, spi) {
                    net_debug!("IKE: delete of expired child {:08x} failed: {}", spi, err);
                }
            }
        }
    }

    /// Resend the outstanding request, or give it up after the last retry.
    fn retransmit<T: UdpTransport, C: Crypto, S: Store>(&mut self, cx: &mut Context<T, C, S>) {
        let out = match self.outstanding.as_mut() {
            Some(out) if out.due.is_due(cx.now) => out,
            _ => return,
        };
        if out.retries < cx.config.max_retries {
            out.retries += 1;
            out.due = Expiration::after(cx.now, cx.config.retry_interval);
            logging::retransmit(self.remote, out.message_id, out.retries);
            cx.send(self.remote, &out.packet);
            return;
        }

        let pending = out.pending;
        self.outstanding = None;
        self.give_up(cx, pending);
    }

    /// The peer never answered the request.
    ///
    /// A Child SA deletion or creation only loses that child, anything else loses the session.
    fn give_up<T: UdpTransport, C: Crypto, S: Store>(&mut self, cx: &mut Context<T, C, S>, pending: Pending) {
        match pending {
            Pending::DeleteChild(spi) => self.child_deleted(cx, spi),
            Pending::CreateChild => {
                if let Some(child) = self.negotiating.pop() {
                    cx.release_spi(child.local_spi);
                }
            },
            Pending::SaInit | Pending::Auth | Pending::DeleteIke =>
                return self.kill("peer did not respond"),
        }
        if let Err(err) = self.kick(cx) {
            net_debug!("IKE: queued exchange with {} failed: {}", self.remote, err);
        }
    }
}
