//! The IKEv2 key exchange engine.
//!
//! [`Engine`] negotiates IKE SAs and the ESP Child SAs under them with peers reached over UDP
//! port 500, authenticated by pre-shared keys. Every established Child SA is written to the
//! association database of the [`Store`] in both directions, where the ESP data path finds it.
//!
//! ## Sessions
//!
//! The engine keeps at most one IKE SA per peer address in each of two tables. A session sits in
//! the negotiating table during `IKE_SA_INIT` and `IKE_AUTH` and moves to the established table
//! when the first Child SA is up. An established session replaces any older one of the same peer,
//! the newest session per peer wins. Sessions refer to nothing outside of themselves, every call
//! takes a session out of its table, lets it process the event together with the [`Context`] of
//! the engine and files it back according to its new state.
//!
//! Each session has at most one request in flight. The request is resent every `retry_interval`
//! until answered, and once `max_retries` resends went unanswered the session is torn down
//! locally. Deletion of a single Child SA only drops that child on exhaustion.
//!
//! ## Driving the engine
//!
//! * The operations `negotiate_sa`, `negotiate_child_sa`, `negotiate_info`, `delete_sa`,
//!   `delete_child_sa` and `disable` start exchanges.
//! * [`Engine::receive`] feeds one inbound UDP datagram.
//! * [`Engine::on_tick`] advances the clock and fires retransmissions and lifetimes. Inbound
//!   datagrams are processed with the time of the last tick.
//!
//! Outbound datagrams leave through the [`UdpTransport`]. A failed send counts as a loss.
//!
//! [`Engine`]: struct.Engine.html
//! [`Store`]: store/trait.Store.html
//! [`Context`]: #sessions
//! [`Engine::receive`]: struct.Engine.html#method.receive
//! [`Engine::on_tick`]: struct.Engine.html#method.on_tick
//! [`UdpTransport`]: trait.UdpTransport.html
use std::collections::{BTreeMap, BTreeSet};

use crate::time::{Duration, Instant};
use crate::wire::Ipv4Address;
use crate::wire::ike::{Header, NotifyType, Packet};

mod api;
mod child;
pub mod crypto;
mod dispatch;
mod error;
mod exchange;
pub mod keys;
mod logging;
pub mod proposal;
mod session;
pub mod store;
mod timer;

#[cfg(test)]
mod tests;

pub use self::crypto::{Crypto, SoftCrypto};
pub use self::error::{Error, Result};
pub use self::session::{Role, State};
pub use self::store::{MemoryStore, Status, Store};

use self::session::IkeSa;

/// Default lifetime of an IKE SA.
pub const IKE_LIFETIME: Duration = Duration::from_secs(3600);
/// Default lifetime of a Child SA.
pub const CHILD_LIFETIME: Duration = Duration::from_secs(1800);
pub const RETRY_INTERVAL: Duration = Duration::from_secs(10);
/// Resends of a request before the session is given up.
pub const MAX_RETRIES: u32 = 4;
pub const NONCE_LEN: usize = 16;
pub const NONCE_LEN_MIN: usize = 16;
pub const NONCE_LEN_MAX: usize = 256;

/// SPIs below this are reserved.
const SPI_MIN: u32 = 256;
const SPI_ATTEMPTS: usize = 16;

/// The configuration of an engine.
///
/// Lifetimes of the security policy take precedence over the lifetimes configured here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// The address we send from and identify with.
    pub local: Ipv4Address,
    pub ike_lifetime: Duration,
    pub child_lifetime: Duration,
    pub retry_interval: Duration,
    pub max_retries: u32,
    /// Clamped to the range permitted for nonces.
    pub nonce_len: usize,
}

impl Config {
    pub fn new(local: Ipv4Address) -> Self {
        Config {
            local,
            ike_lifetime: IKE_LIFETIME,
            child_lifetime: CHILD_LIFETIME,
            retry_interval: RETRY_INTERVAL,
            max_retries: MAX_RETRIES,
            nonce_len: NONCE_LEN,
        }
    }
}

/// The UDP layer below the engine.
pub trait UdpTransport {
    /// Send one datagram from port 500 of `src` to port 500 of `dst`.
    ///
    /// Delivery is best effort. An error is logged and otherwise treated like a loss.
    fn send(&mut self, src: Ipv4Address, dst: Ipv4Address, datagram: &[u8]) -> Result<()>;
}

/// The kind of a rekey request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rekey {
    Ike,
    /// The Child SA with our inbound SPI.
    Child(u32),
}

/// An informational exchange other than deletion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Informational {
    Notify(NotifyType),
}

/// The IKEv2 engine.
pub struct Engine<T, C = SoftCrypto, S = MemoryStore> {
    negotiating: BTreeMap<Ipv4Address, IkeSa>,
    established: BTreeMap<Ipv4Address, IkeSa>,
    cx: Context<T, C, S>,
}

/// Everything of the engine except the sessions.
///
/// Split off so that a session can be borrowed mutably together with the rest.
pub(crate) struct Context<T, C, S> {
    pub(crate) config: Config,
    pub(crate) transport: T,
    pub(crate) crypto: C,
    pub(crate) store: S,
    /// Inbound SPIs of all Child SAs, whatever their state.
    pub(crate) spis: BTreeSet<u32>,
    pub(crate) now: Instant,
    /// Persist the disabled status once the last session is gone.
    pub(crate) disable_requested: bool,
}

impl<T: UdpTransport, C: Crypto, S: Store> Engine<T, C, S> {
    pub fn new(config: Config, transport: T, crypto: C, store: S) -> Self {
        Engine {
            negotiating: BTreeMap::new(),
            established: BTreeMap::new(),
            cx: Context {
                config,
                transport,
                crypto,
                store,
                spis: BTreeSet::new(),
                now: Instant::default(),
                disable_requested: false,
            },
        }
    }

    /// Put a session back into the table matching its state.
    fn file(&mut self, sa: IkeSa) {
        if let Some(reason) = sa.dead {
            return self.teardown(sa, reason);
        }
        let remote = sa.remote;
        let old = match sa.state {
            State::Init | State::Auth => self.negotiating.insert(remote, sa),
            State::Established | State::Deleting => self.established.insert(remote, sa),
        };
        if let Some(old) = old {
            self.teardown(old, "superseded by a newer IKE SA");
        }
    }

    /// Remove a session that is no longer in any table, with all of its Child SAs.
    fn teardown(&mut self, mut sa: IkeSa, reason: &'static str) {
        for child in &sa.established {
            if let Err(err) = child::remove_sa_data(&mut self.cx.store, sa.local, sa.remote, child) {
                logging::store_failed(sa.remote, &err);
            }
            logging::child_removed(sa.remote, child.local_spi);
        }
        let spis: Vec<u32> = sa.children().map(|child| child.local_spi).collect();
        for spi in spis {
            self.cx.release_spi(spi);
        }
        sa.set_state(State::Deleting);
        logging::session_removed(sa.remote, sa.spi_i, reason);

        if self.cx.disable_requested && self.negotiating.is_empty() && self.established.is_empty() {
            if let Err(err) = self.cx.store.set_status(Status::Disabled) {
                logging::store_failed(sa.remote, &err);
            }
        }
    }
}

impl<T: UdpTransport, C: Crypto, S: Store> Context<T, C, S> {
    /// Choose a fresh inbound SPI for a Child SA.
    pub(crate) fn alloc_spi(&mut self) -> Result<u32> {
        for _ in 0..SPI_ATTEMPTS {
            let mut bytes = [0; 4];
            self.crypto.random_bytes(&mut bytes);
            let spi = u32::from_be_bytes(bytes);
            if spi >= SPI_MIN && self.spis.insert(spi) {
                return Ok(spi);
            }
        }
        Err(Error::OutOfResources)
    }

    pub(crate) fn release_spi(&mut self, spi: u32) {
        self.spis.remove(&spi);
    }

    /// A random non-zero IKE SPI.
    pub(crate) fn ike_spi(&mut self) -> u64 {
        let mut bytes = [0; 8];
        self.crypto.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes).max(1)
    }

    pub(crate) fn nonce(&mut self) -> Vec<u8> {
        let len = self.config.nonce_len.max(NONCE_LEN_MIN).min(NONCE_LEN_MAX);
        let mut nonce = vec![0; len];
        self.crypto.random_bytes(&mut nonce);
        nonce
    }

    pub(crate) fn send(&mut self, remote: Ipv4Address, packet: &[u8]) {
        if let Ok(header) = Packet::new_checked(packet).and_then(|packet| Header::parse(&packet)) {
            logging::message("out", remote, &header);
        }
        if let Err(err) = self.transport.send(self.config.local, remote, packet) {
            logging::send_failed(remote, &err);
        }
    }
}
