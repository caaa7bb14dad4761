//! Initial sequence number generation, as recommended by rfc6528.
//!
//! Uses a keyed cryptographic hash function (SipHash-2-4) instead of appending the secret key to
//! the four tuple for hashing. Hash function SipHash-2-4 from:
//!
//! > SipHash: a fast short-input PRF, Jean-Philippe Aumasson and Daniel J. Bernstein
use rand::RngCore;

use crate::time::Tick;
use crate::wire::{Ipv4Endpoint, TcpSeqNumber};

/// Advance of the clock component per timer tick.
///
/// RFC 6528 asks for a 4 microsecond clock, a tick lasts 200 milliseconds.
const ISN_PER_TICK: u32 = 50_000;

/// An initial sequence number generator based on SipHash-2-4.
///
/// > ISN = M + SipHash-2-4(secretkey, localip, localport, remoteip, remoteport)
///
/// where `M` is derived from the engine tick so that a reused four tuple starts beyond the
/// sequence space of its previous incarnation.
#[derive(Clone)]
pub struct IsnGenerator {
    keys: (u64, u64),
}

// Yes, that's the initial values, as ASCII text.
const IV: [&[u8; 8]; 4] = [
    b"somepseu",
    b"dorandom",
    b"lygenera",
    b"tedbytes"];

struct State {
    v0: u64,
    v1: u64,
    v2: u64,
    v3: u64,
}

impl IsnGenerator {
    /// Create a generator with a key drawn from a random number generator.
    pub fn from_rng(rng: &mut impl RngCore) -> Self {
        let mut bytes = [0u8; 16];
        rng.fill_bytes(&mut bytes);
        IsnGenerator::from_secret_key_bytes(bytes)
    }

    /// Create a generator with some pre-defined secret key.
    ///
    /// Really, create the key with some cryptographic random means or derive them from some other
    /// key with a key derivation function.
    pub fn from_secret_key_bytes(bytes: [u8; 16]) -> Self {
        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        a.copy_from_slice(&bytes[..8]);
        b.copy_from_slice(&bytes[8..]);
        IsnGenerator { keys: (u64::from_le_bytes(a), u64::from_le_bytes(b)) }
    }

    /// Get the initial sequence number for a connection.
    pub fn get_isn(&self, local: Ipv4Endpoint, remote: Ipv4Endpoint, now: Tick) -> TcpSeqNumber {
        let mut state = State::init(self.keys.0, self.keys.1);

        let m = u64::from(local.addr.to_network_integer())
            | u64::from(remote.addr.to_network_integer()) << 32;
        let p = u64::from(local.port)
            | u64::from(remote.port) << 16
            // Message length = 12
            | 12_u64 << 56;
        state.absorb(m);
        state.absorb(p);
        let hash = state.finalize() as u32;

        TcpSeqNumber::from(hash.wrapping_add(now.0.wrapping_mul(ISN_PER_TICK)))
    }
}

impl State {
    const SIP_C: usize = 2;
    const SIP_D: usize = 4;

    fn init(k0: u64, k1: u64) -> Self {
        State {
            v0: u64::from_be_bytes(*IV[0]) ^ k0,
            v1: u64::from_be_bytes(*IV[1]) ^ k1,
            v2: u64::from_be_bytes(*IV[2]) ^ k0,
            v3: u64::from_be_bytes(*IV[3]) ^ k1,
        }
    }

    fn round(&mut self) {
        self.v0 = self.v0.wrapping_add(self.v1);
        self.v1 = self.v1.rotate_left(13);
        self.v1 ^= self.v0;
        self.v0 = self.v0.rotate_left(32);
        self.v2 = self.v2.wrapping_add(self.v3);
        self.v3 = self.v3.rotate_left(16);
        self.v3 ^= self.v2;
        self.v0 = self.v0.wrapping_add(self.v3);
        self.v3 = self.v3.rotate_left(21);
        self.v3 ^= self.v0;
        self.v2 = self.v2.wrapping_add(self.v1);
        self.v1 = self.v1.rotate_left(17);
        self.v1 ^= self.v2;
        self.v2 = self.v2.rotate_left(32);
    }

    /// Process a single 8-byte block of the message.
    ///
    /// The caller absorbs the length block last.
    fn absorb(&mut self, m: u64) {
        self.v3 ^= m;
        (0..Self::SIP_C).for_each(|_| self.round());
        self.v0 ^= m;
    }

    /// Do the finalization rounds.
    fn finalize(mut self) -> u64 {
        self.v2 ^= 0xff;
        (0..Self::SIP_D).for_each(|_| self.round());
        self.v0 ^ self.v1 ^ self.v2 ^ self.v3
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Ipv4Address;

    /// See the paper, Appendix A.
    #[test]
    fn paper_test_vector() {
        let k0 = u64::from_le_bytes(0x0001020304050607_u64.to_be_bytes());
        let k1 = u64::from_le_bytes(0x08090a0b0c0d0e0f_u64.to_be_bytes());

        let mut state = State::init(k0, k1);
        let m0 = u64::from_le_bytes(0x0001020304050607_u64.to_be_bytes());
        state.absorb(m0);
        let m1 = u64::from_le_bytes(0x08090a0b0c0d0e0f_u64.to_be_bytes());
        state.absorb(m1);

        assert_eq!(state.finalize(), 0xa129ca6149be45e5);
    }

    #[test]
    fn isn_depends_on_tuple_and_tick() {
        let gen = IsnGenerator::from_secret_key_bytes(*b"0123456789abcdef");
        let local = Ipv4Endpoint::new(Ipv4Address::new(10, 0, 0, 1), 80);
        let remote = Ipv4Endpoint::new(Ipv4Address::new(10, 0, 0, 2), 49152);
        let other = Ipv4Endpoint::new(Ipv4Address::new(10, 0, 0, 2), 49153);

        let isn = gen.get_isn(local, remote, Tick(0));
        assert_eq!(isn, gen.get_isn(local, remote, Tick(0)));
        assert_ne!(isn, gen.get_isn(local, other, Tick(0)));
        assert_eq!(gen.get_isn(local, remote, Tick(1)), isn + ISN_PER_TICK as usize);
    }
}
