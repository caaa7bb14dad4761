//! Key derivation of RFC 7296, sections 2.14 and 2.17.
use zeroize::Zeroize;

use super::Result;
use super::crypto::Crypto;
use super::proposal::{EspSuite, IkeSuite};

/// The seven keys of an IKE SA.
///
/// `_i` keys protect messages sent by the original initiator, `_r` keys those of the original
/// responder.
pub struct IkeKeys {
    pub sk_d: Vec<u8>,
    pub sk_ai: Vec<u8>,
    pub sk_ar: Vec<u8>,
    pub sk_ei: Vec<u8>,
    pub sk_er: Vec<u8>,
    pub sk_pi: Vec<u8>,
    pub sk_pr: Vec<u8>,
}

/// The keys of one Child SA.
///
/// `_i` keys protect traffic sent by the initiator of the exchange that created the SA.
#[derive(Clone)]
pub struct ChildKeys {
    pub encr_i: Vec<u8>,
    pub integ_i: Vec<u8>,
    pub encr_r: Vec<u8>,
    pub integ_r: Vec<u8>,
}

impl IkeKeys {
    /// ```text
    /// SKEYSEED = prf(Ni | Nr, g^ir)
    /// {SK_d | SK_ai | SK_ar | SK_ei | SK_er | SK_pi | SK_pr}
    ///     = prf+ (SKEYSEED, Ni | Nr | SPIi | SPIr)
    /// ```
    pub fn derive<C: Crypto>(
        crypto: &C,
        suite: &IkeSuite,
        nonce_i: &[u8],
        nonce_r: &[u8],
        shared: &[u8],
        spi_i: u64,
        spi_r: u64,
    ) -> Result<Self> {
        let prf = suite.prf;
        let mut nonces = nonce_i.to_vec();
        nonces.extend_from_slice(nonce_r);
        let mut skeyseed = prf.compute(crypto, &nonces, &[shared])?;

        let mut seed = nonces;
        seed.extend_from_slice(&spi_i.to_be_bytes());
        seed.extend_from_slice(&spi_r.to_be_bytes());

        let prf_len = prf.output_len();
        let integ_len = suite.integrity.key_len();
        let encr_len = suite.encryption.key_len();
        let total = 3 * prf_len + 2 * integ_len + 2 * encr_len;
        let mut material = prf.expand(crypto, &skeyseed, &seed, total)?;
        skeyseed.zeroize();

        let mut rest = &material[..];
        let mut take = |len: usize| {
            let (head, tail) = rest.split_at(len);
            rest = tail;
            head.to_vec()
        };
        let keys = IkeKeys {
            sk_d: take(prf_len),
            sk_ai: take(integ_len),
            sk_ar: take(integ_len),
            sk_ei: take(encr_len),
            sk_er: take(encr_len),
            sk_pi: take(prf_len),
            sk_pr: take(prf_len),
        };
        material.zeroize();
        Ok(keys)
    }

    /// Encryption and integrity key for messages from the original initiator or responder.
    pub fn protect(&self, from_initiator: bool) -> (&[u8], &[u8]) {
        if from_initiator {
            (&self.sk_ei[..], &self.sk_ai[..])
        } else {
            (&self.sk_er[..], &self.sk_ar[..])
        }
    }

    /// `KEYMAT = prf+(SK_d, Ni | Nr)` of a Child SA created without PFS.
    pub fn child<C: Crypto>(
        &self,
        crypto: &C,
        ike: &IkeSuite,
        esp: &EspSuite,
        nonce_i: &[u8],
        nonce_r: &[u8],
    ) -> Result<ChildKeys> {
        let mut seed = nonce_i.to_vec();
        seed.extend_from_slice(nonce_r);
        let encr_len = esp.encryption.key_len();
        let integ_len = esp.integrity.key_len();
        let mut material = ike.prf.expand(crypto, &self.sk_d, &seed, 2 * (encr_len + integ_len))?;

        let (encr_i, rest) = material.split_at(encr_len);
        let (integ_i, rest) = rest.split_at(integ_len);
        let (encr_r, integ_r) = rest.split_at(encr_len);
        let keys = ChildKeys {
            encr_i: encr_i.to_vec(),
            integ_i: integ_i.to_vec(),
            encr_r: encr_r.to_vec(),
            integ_r: integ_r.to_vec(),
        };
        material.zeroize();
        Ok(keys)
    }
}

impl Drop for IkeKeys {
    fn drop(&mut self) {
        self.sk_d.zeroize();
        self.sk_ai.zeroize();
        self.sk_ar.zeroize();
        self.sk_ei.zeroize();
        self.sk_er.zeroize();
        self.sk_pi.zeroize();
        self.sk_pr.zeroize();
    }
}

impl Drop for ChildKeys {
    fn drop(&mut self) {
        self.encr_i.zeroize();
        self.integ_i.zeroize();
        self.encr_r.zeroize();
        self.integ_r.zeroize();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ike::crypto::SoftCrypto;
    use crate::ike::proposal::{DhGroup, Encryption, Integrity, Prf};

    const SUITE: IkeSuite = IkeSuite {
        encryption: Encryption::AesCbc128,
        integrity: Integrity::HmacSha1_96,
        prf: Prf::HmacSha1,
        dh: DhGroup::Modp1024,
    };

    #[test]
    fn key_lengths_and_separation() {
        let crypto = SoftCrypto::new(1);
        let keys = IkeKeys::derive(&crypto, &SUITE, &[1; 16], &[2; 16], &[3; 128], 7, 9).unwrap();
        assert_eq!(keys.sk_d.len(), 20);
        assert_eq!(keys.sk_ai.len(), 20);
        assert_eq!(keys.sk_ei.len(), 16);
        assert_eq!(keys.sk_pr.len(), 20);
        assert_ne!(keys.sk_ei, keys.sk_er);
        assert_eq!(keys.protect(false).0, &keys.sk_er[..]);

        // Both ends compute the same keys from the same inputs.
        let again = IkeKeys::derive(&crypto, &SUITE, &[1; 16], &[2; 16], &[3; 128], 7, 9).unwrap();
        assert_eq!(again.sk_ar, keys.sk_ar);
        let other = IkeKeys::derive(&crypto, &SUITE, &[1; 16], &[2; 16], &[3; 128], 7, 10).unwrap();
        assert_ne!(other.sk_d, keys.sk_d);
    }

    #[test]
    fn child_keys_split_keymat() {
        let crypto = SoftCrypto::new(1);
        let keys = IkeKeys::derive(&crypto, &SUITE, &[1; 16], &[2; 16], &[3; 128], 7, 9).unwrap();
        let esp = EspSuite { encryption: Encryption::AesCbc128, integrity: Integrity::HmacSha1_96 };
        let child = keys.child(&crypto, &SUITE, &esp, &[4; 16], &[5; 16]).unwrap();
        let keymat = Prf::HmacSha1.expand(&crypto, &keys.sk_d, &[[4u8; 16], [5u8; 16]].concat(), 72).unwrap();
        assert_eq!(child.encr_i, &keymat[..16]);
        assert_eq!(child.integ_i, &keymat[16..36]);
        assert_eq!(child.encr_r, &keymat[36..52]);
        assert_eq!(child.integ_r, &keymat[52..]);
    }
}
