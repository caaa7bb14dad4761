//! The cryptographic primitives of the key exchange.
//!
//! The engine only ever calls through the [`Crypto`] trait. [`SoftCrypto`] implements it in
//! software and serves 3DES-CBC, AES-CBC-128, HMAC-SHA1 and the 1024 bit MODP group. A provider
//! is free to decline a cipher through [`Crypto::supports`], the negotiation then settles on the
//! remaining one.
//!
//! [`Crypto`]: trait.Crypto.html
//! [`SoftCrypto`]: struct.SoftCrypto.html
//! [`Crypto::supports`]: trait.Crypto.html#tymethod.supports
use aes::Aes128;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use cipher::block_padding::NoPadding;
use des::TdesEde3;
use hmac::{Hmac, Mac};
use num_bigint::{BigUint, RandBigInt};
use once_cell::sync::Lazy;
use rand::{RngCore, SeedableRng};
use rand::rngs::StdRng;
use sha1::Sha1;
use zeroize::Zeroize;

use super::{Error, Result};
use super::proposal::{DhGroup, Encryption};

/// The prime of the 1024 bit MODP group, RFC 2409 section 6.2.
static MODP_1024_P: Lazy<BigUint> = Lazy::new(|| {
    let hex = "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
               29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
               EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
               E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
               EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381\
               FFFFFFFFFFFFFFFF";
    // The literal is constant, decoding can only fail on a typo caught by the tests.
    BigUint::from_bytes_be(&hex::decode(hex).unwrap_or_default())
});

static MODP_GENERATOR: Lazy<BigUint> = Lazy::new(|| BigUint::from(2u32));

/// A Diffie-Hellman key pair of one exchange.
///
/// The private value is wiped when the pair is dropped.
pub struct DhSecret {
    group: DhGroup,
    private: Vec<u8>,
    public: Vec<u8>,
}

impl DhSecret {
    pub fn new(group: DhGroup, private: Vec<u8>, public: Vec<u8>) -> Self {
        DhSecret { group, private, public }
    }

    pub fn group(&self) -> DhGroup {
        self.group
    }

    /// The public value, padded to the group length.
    pub fn public(&self) -> &[u8] {
        &self.public
    }

    pub fn private(&self) -> &[u8] {
        &self.private
    }
}

impl Drop for DhSecret {
    fn drop(&mut self) {
        self.private.zeroize();
    }
}

/// The primitives the engine needs.
pub trait Crypto {
    /// Fill `buf` with random octets for SPIs, nonces and IVs.
    fn random_bytes(&mut self, buf: &mut [u8]);

    /// Whether the cipher is available for the IKE SA and Child SAs.
    fn supports(&self, encryption: Encryption) -> bool;

    /// HMAC-SHA1 of the concatenation of `data`.
    fn hmac_sha1(&self, key: &[u8], data: &[&[u8]]) -> Result<Vec<u8>>;

    /// Encrypt whole blocks in CBC mode.
    fn encrypt(&self, encryption: Encryption, key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt whole blocks in CBC mode.
    fn decrypt(&self, encryption: Encryption, key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>>;

    /// Generate a key pair in the group.
    fn dh_generate(&mut self, group: DhGroup) -> Result<DhSecret>;

    /// The shared secret with the peer's public value, padded to the group length.
    fn dh_compute(&self, secret: &DhSecret, peer: &[u8]) -> Result<Vec<u8>>;
}

/// The software provider.
pub struct SoftCrypto {
    rng: StdRng,
}

impl SoftCrypto {
    /// A provider with a reproducible random stream.
    pub fn new(seed: u64) -> Self {
        SoftCrypto { rng: StdRng::seed_from_u64(seed) }
    }

    /// A provider seeded from the operating system.
    pub fn from_entropy() -> Self {
        SoftCrypto { rng: StdRng::from_entropy() }
    }
}

impl Crypto for SoftCrypto {
    fn random_bytes(&mut self, buf: &mut [u8]) {
        self.rng.fill_bytes(buf)
    }

    fn supports(&self, encryption: Encryption) -> bool {
        match encryption {
            Encryption::TripleDesCbc | Encryption::AesCbc128 => true,
        }
    }

    fn hmac_sha1(&self, key: &[u8], data: &[&[u8]]) -> Result<Vec<u8>> {
        let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(key)
            .map_err(|_| Error::CryptoError("hmac key"))?;
        for part in data {
            mac.update(part);
        }
        Ok(mac.finalize().into_bytes().to_vec())
    }

    fn encrypt(&self, encryption: Encryption, key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        check_blocks(encryption, data)?;
        match encryption {
            Encryption::AesCbc128 => {
                let cipher = cbc::Encryptor::<Aes128>::new_from_slices(key, iv)
                    .map_err(|_| Error::CryptoError("AES key or IV length"))?;
                Ok(cipher.encrypt_padded_vec_mut::<NoPadding>(data))
            },
            Encryption::TripleDesCbc => {
                let cipher = cbc::Encryptor::<TdesEde3>::new_from_slices(key, iv)
                    .map_err(|_| Error::CryptoError("3DES key or IV length"))?;
                Ok(cipher.encrypt_padded_vec_mut::<NoPadding>(data))
            },
        }
    }

    fn decrypt(&self, encryption: Encryption, key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        check_blocks(encryption, data)?;
        match encryption {
            Encryption::AesCbc128 => {
                let cipher = cbc::Decryptor::<Aes128>::new_from_slices(key, iv)
                    .map_err(|_| Error::CryptoError("AES key or IV length"))?;
                cipher.decrypt_padded_vec_mut::<NoPadding>(data)
                    .map_err(|_| Error::CryptoError("AES block length"))
            },
            Encryption::TripleDesCbc => {
                let cipher = cbc::Decryptor::<TdesEde3>::new_from_slices(key, iv)
                    .map_err(|_| Error::CryptoError("3DES key or IV length"))?;
                cipher.decrypt_padded_vec_mut::<NoPadding>(data)
                    .map_err(|_| Error::CryptoError("3DES block length"))
            },
        }
    }

    fn dh_generate(&mut self, group: DhGroup) -> Result<DhSecret> {
        let (prime, generator) = modp(group);
        let upper = prime.clone() - 1u32;
        let private = self.rng.gen_biguint_range(&BigUint::from(2u32), &upper);
        let public = generator.modpow(&private, prime);
        Ok(DhSecret::new(group, private.to_bytes_be(), pad(group, public.to_bytes_be())?))
    }

    fn dh_compute(&self, secret: &DhSecret, peer: &[u8]) -> Result<Vec<u8>> {
        let group = secret.group();
        let (prime, _) = modp(group);
        if peer.len() != group.value_len() {
            return Err(Error::InvalidPayload("key exchange length"));
        }
        let peer = BigUint::from_bytes_be(peer);
        let upper = prime.clone() - 1u32;
        if peer <= BigUint::from(1u32) || peer >= upper {
            return Err(Error::InvalidPayload("key exchange value out of range"));
        }
        let private = BigUint::from_bytes_be(secret.private());
        pad(group, peer.modpow(&private, prime).to_bytes_be())
    }
}

fn modp(group: DhGroup) -> (&'static BigUint, &'static BigUint) {
    match group {
        DhGroup::Modp1024 => (&*MODP_1024_P, &*MODP_GENERATOR),
    }
}

/// Left pad a big-endian value to the group length.
fn pad(group: DhGroup, value: Vec<u8>) -> Result<Vec<u8>> {
    let len = group.value_len();
    if value.len() > len {
        return Err(Error::CryptoError("group value too long"));
    }
    let mut padded = vec![0; len - value.len()];
    padded.extend_from_slice(&value);
    Ok(padded)
}

fn check_blocks(encryption: Encryption, data: &[u8]) -> Result<()> {
    if data.len() % encryption.block_len() != 0 {
        return Err(Error::InvalidPayload("ciphertext is not a multiple of the block length"));
    }
    Ok(())
}
