//! The algorithms we offer and accept, and their negotiation.
//!
//! Both the IKE SA and every Child SA are offered with 3DES and AES-CBC-128 encryption, both
//! protected by HMAC-SHA1-96. The IKE SA additionally uses PRF-HMAC-SHA1 and the 1024 bit MODP
//! group. A responder takes the first offered proposal it can serve, and within it the first
//! transform of each kind, so the initiator's order is its preference.
use crate::wire::ike::{Proposal, ProtocolId, Transform, TransformType};

use super::{Error, Result};
use super::crypto::Crypto;

const ENCR_3DES: u16 = 3;
const ENCR_AES_CBC: u16 = 12;
const PRF_HMAC_SHA1: u16 = 2;
const AUTH_HMAC_SHA1_96: u16 = 2;
const DH_MODP_1024: u16 = 2;
const ESN_NONE: u16 = 0;

/// An encryption transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encryption {
    TripleDesCbc,
    AesCbc128,
}

/// An integrity transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Integrity {
    HmacSha1_96,
}

/// A pseudo-random function transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Prf {
    HmacSha1,
}

/// A Diffie-Hellman group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DhGroup {
    Modp1024,
}

/// The transforms chosen for an IKE SA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IkeSuite {
    pub encryption: Encryption,
    pub integrity: Integrity,
    pub prf: Prf,
    pub dh: DhGroup,
}

/// The transforms chosen for an ESP Child SA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EspSuite {
    pub encryption: Encryption,
    pub integrity: Integrity,
}

impl Encryption {
    pub fn key_len(self) -> usize {
        match self {
            Encryption::TripleDesCbc => 24,
            Encryption::AesCbc128 => 16,
        }
    }

    /// The cipher block length, also the length of the IV.
    pub fn block_len(self) -> usize {
        match self {
            Encryption::TripleDesCbc => 8,
            Encryption::AesCbc128 => 16,
        }
    }

    fn transform(self) -> Transform {
        match self {
            Encryption::TripleDesCbc => Transform::new(TransformType::Encryption, ENCR_3DES),
            Encryption::AesCbc128 =>
                Transform::with_key_length(TransformType::Encryption, ENCR_AES_CBC, 128),
        }
    }

    fn from_transform(transform: Transform) -> Option<Self> {
        match (transform.id, transform.key_length) {
            (ENCR_3DES, None) => Some(Encryption::TripleDesCbc),
            (ENCR_AES_CBC, Some(128)) => Some(Encryption::AesCbc128),
            _ => None,
        }
    }
}

impl Integrity {
    pub fn key_len(self) -> usize {
        match self {
            Integrity::HmacSha1_96 => 20,
        }
    }

    /// Length of the truncated checksum on the wire.
    pub fn icv_len(self) -> usize {
        match self {
            Integrity::HmacSha1_96 => 12,
        }
    }

    /// The truncated checksum over `data`.
    pub fn compute<C: Crypto>(self, crypto: &C, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        let mut mac = crypto.hmac_sha1(key, &[data])?;
        mac.truncate(self.icv_len());
        Ok(mac)
    }

    fn transform(self) -> Transform {
        Transform::new(TransformType::Integrity, AUTH_HMAC_SHA1_96)
    }

    fn from_transform(transform: Transform) -> Option<Self> {
        match transform.id {
            AUTH_HMAC_SHA1_96 => Some(Integrity::HmacSha1_96),
            _ => None,
        }
    }
}

impl Prf {
    /// Length of the key and of the output.
    pub fn output_len(self) -> usize {
        match self {
            Prf::HmacSha1 => 20,
        }
    }

    pub fn compute<C: Crypto>(self, crypto: &C, key: &[u8], data: &[&[u8]]) -> Result<Vec<u8>> {
        match self {
            Prf::HmacSha1 => crypto.hmac_sha1(key, data),
        }
    }

    /// The key expansion of RFC 7296, section 2.13.
    ///
    /// ```text
    /// prf+ (K,S) = T1 | T2 | T3 | ...
    /// T1 = prf (K, S | 0x01)
    /// Tn = prf (K, Tn-1 | S | n)
    /// ```
    pub fn expand<C: Crypto>(self, crypto: &C, key: &[u8], seed: &[u8], len: usize)
        -> Result<Vec<u8>>
    {
        // The counter is a single octet.
        if len > 255 * self.output_len() {
            return Err(Error::CryptoError("prf+ output too long"));
        }

        let mut output = Vec::with_capacity(len);
        let mut block = Vec::new();
        let mut counter = 1u8;
        while output.len() < len {
            block = self.compute(crypto, key, &[&block[..], seed, &[counter][..]])?;
            output.extend_from_slice(&block);
            counter = counter.wrapping_add(1);
        }
        output.truncate(len);
        Ok(output)
    }

    fn transform(self) -> Transform {
        Transform::new(TransformType::Prf, PRF_HMAC_SHA1)
    }

    fn from_transform(transform: Transform) -> Option<Self> {
        match transform.id {
            PRF_HMAC_SHA1 => Some(Prf::HmacSha1),
            _ => None,
        }
    }
}

impl DhGroup {
    /// The group number in key exchange payloads.
    pub fn id(self) -> u16 {
        match self {
            DhGroup::Modp1024 => DH_MODP_1024,
        }
    }

    /// Length of public values and of the shared secret.
    pub fn value_len(self) -> usize {
        match self {
            DhGroup::Modp1024 => 128,
        }
    }

    fn transform(self) -> Transform {
        Transform::new(TransformType::DiffieHellman, self.id())
    }

    fn from_transform(transform: Transform) -> Option<Self> {
        match transform.id {
            DH_MODP_1024 => Some(DhGroup::Modp1024),
            _ => None,
        }
    }
}

/// The group used when initiating.
pub const PREFERRED_GROUP: DhGroup = DhGroup::Modp1024;

const OFFERED_ENCRYPTION: [Encryption; 2] = [Encryption::TripleDesCbc, Encryption::AesCbc128];

/// The proposals of an IKE_SA_INIT request, one per encryption transform.
pub(crate) fn ike_offer() -> Vec<Proposal> {
    OFFERED_ENCRYPTION.iter().enumerate().map(|(i, encryption)| {
        IkeSuite {
            encryption: *encryption,
            integrity: Integrity::HmacSha1_96,
            prf: Prf::HmacSha1,
            dh: PREFERRED_GROUP,
        }.proposal(i as u8 + 1)
    }).collect()
}

/// The single ESP proposal creating a Child SA with inbound SPI `spi`.
pub(crate) fn esp_offer(spi: u32) -> Vec<Proposal> {
    let mut transforms: Vec<_> = OFFERED_ENCRYPTION.iter()
        .map(|encryption| encryption.transform())
        .collect();
    transforms.push(Integrity::HmacSha1_96.transform());
    transforms.push(Transform::new(TransformType::Esn, ESN_NONE));
    vec![Proposal {
        number: 1,
        protocol: ProtocolId::Esp,
        spi: spi.to_be_bytes().to_vec(),
        transforms,
    }]
}

impl IkeSuite {
    fn proposal(&self, number: u8) -> Proposal {
        Proposal {
            number,
            protocol: ProtocolId::Ike,
            spi: Vec::new(),
            transforms: vec![
                self.encryption.transform(),
                self.prf.transform(),
                self.integrity.transform(),
                self.dh.transform(),
            ],
        }
    }

    fn pick<C: Crypto>(proposal: &Proposal, crypto: &C) -> Option<Self> {
        if proposal.protocol != ProtocolId::Ike {
            return None;
        }
        Some(IkeSuite {
            encryption: pick_encryption(proposal, crypto)?,
            integrity: proposal.transforms_of(TransformType::Integrity)
                .find_map(Integrity::from_transform)?,
            prf: proposal.transforms_of(TransformType::Prf).find_map(Prf::from_transform)?,
            dh: proposal.transforms_of(TransformType::DiffieHellman)
                .find_map(DhGroup::from_transform)?,
        })
    }
}

impl EspSuite {
    fn pick<C: Crypto>(proposal: &Proposal, crypto: &C) -> Option<Self> {
        if proposal.protocol != ProtocolId::Esp || proposal.spi.len() != 4 {
            return None;
        }
        // Extended sequence numbers are not supported, an offer must allow going without.
        let esn = proposal.transforms_of(TransformType::Esn).collect::<Vec<_>>();
        if !esn.is_empty() && !esn.iter().any(|t| t.id == ESN_NONE) {
            return None;
        }
        Some(EspSuite {
            encryption: pick_encryption(proposal, crypto)?,
            integrity: proposal.transforms_of(TransformType::Integrity)
                .find_map(Integrity::from_transform)?,
        })
    }

    fn proposal(&self, number: u8, spi: u32) -> Proposal {
        Proposal {
            number,
            protocol: ProtocolId::Esp,
            spi: spi.to_be_bytes().to_vec(),
            transforms: vec![
                self.encryption.transform(),
                self.integrity.transform(),
                Transform::new(TransformType::Esn, ESN_NONE),
            ],
        }
    }
}

fn pick_encryption<C: Crypto>(proposal: &Proposal, crypto: &C) -> Option<Encryption> {
    proposal.transforms_of(TransformType::Encryption)
        .filter_map(Encryption::from_transform)
        .find(|encryption| crypto.supports(*encryption))
}

fn spi_of(proposal: &Proposal) -> Option<u32> {
    match proposal.spi[..] {
        [a, b, c, d] => Some(u32::from_be_bytes([a, b, c, d])),
        _ => None,
    }
}

/// Choose from the proposals of an IKE_SA_INIT request.
///
/// Returns the chosen proposal to answer with, reduced to one transform of each kind.
pub(crate) fn select_ike<C: Crypto>(offered: &[Proposal], crypto: &C) -> Result<(Proposal, IkeSuite)> {
    offered.iter()
        .find_map(|proposal| {
            let suite = IkeSuite::pick(proposal, crypto)?;
            Some((suite.proposal(proposal.number), suite))
        })
        .ok_or(Error::NoProposalChosen)
}

/// Choose from ESP proposals, answering with our inbound SPI `spi`.
///
/// Returns the answer, the suite and the SPI of the peer.
pub(crate) fn select_esp<C: Crypto>(offered: &[Proposal], crypto: &C, spi: u32)
    -> Result<(Proposal, EspSuite, u32)>
{
    offered.iter()
        .find_map(|proposal| {
            let suite = EspSuite::pick(proposal, crypto)?;
            let peer_spi = spi_of(proposal)?;
            Some((suite.proposal(proposal.number, spi), suite, peer_spi))
        })
        .ok_or(Error::NoProposalChosen)
}

/// Check the answer to our IKE proposals.
///
/// The responder must have picked exactly one of them, with one transform of each kind.
pub(crate) fn accept_ike<C: Crypto>(chosen: &[Proposal], crypto: &C) -> Result<IkeSuite> {
    let proposal = match chosen {
        [proposal] => proposal,
        _ => return Err(Error::NoProposalChosen),
    };
    if proposal.transforms.len() != 4 {
        return Err(Error::NoProposalChosen);
    }
    IkeSuite::pick(proposal, crypto).ok_or(Error::NoProposalChosen)
}

/// Check the answer to our ESP proposal, returning the suite and the peer's SPI.
pub(crate) fn accept_esp<C: Crypto>(chosen: &[Proposal], crypto: &C) -> Result<(EspSuite, u32)> {
    let proposal = match chosen {
        [proposal] => proposal,
        _ => return Err(Error::NoProposalChosen),
    };
    let suite = EspSuite::pick(proposal, crypto).ok_or(Error::NoProposalChosen)?;
    let spi = spi_of(proposal).ok_or(Error::InvalidPayload("ESP SPI length"))?;
    Ok((suite, spi))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ike::crypto::SoftCrypto;

    #[test]
    fn responder_takes_first_offer() {
        let crypto = SoftCrypto::new(1);
        let offer = ike_offer();
        assert_eq!(offer.len(), 2);
        assert_eq!(offer[0].transform(TransformType::Encryption).map(|t| t.id), Some(ENCR_3DES));

        let (chosen, suite) = select_ike(&offer, &crypto).unwrap();
        assert_eq!(chosen.number, 1);
        assert_eq!(suite.encryption, Encryption::TripleDesCbc);
        assert_eq!(suite.encryption.key_len(), 24);
        assert_eq!(chosen.transforms.len(), 4);
        assert_eq!(accept_ike(&[chosen], &crypto), Ok(suite));
    }

    #[test]
    fn responder_skips_unknown_encryption() {
        let crypto = SoftCrypto::new(1);
        let mut offer = ike_offer();
        // AES-GCM, which we do not implement.
        offer[0].transforms[0] = Transform::new(TransformType::Encryption, 20);

        let (chosen, suite) = select_ike(&offer, &crypto).unwrap();
        assert_eq!(chosen.number, 2);
        assert_eq!(suite.encryption, Encryption::AesCbc128);
        assert_eq!(accept_ike(&[chosen], &crypto), Ok(suite));
    }

    #[test]
    fn esp_answer_carries_both_spis() {
        let crypto = SoftCrypto::new(1);
        let offer = esp_offer(0x1000);
        let (chosen, suite, peer) = select_esp(&offer, &crypto, 0x2000).unwrap();
        assert_eq!(peer, 0x1000);
        assert_eq!(suite.encryption, Encryption::TripleDesCbc);
        assert_eq!(chosen.transforms.len(), 3);
        assert_eq!(accept_esp(&[chosen], &crypto), Ok((suite, 0x2000)));
    }

    #[test]
    fn nothing_acceptable() {
        let crypto = SoftCrypto::new(1);
        let mut offer = ike_offer();
        offer.truncate(1);
        offer[0].transforms[0] = Transform::new(TransformType::Encryption, 20);
        assert_eq!(select_ike(&offer, &crypto), Err(Error::NoProposalChosen));
        // An answer that still lists alternatives was not a choice.
        assert_eq!(accept_ike(&ike_offer(), &crypto), Err(Error::NoProposalChosen));
    }

    #[test]
    fn prf_plus_counts_blocks() {
        let crypto = SoftCrypto::new(1);
        let out = Prf::HmacSha1.expand(&crypto, b"key", b"seed", 50).unwrap();
        assert_eq!(out.len(), 50);
        let first = Prf::HmacSha1.compute(&crypto, b"key", &[&b"seed"[..], &[1][..]]).unwrap();
        assert_eq!(&out[..20], &first[..]);
        let second = Prf::HmacSha1.compute(&crypto, b"key", &[&first[..], b"seed", &[2][..]]).unwrap();
        assert_eq!(&out[20..40], &second[..]);
    }
}
