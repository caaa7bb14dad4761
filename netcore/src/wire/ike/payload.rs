//! Payloads of an IKEv2 message.
//!
//! Every payload starts with the generic header
//!
//! ```text
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | Next Payload  |C|  RESERVED   |         Payload Length        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! where the length includes the generic header itself.
use byteorder::{ByteOrder, NetworkEndian};

use crate::wire::{Error, Result};
use crate::wire::ipv4::Address;

enum_with_unknown! {
    /// The type of a payload, as found in the preceding next payload field.
    pub doc enum PayloadType(u8) {
        /// End of the chain.
        None = 0,
        /// Security association, a list of proposals.
        SecurityAssociation = 33,
        /// Key exchange.
        KeyExchange = 34,
        /// Identification of the initiator.
        IdInitiator = 35,
        /// Identification of the responder.
        IdResponder = 36,
        /// Certificate.
        Certificate = 37,
        /// Certificate request.
        CertificateRequest = 38,
        /// Authentication.
        Authentication = 39,
        /// Nonce.
        Nonce = 40,
        /// Notify.
        Notify = 41,
        /// Delete.
        Delete = 42,
        /// Vendor id.
        VendorId = 43,
        /// Traffic selector of the initiator.
        TsInitiator = 44,
        /// Traffic selector of the responder.
        TsResponder = 45,
        /// Encrypted and authenticated.
        Encrypted = 46
    }
}

enum_with_unknown! {
    /// The protocol a proposal, notify or delete refers to.
    pub doc enum ProtocolId(u8) {
        /// Refers to the IKE SA itself.
        Ike = 1,
        /// Authentication header.
        Ah = 2,
        /// Encapsulating security payload.
        Esp = 3
    }
}

enum_with_unknown! {
    /// The kind of a transform in a proposal.
    pub doc enum TransformType(u8) {
        /// Encryption algorithm.
        Encryption = 1,
        /// Pseudo-random function.
        Prf = 2,
        /// Integrity algorithm.
        Integrity = 3,
        /// Diffie-Hellman group.
        DiffieHellman = 4,
        /// Extended sequence numbers.
        Esn = 5
    }
}

enum_with_unknown! {
    /// The type of an identification payload.
    pub doc enum IdType(u8) {
        /// A single four octet IPv4 address.
        Ipv4Addr = 1,
        /// A fully qualified domain name.
        Fqdn = 2,
        /// An RFC 822 email address.
        Rfc822Addr = 3,
        /// A single sixteen octet IPv6 address.
        Ipv6Addr = 5,
        /// An opaque octet stream.
        KeyId = 11
    }
}

enum_with_unknown! {
    /// Notify message types, errors below 16384 and status above.
    pub doc enum NotifyType(u16) {
        /// A critical payload was not understood.
        UnsupportedCriticalPayload = 1,
        /// The SPI of a message was not recognized.
        InvalidIkeSpi = 4,
        /// The major version is not supported.
        InvalidMajorVersion = 5,
        /// The message was malformed.
        InvalidSyntax = 7,
        /// The message id was out of the window.
        InvalidMessageId = 9,
        /// An ESP or AH packet had an unknown SPI.
        InvalidSpi = 11,
        /// None of the proposals was acceptable.
        NoProposalChosen = 14,
        /// The Diffie-Hellman group is not the one selected.
        InvalidKePayload = 17,
        /// Authentication failed.
        AuthenticationFailed = 24,
        /// Only a single pair of traffic selectors is acceptable.
        SinglePairRequired = 34,
        /// No further child SA are accepted.
        NoAdditionalSas = 35,
        /// The traffic selectors are not acceptable.
        TsUnacceptable = 38,
        /// The requested child SA should use transport mode.
        UseTransportMode = 16391,
        /// The exchange rekeys the SA with the notified SPI.
        RekeySa = 16393
    }
}

/// Authentication with a shared key message integrity code.
pub const AUTH_SHARED_KEY: u8 = 2;

/// The only traffic selector type we handle, an IPv4 address range.
pub const TS_IPV4_ADDR_RANGE: u8 = 7;

/// Attribute type of a transform key length, in TV format.
const ATTR_KEY_LENGTH: u16 = 0x800e;

/// A transform substructure inside a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transform {
    pub kind: TransformType,
    pub id: u16,
    pub key_length: Option<u16>,
}

/// A proposal substructure inside a security association payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub number: u8,
    pub protocol: ProtocolId,
    pub spi: Vec<u8>,
    pub transforms: Vec<Transform>,
}

/// The content of an identification payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identification {
    pub id_type: IdType,
    pub data: Vec<u8>,
}

/// A notify payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notify {
    pub protocol: ProtocolId,
    pub spi: Vec<u8>,
    pub kind: NotifyType,
    pub data: Vec<u8>,
}

/// A delete payload, naming SA of one protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delete {
    pub protocol: ProtocolId,
    pub spis: Vec<Vec<u8>>,
}

/// An IPv4 traffic selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficSelector {
    pub ip_protocol: u8,
    pub start_port: u16,
    pub end_port: u16,
    pub start_addr: Address,
    pub end_addr: Address,
}

/// One decoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    SecurityAssociation(Vec<Proposal>),
    KeyExchange { group: u16, data: Vec<u8> },
    IdInitiator(Identification),
    IdResponder(Identification),
    Authentication { method: u8, data: Vec<u8> },
    Nonce(Vec<u8>),
    Notify(Notify),
    Delete(Delete),
    TsInitiator(Vec<TrafficSelector>),
    TsResponder(Vec<TrafficSelector>),
    /// The encrypted payload with the type of the first inner payload.
    ///
    /// The data is the IV, the ciphertext and the integrity checksum.
    Encrypted { first: PayloadType, data: Vec<u8> },
    /// A non-critical payload we do not interpret.
    Unknown { kind: u8, data: Vec<u8> },
}

impl Transform {
    pub fn new(kind: TransformType, id: u16) -> Self {
        Transform { kind, id, key_length: None }
    }

    pub fn with_key_length(kind: TransformType, id: u16, bits: u16) -> Self {
        Transform { kind, id, key_length: Some(bits) }
    }

    fn parse(data: &[u8]) -> Result<(Transform, bool)> {
        if data.len() < 8 {
            return Err(Error::Truncated);
        }
        let last = match data[0] {
            0 => true,
            3 => false,
            _ => return Err(Error::Malformed),
        };
        let kind = TransformType::from(data[4]);
        let id = NetworkEndian::read_u16(&data[6..8]);

        let mut key_length = None;
        let mut attributes = &data[8..];
        while attributes.len() >= 4 {
            let attr_type = NetworkEndian::read_u16(&attributes[0..2]);
            if attr_type & 0x8000 != 0 {
                if attr_type == ATTR_KEY_LENGTH {
                    key_length = Some(NetworkEndian::read_u16(&attributes[2..4]));
                }
                attributes = &attributes[4..];
            } else {
                let len = NetworkEndian::read_u16(&attributes[2..4]) as usize;
                attributes = attributes.get(4 + len..).ok_or(Error::Truncated)?;
            }
        }
        if !attributes.is_empty() {
            return Err(Error::Malformed);
        }

        Ok((Transform { kind, id, key_length }, last))
    }

    fn buffer_len(&self) -> usize {
        8 + if self.key_length.is_some() { 4 } else { 0 }
    }

    fn emit(&self, last: bool, out: &mut Vec<u8>) {
        let mut head = [0u8; 8];
        head[0] = if last { 0 } else { 3 };
        NetworkEndian::write_u16(&mut head[2..4], self.buffer_len() as u16);
        head[4] = self.kind.into();
        NetworkEndian::write_u16(&mut head[6..8], self.id);
        out.extend_from_slice(&head);
        if let Some(bits) = self.key_length {
            let mut attr = [0u8; 4];
            NetworkEndian::write_u16(&mut attr[0..2], ATTR_KEY_LENGTH);
            NetworkEndian::write_u16(&mut attr[2..4], bits);
            out.extend_from_slice(&attr);
        }
    }
}

impl Proposal {
    /// The first transform of the requested kind.
    pub fn transform(&self, kind: TransformType) -> Option<Transform> {
        self.transforms.iter().cloned().find(|t| t.kind == kind)
    }

    /// All transforms of the requested kind.
    pub fn transforms_of(&self, kind: TransformType) -> impl Iterator<Item=Transform> + '_ {
        self.transforms.iter().cloned().filter(move |t| t.kind == kind)
    }

    fn parse(data: &[u8]) -> Result<(Proposal, bool)> {
        if data.len() < 8 {
            return Err(Error::Truncated);
        }
        let last = match data[0] {
            0 => true,
            2 => false,
            _ => return Err(Error::Malformed),
        };
        let number = data[4];
        let protocol = ProtocolId::from(data[5]);
        let spi_size = data[6] as usize;
        let count = data[7] as usize;
        let spi = data.get(8..8 + spi_size).ok_or(Error::Truncated)?.to_vec();

        let mut transforms = Vec::with_capacity(count);
        let mut rest = &data[8 + spi_size..];
        loop {
            let (body, next) = split_substructure(rest)?;
            let (transform, last) = Transform::parse(body)?;
            transforms.push(transform);
            rest = next;
            if last {
                break;
            }
        }
        if transforms.len() != count || !rest.is_empty() {
            return Err(Error::Malformed);
        }

        Ok((Proposal { number, protocol, spi, transforms }, last))
    }

    fn emit(&self, last: bool, out: &mut Vec<u8>) {
        let start = out.len();
        out.extend_from_slice(&[
            if last { 0 } else { 2 }, 0, 0, 0,
            self.number,
            self.protocol.into(),
            self.spi.len() as u8,
            self.transforms.len() as u8,
        ]);
        out.extend_from_slice(&self.spi);
        for (i, transform) in self.transforms.iter().enumerate() {
            transform.emit(i + 1 == self.transforms.len(), out);
        }
        let len = (out.len() - start) as u16;
        NetworkEndian::write_u16(&mut out[start + 2..start + 4], len);
    }
}

impl Identification {
    /// An identity by IPv4 address.
    pub fn ipv4(address: Address) -> Self {
        Identification { id_type: IdType::Ipv4Addr, data: address.as_bytes().to_vec() }
    }

    /// The identity body as covered by authentication, type and reserved octets included.
    pub fn body(&self) -> Vec<u8> {
        let mut body = vec![self.id_type.into(), 0, 0, 0];
        body.extend_from_slice(&self.data);
        body
    }

    fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::Truncated);
        }
        Ok(Identification { id_type: IdType::from(data[0]), data: data[4..].to_vec() })
    }
}

impl Notify {
    /// A notify without SPI or data.
    pub fn new(kind: NotifyType) -> Self {
        Notify { protocol: ProtocolId::Unknown(0), spi: Vec::new(), kind, data: Vec::new() }
    }

    /// Error types, as opposed to status types.
    pub fn is_error(&self) -> bool {
        u16::from(self.kind) < 16384
    }
}

impl TrafficSelector {
    /// A selector covering all ports and protocols of a single host.
    pub fn host(address: Address) -> Self {
        TrafficSelector {
            ip_protocol: 0,
            start_port: 0,
            end_port: 0xffff,
            start_addr: address,
            end_addr: address,
        }
    }

    fn parse_list(data: &[u8]) -> Result<Vec<Self>> {
        if data.len() < 4 {
            return Err(Error::Truncated);
        }
        let count = data[0] as usize;
        let mut list = Vec::with_capacity(count);
        let mut rest = &data[4..];
        for _ in 0..count {
            if rest.len() < 4 {
                return Err(Error::Truncated);
            }
            let len = NetworkEndian::read_u16(&rest[2..4]) as usize;
            let body = rest.get(..len).ok_or(Error::Truncated)?;
            if rest[0] != TS_IPV4_ADDR_RANGE {
                return Err(Error::Unsupported);
            }
            if len != 16 {
                return Err(Error::Malformed);
            }
            list.push(TrafficSelector {
                ip_protocol: body[1],
                start_port: NetworkEndian::read_u16(&body[4..6]),
                end_port: NetworkEndian::read_u16(&body[6..8]),
                start_addr: Address::from_bytes(&body[8..12]),
                end_addr: Address::from_bytes(&body[12..16]),
            });
            rest = &rest[len..];
        }
        Ok(list)
    }

    fn emit_list(list: &[Self], out: &mut Vec<u8>) {
        out.extend_from_slice(&[list.len() as u8, 0, 0, 0]);
        for ts in list {
            let mut body = [0u8; 16];
            body[0] = TS_IPV4_ADDR_RANGE;
            body[1] = ts.ip_protocol;
            NetworkEndian::write_u16(&mut body[2..4], 16);
            NetworkEndian::write_u16(&mut body[4..6], ts.start_port);
            NetworkEndian::write_u16(&mut body[6..8], ts.end_port);
            body[8..12].copy_from_slice(ts.start_addr.as_bytes());
            body[12..16].copy_from_slice(ts.end_addr.as_bytes());
            out.extend_from_slice(&body);
        }
    }
}

impl Payload {
    /// The type announcing this payload in the chain.
    pub fn kind(&self) -> PayloadType {
        match self {
            Payload::SecurityAssociation(_) => PayloadType::SecurityAssociation,
            Payload::KeyExchange { .. } => PayloadType::KeyExchange,
            Payload::IdInitiator(_) => PayloadType::IdInitiator,
            Payload::IdResponder(_) => PayloadType::IdResponder,
            Payload::Authentication { .. } => PayloadType::Authentication,
            Payload::Nonce(_) => PayloadType::Nonce,
            Payload::Notify(_) => PayloadType::Notify,
            Payload::Delete(_) => PayloadType::Delete,
            Payload::TsInitiator(_) => PayloadType::TsInitiator,
            Payload::TsResponder(_) => PayloadType::TsResponder,
            Payload::Encrypted { .. } => PayloadType::Encrypted,
            Payload::Unknown { kind, .. } => PayloadType::from(*kind),
        }
    }

    fn parse(kind: PayloadType, critical: bool, body: &[u8]) -> Result<Payload> {
        Ok(match kind {
            PayloadType::SecurityAssociation => {
                let mut proposals = Vec::new();
                let mut rest = body;
                while !rest.is_empty() {
                    let (sub, next) = split_substructure(rest)?;
                    let (proposal, last) = Proposal::parse(sub)?;
                    proposals.push(proposal);
                    rest = next;
                    if last {
                        break;
                    }
                }
                if !rest.is_empty() {
                    return Err(Error::Malformed);
                }
                Payload::SecurityAssociation(proposals)
            },
            PayloadType::KeyExchange => {
                if body.len() < 4 {
                    return Err(Error::Truncated);
                }
                Payload::KeyExchange {
                    group: NetworkEndian::read_u16(&body[0..2]),
                    data: body[4..].to_vec(),
                }
            },
            PayloadType::IdInitiator => Payload::IdInitiator(Identification::parse(body)?),
            PayloadType::IdResponder => Payload::IdResponder(Identification::parse(body)?),
            PayloadType::Authentication => {
                if body.len() < 4 {
                    return Err(Error::Truncated);
                }
                Payload::Authentication { method: body[0], data: body[4..].to_vec() }
            },
            PayloadType::Nonce => Payload::Nonce(body.to_vec()),
            PayloadType::Notify => {
                if body.len() < 4 {
                    return Err(Error::Truncated);
                }
                let spi_size = body[1] as usize;
                let spi = body.get(4..4 + spi_size).ok_or(Error::Truncated)?;
                Payload::Notify(Notify {
                    protocol: ProtocolId::from(body[0]),
                    spi: spi.to_vec(),
                    kind: NotifyType::from(NetworkEndian::read_u16(&body[2..4])),
                    data: body[4 + spi_size..].to_vec(),
                })
            },
            PayloadType::Delete => {
                if body.len() < 4 {
                    return Err(Error::Truncated);
                }
                let spi_size = body[1] as usize;
                let count = NetworkEndian::read_u16(&body[2..4]) as usize;
                if body.len() != 4 + spi_size * count {
                    return Err(Error::Malformed);
                }
                let spis = if spi_size == 0 {
                    Vec::new()
                } else {
                    body[4..].chunks(spi_size).map(<[u8]>::to_vec).collect()
                };
                Payload::Delete(Delete { protocol: ProtocolId::from(body[0]), spis })
            },
            PayloadType::TsInitiator => Payload::TsInitiator(TrafficSelector::parse_list(body)?),
            PayloadType::TsResponder => Payload::TsResponder(TrafficSelector::parse_list(body)?),
            other if critical => {
                net_debug!("unsupported critical payload {:?}", other);
                return Err(Error::Unsupported);
            },
            other => Payload::Unknown { kind: other.into(), data: body.to_vec() },
        })
    }

    fn emit_body(&self, out: &mut Vec<u8>) {
        match self {
            Payload::SecurityAssociation(proposals) => {
                for (i, proposal) in proposals.iter().enumerate() {
                    proposal.emit(i + 1 == proposals.len(), out);
                }
            },
            Payload::KeyExchange { group, data } => {
                let mut head = [0u8; 4];
                NetworkEndian::write_u16(&mut head[0..2], *group);
                out.extend_from_slice(&head);
                out.extend_from_slice(data);
            },
            Payload::IdInitiator(id) | Payload::IdResponder(id) => {
                out.extend_from_slice(&id.body());
            },
            Payload::Authentication { method, data } => {
                out.extend_from_slice(&[*method, 0, 0, 0]);
                out.extend_from_slice(data);
            },
            Payload::Nonce(data) | Payload::Unknown { data, .. } => {
                out.extend_from_slice(data);
            },
            Payload::Notify(notify) => {
                let mut head = [0u8; 4];
                head[0] = notify.protocol.into();
                head[1] = notify.spi.len() as u8;
                NetworkEndian::write_u16(&mut head[2..4], notify.kind.into());
                out.extend_from_slice(&head);
                out.extend_from_slice(&notify.spi);
                out.extend_from_slice(&notify.data);
            },
            Payload::Delete(delete) => {
                let spi_size = delete.spis.first().map(Vec::len).unwrap_or(0);
                let mut head = [0u8; 4];
                head[0] = delete.protocol.into();
                head[1] = spi_size as u8;
                NetworkEndian::write_u16(&mut head[2..4], delete.spis.len() as u16);
                out.extend_from_slice(&head);
                for spi in &delete.spis {
                    out.extend_from_slice(spi);
                }
            },
            Payload::TsInitiator(list) | Payload::TsResponder(list) => {
                TrafficSelector::emit_list(list, out);
            },
            Payload::Encrypted { data, .. } => {
                out.extend_from_slice(data);
            },
        }
    }
}

/// Split off one substructure whose length is at octets 2 and 3.
fn split_substructure(data: &[u8]) -> Result<(&[u8], &[u8])> {
    if data.len() < 4 {
        return Err(Error::Truncated);
    }
    let len = NetworkEndian::read_u16(&data[2..4]) as usize;
    if len < 4 {
        return Err(Error::Malformed);
    }
    if data.len() < len {
        return Err(Error::Truncated);
    }
    Ok(data.split_at(len))
}

/// Decode a chain of payloads starting with a payload of type `first`.
///
/// The chain ends at a `None` next payload or at an encrypted payload, whose next payload field
/// instead announces the first payload inside it.
pub fn parse_chain(first: PayloadType, mut data: &[u8]) -> Result<Vec<Payload>> {
    let mut payloads = Vec::new();
    let mut kind = first;

    while kind != PayloadType::None {
        if data.len() < 4 {
            return Err(Error::Truncated);
        }
        let next = PayloadType::from(data[0]);
        let critical = data[1] & 0x80 != 0;
        let len = NetworkEndian::read_u16(&data[2..4]) as usize;
        if len < 4 {
            return Err(Error::Malformed);
        }
        let body = data.get(4..len).ok_or(Error::Truncated)?;

        if kind == PayloadType::Encrypted {
            payloads.push(Payload::Encrypted { first: next, data: body.to_vec() });
            data = &data[len..];
            break;
        }

        payloads.push(Payload::parse(kind, critical, body)?);
        data = &data[len..];
        kind = next;
    }

    if !data.is_empty() {
        return Err(Error::Malformed);
    }
    Ok(payloads)
}

/// Encode a chain of payloads, returning the type of the first one.
pub fn emit_chain(payloads: &[Payload]) -> (PayloadType, Vec<u8>) {
    let mut out = Vec::new();
    for (i, payload) in payloads.iter().enumerate() {
        let next = match payload {
            Payload::Encrypted { first, .. } => *first,
            _ => payloads.get(i + 1).map(Payload::kind).unwrap_or(PayloadType::None),
        };
        let start = out.len();
        out.extend_from_slice(&[next.into(), 0, 0, 0]);
        payload.emit_body(&mut out);
        let len = (out.len() - start) as u16;
        NetworkEndian::write_u16(&mut out[start + 2..start + 4], len);
    }
    let first = payloads.first().map(Payload::kind).unwrap_or(PayloadType::None);
    (first, out)
}

#[cfg(test)]
mod test {
    use super::*;

    fn ike_proposal() -> Proposal {
        Proposal {
            number: 1,
            protocol: ProtocolId::Ike,
            spi: Vec::new(),
            transforms: vec![
                Transform::with_key_length(TransformType::Encryption, 12, 128),
                Transform::new(TransformType::Prf, 2),
                Transform::new(TransformType::Integrity, 2),
                Transform::new(TransformType::DiffieHellman, 2),
            ],
        }
    }

    #[test]
    fn proposal_layout() {
        let (first, bytes) = emit_chain(&[Payload::SecurityAssociation(vec![ike_proposal()])]);
        assert_eq!(first, PayloadType::SecurityAssociation);
        // Generic header, proposal header, one transform with attribute and three without.
        assert_eq!(bytes.len(), 4 + 8 + 12 + 3 * 8);
        assert_eq!(&bytes[4..12], &[0, 0, 0, 44, 1, 1, 0, 4]);
        // The key length attribute of the first transform.
        assert_eq!(&bytes[20..24], &[0x80, 0x0e, 0, 128]);
        // Only the final transform is marked last.
        assert_eq!(bytes[12], 3);
        assert_eq!(bytes[12 + 12 + 16], 0);
    }

    #[test]
    fn chain_with_sa_ke_nonce() {
        let payloads = vec![
            Payload::SecurityAssociation(vec![ike_proposal(), Proposal { number: 2, ..ike_proposal() }]),
            Payload::KeyExchange { group: 2, data: vec![0xaa; 128] },
            Payload::Nonce(vec![0x55; 16]),
            Payload::Notify(Notify::new(NotifyType::UseTransportMode)),
        ];
        let (first, bytes) = emit_chain(&payloads);
        let parsed = parse_chain(first, &bytes).unwrap();
        assert_eq!(parsed, payloads);
    }

    #[test]
    fn chain_ends_at_encrypted() {
        let payloads = vec![
            Payload::Encrypted { first: PayloadType::IdInitiator, data: vec![1, 2, 3, 4] },
        ];
        let (first, bytes) = emit_chain(&payloads);
        assert_eq!(first, PayloadType::Encrypted);
        assert_eq!(bytes[0], 35);
        assert_eq!(parse_chain(first, &bytes).unwrap(), payloads);
    }

    #[test]
    fn delete_and_selectors() {
        let payloads = vec![
            Payload::Delete(Delete {
                protocol: ProtocolId::Esp,
                spis: vec![vec![0, 0, 1, 0], vec![0, 0, 2, 0]],
            }),
            Payload::TsInitiator(vec![TrafficSelector::host(Address::new(10, 0, 0, 1))]),
            Payload::TsResponder(vec![TrafficSelector::host(Address::new(10, 0, 0, 2))]),
        ];
        let (first, bytes) = emit_chain(&payloads);
        assert_eq!(parse_chain(first, &bytes).unwrap(), payloads);
    }

    #[test]
    fn unknown_payloads() {
        // A vendor id, not critical, followed by nothing.
        let bytes = [0, 0, 0, 6, 0xca, 0xfe];
        let parsed = parse_chain(PayloadType::VendorId, &bytes).unwrap();
        assert_eq!(parsed, vec![Payload::Unknown { kind: 43, data: vec![0xca, 0xfe] }]);

        let critical = [0, 0x80, 0, 6, 0xca, 0xfe];
        assert_eq!(parse_chain(PayloadType::VendorId, &critical), Err(Error::Unsupported));
    }

    #[test]
    fn truncated_chain() {
        let bytes = [0, 0, 0, 20, 1, 2];
        assert_eq!(parse_chain(PayloadType::Nonce, &bytes), Err(Error::Truncated));
        let trailing = [0, 0, 0, 5, 1, 9];
        assert_eq!(parse_chain(PayloadType::Nonce, &trailing), Err(Error::Malformed));
    }
}
