//! The IKEv2 message format of RFC 7296.
//!
//! A message is a fixed 28 octet header followed by a chain of generic payloads, each naming the
//! type of its successor. The header is accessed in place through [`Packet`] while the payload
//! chain is decoded into owned [`Payload`] values, since the exchange logic rebuilds and
//! re-encrypts chains rather than editing them.
//!
//! [`Packet`]: struct.Packet.html
//! [`Payload`]: payload/enum.Payload.html
use core::fmt;
use byteorder::{ByteOrder, NetworkEndian};

use super::{Error, Result};

pub mod payload;

pub use self::payload::{
    Delete,
    Identification,
    IdType,
    Notify,
    NotifyType,
    Payload,
    PayloadType,
    Proposal,
    ProtocolId,
    TrafficSelector,
    Transform,
    TransformType,
};

/// The UDP port of IKE on both ends.
pub const PORT: u16 = 500;

/// Major version 2, minor version 0.
pub const VERSION: u8 = 0x20;

/// Length of the fixed message header.
pub const HEADER_LEN: usize = field::LENGTH.end;

enum_with_unknown! {
    /// The exchange type in the message header.
    pub doc enum ExchangeType(u8) {
        /// The first exchange, negotiating the IKE SA and performing Diffie-Hellman.
        IkeSaInit = 34,
        /// The second exchange, authenticating both ends and creating the first Child SA.
        IkeAuth = 35,
        /// Creation or rekeying of a Child SA.
        CreateChildSa = 36,
        /// Notifications, deletion and liveness checks.
        Informational = 37,
        /// The informational code of IKEv1, still sent by some peers.
        LegacyInformational = 5
    }
}

impl ExchangeType {
    /// Both informational codes are handled the same way.
    pub fn is_informational(self) -> bool {
        match self {
            ExchangeType::Informational | ExchangeType::LegacyInformational => true,
            _ => false,
        }
    }
}

/// The flags octet of the message header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Flags(pub u8);

mod field {
    use core::ops::Range;

    pub type Field = Range<usize>;

    pub const SPI_I:        Field = 0..8;
    pub const SPI_R:        Field = 8..16;
    pub const NEXT_PAYLOAD: usize = 16;
    pub const VERSION:      usize = 17;
    pub const EXCHANGE:     usize = 18;
    pub const FLAGS:        usize = 19;
    pub const MESSAGE_ID:   Field = 20..24;
    pub const LENGTH:       Field = 24..28;

    pub const FLG_INITIATOR: u8 = 0x08;
    pub const FLG_VERSION:   u8 = 0x10;
    pub const FLG_RESPONSE:  u8 = 0x20;
}

impl Flags {
    /// Flags of a message sent by the original initiator of the IKE SA.
    pub fn new(initiator: bool, response: bool) -> Self {
        let mut flags = Flags(0);
        flags.set_initiator(initiator);
        flags.set_response(response);
        flags
    }

    /// The message was sent by the original initiator.
    pub fn initiator(self) -> bool {
        self.0 & field::FLG_INITIATOR != 0
    }

    /// The sender can speak a higher major version.
    pub fn version(self) -> bool {
        self.0 & field::FLG_VERSION != 0
    }

    /// The message is a response to a request with the same message id.
    pub fn response(self) -> bool {
        self.0 & field::FLG_RESPONSE != 0
    }

    pub fn set_initiator(&mut self, value: bool) {
        self.set(field::FLG_INITIATOR, value)
    }

    pub fn set_response(&mut self, value: bool) {
        self.set(field::FLG_RESPONSE, value)
    }

    fn set(&mut self, flag: u8, value: bool) {
        let flag_val = if value { flag } else { 0 };
        self.0 = (self.0 & !flag) | flag_val;
    }
}

/// A read/write wrapper around an IKE message buffer.
#[derive(Debug, PartialEq, Clone)]
pub struct Packet<T> {
    buffer: T,
}

impl<T: AsRef<[u8]>> Packet<T> {
    /// Imbue a raw octet buffer with IKE message structure.
    pub fn new_unchecked(buffer: T) -> Packet<T> {
        Packet { buffer }
    }

    /// Shorthand for a combination of [new_unchecked] and [check_len].
    ///
    /// [new_unchecked]: #method.new_unchecked
    /// [check_len]: #method.check_len
    pub fn new_checked(buffer: T) -> Result<Packet<T>> {
        let packet = Packet::new_unchecked(buffer);
        packet.check_len()?;
        Ok(packet)
    }

    /// Ensure that no accessor method will panic if called.
    ///
    /// Returns `Err(Error::Truncated)` if the buffer is shorter than the header or than the
    /// length the header claims, and `Err(Error::Malformed)` if the length field is shorter than
    /// the header itself.
    pub fn check_len(&self) -> Result<()> {
        let len = self.buffer.as_ref().len();
        if len < HEADER_LEN {
            return Err(Error::Truncated);
        }
        let length = self.length() as usize;
        if length < HEADER_LEN {
            Err(Error::Malformed)
        } else if len < length {
            Err(Error::Truncated)
        } else {
            Ok(())
        }
    }

    /// The initiator's SPI.
    pub fn spi_i(&self) -> u64 {
        NetworkEndian::read_u64(&self.buffer.as_ref()[field::SPI_I])
    }

    /// The responder's SPI, zero in the first request.
    pub fn spi_r(&self) -> u64 {
        NetworkEndian::read_u64(&self.buffer.as_ref()[field::SPI_R])
    }

    pub fn next_payload(&self) -> PayloadType {
        PayloadType::from(self.buffer.as_ref()[field::NEXT_PAYLOAD])
    }

    pub fn version(&self) -> u8 {
        self.buffer.as_ref()[field::VERSION]
    }

    pub fn exchange_type(&self) -> ExchangeType {
        ExchangeType::from(self.buffer.as_ref()[field::EXCHANGE])
    }

    pub fn flags(&self) -> Flags {
        Flags(self.buffer.as_ref()[field::FLAGS])
    }

    pub fn message_id(&self) -> u32 {
        NetworkEndian::read_u32(&self.buffer.as_ref()[field::MESSAGE_ID])
    }

    /// The length of the whole message, header included.
    pub fn length(&self) -> u32 {
        NetworkEndian::read_u32(&self.buffer.as_ref()[field::LENGTH])
    }

    /// The payload chain after the header.
    pub fn payload(&self) -> &[u8] {
        &self.buffer.as_ref()[HEADER_LEN..self.length() as usize]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    pub fn set_spi_i(&mut self, value: u64) {
        NetworkEndian::write_u64(&mut self.buffer.as_mut()[field::SPI_I], value)
    }

    pub fn set_spi_r(&mut self, value: u64) {
        NetworkEndian::write_u64(&mut self.buffer.as_mut()[field::SPI_R], value)
    }

    pub fn set_next_payload(&mut self, value: PayloadType) {
        self.buffer.as_mut()[field::NEXT_PAYLOAD] = value.into()
    }

    pub fn set_version(&mut self, value: u8) {
        self.buffer.as_mut()[field::VERSION] = value
    }

    pub fn set_exchange_type(&mut self, value: ExchangeType) {
        self.buffer.as_mut()[field::EXCHANGE] = value.into()
    }

    pub fn set_flags(&mut self, value: Flags) {
        self.buffer.as_mut()[field::FLAGS] = value.0
    }

    pub fn set_message_id(&mut self, value: u32) {
        NetworkEndian::write_u32(&mut self.buffer.as_mut()[field::MESSAGE_ID], value)
    }

    pub fn set_length(&mut self, value: u32) {
        NetworkEndian::write_u32(&mut self.buffer.as_mut()[field::LENGTH], value)
    }
}

/// A high-level representation of the IKE message header.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Header {
    pub spi_i: u64,
    pub spi_r: u64,
    pub next_payload: PayloadType,
    pub exchange_type: ExchangeType,
    pub flags: Flags,
    pub message_id: u32,
    pub length: u32,
}

impl Header {
    /// Parse the header of a checked packet.
    ///
    /// Messages of another major version are `Unrecognized`. IKEv1 datagrams arriving on the same
    /// port are rejected this way.
    pub fn parse<T: AsRef<[u8]>>(packet: &Packet<T>) -> Result<Header> {
        packet.check_len()?;
        if packet.version() >> 4 != VERSION >> 4 {
            return Err(Error::Unrecognized);
        }

        Ok(Header {
            spi_i: packet.spi_i(),
            spi_r: packet.spi_r(),
            next_payload: packet.next_payload(),
            exchange_type: packet.exchange_type(),
            flags: packet.flags(),
            message_id: packet.message_id(),
            length: packet.length(),
        })
    }

    pub fn emit<T: AsRef<[u8]> + AsMut<[u8]>>(&self, packet: &mut Packet<T>) {
        packet.set_spi_i(self.spi_i);
        packet.set_spi_r(self.spi_r);
        packet.set_next_payload(self.next_payload);
        packet.set_version(VERSION);
        packet.set_exchange_type(self.exchange_type);
        packet.set_flags(self.flags);
        packet.set_message_id(self.message_id);
        packet.set_length(self.length);
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "IKE {:016x}/{:016x} {:?} mid={} len={}",
            self.spi_i, self.spi_r, self.exchange_type, self.message_id, self.length)?;
        if self.flags.initiator() { write!(f, " I")? }
        if self.flags.response() { write!(f, " R")? }
        Ok(())
    }
}

/// A decoded message: the header and its payload chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub payloads: Vec<Payload>,
}

impl Message {
    /// Decode a whole message.
    ///
    /// An encrypted payload is kept opaque. It must be the last in the chain.
    pub fn parse(bytes: &[u8]) -> Result<Message> {
        let packet = Packet::new_checked(bytes)?;
        let header = Header::parse(&packet)?;
        let payloads = payload::parse_chain(header.next_payload, packet.payload())?;
        Ok(Message { header, payloads })
    }

    /// Encode the message, filling in the next payload and length fields.
    pub fn emit(&self) -> Vec<u8> {
        let (first, chain) = payload::emit_chain(&self.payloads);
        let mut bytes = vec![0; HEADER_LEN + chain.len()];
        bytes[HEADER_LEN..].copy_from_slice(&chain);
        let header = Header {
            next_payload: first,
            length: bytes.len() as u32,
            ..self.header
        };
        header.emit(&mut Packet::new_unchecked(&mut bytes[..]));
        bytes
    }

    /// Find the first payload matching the projection.
    pub fn find<'a, U, F>(&'a self, f: F) -> Option<U>
        where F: FnMut(&'a Payload) -> Option<U>
    {
        self.payloads.iter().filter_map(f).next()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn request(payloads: Vec<Payload>) -> Message {
        Message {
            header: Header {
                spi_i: 0x0102030405060708,
                spi_r: 0,
                next_payload: PayloadType::None,
                exchange_type: ExchangeType::IkeSaInit,
                flags: Flags::new(true, false),
                message_id: 0,
                length: 0,
            },
            payloads,
        }
    }

    #[test]
    fn header_fields() {
        let bytes = request(vec![Payload::Nonce(vec![7; 16])]).emit();
        assert_eq!(bytes.len(), HEADER_LEN + 4 + 16);

        let packet = Packet::new_checked(&bytes[..]).unwrap();
        let header = Header::parse(&packet).unwrap();
        assert_eq!(header.spi_i, 0x0102030405060708);
        assert_eq!(header.next_payload, PayloadType::Nonce);
        assert_eq!(header.exchange_type, ExchangeType::IkeSaInit);
        assert!(header.flags.initiator());
        assert!(!header.flags.response());
        assert_eq!(header.length as usize, bytes.len());
        assert_eq!(bytes[17], VERSION);
    }

    #[test]
    fn reject_ikev1() {
        let mut bytes = request(vec![]).emit();
        bytes[17] = 0x10;
        assert_eq!(Message::parse(&bytes), Err(Error::Unrecognized));
    }

    #[test]
    fn reject_short_length() {
        let mut bytes = request(vec![]).emit();
        bytes[27] = 12;
        assert_eq!(Message::parse(&bytes), Err(Error::Malformed));
        assert_eq!(Message::parse(&bytes[..20]), Err(Error::Truncated));
    }

    #[test]
    fn legacy_informational() {
        assert!(ExchangeType::from(5).is_informational());
        assert!(ExchangeType::from(37).is_informational());
        assert_eq!(ExchangeType::from(99), ExchangeType::Unknown(99));
    }
}
