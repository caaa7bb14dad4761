use core::fmt;
use core::str::FromStr;

/// A four-octet IPv4 address.
#[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default)]
pub struct Address(pub [u8; 4]);

impl Address {
    /// An unspecified address.
    ///
    /// In a listening endpoint it acts as the wildcard that matches any address.
    pub const UNSPECIFIED: Address = Address([0x00; 4]);

    /// The broadcast address.
    pub const BROADCAST: Address = Address([0xff; 4]);

    /// Construct an IPv4 address from parts.
    pub const fn new(a0: u8, a1: u8, a2: u8, a3: u8) -> Address {
        Address([a0, a1, a2, a3])
    }

    /// Construct an IPv4 address from a sequence of octets, in big-endian.
    ///
    /// # Panics
    /// The function panics if `data` is not four octets long.
    pub fn from_bytes(data: &[u8]) -> Address {
        let mut bytes = [0; 4];
        bytes.copy_from_slice(data);
        Address(bytes)
    }

    /// Return an IPv4 address as a sequence of octets, in big-endian.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Encode the address into a `u32` in network endian byte order.
    pub fn to_network_integer(self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    /// Decode a network endian `u32` into an address.
    pub fn from_network_integer(num: u32) -> Self {
        Address(num.to_be_bytes())
    }

    /// Query whether the address is an unicast address.
    pub fn is_unicast(&self) -> bool {
        !(self.is_broadcast() ||
          self.is_multicast() ||
          self.is_unspecified())
    }

    /// Query whether the address is the broadcast address.
    pub fn is_broadcast(&self) -> bool {
        self.0[0..4] == [255; 4]
    }

    /// Query whether the address is a multicast address.
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0xf0 == 224
    }

    /// Query whether the address falls into the "unspecified" range.
    pub fn is_unspecified(&self) -> bool {
        self.0[0] == 0
    }
}

impl From<std::net::Ipv4Addr> for Address {
    fn from(x: std::net::Ipv4Addr) -> Address {
        Address(x.octets())
    }
}

impl From<Address> for std::net::Ipv4Addr {
    fn from(Address(x): Address) -> std::net::Ipv4Addr {
        x.into()
    }
}

impl FromStr for Address {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<std::net::Ipv4Addr>().map(Address::from)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let bytes = self.0;
        write!(f, "{}.{}.{}.{}", bytes[0], bytes[1], bytes[2], bytes[3])
    }
}

/// An IPv4 address together with a prefix length.
///
/// Used for interface addresses, routing table entries and the address ranges of traffic
/// selectors. The host bits are kept, [`network`] masks them off.
///
/// [`network`]: #method.network
#[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default)]
pub struct Subnet {
    address: Address,
    prefix: u8,
}

impl Subnet {
    /// The subnet containing every address.
    pub const ANY: Subnet = Subnet { address: Address::UNSPECIFIED, prefix: 0 };

    /// Create a subnet from an address and prefix length.
    ///
    /// # Panics
    /// This function panics if the prefix length is larger than 32.
    pub fn new(address: Address, prefix: u8) -> Self {
        assert!(prefix <= 32);
        Subnet { address, prefix }
    }

    /// The subnet containing exactly one host.
    pub fn host(address: Address) -> Self {
        Subnet { address, prefix: 32 }
    }

    /// The address as given, host bits included.
    pub fn address(&self) -> Address {
        self.address
    }

    /// The address with the host bits masked off.
    pub fn network(&self) -> Address {
        let network = self.address.to_network_integer() & !self.host_mask();
        Address::from_network_integer(network)
    }

    fn host_mask(&self) -> u32 {
        (!0u32).checked_shr(self.prefix.into()).unwrap_or(0)
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix
    }

    /// The first and last address in the block.
    pub fn range(&self) -> (Address, Address) {
        let start = self.network();
        let end = start.to_network_integer() | self.host_mask();
        (start, Address::from_network_integer(end))
    }

    pub fn contains(&self, address: Address) -> bool {
        Subnet::new(address, self.prefix).network() == self.network()
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix)
    }
}

/// An address and port pair.
#[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default)]
pub struct Endpoint {
    pub addr: Address,
    pub port: u16,
}

impl Endpoint {
    pub const fn new(addr: Address, port: u16) -> Self {
        Endpoint { addr, port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

pub(crate) mod checksum {
    use byteorder::{ByteOrder, NetworkEndian};

    use super::Address;

    fn propagate_carries(word: u32) -> u16 {
        let sum = (word >> 16) + (word & 0xffff);
        ((sum >> 16) as u16) + (sum as u16)
    }

    /// Compute an RFC 1071 compliant checksum (without the final complement).
    pub(crate) fn data(mut data: &[u8]) -> u16 {
        let mut accum = 0;

        while data.len() >= 2 {
            accum += NetworkEndian::read_u16(data) as u32;
            data = &data[2..];
        }

        // Add the last remaining odd byte, if any.
        if let Some(&value) = data.first() {
            accum += (value as u32) << 8;
        }

        propagate_carries(accum)
    }

    /// Combine several RFC 1071 compliant checksums.
    pub(crate) fn combine(checksums: &[u16]) -> u16 {
        let mut accum: u32 = 0;
        for &word in checksums {
            accum += word as u32;
        }
        propagate_carries(accum)
    }

    /// Compute an IPv4 pseudo header checksum.
    pub(crate) fn pseudo_header(src_addr: Address, dst_addr: Address, protocol: u8, length: u32)
        -> u16
    {
        let mut proto_len = [0u8; 4];
        proto_len[1] = protocol;
        NetworkEndian::write_u16(&mut proto_len[2..4], length as u16);

        combine(&[
            data(src_addr.as_bytes()),
            data(dst_addr.as_bytes()),
            data(&proto_len[..])
        ])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn subnet_contains() {
        let net = Subnet::new(Address::new(192, 168, 1, 77), 24);
        assert_eq!(net.network(), Address::new(192, 168, 1, 0));
        assert_eq!(net.address(), Address::new(192, 168, 1, 77));
        assert!(net.contains(Address::new(192, 168, 1, 254)));
        assert!(!net.contains(Address::new(192, 168, 2, 1)));
        assert_eq!(net.range().1, Address::new(192, 168, 1, 255));
        assert!(Subnet::ANY.contains(Address::new(10, 0, 0, 1)));
    }

    #[test]
    fn checksum_rfc1071_example() {
        // The example of RFC 1071 section 3.
        let bytes = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(checksum::data(&bytes), 0xddf2);
    }

    #[test]
    fn parse_display() {
        let addr: Address = "10.0.0.1".parse().unwrap();
        assert_eq!(addr, Address::new(10, 0, 0, 1));
        assert_eq!(format!("{}", Endpoint::new(addr, 80)), "10.0.0.1:80");
    }
}
