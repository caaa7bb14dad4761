/*! Low-level packet access and construction.

# An overview over packet representations

The `wire` module deals with the packet *representation* of the two protocols the engines speak.
It provides two levels of functionality.

 * First, it provides functions to extract fields from sequences of octets, and to insert fields
   into sequences of octets. This happens in the `Packet` wrappers, e.g. [`TcpPacket`] or
   [`IkePacket`].
 * Second, it provides a compact, high-level representation of header data that can be created
   from parsing and emitted into a sequence of octets. This happens through the `Repr` family of
   structs, e.g. [`TcpRepr`] or [`IkeHeader`]. The IKE payload chain is decoded into owned
   [`IkePayload`] values instead since its content is variable in length and nested.

[`TcpPacket`]: tcp/struct.Packet.html
[`IkePacket`]: ike/struct.Packet.html
[`TcpRepr`]: tcp/struct.Repr.html
[`IkeHeader`]: ike/struct.Header.html
[`IkePayload`]: ike/payload/enum.Payload.html

The `Packet` family guarantees that, if the `check_len()` method returned `Ok(())`, then no field
accessor or setter method will panic. When parsing untrusted input, it is *necessary* to use either
`new_checked` or `Repr::parse`. When emitting output, the buffer length is calculated by the `Repr`
struct.

In the `Repr` family of data structures, the `Repr::parse()` method never panics and the
`Repr::emit()` method never panics as long as the underlying buffer is exactly `Repr::buffer_len()`
octets long.

# Examples

To emit a TCP header into an octet buffer, and then parse it back:

```rust
use netcore::wire::{Ipv4Address, TcpChecksum, TcpFlags, TcpPacket, TcpRepr, TcpSeqNumber};
let repr = TcpRepr {
    src_port: 49152,
    dst_port: 80,
    flags: TcpFlags::SYN,
    seq_number: TcpSeqNumber(42),
    ack_number: None,
    window_len: 4096,
    urgent_at: 0,
    window_scale: Some(3),
    max_seg_size: Some(1460),
    timestamp: None,
    payload_len: 0,
};
let checksum = TcpChecksum::Manual {
    src_addr: Ipv4Address::new(10, 0, 0, 1),
    dst_addr: Ipv4Address::new(10, 0, 0, 2),
};
let mut buffer = vec![0; repr.buffer_len()];
repr.emit(&mut TcpPacket::new_unchecked(&mut buffer[..]), checksum);
let parsed = TcpRepr::parse(&TcpPacket::new_checked(&buffer[..]).unwrap(), checksum).unwrap();
assert_eq!(parsed, repr);
```
*/
mod error;
pub mod ike;
pub mod ipv4;
pub mod tcp;

pub use self::error::{Error, Result};

pub use self::ipv4::{
    Address as Ipv4Address,
    Endpoint as Ipv4Endpoint,
    Subnet as Ipv4Subnet,
};

pub use self::tcp::{
    Checksum as TcpChecksum,
    Flags as TcpFlags,
    Packet as TcpPacket,
    Repr as TcpRepr,
    SeqNumber as TcpSeqNumber,
    TcpOption,
};

pub use self::ike::{
    ExchangeType as IkeExchangeType,
    Header as IkeHeader,
    Message as IkeMessage,
    Packet as IkePacket,
    Payload as IkePayload,
};
