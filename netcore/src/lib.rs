//! Portable protocol engines for user-space networking.
//!
//! ## Table of contents
//!
//! 1. [Design](#design)
//! 2. [The wire module](wire/index.html)
//! 3. [The socket layer](socket/index.html)
//! 4. [The TCP engine](tcp/index.html)
//! 5. [The IKEv2 engine](ike/index.html)
//! 6. Internals
//!    1. [The managed module](managed/index.html)
//!    2. [Time](time/index.html)
//!
//! ## Design
//!
//! Both engines are plain structs owned by the caller. They never spawn threads, never block and
//! never hold on to the caller's buffers: every entry point, an application operation, an inbound
//! datagram or a timer tick, runs to completion before it returns. Whatever happened in the
//! meantime is reported afterwards, as [`Completion`]s of the TCP socket layer and as outbound
//! datagrams handed to the transport traits the engines are generic over.
//!
//! The layer below each engine is a narrow trait. [`tcp::Transport`] sends IP datagrams and is
//! asked for routes and the MTU, [`ike::UdpTransport`] sends UDP datagrams to port 500. Inbound
//! traffic is pushed in by the caller with [`tcp::Stack::receive`] and [`ike::Engine::receive`].
//! This keeps both engines testable without any interface, the test suites wire two instances
//! back to back in memory.
//!
//! Internally the engines keep their objects in tables keyed by generational handles and let
//! objects refer to each other only by handle. See the [`managed`] module for the table and
//! [`tcp`] for how sockets and control blocks reference each other.
//!
//! [`Completion`]: socket/struct.Completion.html
//! [`tcp::Transport`]: tcp/trait.Transport.html
//! [`ike::UdpTransport`]: ike/trait.UdpTransport.html
//! [`tcp::Stack::receive`]: tcp/struct.Stack.html#method.receive
//! [`ike::Engine::receive`]: ike/struct.Engine.html#method.receive
//! [`managed`]: managed/index.html
//! [`tcp`]: tcp/index.html
#![warn(unreachable_pub)]

#[macro_use] mod macros;
pub mod ike;
pub mod managed;
pub mod socket;
pub mod tcp;
pub mod time;
pub mod wire;
