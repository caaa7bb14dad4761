use core::fmt;

use crate::wire;

/// Errors of the key exchange.
///
/// Inbound messages failing with any of these are dropped. Only operations requested by the
/// caller report them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The message does not fit the state of its session.
    InvalidMessage(&'static str),
    /// A required payload is missing or has unusable content.
    InvalidPayload(&'static str),
    /// The major version in the header.
    UnsupportedVersion(u8),
    /// The exchange type in the header.
    UnsupportedExchangeType(u8),
    NoProposalChosen,
    AuthenticationFailed,
    /// No session or child for the address or SPI.
    SaNotFound,
    CryptoError(&'static str),
    /// The operation is not allowed in the current state of the session.
    InvalidState(&'static str),
    /// The request kind is recognized but not implemented, such as rekeying.
    Unsupported,
    /// The SPI space or a table is exhausted.
    OutOfResources,
    /// The UDP transport refused the datagram.
    Transport,
    /// The message could not be decoded.
    Wire(wire::Error),
}

pub type Result<T> = core::result::Result<T, Error>;

impl From<wire::Error> for Error {
    fn from(err: wire::Error) -> Self {
        Error::Wire(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::InvalidMessage(msg) => write!(f, "invalid IKE message: {}", msg),
            Error::InvalidPayload(msg) => write!(f, "invalid IKE payload: {}", msg),
            Error::UnsupportedVersion(v) => write!(f, "unsupported IKE version {:#04x}", v),
            Error::UnsupportedExchangeType(t) => write!(f, "unsupported exchange type {}", t),
            Error::NoProposalChosen => write!(f, "no acceptable proposal"),
            Error::AuthenticationFailed => write!(f, "authentication failed"),
            Error::SaNotFound => write!(f, "security association not found"),
            Error::CryptoError(msg) => write!(f, "cryptographic failure: {}", msg),
            Error::InvalidState(msg) => write!(f, "invalid state: {}", msg),
            Error::Unsupported => write!(f, "unsupported request"),
            Error::OutOfResources => write!(f, "out of resources"),
            Error::Transport => write!(f, "transport failure"),
            Error::Wire(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for Error {}
