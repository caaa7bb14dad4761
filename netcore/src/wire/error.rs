use core::fmt;

/// The error type for parsing of wire formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// An incoming packet could not be parsed because it was shorter than assumed.
    ///
    /// The packet may be shorter than the minimum length specified, or a length field may claim
    /// more data than actually follows. For chained IKE payloads this is also the case when a
    /// generic payload header points beyond the message.
    Truncated,

    /// An incoming packet had an incorrect checksum and was dropped.
    ///
    /// For IKE messages this is reported when the integrity check value of an encrypted payload
    /// does not match.
    WrongChecksum,

    /// An incoming packet could not be recognized and was dropped.
    ///
    /// E.g. an IKE message with a major version other than 2.
    Unrecognized,

    /// An incoming packet was recognized but was self-contradictory.
    ///
    /// Examples: a TCP option whose length field is shorter than its kind requires; a proposal
    /// whose transform count does not match its length.
    Malformed,

    /// Parsing depends on information derived from a non-implemented feature.
    ///
    /// Examples are critical IKE payloads of a type we do not handle.
    Unsupported,
}

/// The result type for wire codecs.
pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Truncated     => write!(f, "truncated packet"),
            Error::WrongChecksum => write!(f, "checksum error"),
            Error::Unrecognized  => write!(f, "unrecognized packet"),
            Error::Unsupported   => write!(f, "unsupported option"),
            Error::Malformed     => write!(f, "malformed packet"),
        }
    }
}

impl std::error::Error for Error {}
