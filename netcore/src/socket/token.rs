//! Outstanding asynchronous operations and their completions.
//!
//! A token is queued when its operation cannot finish immediately. Every token is completed
//! exactly once, either with the result of the operation or with the error that tore the
//! connection down. Tokens of the same class complete in the order they were queued.
use core::fmt;

use super::{Error, SocketHandle};

/// Identifies one outstanding operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TokenId(pub u64);

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "tok{}", self.0)
    }
}

/// Data handed to a transmit operation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxData {
    /// Fragments sent back to back.
    pub fragments: Vec<Vec<u8>>,
    /// Send the data without waiting for more.
    pub push: bool,
    /// Mark the data as urgent.
    pub urgent: bool,
}

impl TxData {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        TxData { fragments: vec![data.into()], push: false, urgent: false }
    }

    /// Total octets over all fragments.
    pub fn len(&self) -> usize {
        self.fragments.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Data delivered to a receive operation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RxData {
    /// One buffer per requested fragment, filled in order.
    pub fragments: Vec<Vec<u8>>,
    /// Whether the data was urgent.
    pub urgent: bool,
}

impl RxData {
    /// Total octets over all fragments.
    pub fn len(&self) -> usize {
        self.fragments.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All fragments concatenated.
    pub fn concat(&self) -> Vec<u8> {
        self.fragments.concat()
    }
}

/// A queued receive operation.
#[derive(Clone, Debug)]
pub struct ReceiveToken {
    pub id: TokenId,
    /// Requested lengths of the output fragments.
    pub fragments: Vec<usize>,
}

impl ReceiveToken {
    pub fn capacity(&self) -> usize {
        self.fragments.iter().sum()
    }
}

/// A queued transmit operation, not yet admitted to the send buffer.
#[derive(Clone, Debug)]
pub struct TransmitToken {
    pub id: TokenId,
    pub data: TxData,
}

/// A transmit operation whose data is in the send buffer but not yet acknowledged.
#[derive(Clone, Copy, Debug)]
pub struct InFlight {
    pub id: TokenId,
    /// Octets of this token still waiting for acknowledgement.
    pub remaining: usize,
    /// The original length, reported in the completion.
    pub len: usize,
}

/// What a completed token was for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompletionKind {
    Connect,
    /// A listen token, with the accepted connection on success.
    Accept { child: Option<SocketHandle> },
    Receive(RxData),
    Transmit { len: usize },
    Close,
}

/// The final signal of one token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub socket: SocketHandle,
    pub token: TokenId,
    pub status: Result<(), Error>,
    pub kind: CompletionKind,
}

impl Completion {
    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }
}
