//! The socket layer between asynchronous application tokens and the TCP engine.
//!
//! A [`Socket`] owns the byte queues of both directions and every outstanding token of one
//! endpoint. It does not know about sequence numbers or segments. The engine tells it when data
//! arrived, when data was acknowledged and when the connection changed state, and the socket turns
//! that into [`Completion`]s of the waiting tokens.
//!
//! Sockets and control blocks live in separate tables of the engine and refer to each other by
//! handle, see [`SocketHandle`].
//!
//! [`Socket`]: struct.Socket.html
//! [`Completion`]: struct.Completion.html
//! [`SocketHandle`]: struct.SocketHandle.html
use core::fmt;
use std::collections::VecDeque;

use crate::managed::Key;
use crate::tcp::TcbHandle;

mod buffer;
mod token;
#[cfg(test)]
mod tests;

pub use self::buffer::{RecvBuffer, SendBuffer, SOCK_BUFF_LOW_WATER, DEFAULT_BUFFER_SIZE};
pub use self::token::{
    Completion,
    CompletionKind,
    InFlight,
    ReceiveToken,
    RxData,
    TokenId,
    TransmitToken,
    TxData,
};

/// Status of a socket operation.
///
/// Returned synchronously by operations that fail admission and carried by completions of
/// tokens that could not be satisfied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Error {
    /// The socket was not configured yet.
    NotStarted,
    /// No local address is known for the socket.
    NoMapping,
    /// A table, the back-log or the port space is exhausted.
    OutOfResources,
    /// The operation is not allowed in the current state.
    AccessDenied,
    InvalidParameter,
    Unsupported,
    NotFound,
    /// The token was cancelled or its connection went away without a more specific error.
    Aborted,
    /// The peer closed its side and all data was read.
    ConnectionFin,
    ConnectionReset,
    ConnectionRefused,
    Timeout,
    NetworkUnreachable,
    HostUnreachable,
    ProtocolUnreachable,
    PortUnreachable,
    IcmpError,
    DeviceError,
}

pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            Error::NotStarted => "socket not configured",
            Error::NoMapping => "no address mapping",
            Error::OutOfResources => "out of resources",
            Error::AccessDenied => "access denied",
            Error::InvalidParameter => "invalid parameter",
            Error::Unsupported => "unsupported operation",
            Error::NotFound => "not found",
            Error::Aborted => "aborted",
            Error::ConnectionFin => "connection closed by peer",
            Error::ConnectionReset => "connection reset",
            Error::ConnectionRefused => "connection refused",
            Error::Timeout => "timed out",
            Error::NetworkUnreachable => "network unreachable",
            Error::HostUnreachable => "host unreachable",
            Error::ProtocolUnreachable => "protocol unreachable",
            Error::PortUnreachable => "port unreachable",
            Error::IcmpError => "icmp error",
            Error::DeviceError => "device error",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}

/// A handle to a socket in the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SocketHandle(pub(crate) Key);

impl fmt::Display for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "sock{}", self.0)
    }
}

/// How the socket was configured.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Configuration {
    Unconfigured,
    /// Will actively open a connection.
    Active,
    /// Listens for incoming connections.
    Passive,
    /// Configured but the address is not available yet.
    NoMapping,
}

/// The application-visible connection state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Listening,
    Connecting,
    Connected,
    Disconnecting,
}

/// One endpoint as seen by the application.
#[derive(Debug)]
pub struct Socket {
    pub(crate) configuration: Configuration,
    pub(crate) state: ConnectionState,
    pub(crate) snd_buffer: SendBuffer,
    pub(crate) rcv_buffer: RecvBuffer,
    pub(crate) error: Option<Error>,
    /// The listener this connection was accepted from, until it is handed out.
    pub(crate) parent: Option<SocketHandle>,
    /// Connections accepted from the network but not yet handed to the application.
    pub(crate) children: Vec<SocketHandle>,
    pub(crate) back_log: usize,
    pub(crate) listen_tokens: VecDeque<TokenId>,
    pub(crate) rcv_tokens: VecDeque<ReceiveToken>,
    pub(crate) snd_tokens: VecDeque<TransmitToken>,
    pub(crate) processing: VecDeque<InFlight>,
    pub(crate) connect_token: Option<TokenId>,
    pub(crate) close_token: Option<TokenId>,
    pub(crate) tcb: Option<TcbHandle>,
    /// The peer will not send more data.
    pub(crate) no_more_data: bool,
    pub(crate) in_destroy: bool,
}

impl Socket {
    pub(crate) fn new(back_log: usize, snd_size: usize, rcv_size: usize) -> Self {
        Socket {
            configuration: Configuration::Unconfigured,
            state: ConnectionState::Closed,
            snd_buffer: SendBuffer::new(snd_size),
            rcv_buffer: RecvBuffer::new(rcv_size),
            error: None,
            parent: None,
            children: Vec::new(),
            back_log,
            listen_tokens: VecDeque::new(),
            rcv_tokens: VecDeque::new(),
            snd_tokens: VecDeque::new(),
            processing: VecDeque::new(),
            connect_token: None,
            close_token: None,
            tcb: None,
            no_more_data: false,
            in_destroy: false,
        }
    }

    /// A connection spawned from a listener, sharing its buffer sizes.
    pub(crate) fn new_child(&self, parent: SocketHandle) -> Self {
        let mut child = Socket::new(
            0,
            self.snd_buffer.high_water(),
            self.rcv_buffer.high_water());
        child.configuration = Configuration::Active;
        child.state = ConnectionState::Connecting;
        child.parent = Some(parent);
        child
    }

    pub fn configuration(&self) -> Configuration {
        self.configuration
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn error(&self) -> Option<Error> {
        self.error
    }

    pub fn is_configured(&self) -> bool {
        match self.configuration {
            Configuration::Active | Configuration::Passive => true,
            _ => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Whether another child may be admitted under the back-log.
    pub fn can_admit_child(&self) -> bool {
        self.children.len() < self.back_log
    }

    /// Queued octets not yet read by the application.
    pub fn received_len(&self) -> usize {
        self.rcv_buffer.len()
    }

    /// Octets still queued for the peer, sent or not.
    pub fn unacked_len(&self) -> usize {
        self.snd_buffer.len()
    }

    /// Record an error if none is recorded yet.
    pub(crate) fn set_error(&mut self, error: Error) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// Try to satisfy one receive token from the receive buffer.
    ///
    /// Returns the delivered data, or the token itself if nothing can be delivered yet.
    pub(crate) fn process_receive_token(&mut self, token: ReceiveToken)
        -> core::result::Result<(TokenId, RxData), ReceiveToken>
    {
        let (count, urgent) = self.rcv_buffer.deliverable(token.capacity());
        if count == 0 {
            return Err(token);
        }

        let mut left = count;
        let mut fragments = Vec::with_capacity(token.fragments.len());
        for &len in &token.fragments {
            let step = len.min(left);
            let mut fragment = Vec::with_capacity(step);
            self.rcv_buffer.take(step, &mut fragment);
            fragments.push(fragment);
            left -= step;
        }

        Ok((token.id, RxData { fragments, urgent }))
    }

    /// Complete as many queued receive tokens as the buffer allows, in order.
    ///
    /// Returns the octets handed out.
    pub(crate) fn satisfy_receive_tokens(
        &mut self,
        me: SocketHandle,
        completions: &mut VecDeque<Completion>,
    ) -> usize {
        let mut delivered = 0;
        while let Some(token) = self.rcv_tokens.pop_front() {
            match self.process_receive_token(token) {
                Ok((id, data)) => {
                    delivered += data.len();
                    completions.push_back(Completion {
                        socket: me,
                        token: id,
                        status: Ok(()),
                        kind: CompletionKind::Receive(data),
                    });
                },
                Err(token) => {
                    self.rcv_tokens.push_front(token);
                    break;
                },
            }
        }

        if self.no_more_data && self.rcv_buffer.is_empty() {
            self.fail_receive_tokens(me, Error::ConnectionFin, completions);
        }

        delivered
    }

    /// Append received data tagged with its urgent octet count and wake receivers.
    pub(crate) fn append_received(
        &mut self,
        me: SocketHandle,
        data: Vec<u8>,
        urgent: usize,
        completions: &mut VecDeque<Completion>,
    ) {
        self.rcv_buffer.append(data, urgent);
        self.satisfy_receive_tokens(me, completions);
    }

    /// The peer sent its FIN, there will be no data beyond the buffer.
    pub(crate) fn set_no_more_data(&mut self, me: SocketHandle, completions: &mut VecDeque<Completion>) {
        self.no_more_data = true;
        if self.rcv_buffer.is_empty() {
            self.fail_receive_tokens(me, Error::ConnectionFin, completions);
        }
    }

    /// The peer acknowledged `count` octets from the head of the send buffer.
    ///
    /// Completes in-flight transmit tokens in order. A partially acknowledged token stays in
    /// flight with its remaining count reduced.
    pub(crate) fn data_acked(
        &mut self,
        me: SocketHandle,
        count: usize,
        completions: &mut VecDeque<Completion>,
    ) {
        self.snd_buffer.trim(count);

        let mut count = count;
        while count > 0 {
            let head = match self.processing.front_mut() {
                Some(head) => head,
                None => break,
            };
            if head.remaining <= count {
                count -= head.remaining;
                let done = *head;
                self.processing.pop_front();
                completions.push_back(Completion {
                    socket: me,
                    token: done.id,
                    status: Ok(()),
                    kind: CompletionKind::Transmit { len: done.len },
                });
            } else {
                head.remaining -= count;
                count = 0;
            }
        }
    }

    fn fail_receive_tokens(&mut self, me: SocketHandle, error: Error, completions: &mut VecDeque<Completion>) {
        for token in self.rcv_tokens.drain(..) {
            completions.push_back(Completion {
                socket: me,
                token: token.id,
                status: Err(error),
                kind: CompletionKind::Receive(RxData::default()),
            });
        }
    }

    /// Complete one queued transmit token and all after it with an error.
    pub(crate) fn fail_transmit_tokens(
        &mut self,
        me: SocketHandle,
        failed: TransmitToken,
        error: Error,
        completions: &mut VecDeque<Completion>,
    ) {
        let rest = self.snd_tokens.drain(..);
        for token in Some(failed).into_iter().chain(rest) {
            completions.push_back(Completion {
                socket: me,
                token: token.id,
                status: Err(error),
                kind: CompletionKind::Transmit { len: 0 },
            });
        }
    }

    /// Complete every token of the socket with its error, or `Aborted` if none was recorded.
    ///
    /// Each queue completes in order. Both buffers are emptied.
    pub(crate) fn flush(&mut self, me: SocketHandle, completions: &mut VecDeque<Completion>) {
        let error = self.error.unwrap_or(Error::Aborted);
        self.complete_all(me, error, completions);
        self.snd_buffer.clear();
        self.rcv_buffer.clear();
    }

    fn complete_all(&mut self, me: SocketHandle, error: Error, completions: &mut VecDeque<Completion>) {
        let mut complete = |token: TokenId, kind: CompletionKind| {
            completions.push_back(Completion {
                socket: me,
                token,
                status: Err(error),
                kind,
            });
        };

        if let Some(token) = self.connect_token.take() {
            complete(token, CompletionKind::Connect);
        }
        if let Some(token) = self.close_token.take() {
            complete(token, CompletionKind::Close);
        }
        for token in self.listen_tokens.drain(..) {
            complete(token, CompletionKind::Accept { child: None });
        }
        for token in self.rcv_tokens.drain(..) {
            complete(token.id, CompletionKind::Receive(RxData::default()));
        }
        for token in self.snd_tokens.drain(..) {
            complete(token.id, CompletionKind::Transmit { len: 0 });
        }
        for token in self.processing.drain(..) {
            complete(token.id, CompletionKind::Transmit { len: token.len - token.remaining });
        }
    }

    /// Complete every outstanding token with `Aborted`, leaving the buffers alone.
    pub(crate) fn cancel_all(&mut self, me: SocketHandle, completions: &mut VecDeque<Completion>) {
        self.complete_all(me, Error::Aborted, completions);
    }

    /// Cancel a single queued token.
    ///
    /// Tokens in flight cannot be cancelled individually since their data may already be on the
    /// wire.
    pub(crate) fn cancel_token(
        &mut self,
        me: SocketHandle,
        id: TokenId,
        completions: &mut VecDeque<Completion>,
    ) -> Result<()> {
        let kind = if self.connect_token == Some(id) {
            self.connect_token = None;
            CompletionKind::Connect
        } else if self.close_token == Some(id) {
            self.close_token = None;
            CompletionKind::Close
        } else if let Some(pos) = self.listen_tokens.iter().position(|t| *t == id) {
            self.listen_tokens.remove(pos);
            CompletionKind::Accept { child: None }
        } else if let Some(pos) = self.rcv_tokens.iter().position(|t| t.id == id) {
            self.rcv_tokens.remove(pos);
            CompletionKind::Receive(RxData::default())
        } else if let Some(pos) = self.snd_tokens.iter().position(|t| t.id == id) {
            self.snd_tokens.remove(pos);
            CompletionKind::Transmit { len: 0 }
        } else {
            return Err(Error::NotFound);
        };

        completions.push_back(Completion {
            socket: me,
            token: id,
            status: Err(Error::Aborted),
            kind,
        });
        Ok(())
    }
}
