//! The operations offered to applications and the socket side of state changes.
//!
//! Each operation either fails admission synchronously or returns the [`TokenId`] whose
//! [`Completion`] reports the outcome later. A token is never completed twice and never dropped:
//! teardown completes whatever is still queued with the socket's error.
//!
//! [`TokenId`]: ../socket/struct.TokenId.html
//! [`Completion`]: ../socket/struct.Completion.html
use crate::socket::{
    self,
    Completion,
    CompletionKind,
    Configuration,
    ConnectionState,
    InFlight,
    ReceiveToken,
    Socket,
    SocketHandle,
    TokenId,
    TransmitToken,
    TxData,
};

use super::*;
use super::timer::Timer;

impl<T: Transport> Stack<T> {
    /// Create an unconfigured socket.
    pub fn create_socket(&mut self) -> socket::Result<SocketHandle> {
        let socket = Socket::new(TCP_BACKLOG, TCP_BUF_SIZE, TCP_BUF_SIZE);
        let handle = SocketHandle(self.cx.sockets.insert(socket));
        if let Err(err) = self.dispatch(handle, Request::Attach) {
            self.cx.sockets.remove(handle.0);
            return Err(err);
        }
        Ok(handle)
    }

    /// Destroy a socket, aborting its connection.
    ///
    /// Outstanding tokens complete with the socket's error, or `Aborted`. Connections of a
    /// listener that were not accepted yet are destroyed with it.
    pub fn destroy_socket(&mut self, handle: SocketHandle) -> socket::Result<()> {
        let socket = self.cx.sockets.get_mut(handle.0).ok_or(socket::Error::NotFound)?;
        if socket.in_destroy {
            return Ok(());
        }
        socket.in_destroy = true;

        self.dispatch(handle, Request::Detach)?;

        let socket = match self.cx.sockets.remove(handle.0) {
            Some(socket) => socket,
            None => return Ok(()),
        };
        if let Some(parent) = socket.parent {
            if let Some(parent) = self.cx.sockets.get_mut(parent.0) {
                parent.children.retain(|child| *child != handle);
            }
        }
        for child in socket.children {
            let _ = self.destroy_socket(child);
        }
        self.reap();
        Ok(())
    }

    /// Configure a socket, or return it to the unconfigured state with `None`.
    pub fn configure(&mut self, handle: SocketHandle, config: Option<Config>) -> socket::Result<()> {
        let socket = self.cx.sockets.get(handle.0).ok_or(socket::Error::NotFound)?;
        match config {
            None => self.dispatch(handle, Request::Flush)?,
            Some(_) if socket.is_configured() => return Err(socket::Error::AccessDenied),
            Some(config) => self.dispatch(handle, Request::Configure(config))?,
        };
        Ok(())
    }

    /// Open the connection of an actively configured socket.
    pub fn connect(&mut self, handle: SocketHandle) -> socket::Result<TokenId> {
        let socket = self.cx.sockets.get(handle.0).ok_or(socket::Error::NotFound)?;
        match socket.configuration {
            Configuration::NoMapping => return Err(socket::Error::NoMapping),
            Configuration::Unconfigured => return Err(socket::Error::NotStarted),
            Configuration::Passive => return Err(socket::Error::AccessDenied),
            Configuration::Active => (),
        }
        let inserted = socket.tcb.map_or(false, |tcb| self.cx.table.contains(tcb));
        if socket.state != ConnectionState::Closed || socket.connect_token.is_some() || !inserted {
            return Err(socket::Error::AccessDenied);
        }

        let id = self.cx.token();
        let socket = self.socket_mut(handle)?;
        socket.connect_token = Some(id);
        socket.state = ConnectionState::Connecting;
        if let Err(err) = self.dispatch(handle, Request::Connect) {
            if let Some(socket) = self.cx.sockets.get_mut(handle.0) {
                socket.connect_token = None;
                socket.state = ConnectionState::Closed;
            }
            return Err(err);
        }
        Ok(id)
    }

    /// Wait for a connection on a listening socket.
    ///
    /// A connection that completed its handshake before is handed out right away.
    pub fn accept(&mut self, handle: SocketHandle) -> socket::Result<TokenId> {
        let socket = self.cx.sockets.get(handle.0).ok_or(socket::Error::NotFound)?;
        match socket.configuration {
            Configuration::NoMapping => return Err(socket::Error::NoMapping),
            Configuration::Unconfigured => return Err(socket::Error::NotStarted),
            Configuration::Active => return Err(socket::Error::AccessDenied),
            Configuration::Passive => (),
        }
        if socket.state != ConnectionState::Listening {
            return Err(socket::Error::AccessDenied);
        }

        let sockets = &self.cx.sockets;
        let ready = socket.children.iter()
            .cloned()
            .find(|child| sockets.get(child.0).map_or(false, Socket::is_connected));

        let id = self.cx.token();
        match ready {
            Some(child) => {
                if let Some(socket) = self.cx.sockets.get_mut(handle.0) {
                    socket.children.retain(|other| *other != child);
                }
                if let Some(child) = self.cx.sockets.get_mut(child.0) {
                    child.parent = None;
                }
                self.cx.completions.push_back(Completion {
                    socket: handle,
                    token: id,
                    status: Ok(()),
                    kind: CompletionKind::Accept { child: Some(child) },
                });
            },
            None => if let Some(socket) = self.cx.sockets.get_mut(handle.0) {
                socket.listen_tokens.push_back(id);
            },
        }
        Ok(id)
    }

    /// Queue data for transmission.
    ///
    /// The token completes once the peer acknowledged all of its data.
    pub fn transmit(&mut self, handle: SocketHandle, data: TxData) -> socket::Result<TokenId> {
        if data.is_empty() {
            return Err(socket::Error::InvalidParameter);
        }

        check_open(self.cx.sockets.get(handle.0).ok_or(socket::Error::NotFound)?)?;

        let id = self.cx.token();
        let socket = self.socket_mut(handle)?;
        socket.snd_tokens.push_back(TransmitToken { id, data });
        if socket.is_connected() {
            self.with_tcb(handle, |tcb, cx| tcb.process_send_tokens(cx));
        }
        Ok(id)
    }

    /// Read received data into buffers of the given fragment lengths.
    pub fn receive_into(&mut self, handle: SocketHandle, fragments: Vec<usize>) -> socket::Result<TokenId> {
        if fragments.iter().sum::<usize>() == 0 {
            return Err(socket::Error::InvalidParameter);
        }
        check_open(self.cx.sockets.get(handle.0).ok_or(socket::Error::NotFound)?)?;

        let id = self.cx.token();
        let token = ReceiveToken { id, fragments };
        let socket = self.cx.sockets.get_mut(handle.0).ok_or(socket::Error::NotFound)?;
        if !socket.rcv_buffer.is_empty() {
            let completion = match socket.process_receive_token(token) {
                Ok((id, data)) => Completion {
                    socket: handle,
                    token: id,
                    status: Ok(()),
                    kind: CompletionKind::Receive(data),
                },
                Err(token) => {
                    socket.rcv_tokens.push_back(token);
                    return Ok(id);
                },
            };
            self.cx.completions.push_back(completion);
            self.dispatch(handle, Request::Consumed)?;
            return Ok(id);
        }

        if socket.no_more_data {
            return Err(socket::Error::ConnectionFin);
        }

        if let Some(error) = socket.error.take() {
            self.cx.completions.push_back(Completion {
                socket: handle,
                token: id,
                status: Err(error),
                kind: CompletionKind::Receive(Default::default()),
            });
            return Ok(id);
        }

        socket.rcv_tokens.push_back(token);
        Ok(id)
    }

    /// Close the connection gracefully, or abort it with a reset.
    pub fn close(&mut self, handle: SocketHandle, abort: bool) -> socket::Result<TokenId> {
        self.configured(handle)?;
        let socket = self.cx.sockets.get(handle.0).ok_or(socket::Error::NotFound)?;
        if socket.state == ConnectionState::Disconnecting || socket.close_token.is_some() {
            return Err(socket::Error::AccessDenied);
        }

        let id = self.cx.token();
        let socket = self.socket_mut(handle)?;
        socket.close_token = Some(id);
        socket.state = ConnectionState::Disconnecting;
        let request = if abort { Request::Abort } else { Request::Close };
        self.dispatch(handle, request)?;
        Ok(id)
    }

    /// Cancel one queued token, or every token of the socket with `None`.
    ///
    /// Cancelled tokens complete with `Aborted`. Transmissions already in flight can only be
    /// cancelled together with everything else.
    pub fn cancel(&mut self, handle: SocketHandle, token: Option<TokenId>) -> socket::Result<()> {
        let Context { sockets, completions, .. } = &mut self.cx;
        let socket = sockets.get_mut(handle.0).ok_or(socket::Error::NotFound)?;
        match token {
            Some(id) => socket.cancel_token(handle, id, completions),
            None => {
                socket.cancel_all(handle, completions);
                Ok(())
            },
        }
    }

    /// Let the IP instance of the socket deliver pending datagrams.
    pub fn poll(&mut self, handle: SocketHandle) -> socket::Result<()> {
        self.dispatch(handle, Request::Poll).map(drop)
    }

    /// A snapshot of the socket's protocol state.
    pub fn mode(&mut self, handle: SocketHandle) -> socket::Result<ModeData> {
        match self.dispatch(handle, Request::Mode)? {
            Response::Mode(mode) => Ok(mode),
            Response::Done => Err(socket::Error::NotStarted),
        }
    }

    /// Add or delete a route of the socket's IP instance.
    pub fn routes(&mut self, handle: SocketHandle, route: Route) -> socket::Result<()> {
        self.configured(handle)?;
        self.dispatch(handle, Request::Route(route)).map(drop)
    }

    /// Join or leave a multicast group on the socket's IP instance.
    pub fn groups(&mut self, handle: SocketHandle, group: Group) -> socket::Result<()> {
        self.configured(handle)?;
        self.dispatch(handle, Request::Group(group)).map(drop)
    }

    /// Advance the timers of every connection by one tick.
    pub fn on_tick(&mut self) {
        self.cx.tick += 1;
        let handles: Vec<TcbHandle> = self.cx.table.handles().collect();
        for handle in handles {
            let Stack { tcbs, cx } = self;
            if let Some(tcb) = tcbs.get_mut(handle.0) {
                tcb.on_tick(cx);
            }
        }
        self.reap();
    }

    fn socket_mut(&mut self, handle: SocketHandle) -> socket::Result<&mut Socket> {
        self.cx.sockets.get_mut(handle.0).ok_or(socket::Error::NotFound)
    }

    fn configured(&self, handle: SocketHandle) -> socket::Result<()> {
        let socket = self.cx.sockets.get(handle.0).ok_or(socket::Error::NotFound)?;
        match socket.configuration {
            Configuration::NoMapping => Err(socket::Error::NoMapping),
            Configuration::Unconfigured => Err(socket::Error::NotStarted),
            _ => Ok(()),
        }
    }

    fn with_tcb(&mut self, handle: SocketHandle, f: impl FnOnce(&mut Tcb, &mut Context<T>)) {
        let tcb = match self.cx.sockets.get(handle.0).and_then(|socket| socket.tcb) {
            Some(tcb) => tcb,
            None => return,
        };
        let Stack { tcbs, cx } = self;
        if let Some(tcb) = tcbs.get_mut(tcb.0) {
            f(tcb, cx);
        }
        self.reap();
    }

    /// Destroy the child sockets whose connections ended.
    pub(crate) fn reap(&mut self) {
        while let Some(handle) = self.cx.doomed.pop() {
            net_debug!("reaping socket {:?}", handle);
            let _ = self.destroy_socket(handle);
        }
    }
}

/// Admission shared by data transfer in both directions.
fn check_open(socket: &Socket) -> socket::Result<()> {
    match socket.configuration {
        Configuration::NoMapping => return Err(socket::Error::NoMapping),
        Configuration::Unconfigured => return Err(socket::Error::NotStarted),
        _ => (),
    }
    match socket.state {
        ConnectionState::Connecting | ConnectionState::Connected => Ok(()),
        _ => Err(socket::Error::AccessDenied),
    }
}

impl Tcb {
    /// The connection reached `ESTABLISHED`.
    ///
    /// Wakes the connect token of an active open. A passive child is handed to the oldest listen
    /// token of its listener, or waits among the listener's children until accepted.
    pub(crate) fn established<T: Transport>(&mut self, cx: &mut Context<T>) {
        let me = self.socket;
        let parent = match cx.sockets.get_mut(me.0) {
            Some(socket) => {
                socket.state = ConnectionState::Connected;
                socket.parent
            },
            None => return,
        };

        match parent {
            None => {
                let token = cx.sockets.get_mut(me.0).and_then(|socket| socket.connect_token.take());
                if let Some(token) = token {
                    cx.completions.push_back(Completion {
                        socket: me,
                        token,
                        status: Ok(()),
                        kind: CompletionKind::Connect,
                    });
                }
                self.process_send_tokens(cx);
            },
            Some(parent) => {
                let listener = match cx.sockets.get_mut(parent.0) {
                    Some(listener) => listener,
                    None => return,
                };
                if let Some(token) = listener.listen_tokens.pop_front() {
                    listener.children.retain(|child| *child != me);
                    cx.completions.push_back(Completion {
                        socket: parent,
                        token,
                        status: Ok(()),
                        kind: CompletionKind::Accept { child: Some(me) },
                    });
                    if let Some(socket) = cx.sockets.get_mut(me.0) {
                        socket.parent = None;
                    }
                }
            },
        }
    }

    /// The connection reached `CLOSED`.
    ///
    /// Completes the close token, flushes the socket and removes the block from the table. An
    /// unaccepted child destroys its socket, a listener all of its unaccepted children.
    pub(crate) fn closed<T: Transport>(&mut self, cx: &mut Context<T>) {
        let me = self.socket;
        cx.table.remove(self.me);
        self.reassembly.clear();
        self.timers.clear_all();

        let socket = match cx.sockets.get_mut(me.0) {
            Some(socket) => socket,
            None => return,
        };

        if let Some(token) = socket.close_token.take() {
            cx.completions.push_back(Completion {
                socket: me,
                token,
                status: Ok(()),
                kind: CompletionKind::Close,
            });
        }
        socket.flush(me, &mut cx.completions);
        socket.state = ConnectionState::Closed;

        cx.doomed.extend(socket.children.iter().cloned());
        if socket.parent.is_some() && !socket.in_destroy {
            cx.doomed.push(me);
        }
    }

    /// Drop the connection without the state machine, as for detach and reconfiguration.
    pub(crate) fn flush_pcb<T: Transport>(&mut self, cx: &mut Context<T>) {
        match self.state {
            State::SynReceived
                | State::Established
                | State::FinWait1
                | State::FinWait2
                | State::CloseWait => self.reset_connection(cx),
            _ => (),
        }

        let me = self.socket;
        cx.table.remove(self.me);
        self.reassembly.clear();
        self.timers.clear_all();
        self.state = State::Closed;

        if let Some(socket) = cx.sockets.get_mut(me.0) {
            socket.flush(me, &mut cx.completions);
            socket.state = ConnectionState::Closed;
            cx.doomed.extend(socket.children.iter().cloned());
        }
    }

    /// Admit queued transmit tokens while the send buffer has room.
    ///
    /// Each admitted token moves its data to the send buffer and is in flight until
    /// acknowledged. A token that cannot be sent fails together with all tokens behind it.
    pub(crate) fn process_send_tokens<T: Transport>(&mut self, cx: &mut Context<T>) {
        let me = self.socket;
        loop {
            let (token, before) = match cx.sockets.get_mut(me.0) {
                Some(socket) => {
                    if socket.snd_buffer.free_space() < socket.snd_buffer.low_water() {
                        return;
                    }
                    let token = match socket.snd_tokens.pop_front() {
                        Some(token) => token,
                        None => return,
                    };
                    let before = socket.snd_buffer.len();
                    for fragment in &token.data.fragments {
                        socket.snd_buffer.append(fragment);
                    }
                    let len = token.data.len();
                    socket.processing.push_back(InFlight { id: token.id, remaining: len, len });
                    (token, before)
                },
                None => return,
            };

            let mut result = Ok(Response::Done);
            if token.data.urgent {
                result = self.request(cx, Request::SendUrgent);
            }
            if result.is_ok() && token.data.push {
                result = self.request(cx, Request::SendPush);
            }
            if result.is_ok() {
                result = self.request(cx, Request::SendData);
            }

            if let Err(err) = result {
                net_debug!("{}: transmit {} failed: {}", self.me, token.id, err);
                if let Some(socket) = cx.sockets.get_mut(me.0) {
                    socket.snd_buffer.truncate(before);
                    socket.processing.pop_back();
                    socket.fail_transmit_tokens(me, token, err, &mut cx.completions);
                }
                return;
            }
        }
    }

    /// Start an active open.
    pub(crate) fn on_app_connect<T: Transport>(&mut self, cx: &mut Context<T>) -> socket::Result<()> {
        if self.state != State::Closed {
            return Err(socket::Error::AccessDenied);
        }

        let iss = cx.isn.get_isn(self.local, self.remote, cx.tick);
        let rcv_buffer = self.rcv_buffer_size(cx);
        self.init_local(iss, rcv_buffer);
        self.set_state(cx, State::SynSent);
        let timeout = self.limits.connect_timeout;
        self.set_timer(Timer::Connect, cx.tick, timeout);
        self.to_send_data(cx, true);
        Ok(())
    }

    /// The application closed its side.
    ///
    /// Unread data turns the close into a reset.
    pub(crate) fn on_app_close<T: Transport>(&mut self, cx: &mut Context<T>) {
        let unread = cx.socket_of(self).map_or(false, |socket| !socket.rcv_buffer.is_empty());
        if unread || !self.reassembly.is_empty() {
            net_debug!("{}: unread data on close, resetting", self.me);
            self.reset_connection(cx);
            self.close(cx);
            return;
        }

        match self.state {
            State::Closed | State::Listen | State::SynSent => self.set_state(cx, State::Closed),
            State::SynReceived | State::Established => self.set_state(cx, State::FinWait1),
            State::CloseWait => self.set_state(cx, State::LastAck),
            _ => (),
        }
        self.to_send_data(cx, true);
    }

    /// The application aborted the connection.
    pub(crate) fn on_app_abort<T: Transport>(&mut self, cx: &mut Context<T>) {
        match self.state {
            State::SynReceived
                | State::Established
                | State::FinWait1
                | State::FinWait2
                | State::CloseWait => self.reset_connection(cx),
            _ => (),
        }
        self.close(cx);
    }

    /// The application read data, the window may have opened.
    pub(crate) fn on_app_consumed<T: Transport>(&mut self, cx: &mut Context<T>) {
        if self.state != State::Established {
            return;
        }

        let old = self.rcv_win_old();
        if self.rcv_win_now(cx) > old {
            if old < self.recv.mss {
                net_trace!("{}: window update for a closed window", self.me);
                self.send_ack(cx);
            } else if self.delayed_ack == 0 {
                self.delayed_ack = 1;
            }
        }
    }
}
