//! Requests from the socket layer to the protocol.
//!
//! Every operation the socket layer needs from TCP is one variant of [`Request`], handled by a
//! single match. Requests that create, configure or tear down a control block are handled on the
//! [`Stack`], everything else on the control block of the socket.
//!
//! [`Request`]: enum.Request.html
//! [`Stack`]: ../struct.Stack.html
use crate::socket::{self, Configuration, ConnectionState, SocketHandle};
use crate::wire::{Ipv4Address, Ipv4Endpoint, Ipv4Subnet, TcpSeqNumber};

use super::*;
use super::tcb::{Congestion, Control};

/// One operation requested from the protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Request {
    /// Create the control block of a new socket.
    Attach,
    /// Tear down and free the control block.
    Detach,
    /// Configure an unconfigured socket.
    Configure(Config),
    /// Drop the configuration and everything queued.
    Flush,
    /// Send whatever the send policy permits.
    SendData,
    /// Mark the end of the send buffer as urgent.
    SendUrgent,
    /// Push the end of the send buffer.
    SendPush,
    /// The application read from the receive buffer.
    Consumed,
    Connect,
    Close,
    Abort,
    Poll,
    Route(Route),
    Mode,
    Group(Group),
}

/// A route to add to or remove from the IP instance of a socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Route {
    pub subnet: Ipv4Subnet,
    pub gateway: Ipv4Address,
    pub delete: bool,
}

/// A multicast group to join or leave.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Group {
    pub address: Ipv4Address,
    pub join: bool,
}

/// A snapshot of the protocol state of one socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModeData {
    pub state: State,
    pub config: Option<Config>,
    pub local: Ipv4Endpoint,
    pub remote: Ipv4Endpoint,
    pub send_unacked: TcpSeqNumber,
    pub send_next: TcpSeqNumber,
    pub send_window: u32,
    pub send_mss: u32,
    pub receive_next: TcpSeqNumber,
    pub receive_window: u32,
    pub congestion: Congestion,
    pub congestion_window: u32,
    pub ssthresh: u32,
    /// Retransmission timeout in ticks.
    pub rto: u32,
}

/// The result of a successful request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Response {
    Done,
    Mode(ModeData),
}

impl<T: Transport> Stack<T> {
    /// Hand one request for `handle` to the protocol.
    pub fn dispatch(&mut self, handle: SocketHandle, request: Request) -> socket::Result<Response> {
        match request {
            Request::Attach => self.attach(handle),
            Request::Detach => self.detach(handle),
            Request::Configure(config) => self.configure_tcb(handle, Some(config)),
            Request::Flush => self.configure_tcb(handle, None),
            request => {
                let tcb = self.cx.sockets.get(handle.0)
                    .ok_or(socket::Error::NotFound)?
                    .tcb
                    .ok_or(socket::Error::NotStarted)?;
                let Stack { tcbs, cx } = self;
                let tcb = tcbs.get_mut(tcb.0).ok_or(socket::Error::NotStarted)?;
                let response = tcb.request(cx, request);
                self.reap();
                response
            },
        }
        .map_err(|err| {
            net_debug!("{:?}: {:?} failed: {}", handle, request, err);
            err
        })
    }

    fn attach(&mut self, handle: SocketHandle) -> socket::Result<Response> {
        let ip = Rc::clone(&self.cx.default_ip);
        let key = self.tcbs.insert_with(|key| Tcb::new(TcbHandle(key), handle, ip));
        match self.cx.sockets.get_mut(handle.0) {
            Some(socket) => {
                socket.tcb = Some(TcbHandle(key));
                Ok(Response::Done)
            },
            None => {
                self.tcbs.remove(key);
                Err(socket::Error::NotFound)
            },
        }
    }

    fn detach(&mut self, handle: SocketHandle) -> socket::Result<Response> {
        let tcb = self.cx.sockets.get_mut(handle.0)
            .ok_or(socket::Error::NotFound)?
            .tcb
            .take();
        if let Some(mut tcb) = tcb.and_then(|tcb| self.tcbs.remove(tcb.0)) {
            tcb.flush_pcb(&mut self.cx);
        }
        Ok(Response::Done)
    }

    /// Configure the control block, or reset it with `None`.
    ///
    /// Binds the local port and inserts the block into the table. A passive block starts to
    /// listen right away.
    fn configure_tcb(&mut self, handle: SocketHandle, config: Option<Config>) -> socket::Result<Response> {
        let tcb = self.cx.sockets.get(handle.0)
            .ok_or(socket::Error::NotFound)?
            .tcb
            .ok_or(socket::Error::NotStarted)?;
        let Stack { tcbs, cx } = self;
        let tcb = tcbs.get_mut(tcb.0).ok_or(socket::Error::NotStarted)?;

        let config = match config {
            Some(config) => config,
            None => {
                tcb.flush_pcb(cx);
                tcb.config = None;
                if let Some(socket) = cx.sockets.get_mut(handle.0) {
                    socket.configuration = Configuration::Unconfigured;
                    socket.error = None;
                    socket.no_more_data = false;
                }
                self.reap();
                return Ok(Response::Done);
            },
        };

        if config.active && (config.remote.addr.is_unspecified() || config.remote.port == 0) {
            return Err(socket::Error::InvalidParameter);
        }

        let station = match config.station.or_else(|| cx.transport.default_address()) {
            Some(station) => station,
            None => {
                if let Some(socket) = cx.sockets.get_mut(handle.0) {
                    socket.configuration = Configuration::NoMapping;
                }
                return Err(socket::Error::NoMapping);
            },
        };

        let ip = cx.ip_instance(station, config.ttl, config.tos);
        let rcv_mss = cx.transport.mtu(&ip).saturating_sub(HEADERS_LEN) as u32;
        tcb.configure(&config, ip, rcv_mss.max(TCP_MIN_MSS));
        tcb.local.port = cx.table.bind(tcb.local.addr, config.local_port)?;

        if let Some(socket) = cx.sockets.get_mut(handle.0) {
            let options = &config.options;
            socket.snd_buffer.set_high_water(options.send_buffer());
            socket.rcv_buffer.set_high_water(options.receive_buffer());
            socket.back_log = options.back_log();
            socket.error = None;
            socket.no_more_data = false;
            socket.configuration = if config.active {
                Configuration::Active
            } else {
                Configuration::Passive
            };
        }

        if !config.active {
            tcb.set_state(cx, State::Listen);
            if let Some(socket) = cx.sockets.get_mut(handle.0) {
                socket.state = ConnectionState::Listening;
            }
        }

        if !cx.table.insert(tcb.me, tcb.local, tcb.remote, !config.active) {
            net_debug!("{}: endpoint {} -> {} taken", tcb.me, tcb.local, tcb.remote);
            tcb.state = State::Closed;
            if let Some(socket) = cx.sockets.get_mut(handle.0) {
                socket.configuration = Configuration::Unconfigured;
                socket.state = ConnectionState::Closed;
            }
            return Err(socket::Error::AccessDenied);
        }

        net_debug!("{}: configured {} -> {}, {}", tcb.me, tcb.local, tcb.remote, tcb.state);
        Ok(Response::Done)
    }
}

impl Tcb {
    /// Handle a request that concerns only this connection.
    pub(crate) fn request<T: Transport>(&mut self, cx: &mut Context<T>, request: Request)
        -> socket::Result<Response>
    {
        match request {
            Request::SendData => {
                match self.state {
                    State::Closed | State::Listen => return Err(socket::Error::NotStarted),
                    state if state.local_closed() => return Err(socket::Error::AccessDenied),
                    _ => (),
                }
                if self.ctrl.contains(Control::FIN_SENT) {
                    return Err(socket::Error::AccessDenied);
                }
                self.to_send_data(cx, false);
            },
            // Both marks are derived from the current buffer length, which nothing changes
            // between the append of the data and this request.
            Request::SendUrgent => {
                let queued = self.queued_len(cx);
                if queued > 0 {
                    self.send.urgent = self.data_base() + (queued - 1);
                    self.ctrl.insert(Control::SND_URG);
                }
            },
            Request::SendPush => {
                let queued = self.queued_len(cx);
                self.send.push = self.data_base() + queued;
                self.ctrl.insert(Control::SND_PSH);
            },
            Request::Consumed => self.on_app_consumed(cx),
            Request::Connect => self.on_app_connect(cx)?,
            Request::Close => self.on_app_close(cx),
            Request::Abort => self.on_app_abort(cx),
            Request::Poll => cx.transport.poll(&self.ip)?,
            Request::Route(route) => cx.transport.route(&self.ip, &route)?,
            Request::Group(group) => cx.transport.group(&self.ip, &group)?,
            Request::Mode => return Ok(Response::Mode(self.mode_data())),
            Request::Attach | Request::Detach | Request::Configure(_) | Request::Flush => {
                return Err(socket::Error::InvalidParameter);
            },
        }
        Ok(Response::Done)
    }

    fn mode_data(&self) -> ModeData {
        ModeData {
            state: self.state,
            config: self.config,
            local: self.local,
            remote: self.remote,
            send_unacked: self.send.unacked,
            send_next: self.send.next,
            send_window: self.send.window,
            send_mss: self.send.mss,
            receive_next: self.recv.next,
            receive_window: self.recv.window,
            congestion: self.flow_control.state,
            congestion_window: self.flow_control.congestion_window,
            ssthresh: self.flow_control.ssthresh,
            rto: self.rtt.rto,
        }
    }
}
