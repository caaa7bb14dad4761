//! Runs the engines of `netcore` back to back in memory.
//!
//! Two instances of an engine are wired to each other through a vector of datagrams, one acting as
//! client and one as server. Nothing touches a real interface, time advances one timer tick per
//! round of delivery. Call examples:
//!
//! * `netcore-loop 10.0.0.1 10.0.0.2 tcp 5001 -n 100000 -l 1460 --drop 7`
//! * `netcore-loop 10.0.0.1 10.0.0.2 ike secret --children 3`
//!
//! Set `RUST_LOG=netcore=trace` to see every segment and message.
mod config;

use std::process;

use netcore::ike::{self, Engine, MemoryStore, SoftCrypto, Store, UdpTransport};
use netcore::socket::{self, CompletionKind, SocketHandle, TxData};
use netcore::tcp::{self, IpInstance, Stack};
use netcore::time::Instant;
use netcore::wire::{self, Ipv4Address, Ipv4Endpoint, Ipv4Subnet};
use tracing::{error, info, warn};

/// Give up on a transfer after this many ticks, ten simulated minutes.
const MAX_TICKS: u32 = 600 * tcp::TCP_TICK_HZ;

struct Wire {
    station: Ipv4Subnet,
    sent: Vec<(Ipv4Address, Ipv4Address, Vec<u8>)>,
}

impl tcp::Transport for Wire {
    fn send(&mut self, _: &IpInstance, src: Ipv4Address, dst: Ipv4Address, segment: &[u8])
        -> socket::Result<()>
    {
        self.sent.push((src, dst, segment.to_vec()));
        Ok(())
    }

    fn default_address(&self) -> Option<Ipv4Subnet> {
        Some(self.station)
    }
}

/// Delivers segments between two stacks, losing every n-th.
struct Link {
    drop_every: usize,
    count: usize,
    dropped: usize,
}

impl Link {
    fn pump(&mut self, a: &mut Stack<Wire>, b: &mut Stack<Wire>) {
        loop {
            let from_a = std::mem::replace(&mut a.transport_mut().sent, Vec::new());
            let from_b = std::mem::replace(&mut b.transport_mut().sent, Vec::new());
            if from_a.is_empty() && from_b.is_empty() {
                return;
            }
            for (src, dst, data) in from_a {
                if !self.lose() {
                    b.receive(src, dst, &data);
                }
            }
            for (src, dst, data) in from_b {
                if !self.lose() {
                    a.receive(src, dst, &data);
                }
            }
        }
    }

    fn lose(&mut self) -> bool {
        self.count += 1;
        let lost = self.drop_every != 0 && self.count % self.drop_every == 0;
        self.dropped += lost as usize;
        lost
    }
}

fn failed(what: &'static str) -> impl Fn(socket::Error) -> String {
    move |err| format!("{}: {}", what, err)
}

fn run_tcp(config: &config::Config, opts: &config::Tcp) -> Result<(), String> {
    let client = Ipv4Address::from(config.client);
    let server = Ipv4Address::from(config.server);
    let wire = |addr| Wire { station: Ipv4Subnet::new(addr, 24), sent: Vec::new() };
    let mut a = Stack::with_seed(wire(client), config.seed);
    let mut b = Stack::with_seed(wire(server), config.seed.wrapping_add(1));
    let mut link = Link { drop_every: opts.drop_every, count: 0, dropped: 0 };

    let listener = b.create_socket().map_err(failed("listener"))?;
    b.configure(listener, Some(tcp::Config::passive(Ipv4Subnet::new(server, 24), opts.port)))
        .map_err(failed("listen"))?;
    b.accept(listener).map_err(failed("accept"))?;

    let socket = a.create_socket().map_err(failed("socket"))?;
    let remote = Ipv4Endpoint::new(server, opts.port);
    a.configure(socket, Some(tcp::Config::active(Ipv4Subnet::new(client, 24), remote)))
        .map_err(failed("configure"))?;
    a.connect(socket).map_err(failed("connect"))?;
    info!(%remote, "connecting");

    let chunk = opts.buffer_bytes.max(1);
    let mut queued = 0;
    let mut received = 0;
    let mut child: Option<SocketHandle> = None;
    let (mut client_closed, mut server_closed) = (false, false);

    for tick in 0..MAX_TICKS {
        link.pump(&mut a, &mut b);

        let completions: Vec<_> = a.completions().collect();
        for completion in completions {
            if let Err(err) = completion.status {
                return Err(format!("client: {:?} failed: {}", completion.kind, err));
            }
            match completion.kind {
                CompletionKind::Connect | CompletionKind::Transmit { .. } if queued < opts.total_bytes => {
                    let len = chunk.min(opts.total_bytes - queued);
                    let data = (0..len).map(|i| (queued + i) as u8).collect::<Vec<u8>>();
                    a.transmit(socket, TxData::new(data)).map_err(failed("transmit"))?;
                    queued += len;
                },
                CompletionKind::Connect | CompletionKind::Transmit { .. } => {
                    a.close(socket, false).map_err(failed("close"))?;
                },
                CompletionKind::Close => client_closed = true,
                _ => {},
            }
        }

        let completions: Vec<_> = b.completions().collect();
        for completion in completions {
            match (completion.kind, completion.status) {
                (CompletionKind::Accept { child: Some(accepted) }, Ok(())) => {
                    info!(tick, "accepted");
                    child = Some(accepted);
                    b.receive_into(accepted, vec![chunk]).map_err(failed("receive"))?;
                },
                (CompletionKind::Receive(rx), Ok(())) => {
                    received += rx.len();
                    b.receive_into(completion.socket, vec![chunk]).map_err(failed("receive"))?;
                },
                (CompletionKind::Receive(_), Err(socket::Error::ConnectionFin)) => {
                    b.close(completion.socket, false).map_err(failed("close"))?;
                },
                (CompletionKind::Close, _) => server_closed = true,
                (kind, Err(err)) => return Err(format!("server: {:?} failed: {}", kind, err)),
                _ => {},
            }
        }

        if client_closed && server_closed {
            info!(tick, bytes = received, dropped = link.dropped, "transfer complete");
            if received != opts.total_bytes {
                return Err(format!("received {} of {} bytes", received, opts.total_bytes));
            }
            return Ok(());
        }

        a.on_tick();
        b.on_tick();
    }

    if let Some(child) = child {
        warn!(state = ?b.state(child), "server side still open");
    }
    Err(format!("no completion after {} ticks, {} bytes received", MAX_TICKS, received))
}

#[derive(Default)]
struct Udp {
    sent: Vec<(Ipv4Address, Vec<u8>)>,
}

impl UdpTransport for Udp {
    fn send(&mut self, src: Ipv4Address, _: Ipv4Address, datagram: &[u8]) -> ike::Result<()> {
        self.sent.push((src, datagram.to_vec()));
        Ok(())
    }
}

fn engine(local: Ipv4Address, peer: Ipv4Address, psk: &str, seed: u64) -> Result<Engine<Udp>, String> {
    let mut store = MemoryStore::new();
    let auth = ike::store::PeerAuth { psk: psk.as_bytes().to_vec() };
    store.set_peer(Ipv4Subnet::host(peer), Some(auth)).map_err(|err| err.to_string())?;
    Ok(Engine::new(ike::Config::new(local), Udp::default(), SoftCrypto::new(seed), store))
}

fn exchange(a: &mut Engine<Udp>, b: &mut Engine<Udp>) {
    loop {
        let from_a = std::mem::replace(&mut a.transport_mut().sent, Vec::new());
        let from_b = std::mem::replace(&mut b.transport_mut().sent, Vec::new());
        if from_a.is_empty() && from_b.is_empty() {
            return;
        }
        // Failures are logged by the engine.
        for (src, data) in from_a {
            let _ = b.receive(Ipv4Endpoint::new(src, wire::ike::PORT), &data);
        }
        for (src, data) in from_b {
            let _ = a.receive(Ipv4Endpoint::new(src, wire::ike::PORT), &data);
        }
    }
}

fn run_ike(config: &config::Config, opts: &config::Ike) -> Result<(), String> {
    let client = Ipv4Address::from(config.client);
    let server = Ipv4Address::from(config.server);
    let mut a = engine(client, server, &opts.psk, config.seed)?;
    let mut b = engine(server, client, &opts.psk, config.seed.wrapping_add(1))?;

    a.negotiate_sa(server).map_err(|err| err.to_string())?;
    exchange(&mut a, &mut b);
    if a.state(server) != Some(ike::State::Established) {
        return Err(format!("IKE SA not established, state {:?}", a.state(server)));
    }

    for _ in 1..opts.children {
        a.negotiate_child_sa(server, None).map_err(|err| err.to_string())?;
        exchange(&mut a, &mut b);
    }
    for (inbound, outbound) in a.child_spis(server) {
        info!(
            inbound = %format_args!("{:08x}", inbound),
            outbound = %format_args!("{:08x}", outbound),
            "child SA");
    }
    info!(client = a.store().sas().len(), server = b.store().sas().len(), "SAD records");

    a.delete_sa(server).map_err(|err| err.to_string())?;
    exchange(&mut a, &mut b);
    // Let unanswered requests run out.
    let retry = ike::RETRY_INTERVAL;
    for round in 1..=ike::MAX_RETRIES + 1 {
        let now = Instant::from_millis(0) + retry * round;
        a.on_tick(now);
        b.on_tick(now);
    }

    if a.state(server).is_some() || b.state(client).is_some() {
        return Err("IKE SA survived its deletion".into());
    }
    info!(client = a.store().sas().len(), server = b.store().sas().len(), "deleted");
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = config::Config::from_args();
    let result = match &config.mode {
        config::Mode::Tcp(tcp) => run_tcp(&config, tcp),
        config::Mode::Ike(ike) => run_ike(&config, ike),
    };

    if let Err(err) = result {
        error!("{}", err);
        process::exit(1);
    }
}
