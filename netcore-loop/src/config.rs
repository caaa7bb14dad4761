use structopt::StructOpt;
use std::net;

#[derive(Clone, StructOpt)]
pub enum Mode {
    /// Move bytes over one TCP connection and close it.
    #[structopt(name = "tcp")]
    Tcp(Tcp),

    /// Negotiate an IKE SA with Child SAs and delete it again.
    #[structopt(name = "ike")]
    Ike(Ike),
}

#[derive(Clone, StructOpt)]
pub struct Tcp {
    pub port: u16,
    #[structopt(short = "n", default_value = "65536")]
    pub total_bytes: usize,
    #[structopt(short = "l", default_value = "1460")]
    pub buffer_bytes: usize,
    /// Drop every n-th segment, zero drops none.
    #[structopt(long = "drop", default_value = "0")]
    pub drop_every: usize,
}

#[derive(Clone, StructOpt)]
pub struct Ike {
    pub psk: String,
    #[structopt(long = "children", default_value = "1")]
    pub children: usize,
}

#[derive(Clone, StructOpt)]
pub struct Config {
    pub client: net::Ipv4Addr,
    pub server: net::Ipv4Addr,
    #[structopt(long = "seed", default_value = "1")]
    pub seed: u64,

    #[structopt(subcommand)]
    pub mode: Mode,
}

impl Config {
    pub fn from_args() -> Self {
        StructOpt::from_args()
    }
}
