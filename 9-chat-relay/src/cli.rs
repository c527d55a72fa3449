use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use clap::{Args, Parser, Subcommand};

use crate::{
    config::{DEFAULT_MAX_CLIENTS, DEFAULT_PORT, RelayConfig},
    frame::DEFAULT_MAX_FRAME_BYTES,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, accepting TCP connections and broadcasting their lines.
    Serve(ServeArgs),
    /// Connect to a relay and chat from the terminal.
    Send(SendArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address the relay listens on.
    #[arg(short, long)]
    pub address: IpAddr,

    /// Port the relay listens on. Use 0 for an ephemeral port.
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Maximum number of clients connected at the same time.
    #[arg(short, long = "size", default_value_t = DEFAULT_MAX_CLIENTS)]
    pub size: usize,

    /// How long a new client may take to send its username, in milliseconds.
    #[arg(long, default_value_t = 5_000)]
    pub handshake_timeout_ms: u64,

    /// Longest line accepted from a client, in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    pub max_frame_bytes: usize,
}

impl ServeArgs {
    pub fn config(&self) -> RelayConfig {
        RelayConfig {
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            max_frame_bytes: self.max_frame_bytes,
            ..RelayConfig::new(self.address, self.port, self.size)
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct SendArgs {
    /// Address of the relay to connect to.
    #[arg(short, long)]
    pub address: IpAddr,

    /// Port of the relay to connect to.
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Name shown to the other participants.
    #[arg(short, long)]
    pub username: String,
}

impl SendArgs {
    pub fn server(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}
