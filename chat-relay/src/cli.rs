use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay hub, accepting TCP connections.
    Serve(ServeArgs),
    /// Connect to a hub and chat from the terminal.
    Client(ClientArgs),
    /// Post the same message to a hub on a fixed interval.
    Ping(PingArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address to bind. Use port 0 for an ephemeral port.
    #[arg(long, default_value = crate::config::DEFAULT_ADDR)]
    pub listen: SocketAddr,

    /// Refuse connections beyond this many live clients.
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Messages buffered per client before new ones are dropped.
    #[arg(long, default_value_t = 64)]
    pub outbound_capacity: usize,

    /// Do not echo a message back to the client that sent it.
    #[arg(long)]
    pub no_self_delivery: bool,

    /// Time a new connection has to send its hello frame.
    #[arg(long, default_value_t = 5000)]
    pub handshake_timeout_ms: u64,

    /// Time a single write to a client may take before the client is dropped.
    #[arg(long, default_value_t = 5000)]
    pub write_timeout_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Display name; the hub assigns a guest name when omitted.
    #[arg(long)]
    pub identity: Option<String>,

    /// Address of the hub to connect to.
    #[arg(long, default_value = crate::config::DEFAULT_ADDR)]
    pub server: SocketAddr,

    /// First reconnect delay in milliseconds.
    #[arg(long, default_value_t = 500)]
    pub retry_initial_ms: u64,

    /// Upper bound for reconnect delays in milliseconds.
    #[arg(long, default_value_t = 5000)]
    pub retry_max_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct PingArgs {
    #[arg(long, default_value = "ping")]
    pub identity: String,

    #[arg(long, default_value = crate::config::DEFAULT_ADDR)]
    pub server: SocketAddr,

    #[arg(long, default_value = "Hello World!")]
    pub body: String,

    /// Delay between messages in milliseconds.
    #[arg(long, default_value_t = 1000)]
    pub interval_ms: u64,

    /// Stop after this many messages instead of running until ctrl-c.
    #[arg(long)]
    pub count: Option<u64>,
}
