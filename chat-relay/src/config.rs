use std::{net::SocketAddr, time::Duration};

use crate::{
    cli::{ClientArgs, PingArgs, ServeArgs},
    client::Backoff,
    hub::SelfDelivery,
};

pub const DEFAULT_ADDR: &str = "127.0.0.1:5095";

/// Server-side settings shared by every connection task.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub max_connections: Option<usize>,
    /// Bounded per-connection queue; messages beyond it are dropped.
    pub outbound_capacity: usize,
    pub self_delivery: SelfDelivery,
    pub handshake_timeout: Duration,
    /// Upper bound on one socket write; a client that stops reading is dropped.
    pub write_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections: None,
            outbound_capacity: 64,
            self_delivery: SelfDelivery::Include,
            handshake_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&ServeArgs> for HubConfig {
    fn from(args: &ServeArgs) -> Self {
        Self {
            max_connections: args.max_connections,
            outbound_capacity: args.outbound_capacity.max(1),
            self_delivery: if args.no_self_delivery {
                SelfDelivery::Exclude
            } else {
                SelfDelivery::Include
            },
            handshake_timeout: Duration::from_millis(args.handshake_timeout_ms),
            write_timeout: Duration::from_millis(args.write_timeout_ms),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: SocketAddr,
    pub identity: Option<String>,
    pub backoff: Backoff,
    pub ack_timeout: Duration,
}

impl ClientConfig {
    pub fn new(server: SocketAddr) -> Self {
        Self {
            server,
            identity: None,
            backoff: Backoff::default(),
            ack_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&ClientArgs> for ClientConfig {
    fn from(args: &ClientArgs) -> Self {
        Self {
            identity: args.identity.clone(),
            backoff: Backoff::new(
                Duration::from_millis(args.retry_initial_ms),
                Duration::from_millis(args.retry_max_ms),
            ),
            ..Self::new(args.server)
        }
    }
}

impl From<&PingArgs> for ClientConfig {
    fn from(args: &PingArgs) -> Self {
        Self {
            identity: Some(args.identity.clone()),
            ..Self::new(args.server)
        }
    }
}
