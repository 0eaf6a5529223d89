//! Real-time chat relay over TCP.
//!
//! A hub accepts client connections, tracks them in a connection registry
//! and fans every chat line out to all live connections on a best-effort,
//! at-most-once basis.
//!
//! - [`registry`] holds the set of live connections behind a short-held lock.
//! - [`hub`] validates inbound lines and pushes them onto each connection's
//!   bounded outbound queue, dropping rather than waiting on slow clients.
//! - [`server`] accepts TCP connections and runs one session task per client.
//! - [`client`] connects to a hub, matches acks to sends and reconnects with
//!   backoff through an explicit state machine.
//! - [`message`] defines the newline-delimited JSON protocol.
//! - [`cli`], [`config`] and [`terminal`] wire the pieces into the
//!   `chat_relay` binary.

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod hub;
pub mod message;
pub mod registry;
pub mod server;
pub mod terminal;
