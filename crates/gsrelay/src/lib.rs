//! Peer-to-peer TCP relay over a rendezvous transport.
//!
//! One side binds the rendezvous point and listens; the other connects to
//! it. Paired endpoints then relay bytes between the transport and a local
//! data source: a spawned subprocess, an outbound TCP connection, a
//! SOCKS4/5-selected destination, or the operator's stdio. A
//! single-threaded readiness reactor drives any number of concurrent
//! sessions.

pub mod config;
pub mod daemon;
pub mod engine;
pub mod exec;
pub mod fdio;
pub mod peer;
pub mod relay;
pub mod stats;
pub mod tty;

pub use config::{Config, Role};
pub use relay::Relay;
