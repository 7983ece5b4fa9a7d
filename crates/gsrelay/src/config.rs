use std::{net::Ipv4Addr, net::SocketAddr, path::PathBuf};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// Resolved runtime configuration. The binary fills this from the command
/// line; tests construct it directly.
#[derive(Clone, Debug)]
pub struct Config {
    pub role: Role,
    /// Rendezvous point consumed by the transport.
    pub rendezvous: SocketAddr,
    /// Listen port (client multi-session) or forward destination port
    /// (server fixed-TCP mode).
    pub port: u16,
    /// Server-side fixed destination address.
    pub dst_ip: Option<Ipv4Addr>,
    /// Server-side subprocess command.
    pub cmd: Option<String>,
    /// Interactive login shell / raw TTY on the client side.
    pub interactive: bool,
    /// Server-side SOCKS mode.
    pub socks: bool,
    /// Tear down on transport EOF instead of waiting for the reverse
    /// direction.
    pub receive_only: bool,
    pub multi_peer: bool,
    pub daemon: bool,
    pub quiet: bool,
    pub log_file: Option<PathBuf>,
}

impl Config {
    pub fn new(role: Role, rendezvous: SocketAddr) -> Self {
        Self {
            role,
            rendezvous,
            port: 0,
            dst_ip: None,
            cmd: None,
            interactive: false,
            socks: false,
            receive_only: false,
            multi_peer: false,
            daemon: false,
            quiet: false,
            log_file: None,
        }
    }

    pub fn server(rendezvous: SocketAddr) -> Self {
        Self::new(Role::Server, rendezvous)
    }

    pub fn client(rendezvous: SocketAddr) -> Self {
        Self::new(Role::Client, rendezvous)
    }
}
