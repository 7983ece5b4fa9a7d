//! Session records and the descriptor-indexed tables that own them.

use std::{
    net::Ipv4Addr,
    os::fd::{AsRawFd, OwnedFd, RawFd},
    process::Child,
};

use gsrelay_socks::SocksParser;
use gsrelay_transport::GsStream;
use gsrelay_utils::soft_assert;
use mio::net::TcpStream;
use thiserror::Error;

use crate::tty::EscapeWatcher;

/// Staging buffer size per direction.
pub const RELAY_BUF: usize = 32 * 1024;

#[derive(Debug, Error)]
#[error("descriptor table full")]
pub struct TableFull;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionKind {
    /// Operator stdin/stdout. At most one such session per process.
    Stdio,
    /// Forked command or shell on a socketpair.
    Subprocess,
    /// TCP on the local side: an outbound forward on the server, an
    /// accepted connection on the client.
    Network { socks: bool },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GsPhase {
    Connecting,
    Established,
}

/// What the session relays to on the local side. Owns the descriptor,
/// except for stdio which belongs to the process.
pub enum LocalEnd {
    /// Destination not chosen yet (SOCKS handshake or outbound connect
    /// still pending).
    Pending,
    Stdio,
    Socket(TcpStream),
    Child { fd: OwnedFd, child: Child },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocksState {
    Init,
    Connecting,
    Connected,
}

/// Destination sub-state. Non-SOCKS sessions are initialised directly to
/// `Connected` with their fixed destination.
pub struct SocksConn {
    pub state: SocksState,
    pub parser: Option<SocksParser>,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
    pub dst_hostname: String,
}

impl SocksConn {
    pub fn none() -> Self {
        Self {
            state: SocksState::Connected,
            parser: None,
            dst_ip: Ipv4Addr::UNSPECIFIED,
            dst_port: 0,
            dst_hostname: String::new(),
        }
    }

    pub fn fixed(ip: Ipv4Addr, port: u16) -> Self {
        Self {
            state: SocksState::Connected,
            parser: None,
            dst_ip: ip,
            dst_port: port,
            dst_hostname: ip.to_string(),
        }
    }

    pub fn server() -> Self {
        Self { parser: Some(SocksParser::new()), state: SocksState::Init, ..Self::none() }
    }
}

pub struct Session<G: GsStream> {
    pub gs: G,
    pub local: LocalEnd,
    pub fd_in: RawFd,
    pub fd_out: RawFd,
    pub id: u32,
    pub kind: SessionKind,
    pub gs_phase: GsPhase,
    pub is_fd_connected: bool,
    /// Outbound TCP connect in progress on the local side.
    pub local_connecting: bool,
    pub interactive: bool,
    pub receive_only: bool,
    /// This session switched the terminal to raw mode.
    pub tty_raw: bool,
    pub esc: EscapeWatcher,
    pub wbuf: Box<[u8; RELAY_BUF]>,
    pub wlen: usize,
    pub rbuf: Box<[u8; RELAY_BUF]>,
    pub rlen: usize,
    pub socks: SocksConn,
}

impl<G: GsStream> Session<G> {
    pub fn new(gs: G, id: u32) -> Self {
        Self {
            gs,
            local: LocalEnd::Pending,
            fd_in: -1,
            fd_out: -1,
            id,
            kind: SessionKind::Stdio,
            gs_phase: GsPhase::Established,
            is_fd_connected: false,
            local_connecting: false,
            interactive: false,
            receive_only: false,
            tty_raw: false,
            esc: EscapeWatcher::new(),
            wbuf: Box::new([0; RELAY_BUF]),
            wlen: 0,
            rbuf: Box::new([0; RELAY_BUF]),
            rlen: 0,
            socks: SocksConn::none(),
        }
    }

    pub fn gs_fd(&self) -> RawFd {
        self.gs.raw_fd()
    }

    pub fn attach_stdio(&mut self) {
        self.local = LocalEnd::Stdio;
        self.fd_in = libc::STDIN_FILENO;
        self.fd_out = libc::STDOUT_FILENO;
        self.kind = SessionKind::Stdio;
    }

    pub fn attach_socket(&mut self, stream: TcpStream, socks: bool) {
        let fd = stream.as_raw_fd();
        self.local = LocalEnd::Socket(stream);
        self.fd_in = fd;
        self.fd_out = fd;
        self.kind = SessionKind::Network { socks };
    }

    pub fn attach_child(&mut self, fd: OwnedFd, child: Child) {
        let raw = fd.as_raw_fd();
        self.local = LocalEnd::Child { fd, child };
        self.fd_in = raw;
        self.fd_out = raw;
        self.kind = SessionKind::Subprocess;
    }
}

/// Alive sessions, indexed by their rendezvous descriptor.
pub struct PeerTable<G: GsStream> {
    slots: Box<[Option<Box<Session<G>>>]>,
    count: usize,
}

impl<G: GsStream> PeerTable<G> {
    pub fn new(capacity: usize) -> Self {
        Self { slots: (0..capacity).map(|_| None).collect(), count: 0 }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Hands the session back when the slot cannot take it, so the caller
    /// can unwind its registrations before dropping the record.
    pub fn insert(
        &mut self,
        fd: RawFd,
        session: Box<Session<G>>,
    ) -> Result<(), Box<Session<G>>> {
        let Some(slot) = self.slots.get_mut(fd as usize) else {
            return Err(session);
        };
        if slot.is_some() {
            soft_assert!(false, "peer slot {fd} already occupied");
            return Err(session);
        }
        *slot = Some(session);
        self.count += 1;
        Ok(())
    }

    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut Session<G>> {
        self.slots.get_mut(fd as usize)?.as_deref_mut()
    }

    pub fn take(&mut self, fd: RawFd) -> Option<Box<Session<G>>> {
        let session = self.slots.get_mut(fd as usize)?.take()?;
        self.count -= 1;
        debug_assert_eq!(self.count, self.slots.iter().filter(|s| s.is_some()).count());
        Some(session)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Gs,
    Local,
}

#[derive(Clone, Copy, Debug)]
pub struct Route {
    /// Rendezvous descriptor of the owning session.
    pub owner: RawFd,
    pub ep: Endpoint,
}

/// Maps every registered descriptor back to the session that owns it.
pub struct Routes {
    slots: Box<[Option<Route>]>,
}

impl Routes {
    pub fn new(capacity: usize) -> Self {
        Self { slots: vec![None; capacity].into_boxed_slice() }
    }

    pub fn insert(&mut self, fd: RawFd, owner: RawFd, ep: Endpoint) -> Result<(), TableFull> {
        let slot = self.slots.get_mut(fd as usize).ok_or(TableFull)?;
        soft_assert!(slot.is_none(), "route {fd} already occupied");
        *slot = Some(Route { owner, ep });
        Ok(())
    }

    pub fn get(&self, fd: RawFd) -> Option<Route> {
        *self.slots.get(fd as usize)?
    }

    pub fn remove(&mut self, fd: RawFd) {
        if let Some(slot) = self.slots.get_mut(fd as usize) {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use gsrelay_transport::{GsConnect, GsRead, GsStats, GsWrite};

    use super::*;

    struct NullGs {
        fd: RawFd,
        stats: GsStats,
    }

    impl NullGs {
        fn new(fd: RawFd) -> Self {
            Self { fd, stats: GsStats::default() }
        }
    }

    impl GsStream for NullGs {
        fn read(&mut self, _buf: &mut [u8]) -> GsRead {
            GsRead::WouldBlock
        }
        fn write(&mut self, _buf: &[u8]) -> GsWrite {
            GsWrite::WouldBlock
        }
        fn connect_step(&mut self) -> GsConnect {
            GsConnect::Connected
        }
        fn shutdown(&mut self) -> Result<(), gsrelay_transport::GsError> {
            Ok(())
        }
        fn raw_fd(&self) -> RawFd {
            self.fd
        }
        fn stats(&self) -> &GsStats {
            &self.stats
        }
        fn last_error(&self) -> Option<&str> {
            None
        }
    }

    #[test]
    fn count_tracks_occupied_slots() {
        let mut table: PeerTable<NullGs> = PeerTable::new(16);
        assert_eq!(table.count(), 0);

        assert!(table.insert(3, Box::new(Session::new(NullGs::new(3), 1))).is_ok());
        assert!(table.insert(9, Box::new(Session::new(NullGs::new(9), 2))).is_ok());
        assert_eq!(table.count(), 2);

        assert!(table.get_mut(3).is_some());
        assert!(table.get_mut(4).is_none());

        assert!(table.take(3).is_some());
        assert!(table.take(3).is_none(), "second take finds an empty slot");
        assert_eq!(table.count(), 1);
    }

    #[test]
    fn insert_beyond_capacity_is_rejected() {
        let mut table: PeerTable<NullGs> = PeerTable::new(4);
        let err = table.insert(99, Box::new(Session::new(NullGs::new(99), 1)));
        assert!(err.is_err());
        assert_eq!(table.count(), 0);
    }

    #[test]
    fn routes_resolve_and_clear() {
        let mut routes = Routes::new(16);
        routes.insert(5, 7, Endpoint::Local).unwrap();
        routes.insert(7, 7, Endpoint::Gs).unwrap();

        let r = routes.get(5).unwrap();
        assert_eq!(r.owner, 7);
        assert_eq!(r.ep, Endpoint::Local);

        routes.remove(5);
        assert!(routes.get(5).is_none());
        assert!(routes.insert(99, 1, Endpoint::Gs).is_err());
    }
}
