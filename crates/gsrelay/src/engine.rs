//! The transfer engine: bidirectional copy between a session's local
//! descriptor(s) and its rendezvous endpoint.
//!
//! Each session runs two independent half-duplex directions. local→GS
//! stages one batch in `wbuf` (a new read happens only once the previous
//! batch was written out); GS→local accumulates in `rbuf` until the local
//! write drains it. Backpressure is expressed purely through reactor
//! interest: whenever a destination stalls, the matching source's read
//! interest is dropped and only restored after the pending write finished.
//!
//! Readiness is edge-triggered, so every operation drains until the kernel
//! reports no further progress; interest re-registration re-arms pending
//! readiness when a direction is resumed.

use std::{
    io,
    net::{SocketAddr, SocketAddrV4},
};

use gsrelay_reactor::Reactor;
use gsrelay_transport::{GsConnect, GsRead, GsStream, GsWrite};
use gsrelay_utils::soft_assert;
use tracing::{debug, info, warn};

use crate::{
    fdio,
    peer::{Endpoint, GsPhase, LocalEnd, RELAY_BUF, Routes, Session, SessionKind, SocksState},
    stats, tty,
};

/// Verdict of one engine operation. `Dead` sessions are torn down by the
/// dispatcher; the engine itself never frees anything.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Alive,
    /// Blocked; a readiness callback will retry.
    CallAgain,
    Dead,
}

impl Flow {
    pub fn is_dead(self) -> bool {
        self == Self::Dead
    }
}

/// Drains the local descriptor into `wbuf` and pushes each batch to the
/// peer. On EOF (or a dead descriptor) the stdio session half-closes the
/// transport and stays alive for the reverse direction; every other kind
/// dies.
pub(crate) fn read_local<G: GsStream>(re: &mut Reactor, s: &mut Session<G>) -> Flow {
    loop {
        soft_assert!(s.wlen == 0, "[ID={}] read-local with bytes still staged", s.id);
        match fdio::read(s.fd_in, &mut s.wbuf[..]) {
            Ok(n) if n > 0 => {
                s.wlen = n;
                if s.interactive && s.esc.feed(s.wbuf[0]) {
                    debug!("[ID={}] escape sequence, closing", s.id);
                    return Flow::Dead;
                }
                match write_gs(re, s) {
                    Flow::Alive => {}
                    other => return other,
                }
            }
            Err(ref e) if fdio::would_block(e) => return Flow::Alive,
            _ => {
                if s.kind == SessionKind::Stdio {
                    let _ = re.disable_read(s.fd_in);
                    if s.gs.shutdown().is_ok() {
                        return Flow::Alive;
                    }
                }
                return Flow::Dead;
            }
        }
        if !re.wants_read(s.fd_in) {
            return Flow::Alive;
        }
    }
}

/// Writes the staged batch to the peer. The transport either takes the
/// whole batch or none of it.
pub(crate) fn write_gs<G: GsStream>(re: &mut Reactor, s: &mut Session<G>) -> Flow {
    let gs_fd = s.gs.raw_fd();
    match s.gs.write(&s.wbuf[..s.wlen]) {
        GsWrite::WouldBlock => {
            if s.fd_in >= 0 {
                let _ = re.disable_read(s.fd_in);
            }
            let _ = re.enable_write(gs_fd);
            Flow::CallAgain
        }
        GsWrite::Done(n) if n == s.wlen => {
            s.wlen = 0;
            // a parked transport read still owns the writable waiter
            if !re.is_parked(gs_fd) {
                let _ = re.disable_write(gs_fd);
            }
            if s.is_fd_connected {
                let _ = re.enable_read(s.fd_in);
            }
            Flow::Alive
        }
        GsWrite::Done(n) => {
            warn!("[ID={}] transport broke write atomicity ({n} of {})", s.id, s.wlen);
            Flow::Dead
        }
        GsWrite::Fatal(_) => Flow::Dead,
    }
}

/// Drains the peer into `rbuf`, feeding the SOCKS handshake while it is in
/// progress, otherwise flushing to the local descriptor.
pub(crate) fn read_gs<G: GsStream>(
    re: &mut Reactor,
    routes: &mut Routes,
    s: &mut Session<G>,
) -> Flow {
    let gs_fd = s.gs.raw_fd();
    loop {
        soft_assert!(s.rlen < RELAY_BUF, "[ID={}] receive buffer overrun", s.id);
        match s.gs.read(&mut s.rbuf[s.rlen..]) {
            GsRead::WouldBlock => return Flow::CallAgain,
            GsRead::WantWrite => {
                let _ = re.read_blocked_on_write(gs_fd);
                return Flow::CallAgain;
            }
            GsRead::Eof => {
                debug!("[ID={}] peer EOF, half-closing local side", s.id);
                fdio::shutdown_write(s.fd_out);
                if s.receive_only {
                    return Flow::Dead;
                }
                // EOF is level-ready forever; only the local→GS direction
                // is still alive.
                let _ = re.disable_read(gs_fd);
                return Flow::Alive;
            }
            GsRead::Fatal(_) => {
                let _ = s.gs.shutdown();
                return Flow::Dead;
            }
            GsRead::Data(n) => {
                if re.is_parked(gs_fd) {
                    let _ = re.read_unblocked(gs_fd);
                }
                s.rlen += n;
                if s.socks.state != SocksState::Connected {
                    return socks_advance(re, routes, s);
                }
                if s.kind == SessionKind::Stdio && s.interactive && !s.tty_raw {
                    s.tty_raw = true;
                    tty::set_raw();
                }
                match write_local(re, s) {
                    Flow::Alive => {}
                    other => return other,
                }
            }
        }
        if !re.wants_read(gs_fd) {
            return Flow::Alive;
        }
    }
}

/// Flushes `rbuf` to the local descriptor. A stalled or short write drops
/// the peer's read interest until the buffer is fully drained.
pub(crate) fn write_local<G: GsStream>(re: &mut Reactor, s: &mut Session<G>) -> Flow {
    let gs_fd = s.gs.raw_fd();
    match fdio::write(s.fd_out, &s.rbuf[..s.rlen]) {
        Ok(n) if n == s.rlen => {
            s.rlen = 0;
            let _ = re.disable_write(s.fd_out);
            let _ = re.enable_read(gs_fd);
            Flow::Alive
        }
        Ok(n) => {
            s.rbuf.copy_within(n..s.rlen, 0);
            s.rlen -= n;
            let _ = re.disable_read(gs_fd);
            let _ = re.enable_write(s.fd_out);
            Flow::CallAgain
        }
        Err(ref e) if fdio::would_block(e) => {
            let _ = re.disable_read(gs_fd);
            let _ = re.enable_write(s.fd_out);
            Flow::CallAgain
        }
        Err(_) => Flow::Dead,
    }
}

/// Feeds buffered peer bytes to the SOCKS parser and, once it yields a
/// target, kicks off the outbound connect. Handshake replies ride the
/// regular local→GS staging buffer.
fn socks_advance<G: GsStream>(re: &mut Reactor, routes: &mut Routes, s: &mut Session<G>) -> Flow {
    let Some(parser) = s.socks.parser.as_mut() else {
        soft_assert!(false, "[ID={}] socks bytes without a parser", s.id);
        return Flow::Dead;
    };
    let adv = match parser.advance(&s.rbuf[..s.rlen]) {
        Ok(adv) => adv,
        Err(e) => {
            info!("[ID={}] socks handshake rejected: {e}", s.id);
            let _ = s.gs.shutdown();
            return Flow::Dead;
        }
    };

    if adv.consumed > 0 {
        s.rbuf.copy_within(adv.consumed..s.rlen, 0);
        s.rlen -= adv.consumed;
    }
    if !adv.reply.is_empty() {
        soft_assert!(s.wlen == 0, "[ID={}] socks reply with local bytes staged", s.id);
        s.wbuf[..adv.reply.len()].copy_from_slice(&adv.reply);
        s.wlen = adv.reply.len();
    }

    if let Some(target) = adv.target {
        s.socks.dst_ip = target.ip;
        s.socks.dst_port = target.port;
        s.socks.dst_hostname = target.hostname;
        s.socks.state = SocksState::Connecting;
        if forward_connect(re, routes, s).is_dead() {
            return Flow::Dead;
        }
        // From here on this behaves like a plain port forward; client data
        // keeps buffering in rbuf and drains once the forward is up.
        s.socks.state = SocksState::Connected;
    }

    if s.wlen > 0 {
        return write_gs(re, s);
    }
    Flow::Alive
}

/// Starts the outbound TCP connect towards the session's destination and
/// parks the peer direction until it completes.
pub(crate) fn forward_connect<G: GsStream>(
    re: &mut Reactor,
    routes: &mut Routes,
    s: &mut Session<G>,
) -> Flow {
    let gs_fd = s.gs.raw_fd();
    let addr = SocketAddr::V4(SocketAddrV4::new(s.socks.dst_ip, s.socks.dst_port));
    info!(
        "{}",
        stats::hostname_line(s.id, "forwarding to ", &s.socks.dst_hostname, s.socks.dst_port)
    );

    let stream = match mio::net::TcpStream::connect(addr) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("[ID={}] forward connect failed: {e}", s.id);
            return Flow::Dead;
        }
    };
    let socks = matches!(s.kind, SessionKind::Network { socks: true });
    s.attach_socket(stream, socks);
    s.local_connecting = true;

    let fd = s.fd_in;
    if re.register(fd).is_err() || routes.insert(fd, gs_fd, Endpoint::Local).is_err() {
        warn!("[ID={}] descriptor table full, rejecting forward", s.id);
        return Flow::Dead;
    }
    let _ = re.enable_write(fd);
    let _ = re.disable_read(gs_fd);
    Flow::Alive
}

/// Completes the outbound TCP connect once the descriptor reports
/// writability.
pub(crate) fn complete_forward<G: GsStream>(re: &mut Reactor, s: &mut Session<G>) -> Flow {
    let LocalEnd::Socket(stream) = &s.local else {
        soft_assert!(false, "[ID={}] connect completion without a socket", s.id);
        return Flow::Dead;
    };
    match stream.take_error() {
        Ok(None) => {}
        Ok(Some(e)) => {
            info!("[ID={}] forward connect failed: {e}", s.id);
            return Flow::Dead;
        }
        Err(e) => {
            warn!("[ID={}] forward connect failed: {e}", s.id);
            return Flow::Dead;
        }
    }
    match stream.peer_addr() {
        Ok(_) => {
            s.local_connecting = false;
            completed_connect(re, s)
        }
        Err(ref e)
            if e.kind() == io::ErrorKind::NotConnected
                || e.raw_os_error() == Some(libc::EINPROGRESS) =>
        {
            Flow::CallAgain
        }
        Err(e) => {
            info!("[ID={}] forward connect failed: {e}", s.id);
            Flow::Dead
        }
    }
}

/// The local descriptor is usable: arm both read directions and flush
/// whatever accumulated in `rbuf` while the connect was pending.
pub(crate) fn completed_connect<G: GsStream>(re: &mut Reactor, s: &mut Session<G>) -> Flow {
    let _ = re.disable_write(s.fd_out);
    let _ = re.enable_read(s.fd_in);
    let _ = re.enable_read(s.gs.raw_fd());
    s.is_fd_connected = true;
    if s.rlen > 0 {
        return write_local(re, s);
    }
    Flow::Alive
}

/// Drives the client-side rendezvous connect.
pub(crate) fn gs_connect_step<G: GsStream>(re: &mut Reactor, s: &mut Session<G>) -> Flow {
    let gs_fd = s.gs.raw_fd();
    match s.gs.connect_step() {
        GsConnect::Waiting => Flow::CallAgain,
        GsConnect::Fatal(_) => {
            info!(
                "[ID={}] connection failed: {}",
                s.id,
                s.gs.last_error().unwrap_or("unknown error")
            );
            if s.kind == SessionKind::Stdio {
                // no server listening and no other session to serve
                re.request_exit(255);
            }
            Flow::Dead
        }
        GsConnect::Connected => {
            debug!("[ID={}] rendezvous connected", s.id);
            s.gs_phase = GsPhase::Established;
            let _ = re.disable_write(gs_fd);
            completed_connect(re, s)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        os::fd::{AsRawFd, RawFd},
        os::unix::net::UnixStream,
    };

    use gsrelay_transport::{GsError, GsStats};

    use super::*;

    /// Scripted transport endpoint backed by a real (ignored) descriptor so
    /// the reactor can register it.
    struct ScriptGs {
        fd_holder: UnixStream,
        reads: VecDeque<GsRead>,
        writes: VecDeque<GsWrite>,
        written: Vec<u8>,
        stats: GsStats,
        shutdowns: usize,
    }

    impl ScriptGs {
        fn new() -> (Self, UnixStream) {
            let (a, b) = UnixStream::pair().unwrap();
            a.set_nonblocking(true).unwrap();
            (
                Self {
                    fd_holder: a,
                    reads: VecDeque::new(),
                    writes: VecDeque::new(),
                    written: Vec::new(),
                    stats: GsStats::default(),
                    shutdowns: 0,
                },
                b,
            )
        }
    }

    impl GsStream for ScriptGs {
        fn read(&mut self, _buf: &mut [u8]) -> GsRead {
            self.reads.pop_front().unwrap_or(GsRead::WouldBlock)
        }
        fn write(&mut self, buf: &[u8]) -> GsWrite {
            match self.writes.pop_front().unwrap_or(GsWrite::WouldBlock) {
                GsWrite::Done(_) => {
                    self.written.extend_from_slice(buf);
                    GsWrite::Done(buf.len())
                }
                other => other,
            }
        }
        fn connect_step(&mut self) -> GsConnect {
            GsConnect::Connected
        }
        fn shutdown(&mut self) -> Result<(), GsError> {
            self.shutdowns += 1;
            Ok(())
        }
        fn raw_fd(&self) -> RawFd {
            self.fd_holder.as_raw_fd()
        }
        fn stats(&self) -> &GsStats {
            &self.stats
        }
        fn last_error(&self) -> Option<&str> {
            None
        }
    }

    struct Rig {
        re: Reactor,
        s: Session<ScriptGs>,
        // keep the far ends alive so the descriptors stay valid
        _gs_far: UnixStream,
        local_far: UnixStream,
        local_near: UnixStream,
    }

    fn rig() -> Rig {
        let mut re = Reactor::new().unwrap();
        let (gs, gs_far) = ScriptGs::new();
        let (local_near, local_far) = UnixStream::pair().unwrap();
        local_near.set_nonblocking(true).unwrap();
        local_far.set_nonblocking(true).unwrap();

        let mut s = Session::new(gs, 1);
        let fd = local_near.as_raw_fd();
        s.fd_in = fd;
        s.fd_out = fd;
        s.kind = SessionKind::Network { socks: false };
        s.is_fd_connected = true;

        re.register(s.gs_fd()).unwrap();
        re.register(fd).unwrap();
        re.enable_read(fd).unwrap();
        re.enable_read(s.gs_fd()).unwrap();

        Rig { re, s, _gs_far: gs_far, local_far, local_near }
    }

    #[test]
    fn blocked_peer_write_pauses_local_reads() {
        let mut rig = rig();
        use std::io::Write as _;
        rig.local_far.write_all(b"payload").unwrap();

        rig.s.gs.writes.push_back(GsWrite::WouldBlock);
        let flow = read_local(&mut rig.re, &mut rig.s);

        assert_eq!(flow, Flow::CallAgain);
        assert_eq!(rig.s.wlen, 7, "batch stays staged");
        assert!(!rig.re.wants_read(rig.s.fd_in), "local reads must pause");
        assert!(rig.re.wants_write(rig.s.gs_fd()), "retry armed on the peer");
    }

    #[test]
    fn completed_peer_write_resumes_local_reads() {
        let mut rig = rig();
        use std::io::Write as _;
        rig.local_far.write_all(b"payload").unwrap();

        rig.s.gs.writes.push_back(GsWrite::WouldBlock);
        assert_eq!(read_local(&mut rig.re, &mut rig.s), Flow::CallAgain);

        // the retry succeeds
        rig.s.gs.writes.push_back(GsWrite::Done(0));
        assert_eq!(write_gs(&mut rig.re, &mut rig.s), Flow::Alive);
        assert_eq!(rig.s.wlen, 0);
        assert_eq!(rig.s.gs.written, b"payload");
        assert!(rig.re.wants_read(rig.s.fd_in), "local reads resume");
        assert!(!rig.re.wants_write(rig.s.gs_fd()));
    }

    #[test]
    fn blocked_local_write_pauses_peer_reads() {
        let mut rig = rig();

        // Choke the local socket so write_local hits EAGAIN.
        let filler = [0u8; 16 * 1024];
        loop {
            match fdio::write(rig.local_near.as_raw_fd(), &filler) {
                Ok(_) => {}
                Err(ref e) if fdio::would_block(e) => break,
                Err(e) => panic!("unexpected fill error: {e}"),
            }
        }

        rig.s.rlen = 5;
        rig.s.rbuf[..5].copy_from_slice(b"stuck");
        let flow = write_local(&mut rig.re, &mut rig.s);

        assert_eq!(flow, Flow::CallAgain);
        assert_eq!(rig.s.rlen, 5);
        assert!(!rig.re.wants_read(rig.s.gs_fd()), "peer reads must pause");
        assert!(rig.re.wants_write(rig.s.fd_out));
    }

    #[test]
    fn peer_eof_half_closes_and_keeps_session() {
        let mut rig = rig();
        rig.s.gs.reads.push_back(GsRead::Eof);

        assert_eq!(read_gs(&mut rig.re, &mut Routes::new(64), &mut rig.s), Flow::Alive);
        assert!(!rig.re.wants_read(rig.s.gs_fd()));

        // the peer's EOF arrived at the local side as a half-close
        use std::io::Read as _;
        rig.local_far.set_nonblocking(false).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(rig.local_far.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn peer_eof_kills_receive_only_sessions() {
        let mut rig = rig();
        rig.s.receive_only = true;
        rig.s.gs.reads.push_back(GsRead::Eof);
        assert_eq!(read_gs(&mut rig.re, &mut Routes::new(64), &mut rig.s), Flow::Dead);
    }

    #[test]
    fn stdio_eof_shuts_peer_but_stays_alive() {
        let mut rig = rig();
        rig.s.kind = SessionKind::Stdio;
        // close the far end so the local read reports EOF
        drop(rig.local_far);

        let flow = read_local(&mut rig.re, &mut rig.s);
        assert_eq!(flow, Flow::Alive, "half-duplex: reverse direction lives on");
        assert_eq!(rig.s.gs.shutdowns, 1);
        assert!(!rig.re.wants_read(rig.s.fd_in));
    }
}
