//! Plain-TCP implementation of the transport contract.
//!
//! One TCP connection to a fixed rendezvous address stands in for the
//! Global Socket: `listen` binds the address, `connect` dials it. Connect
//! completion is observed through writability plus `SO_ERROR`, the same way
//! the engine's outbound forwards complete.

use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr},
    os::fd::{AsRawFd, RawFd},
    time::Instant,
};

use mio::net::{TcpListener, TcpStream};
use tracing::{debug, trace};

use crate::{
    GsAccept, GsConnect, GsError, GsListener, GsRead, GsStats, GsStream, GsTransport, GsWrite,
};

pub struct TcpGs {
    addr: SocketAddr,
}

impl TcpGs {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl GsTransport for TcpGs {
    type Stream = TcpGsStream;
    type Listener = TcpGsListener;

    fn connect(&self) -> io::Result<TcpGsStream> {
        let stream = TcpStream::connect(self.addr)?;
        Ok(TcpGsStream::connecting(stream))
    }

    fn listen(&self) -> io::Result<TcpGsListener> {
        let listener = TcpListener::bind(self.addr)?;
        debug!(addr = %self.addr, "rendezvous listener bound");
        Ok(TcpGsListener { listener })
    }
}

#[derive(PartialEq)]
enum Phase {
    Connecting,
    Established,
}

pub struct TcpGsStream {
    stream: TcpStream,
    phase: Phase,
    stats: GsStats,
    /// Unsent tail of the batch currently being retried. The contract
    /// promises atomic-or-nothing writes, so a kernel short write is hidden
    /// here and drained when the caller retries the same batch.
    pending: Vec<u8>,
    eof_seen: bool,
    write_shut: bool,
    last_error: Option<String>,
}

impl TcpGsStream {
    fn connecting(stream: TcpStream) -> Self {
        Self {
            stream,
            phase: Phase::Connecting,
            stats: GsStats::default(),
            pending: Vec::new(),
            eof_seen: false,
            write_shut: false,
            last_error: None,
        }
    }

    fn accepted(stream: TcpStream) -> Self {
        let mut s = Self::connecting(stream);
        s.phase = Phase::Established;
        s.stats.connected_at = Some(Instant::now());
        s
    }

    fn fatal(&mut self, err: GsError) -> GsError {
        self.last_error = Some(err.to_string());
        err
    }
}

impl GsStream for TcpGsStream {
    fn read(&mut self, buf: &mut [u8]) -> GsRead {
        match self.stream.read(buf) {
            Ok(0) => {
                if self.eof_seen || self.write_shut {
                    GsRead::Fatal(self.fatal(GsError::PeerClosed))
                } else {
                    self.eof_seen = true;
                    GsRead::Eof
                }
            }
            Ok(n) => {
                self.stats.bytes_read += n as u64;
                GsRead::Data(n)
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                GsRead::WouldBlock
            }
            Err(e) => GsRead::Fatal(self.fatal(GsError::Io(e))),
        }
    }

    fn write(&mut self, buf: &[u8]) -> GsWrite {
        // Drain the stashed tail of the batch being retried first. Once it
        // is gone the caller's batch has been delivered in full.
        if !self.pending.is_empty() {
            match self.stream.write(&self.pending) {
                Ok(0) => return GsWrite::Fatal(self.fatal(GsError::PeerClosed)),
                Ok(n) => {
                    self.pending.drain(..n);
                    if !self.pending.is_empty() {
                        return GsWrite::WouldBlock;
                    }
                    self.stats.bytes_written += buf.len() as u64;
                    return GsWrite::Done(buf.len());
                }
                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    return GsWrite::WouldBlock;
                }
                Err(e) => return GsWrite::Fatal(self.fatal(GsError::Io(e))),
            }
        }

        match self.stream.write(buf) {
            Ok(0) => GsWrite::Fatal(self.fatal(GsError::PeerClosed)),
            Ok(n) if n == buf.len() => {
                self.stats.bytes_written += n as u64;
                GsWrite::Done(n)
            }
            Ok(n) => {
                self.pending.extend_from_slice(&buf[n..]);
                GsWrite::WouldBlock
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                GsWrite::WouldBlock
            }
            Err(e) => GsWrite::Fatal(self.fatal(GsError::Io(e))),
        }
    }

    fn connect_step(&mut self) -> GsConnect {
        if self.phase == Phase::Established {
            return GsConnect::Connected;
        }
        match self.stream.take_error() {
            Ok(Some(_)) => return GsConnect::Fatal(self.fatal(GsError::Refused)),
            Ok(None) => {}
            Err(e) => return GsConnect::Fatal(self.fatal(GsError::Io(e))),
        }
        match self.stream.peer_addr() {
            Ok(peer) => {
                let _ = self.stream.set_nodelay(true);
                self.phase = Phase::Established;
                self.stats.connected_at = Some(Instant::now());
                trace!(%peer, "rendezvous connect complete");
                GsConnect::Connected
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::NotConnected
                    || e.raw_os_error() == Some(libc::EINPROGRESS) =>
            {
                GsConnect::Waiting
            }
            Err(e) => GsConnect::Fatal(self.fatal(GsError::Io(e))),
        }
    }

    fn shutdown(&mut self) -> Result<(), GsError> {
        if !self.write_shut {
            self.write_shut = true;
            if let Err(e) = self.stream.shutdown(Shutdown::Write) {
                return Err(self.fatal(GsError::Io(e)));
            }
        }
        if self.eof_seen {
            // Both directions are down now; nothing left to relay.
            return Err(GsError::PeerClosed);
        }
        Ok(())
    }

    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn stats(&self) -> &GsStats {
        &self.stats
    }

    fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

pub struct TcpGsListener {
    listener: TcpListener,
}

impl GsListener for TcpGsListener {
    type Stream = TcpGsStream;

    fn accept(&mut self) -> GsAccept<TcpGsStream> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                let _ = stream.set_nodelay(true);
                debug!(%peer, "rendezvous peer accepted");
                GsAccept::Stream(TcpGsStream::accepted(stream))
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted
                    || e.raw_os_error() == Some(libc::ECONNABORTED) =>
            {
                GsAccept::NotReady
            }
            Err(e) => GsAccept::Fatal(GsError::Io(e)),
        }
    }

    fn heartbeat(&mut self) {
        // Plain TCP needs no keepalive chatter; the real transport pings
        // its broker here.
        trace!("listener heartbeat");
    }

    fn raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Write as _, net::TcpListener as StdListener, time::Duration};

    use super::*;

    fn wait_connected(s: &mut TcpGsStream) {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match s.connect_step() {
                GsConnect::Connected => return,
                GsConnect::Waiting => {
                    assert!(Instant::now() < deadline, "connect never completed");
                    std::thread::sleep(Duration::from_millis(5));
                }
                GsConnect::Fatal(e) => panic!("connect failed: {e}"),
            }
        }
    }

    #[test]
    fn connect_goes_through_waiting() {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let gs = TcpGs::new(listener.local_addr().unwrap());

        let mut stream = gs.connect().unwrap();
        wait_connected(&mut stream);
        let (_peer, _) = listener.accept().unwrap();
        assert!(stream.stats().connected_at.is_some());
    }

    #[test]
    fn counters_track_traffic() {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let gs = TcpGs::new(listener.local_addr().unwrap());
        let mut stream = gs.connect().unwrap();
        wait_connected(&mut stream);
        let (mut peer, _) = listener.accept().unwrap();

        match stream.write(b"abc") {
            GsWrite::Done(3) => {}
            other => panic!("unexpected write result: {other:?}"),
        }
        assert_eq!(stream.stats().bytes_written, 3);

        peer.write_all(b"defg").unwrap();
        let mut buf = [0u8; 16];
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match stream.read(&mut buf) {
                GsRead::Data(4) => break,
                GsRead::WouldBlock => {
                    assert!(Instant::now() < deadline, "never received bytes");
                    std::thread::sleep(Duration::from_millis(5));
                }
                other => panic!("unexpected read result: {other:?}"),
            }
        }
        assert_eq!(&buf[..4], b"defg");
        assert_eq!(stream.stats().bytes_read, 4);
    }

    #[test]
    fn eof_once_then_fatal() {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let gs = TcpGs::new(listener.local_addr().unwrap());
        let mut stream = gs.connect().unwrap();
        wait_connected(&mut stream);
        let (peer, _) = listener.accept().unwrap();
        drop(peer);

        let mut buf = [0u8; 16];
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match stream.read(&mut buf) {
                GsRead::Eof => break,
                GsRead::WouldBlock => {
                    assert!(Instant::now() < deadline, "never saw EOF");
                    std::thread::sleep(Duration::from_millis(5));
                }
                other => panic!("unexpected read result: {other:?}"),
            }
        }
        assert!(matches!(stream.read(&mut buf), GsRead::Fatal(GsError::PeerClosed)));
    }

    #[test]
    fn shutdown_after_eof_reports_fatal() {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let gs = TcpGs::new(listener.local_addr().unwrap());
        let mut stream = gs.connect().unwrap();
        wait_connected(&mut stream);
        let (peer, _) = listener.accept().unwrap();

        // Half-close our side first: peer still up, session must stay alive.
        assert!(stream.shutdown().is_ok());

        drop(peer);
        let mut buf = [0u8; 16];
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match stream.read(&mut buf) {
                // write direction already shut, so the peer's EOF is final
                GsRead::Fatal(GsError::PeerClosed) => break,
                GsRead::WouldBlock => {
                    assert!(Instant::now() < deadline, "never saw close");
                    std::thread::sleep(Duration::from_millis(5));
                }
                other => panic!("unexpected read result: {other:?}"),
            }
        }
    }
}
