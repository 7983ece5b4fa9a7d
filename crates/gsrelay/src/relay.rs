//! Session lifecycle and the run loop: accepts rendezvous peers (server),
//! accepts local TCP connections (client), dispatches readiness to the
//! transfer engine and tears sessions down.

use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    os::fd::AsRawFd,
};

use gsrelay_reactor::{Reactor, Readiness};
use gsrelay_transport::{GsAccept, GsListener, GsStream, GsTransport};
use tracing::{debug, error, info, warn};

use crate::{
    config::{Config, Role},
    engine::{self, Flow},
    exec, fdio,
    peer::{Endpoint, GsPhase, LocalEnd, PeerTable, Routes, Session, SessionKind, SocksConn},
    stats, tty,
};

pub struct Relay<T: GsTransport> {
    cfg: Config,
    transport: T,
    reactor: Reactor,
    peers: PeerTable<T::Stream>,
    routes: Routes,
    gs_listener: Option<T::Listener>,
    tcp_listener: Option<mio::net::TcpListener>,
    next_id: u32,
}

impl<T: GsTransport> Relay<T> {
    /// Binds whatever the configured role needs up front so failures
    /// surface before the loop (and before any daemonizing caller forks).
    pub fn new(cfg: Config, transport: T) -> io::Result<Self> {
        let reactor = Reactor::new()?;
        let capacity = reactor.capacity();
        let mut relay = Self {
            cfg,
            transport,
            reactor,
            peers: PeerTable::new(capacity),
            routes: Routes::new(capacity),
            gs_listener: None,
            tcp_listener: None,
            next_id: 0,
        };

        match relay.cfg.role {
            Role::Server => {
                let listener = relay.transport.listen()?;
                let fd = listener.raw_fd();
                relay.reactor.register(fd)?;
                relay.reactor.enable_read(fd)?;
                relay.gs_listener = Some(listener);
            }
            Role::Client if relay.cfg.multi_peer => {
                let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, relay.cfg.port));
                let listener = mio::net::TcpListener::bind(addr)?;
                let fd = listener.as_raw_fd();
                relay.reactor.register(fd)?;
                relay.reactor.enable_read(fd)?;
                info!(%addr, "listening for local connections");
                relay.tcp_listener = Some(listener);
            }
            Role::Client => {
                let gs = relay.transport.connect()?;
                relay.new_client_session(gs, None, None);
            }
        }
        Ok(relay)
    }

    pub fn session_count(&self) -> usize {
        self.peers.count()
    }

    /// Runs until an exit is requested. The returned code becomes the
    /// process exit status; the loop ending any other way is a bug.
    pub fn run(&mut self) -> i32 {
        let mut events: Vec<Readiness> = Vec::with_capacity(256);
        loop {
            let tick = match self.reactor.poll_collect(&mut events) {
                Ok(tick) => tick,
                Err(e) => {
                    error!("reactor wait failed: {e}");
                    return 255;
                }
            };
            if tick && let Some(listener) = self.gs_listener.as_mut() {
                listener.heartbeat();
            }
            for i in 0..events.len() {
                self.dispatch(events[i]);
                if self.reactor.exit_code().is_some() {
                    break;
                }
            }
            if let Some(code) = self.reactor.exit_code() {
                return code;
            }
        }
    }

    fn dispatch(&mut self, ev: Readiness) {
        if let Some(listener) = &self.gs_listener
            && ev.fd == listener.raw_fd()
        {
            if ev.readable {
                self.accept_gs();
            }
            return;
        }
        if let Some(listener) = &self.tcp_listener
            && ev.fd == listener.as_raw_fd()
        {
            if ev.readable {
                self.accept_tcp();
            }
            return;
        }

        let Some(route) = self.routes.get(ev.fd) else {
            return; // torn down earlier in this batch
        };
        let Some(s) = self.peers.get_mut(route.owner) else {
            return;
        };

        let flow = match route.ep {
            Endpoint::Gs if s.gs_phase == GsPhase::Connecting => {
                engine::gs_connect_step(&mut self.reactor, s)
            }
            Endpoint::Gs => {
                let mut flow = Flow::Alive;
                if ev.writable {
                    flow = if self.reactor.is_parked(ev.fd) {
                        engine::read_gs(&mut self.reactor, &mut self.routes, s)
                    } else if s.wlen > 0 {
                        engine::write_gs(&mut self.reactor, s)
                    } else {
                        let _ = self.reactor.disable_write(ev.fd);
                        Flow::Alive
                    };
                }
                if !flow.is_dead() && ev.readable && self.reactor.wants_read(ev.fd) {
                    flow = engine::read_gs(&mut self.reactor, &mut self.routes, s);
                }
                flow
            }
            Endpoint::Local => {
                let mut flow = Flow::Alive;
                if ev.writable {
                    flow = if s.local_connecting {
                        engine::complete_forward(&mut self.reactor, s)
                    } else if s.rlen > 0 {
                        engine::write_local(&mut self.reactor, s)
                    } else {
                        let _ = self.reactor.disable_write(ev.fd);
                        Flow::Alive
                    };
                }
                if !flow.is_dead()
                    && ev.readable
                    && ev.fd == s.fd_in
                    && s.wlen == 0
                    && self.reactor.wants_read(ev.fd)
                {
                    flow = engine::read_local(&mut self.reactor, s);
                }
                flow
            }
        };

        if flow.is_dead() {
            self.teardown(route.owner);
        }
    }

    /// SERVER: accept rendezvous peers until the listener has nothing
    /// left, building one session per peer.
    fn accept_gs(&mut self) {
        loop {
            let Some(listener) = self.gs_listener.as_mut() else {
                return;
            };
            match listener.accept() {
                GsAccept::NotReady => return,
                GsAccept::Fatal(e) => {
                    error!("another server is already listening or network error: {e}");
                    self.reactor.request_exit(255);
                    return;
                }
                GsAccept::Stream(gs) => {
                    if !self.cfg.multi_peer {
                        // stdio serves exactly one peer
                        if let Some(listener) = self.gs_listener.take() {
                            self.reactor.deregister(listener.raw_fd());
                        }
                    }
                    self.new_server_session(gs);
                    if self.gs_listener.is_none() {
                        return;
                    }
                }
            }
        }
    }

    /// CLIENT: accept local TCP connections, opening one rendezvous
    /// session per connection.
    fn accept_tcp(&mut self) {
        loop {
            let Some(listener) = self.tcp_listener.as_mut() else {
                return;
            };
            match listener.accept() {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    match self.transport.connect() {
                        Ok(gs) => self.new_client_session(gs, Some(stream), Some(peer)),
                        Err(e) => warn!("cannot reach the rendezvous point: {e}"),
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("local accept failed: {e}");
                    return;
                }
            }
        }
    }

    /// Builds the server-side session for a freshly accepted peer. The
    /// local sink is chosen by configuration: subprocess, fixed TCP
    /// forward, SOCKS, stdio.
    fn new_server_session(&mut self, gs: T::Stream) {
        let Some((gs_fd, id)) = self.claim_gs_slot(&gs) else {
            return; // dropped: table full
        };
        let mut s = Box::new(Session::new(gs, id));
        s.receive_only = self.cfg.receive_only;
        if let Err(s) = self.peers.insert(gs_fd, s) {
            unwire(&mut self.reactor, &mut self.routes, &s);
            return;
        }
        info!("[ID={id}] new connection");

        let Some(s) = self.peers.get_mut(gs_fd) else {
            return;
        };
        let flow = if self.cfg.cmd.is_some() || self.cfg.interactive {
            match exec::spawn(self.cfg.cmd.as_deref(), self.cfg.interactive) {
                Ok((fd, child)) => {
                    s.attach_child(fd, child);
                    if wire_local(&mut self.reactor, &mut self.routes, s) {
                        engine::completed_connect(&mut self.reactor, s)
                    } else {
                        Flow::Dead
                    }
                }
                Err(e) => {
                    warn!("[ID={id}] cannot spawn forward command: {e}");
                    Flow::Dead
                }
            }
        } else if self.cfg.port != 0 {
            s.kind = SessionKind::Network { socks: false };
            let dst = self.cfg.dst_ip.unwrap_or(Ipv4Addr::LOCALHOST);
            s.socks = SocksConn::fixed(dst, self.cfg.port);
            engine::forward_connect(&mut self.reactor, &mut self.routes, s)
        } else if self.cfg.socks {
            s.kind = SessionKind::Network { socks: true };
            s.socks = SocksConn::server();
            let _ = self.reactor.enable_read(gs_fd);
            Flow::Alive
        } else {
            s.attach_stdio();
            let _ = fdio::set_nonblocking(s.fd_in);
            let _ = fdio::set_nonblocking(s.fd_out);
            if wire_local(&mut self.reactor, &mut self.routes, s) {
                engine::completed_connect(&mut self.reactor, s)
            } else {
                Flow::Dead
            }
        };

        if flow.is_dead() {
            self.teardown(gs_fd);
        }
    }

    /// Builds a client-side session and starts its rendezvous connect.
    /// `local` is the accepted TCP connection in multi-session mode, or
    /// `None` for the process's stdio.
    fn new_client_session(
        &mut self,
        gs: T::Stream,
        local: Option<mio::net::TcpStream>,
        peer: Option<SocketAddr>,
    ) {
        let single = local.is_none();
        let Some((gs_fd, id)) = self.claim_gs_slot(&gs) else {
            if single {
                self.reactor.request_exit(255);
            }
            return;
        };

        let mut s = Box::new(Session::new(gs, id));
        s.gs_phase = GsPhase::Connecting;
        s.receive_only = self.cfg.receive_only;
        match local {
            None => {
                s.attach_stdio();
                s.interactive = self.cfg.interactive;
                let _ = fdio::set_nonblocking(s.fd_in);
                let _ = fdio::set_nonblocking(s.fd_out);
            }
            Some(stream) => s.attach_socket(stream, false),
        }

        if !wire_local(&mut self.reactor, &mut self.routes, &s) {
            warn!("[ID={id}] descriptor table full, rejecting session");
            unwire(&mut self.reactor, &mut self.routes, &s);
            if single {
                self.reactor.request_exit(255);
            }
            return;
        }
        // connect completion is observed through readiness on the
        // rendezvous descriptor
        let _ = self.reactor.enable_write(gs_fd);
        let _ = self.reactor.enable_read(gs_fd);

        if let Some(peer) = peer {
            info!("[ID={id}] new connection from {peer}");
        }
        if let Err(s) = self.peers.insert(gs_fd, s) {
            unwire(&mut self.reactor, &mut self.routes, &s);
        }
    }

    /// Registers the rendezvous descriptor and allocates a session id.
    /// Returns `None` (dropping the endpoint) when the table is full.
    fn claim_gs_slot(&mut self, gs: &T::Stream) -> Option<(std::os::fd::RawFd, u32)> {
        let gs_fd = gs.raw_fd();
        self.next_id += 1;
        let id = self.next_id;
        if self.reactor.register(gs_fd).is_err()
            || self.routes.insert(gs_fd, gs_fd, Endpoint::Gs).is_err()
        {
            warn!("[ID={id}] descriptor table full, rejecting session");
            self.reactor.deregister(gs_fd);
            self.routes.remove(gs_fd);
            return None;
        }
        Some((gs_fd, id))
    }

    /// Tears a session down: deregisters its descriptors, logs statistics
    /// for sessions that reached the connected state, then releases the
    /// record (closing the local descriptor and the endpoint). The stdio
    /// session takes the process with it.
    fn teardown(&mut self, gs_fd: std::os::fd::RawFd) {
        let Some(mut s) = self.peers.take(gs_fd) else {
            return;
        };
        unwire(&mut self.reactor, &mut self.routes, &s);

        // the local descriptor goes first; stdio stays open for the process
        match std::mem::replace(&mut s.local, LocalEnd::Pending) {
            LocalEnd::Child { fd, mut child } => {
                drop(fd);
                let _ = child.try_wait();
            }
            LocalEnd::Socket(stream) => drop(stream),
            LocalEnd::Stdio | LocalEnd::Pending => {}
        }

        if s.tty_raw {
            tty::reset();
        }

        if let Some(summary) = stats::summary(s.id, s.gs.stats()) {
            info!("{summary}");
            if matches!(s.kind, SessionKind::Network { .. }) && s.socks.dst_port != 0 {
                info!(
                    "{}",
                    stats::hostname_line(s.id, "", &s.socks.dst_hostname, s.socks.dst_port)
                );
            }
        }

        if s.kind == SessionKind::Stdio {
            self.reactor.request_exit(0);
        }
        debug!("[ID={}] session released, {} still connected", s.id, self.peers.count());
    }
}

/// Registers the session's local descriptor(s) with the reactor and the
/// route table. Interest stays off; the lifecycle arms it when the
/// descriptor is ready to use.
fn wire_local<G: GsStream>(re: &mut Reactor, routes: &mut Routes, s: &Session<G>) -> bool {
    let gs_fd = s.gs.raw_fd();
    if re.register(s.fd_in).is_err() || routes.insert(s.fd_in, gs_fd, Endpoint::Local).is_err() {
        return false;
    }
    if s.fd_out != s.fd_in
        && (re.register(s.fd_out).is_err()
            || routes.insert(s.fd_out, gs_fd, Endpoint::Local).is_err())
    {
        return false;
    }
    true
}

/// Removes every reactor registration and route the session holds.
fn unwire<G: GsStream>(re: &mut Reactor, routes: &mut Routes, s: &Session<G>) {
    let gs_fd = s.gs.raw_fd();
    re.deregister(gs_fd);
    routes.remove(gs_fd);
    if s.fd_in >= 0 {
        re.deregister(s.fd_in);
        routes.remove(s.fd_in);
    }
    if s.fd_out >= 0 && s.fd_out != s.fd_in {
        re.deregister(s.fd_out);
        routes.remove(s.fd_out);
    }
}
