//! The rendezvous transport contract.
//!
//! The relay engine moves bytes between local descriptors and a "GS"
//! endpoint: a duplex byte stream that pairs two NAT'd peers through a
//! rendezvous point. The engine never looks inside the transport; it only
//! consumes the traits and result taxonomy defined here.
//!
//! [`tcp::TcpGs`] implements the contract over a plain TCP connection to a
//! fixed rendezvous address. The real Global Socket machinery (key
//! agreement, broker rendezvous, retransmission) lives behind the same
//! interface and is out of scope here.

pub mod tcp;

use std::{io, os::fd::RawFd, time::Instant};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GsError {
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("no server is listening at the rendezvous point")]
    Refused,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Outcome of a transport read.
#[derive(Debug)]
pub enum GsRead {
    Data(usize),
    /// No progress; retry on read readiness.
    WouldBlock,
    /// The pending read cannot progress until the descriptor is writable.
    /// The caller must park its read intent and install a writable waiter.
    WantWrite,
    /// Orderly end of stream. Reported at most once; once the local write
    /// direction has also been shut, further reads are `Fatal`.
    Eof,
    Fatal(GsError),
}

/// Outcome of a transport write. Writes are atomic per call: either the
/// whole batch is accepted or no progress is made. After `WouldBlock` the
/// caller must retry with the identical batch.
#[derive(Debug)]
pub enum GsWrite {
    Done(usize),
    WouldBlock,
    Fatal(GsError),
}

/// Outcome of one connect step.
#[derive(Debug)]
pub enum GsConnect {
    Connected,
    Waiting,
    Fatal(GsError),
}

/// Outcome of one accept attempt.
pub enum GsAccept<S> {
    Stream(S),
    /// Not ready yet; protocol bytes may have been consumed.
    NotReady,
    Fatal(GsError),
}

/// Per-endpoint statistics, maintained by the transport.
#[derive(Debug, Default)]
pub struct GsStats {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub connected_at: Option<Instant>,
}

/// A connected (or connecting) rendezvous endpoint. Dropping the stream
/// closes it; every endpoint is owned by exactly one session.
pub trait GsStream {
    fn read(&mut self, buf: &mut [u8]) -> GsRead;
    fn write(&mut self, buf: &[u8]) -> GsWrite;

    /// Drives an in-progress connect. Call on readiness until it stops
    /// returning [`GsConnect::Waiting`].
    fn connect_step(&mut self) -> GsConnect;

    /// Half-closes the write direction. `Err` means the peer's EOF had
    /// already been seen, i.e. both directions are now down and the session
    /// should not stay alive for this endpoint.
    fn shutdown(&mut self) -> Result<(), GsError>;

    fn raw_fd(&self) -> RawFd;
    fn stats(&self) -> &GsStats;

    /// Human-readable description of the last fatal error, for log lines.
    fn last_error(&self) -> Option<&str>;
}

pub trait GsListener {
    type Stream: GsStream;

    fn accept(&mut self) -> GsAccept<Self::Stream>;

    /// Invoked once per reactor tick.
    fn heartbeat(&mut self);

    fn raw_fd(&self) -> RawFd;
}

/// Factory tying a stream and listener implementation together.
pub trait GsTransport {
    type Stream: GsStream;
    type Listener: GsListener<Stream = Self::Stream>;

    /// Starts a non-blocking connect towards the rendezvous point.
    fn connect(&self) -> io::Result<Self::Stream>;

    /// Binds the rendezvous point. Failure here is fatal to the process.
    fn listen(&self) -> io::Result<Self::Listener>;
}
