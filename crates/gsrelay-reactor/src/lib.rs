//! Single-threaded readiness reactor.
//!
//! Wraps a `mio::Poll` behind an fd-keyed interest table. Sessions toggle
//! read/write interest per descriptor; the run loop collects readiness into
//! plain `Readiness` records so callers never hold a borrow of the reactor
//! while dispatching.
//!
//! Registration goes through `SourceFd`, so interest can be changed with
//! nothing but the raw descriptor. Descriptors that the kernel refuses to
//! poll (regular files on epoll, e.g. stdin redirected from a file) are
//! tracked as permanently ready and surfaced as synthetic events.

use std::{
    io,
    os::fd::RawFd,
    time::{Duration, Instant},
};

use gsrelay_utils::soft_assert;
use mio::{Events, Interest, Poll, Token, unix::SourceFd};
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("descriptor {0} exceeds reactor capacity {1}")]
    CapacityExceeded(RawFd, usize),
    #[error("descriptor {0} is not registered")]
    NotRegistered(RawFd),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<ReactorError> for io::Error {
    fn from(e: ReactorError) -> Self {
        match e {
            ReactorError::Io(e) => e,
            other => io::Error::other(other.to_string()),
        }
    }
}

/// One collected readiness event, detached from the poll so the caller can
/// mutate the reactor while handling it.
#[derive(Clone, Copy, Debug)]
pub struct Readiness {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
}

#[derive(Clone, Copy, Default)]
struct Slot {
    claimed: bool,
    /// Currently registered with the poll (some interest is set).
    armed: bool,
    read: bool,
    write: bool,
    /// Read interest is parked because the owner reported that its pending
    /// read is blocked on writability.
    parked: bool,
    /// Read intent remembered while parked.
    saved_read: bool,
    /// Kernel refused to poll this fd; treat it as permanently ready.
    always_ready: bool,
}

impl Slot {
    fn interest(&self) -> Option<Interest> {
        match (self.read, self.write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

pub struct Reactor {
    poll: Poll,
    events: Events,
    slots: Box<[Slot]>,
    tick_every: Duration,
    next_tick: Instant,
    exit: Option<i32>,
}

pub const DEFAULT_CAPACITY: usize = 1024;

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(256),
            slots: vec![Slot::default(); capacity].into_boxed_slice(),
            tick_every: Duration::from_secs(1),
            next_tick: Instant::now() + Duration::from_secs(1),
            exit: None,
        })
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick_every = tick;
        self.next_tick = Instant::now() + tick;
        self
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claims a slot for `fd`. No poll registration happens until an
    /// interest is enabled.
    pub fn register(&mut self, fd: RawFd) -> Result<(), ReactorError> {
        let slot = self.slot_mut(fd)?;
        soft_assert!(!slot.claimed, "fd {fd} registered twice");
        *slot = Slot { claimed: true, ..Slot::default() };
        Ok(())
    }

    /// Drops the slot and removes the fd from the poll.
    pub fn deregister(&mut self, fd: RawFd) {
        let Some(slot) = self.slots.get_mut(fd as usize) else {
            return;
        };
        if slot.armed && !slot.always_ready {
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        }
        *slot = Slot::default();
    }

    pub fn enable_read(&mut self, fd: RawFd) -> Result<(), ReactorError> {
        let slot = self.claimed_slot_mut(fd)?;
        if slot.parked {
            slot.saved_read = true;
            return Ok(());
        }
        if !slot.read {
            slot.read = true;
            self.sync(fd)?;
        }
        Ok(())
    }

    pub fn disable_read(&mut self, fd: RawFd) -> Result<(), ReactorError> {
        let slot = self.claimed_slot_mut(fd)?;
        if slot.parked {
            slot.saved_read = false;
            return Ok(());
        }
        if slot.read {
            slot.read = false;
            self.sync(fd)?;
        }
        Ok(())
    }

    pub fn enable_write(&mut self, fd: RawFd) -> Result<(), ReactorError> {
        let slot = self.claimed_slot_mut(fd)?;
        if !slot.write {
            slot.write = true;
            self.sync(fd)?;
        }
        Ok(())
    }

    pub fn disable_write(&mut self, fd: RawFd) -> Result<(), ReactorError> {
        let slot = self.claimed_slot_mut(fd)?;
        if slot.write {
            slot.write = false;
            self.sync(fd)?;
        }
        Ok(())
    }

    /// The owner's pending read cannot make progress until the fd becomes
    /// writable. Remembers the read intent, drops read interest and arms
    /// write interest.
    pub fn read_blocked_on_write(&mut self, fd: RawFd) -> Result<(), ReactorError> {
        let slot = self.claimed_slot_mut(fd)?;
        if !slot.parked {
            slot.parked = true;
            slot.saved_read = slot.read;
        }
        slot.read = false;
        slot.write = true;
        self.sync(fd)
    }

    /// The blocked read completed; restore whatever read intent accumulated
    /// while parked. Write interest is left to the owner.
    pub fn read_unblocked(&mut self, fd: RawFd) -> Result<(), ReactorError> {
        let slot = self.claimed_slot_mut(fd)?;
        if !slot.parked {
            return Ok(());
        }
        slot.parked = false;
        slot.read = slot.saved_read;
        slot.saved_read = false;
        self.sync(fd)
    }

    pub fn is_parked(&self, fd: RawFd) -> bool {
        self.slots.get(fd as usize).is_some_and(|s| s.parked)
    }

    pub fn wants_read(&self, fd: RawFd) -> bool {
        self.slots.get(fd as usize).is_some_and(|s| s.read)
    }

    pub fn wants_write(&self, fd: RawFd) -> bool {
        self.slots.get(fd as usize).is_some_and(|s| s.write)
    }

    /// Terminate the run loop with `code` after the current event batch.
    /// The first requested code wins.
    pub fn request_exit(&mut self, code: i32) {
        if self.exit.is_none() {
            self.exit = Some(code);
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit
    }

    /// Waits for readiness or the next tick and appends collected events to
    /// `out`. Returns whether the tick fired. `EINTR` is swallowed.
    pub fn poll_collect(&mut self, out: &mut Vec<Readiness>) -> io::Result<bool> {
        out.clear();

        let mut timeout = self.next_tick.saturating_duration_since(Instant::now());
        if self.any_always_ready_armed() {
            timeout = Duration::ZERO;
        }

        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }

        for ev in self.events.iter() {
            let fd = ev.token().0 as RawFd;
            let Some(slot) = self.slots.get(fd as usize) else {
                continue;
            };
            if !slot.claimed {
                continue;
            }
            let readable = ev.is_readable() || ev.is_read_closed();
            let writable = ev.is_writable() || ev.is_write_closed();
            if readable || writable {
                out.push(Readiness { fd, readable, writable });
            }
        }

        // Descriptors epoll refuses (regular files) are level-ready forever.
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.claimed && slot.always_ready && (slot.read || slot.write) {
                out.push(Readiness { fd: i as RawFd, readable: slot.read, writable: slot.write });
            }
        }

        let now = Instant::now();
        if now >= self.next_tick {
            self.next_tick = now + self.tick_every;
            return Ok(true);
        }
        Ok(false)
    }

    fn any_always_ready_armed(&self) -> bool {
        self.slots.iter().any(|s| s.claimed && s.always_ready && (s.read || s.write))
    }

    fn slot_mut(&mut self, fd: RawFd) -> Result<&mut Slot, ReactorError> {
        let capacity = self.slots.len();
        if fd < 0 || fd as usize >= capacity {
            return Err(ReactorError::CapacityExceeded(fd, capacity));
        }
        Ok(&mut self.slots[fd as usize])
    }

    fn claimed_slot_mut(&mut self, fd: RawFd) -> Result<&mut Slot, ReactorError> {
        let slot = self.slot_mut(fd)?;
        if !slot.claimed {
            return Err(ReactorError::NotRegistered(fd));
        }
        Ok(slot)
    }

    /// Pushes the slot's interest down into the poll, registering or
    /// deregistering as needed.
    fn sync(&mut self, fd: RawFd) -> Result<(), ReactorError> {
        let slot = self.slots[fd as usize];
        if slot.always_ready {
            return Ok(());
        }
        let registry = self.poll.registry();
        match (slot.interest(), slot.armed) {
            (Some(interest), true) => {
                registry.reregister(&mut SourceFd(&fd), Token(fd as usize), interest)?;
            }
            (Some(interest), false) => {
                match registry.register(&mut SourceFd(&fd), Token(fd as usize), interest) {
                    Ok(()) => {}
                    Err(e) if e.raw_os_error() == Some(libc::EPERM) => {
                        trace!(fd, "fd not pollable, marking always-ready");
                        self.slots[fd as usize].always_ready = true;
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                }
                self.slots[fd as usize].armed = true;
            }
            (None, true) => {
                registry.deregister(&mut SourceFd(&fd))?;
                self.slots[fd as usize].armed = false;
            }
            (None, false) => {}
        }
        Ok(())
    }
}
