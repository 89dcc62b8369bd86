//! OS readiness primitive behind the selector loop

use std::io;
use std::num::NonZeroUsize;
use std::os::fd::{BorrowedFd, RawFd};
use std::time::Duration;

use polling::{Event as PollEvent, Events, Poller};

use super::registration::Interest;

/// One readiness report from the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEvent {
    /// Key the descriptor was registered with
    pub key: usize,
    /// Descriptor is readable (or hung up)
    pub readable: bool,
    /// Descriptor is writable (or hung up)
    pub writable: bool,
}

/// Readiness multiplexer with oneshot semantics
///
/// After a descriptor is reported it stays registered but disarmed until
/// `modify` arms it again.
pub trait PollBackend: Send {
    /// Start watching `fd`
    fn add(&mut self, fd: RawFd, key: usize, interest: Interest) -> io::Result<()>;

    /// Re-arm `fd` with a new interest set
    fn modify(&mut self, fd: RawFd, key: usize, interest: Interest) -> io::Result<()>;

    /// Stop watching `fd`
    fn delete(&mut self, fd: RawFd) -> io::Result<()>;

    /// Block until readiness, a notification or the timeout
    fn wait(&mut self, events: &mut Vec<ReadyEvent>, timeout: Option<Duration>)
    -> io::Result<usize>;
}

/// Backend on the `polling` crate (epoll, kqueue, event ports)
#[derive(Debug)]
pub struct PollingBackend {
    poller: Poller,
    events: Events,
}

impl PollingBackend {
    /// Open the OS poll handle
    pub fn new(event_capacity: usize) -> io::Result<Self> {
        let capacity = NonZeroUsize::new(event_capacity).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            poller: Poller::new()?,
            events: Events::with_capacity(capacity),
        })
    }

    fn to_poll_event(key: usize, interest: Interest) -> PollEvent {
        match (interest.is_readable(), interest.is_writable()) {
            (true, true) => PollEvent::all(key),
            (true, false) => PollEvent::readable(key),
            (false, true) => PollEvent::writable(key),
            (false, false) => PollEvent::none(key),
        }
    }
}

impl PollBackend for PollingBackend {
    fn add(&mut self, fd: RawFd, key: usize, interest: Interest) -> io::Result<()> {
        // SAFETY: `PolledStream`'s Drop queues a deregistration and then
        // closes `fd`. epoll and kqueue forget a closed descriptor on their
        // own, and the command queue is FIFO, so the deregistration of a
        // reused number runs before any registration of its new owner.
        unsafe { self.poller.add(fd, Self::to_poll_event(key, interest)) }
    }

    fn modify(&mut self, fd: RawFd, key: usize, interest: Interest) -> io::Result<()> {
        // SAFETY: the borrow only lives for the syscall; a stale descriptor
        // yields an error rather than undefined behaviour.
        let source = unsafe { BorrowedFd::borrow_raw(fd) };
        self.poller.modify(source, Self::to_poll_event(key, interest))
    }

    fn delete(&mut self, fd: RawFd) -> io::Result<()> {
        // SAFETY: as in `modify`.
        let source = unsafe { BorrowedFd::borrow_raw(fd) };
        self.poller.delete(source)
    }

    fn wait(
        &mut self,
        events: &mut Vec<ReadyEvent>,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        self.events.clear();
        self.poller.wait(&mut self.events, timeout)?;

        let before = events.len();
        events.extend(self.events.iter().map(|ev| ReadyEvent {
            key: ev.key,
            readable: ev.readable,
            writable: ev.writable,
        }));
        Ok(events.len() - before)
    }
}
