//! Per-descriptor interest and parked continuations

use std::os::fd::RawFd;

use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// Direction a caller waits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Wait until the descriptor is readable
    Read,
    /// Wait until the descriptor is writable
    Write,
}

impl Direction {
    /// Interest bit for this direction
    #[inline]
    pub const fn interest(self) -> Interest {
        match self {
            Direction::Read => Interest::READABLE,
            Direction::Write => Interest::WRITABLE,
        }
    }
}

/// Interest flags indicating what readiness to monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u8);

impl Interest {
    /// No interest
    pub const NONE: Interest = Interest(0);
    /// Interest in readable events
    pub const READABLE: Interest = Interest(0b01);
    /// Interest in writable events
    pub const WRITABLE: Interest = Interest(0b10);

    /// Returns true if readable interest is set
    pub const fn is_readable(&self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    /// Returns true if writable interest is set
    pub const fn is_writable(&self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    /// Returns true if no bit is set
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Combines interests
    #[must_use]
    pub const fn add(self, other: Interest) -> Self {
        Interest(self.0 | other.0)
    }

    /// Removes interest
    #[must_use]
    pub const fn remove(self, other: Interest) -> Self {
        Interest(self.0 & !other.0)
    }
}

/// A parked waiter, resumed exactly once
#[derive(Debug)]
pub(crate) struct Continuation {
    id: u64,
    tx: oneshot::Sender<Result<()>>,
}

impl Continuation {
    pub(crate) fn new(id: u64, tx: oneshot::Sender<Result<()>>) -> Self {
        Self { id, tx }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Deliver the outcome. A waiter that already went away is ignored.
    pub(crate) fn resume(self, outcome: Result<()>) {
        let _ = self.tx.send(outcome);
    }
}

/// Interest set and continuations for one descriptor
///
/// A slot is occupied exactly when its interest bit is set.
#[derive(Debug)]
pub(crate) struct SocketRegistration {
    pub(crate) fd: RawFd,
    read: Option<Continuation>,
    write: Option<Continuation>,
    interest: Interest,
    /// Whether the descriptor is known to the poll backend
    pub(crate) registered: bool,
}

impl SocketRegistration {
    pub(crate) fn new(fd: RawFd) -> Self {
        Self {
            fd,
            read: None,
            write: None,
            interest: Interest::NONE,
            registered: false,
        }
    }

    #[inline]
    pub(crate) fn interest(&self) -> Interest {
        self.interest
    }

    fn slot(&mut self, direction: Direction) -> &mut Option<Continuation> {
        match direction {
            Direction::Read => &mut self.read,
            Direction::Write => &mut self.write,
        }
    }

    /// Park a continuation. An occupied slot hands it back untouched.
    pub(crate) fn install(
        &mut self,
        direction: Direction,
        continuation: Continuation,
    ) -> std::result::Result<(), Continuation> {
        let slot = self.slot(direction);
        if slot.is_some() {
            return Err(continuation);
        }
        *slot = Some(continuation);
        self.interest = self.interest.add(direction.interest());
        Ok(())
    }

    /// Remove the continuation for `direction` and clear its bit
    pub(crate) fn take(&mut self, direction: Direction) -> Option<Continuation> {
        let taken = self.slot(direction).take();
        self.interest = self.interest.remove(direction.interest());
        taken
    }

    /// Drop the continuation only if it is still the one with `id`
    pub(crate) fn cancel(&mut self, direction: Direction, id: u64) -> bool {
        match self.slot(direction) {
            Some(c) if c.id() == id => {
                self.take(direction);
                true
            }
            _ => false,
        }
    }

    /// Resume the continuations matching the reported readiness
    pub(crate) fn resume_ready(&mut self, readable: bool, writable: bool) -> usize {
        let mut resumed = 0;
        if readable {
            if let Some(c) = self.take(Direction::Read) {
                c.resume(Ok(()));
                resumed += 1;
            }
        }
        if writable {
            if let Some(c) = self.take(Direction::Write) {
                c.resume(Ok(()));
                resumed += 1;
            }
        }
        resumed
    }

    /// Fail every parked continuation with `err`
    pub(crate) fn fail_all(&mut self, err: &Error) -> usize {
        let mut failed = 0;
        for direction in [Direction::Read, Direction::Write] {
            if let Some(c) = self.take(direction) {
                c.resume(Err(err.clone()));
                failed += 1;
            }
        }
        failed
    }

    #[inline]
    pub(crate) fn is_idle(&self) -> bool {
        self.interest.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn continuation(id: u64) -> (Continuation, oneshot::Receiver<Result<()>>) {
        let (tx, rx) = oneshot::channel();
        (Continuation::new(id, tx), rx)
    }

    #[test]
    fn test_interest_ops() {
        let both = Interest::READABLE.add(Interest::WRITABLE);
        assert!(both.is_readable() && both.is_writable());
        assert_eq!(both.remove(Interest::READABLE), Interest::WRITABLE);
        assert!(Interest::NONE.is_empty());
        assert!(Direction::Write.interest().is_writable());
    }

    #[test]
    fn test_install_sets_bit() {
        let mut reg = SocketRegistration::new(7);
        let (c, _rx) = continuation(1);
        reg.install(Direction::Read, c).unwrap();
        assert!(reg.interest().is_readable());
        assert!(!reg.interest().is_writable());
        assert!(!reg.is_idle());
    }

    #[test]
    fn test_occupied_slot_rejects() {
        let mut reg = SocketRegistration::new(7);
        let (first, _rx1) = continuation(1);
        let (second, _rx2) = continuation(2);
        reg.install(Direction::Write, first).unwrap();
        let rejected = reg.install(Direction::Write, second).unwrap_err();
        assert_eq!(rejected.id(), 2);
    }

    #[test]
    fn test_resume_ready_only_matching() {
        let mut reg = SocketRegistration::new(7);
        let (r, mut read_rx) = continuation(1);
        let (w, mut write_rx) = continuation(2);
        reg.install(Direction::Read, r).unwrap();
        reg.install(Direction::Write, w).unwrap();

        assert_eq!(reg.resume_ready(false, true), 1);
        assert!(matches!(write_rx.try_recv(), Ok(Ok(()))));
        assert!(read_rx.try_recv().is_err());
        assert_eq!(reg.interest(), Interest::READABLE);
    }

    #[test]
    fn test_cancel_checks_id() {
        let mut reg = SocketRegistration::new(7);
        let (c, _rx) = continuation(5);
        reg.install(Direction::Read, c).unwrap();

        assert!(!reg.cancel(Direction::Read, 4));
        assert!(reg.interest().is_readable());
        assert!(reg.cancel(Direction::Read, 5));
        assert!(reg.is_idle());
    }

    #[test]
    fn test_fail_all() {
        let mut reg = SocketRegistration::new(7);
        let (r, mut rx) = continuation(1);
        reg.install(Direction::Read, r).unwrap();

        assert_eq!(reg.fail_all(&Error::SelectorClosed), 1);
        assert!(matches!(rx.try_recv(), Ok(Err(Error::SelectorClosed))));
        assert!(reg.is_idle());
    }
}
