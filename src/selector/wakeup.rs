//! Self-wakeup for a blocked poll
//!
//! A non-blocking socket pair whose read end is registered with the poll
//! backend. Writing one byte makes the blocked wait return. The counter of
//! outstanding bytes coalesces bursts of signals into a single byte.

use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};

/// Cross-thread wakeup for the selector loop
#[derive(Debug)]
pub struct WakeupSignal {
    reader: UnixStream,
    writer: UnixStream,
    /// Bytes written but not yet drained. May dip below zero when a drain
    /// races a concurrent `signal`.
    outstanding: AtomicIsize,
    closed: AtomicBool,
}

impl WakeupSignal {
    /// Create the socket pair, both ends non-blocking
    pub fn new() -> io::Result<Self> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;

        Ok(Self {
            reader,
            writer,
            outstanding: AtomicIsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Descriptor the poll backend watches for readability
    #[inline]
    pub fn selection_fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }

    /// Outstanding byte count
    #[inline]
    pub fn pending(&self) -> isize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Wake the poll loop
    ///
    /// Never blocks. A no-op while a previous wakeup is still undrained.
    /// Write failures (full buffer, closed pair) are ignored: either a byte
    /// is already queued or the loop is gone.
    pub fn signal(&self) {
        if self.outstanding.load(Ordering::Acquire) > 0 {
            return;
        }

        match (&self.writer).write(&[1]) {
            Ok(n) => {
                self.outstanding.fetch_add(n as isize, Ordering::AcqRel);
            }
            Err(e) => tracing::trace!(error = %e, "wakeup write skipped"),
        }
    }

    /// Drain queued wakeup bytes
    ///
    /// Returns any read error other than `WouldBlock`.
    pub fn check(&self) -> io::Result<()> {
        let mut scratch = [0u8; 64];

        while self.outstanding.load(Ordering::Acquire) > 0 {
            match (&self.reader).read(&mut scratch) {
                Ok(0) => break,
                Ok(n) => {
                    self.outstanding.fetch_sub(n as isize, Ordering::AcqRel);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Release the pair. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let _ = self.writer.shutdown(Shutdown::Write);
        if let Err(e) = self.check() {
            tracing::debug!(error = %e, "final wakeup drain failed");
        }
        let _ = self.reader.shutdown(Shutdown::Read);
    }

    /// Whether `close` has run
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for WakeupSignal {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_then_check() {
        let wakeup = WakeupSignal::new().unwrap();
        wakeup.signal();
        assert_eq!(wakeup.pending(), 1);

        wakeup.check().unwrap();
        assert_eq!(wakeup.pending(), 0);
    }

    #[test]
    fn test_signals_coalesce() {
        let wakeup = WakeupSignal::new().unwrap();
        for _ in 0..10 {
            wakeup.signal();
        }
        assert_eq!(wakeup.pending(), 1);

        wakeup.check().unwrap();
        assert_eq!(wakeup.pending(), 0);

        // Nothing left in the pipe
        let mut byte = [0u8; 1];
        let err = (&wakeup.reader).read(&mut byte).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_check_without_signal() {
        let wakeup = WakeupSignal::new().unwrap();
        wakeup.check().unwrap();
        assert_eq!(wakeup.pending(), 0);
    }

    #[test]
    fn test_close_is_idempotent() {
        let wakeup = WakeupSignal::new().unwrap();
        wakeup.signal();
        wakeup.close();
        wakeup.close();
        assert!(wakeup.is_closed());
        assert_eq!(wakeup.pending(), 0);

        // Signalling a closed pair is silently ignored
        wakeup.signal();
        assert_eq!(wakeup.pending(), 0);
    }
}
