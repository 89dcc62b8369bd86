//! Byte stream driven by the selector
//!
//! Wraps a non-blocking socket and implements tokio's `AsyncRead` and
//! `AsyncWrite`. A `WouldBlock` parks the task on a [`Readiness`] for the
//! matching direction instead of on tokio's own reactor.

use std::future::Future;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::{Direction, Readiness, SelectorHandle};

/// A socket the selector can drive
pub trait Socket: Read + Write + AsRawFd {
    /// Switch the socket into non-blocking mode
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;

    /// Half-close the write side
    fn shutdown_write(&self) -> io::Result<()>;
}

impl Socket for TcpStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        TcpStream::set_nonblocking(self, nonblocking)
    }

    fn shutdown_write(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Write)
    }
}

impl Socket for UnixStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        UnixStream::set_nonblocking(self, nonblocking)
    }

    fn shutdown_write(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Write)
    }
}

/// Selector-backed async socket
#[derive(Debug)]
pub struct PolledStream<S: Socket> {
    io: S,
    fd: RawFd,
    handle: SelectorHandle,
    read_wait: Option<Readiness>,
    write_wait: Option<Readiness>,
}

impl PolledStream<TcpStream> {
    /// Drive a TCP stream through `handle`
    pub fn tcp(stream: TcpStream, handle: SelectorHandle) -> io::Result<Self> {
        Self::new(stream, handle)
    }
}

impl PolledStream<UnixStream> {
    /// Drive a Unix domain stream through `handle`
    pub fn unix(stream: UnixStream, handle: SelectorHandle) -> io::Result<Self> {
        Self::new(stream, handle)
    }
}

impl<S: Socket> PolledStream<S> {
    /// Put `io` in non-blocking mode and drive it through `handle`
    pub fn new(io: S, handle: SelectorHandle) -> io::Result<Self> {
        io.set_nonblocking(true)?;
        let fd = io.as_raw_fd();
        Ok(Self {
            io,
            fd,
            handle,
            read_wait: None,
            write_wait: None,
        })
    }

    /// Borrow the wrapped socket
    pub fn get_ref(&self) -> &S {
        &self.io
    }

    fn wait_slot(&mut self, direction: Direction) -> &mut Option<Readiness> {
        match direction {
            Direction::Read => &mut self.read_wait,
            Direction::Write => &mut self.write_wait,
        }
    }

    /// Resolve any outstanding wait for `direction`
    fn poll_wait(&mut self, direction: Direction, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let slot = self.wait_slot(direction);
        if let Some(wait) = slot.as_mut() {
            let outcome = ready!(Pin::new(wait).poll(cx));
            *slot = None;
            outcome?;
        }
        Poll::Ready(Ok(()))
    }

    fn park(&mut self, direction: Direction) -> io::Result<()> {
        let readiness = self.handle.register_interest(self.fd, direction)?;
        *self.wait_slot(direction) = Some(readiness);
        Ok(())
    }

    /// Run `op` until it stops returning `WouldBlock`, parking in between
    fn poll_io<T>(
        &mut self,
        direction: Direction,
        cx: &mut Context<'_>,
        mut op: impl FnMut(&mut S) -> io::Result<T>,
    ) -> Poll<io::Result<T>> {
        loop {
            ready!(self.poll_wait(direction, cx))?;

            match op(&mut self.io) {
                Ok(value) => return Poll::Ready(Ok(value)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.park(direction)?,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Poll::Ready(Err(e)),
            }
        }
    }
}

impl<S: Socket + Unpin> AsyncRead for PolledStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let n = ready!(this.poll_io(Direction::Read, cx, |io| io.read(buf.initialize_unfilled())))?;
        buf.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl<S: Socket + Unpin> AsyncWrite for PolledStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut()
            .poll_io(Direction::Write, cx, |io| io.write(buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_io(Direction::Write, cx, |io| io.flush())
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.io.shutdown_write() {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Poll::Ready(Err(e)),
            _ => Poll::Ready(Ok(())),
        }
    }
}

impl<S: Socket> Drop for PolledStream<S> {
    fn drop(&mut self) {
        // Runs on the loop after `io` closes the descriptor. A later owner of
        // the same number can only register behind this command.
        self.handle.deregister(self.fd);
    }
}
