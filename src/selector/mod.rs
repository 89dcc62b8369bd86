//! Readiness selector
//!
//! A single poll loop owns the OS poll handle and the table of
//! registrations. Other threads never touch either: they push commands on a
//! lock-free queue and poke the [`WakeupSignal`] so a blocked wait returns
//! and picks the commands up.
//!
//! ```ignore
//! let selector = Selector::new(SelectorConfig::default())?;
//! let readiness = selector.handle().register_interest(fd, Direction::Read)?;
//! readiness.await?; // fd is readable
//! ```

mod backend;
mod registration;
mod stream;
mod wakeup;

pub use backend::{PollBackend, PollingBackend, ReadyEvent};
pub use registration::{Direction, Interest};
pub use stream::{PolledStream, Socket};
pub use wakeup::WakeupSignal;

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_queue::SegQueue;
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use registration::{Continuation, SocketRegistration};

/// Poll key of the wakeup descriptor (`usize::MAX` is reserved by `polling`)
const WAKEUP_KEY: usize = usize::MAX - 1;

/// Selector configuration
#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// Events fetched per wait (default: 256)
    pub event_capacity: usize,
    /// Upper bound on a single wait, `None` blocks until readiness or wakeup
    pub poll_timeout: Option<Duration>,
    /// Name of the background thread (default: "pollframe-selector")
    pub thread_name: String,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            event_capacity: 256,
            poll_timeout: None,
            thread_name: "pollframe-selector".to_string(),
        }
    }
}

impl SelectorConfig {
    /// Create a new config builder
    pub fn builder() -> SelectorConfigBuilder {
        SelectorConfigBuilder::new()
    }
}

/// Builder for selector configuration
#[derive(Debug, Clone, Default)]
pub struct SelectorConfigBuilder {
    config: SelectorConfig,
}

impl SelectorConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of events fetched per wait
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    /// Bound each wait by `timeout`
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.config.poll_timeout = Some(timeout);
        self
    }

    /// Set the background thread name
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.thread_name = name.into();
        self
    }

    /// Build the configuration
    pub fn build(self) -> SelectorConfig {
        self.config
    }
}

enum Command {
    Register {
        fd: RawFd,
        direction: Direction,
        continuation: Continuation,
    },
    Cancel {
        fd: RawFd,
        direction: Direction,
        id: u64,
    },
    Deregister {
        fd: RawFd,
    },
}

impl Command {
    fn fail(self, err: &Error) {
        if let Command::Register { continuation, .. } = self {
            continuation.resume(Err(err.clone()));
        }
    }
}

struct Shared {
    commands: SegQueue<Command>,
    wakeup: WakeupSignal,
    closed: AtomicBool,
    next_id: AtomicU64,
    /// Continuations parked in the loop
    pending: AtomicUsize,
}

impl Shared {
    fn submit(&self, command: Command) {
        self.commands.push(command);
        self.wakeup.signal();

        // Lost the race with shutdown: nobody else will drain the queue
        if self.closed.load(Ordering::Acquire) {
            self.drain_closed();
        }
    }

    fn drain_closed(&self) {
        while let Some(command) = self.commands.pop() {
            command.fail(&Error::SelectorClosed);
        }
    }
}

/// Cloneable, thread-safe front end of a selector
#[derive(Clone)]
pub struct SelectorHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SelectorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectorHandle")
            .field("closed", &self.is_closed())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl SelectorHandle {
    /// Wait for `fd` to become ready in `direction`
    ///
    /// Fails immediately once the selector is closed. A second wait on the
    /// same descriptor and direction resolves to `AlreadyRegistered`.
    pub fn register_interest(&self, fd: RawFd, direction: Direction) -> Result<Readiness> {
        if self.is_closed() {
            return Err(Error::SelectorClosed);
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.submit(Command::Register {
            fd,
            direction,
            continuation: Continuation::new(id, tx),
        });

        Ok(Readiness {
            rx,
            fd,
            direction,
            id,
            shared: Some(self.shared.clone()),
        })
    }

    /// Forget `fd`, failing its pending waits with `Deregistered`
    pub fn deregister(&self, fd: RawFd) {
        if !self.is_closed() {
            self.shared.submit(Command::Deregister { fd });
        }
    }

    /// Ask the loop to shut down. Idempotent.
    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!("selector close requested");
            self.shared.wakeup.signal();
        }
    }

    /// Whether close was requested
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Continuations currently parked in the loop
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }
}

/// Resolves once the registered descriptor is ready
///
/// Dropping it before it resolves withdraws the interest.
#[must_use = "readiness does nothing unless awaited"]
pub struct Readiness {
    rx: oneshot::Receiver<Result<()>>,
    fd: RawFd,
    direction: Direction,
    id: u64,
    /// Present until the outcome is observed
    shared: Option<Arc<Shared>>,
}

impl std::fmt::Debug for Readiness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Readiness")
            .field("fd", &self.fd)
            .field("direction", &self.direction)
            .field("resolved", &self.shared.is_none())
            .finish()
    }
}

impl Future for Readiness {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let outcome = match Pin::new(&mut self.rx).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Ok(outcome)) => outcome,
            Poll::Ready(Err(_)) => Err(Error::SelectorClosed),
        };
        self.shared = None;
        Poll::Ready(outcome)
    }
}

impl Drop for Readiness {
    fn drop(&mut self) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        // Already resumed, just not observed
        if self.rx.try_recv().is_ok() {
            return;
        }
        if !shared.closed.load(Ordering::Acquire) {
            shared.submit(Command::Cancel {
                fd: self.fd,
                direction: self.direction,
                id: self.id,
            });
        }
    }
}

/// The poll loop: sole owner of the backend and the registration table
pub struct SelectorLoop {
    shared: Arc<Shared>,
    backend: Box<dyn PollBackend>,
    registrations: HashMap<RawFd, SocketRegistration>,
    events: Vec<ReadyEvent>,
    poll_timeout: Option<Duration>,
    shut_down: bool,
}

impl std::fmt::Debug for SelectorLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectorLoop")
            .field("registrations", &self.registrations.len())
            .field("shut_down", &self.shut_down)
            .finish()
    }
}

impl SelectorLoop {
    fn new(config: &SelectorConfig, mut backend: Box<dyn PollBackend>) -> Result<Self> {
        let wakeup = WakeupSignal::new()?;
        backend.add(wakeup.selection_fd(), WAKEUP_KEY, Interest::READABLE)?;

        let shared = Arc::new(Shared {
            commands: SegQueue::new(),
            wakeup,
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            pending: AtomicUsize::new(0),
        });

        Ok(Self {
            shared,
            backend,
            registrations: HashMap::new(),
            events: Vec::with_capacity(config.event_capacity),
            poll_timeout: config.poll_timeout,
            shut_down: false,
        })
    }

    fn handle(&self) -> SelectorHandle {
        SelectorHandle {
            shared: self.shared.clone(),
        }
    }

    /// Whether close was requested
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// One iteration: apply commands, wait, resume ready continuations
    ///
    /// Returns the number of continuations resumed. An interrupted wait
    /// counts as zero; any other backend error is returned and is fatal.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<usize> {
        if self.shut_down {
            return Err(Error::SelectorClosed);
        }
        self.apply_commands();

        let mut events = std::mem::take(&mut self.events);
        events.clear();
        match self.backend.wait(&mut events, timeout) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                self.events = events;
                return Ok(0);
            }
            Err(e) => {
                self.events = events;
                return Err(e.into());
            }
        }

        let mut resumed = 0;
        for event in &events {
            if event.key == WAKEUP_KEY {
                self.shared.wakeup.check()?;
                self.backend.modify(
                    self.shared.wakeup.selection_fd(),
                    WAKEUP_KEY,
                    Interest::READABLE,
                )?;
            } else {
                resumed += self.dispatch(event);
            }
        }
        self.events = events;

        // Commands whose wakeup was coalesced into the one just drained
        self.apply_commands();
        Ok(resumed)
    }

    /// Poll until close is requested, then shut down
    pub fn run(mut self) -> Result<()> {
        let timeout = self.poll_timeout;
        let result = loop {
            if self.is_closed() {
                break Ok(());
            }
            if let Err(e) = self.poll(timeout) {
                tracing::error!(error = %e, "selector poll failed");
                self.shared.closed.store(true, Ordering::Release);
                break Err(e);
            }
        };
        self.shutdown();
        result
    }

    fn dispatch(&mut self, event: &ReadyEvent) -> usize {
        let fd = event.key as RawFd;
        let Some(reg) = self.registrations.get_mut(&fd) else {
            return 0;
        };

        let resumed = reg.resume_ready(event.readable, event.writable);
        self.shared.pending.fetch_sub(resumed, Ordering::AcqRel);
        tracing::trace!(fd, resumed, "descriptor ready");

        if !reg.is_idle() {
            if let Err(e) = arm(self.backend.as_mut(), reg) {
                tracing::warn!(fd, error = %e, "failed to re-arm descriptor");
                let failed = reg.fail_all(&Error::from(e));
                self.shared.pending.fetch_sub(failed, Ordering::AcqRel);
            }
        }
        resumed
    }

    fn apply_commands(&mut self) {
        while let Some(command) = self.shared.commands.pop() {
            match command {
                Command::Register {
                    fd,
                    direction,
                    continuation,
                } => self.register(fd, direction, continuation),
                Command::Cancel { fd, direction, id } => self.cancel(fd, direction, id),
                Command::Deregister { fd } => self.deregister(fd),
            }
        }
    }

    fn register(&mut self, fd: RawFd, direction: Direction, continuation: Continuation) {
        let reg = self
            .registrations
            .entry(fd)
            .or_insert_with(|| SocketRegistration::new(fd));

        if let Err(rejected) = reg.install(direction, continuation) {
            tracing::debug!(fd, ?direction, "interest already registered");
            rejected.resume(Err(Error::AlreadyRegistered { fd, direction }));
            return;
        }
        self.shared.pending.fetch_add(1, Ordering::AcqRel);

        if let Err(e) = arm(self.backend.as_mut(), reg) {
            tracing::warn!(fd, ?direction, error = %e, "poll backend refused interest");
            if let Some(c) = reg.take(direction) {
                c.resume(Err(e.into()));
                self.shared.pending.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    fn cancel(&mut self, fd: RawFd, direction: Direction, id: u64) {
        let Some(reg) = self.registrations.get_mut(&fd) else {
            return;
        };
        if !reg.cancel(direction, id) {
            return;
        }
        self.shared.pending.fetch_sub(1, Ordering::AcqRel);
        tracing::trace!(fd, ?direction, "interest cancelled");

        if reg.registered {
            if let Err(e) = arm(self.backend.as_mut(), reg) {
                tracing::debug!(fd, error = %e, "failed to narrow interest");
            }
        }
    }

    fn deregister(&mut self, fd: RawFd) {
        let Some(mut reg) = self.registrations.remove(&fd) else {
            return;
        };
        let failed = reg.fail_all(&Error::Deregistered);
        self.shared.pending.fetch_sub(failed, Ordering::AcqRel);
        if reg.registered {
            // The descriptor may already be closed
            let _ = self.backend.delete(fd);
        }
        tracing::trace!(fd, "descriptor deregistered");
    }

    fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.shared.closed.store(true, Ordering::Release);

        for (fd, mut reg) in self.registrations.drain() {
            reg.fail_all(&Error::SelectorClosed);
            if reg.registered {
                let _ = self.backend.delete(fd);
            }
        }
        self.shared.drain_closed();
        self.shared.pending.store(0, Ordering::Release);

        let _ = self.backend.delete(self.shared.wakeup.selection_fd());
        self.shared.wakeup.close();
        tracing::debug!("selector shut down");
    }
}

impl Drop for SelectorLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Arm `reg`'s current interest, adding the descriptor if the backend lost it
fn arm(backend: &mut dyn PollBackend, reg: &mut SocketRegistration) -> io::Result<()> {
    let key = reg.fd as usize;
    let interest = reg.interest();

    if reg.registered {
        match backend.modify(reg.fd, key, interest) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => backend.add(reg.fd, key, interest),
            other => other,
        }
    } else {
        match backend.add(reg.fd, key, interest) {
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                backend.modify(reg.fd, key, interest)
            }
            other => other,
        }?;
        reg.registered = true;
        Ok(())
    }
}

/// A selector driven by its own background thread
#[derive(Debug)]
pub struct Selector {
    handle: SelectorHandle,
    worker: Option<JoinHandle<()>>,
}

impl Selector {
    /// Start a selector on a dedicated thread
    pub fn new(config: SelectorConfig) -> Result<Self> {
        let (handle, selector_loop) = Self::manual(config.clone())?;

        let worker = std::thread::Builder::new()
            .name(config.thread_name)
            .spawn(move || {
                if let Err(e) = selector_loop.run() {
                    tracing::error!(error = %e, "selector loop terminated");
                }
            })?;

        Ok(Self {
            handle,
            worker: Some(worker),
        })
    }

    /// Create a selector whose loop the caller drives
    pub fn manual(config: SelectorConfig) -> Result<(SelectorHandle, SelectorLoop)> {
        let backend = PollingBackend::new(config.event_capacity)?;
        Self::with_backend(config, Box::new(backend))
    }

    /// Create a caller-driven selector over a custom backend
    pub fn with_backend(
        config: SelectorConfig,
        backend: Box<dyn PollBackend>,
    ) -> Result<(SelectorHandle, SelectorLoop)> {
        let selector_loop = SelectorLoop::new(&config, backend)?;
        Ok((selector_loop.handle(), selector_loop))
    }

    /// Handle for registering interest from any thread
    #[inline]
    pub fn handle(&self) -> SelectorHandle {
        self.handle.clone()
    }

    /// See [`SelectorHandle::register_interest`]
    #[inline]
    pub fn register_interest(&self, fd: RawFd, direction: Direction) -> Result<Readiness> {
        self.handle.register_interest(fd, direction)
    }

    /// Whether close was requested
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Stop the loop and join its thread. Idempotent.
    pub fn close(&mut self) {
        self.handle.close();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("selector thread panicked");
            }
        }
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        self.close();
    }
}
