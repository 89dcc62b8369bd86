//! WebSocket session over an established byte channel
//!
//! The session owns no handshake logic: it is handed a connected stream
//! (typically a [`PolledStream`](crate::selector::PolledStream) after an
//! HTTP upgrade) and speaks RFC 6455 framing over it.
//!
//! Received frames are pushed onto an unbounded inbound queue. Frames to
//! send are pushed onto an unbounded outbound queue through a
//! [`FrameSink`]. One spawned task runs the read and write loops; it ends
//! after the close handshake, a protocol error, end of stream or
//! cancellation, and records why in the session's close reason.
//!
//! # Example
//!
//! ```ignore
//! let mut session = WebSocketSession::new(stream, Role::Server, Config::default());
//! while let Some(frame) = session.recv().await {
//!     if frame.opcode() == OpCode::Text {
//!         session.send(frame)?;
//!     }
//! }
//! let reason = session.close_reason().await;
//! ```

mod channel;
mod driver;

pub use channel::{FrameSink, Incoming};

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::Config;
use crate::error::{CloseReason, Error, Result};
use crate::frame::Frame;
use crate::protocol::{Protocol, Role, SessionState};
use driver::Driver;

type CloseOutcome = Result<Option<CloseReason>>;

/// State shared by the session handle and its driver task
pub(crate) struct SessionShared {
    pub(crate) role: Role,
    pub(crate) protocol: Mutex<Protocol>,
    /// Set exactly once
    pub(crate) close_reason: watch::Sender<Option<CloseOutcome>>,
}

impl SessionShared {
    /// Record how the session ended. Later calls are ignored.
    pub(crate) fn complete(&self, outcome: CloseOutcome) -> bool {
        self.close_reason.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        })
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.close_reason.borrow().is_some()
    }

    /// Prepare and serialize one frame under the protocol lock
    pub(crate) fn encode(&self, frame: Frame, buf: &mut BytesMut) {
        let mut protocol = self.protocol.lock();
        let outbound = protocol.outbound(frame);
        protocol.encode(&outbound, buf);
    }
}

/// A negotiated protocol extension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    /// Extension token, e.g. `permessage-deflate`
    pub name: String,
    /// Parameters as `name` or `name=value`
    pub params: Vec<(String, Option<String>)>,
}

impl Extension {
    /// Extension without parameters
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }
}

/// Resolves to the reason the session ended
///
/// `Ok(Some(_))` for a close frame with a status code, `Ok(None)` for an
/// empty close frame, `Err(_)` when the session failed or was cancelled.
pub struct CloseReasonFuture {
    inner: Pin<Box<dyn Future<Output = CloseOutcome> + Send>>,
}

impl std::fmt::Debug for CloseReasonFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloseReasonFuture").finish_non_exhaustive()
    }
}

impl Future for CloseReasonFuture {
    type Output = CloseOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<CloseOutcome> {
        self.inner.as_mut().poll(cx)
    }
}

/// WebSocket session
///
/// Dropping the session cancels it: the peer receives a best-effort
/// `1011` close and the close reason becomes `Err(Cancelled)`.
pub struct WebSocketSession {
    shared: Arc<SessionShared>,
    incoming: Incoming,
    outgoing: FrameSink,
    cancel: CancellationToken,
    driver: Option<JoinHandle<()>>,
    close_requested: AtomicBool,
    extensions: Vec<Extension>,
}

impl std::fmt::Debug for WebSocketSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketSession")
            .field("role", &self.shared.role)
            .field("state", &self.state())
            .finish()
    }
}

impl WebSocketSession {
    /// Start a session over `io`
    ///
    /// Must be called from within a tokio runtime; the read and write loops
    /// run on a spawned task.
    pub fn new<IO>(io: IO, role: Role, config: Config) -> Self
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (close_tx, _) = watch::channel(None);
        let shared = Arc::new(SessionShared {
            role,
            protocol: Mutex::new(Protocol::new(role, config.max_frame_size)),
            close_reason: close_tx,
        });

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let driver = Driver {
            shared: shared.clone(),
            inbound: inbound_tx,
            outbound_tx: outbound_tx.clone(),
            outbound_rx,
            cancel: cancel.clone(),
            config,
        };
        let handle = tokio::spawn(driver.run(io));
        tracing::debug!(?role, "session started");

        Self {
            shared,
            incoming: Incoming::new(inbound_rx),
            outgoing: FrameSink::new(outbound_tx),
            cancel,
            driver: Some(handle),
            close_requested: AtomicBool::new(false),
            extensions: Vec::new(),
        }
    }

    /// Receive the next frame from the peer
    ///
    /// Returns `None` once the session has ended and all frames decoded
    /// before that point have been delivered.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.incoming.recv().await
    }

    /// Inbound queue as a `Stream`
    pub fn incoming(&mut self) -> &mut Incoming {
        &mut self.incoming
    }

    /// A producer handle for the outbound queue
    pub fn outgoing(&self) -> FrameSink {
        self.outgoing.clone()
    }

    /// Queue a frame for sending
    pub fn send(&self, frame: Frame) -> Result<()> {
        self.outgoing.send(frame)
    }

    /// Start the closing handshake. Only the first call queues a frame.
    pub fn close(&self, code: u16, reason: &str) {
        if self.close_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.shared.is_complete() {
            tracing::trace!(code, "close requested after session ended");
            return;
        }
        if self.outgoing.send(Frame::close(code, reason)).is_err() {
            tracing::trace!(code, "close requested after session ended");
        }
    }

    /// Why the session ended, once it has
    pub fn close_reason(&self) -> CloseReasonFuture {
        let mut rx = self.shared.close_reason.subscribe();
        CloseReasonFuture {
            inner: Box::pin(async move {
                match rx.wait_for(|v| v.is_some()).await {
                    Ok(outcome) => outcome
                        .clone()
                        .unwrap_or(Err(Error::ConnectionAbnormallyClosed)),
                    Err(_) => Err(Error::ConnectionAbnormallyClosed),
                }
            }),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.shared.protocol.lock().state()
    }

    /// Endpoint role
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Extensions in use (always empty, none are implemented)
    pub fn extensions(&self) -> &[Extension] {
        &self.extensions
    }

    /// Hook for installing negotiated extensions
    pub fn start(&mut self, extensions: &[Extension]) -> Result<()> {
        if !extensions.is_empty() {
            return Err(Error::CapabilityNotSupported("websocket extensions"));
        }
        Ok(())
    }

    /// Automatic ping interval
    pub fn ping_interval(&self) -> Result<Option<Duration>> {
        Err(Error::CapabilityNotSupported("ping interval"))
    }

    /// Set the automatic ping interval
    pub fn set_ping_interval(&mut self, _interval: Option<Duration>) -> Result<()> {
        Err(Error::CapabilityNotSupported("ping interval"))
    }

    /// Idle timeout
    pub fn timeout(&self) -> Result<Duration> {
        Err(Error::CapabilityNotSupported("timeout"))
    }

    /// Set the idle timeout
    pub fn set_timeout(&mut self, _timeout: Duration) -> Result<()> {
        Err(Error::CapabilityNotSupported("timeout"))
    }

    /// Whether outgoing frames are masked
    pub fn masking(&self) -> bool {
        self.shared.role.masks_outgoing()
    }

    /// Masking follows the role and cannot be changed
    pub fn set_masking(&mut self, _masking: bool) -> Result<()> {
        Err(Error::CapabilityNotSupported("changing masking"))
    }

    /// Largest accepted frame payload
    pub fn max_frame_size(&self) -> usize {
        self.shared.protocol.lock().max_frame_size()
    }

    /// The frame limit is fixed at construction
    pub fn set_max_frame_size(&mut self, _size: usize) -> Result<()> {
        Err(Error::CapabilityNotSupported("changing max frame size"))
    }

    /// Cancel the session, as if it were dropped
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel and stop the driver without waiting for the close frame
    pub fn terminate(&mut self) {
        self.cancel.cancel();
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
        self.shared.complete(Err(Error::Cancelled));
        self.shared.protocol.lock().terminate();
    }

    /// Wait for the driver task to finish
    pub async fn join(&mut self) {
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.await {
                if e.is_panic() {
                    tracing::error!("session driver panicked");
                }
            }
        }
    }
}

impl Drop for WebSocketSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
