//! Read and write loops of a session
//!
//! Both loops run inside one spawned task (`tokio::join!`), so they never
//! execute at the same instant: whatever the read loop does between two
//! awaits is observed by the write loop as a single step.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::SessionShared;
use crate::Config;
use crate::error::{CloseReason, Error};
use crate::frame::{Frame, OpCode};
use crate::protocol::Inbound;

/// Reason carried by the close sent when the owning task goes away
pub(crate) const CANCEL_REASON: &str = "Client failed";

pub(crate) struct Driver {
    pub(crate) shared: Arc<SessionShared>,
    pub(crate) inbound: mpsc::UnboundedSender<Frame>,
    pub(crate) outbound_tx: mpsc::UnboundedSender<Frame>,
    pub(crate) outbound_rx: mpsc::UnboundedReceiver<Frame>,
    pub(crate) cancel: CancellationToken,
    pub(crate) config: Config,
}

impl Driver {
    pub(crate) async fn run<IO>(self, io: IO)
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        let Driver {
            shared,
            inbound,
            outbound_tx,
            outbound_rx,
            cancel,
            config,
        } = self;

        let (reader, writer) = tokio::io::split(io);
        tokio::join!(
            read_loop(reader, &shared, inbound, outbound_tx, &cancel, &config),
            write_loop(writer, &shared, outbound_rx, &cancel, &config),
        );

        shared.protocol.lock().terminate();
        shared.complete(Err(Error::ConnectionAbnormallyClosed));
        tracing::debug!(role = ?shared.role, "session finished");
    }
}

async fn read_loop<R>(
    mut reader: R,
    shared: &SessionShared,
    inbound: mpsc::UnboundedSender<Frame>,
    outbound: mpsc::UnboundedSender<Frame>,
    cancel: &CancellationToken,
    config: &Config,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(config.read_buffer_size);
    let mut close_rx = shared.close_reason.subscribe();

    loop {
        loop {
            let decoded = shared.protocol.lock().decode(&mut buf);
            match decoded {
                Ok(Some(frame)) => {
                    if !dispatch(frame, shared, &inbound, &outbound, config) {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(error = %e, code = e.close_code(), "frame decode failed");
                    shared.complete(Err(e.clone()));
                    let _ = outbound.send(Frame::close(e.close_code(), ""));
                    return;
                }
            }
        }

        if buf.capacity() - buf.len() < crate::MAX_FRAME_HEADER_SIZE {
            buf.reserve(config.read_buffer_size);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                shared.complete(Err(Error::Cancelled));
                return;
            }
            _ = async { close_rx.wait_for(|v| v.is_some()).await.is_ok() } => return,
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => {
                    tracing::debug!("stream ended without a close frame");
                    shared.complete(Err(Error::ConnectionAbnormallyClosed));
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(error = %e, "read failed");
                    shared.complete(Err(e.into()));
                    return;
                }
            },
        }
    }
}

/// Route one decoded frame. Returns false once reading should stop.
fn dispatch(
    frame: Inbound,
    shared: &SessionShared,
    inbound: &mpsc::UnboundedSender<Frame>,
    outbound: &mpsc::UnboundedSender<Frame>,
    config: &Config,
) -> bool {
    match frame {
        Inbound::Data(frame) => {
            let _ = inbound.send(frame);
        }
        Inbound::Ping { frame, reply } => {
            tracing::trace!(len = frame.payload.len(), "ping received");
            let _ = outbound.send(reply);
            if config.surface_control_frames {
                let _ = inbound.send(frame);
            }
        }
        Inbound::Pong(frame) => {
            if config.surface_control_frames {
                let _ = inbound.send(frame);
            }
        }
        Inbound::Close {
            frame,
            reason,
            reply,
        } => {
            tracing::debug!(code = reason.as_ref().map(|r| r.code), "close received");
            shared.complete(Ok(reason));
            let _ = inbound.send(frame);
            if let Some(reply) = reply {
                let _ = outbound.send(reply);
            }
            return false;
        }
    }
    true
}

async fn write_loop<W>(
    mut writer: W,
    shared: &SessionShared,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    cancel: &CancellationToken,
    config: &Config,
) where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(config.write_buffer_size);
    let mut close_rx = shared.close_reason.subscribe();

    // Whether cancellation cut a write short, leaving a partial frame behind
    let torn = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break false,
            _ = async { close_rx.wait_for(|v| v.is_some()).await.is_ok() } => {
                buf.clear();
                drain_queued(&mut rx, shared, &mut buf);
                match flush_or_cancel(&mut writer, &buf, cancel).await {
                    Flushed::Done => {}
                    Flushed::Cancelled => break true,
                    Flushed::Failed(e) => tracing::debug!(error = %e, "final write failed"),
                }
                finish(&mut writer, &[], config.close_timeout).await;
                return;
            }
            next = rx.recv() => {
                let Some(frame) = next else { return };

                buf.clear();
                let mut closing = write_batch(frame, shared, &mut buf);
                while closing.is_none() && buf.len() < config.write_buffer_size {
                    match rx.try_recv() {
                        Ok(frame) => closing = write_batch(frame, shared, &mut buf),
                        Err(_) => break,
                    }
                }

                let closed = closing.is_some();
                if let Some(reason) = closing {
                    shared.complete(Ok(reason));
                }

                match flush_or_cancel(&mut writer, &buf, cancel).await {
                    Flushed::Done => {}
                    Flushed::Cancelled => break true,
                    Flushed::Failed(e) => {
                        tracing::debug!(error = %e, "write failed");
                        shared.complete(Err(e.into()));
                        return;
                    }
                }

                if closed {
                    finish(&mut writer, &[], config.close_timeout).await;
                    return;
                }
            }
        }
    };

    shared.complete(Err(Error::Cancelled));
    let ended_by_cancel = matches!(*shared.close_reason.borrow(), Some(Err(Error::Cancelled)));
    let close_sent = shared.protocol.lock().close_sent();

    buf.clear();
    if ended_by_cancel && !close_sent && !torn {
        let frame = Frame::close(CloseReason::INTERNAL, CANCEL_REASON);
        shared.encode(frame, &mut buf);
    } else if torn {
        tracing::debug!("write interrupted mid-frame, no close sent");
    }
    finish(&mut writer, &buf, config.close_timeout).await;
}

/// Encode what is still queued once the session has ended elsewhere.
///
/// After a close handshake every queued frame goes out in order up to and
/// including the reply. After a failure only a queued close is kept.
fn drain_queued(
    rx: &mut mpsc::UnboundedReceiver<Frame>,
    shared: &SessionShared,
    buf: &mut BytesMut,
) {
    let graceful = matches!(*shared.close_reason.borrow(), Some(Ok(_)));
    while let Ok(frame) = rx.try_recv() {
        let is_close = frame.opcode() == OpCode::Close;
        if graceful || is_close {
            shared.encode(frame, buf);
        }
        if is_close {
            break;
        }
    }
}

/// Encode one queued frame, returning its reason if it was a close
fn write_batch(
    frame: Frame,
    shared: &SessionShared,
    buf: &mut BytesMut,
) -> Option<Option<CloseReason>> {
    let closing = (frame.opcode() == OpCode::Close).then(|| raw_close_reason(&frame));
    shared.encode(frame, buf);
    closing
}

/// Code and reason as the caller queued them, before any wire rewriting
fn raw_close_reason(frame: &Frame) -> Option<CloseReason> {
    if frame.payload.len() < 2 {
        return None;
    }
    let code = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
    let reason = String::from_utf8_lossy(&frame.payload[2..]).into_owned();
    Some(CloseReason::new(code, reason))
}

enum Flushed {
    Done,
    Cancelled,
    Failed(io::Error),
}

async fn write_flush<W: AsyncWrite + Unpin>(writer: &mut W, buf: &[u8]) -> io::Result<()> {
    writer.write_all(buf).await?;
    writer.flush().await
}

/// Write `buf` unless the session is cancelled first
async fn flush_or_cancel<W: AsyncWrite + Unpin>(
    writer: &mut W,
    buf: &[u8],
    cancel: &CancellationToken,
) -> Flushed {
    if buf.is_empty() {
        return Flushed::Done;
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Flushed::Cancelled,
        res = write_flush(writer, buf) => match res {
            Ok(()) => Flushed::Done,
            Err(e) => Flushed::Failed(e),
        },
    }
}

/// Write the final bytes and half-close within `limit`, ignoring failures
async fn finish<W: AsyncWrite + Unpin>(writer: &mut W, buf: &[u8], limit: Duration) {
    let last = async {
        if !buf.is_empty() {
            write_flush(writer, buf).await?;
        }
        writer.shutdown().await
    };
    match tokio::time::timeout(limit, last).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!(error = %e, "final write failed"),
        Err(_) => tracing::debug!(?limit, "final write timed out"),
    }
}
