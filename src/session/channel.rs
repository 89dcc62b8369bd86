//! Inbound and outbound frame queues

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use futures_sink::Sink;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::frame::Frame;

/// Frames received from the peer, in arrival order
///
/// Yields `None` once the session has finished and every decoded frame
/// has been taken.
#[derive(Debug)]
pub struct Incoming {
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl Incoming {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Frame>) -> Self {
        Self { rx }
    }

    /// Receive the next frame
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Take a frame if one is already queued
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Incoming {
    type Item = Frame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Frame>> {
        self.rx.poll_recv(cx)
    }
}

/// Producer side of the outbound queue
///
/// Cheap to clone. `send` never waits; frames are written by the session
/// in the order they were queued.
#[derive(Debug, Clone)]
pub struct FrameSink {
    tx: mpsc::UnboundedSender<Frame>,
}

impl FrameSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Frame>) -> Self {
        Self { tx }
    }

    /// Queue a frame for sending
    ///
    /// Fails with `ConnectionClosed` once the session has stopped writing.
    pub fn send(&self, frame: Frame) -> Result<()> {
        self.tx.send(frame).map_err(|_| Error::ConnectionClosed)
    }

    /// Whether the session has stopped accepting frames
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Sink<Frame> for FrameSink {
    type Error = Error;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        if self.tx.is_closed() {
            Poll::Ready(Err(Error::ConnectionClosed))
        } else {
            Poll::Ready(Ok(()))
        }
    }

    fn start_send(self: Pin<&mut Self>, item: Frame) -> Result<()> {
        self.send(item)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }
}
