//! # pollframe: readiness selector and WebSocket framing core
//!
//! Two building blocks for HTTP client/server stacks that need to drive
//! sockets themselves:
//!
//! - **Selector**: one poll loop (epoll/kqueue through `polling`) that parks
//!   tasks until a descriptor is readable or writable. Registrations from
//!   any thread are handed over through a lock-free queue plus a self-pipe
//!   wakeup, so the loop is the only owner of OS poll state.
//! - **WebSocket session**: RFC 6455 framing over any `AsyncRead +
//!   AsyncWrite` channel with unbounded inbound/outbound frame queues,
//!   automatic PONG replies, the close handshake and a one-shot close
//!   reason.
//!
//! ## Example
//!
//! ```ignore
//! use pollframe::prelude::*;
//!
//! let selector = Selector::new(SelectorConfig::default())?;
//! let stream = PolledStream::tcp(upgraded_tcp_stream, selector.handle())?;
//! let mut session = WebSocketSession::new(stream, Role::Client, Config::default());
//!
//! session.send(Frame::text("hello"))?;
//! while let Some(frame) = session.recv().await {
//!     println!("{:?}", frame.opcode());
//! }
//! println!("closed: {:?}", session.close_reason().await);
//! ```

#![cfg(unix)]

use std::time::Duration;

pub mod error;
pub mod frame;
pub mod mask;
pub mod protocol;
pub mod selector;
pub mod session;
pub mod utf8;

pub use error::{CloseReason, Error, Result};
pub use frame::{Frame, OpCode};
pub use protocol::{Role, SessionState};
pub use selector::{Direction, PolledStream, Readiness, Selector, SelectorConfig, SelectorHandle};
pub use session::{CloseReasonFuture, Extension, FrameSink, Incoming, WebSocketSession};

/// Default write batch size (16KB)
pub const WRITE_BUFFER_SIZE: usize = 16 * 1024;

/// Default receive buffer size (64KB for high throughput)
pub const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Maximum WebSocket frame header size (2 + 8 + 4 = 14 bytes)
pub const MAX_FRAME_HEADER_SIZE: usize = 14;

/// Small message threshold for fast-path optimization (< 126 bytes uses 2-byte header)
pub const SMALL_MESSAGE_THRESHOLD: usize = 125;

/// Medium message threshold (< 64KB uses 4-byte header)
pub const MEDIUM_MESSAGE_THRESHOLD: usize = 65535;

/// Largest payload a control frame may carry
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Session configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum frame payload size (default: 16MB)
    pub max_frame_size: usize,
    /// Read buffer growth step (default: 64KB)
    pub read_buffer_size: usize,
    /// Bytes batched into one write (default: 16KB)
    pub write_buffer_size: usize,
    /// Also push received pings and pongs onto the inbound queue
    /// (default: false, they are handled internally)
    pub surface_control_frames: bool,
    /// Upper bound on the last write after cancellation or close
    /// (default: 1s)
    pub close_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_frame_size: 16 * 1024 * 1024,
            read_buffer_size: RECV_BUFFER_SIZE,
            write_buffer_size: WRITE_BUFFER_SIZE,
            surface_control_frames: false,
            close_timeout: Duration::from_secs(1),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Builder for session configuration
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set maximum frame size
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set read buffer growth step
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size.max(MAX_FRAME_HEADER_SIZE);
        self
    }

    /// Set write batch size
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.config.write_buffer_size = size;
        self
    }

    /// Deliver pings and pongs to the inbound queue as well
    pub fn surface_control_frames(mut self, enabled: bool) -> Self {
        self.config.surface_control_frames = enabled;
        self
    }

    /// Bound the final close write and half-close
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.config.close_timeout = timeout;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::Config;
    pub use crate::error::{CloseReason, Error, Result};
    pub use crate::frame::{Frame, OpCode};
    pub use crate::protocol::{Role, SessionState};
    pub use crate::selector::{Direction, PolledStream, Selector, SelectorConfig, SelectorHandle};
    pub use crate::session::{FrameSink, Incoming, WebSocketSession};
}
