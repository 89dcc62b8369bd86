//! WebSocket protocol state machine
//!
//! This module sits between the frame codec and the session loops:
//! - Fragment sequencing and incremental UTF-8 validation of text
//! - Control frame handling (automatic PONG, close handshake)
//! - Close state transitions and outbound masking per role
//!
//! It performs no I/O. The session feeds it read buffers and writes out
//! whatever it encodes.

use bytes::{BufMut, BytesMut};

use crate::error::{CloseReason, Error, Result};
use crate::frame::{Frame, FrameParser, OpCode};
use crate::mask::generate_mask;
use crate::utf8::{validate_utf8, validate_utf8_incomplete};

/// WebSocket endpoint role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client (must mask frames)
    Client,
    /// Server (must not mask frames)
    Server,
}

impl Role {
    /// Whether frames sent in this role carry a masking key
    #[inline]
    pub fn masks_outgoing(&self) -> bool {
        *self == Role::Client
    }
}

/// Lifecycle of a session
///
/// Transitions only move forward: `Open -> Closing -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// Frames flow in both directions
    Open,
    /// A close frame has been sent or received, but not both
    Closing,
    /// Close handshake finished or the session was torn down
    Closed,
}

/// A decoded frame, classified for the session's read loop
#[derive(Debug, Clone)]
pub enum Inbound {
    /// Text, binary or continuation frame
    Data(Frame),
    /// Ping, together with the PONG that answers it
    Ping {
        /// The ping as received
        frame: Frame,
        /// PONG echoing the ping payload
        reply: Frame,
    },
    /// Unsolicited or answering pong
    Pong(Frame),
    /// Close frame from the peer
    Close {
        /// The close frame as received
        frame: Frame,
        /// Parsed code and reason, `None` for an empty close
        reason: Option<CloseReason>,
        /// Close to echo back, absent when this side initiated the close
        reply: Option<Frame>,
    },
}

/// A frame prepared for the wire
#[derive(Debug, Clone)]
pub struct Outbound {
    frame: Frame,
    mask: Option<[u8; 4]>,
}

impl Outbound {
    /// Frame that will be written
    #[inline]
    pub fn frame(&self) -> &Frame {
        &self.frame
    }
}

/// Sans-io protocol handler shared by the session's read and write loops
#[derive(Debug)]
pub struct Protocol {
    role: Role,
    parser: FrameParser,
    /// Opcode of the fragmented message in progress
    fragment_opcode: Option<OpCode>,
    /// Trailing bytes of an incomplete UTF-8 sequence from the last fragment
    utf8_carry: BytesMut,
    close_sent: bool,
    close_received: bool,
    terminated: bool,
}

impl Protocol {
    /// Create a new protocol handler
    pub fn new(role: Role, max_frame_size: usize) -> Self {
        let expect_masked = role == Role::Server;

        Self {
            role,
            parser: FrameParser::new(max_frame_size, expect_masked),
            fragment_opcode: None,
            utf8_carry: BytesMut::new(),
            close_sent: false,
            close_received: false,
            terminated: false,
        }
    }

    /// Maximum accepted frame payload
    #[inline]
    pub fn max_frame_size(&self) -> usize {
        self.parser.max_frame_size()
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        if self.terminated || (self.close_sent && self.close_received) {
            SessionState::Closed
        } else if self.close_sent || self.close_received {
            SessionState::Closing
        } else {
            SessionState::Open
        }
    }

    /// Whether this side sent a close frame
    #[inline]
    pub fn close_sent(&self) -> bool {
        self.close_sent
    }

    /// Mark the session torn down, whatever the handshake reached
    pub fn terminate(&mut self) {
        self.terminated = true;
    }

    /// Parse and classify at most one frame from `buf`
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete frame.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Inbound>> {
        let Some(frame) = self.parser.parse(buf)? else {
            return Ok(None);
        };

        let inbound = match frame.opcode() {
            OpCode::Text | OpCode::Binary => self.handle_data_start(frame)?,
            OpCode::Continuation => self.handle_continuation(frame)?,
            OpCode::Ping => {
                let reply = Frame::pong(frame.payload.clone());
                Inbound::Ping { frame, reply }
            }
            OpCode::Pong => Inbound::Pong(frame),
            OpCode::Close => self.handle_close(frame)?,
        };

        Ok(Some(inbound))
    }

    fn handle_data_start(&mut self, frame: Frame) -> Result<Inbound> {
        if self.fragment_opcode.is_some() {
            return Err(Error::Protocol("expected continuation frame"));
        }

        let is_text = frame.opcode() == OpCode::Text;
        if frame.is_final() {
            if is_text && !validate_utf8(&frame.payload) {
                return Err(Error::InvalidUtf8);
            }
        } else {
            self.fragment_opcode = Some(frame.opcode());
            self.utf8_carry.clear();
            if is_text {
                self.check_fragment_utf8(&frame.payload, false)?;
            }
        }

        Ok(Inbound::Data(frame))
    }

    fn handle_continuation(&mut self, frame: Frame) -> Result<Inbound> {
        let opcode = self
            .fragment_opcode
            .ok_or(Error::Protocol("unexpected continuation frame"))?;

        if opcode == OpCode::Text {
            self.check_fragment_utf8(&frame.payload, frame.is_final())?;
        }
        if frame.is_final() {
            self.fragment_opcode = None;
        }

        Ok(Inbound::Data(frame))
    }

    /// Validate one text fragment, carrying a split character to the next
    fn check_fragment_utf8(&mut self, payload: &[u8], fin: bool) -> Result<()> {
        self.utf8_carry.put_slice(payload);
        let (valid, incomplete) = validate_utf8_incomplete(&self.utf8_carry);
        if !valid || (fin && incomplete != 0) {
            return Err(Error::InvalidUtf8);
        }

        let complete = self.utf8_carry.len() - incomplete;
        let _ = self.utf8_carry.split_to(complete);
        Ok(())
    }

    fn handle_close(&mut self, frame: Frame) -> Result<Inbound> {
        let reason = frame.parse_close()?;
        self.close_received = true;

        let reply = if self.close_sent {
            None
        } else {
            Some(Frame::close_with(reason.as_ref()))
        };

        Ok(Inbound::Close {
            frame,
            reason,
            reply,
        })
    }

    /// Prepare a queued frame for the wire
    ///
    /// A close frame whose code must not appear on the wire is replaced by
    /// an empty close. Data and control frames are masked when the role
    /// requires it.
    pub fn outbound(&mut self, frame: Frame) -> Outbound {
        let frame = if frame.opcode() == OpCode::Close {
            self.close_sent = true;
            sanitize_close(frame)
        } else {
            frame
        };

        let mask = self.role.masks_outgoing().then(generate_mask);
        Outbound { frame, mask }
    }

    /// Serialize a prepared frame
    #[inline]
    pub fn encode(&self, outbound: &Outbound, buf: &mut BytesMut) {
        outbound.frame().encode(buf, outbound.mask);
    }
}

fn sanitize_close(frame: Frame) -> Frame {
    match frame.payload.len() {
        0 => frame,
        1 => Frame::close_empty(),
        _ => {
            let code = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
            if CloseReason::is_reserved(code) {
                tracing::debug!(code, "dropping reserved close code from outgoing close");
                Frame::close_empty()
            } else {
                frame
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_frame;

    fn wire(opcode: OpCode, payload: &[u8], fin: bool) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, opcode, payload, fin, Some([0x37, 0xfa, 0x21, 0x3d]));
        buf
    }

    #[test]
    fn test_text_frame() {
        let mut protocol = Protocol::new(Role::Server, 1024 * 1024);
        let mut buf = wire(OpCode::Text, b"Hello", true);

        match protocol.decode(&mut buf).unwrap() {
            Some(Inbound::Data(frame)) => assert_eq!(frame.as_text().unwrap(), "Hello"),
            other => panic!("Expected data frame, got {other:?}"),
        }
        assert!(protocol.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_invalid_text_rejected() {
        let mut protocol = Protocol::new(Role::Server, 1024);
        let mut buf = wire(OpCode::Text, &[0xff, 0xfe], true);
        assert!(matches!(protocol.decode(&mut buf), Err(Error::InvalidUtf8)));
    }

    #[test]
    fn test_fragmented_text_split_character() {
        let mut protocol = Protocol::new(Role::Server, 1024);
        let text = "héllo".as_bytes();

        // Split inside the two-byte 'é'
        let mut buf = wire(OpCode::Text, &text[..2], false);
        buf.extend_from_slice(&wire(OpCode::Continuation, &text[2..], true));

        assert!(matches!(protocol.decode(&mut buf).unwrap(), Some(Inbound::Data(_))));
        assert!(matches!(protocol.decode(&mut buf).unwrap(), Some(Inbound::Data(_))));

        // The message is complete, so a new one may start
        let mut next = wire(OpCode::Binary, b"x", true);
        assert!(protocol.decode(&mut next).unwrap().is_some());
    }

    #[test]
    fn test_truncated_character_at_fin() {
        let mut protocol = Protocol::new(Role::Server, 1024);
        let text = "é".as_bytes();

        let mut buf = wire(OpCode::Text, b"a", false);
        buf.extend_from_slice(&wire(OpCode::Continuation, &text[..1], true));

        assert!(protocol.decode(&mut buf).unwrap().is_some());
        assert!(matches!(protocol.decode(&mut buf), Err(Error::InvalidUtf8)));
    }

    #[test]
    fn test_fragment_sequencing() {
        let mut protocol = Protocol::new(Role::Server, 1024);
        let mut buf = wire(OpCode::Continuation, b"orphan", true);
        assert!(matches!(protocol.decode(&mut buf), Err(Error::Protocol(_))));

        let mut protocol = Protocol::new(Role::Server, 1024);
        let mut buf = wire(OpCode::Binary, b"a", false);
        buf.extend_from_slice(&wire(OpCode::Text, b"b", true));
        assert!(protocol.decode(&mut buf).unwrap().is_some());
        assert!(matches!(protocol.decode(&mut buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_control_between_fragments() {
        let mut protocol = Protocol::new(Role::Server, 1024);
        let mut buf = wire(OpCode::Binary, b"a", false);
        buf.extend_from_slice(&wire(OpCode::Ping, b"p", true));
        buf.extend_from_slice(&wire(OpCode::Continuation, b"b", true));

        assert!(matches!(protocol.decode(&mut buf).unwrap(), Some(Inbound::Data(_))));
        match protocol.decode(&mut buf).unwrap() {
            Some(Inbound::Ping { reply, .. }) => {
                assert_eq!(reply.opcode(), OpCode::Pong);
                assert_eq!(reply.payload.as_ref(), b"p");
            }
            other => panic!("Expected ping, got {other:?}"),
        }
        assert!(matches!(protocol.decode(&mut buf).unwrap(), Some(Inbound::Data(_))));
    }

    #[test]
    fn test_peer_initiated_close() {
        let mut protocol = Protocol::new(Role::Server, 1024);
        let mut payload = BytesMut::new();
        payload.put_u16(1000);
        payload.put_slice(b"bye");
        let mut buf = wire(OpCode::Close, &payload, true);

        match protocol.decode(&mut buf).unwrap() {
            Some(Inbound::Close { reason, reply, .. }) => {
                assert_eq!(reason, Some(CloseReason::new(1000, "bye")));
                let reply = reply.expect("reply to peer close");
                assert_eq!(reply.parse_close().unwrap(), reason);
            }
            other => panic!("Expected close, got {other:?}"),
        }
        assert_eq!(protocol.state(), SessionState::Closing);

        let out = protocol.outbound(Frame::close(1000, "bye"));
        assert_eq!(out.frame().opcode(), OpCode::Close);
        assert_eq!(protocol.state(), SessionState::Closed);
    }

    #[test]
    fn test_locally_initiated_close_has_no_reply() {
        let mut protocol = Protocol::new(Role::Server, 1024);
        protocol.outbound(Frame::close(1000, ""));
        assert_eq!(protocol.state(), SessionState::Closing);

        let mut buf = wire(OpCode::Close, &[], true);
        match protocol.decode(&mut buf).unwrap() {
            Some(Inbound::Close { reason, reply, .. }) => {
                assert_eq!(reason, None);
                assert!(reply.is_none());
            }
            other => panic!("Expected close, got {other:?}"),
        }
        assert_eq!(protocol.state(), SessionState::Closed);
    }

    #[test]
    fn test_reserved_close_code_sent_empty() {
        let mut protocol = Protocol::new(Role::Server, 1024);
        let out = protocol.outbound(Frame::close(CloseReason::ABNORMAL, "gone"));
        assert!(out.frame().payload.is_empty());

        let out = protocol.outbound(Frame::close(CloseReason::GOING_AWAY, "gone"));
        assert_eq!(out.frame().payload.len(), 6);
    }

    #[test]
    fn test_outbound_masking_per_role() {
        let mut server = Protocol::new(Role::Server, 1024);
        let mut buf = BytesMut::new();
        let out = server.outbound(Frame::text("test"));
        server.encode(&out, &mut buf);
        assert_eq!(buf[0], 0x81);
        assert_eq!(buf[1], 0x04);
        assert_eq!(&buf[2..], b"test");

        let mut client = Protocol::new(Role::Client, 1024);
        let mut buf = BytesMut::new();
        let out = client.outbound(Frame::ping("p"));
        client.encode(&out, &mut buf);
        assert_eq!(buf[1], 0x81);

        // A server parser must accept what the client wrote
        let mut parser = FrameParser::new(1024, true);
        let frame = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(frame.payload.as_ref(), b"p");
    }

    #[test]
    fn test_terminate() {
        let mut protocol = Protocol::new(Role::Client, 1024);
        assert_eq!(protocol.state(), SessionState::Open);
        protocol.terminate();
        assert_eq!(protocol.state(), SessionState::Closed);
    }
}
