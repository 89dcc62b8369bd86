//! WebSocket frame parsing and serialization
//!
//! This module implements RFC 6455 WebSocket frame handling with:
//! - Incremental parsing that suspends on partial input
//! - Fast-path for small frames (< 126 bytes, 2-byte header)
//! - In-place masking and unmasking
//! - Zero-copy payloads (`Bytes` split off the read buffer)

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CloseReason, Error, Result};
use crate::mask::apply_mask;
use crate::utf8::validate_utf8;
use crate::{MAX_CONTROL_PAYLOAD, MEDIUM_MESSAGE_THRESHOLD, SMALL_MESSAGE_THRESHOLD};

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation frame
    Continuation = 0x0,
    /// Text frame
    Text = 0x1,
    /// Binary frame
    Binary = 0x2,
    /// Connection close
    Close = 0x8,
    /// Ping
    Ping = 0x9,
    /// Pong
    Pong = 0xA,
}

impl OpCode {
    /// Parse opcode from byte
    #[inline]
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        (*self as u8) >= 0x8
    }

    /// Check if this is a data frame
    #[inline]
    pub fn is_data(&self) -> bool {
        (*self as u8) <= 0x2
    }
}

/// A parsed WebSocket frame header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment flag
    pub fin: bool,
    /// RSV1 (reserved for extensions)
    pub rsv1: bool,
    /// RSV2 (reserved)
    pub rsv2: bool,
    /// RSV3 (reserved)
    pub rsv3: bool,
    /// Frame opcode
    pub opcode: OpCode,
    /// Mask flag (set on client->server frames)
    pub masked: bool,
    /// Payload length
    pub payload_len: u64,
    /// Masking key (if masked)
    pub mask: Option<[u8; 4]>,
}

impl FrameHeader {
    fn new(opcode: OpCode, fin: bool, payload_len: u64) -> Self {
        Self {
            fin,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            masked: false,
            payload_len,
            mask: None,
        }
    }

    /// Get the total header size in bytes
    #[inline]
    pub fn header_size(&self) -> usize {
        length_field_size(self.payload_len) + 2 + if self.masked { 4 } else { 0 }
    }

    /// Encode the frame header into a buffer
    #[inline]
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut b0 = self.opcode as u8;
        if self.fin {
            b0 |= 0x80;
        }
        if self.rsv1 {
            b0 |= 0x40;
        }
        if self.rsv2 {
            b0 |= 0x20;
        }
        if self.rsv3 {
            b0 |= 0x10;
        }
        buf.put_u8(b0);

        let mask_bit = if self.mask.is_some() { 0x80 } else { 0x00 };
        put_length(buf, mask_bit, self.payload_len);

        if let Some(mask) = self.mask {
            buf.put_slice(&mask);
        }
    }
}

/// A complete WebSocket frame
///
/// The payload is always stored unmasked; `header.masked` records whether
/// the frame travelled masked on the wire.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame header
    pub header: FrameHeader,
    /// Frame payload (already unmasked)
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(opcode: OpCode, payload: Bytes, fin: bool) -> Self {
        Self {
            header: FrameHeader::new(opcode, fin, payload.len() as u64),
            payload,
        }
    }

    /// Create a text frame
    #[inline]
    pub fn text(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Text, data.into(), true)
    }

    /// Create a binary frame
    #[inline]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, data.into(), true)
    }

    /// Create a continuation frame
    #[inline]
    pub fn continuation(data: impl Into<Bytes>, fin: bool) -> Self {
        Self::new(OpCode::Continuation, data.into(), fin)
    }

    /// Create a ping frame
    #[inline]
    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Ping, data.into(), true)
    }

    /// Create a pong frame
    #[inline]
    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Pong, data.into(), true)
    }

    /// Create a close frame
    #[inline]
    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code);
        payload.put_slice(reason.as_bytes());
        Self::new(OpCode::Close, payload.freeze(), true)
    }

    /// Create a close frame carrying `reason`, or an empty one for `None`
    pub fn close_with(reason: Option<&CloseReason>) -> Self {
        match reason {
            Some(r) => Self::close(r.code, &r.reason),
            None => Self::close_empty(),
        }
    }

    /// Create an empty close frame
    #[inline]
    pub fn close_empty() -> Self {
        Self::new(OpCode::Close, Bytes::new(), true)
    }

    /// Frame opcode
    #[inline]
    pub fn opcode(&self) -> OpCode {
        self.header.opcode
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        self.header.opcode.is_control()
    }

    /// Check if this is the final fragment
    #[inline]
    pub fn is_final(&self) -> bool {
        self.header.fin
    }

    /// Check if the frame was masked on the wire
    #[inline]
    pub fn is_masked(&self) -> bool {
        self.header.masked
    }

    /// Get the payload as a string (for text frames)
    pub fn as_text(&self) -> Result<&str> {
        std::str::from_utf8(&self.payload).map_err(|_| Error::InvalidUtf8)
    }

    /// Parse close frame payload
    ///
    /// Returns `Ok(None)` for an empty payload. A single byte, a code that
    /// may not appear on the wire, or a reason that is not UTF-8 are errors.
    pub fn parse_close(&self) -> Result<Option<CloseReason>> {
        match self.payload.len() {
            0 => Ok(None),
            1 => Err(Error::Protocol("invalid close frame payload")),
            _ => {
                let code = u16::from_be_bytes([self.payload[0], self.payload[1]]);
                if !CloseReason::is_valid_code(code) {
                    return Err(Error::InvalidCloseCode(code));
                }
                let text = &self.payload[2..];
                if !validate_utf8(text) {
                    return Err(Error::InvalidUtf8);
                }
                let reason = String::from_utf8_lossy(text).into_owned();
                Ok(Some(CloseReason::new(code, reason)))
            }
        }
    }

    /// Encode this frame, masking the payload when `mask` is given
    pub fn encode(&self, buf: &mut BytesMut, mask: Option<[u8; 4]>) {
        encode_frame(buf, self.header.opcode, &self.payload, self.header.fin, mask);
    }
}

#[inline]
fn length_field_size(payload_len: u64) -> usize {
    if payload_len > MEDIUM_MESSAGE_THRESHOLD as u64 {
        8
    } else if payload_len > SMALL_MESSAGE_THRESHOLD as u64 {
        2
    } else {
        0
    }
}

#[inline]
fn put_length(buf: &mut BytesMut, mask_bit: u8, payload_len: u64) {
    if payload_len <= SMALL_MESSAGE_THRESHOLD as u64 {
        buf.put_u8(mask_bit | payload_len as u8);
    } else if payload_len <= MEDIUM_MESSAGE_THRESHOLD as u64 {
        buf.put_u8(mask_bit | 126);
        buf.put_u16(payload_len as u16);
    } else {
        buf.put_u8(mask_bit | 127);
        buf.put_u64(payload_len);
    }
}

/// Frame parser state machine
#[derive(Debug, Clone, PartialEq, Eq)]
enum ParseState {
    /// Waiting for a complete header (2-14 bytes)
    Header,
    /// Header consumed, waiting for the payload
    Payload(FrameHeader),
}

/// Incremental frame parser
///
/// Feed it a growing read buffer; it consumes whole frames and leaves any
/// trailing partial frame in place for the next call.
#[derive(Debug)]
pub struct FrameParser {
    state: ParseState,
    /// Maximum frame size
    max_frame_size: usize,
    /// Whether to expect masked frames (server mode)
    expect_masked: bool,
}

impl FrameParser {
    /// Create a new frame parser
    pub fn new(max_frame_size: usize, expect_masked: bool) -> Self {
        Self {
            state: ParseState::Header,
            max_frame_size,
            expect_masked,
        }
    }

    /// Maximum accepted payload length
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Parse a frame from the buffer
    ///
    /// Returns:
    /// - Ok(Some(frame)) if a complete frame was parsed
    /// - Ok(None) if more data is needed
    /// - Err(e) if parsing failed
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        if self.state == ParseState::Header {
            match self.parse_header(buf)? {
                Some(header) => self.state = ParseState::Payload(header),
                None => return Ok(None),
            }
        }

        let ParseState::Payload(header) = &self.state else {
            return Ok(None);
        };
        let payload_len = header.payload_len as usize;
        if buf.len() < payload_len {
            return Ok(None);
        }

        let mut payload = buf.split_to(payload_len);
        if let Some(mask) = header.mask {
            apply_mask(&mut payload, mask);
        }

        let ParseState::Payload(header) = std::mem::replace(&mut self.state, ParseState::Header)
        else {
            return Ok(None);
        };

        Ok(Some(Frame {
            header,
            payload: payload.freeze(),
        }))
    }

    /// Peek a complete header and consume it, or leave the buffer untouched
    fn parse_header(&self, buf: &mut BytesMut) -> Result<Option<FrameHeader>> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let b0 = buf[0];
        let b1 = buf[1];

        let fin = b0 & 0x80 != 0;
        let rsv1 = b0 & 0x40 != 0;
        let rsv2 = b0 & 0x20 != 0;
        let rsv3 = b0 & 0x10 != 0;

        // No extension is ever negotiated, so every reserved bit must be clear
        if rsv1 || rsv2 || rsv3 {
            return Err(Error::Protocol("reserved bits must be 0"));
        }

        let opcode = OpCode::from_u8(b0 & 0x0F).ok_or(Error::InvalidFrame("invalid opcode"))?;

        if opcode.is_control() && !fin {
            return Err(Error::Protocol("control frame must not be fragmented"));
        }

        let masked = b1 & 0x80 != 0;
        if self.expect_masked && !masked {
            return Err(Error::Protocol("client frames must be masked"));
        }
        if !self.expect_masked && masked {
            return Err(Error::Protocol("server frames must not be masked"));
        }

        let len_byte = b1 & 0x7F;
        let (payload_len, len_end) = match len_byte {
            0..=125 => (len_byte as u64, 2),
            126 => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                let len = u16::from_be_bytes([buf[2], buf[3]]) as u64;
                if len < 126 {
                    return Err(Error::Protocol("payload length not minimal"));
                }
                (len, 4)
            }
            _ => {
                if buf.len() < 10 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&buf[2..10]);
                let len = u64::from_be_bytes(raw);
                if len <= 0xFFFF {
                    return Err(Error::Protocol("payload length not minimal"));
                }
                if len >> 63 != 0 {
                    return Err(Error::Protocol("payload length MSB must be 0"));
                }
                (len, 10)
            }
        };

        if opcode.is_control() && payload_len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(Error::Protocol("control frame too large"));
        }
        if payload_len > self.max_frame_size as u64 {
            return Err(Error::FrameTooLarge);
        }

        let header_len = len_end + if masked { 4 } else { 0 };
        if buf.len() < header_len {
            return Ok(None);
        }

        let mask = masked.then(|| [buf[len_end], buf[len_end + 1], buf[len_end + 2], buf[len_end + 3]]);
        buf.advance(header_len);

        Ok(Some(FrameHeader {
            fin,
            rsv1,
            rsv2,
            rsv3,
            opcode,
            masked,
            payload_len,
            mask,
        }))
    }
}

/// Encode a frame into a buffer
///
/// This is the fast path for frame encoding. For masked frames (client mode),
/// the payload is copied and masked in the output buffer.
#[inline]
pub fn encode_frame(
    buf: &mut BytesMut,
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
    mask: Option<[u8; 4]>,
) {
    let payload_len = payload.len();
    let header_size = 2 + length_field_size(payload_len as u64) + if mask.is_some() { 4 } else { 0 };

    buf.reserve(header_size + payload_len);

    let mut b0 = opcode as u8;
    if fin {
        b0 |= 0x80;
    }
    buf.put_u8(b0);

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    put_length(buf, mask_bit, payload_len as u64);

    if let Some(m) = mask {
        buf.put_slice(&m);

        let start = buf.len();
        buf.put_slice(payload);
        apply_mask(&mut buf[start..], m);
    } else {
        buf.put_slice(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode() {
        assert!(OpCode::Ping.is_control());
        assert!(OpCode::Pong.is_control());
        assert!(OpCode::Close.is_control());
        assert!(!OpCode::Text.is_control());
        assert!(!OpCode::Binary.is_control());
        assert!(OpCode::Text.is_data());
        assert!(OpCode::Binary.is_data());
        assert!(OpCode::Continuation.is_data());
        assert_eq!(OpCode::from_u8(0x3), None);
    }

    #[test]
    fn test_parse_small_unmasked() {
        let mut parser = FrameParser::new(1024 * 1024, false);
        let mut buf = BytesMut::from(&[0x81, 0x05, b'h', b'e', b'l', b'l', b'o'][..]);

        let frame = parser.parse(&mut buf).unwrap().unwrap();
        assert!(frame.header.fin);
        assert!(!frame.is_masked());
        assert_eq!(frame.opcode(), OpCode::Text);
        assert_eq!(frame.payload.as_ref(), b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_parse_small_masked() {
        let mut parser = FrameParser::new(1024 * 1024, true);
        let mask = [0x37, 0xfa, 0x21, 0x3d];

        let mut payload = *b"Hello";
        apply_mask(&mut payload, mask);

        let mut buf = BytesMut::new();
        buf.put_u8(0x81);
        buf.put_u8(0x85);
        buf.put_slice(&mask);
        buf.put_slice(&payload);

        let frame = parser.parse(&mut buf).unwrap().unwrap();
        assert!(frame.is_masked());
        assert_eq!(frame.header.mask, Some(mask));
        assert_eq!(frame.payload.as_ref(), b"Hello");
    }

    #[test]
    fn test_parse_medium_length() {
        let mut parser = FrameParser::new(1024 * 1024, false);
        let payload = vec![0x42u8; 200];

        let mut buf = BytesMut::new();
        buf.put_u8(0x82);
        buf.put_u8(126);
        buf.put_u16(200);
        buf.put_slice(&payload);

        let frame = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(frame.opcode(), OpCode::Binary);
        assert_eq!(frame.payload.len(), 200);
    }

    #[test]
    fn test_parse_large_length() {
        let mut parser = FrameParser::new(1024 * 1024, false);
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Binary, &vec![7u8; 70_000], true, None);
        assert_eq!(buf[1], 127);

        let frame = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(frame.payload.len(), 70_000);
    }

    #[test]
    fn test_parse_byte_by_byte() {
        let mut parser = FrameParser::new(1024 * 1024, true);
        let mut wire = BytesMut::new();
        encode_frame(&mut wire, OpCode::Text, &[b'x'; 300], true, Some([1, 2, 3, 4]));

        let mut buf = BytesMut::new();
        let mut parsed = None;
        for byte in wire.iter() {
            buf.put_u8(*byte);
            if let Some(frame) = parser.parse(&mut buf).unwrap() {
                parsed = Some(frame);
            }
        }

        let frame = parsed.expect("frame completes on the final byte");
        assert_eq!(frame.payload.as_ref(), &[b'x'; 300][..]);
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut parser = FrameParser::new(1024, false);
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Text, b"one", true, None);
        encode_frame(&mut buf, OpCode::Binary, b"two", true, None);

        let first = parser.parse(&mut buf).unwrap().unwrap();
        let second = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(first.payload.as_ref(), b"one");
        assert_eq!(second.opcode(), OpCode::Binary);
        assert!(parser.parse(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_encode_frame() {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Text, b"hello", true, None);

        assert_eq!(buf[0], 0x81);
        assert_eq!(buf[1], 0x05);
        assert_eq!(&buf[2..], b"hello");
    }

    #[test]
    fn test_encode_frame_masked() {
        let mask = [0x01, 0x02, 0x03, 0x04];
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Text, b"test", true, Some(mask));

        assert_eq!(buf[0], 0x81);
        assert_eq!(buf[1], 0x84);
        assert_eq!(&buf[2..6], &mask);

        let mut payload = buf[6..].to_vec();
        apply_mask(&mut payload, mask);
        assert_eq!(&payload, b"test");
    }

    #[test]
    fn test_header_encode_matches_encode_frame() {
        let frame = Frame::binary(vec![0u8; 300]);
        let mut header_only = BytesMut::new();
        frame.header.encode(&mut header_only);
        assert_eq!(header_only.len(), frame.header.header_size());

        let mut full = BytesMut::new();
        frame.encode(&mut full, None);
        assert_eq!(&full[..header_only.len()], &header_only[..]);
    }

    #[test]
    fn test_control_frame_fragmentation() {
        let mut parser = FrameParser::new(1024, false);
        let mut buf = BytesMut::from(&[0x09, 0x00][..]);
        assert!(matches!(parser.parse(&mut buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_reserved_bits_rejected() {
        let mut parser = FrameParser::new(1024, false);
        let mut buf = BytesMut::from(&[0xC1, 0x00][..]);
        assert!(matches!(parser.parse(&mut buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_invalid_opcode_rejected() {
        let mut parser = FrameParser::new(1024, false);
        let mut buf = BytesMut::from(&[0x83, 0x00][..]);
        assert!(matches!(parser.parse(&mut buf), Err(Error::InvalidFrame(_))));
    }

    #[test]
    fn test_oversized_control_rejected() {
        let mut parser = FrameParser::new(1024, false);
        let mut buf = BytesMut::from(&[0x89, 126, 0x00, 0x80][..]);
        assert!(matches!(parser.parse(&mut buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_frame_too_large() {
        let mut parser = FrameParser::new(16, false);
        let mut buf = BytesMut::from(&[0x82, 0x20][..]);
        assert!(matches!(parser.parse(&mut buf), Err(Error::FrameTooLarge)));
    }

    #[test]
    fn test_mask_policy_enforced() {
        let mut server = FrameParser::new(1024, true);
        let mut buf = BytesMut::from(&[0x81, 0x00][..]);
        assert!(server.parse(&mut buf).is_err());

        let mut client = FrameParser::new(1024, false);
        let mut buf = BytesMut::from(&[0x81, 0x80, 0, 0, 0, 0][..]);
        assert!(client.parse(&mut buf).is_err());
    }

    #[test]
    fn test_close_frame() {
        let frame = Frame::close(1000, "goodbye");
        assert_eq!(frame.opcode(), OpCode::Close);

        let close = frame.parse_close().unwrap().unwrap();
        assert_eq!(close.code, 1000);
        assert_eq!(close.reason, "goodbye");

        assert_eq!(Frame::close_empty().parse_close().unwrap(), None);
    }

    #[test]
    fn test_close_frame_invalid_payloads() {
        let one_byte = Frame::new(OpCode::Close, Bytes::from_static(&[0x03]), true);
        assert!(matches!(one_byte.parse_close(), Err(Error::Protocol(_))));

        let reserved = Frame::close(CloseReason::ABNORMAL, "");
        assert!(matches!(reserved.parse_close(), Err(Error::InvalidCloseCode(1006))));

        let bad_utf8 = Frame::new(OpCode::Close, Bytes::from_static(&[0x03, 0xE8, 0xff]), true);
        assert!(matches!(bad_utf8.parse_close(), Err(Error::InvalidUtf8)));
    }
}
