//! Binary frame format shared by every client transport.
//!
//! ```text
//! +----------+------------+-------+-------+-------+---------+
//! | pack_len | header_len |  ver  |  op   |  seq  |  body   |
//! |  u32 BE  |   u16 BE   | u16BE | u32BE | u32BE | n bytes |
//! +----------+------------+-------+-------+-------+---------+
//! ```
//!
//! `pack_len` counts the header, so an empty frame has `pack_len == 16`.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub const HEADER_LEN: usize = 16;
pub const PROTOCOL_VERSION: u16 = 1;
/// Default cap on the body of a single frame.
pub const DEFAULT_MAX_BODY: usize = 4096;

pub type Result<T> = std::result::Result<T, FrameError>;

#[derive(thiserror::Error, Debug)]
pub enum FrameError {
    #[error("invalid header length {0}")]
    InvalidHeaderLength(u16),
    #[error("invalid pack length {0}")]
    InvalidPackLength(u32),
    #[error("frame body of {len} bytes exceeds limit of {max}")]
    BodyTooLarge { len: usize, max: usize },
    #[error("truncated frame")]
    Truncated,
    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Operation code carried in every frame.
///
/// Codes outside the named set are still representable so the control plane
/// can push application-defined operations.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Op(pub u32);

impl Op {
    pub const HANDSHAKE: Op = Op(0);
    pub const HANDSHAKE_REPLY: Op = Op(1);
    pub const HEARTBEAT: Op = Op(2);
    pub const HEARTBEAT_REPLY: Op = Op(3);
    pub const SEND_MSG: Op = Op(4);
    pub const SEND_MSG_REPLY: Op = Op(5);
    pub const DISCONNECT_REPLY: Op = Op(6);
    pub const AUTH: Op = Op(7);
    pub const AUTH_REPLY: Op = Op(8);
    pub const RAW: Op = Op(9);
    pub const ROOM_JOIN: Op = Op(12);
    pub const ROOM_JOIN_REPLY: Op = Op(13);
    pub const SUB: Op = Op(14);
    pub const SUB_REPLY: Op = Op(15);
    pub const UNSUB: Op = Op(16);
    pub const UNSUB_REPLY: Op = Op(17);
    pub const ROOM_LEAVE: Op = Op(18);
    pub const ROOM_LEAVE_REPLY: Op = Op(19);

    pub const fn code(self) -> u32 {
        self.0
    }

    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Op::HANDSHAKE => "HANDSHAKE",
            Op::HANDSHAKE_REPLY => "HANDSHAKE_REPLY",
            Op::HEARTBEAT => "HEARTBEAT",
            Op::HEARTBEAT_REPLY => "HEARTBEAT_REPLY",
            Op::SEND_MSG => "SEND_MSG",
            Op::SEND_MSG_REPLY => "SEND_MSG_REPLY",
            Op::DISCONNECT_REPLY => "DISCONNECT_REPLY",
            Op::AUTH => "AUTH",
            Op::AUTH_REPLY => "AUTH_REPLY",
            Op::RAW => "RAW",
            Op::ROOM_JOIN => "ROOM_JOIN",
            Op::ROOM_JOIN_REPLY => "ROOM_JOIN_REPLY",
            Op::SUB => "SUB",
            Op::SUB_REPLY => "SUB_REPLY",
            Op::UNSUB => "UNSUB",
            Op::UNSUB_REPLY => "UNSUB_REPLY",
            Op::ROOM_LEAVE => "ROOM_LEAVE",
            Op::ROOM_LEAVE_REPLY => "ROOM_LEAVE_REPLY",
            _ => return None,
        };
        Some(name)
    }

    /// Whether this is one of the protocol's named operations.
    pub fn is_known(self) -> bool {
        self.name().is_some()
    }
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name}({})", self.0),
            None => write!(f, "Op({})", self.0),
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One decoded protocol frame.
///
/// ```
/// use bytes::Bytes;
/// use comet_common::frame::{self, Frame, Op};
///
/// let frame = Frame::new(Op::SEND_MSG, Bytes::from_static(b"hello"));
/// let encoded = frame.encode();
/// let (decoded, used) = frame::decode(&encoded, 4096).unwrap().unwrap();
/// assert_eq!(used, encoded.len());
/// assert_eq!(decoded, frame);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub ver: u16,
    pub op: Op,
    pub seq: u32,
    pub body: Bytes,
}

impl Frame {
    pub fn new(op: Op, body: Bytes) -> Self {
        Self {
            ver: PROTOCOL_VERSION,
            op,
            seq: 0,
            body,
        }
    }

    pub fn empty(op: Op) -> Self {
        Self::new(op, Bytes::new())
    }

    /// Build a reply to `self`, echoing its version and sequence number.
    pub fn reply(&self, op: Op, body: Bytes) -> Self {
        Self {
            ver: self.ver,
            op,
            seq: self.seq,
            body,
        }
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.body.len()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u32(self.encoded_len() as u32);
        buf.put_u16(HEADER_LEN as u16);
        buf.put_u16(self.ver);
        buf.put_u32(self.op.0);
        buf.put_u32(self.seq);
        buf.extend_from_slice(&self.body);
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }
}

/// Decode one frame from the front of `input`.
///
/// Returns `Ok(None)` when more bytes are needed. The header is validated as
/// soon as it is complete, so an oversized frame is rejected before its body
/// arrives.
pub fn decode(input: &[u8], max_body: usize) -> Result<Option<(Frame, usize)>> {
    if input.len() < HEADER_LEN {
        return Ok(None);
    }
    let mut header = &input[..HEADER_LEN];
    let pack_len = header.get_u32();
    let header_len = header.get_u16();
    if header_len as usize != HEADER_LEN {
        return Err(FrameError::InvalidHeaderLength(header_len));
    }
    if (pack_len as usize) < HEADER_LEN {
        return Err(FrameError::InvalidPackLength(pack_len));
    }
    let body_len = pack_len as usize - HEADER_LEN;
    if body_len > max_body {
        return Err(FrameError::BodyTooLarge {
            len: body_len,
            max: max_body,
        });
    }
    let ver = header.get_u16();
    let op = Op(header.get_u32());
    let seq = header.get_u32();

    let total = pack_len as usize;
    if input.len() < total {
        return Ok(None);
    }
    let frame = Frame {
        ver,
        op,
        seq,
        body: Bytes::copy_from_slice(&input[HEADER_LEN..total]),
    };
    Ok(Some((frame, total)))
}

/// Decode a transport message that must hold exactly one frame.
pub fn decode_message(input: &[u8], max_body: usize) -> Result<Frame> {
    match decode(input, max_body)? {
        Some((frame, used)) if used == input.len() => Ok(frame),
        Some((_, used)) => Err(FrameError::TrailingBytes(input.len() - used)),
        None => Err(FrameError::Truncated),
    }
}

/// Stream codec for byte-oriented transports.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_body: usize,
}

impl FrameCodec {
    pub fn new(max_body: usize) -> Self {
        Self { max_body }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BODY)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match decode(&src[..], self.max_body)? {
            Some((frame, used)) => {
                src.advance(used);
                Ok(Some(frame))
            }
            None => {
                if src.len() >= HEADER_LEN {
                    let pack_len = (&src[..4]).get_u32() as usize;
                    src.reserve(pack_len.saturating_sub(src.len()));
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        if frame.body.len() > self.max_body {
            return Err(FrameError::BodyTooLarge {
                len: frame.body.len(),
                max: self.max_body,
            });
        }
        frame.encode_into(dst);
        Ok(())
    }
}
