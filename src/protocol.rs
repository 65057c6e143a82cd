//! Wire formats for the two transports described in §6:
//!
//! * the per-thread channel (length-prefixed op frames over a stream
//!   socket), and
//! * the control pipe (a fixed-size fatal record, a variable-length
//!   handshake, and a one-byte fatal acknowledgement).
//!
//! Every encode/decode routine here works against a plain `Read`/`Write`
//! so the same code serves both the blocking host-side calls and the
//! monitor's event loop.

use std::io::{self, Read, Write};

use crate::bounded::{BoundedString, MAX_KEY_LEN, MAX_MESSAGE_LEN, MAX_VALUE_LEN};
use crate::error::{Error, ErrorKind};

/// Operation codes shared by the channel frame header and the control
/// pipe's fatal marker (`Fatal` never appears on a per-thread channel).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    KvSet = 1,
    KvDelete = 2,
    Emit = 3,
    Detach = 4,
    Fatal = 5,
    /// Diagnostic accessor, not in the original wire table: queue depth
    /// and total tracer invocation count (§10.5's `Monitor::stats()`
    /// supplemental feature).
    Stats = 6,
}

impl Op {
    pub fn from_wire(byte: u8) -> Result<Op, Error> {
        match byte {
            1 => Ok(Op::KvSet),
            2 => Ok(Op::KvDelete),
            3 => Ok(Op::Emit),
            4 => Ok(Op::Detach),
            5 => Ok(Op::Fatal),
            6 => Ok(Op::Stats),
            other => Err(Error::ProtocolViolation(format!(
                "unrecognized operation code {other}"
            ))),
        }
    }
}

/// A decoded channel request, one variant per §4.3 operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    KvSet {
        key: BoundedString<MAX_KEY_LEN>,
        value: BoundedString<MAX_VALUE_LEN>,
    },
    KvDelete {
        key: BoundedString<MAX_KEY_LEN>,
    },
    Emit {
        message: BoundedString<MAX_MESSAGE_LEN>,
    },
    Detach,
    /// §10.5's diagnostic accessor: no payload, answered with a
    /// [`StatsReply`] instead of the ordinary [`Reply`].
    Stats,
}

impl Request {
    pub fn op(&self) -> Op {
        match self {
            Request::KvSet { .. } => Op::KvSet,
            Request::KvDelete { .. } => Op::KvDelete,
            Request::Emit { .. } => Op::Emit,
            Request::Detach => Op::Detach,
            Request::Stats => Op::Stats,
        }
    }

    fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Request::KvSet { key, value } => {
                write_bounded(&mut buf, key.as_str());
                write_bounded(&mut buf, value.as_str());
            }
            Request::KvDelete { key } => {
                write_bounded(&mut buf, key.as_str());
            }
            Request::Emit { message } => {
                write_bounded(&mut buf, message.as_str());
            }
            Request::Detach | Request::Stats => {}
        }
        buf
    }

    fn decode_payload(op: Op, payload: &[u8]) -> Result<Request, Error> {
        let mut cursor = payload;
        Ok(match op {
            Op::KvSet => {
                let key = read_bounded::<MAX_KEY_LEN>(&mut cursor)?;
                let value = read_bounded::<MAX_VALUE_LEN>(&mut cursor)?;
                Request::KvSet { key, value }
            }
            Op::KvDelete => {
                let key = read_bounded::<MAX_KEY_LEN>(&mut cursor)?;
                Request::KvDelete { key }
            }
            Op::Emit => {
                let message = read_bounded::<MAX_MESSAGE_LEN>(&mut cursor)?;
                Request::Emit { message }
            }
            Op::Detach => Request::Detach,
            Op::Stats => Request::Stats,
            Op::Fatal => {
                return Err(Error::ProtocolViolation(
                    "FATAL is not a valid channel operation".to_string(),
                ))
            }
        })
    }
}

/// The reply that matches every channel request: a status byte and, if
/// non-OK, a bounded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: ErrorKind,
    pub message: Option<BoundedString<MAX_MESSAGE_LEN>>,
}

impl Reply {
    pub fn ok() -> Reply {
        Reply {
            status: ErrorKind::Ok,
            message: None,
        }
    }

    pub fn err(err: &Error) -> Reply {
        Reply {
            status: err.kind(),
            message: Some(BoundedString::truncated(&err.to_string())),
        }
    }

    pub fn into_result(self) -> Result<(), Error> {
        if self.status == ErrorKind::Ok {
            return Ok(());
        }
        let message = self
            .message
            .map(BoundedString::into_string)
            .unwrap_or_default();
        Err(Error::from_kind_and_message(self.status, message))
    }
}

/// Writes a length-prefixed frame: 1-byte op, 4-byte little-endian
/// payload length, then the payload.
pub fn write_frame(writer: &mut impl Write, op: Op, payload: &[u8]) -> io::Result<()> {
    let mut header = [0u8; 5];
    header[0] = op as u8;
    header[1..5].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    writer.write_all(&header)?;
    writer.write_all(payload)?;
    writer.flush()
}

/// Reads back a frame written by [`write_frame`].
pub fn read_frame(reader: &mut impl Read) -> io::Result<(Op, Vec<u8>)> {
    let mut header = [0u8; 5];
    reader.read_exact(&mut header)?;
    let op = Op::from_wire(header[0])
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    let len = u32::from_le_bytes(header[1..5].try_into().unwrap()) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok((op, payload))
}

pub fn write_request(writer: &mut impl Write, request: &Request) -> io::Result<()> {
    write_frame(writer, request.op(), &request.encode_payload())
}

pub fn read_request(reader: &mut impl Read) -> Result<Request, Error> {
    let (op, payload) =
        read_frame(reader).map_err(|e| Error::ProtocolViolation(format!("read failed: {e}")))?;
    Request::decode_payload(op, &payload)
}

pub fn write_reply(writer: &mut impl Write, reply: &Reply) -> io::Result<()> {
    let mut buf = Vec::new();
    buf.push(reply.status.to_wire());
    if let Some(message) = &reply.message {
        write_bounded(&mut buf, message.as_str());
    }
    writer.write_all(&buf)?;
    writer.flush()
}

pub fn read_reply(reader: &mut impl Read) -> Result<Reply, Error> {
    let mut status_byte = [0u8; 1];
    reader
        .read_exact(&mut status_byte)
        .map_err(|e| Error::ChannelClosed.tap_io(e))?;
    let status = ErrorKind::from_wire(status_byte[0]);
    let message = if status == ErrorKind::Ok {
        None
    } else {
        Some(read_bounded::<MAX_MESSAGE_LEN>(reader)?)
    };
    Ok(Reply { status, message })
}

// Small helper so a broken-pipe `io::Error` reads naturally as
// `Error::ChannelClosed` at call sites without losing the log-worthy
// underlying cause.
impl Error {
    fn tap_io(self, cause: io::Error) -> Error {
        tracing::debug!(error = %cause, "channel read failed");
        self
    }
}

fn write_bounded(buf: &mut Vec<u8>, s: &str) {
    let len = s.len() as u16;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn read_bounded<const N: usize>(cursor: &mut &[u8]) -> Result<BoundedString<N>, Error> {
    if cursor.len() < 2 {
        return Err(Error::ProtocolViolation(
            "truncated bounded string length".to_string(),
        ));
    }
    let len = u16::from_le_bytes([cursor[0], cursor[1]]) as usize;
    *cursor = &cursor[2..];
    if cursor.len() < len {
        return Err(Error::ProtocolViolation(
            "truncated bounded string payload".to_string(),
        ));
    }
    let (bytes, rest) = cursor.split_at(len);
    *cursor = rest;
    let s = std::str::from_utf8(bytes)
        .map_err(|_| Error::ProtocolViolation("bounded string is not valid UTF-8".to_string()))?;
    BoundedString::new(s)
}

fn read_bounded_from_reader<const N: usize>(reader: &mut impl Read) -> Result<BoundedString<N>, Error> {
    let mut len_bytes = [0u8; 2];
    reader
        .read_exact(&mut len_bytes)
        .map_err(|e| Error::ProtocolViolation(format!("failed to read length prefix: {e}")))?;
    let len = u16::from_le_bytes(len_bytes) as usize;
    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .map_err(|e| Error::ProtocolViolation(format!("failed to read bounded payload: {e}")))?;
    let s = std::str::from_utf8(&bytes)
        .map_err(|_| Error::ProtocolViolation("bounded string is not valid UTF-8".to_string()))?;
    BoundedString::new(s)
}

// `read_bounded` operates on an in-memory cursor (reply/request payloads
// are read whole before decoding); `read_reply`'s message tail is the one
// place we decode directly off a live reader, so route it through the
// reader-based helper instead of duplicating the cursor logic.
#[doc(hidden)]
pub(crate) fn read_bounded_tail<const N: usize>(
    reader: &mut impl Read,
) -> Result<BoundedString<N>, Error> {
    read_bounded_from_reader(reader)
}

/// Total size, in bytes, of a fatal record written on the control pipe.
/// Fixed so the host's `write(2)` call is a single, constant-size,
/// pipe-buffer-atomic operation regardless of message length.
pub const FATAL_RECORD_LEN: usize = 256;
/// Message bytes available inside a fatal record once the 1-byte op and
/// 2-byte length prefix are subtracted.
pub const FATAL_RECORD_MAX_MESSAGE_LEN: usize = FATAL_RECORD_LEN - 1 - 2;

/// The fixed-size marker `fatal()` writes to the control pipe. See the
/// signal-safety requirements in §4.4: this type's `encode`/`decode` never
/// allocate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalRecord {
    pub message: BoundedString<FATAL_RECORD_MAX_MESSAGE_LEN>,
}

impl FatalRecord {
    pub fn new(message: &str) -> FatalRecord {
        FatalRecord {
            message: BoundedString::truncated(message),
        }
    }

    /// Encodes into a caller-owned, fixed-size buffer. No heap allocation.
    pub fn encode(&self) -> [u8; FATAL_RECORD_LEN] {
        let mut buf = [0u8; FATAL_RECORD_LEN];
        buf[0] = Op::Fatal as u8;
        let bytes = self.message.as_str().as_bytes();
        let len = bytes.len() as u16;
        buf[1..3].copy_from_slice(&len.to_le_bytes());
        buf[3..3 + bytes.len()].copy_from_slice(bytes);
        buf
    }

    pub fn decode(buf: &[u8; FATAL_RECORD_LEN]) -> Result<FatalRecord, Error> {
        if Op::from_wire(buf[0])? != Op::Fatal {
            return Err(Error::ProtocolViolation(
                "fatal record has the wrong op code".to_string(),
            ));
        }
        let len = u16::from_le_bytes([buf[1], buf[2]]) as usize;
        let len = len.min(FATAL_RECORD_MAX_MESSAGE_LEN);
        let s = std::str::from_utf8(&buf[3..3 + len])
            .map_err(|_| Error::ProtocolViolation("fatal record is not valid UTF-8".to_string()))?;
        Ok(FatalRecord {
            message: BoundedString::truncated(s),
        })
    }
}

/// The one-shot handshake the monitor writes on the ack pipe right after
/// binding its listen socket, and the host reads back from `init()`.
/// Unlike the fatal record, this is not on a signal path, so it may be
/// variable length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub status: ErrorKind,
    pub message: Option<BoundedString<MAX_MESSAGE_LEN>>,
}

impl Handshake {
    pub fn ok() -> Handshake {
        Handshake {
            status: ErrorKind::Ok,
            message: None,
        }
    }

    pub fn err(err: &Error) -> Handshake {
        Handshake {
            status: err.kind(),
            message: Some(BoundedString::truncated(&err.to_string())),
        }
    }

    pub fn write(&self, writer: &mut impl Write) -> io::Result<()> {
        let mut buf = Vec::new();
        buf.push(self.status.to_wire());
        let message = self.message.as_ref().map(|m| m.as_str()).unwrap_or("");
        let len = message.len() as u16;
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(message.as_bytes());
        writer.write_all(&buf)?;
        writer.flush()
    }

    pub fn read(reader: &mut impl Read) -> Result<Handshake, Error> {
        let mut status_byte = [0u8; 1];
        reader
            .read_exact(&mut status_byte)
            .map_err(|e| Error::HandshakeFailed(format!("failed to read status: {e}")))?;
        let status = ErrorKind::from_wire(status_byte[0]);
        let message = read_bounded_tail::<MAX_MESSAGE_LEN>(reader)?;
        Ok(Handshake {
            status,
            message: if message.as_str().is_empty() {
                None
            } else {
                Some(message)
            },
        })
    }

    pub fn into_result(self) -> Result<(), Error> {
        if self.status == ErrorKind::Ok {
            return Ok(());
        }
        let message = self
            .message
            .map(BoundedString::into_string)
            .unwrap_or_default();
        Err(Error::HandshakeFailed(message))
    }
}

/// A single status byte: the fatal acknowledgement written by the monitor
/// once it has finished dispatching a fatal trace request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatalAck {
    pub status: ErrorKind,
}

impl FatalAck {
    pub fn write(&self, writer: &mut impl Write) -> io::Result<()> {
        writer.write_all(&[self.status.to_wire()])?;
        writer.flush()
    }

    pub fn read(reader: &mut impl Read) -> io::Result<FatalAck> {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte)?;
        Ok(FatalAck {
            status: ErrorKind::from_wire(byte[0]),
        })
    }
}

/// The reply to a [`Request::Stats`]: a fixed-width snapshot of the
/// invoker's queue depth, lifetime tracer invocation count, and whether a
/// tracer is currently running. Separate from [`Reply`] since there is no
/// error status to carry — a `Stats` request cannot fail once admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsReply {
    pub queue_depth: u32,
    pub total_invocations: u64,
    pub tracer_running: bool,
}

impl StatsReply {
    pub fn write(&self, writer: &mut impl Write) -> io::Result<()> {
        let mut buf = [0u8; 13];
        buf[0..4].copy_from_slice(&self.queue_depth.to_le_bytes());
        buf[4..12].copy_from_slice(&self.total_invocations.to_le_bytes());
        buf[12] = self.tracer_running as u8;
        writer.write_all(&buf)?;
        writer.flush()
    }

    pub fn read(reader: &mut impl Read) -> io::Result<StatsReply> {
        let mut buf = [0u8; 13];
        reader.read_exact(&mut buf)?;
        Ok(StatsReply {
            queue_depth: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            total_invocations: u64::from_le_bytes(buf[4..12].try_into().unwrap()),
            tracer_running: buf[12] != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn request_roundtrip_kv_set() {
        let req = Request::KvSet {
            key: BoundedString::new("app").unwrap(),
            value: BoundedString::new("svc").unwrap(),
        };
        let mut buf = Vec::new();
        write_request(&mut buf, &req).unwrap();
        let mut cursor = Cursor::new(buf);
        let decoded = read_request(&mut cursor).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn request_roundtrip_emit_and_detach() {
        for req in [
            Request::Emit {
                message: BoundedString::new("boom").unwrap(),
            },
            Request::Detach,
            Request::Stats,
            Request::KvDelete {
                key: BoundedString::new("app").unwrap(),
            },
        ] {
            let mut buf = Vec::new();
            write_request(&mut buf, &req).unwrap();
            let mut cursor = Cursor::new(buf);
            assert_eq!(read_request(&mut cursor).unwrap(), req);
        }
    }

    #[test]
    fn reply_roundtrip_ok_and_err() {
        let mut buf = Vec::new();
        write_reply(&mut buf, &Reply::ok()).unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(read_reply(&mut cursor).unwrap(), Reply::ok());

        let err = Error::QueueFull;
        let reply = Reply::err(&err);
        let mut buf = Vec::new();
        write_reply(&mut buf, &reply).unwrap();
        let mut cursor = Cursor::new(buf);
        let decoded = read_reply(&mut cursor).unwrap();
        assert_eq!(decoded.status, ErrorKind::QueueFull);
    }

    #[test]
    fn fatal_record_roundtrip() {
        let record = FatalRecord::new("segmentation fault");
        let encoded = record.encode();
        assert_eq!(encoded.len(), FATAL_RECORD_LEN);
        let decoded = FatalRecord::decode(&encoded).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn fatal_record_truncates_long_messages_and_stays_fixed_size() {
        let long = "x".repeat(10_000);
        let record = FatalRecord::new(&long);
        let encoded = record.encode();
        assert_eq!(encoded.len(), FATAL_RECORD_LEN);
        let decoded = FatalRecord::decode(&encoded).unwrap();
        assert!(decoded.message.as_str().len() <= FATAL_RECORD_MAX_MESSAGE_LEN);
    }

    #[test]
    fn handshake_roundtrip() {
        let mut buf = Vec::new();
        Handshake::ok().write(&mut buf).unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(Handshake::read(&mut cursor).unwrap(), Handshake::ok());
    }

    #[test]
    fn stats_reply_roundtrip() {
        let stats = StatsReply {
            queue_depth: 7,
            total_invocations: 4242,
            tracer_running: true,
        };
        let mut buf = Vec::new();
        stats.write(&mut buf).unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(StatsReply::read(&mut cursor).unwrap(), stats);
    }

    #[test]
    fn fatal_ack_roundtrip() {
        let ack = FatalAck {
            status: ErrorKind::Ok,
        };
        let mut buf = Vec::new();
        ack.write(&mut buf).unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(FatalAck::read(&mut cursor).unwrap(), ack);
    }
}
