//! Framing: ASCII decimal length immediately followed by a two-element JSON array,
//! `<len>["OPCODE", {...}]`. There is no delimiter; the length ends at the first non-digit,
//! which is also the first byte of the message.

use std::ops::Range;
use std::time::Duration;

use tracing::trace;

use crate::buffer::RecvBuffer;
use crate::error::{Result, SyncError};
use crate::protocol::{Opcode, OpcodeToken, Vocabulary, MAX_MESSAGE_LEN};
use crate::transport::ByteStream;

/// Longest accepted length field. Anything longer cannot be a valid length anyway.
const MAX_LEN_DIGITS: usize = 15;

/// Encode one message. An empty payload is sent as `{}`.
pub fn encode_frame(vocab: Vocabulary, op: Opcode, payload: &str) -> Result<Vec<u8>> {
    let payload = if payload.trim().is_empty() {
        "{}"
    } else {
        payload
    };
    let body = format!("[{}, {}]", vocab.token(op), payload);
    if body.len() > MAX_MESSAGE_LEN {
        return Err(SyncError::InvalidArgument(format!(
            "message too large: {} bytes",
            body.len()
        )));
    }
    let prefix = body.len().to_string();
    let mut out = Vec::with_capacity(prefix.len() + body.len());
    out.extend_from_slice(prefix.as_bytes());
    out.extend_from_slice(body.as_bytes());
    Ok(out)
}

/// Encode and send one message.
pub fn write_frame<S: ByteStream + ?Sized>(
    stream: &mut S,
    vocab: Vocabulary,
    op: Opcode,
    payload: &str,
) -> Result<()> {
    let frame = encode_frame(vocab, op, payload)?;
    trace!("send {}", String::from_utf8_lossy(&frame));
    stream.send_exact(&frame)
}

/// A decoded message. The payload lives in the receive buffer it was decoded into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: OpcodeToken,
    payload: Range<usize>,
}

impl Frame {
    /// Payload text. `buf` must be the buffer passed to `read_frame`, unmodified since.
    pub fn payload<'a>(&self, buf: &'a RecvBuffer) -> &'a str {
        buf.as_slice()
            .get(self.payload.clone())
            .and_then(|b| std::str::from_utf8(b).ok())
            .unwrap_or("")
    }

    pub fn opcode(&self) -> Option<Opcode> {
        match self.opcode {
            OpcodeToken::Known(op) => Some(op),
            OpcodeToken::Unknown(_) => None,
        }
    }
}

/// Read one message into `buf`. Every byte read is bounded by `timeout`.
pub fn read_frame<S: ByteStream + ?Sized>(
    stream: &mut S,
    buf: &mut RecvBuffer,
    timeout: Duration,
) -> Result<Frame> {
    let mut digits = [0u8; MAX_LEN_DIGITS];
    let mut n = 0;
    let first = loop {
        let mut byte = [0u8; 1];
        stream.recv_exact(&mut byte, timeout)?;
        if !byte[0].is_ascii_digit() {
            break byte[0];
        }
        if n == MAX_LEN_DIGITS {
            return Err(SyncError::Protocol("length field too long".into()));
        }
        digits[n] = byte[0];
        n += 1;
    };
    let len: usize = std::str::from_utf8(&digits[..n])
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    if len == 0 || len > MAX_MESSAGE_LEN {
        return Err(SyncError::Protocol(format!("invalid message length {len}")));
    }

    let slot = buf.fill_slot(len)?;
    slot[0] = first;
    stream.recv_exact(&mut slot[1..], timeout)?;

    let text = std::str::from_utf8(buf.as_slice())
        .map_err(|e| SyncError::JsonParse(format!("message is not UTF-8: {e}")))?;
    trace!("recv {}{}", len, text);
    let (opcode, payload) = split_message(text)?;
    Ok(Frame { opcode, payload })
}

/// Split `["OPCODE", payload]` into the opcode token and the payload's byte range.
/// Shape-based, not a general JSON parser.
pub fn split_message(text: &str) -> Result<(OpcodeToken, Range<usize>)> {
    let open = text
        .find('[')
        .ok_or_else(|| SyncError::JsonParse("missing opening bracket".into()))?;
    let after_open = open + 1;
    let rest = &text[after_open..];
    let token_at = after_open + (rest.len() - rest.trim_start().len());
    let tail = &text[token_at..];

    let (opcode, token_end) = if let Some(quoted) = tail.strip_prefix('"') {
        let close = quoted
            .find('"')
            .ok_or_else(|| SyncError::JsonParse("malformed opcode".into()))?;
        (OpcodeToken::parse(&quoted[..close], true), token_at + 1 + close + 1)
    } else {
        let len = tail.bytes().take_while(u8::is_ascii_digit).count();
        if len == 0 {
            return Err(SyncError::JsonParse("missing opcode".into()));
        }
        (OpcodeToken::parse(&tail[..len], false), token_at + len)
    };

    let skip = text[token_end..]
        .bytes()
        .take_while(|b| matches!(b, b',' | b' ' | b'\t' | b'\r' | b'\n'))
        .count();
    let start = token_end + skip;

    let trimmed = text.trim_end();
    let end = trimmed
        .strip_suffix(']')
        .map(|t| t.trim_end().len())
        .unwrap_or(trimmed.len())
        .max(start);
    Ok((opcode, start..end))
}
