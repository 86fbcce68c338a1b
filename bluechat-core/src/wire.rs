//! Framing: `sender#body` delimited text (default) or length-prefix (4 bytes LE) + bincode payload.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::protocol::Message;

/// Separator between sender name and body in delimited frames.
pub const DELIMITER: char = '#';

/// Read buffer capacity; one read is one delimited frame.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;

const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// How chat messages are framed on the stream. Both peers must agree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FrameFormat {
    /// `sender#body`, no length, no escaping. Wire-compatible with existing peers.
    #[default]
    Delimited,
    /// Length-prefixed bincode. Survives `#` in names and messages split across reads.
    LengthPrefixed,
}

/// Encode a message as `sender_name#body` bytes.
pub fn encode_message(msg: &Message) -> Vec<u8> {
    let mut out = String::with_capacity(msg.sender_name.len() + 1 + msg.body.len());
    out.push_str(&msg.sender_name);
    out.push(DELIMITER);
    out.push_str(&msg.body);
    out.into_bytes()
}

/// Decode one delimited frame. Never fails: invalid UTF-8 is replaced, and a
/// buffer without a delimiter yields the whole text as both sender and body.
///
/// Sender is everything before the last `#`, body everything after the first `#`,
/// so `a#b#c` decodes to sender `a#b` and body `b#c`.
pub fn decode_message(bytes: &[u8], is_local_origin: bool) -> Message {
    let text = String::from_utf8_lossy(bytes);
    let sender_name = match text.rfind(DELIMITER) {
        Some(i) => &text[..i],
        None => &text[..],
    };
    let body = match text.find(DELIMITER) {
        Some(i) => &text[i + DELIMITER.len_utf8()..],
        None => &text[..],
    };
    Message {
        sender_name: sender_name.to_string(),
        body: body.to_string(),
        is_local_origin,
    }
}

/// Chat payload carried inside a length-prefixed frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatFrame {
    pub sender_name: String,
    pub body: String,
}

impl From<&Message> for ChatFrame {
    fn from(msg: &Message) -> Self {
        Self {
            sender_name: msg.sender_name.clone(),
            body: msg.body.clone(),
        }
    }
}

impl ChatFrame {
    pub fn into_message(self, is_local_origin: bool) -> Message {
        Message {
            sender_name: self.sender_name,
            body: self.body,
            is_local_origin,
        }
    }
}

/// Encode a value into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(value).map_err(FrameEncodeError::Encode)?;
    let len = payload.len();
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + len);
    out.extend_from_slice(&(len as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding a value into a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the value and the number of bytes consumed.
/// Call with partial buffer; returns error if not enough bytes (caller should try again after more data).
pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<(T, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let value: T =
        bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + len]).map_err(FrameDecodeError::Decode)?;
    Ok((value, LEN_SIZE + len))
}

/// Error decoding a frame (need more bytes, too large, or bincode failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

/// Encode a chat message in the given format.
pub fn encode_chat(format: FrameFormat, msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    match format {
        FrameFormat::Delimited => Ok(encode_message(msg)),
        FrameFormat::LengthPrefixed => encode_frame(&ChatFrame::from(msg)),
    }
}

/// Reassembles length-prefixed chat frames from arbitrary read boundaries.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, or `Ok(None)` if more bytes are needed.
    pub fn next_message(&mut self, is_local_origin: bool) -> Result<Option<Message>, FrameDecodeError> {
        match decode_frame::<ChatFrame>(&self.buf) {
            Ok((frame, n)) => {
                self.buf.drain(..n);
                Ok(Some(frame.into_message(is_local_origin)))
            }
            Err(FrameDecodeError::NeedMore) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
