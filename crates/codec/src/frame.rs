use bytes::{BufMut, BytesMut};

use crate::message::Message;

/// Upper bound for one frame body. Anything larger is a protocol
/// violation; the length prefix is never trusted for allocation.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

const HEADER_SIZE: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame body of {0} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    Oversized(usize),
    #[error("malformed frame body: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Encode one message into `buf` as a length-prefixed frame.
///
/// # Example
///
/// ```
/// use bytes::BytesMut;
/// use commux_codec::{Message, MessageId, Value, encode, frame_size};
///
/// let message = Message::request(MessageId(1), "echo", "/", Value::from("hi"));
/// let mut buf = BytesMut::new();
/// encode(&message, &mut buf).unwrap();
///
/// assert_eq!(frame_size(&buf), Some(buf.len()));
/// ```
pub fn encode(message: &Message, buf: &mut BytesMut) -> Result<(), FrameError> {
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(FrameError::Oversized(body.len()));
    }

    buf.reserve(HEADER_SIZE + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    Ok(())
}

/// Total size of the frame starting at `buf`, header included, if the
/// header has arrived.
pub fn frame_size(buf: &[u8]) -> Option<usize> {
    if buf.len() < HEADER_SIZE {
        return None;
    }

    let body = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    Some(HEADER_SIZE + body)
}

/// Incremental frame decoder.
///
/// Callers append bytes as the transport delivers them and ask for
/// complete messages; partially received frames stay buffered.
///
/// # Example
///
/// ```
/// use bytes::BytesMut;
/// use commux_codec::{Decoder, Message, MessageId, Value, encode};
///
/// let message = Message::request(MessageId(9), "ping", "/", Value::Void);
/// let mut buf = BytesMut::new();
/// encode(&message, &mut buf).unwrap();
///
/// let mut decoder = Decoder::default();
/// decoder.extend(&buf[..3]);
/// assert!(decoder.decode().unwrap().is_none());
///
/// decoder.extend(&buf[3..]);
/// assert_eq!(decoder.decode().unwrap(), Some(message));
/// ```
#[derive(Debug, Default)]
pub struct Decoder {
    buf: BytesMut,
}

impl Decoder {
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Buffer for direct transport reads (`read_buf`).
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Bytes received but not yet consumed by a decoded message.
    pub fn has_pending(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Whether the next `decode` call would yield a message without
    /// further input.
    pub fn has_complete_frame(&self) -> bool {
        frame_size(&self.buf).is_some_and(|size| self.buf.len() >= size)
    }

    /// Pop the next complete message, if one has fully arrived.
    pub fn decode(&mut self) -> Result<Option<Message>, FrameError> {
        let Some(size) = frame_size(&self.buf) else {
            return Ok(None);
        };

        if size - HEADER_SIZE > MAX_FRAME_SIZE {
            return Err(FrameError::Oversized(size - HEADER_SIZE));
        }

        if self.buf.len() < size {
            return Ok(None);
        }

        let frame = self.buf.split_to(size);
        Ok(Some(serde_json::from_slice(&frame[HEADER_SIZE..])?))
    }
}
