//! ## Commux wire codec
//!
//! The message model shared by every transport and protocol in the
//! gateway, plus the built-in frame layout: a 4 byte big-endian length
//! prefix followed by a JSON body. The decoder is incremental so stream
//! transports can feed it partial reads and datagram transports can feed
//! it whole packets with the same code path.

pub mod frame;
pub mod message;

pub use self::{
    frame::{Decoder, FrameError, MAX_FRAME_SIZE, encode, frame_size},
    message::{Fault, Message, MessageId, Value, ValueKind, faults},
};
