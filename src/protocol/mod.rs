//! Protocol module - wire format, message shapes and status codes.
//!
//! This module implements the store's control protocol:
//! - 8-byte length-prefixed framing
//! - JSON requests and typed replies
//! - Payload descriptors and server status codes

mod message;
mod payload;
mod status;
mod wire_format;

pub use message::{
    decode_reply, CreateBufferReply, DropNameReply, GetBuffersReply, GetNameReply, PutNameReply,
    RegisterReply, Reply, Request, STORE_TYPE,
};
pub use payload::Payload;
pub use status::StatusCode;
pub use wire_format::{
    decode_length, encode_length, frame_message, read_message, write_message,
    DEFAULT_MAX_MESSAGE_SIZE, LENGTH_PREFIX_SIZE,
};
