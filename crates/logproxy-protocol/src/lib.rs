//! logproxy protocol - binary wire format
//!
//! This crate provides the framing and message types spoken between
//! logproxy and its clients:
//! - `frame` - fixed header, size limits and frame codec
//! - `message` - typed payloads and error codes
//! - `version` - protocol versions accepted in frame headers
//!
//! Decoding is pure: no I/O happens here. The daemon reads headers and
//! payloads from sockets and hands the bytes to this crate.

pub mod frame;
pub mod message;
pub mod version;

pub use frame::{Frame, FrameCodec, FrameHeader, FramingError, MessageType, HEADER_LEN};
pub use message::{
    DataBatch, ErrorCode, ErrorMessage, HandshakeRequest, HandshakeResponse, Message, PayloadError,
};
pub use version::{ProtocolVersion, VersionError};
