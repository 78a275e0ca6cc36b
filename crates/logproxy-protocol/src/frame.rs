//! Frame layer: header framing and size limits.
//!
//! Every message on the wire is one frame:
//!
//! ```text
//! [0..2]  type    (u16 BE, see MessageType)
//! [2..4]  version (u16 BE, see ProtocolVersion)
//! [4..8]  size    (u32 BE, payload length in bytes)
//! [8..]   payload (exactly `size` bytes)
//! ```
//!
//! Decoding is pure and allocation is bounded by the configured maximum:
//! the declared size is checked against it before any payload is copied.

use thiserror::Error;

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 8;

/// Kind of message carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    HandshakeRequest,
    HandshakeResponse,
    Data,
    Error,
}

impl MessageType {
    pub const fn code(self) -> u16 {
        match self {
            MessageType::HandshakeRequest => 1,
            MessageType::HandshakeResponse => 2,
            MessageType::Data => 6,
            MessageType::Error => 0xFFFF,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(MessageType::HandshakeRequest),
            2 => Some(MessageType::HandshakeResponse),
            6 => Some(MessageType::Data),
            0xFFFF => Some(MessageType::Error),
            _ => None,
        }
    }
}

/// Errors raised while framing bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("buffer truncated: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: u32, max: u32 },

    /// The header is well formed but names a type this build does not know.
    /// `size` lets a stream reader discard the payload and stay in sync.
    #[error("unknown message type {code} ({size} byte payload)")]
    UnknownMessageType { code: u16, size: u32 },

    #[error("{extra} trailing bytes after frame")]
    TrailingBytes { extra: usize },
}

impl FramingError {
    /// Unknown message types do not desynchronize the stream.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, FramingError::UnknownMessageType { .. })
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub msg_type: MessageType,
    pub version: u16,
    pub size: u32,
}

/// One complete frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: MessageType,
    pub version: u16,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(msg_type: MessageType, version: u16, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            version,
            payload,
        }
    }

    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            msg_type: self.msg_type,
            version: self.version,
            size: u32::try_from(self.payload.len()).unwrap_or(u32::MAX),
        }
    }
}

/// Encoder/decoder with a payload size limit.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_payload: u32,
}

impl FrameCodec {
    pub fn new(max_payload: u32) -> Self {
        Self { max_payload }
    }

    pub fn max_payload(&self) -> u32 {
        self.max_payload
    }

    /// Decodes and validates a header.
    ///
    /// The size limit is checked before the type so oversized frames of an
    /// unknown type are still rejected as fatal.
    pub fn decode_header(&self, buf: &[u8; HEADER_LEN]) -> Result<FrameHeader, FramingError> {
        let code = u16::from_be_bytes([buf[0], buf[1]]);
        let version = u16::from_be_bytes([buf[2], buf[3]]);
        let size = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);

        if size > self.max_payload {
            return Err(FramingError::FrameTooLarge {
                size,
                max: self.max_payload,
            });
        }

        let msg_type =
            MessageType::from_code(code).ok_or(FramingError::UnknownMessageType { code, size })?;

        Ok(FrameHeader {
            msg_type,
            version,
            size,
        })
    }

    /// Decodes a buffer holding exactly one frame.
    pub fn decode(&self, buf: &[u8]) -> Result<Frame, FramingError> {
        let header: &[u8; HEADER_LEN] = buf
            .get(..HEADER_LEN)
            .and_then(|h| h.try_into().ok())
            .ok_or(FramingError::Truncated {
                needed: HEADER_LEN,
                got: buf.len(),
            })?;
        let header = self.decode_header(header)?;

        let needed = HEADER_LEN + header.size as usize;
        if buf.len() < needed {
            return Err(FramingError::Truncated {
                needed,
                got: buf.len(),
            });
        }
        if buf.len() > needed {
            return Err(FramingError::TrailingBytes {
                extra: buf.len() - needed,
            });
        }

        Ok(Frame {
            msg_type: header.msg_type,
            version: header.version,
            payload: buf.get(HEADER_LEN..).map(<[u8]>::to_vec).unwrap_or_default(),
        })
    }

    /// Encodes a frame, rejecting payloads above the limit.
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>, FramingError> {
        let size = u32::try_from(frame.payload.len()).unwrap_or(u32::MAX);
        if size > self.max_payload {
            return Err(FramingError::FrameTooLarge {
                size,
                max: self.max_payload,
            });
        }

        let mut out = Vec::with_capacity(HEADER_LEN + frame.payload.len());
        out.extend_from_slice(&frame.msg_type.code().to_be_bytes());
        out.extend_from_slice(&frame.version.to_be_bytes());
        out.extend_from_slice(&size.to_be_bytes());
        out.extend_from_slice(&frame.payload);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> FrameCodec {
        FrameCodec::new(1024)
    }

    #[test]
    fn test_encode_decode() {
        let frame = Frame::new(MessageType::Error, 2, b"payload".to_vec());
        let bytes = codec().encode(&frame).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xFF]);
        assert_eq!(&bytes[4..8], &7u32.to_be_bytes());
        assert_eq!(codec().decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_empty_payload() {
        let frame = Frame::new(MessageType::HandshakeResponse, 0, Vec::new());
        let bytes = codec().encode(&frame).unwrap();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(codec().decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_oversize_rejected_from_header_alone() {
        let mut header = [0u8; HEADER_LEN];
        header[1] = 1;
        header[4..8].copy_from_slice(&4096u32.to_be_bytes());
        assert_eq!(
            codec().decode_header(&header),
            Err(FramingError::FrameTooLarge { size: 4096, max: 1024 })
        );
    }

    #[test]
    fn test_oversize_rejected_on_encode() {
        let frame = Frame::new(MessageType::Data, 2, vec![0; 2048]);
        assert!(matches!(
            codec().encode(&frame),
            Err(FramingError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_unknown_type_is_not_fatal() {
        let mut bytes = vec![0x00, 0x2A, 0x00, 0x02];
        bytes.extend_from_slice(&3u32.to_be_bytes());
        bytes.extend_from_slice(b"abc");

        let err = codec().decode(&bytes).unwrap_err();
        assert_eq!(err, FramingError::UnknownMessageType { code: 42, size: 3 });
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_truncated() {
        assert!(matches!(
            codec().decode(&[0, 1, 0]),
            Err(FramingError::Truncated { needed: 8, got: 3 })
        ));

        let frame = Frame::new(MessageType::Data, 2, b"12345".to_vec());
        let bytes = codec().encode(&frame).unwrap();
        let err = codec().decode(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, FramingError::Truncated { needed: 13, got: 12 }));
    }

    #[test]
    fn test_trailing_bytes() {
        let frame = Frame::new(MessageType::Data, 2, b"x".to_vec());
        let mut bytes = codec().encode(&frame).unwrap();
        bytes.push(0);
        assert_eq!(
            codec().decode(&bytes),
            Err(FramingError::TrailingBytes { extra: 1 })
        );
    }

    #[test]
    fn test_message_type_codes() {
        for ty in [
            MessageType::HandshakeRequest,
            MessageType::HandshakeResponse,
            MessageType::Data,
            MessageType::Error,
        ] {
            assert_eq!(MessageType::from_code(ty.code()), Some(ty));
        }
        assert_eq!(MessageType::from_code(3), None);
    }
}
