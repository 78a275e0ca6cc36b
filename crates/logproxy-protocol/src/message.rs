//! Typed message payloads.
//!
//! Strings are encoded as `len:u32 BE` followed by UTF-8 bytes.
//!
//! ```text
//! HandshakeRequest (type=1)
//!   log_type:u8  client_id  ip  version  configuration  enable_monitor:u8
//!
//! HandshakeResponse (type=2)
//!   success:u8  code:i32  message  server_ip  server_version
//!
//! Data (type=6)
//!   compress:u8  count:u32  { len:u32 bytes }*count
//!
//! Error (type=0xFFFF)
//!   code:i32  message
//! ```

use std::fmt;

use chrono::Utc;
use logproxy_core::{ClientId, ClientMeta, DomainError, DomainResult, LogType, PeerInfo};
use thiserror::Error;

use crate::frame::{Frame, MessageType};

// ============================================================================
// Error codes
// ============================================================================

/// Outcome codes carried by HandshakeResponse and Error frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Success,
    BadHandshake,
    ResolveFailed,
    AuthFailed,
    SpawnFailed,
    QuotaExceeded,
    DuplicateClient,
    InitTimeout,
    ForceClosed,
    /// A code this build does not know, preserved as received.
    Other(i32),
}

impl ErrorCode {
    pub fn code(self) -> i32 {
        match self {
            ErrorCode::Success => 0,
            ErrorCode::BadHandshake => 1,
            ErrorCode::ResolveFailed => 2,
            ErrorCode::AuthFailed => 3,
            ErrorCode::SpawnFailed => 4,
            ErrorCode::QuotaExceeded => 5,
            ErrorCode::DuplicateClient => 6,
            ErrorCode::InitTimeout => 7,
            ErrorCode::ForceClosed => 8,
            ErrorCode::Other(code) => code,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            0 => ErrorCode::Success,
            1 => ErrorCode::BadHandshake,
            2 => ErrorCode::ResolveFailed,
            3 => ErrorCode::AuthFailed,
            4 => ErrorCode::SpawnFailed,
            5 => ErrorCode::QuotaExceeded,
            6 => ErrorCode::DuplicateClient,
            7 => ErrorCode::InitTimeout,
            8 => ErrorCode::ForceClosed,
            other => ErrorCode::Other(other),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::Success => "success",
            ErrorCode::BadHandshake => "bad_handshake",
            ErrorCode::ResolveFailed => "resolve_failed",
            ErrorCode::AuthFailed => "auth_failed",
            ErrorCode::SpawnFailed => "spawn_failed",
            ErrorCode::QuotaExceeded => "quota_exceeded",
            ErrorCode::DuplicateClient => "duplicate_client",
            ErrorCode::InitTimeout => "init_timeout",
            ErrorCode::ForceClosed => "force_closed",
            ErrorCode::Other(code) => return write!(f, "code_{code}"),
        };
        f.write_str(name)
    }
}

// ============================================================================
// Payload errors
// ============================================================================

/// Errors raised while decoding a frame payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("payload truncated while reading {field}")]
    Truncated { field: &'static str },

    #[error("{field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },

    #[error("{extra} unexpected bytes after payload")]
    TrailingBytes { extra: usize },
}

struct PayloadReader<'a> {
    buf: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], PayloadError> {
        if self.buf.len() < n {
            return Err(PayloadError::Truncated { field });
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, PayloadError> {
        let bytes = self.take(1, field)?;
        bytes.first().copied().ok_or(PayloadError::Truncated { field })
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, PayloadError> {
        let bytes = self.take(4, field)?;
        let arr: [u8; 4] = bytes.try_into().map_err(|_| PayloadError::Truncated { field })?;
        Ok(u32::from_be_bytes(arr))
    }

    fn i32(&mut self, field: &'static str) -> Result<i32, PayloadError> {
        let bytes = self.take(4, field)?;
        let arr: [u8; 4] = bytes.try_into().map_err(|_| PayloadError::Truncated { field })?;
        Ok(i32::from_be_bytes(arr))
    }

    fn bytes(&mut self, field: &'static str) -> Result<&'a [u8], PayloadError> {
        let len = self.u32(field)? as usize;
        self.take(len, field)
    }

    fn string(&mut self, field: &'static str) -> Result<String, PayloadError> {
        let bytes = self.bytes(field)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| PayloadError::InvalidUtf8 { field })
    }

    fn finish(self) -> Result<(), PayloadError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(PayloadError::TrailingBytes {
                extra: self.buf.len(),
            })
        }
    }
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    let len = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(bytes);
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    put_bytes(out, s.as_bytes());
}

// ============================================================================
// Messages
// ============================================================================

/// First frame a client sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Raw log type code, validated when converted to [`ClientMeta`].
    pub log_type: u8,
    pub client_id: String,
    pub ip: String,
    /// Client software version.
    pub version: String,
    /// Tenant configuration blob.
    pub configuration: String,
    pub enable_monitor: bool,
}

impl HandshakeRequest {
    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.log_type);
        put_str(out, &self.client_id);
        put_str(out, &self.ip);
        put_str(out, &self.version);
        put_str(out, &self.configuration);
        out.push(u8::from(self.enable_monitor));
    }

    fn decode(buf: &[u8]) -> Result<Self, PayloadError> {
        let mut r = PayloadReader::new(buf);
        let msg = Self {
            log_type: r.u8("log_type")?,
            client_id: r.string("client_id")?,
            ip: r.string("ip")?,
            version: r.string("version")?,
            configuration: r.string("configuration")?,
            enable_monitor: r.u8("enable_monitor")? != 0,
        };
        r.finish()?;
        Ok(msg)
    }

    /// Converts the request into registry metadata for `peer`.
    ///
    /// Fails on an unknown log type or a blank client id.
    pub fn to_client_meta(&self, peer: PeerInfo, packet_version: u16) -> DomainResult<ClientMeta> {
        let log_type = LogType::from_code(self.log_type)?;
        let id = ClientId::new(self.client_id.trim());
        if !id.is_path_safe() {
            return Err(DomainError::InvalidFieldValue {
                field: "client_id".to_string(),
                value: self.client_id.clone(),
                expected: "non-empty id without path separators".to_string(),
            });
        }

        Ok(ClientMeta {
            log_type,
            id,
            ip: self.ip.clone(),
            version: self.version.clone(),
            packet_version,
            configuration: self.configuration.clone(),
            peer,
            register_time: Utc::now(),
            enable_monitor: self.enable_monitor,
        })
    }
}

/// Reply to a successful (or failed) handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub success: bool,
    pub code: ErrorCode,
    pub message: String,
    pub server_ip: String,
    pub server_version: String,
}

impl HandshakeResponse {
    pub fn success(server_ip: impl Into<String>, server_version: impl Into<String>) -> Self {
        Self {
            success: true,
            code: ErrorCode::Success,
            message: String::new(),
            server_ip: server_ip.into(),
            server_version: server_version.into(),
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(u8::from(self.success));
        out.extend_from_slice(&self.code.code().to_be_bytes());
        put_str(out, &self.message);
        put_str(out, &self.server_ip);
        put_str(out, &self.server_version);
    }

    fn decode(buf: &[u8]) -> Result<Self, PayloadError> {
        let mut r = PayloadReader::new(buf);
        let msg = Self {
            success: r.u8("success")? != 0,
            code: ErrorCode::from_code(r.i32("code")?),
            message: r.string("message")?,
            server_ip: r.string("server_ip")?,
            server_version: r.string("server_version")?,
        };
        r.finish()?;
        Ok(msg)
    }
}

/// Terminal error reported to a client before its connection is closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorMessage {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.code.code().to_be_bytes());
        put_str(out, &self.message);
    }

    fn decode(buf: &[u8]) -> Result<Self, PayloadError> {
        let mut r = PayloadReader::new(buf);
        let msg = Self {
            code: ErrorCode::from_code(r.i32("code")?),
            message: r.string("message")?,
        };
        r.finish()?;
        Ok(msg)
    }
}

/// Batch of opaque change records sent by a worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataBatch {
    pub records: Vec<Vec<u8>>,
}

impl DataBatch {
    const PLAIN: u8 = 0;

    pub fn new(records: Vec<Vec<u8>>) -> Self {
        Self { records }
    }

    /// Encoded payload size, used to split batches under the frame limit.
    pub fn encoded_len(&self) -> usize {
        5 + self.records.iter().map(|r| 4 + r.len()).sum::<usize>()
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(Self::PLAIN);
        let count = u32::try_from(self.records.len()).unwrap_or(u32::MAX);
        out.extend_from_slice(&count.to_be_bytes());
        for record in &self.records {
            put_bytes(out, record);
        }
    }

    fn decode(buf: &[u8]) -> Result<Self, PayloadError> {
        let mut r = PayloadReader::new(buf);
        let _compress = r.u8("compress")?;
        let count = r.u32("count")?;
        let mut records = Vec::new();
        for _ in 0..count {
            records.push(r.bytes("record")?.to_vec());
        }
        r.finish()?;
        Ok(Self { records })
    }
}

/// Any message the protocol carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    HandshakeRequest(HandshakeRequest),
    HandshakeResponse(HandshakeResponse),
    Data(DataBatch),
    Error(ErrorMessage),
}

impl Message {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Message::Error(ErrorMessage::new(code, message))
    }

    pub fn msg_type(&self) -> MessageType {
        match self {
            Message::HandshakeRequest(_) => MessageType::HandshakeRequest,
            Message::HandshakeResponse(_) => MessageType::HandshakeResponse,
            Message::Data(_) => MessageType::Data,
            Message::Error(_) => MessageType::Error,
        }
    }

    /// Builds the frame for this message at protocol `version`.
    pub fn to_frame(&self, version: u16) -> Frame {
        let mut payload = Vec::new();
        match self {
            Message::HandshakeRequest(m) => m.encode(&mut payload),
            Message::HandshakeResponse(m) => m.encode(&mut payload),
            Message::Data(m) => m.encode(&mut payload),
            Message::Error(m) => m.encode(&mut payload),
        }
        Frame::new(self.msg_type(), version, payload)
    }

    /// Decodes the payload of `frame`.
    pub fn from_frame(frame: &Frame) -> Result<Self, PayloadError> {
        let payload = frame.payload.as_slice();
        Ok(match frame.msg_type {
            MessageType::HandshakeRequest => Message::HandshakeRequest(HandshakeRequest::decode(payload)?),
            MessageType::HandshakeResponse => {
                Message::HandshakeResponse(HandshakeResponse::decode(payload)?)
            }
            MessageType::Data => Message::Data(DataBatch::decode(payload)?),
            MessageType::Error => Message::Error(ErrorMessage::decode(payload)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> HandshakeRequest {
        HandshakeRequest {
            log_type: 0,
            client_id: "c1".to_string(),
            ip: "10.0.0.9".to_string(),
            version: "2.0.0".to_string(),
            configuration: "cluster_user=u cluster_password=p".to_string(),
            enable_monitor: true,
        }
    }

    fn peer() -> PeerInfo {
        PeerInfo::new(1, "127.0.0.1:5000".parse().unwrap(), 9)
    }

    #[test]
    fn test_handshake_request_frame() {
        let msg = Message::HandshakeRequest(request());
        let frame = msg.to_frame(2);
        assert_eq!(frame.msg_type, MessageType::HandshakeRequest);
        assert_eq!(Message::from_frame(&frame).unwrap(), msg);
    }

    #[test]
    fn test_error_frame_layout() {
        let frame = Message::error(ErrorCode::QuotaExceeded, "full").to_frame(2);
        assert_eq!(&frame.payload[..4], &5i32.to_be_bytes());
        assert_eq!(&frame.payload[4..8], &4u32.to_be_bytes());
        assert_eq!(&frame.payload[8..], b"full");
    }

    #[test]
    fn test_truncated_payload() {
        let mut frame = Message::HandshakeRequest(request()).to_frame(2);
        frame.payload.truncate(frame.payload.len() - 1);
        assert_eq!(
            Message::from_frame(&frame).unwrap_err(),
            PayloadError::Truncated { field: "enable_monitor" }
        );
    }

    #[test]
    fn test_invalid_utf8() {
        let mut payload = vec![0u8];
        payload.extend_from_slice(&2u32.to_be_bytes());
        payload.extend_from_slice(&[0xC3, 0x28]);
        let frame = Frame::new(MessageType::HandshakeRequest, 2, payload);
        assert_eq!(
            Message::from_frame(&frame).unwrap_err(),
            PayloadError::InvalidUtf8 { field: "client_id" }
        );
    }

    #[test]
    fn test_huge_string_length_is_truncation() {
        let mut payload = vec![0u8];
        payload.extend_from_slice(&u32::MAX.to_be_bytes());
        let frame = Frame::new(MessageType::HandshakeRequest, 2, payload);
        assert!(matches!(
            Message::from_frame(&frame),
            Err(PayloadError::Truncated { field: "client_id" })
        ));
    }

    #[test]
    fn test_data_batch() {
        let batch = DataBatch::new(vec![b"r1".to_vec(), Vec::new(), b"record-3".to_vec()]);
        let frame = Message::Data(batch.clone()).to_frame(2);
        assert_eq!(frame.payload.len(), batch.encoded_len());
        assert_eq!(Message::from_frame(&frame).unwrap(), Message::Data(batch));
    }

    #[test]
    fn test_to_client_meta() {
        let meta = request().to_client_meta(peer(), 2).unwrap();
        assert_eq!(meta.id, ClientId::new("c1"));
        assert_eq!(meta.log_type, LogType::OceanBase);
        assert_eq!(meta.packet_version, 2);
        assert!(meta.enable_monitor);
    }

    #[test]
    fn test_to_client_meta_rejects_bad_fields() {
        let mut bad_type = request();
        bad_type.log_type = 3;
        assert!(bad_type.to_client_meta(peer(), 2).is_err());

        let mut blank = request();
        blank.client_id = "   ".to_string();
        assert!(blank.to_client_meta(peer(), 2).is_err());

        let mut escaping = request();
        escaping.client_id = "../etc".to_string();
        assert!(escaping.to_client_meta(peer(), 2).is_err());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(ErrorCode::from_code(ErrorCode::DuplicateClient.code()), ErrorCode::DuplicateClient);
        assert_eq!(ErrorCode::from_code(99), ErrorCode::Other(99));
        assert_eq!(ErrorCode::AuthFailed.to_string(), "auth_failed");
    }
}
