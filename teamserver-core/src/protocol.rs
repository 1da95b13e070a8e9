use std::collections::BTreeMap;

use anyhow::{Result, bail, ensure};
use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

const MAGIC: &[u8; 5] = b"TEAMS";
const WIRE_VERSION: u8 = 1;
/// `TEAMS` + version + type + flags(u16) + length(u32).
const HEADER_SIZE: usize = MAGIC.len() + 1 + 1 + 2 + 4;
/// Largest payload a peer may announce; anything bigger closes the connection.
pub const MAX_PAYLOAD: usize = 1 << 20;

/// Metadata key carrying the caller's bearer token.
pub const AUTHORIZATION_KEY: &str = "authorization";
const BEARER_PREFIX: &str = "Bearer ";

/// Kind of a frame on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Call = 0x01,
    Reply = 0x02,
    Error = 0x7F,
}

impl TryFrom<u8> for MessageType {
    type Error = anyhow::Error;

    fn try_from(code: u8) -> Result<Self> {
        Ok(match code {
            0x01 => Self::Call,
            0x02 => Self::Reply,
            0x7F => Self::Error,
            unknown => bail!("unknown message type 0x{unknown:02X}"),
        })
    }
}

impl From<MessageType> for u8 {
    fn from(kind: MessageType) -> Self {
        kind as Self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub msg_type: MessageType,
    /// Always zero for now.
    pub flags: u16,
    pub payload_length: u32,
}

impl Header {
    /// Parses the fixed-size header at the start of `bytes`, which must hold
    /// at least `HEADER_SIZE` bytes.
    fn parse(mut bytes: &[u8]) -> Result<Self> {
        ensure!(bytes.starts_with(MAGIC), "bad magic, not a teamserver frame");
        bytes.advance(MAGIC.len());

        let version = bytes.get_u8();
        ensure!(
            version == WIRE_VERSION,
            "unsupported version {version} (this build speaks {WIRE_VERSION})"
        );
        let msg_type = MessageType::try_from(bytes.get_u8())?;
        let flags = bytes.get_u16();
        let payload_length = bytes.get_u32();
        ensure!(
            payload_length as usize <= MAX_PAYLOAD,
            "payload too large: peer announced {payload_length} bytes, limit is {MAX_PAYLOAD}"
        );

        Ok(Self {
            version,
            msg_type,
            flags,
            payload_length,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Vec<u8>,
}

/// Pops the next complete frame off the front of `buf`.
///
/// `Ok(None)` means more bytes are needed; `buf` is not modified in that
/// case. The header is validated as soon as it is buffered, so a hostile
/// length is rejected before its payload arrives.
///
/// # Errors
///
/// Fails on a bad magic, an unknown version or message type, or an oversized
/// payload. The stream cannot be resynchronised after that.
pub fn try_decode_frame(buf: &mut BytesMut) -> Result<Option<Frame>> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }
    let header = Header::parse(&buf[..HEADER_SIZE])?;
    let frame_len = HEADER_SIZE + header.payload_length as usize;
    if buf.len() < frame_len {
        return Ok(None);
    }

    let mut raw = buf.split_to(frame_len);
    raw.advance(HEADER_SIZE);
    Ok(Some(Frame {
        header,
        payload: raw.to_vec(),
    }))
}

/// Appends one frame carrying `payload` to `buf`.
pub fn encode_frame(msg_type: MessageType, payload: &[u8], buf: &mut BytesMut) {
    debug_assert!(payload.len() <= MAX_PAYLOAD);
    buf.reserve(HEADER_SIZE + payload.len());
    buf.put_slice(MAGIC);
    buf.put_u8(WIRE_VERSION);
    buf.put_u8(msg_type.into());
    buf.put_u16(0);
    #[allow(clippy::cast_possible_truncation)] // capped at MAX_PAYLOAD
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
}

#[must_use]
pub fn encode_frame_to_bytes(msg_type: MessageType, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::new();
    encode_frame(msg_type, payload, &mut buf);
    buf
}

/// Body of a `Call` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallPayload {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub body: serde_json::Value,
}

/// Body of a `Reply` frame; `id` echoes the call it answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyPayload {
    pub id: u64,
    #[serde(default)]
    pub body: serde_json::Value,
}

/// Body of an `Error` frame. `id` is 0 when the failure is not tied to a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub id: u64,
    pub code: String,
    pub message: String,
}

/// Values of [`ErrorPayload::code`].
pub mod codes {
    pub const UNAUTHENTICATED: &str = "unauthenticated";
    pub const NOT_FOUND: &str = "not_found";
    pub const INVALID_ARGUMENT: &str = "invalid_argument";
    pub const INTERNAL: &str = "internal";
}

/// Builds call metadata carrying `authorization: Bearer <token>`.
#[must_use]
pub fn bearer_metadata(token: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(AUTHORIZATION_KEY.to_string(), format!("{BEARER_PREFIX}{token}"))])
}

/// Extracts the bearer token from call metadata, if well-formed.
#[must_use]
pub fn bearer_token(metadata: &BTreeMap<String, String>) -> Option<&str> {
    metadata
        .get(AUTHORIZATION_KEY)
        .and_then(|value| value.strip_prefix(BEARER_PREFIX))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Serializes `payload` as JSON and wraps it in a frame.
///
/// # Errors
///
/// Fails when serialization fails or the JSON exceeds [`MAX_PAYLOAD`].
pub fn encode_payload_frame<T: Serialize>(msg_type: MessageType, payload: &T) -> Result<BytesMut> {
    let json = serde_json::to_vec(payload)?;
    ensure!(
        json.len() <= MAX_PAYLOAD,
        "payload too large: {} bytes, limit is {MAX_PAYLOAD}",
        json.len()
    );
    Ok(encode_frame_to_bytes(msg_type, &json))
}

/// # Errors
///
/// Fails when `payload` is not JSON of the shape `T`.
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(payload)?)
}
