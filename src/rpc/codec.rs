//! Command frame codec.
//!
//! Wire format (little-endian, packed, no padding):
//! ```text
//! ┌──────────────┬────────────┬──────────────┬──────────┬──────────────────┐
//! │ identifier   │ token      │ type | error │ size     │ payload          │
//! │ u32 (4B)     │ [u8; 16]   │ u8 (1B)      │ u8 (1B)  │ `size` bytes     │
//! └──────────────┴────────────┴──────────────┴──────────┴──────────────────┘
//!  ◀──────────────────── header: 22 bytes ──────────────▶ ◀── ≤ 64 bytes ──▶
//! ```
//!
//! Requests and responses share the layout but differ in the meaning of the
//! fifth field, so they decode into distinct header types. Only the valid
//! `size` prefix of a payload ever goes on the air or is handed to a handler.

use core::fmt;

use heapless::Vec;

use crate::config::{FRAME_SIZE, HEADER_SIZE, PAYLOAD_SIZE, TOKEN_SIZE};
use crate::error::ErrorCode;

const ID_RANGE: core::ops::Range<usize> = 0..4;
const TOKEN_RANGE: core::ops::Range<usize> = 4..4 + TOKEN_SIZE;
const KIND_OFFSET: usize = 4 + TOKEN_SIZE;
const SIZE_OFFSET: usize = KIND_OFFSET + 1;

/// Encoded frame ready to notify.
pub type FrameBytes = Vec<u8, FRAME_SIZE>;

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer bytes than a header.
    TooShort,
    /// `size` field above the payload capacity.
    PayloadTooLarge,
    /// Byte count disagrees with header + `size`.
    LengthMismatch,
    /// Response carries an error byte outside the known table.
    UnknownErrorCode(u8),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort => write!(f, "frame shorter than header"),
            Self::PayloadTooLarge => write!(f, "payload size above {PAYLOAD_SIZE}"),
            Self::LengthMismatch => write!(f, "frame length does not match header size"),
            Self::UnknownErrorCode(raw) => write!(f, "unknown error code {raw}"),
        }
    }
}

// ── Command codes ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandType {
    Ping = 0,
    SetBtToken = 1,
    EinkClear = 2,
    EinkNewImage = 3,
    EinkRemoveImage = 4,
    EinkSelectImage = 5,
    EinkGetCurrentImgName = 6,
    EinkGetCurrentImg = 7,
    FactoryReset = 8,
    SetOwner = 9,
    SetContact = 10,
    GetOwner = 11,
    GetContact = 12,
    FirmwareUpdate = 13,
    LedBorderSetEnable = 14,
    LedBorderGetEnable = 15,
    LedBorderIncBrightness = 16,
    LedBorderDecBrightness = 17,
    LedBorderSetBrightness = 18,
    LedBorderGetBrightness = 19,
    LedBorderClear = 20,
    LedBorderAddPattern = 21,
    LedBorderRemovePattern = 22,
    LedBorderClearPatterns = 23,
    LedBorderGetPatterns = 24,
    LedBorderAddAnimation = 25,
    LedBorderRemoveAnimation = 26,
    LedBorderClearAnimations = 27,
    LedBorderGetAnimations = 28,
}

impl CommandType {
    /// Number of defined command codes.
    pub const COUNT: usize = 29;

    pub const ALL: [Self; Self::COUNT] = [
        Self::Ping,
        Self::SetBtToken,
        Self::EinkClear,
        Self::EinkNewImage,
        Self::EinkRemoveImage,
        Self::EinkSelectImage,
        Self::EinkGetCurrentImgName,
        Self::EinkGetCurrentImg,
        Self::FactoryReset,
        Self::SetOwner,
        Self::SetContact,
        Self::GetOwner,
        Self::GetContact,
        Self::FirmwareUpdate,
        Self::LedBorderSetEnable,
        Self::LedBorderGetEnable,
        Self::LedBorderIncBrightness,
        Self::LedBorderDecBrightness,
        Self::LedBorderSetBrightness,
        Self::LedBorderGetBrightness,
        Self::LedBorderClear,
        Self::LedBorderAddPattern,
        Self::LedBorderRemovePattern,
        Self::LedBorderClearPatterns,
        Self::LedBorderGetPatterns,
        Self::LedBorderAddAnimation,
        Self::LedBorderRemoveAnimation,
        Self::LedBorderClearAnimations,
        Self::LedBorderGetAnimations,
    ];

    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(raw: u8) -> Option<Self> {
        Self::ALL.get(usize::from(raw)).copied()
    }

    /// Codes served by the display and LED drivers.
    pub const fn is_peripheral(self) -> bool {
        matches!(
            self,
            Self::EinkClear
                | Self::EinkNewImage
                | Self::EinkRemoveImage
                | Self::EinkSelectImage
                | Self::EinkGetCurrentImgName
                | Self::EinkGetCurrentImg
        ) || (self as u8) >= Self::LedBorderSetEnable as u8
    }
}

// ── Token ─────────────────────────────────────────────────────

/// The 16-byte shared secret carried in every header.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Token(pub [u8; TOKEN_SIZE]);

impl Token {
    pub fn from_slice(raw: &[u8]) -> Option<Self> {
        raw.try_into().ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; TOKEN_SIZE] {
        &self.0
    }
}

impl Default for Token {
    fn default() -> Self {
        Self(*crate::config::DEFAULT_TOKEN)
    }
}

// Never print the secret.
impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token(..)")
    }
}

// ── Headers ───────────────────────────────────────────────────

/// Header of a frame written by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub identifier: u32,
    pub token: Token,
    /// Raw command byte; may name a code this build does not know.
    pub command: u8,
    pub size: u8,
}

impl RequestHeader {
    /// Decode the fixed header prefix. Payload bytes are not inspected.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::TooShort);
        }
        let (identifier, token) = decode_prefix(bytes);
        Ok(Self {
            identifier,
            token,
            command: bytes[KIND_OFFSET],
            size: bytes[SIZE_OFFSET],
        })
    }

    pub fn command_type(&self) -> Option<CommandType> {
        CommandType::from_u8(self.command)
    }

    fn encode(&self, out: &mut [u8; FRAME_SIZE]) {
        encode_prefix(out, self.identifier, &self.token);
        out[KIND_OFFSET] = self.command;
        out[SIZE_OFFSET] = self.size;
    }
}

/// Header of a frame notified by the badge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub identifier: u32,
    pub token: Token,
    pub error: ErrorCode,
    pub size: u8,
}

impl ResponseHeader {
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::TooShort);
        }
        let (identifier, token) = decode_prefix(bytes);
        let raw = bytes[KIND_OFFSET];
        let error = ErrorCode::from_u8(raw).ok_or(FrameError::UnknownErrorCode(raw))?;
        Ok(Self {
            identifier,
            token,
            error,
            size: bytes[SIZE_OFFSET],
        })
    }
}

fn decode_prefix(bytes: &[u8]) -> (u32, Token) {
    let mut id = [0u8; 4];
    id.copy_from_slice(&bytes[ID_RANGE]);
    let mut token = [0u8; TOKEN_SIZE];
    token.copy_from_slice(&bytes[TOKEN_RANGE]);
    (u32::from_le_bytes(id), Token(token))
}

fn encode_prefix(out: &mut [u8; FRAME_SIZE], identifier: u32, token: &Token) {
    out[ID_RANGE].copy_from_slice(&identifier.to_le_bytes());
    out[TOKEN_RANGE].copy_from_slice(token.as_bytes());
}

fn checked_payload(bytes: &[u8], size: u8) -> Result<&[u8], FrameError> {
    let size = usize::from(size);
    if size > PAYLOAD_SIZE {
        return Err(FrameError::PayloadTooLarge);
    }
    if bytes.len() != HEADER_SIZE + size {
        return Err(FrameError::LengthMismatch);
    }
    Ok(&bytes[HEADER_SIZE..])
}

fn to_frame(header_and_payload: &[u8; FRAME_SIZE], size: usize) -> FrameBytes {
    let mut out = FrameBytes::new();
    // HEADER_SIZE + size never exceeds FRAME_SIZE: size is clamped by callers.
    let _ = out.extend_from_slice(&header_and_payload[..HEADER_SIZE + size]);
    out
}

// ── Frames ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub header: RequestHeader,
    payload: [u8; PAYLOAD_SIZE],
}

impl CommandRequest {
    /// Build a request; `payload` beyond 64 bytes is rejected.
    pub fn new(
        identifier: u32,
        token: Token,
        command: u8,
        payload: &[u8],
    ) -> Result<Self, FrameError> {
        if payload.len() > PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge);
        }
        let mut buf = [0u8; PAYLOAD_SIZE];
        buf[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            header: RequestHeader {
                identifier,
                token,
                command,
                size: payload.len() as u8,
            },
            payload: buf,
        })
    }

    /// Full structural decode: header, size bound and exact length.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let header = RequestHeader::decode(bytes)?;
        Self::with_header(header, bytes)
    }

    /// Attach the payload of `bytes` to an already decoded header.
    pub fn with_header(header: RequestHeader, bytes: &[u8]) -> Result<Self, FrameError> {
        let payload = checked_payload(bytes, header.size)?;
        let mut buf = [0u8; PAYLOAD_SIZE];
        buf[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            header,
            payload: buf,
        })
    }

    /// The valid prefix of the payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload[..usize::from(self.header.size).min(PAYLOAD_SIZE)]
    }

    pub fn encode(&self) -> FrameBytes {
        let size = usize::from(self.header.size).min(PAYLOAD_SIZE);
        let mut out = [0u8; FRAME_SIZE];
        self.header.encode(&mut out);
        out[SIZE_OFFSET] = size as u8;
        out[HEADER_SIZE..HEADER_SIZE + size].copy_from_slice(&self.payload[..size]);
        to_frame(&out, size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    pub header: ResponseHeader,
    payload: [u8; PAYLOAD_SIZE],
}

impl CommandResponse {
    /// Empty success response correlated with `request`.
    pub fn for_request(request: &RequestHeader) -> Self {
        Self::new(request.identifier, request.token, ErrorCode::NoError)
    }

    pub fn new(identifier: u32, token: Token, error: ErrorCode) -> Self {
        Self {
            header: ResponseHeader {
                identifier,
                token,
                error,
                size: 0,
            },
            payload: [0u8; PAYLOAD_SIZE],
        }
    }

    pub fn error(&self) -> ErrorCode {
        self.header.error
    }

    pub fn set_error(&mut self, error: ErrorCode) {
        self.header.error = error;
    }

    /// Replace the payload, truncating to 64 bytes.
    pub fn set_payload(&mut self, data: &[u8]) {
        let len = data.len().min(PAYLOAD_SIZE);
        self.payload[..len].copy_from_slice(&data[..len]);
        self.header.size = len as u8;
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload[..usize::from(self.header.size).min(PAYLOAD_SIZE)]
    }

    /// Bytes to notify: header plus the valid payload prefix. An oversized
    /// `size` is clamped to the payload capacity.
    pub fn encode(&self) -> FrameBytes {
        let size = usize::from(self.header.size).min(PAYLOAD_SIZE);
        let mut out = [0u8; FRAME_SIZE];
        encode_prefix(&mut out, self.header.identifier, &self.header.token);
        out[KIND_OFFSET] = self.header.error.as_u8();
        out[SIZE_OFFSET] = size as u8;
        out[HEADER_SIZE..HEADER_SIZE + size].copy_from_slice(&self.payload[..size]);
        to_frame(&out, size)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let header = ResponseHeader::decode(bytes)?;
        let payload = checked_payload(bytes, header.size)?;
        let mut buf = [0u8; PAYLOAD_SIZE];
        buf[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            header,
            payload: buf,
        })
    }
}
