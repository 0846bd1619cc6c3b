//! Error codes carried on the command channel.
//!
//! The numeric values are part of the wire contract with the companion
//! application: a response header's error byte is exactly
//! [`ErrorCode::as_u8`]. Subsystem errors (transport, storage, flash) are
//! typed enums in their own modules and convert into an `ErrorCode` at the
//! point where a response is built.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    NoError = 0,
    InvalidParam = 1,
    ActionFailed = 2,
    NotInitialized = 3,
    NoAction = 4,
    InvalidToken = 5,
    InvalidCommandSize = 6,
    FileNotFound = 7,
    NoMoreMemory = 8,
    InvalidCommandReq = 9,
    MaxCommandReached = 10,
    ImgNameUpdateFail = 11,
    OpenFileFailed = 12,
    WriteFileFailed = 13,
    ReadFileFailed = 14,
    TransSendFailed = 15,
    TransRecvFailed = 16,
    DataTooLong = 17,
    CorruptedData = 18,
    InvalidIndex = 19,
    OverlappingPatterns = 20,
}

impl ErrorCode {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decode a response error byte. Unknown values yield `None`.
    pub const fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::NoError,
            1 => Self::InvalidParam,
            2 => Self::ActionFailed,
            3 => Self::NotInitialized,
            4 => Self::NoAction,
            5 => Self::InvalidToken,
            6 => Self::InvalidCommandSize,
            7 => Self::FileNotFound,
            8 => Self::NoMoreMemory,
            9 => Self::InvalidCommandReq,
            10 => Self::MaxCommandReached,
            11 => Self::ImgNameUpdateFail,
            12 => Self::OpenFileFailed,
            13 => Self::WriteFileFailed,
            14 => Self::ReadFileFailed,
            15 => Self::TransSendFailed,
            16 => Self::TransRecvFailed,
            17 => Self::DataTooLong,
            18 => Self::CorruptedData,
            19 => Self::InvalidIndex,
            20 => Self::OverlappingPatterns,
            _ => return None,
        })
    }

    pub const fn is_ok(self) -> bool {
        matches!(self, Self::NoError)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NoError => "no error",
            Self::InvalidParam => "invalid parameter",
            Self::ActionFailed => "action failed",
            Self::NotInitialized => "not initialized",
            Self::NoAction => "no action",
            Self::InvalidToken => "invalid token",
            Self::InvalidCommandSize => "invalid command size",
            Self::FileNotFound => "file not found",
            Self::NoMoreMemory => "out of memory",
            Self::InvalidCommandReq => "invalid command request",
            Self::MaxCommandReached => "command queue full",
            Self::ImgNameUpdateFail => "image name update failed",
            Self::OpenFileFailed => "open file failed",
            Self::WriteFileFailed => "write file failed",
            Self::ReadFileFailed => "read file failed",
            Self::TransSendFailed => "transport send failed",
            Self::TransRecvFailed => "transport receive failed",
            Self::DataTooLong => "data too long",
            Self::CorruptedData => "corrupted data",
            Self::InvalidIndex => "invalid index",
            Self::OverlappingPatterns => "overlapping patterns",
        };
        write!(f, "{text} ({})", self.as_u8())
    }
}
