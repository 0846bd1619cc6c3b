//! Port traits — the boundary between the command core and the platform.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ Dispatcher / Updater
//! ```
//!
//! Storage, the flash update partition and the badge peripherals are
//! implemented by adapters. The core holds them as `Arc<dyn …>` handed in
//! at startup, so nothing reaches a platform singleton directly.
//!
//! All port errors are typed and convert into a wire [`ErrorCode`] at the
//! point where a response is produced.

use core::fmt;
use std::io::{Read, Write};

use crate::error::ErrorCode;
use crate::rpc::codec::{CommandResponse, CommandType};

// ───────────────────────────────────────────────────────────────
// Storage port (driven adapter: core ↔ flash FAT / memory)
// ───────────────────────────────────────────────────────────────

/// File-style persistent storage.
///
/// Paths are absolute within the badge's storage root (`/bttoken`,
/// `/firmware_update`, …). Implementations are shared between the BLE
/// task, the main loop and the update task, so every method takes `&self`.
pub trait StoragePort: Send + Sync {
    /// Read a whole file.
    fn read(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    /// Replace a file's content.
    fn write(&self, path: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Delete a file. Returns `Ok(())` even if the file didn't exist.
    fn remove(&self, path: &str) -> Result<(), StorageError>;

    /// Check whether a file exists without reading it.
    fn exists(&self, path: &str) -> bool;

    /// Create (truncate) a file for streaming writes.
    fn create(&self, path: &str) -> Result<Box<dyn Write + Send>, StorageError>;

    /// Open an existing file for streaming reads.
    fn open(&self, path: &str) -> Result<Box<dyn Read + Send>, StorageError>;

    /// Read a file, writing `default` first when it does not exist yet.
    fn read_or_init(&self, path: &str, default: &[u8]) -> Result<Vec<u8>, StorageError> {
        match self.read(path) {
            Ok(content) => Ok(content),
            Err(StorageError::NotFound) => {
                self.write(path, default)?;
                Ok(default.to_vec())
            }
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    /// The storage medium is not mounted.
    NotMounted,
    /// Requested file does not exist.
    NotFound,
    /// File exists but could not be opened.
    OpenFailed,
    /// Reading returned an error or short data.
    ReadFailed,
    /// Writing failed (medium full or I/O error).
    WriteFailed,
    /// The file could not be deleted.
    RemoveFailed,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotMounted => write!(f, "storage not mounted"),
            Self::NotFound => write!(f, "file not found"),
            Self::OpenFailed => write!(f, "open failed"),
            Self::ReadFailed => write!(f, "read failed"),
            Self::WriteFailed => write!(f, "write failed"),
            Self::RemoveFailed => write!(f, "remove failed"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<StorageError> for ErrorCode {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotMounted => Self::NotInitialized,
            StorageError::NotFound => Self::FileNotFound,
            StorageError::OpenFailed => Self::OpenFileFailed,
            StorageError::ReadFailed => Self::ReadFileFailed,
            StorageError::WriteFailed => Self::WriteFileFailed,
            StorageError::RemoveFailed => Self::ActionFailed,
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Flash port (driven adapter: core → OTA partition)
// ───────────────────────────────────────────────────────────────

/// The platform's OTA partition writer.
pub trait FlashWriter: Send + Sync {
    /// Open the inactive partition for an image of `image_size` bytes.
    fn begin(&self, image_size: usize) -> Result<Box<dyn FlashSession>, FlashError>;

    /// Restart into whatever partition is marked for boot.
    fn reboot(&self);
}

/// One in-progress write into the update partition. Lives on the update
/// task only.
///
/// Dropping a session without calling [`end`](FlashSession::end) leaves
/// the partition unbootable, same as [`abort`](FlashSession::abort).
pub trait FlashSession {
    /// Append image bytes; returns how many were accepted.
    fn write(&mut self, data: &[u8]) -> Result<usize, FlashError>;

    /// Validate the written image and mark it as the next boot partition.
    fn end(self: Box<Self>) -> Result<(), FlashError>;

    /// Discard everything written so far.
    fn abort(self: Box<Self>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashError {
    BeginFailed,
    WriteFailed,
    FinalizeFailed,
    BootSetFailed,
}

impl fmt::Display for FlashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BeginFailed => write!(f, "OTA begin failed"),
            Self::WriteFailed => write!(f, "OTA write failed"),
            Self::FinalizeFailed => write!(f, "OTA image validation failed"),
            Self::BootSetFailed => write!(f, "set boot partition failed"),
        }
    }
}

impl std::error::Error for FlashError {}

// ───────────────────────────────────────────────────────────────
// Peripheral port (driven adapter: core → e-paper / LED border)
// ───────────────────────────────────────────────────────────────

/// Commands the core forwards untouched to the display and LED drivers.
///
/// The implementation owns its hardware and runs on the main loop only.
pub trait PeripheralPort: Send {
    /// Execute `command` and fill `response` (error code and payload).
    fn handle(&mut self, command: CommandType, payload: &[u8], response: &mut CommandResponse);
}
