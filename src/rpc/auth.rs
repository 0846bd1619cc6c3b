//! Frame authentication — shared-secret token gate.
//!
//! Every frame written to the command characteristic is checked, in order,
//! before anything is queued:
//!
//! 1. length ≥ header size, else `INVALID_COMMAND_REQ`
//! 2. header token equals the configured secret, else `INVALID_TOKEN`
//! 3. `size` ≤ 64 and length == header + `size`, else `INVALID_COMMAND_SIZE`
//!
//! A rejected frame produces a ready-to-send [`CommandResponse`] that echoes
//! the identifier and token it arrived with.
//!
//! The secret lives in [`TokenStore`]: loaded from storage at boot (written
//! with the default first if absent) and rotated by `SET_BT_TOKEN`, which
//! persists before the in-memory value changes.

use core::cell::Cell;
use std::sync::Arc;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use log::{info, warn};

use crate::app::ports::{StorageError, StoragePort};
use crate::config::{DEFAULT_TOKEN, HEADER_SIZE, TOKEN_FILE_PATH, TOKEN_SIZE};
use crate::error::ErrorCode;
use crate::rpc::codec::{CommandRequest, CommandResponse, RequestHeader, Token};

// ── Token store ──────────────────────────────────────────────

/// Owner of the current shared secret.
pub struct TokenStore {
    storage: Arc<dyn StoragePort>,
    current: Mutex<CriticalSectionRawMutex, Cell<Token>>,
}

impl TokenStore {
    /// Load the persisted token, creating the file with the default token
    /// on first boot. Unreadable or malformed content falls back to the
    /// default without overwriting the file.
    pub fn load(storage: Arc<dyn StoragePort>) -> Self {
        let token = match storage.read_or_init(TOKEN_FILE_PATH, DEFAULT_TOKEN) {
            Ok(raw) => Token::from_slice(&raw).unwrap_or_else(|| {
                warn!("auth: stored token has {} bytes, using default", raw.len());
                Token::default()
            }),
            Err(e) => {
                warn!("auth: token load failed ({}), using default", e);
                Token::default()
            }
        };
        Self {
            storage,
            current: Mutex::new(Cell::new(token)),
        }
    }

    pub fn current(&self) -> Token {
        self.current.lock(Cell::get)
    }

    /// Compare `candidate` with the current secret over all 16 bytes,
    /// without an early exit on the first differing byte.
    pub fn matches(&self, candidate: &Token) -> bool {
        let secret = self.current();
        let diff = secret
            .as_bytes()
            .iter()
            .zip(candidate.as_bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        diff == 0
    }

    /// Rotate the secret. Persists first; the old token stays active if
    /// the write fails.
    pub fn set(&self, raw: &[u8]) -> Result<(), ErrorCode> {
        let token = Token::from_slice(raw).ok_or_else(|| {
            warn!("auth: rejected token of {} bytes (need {})", raw.len(), TOKEN_SIZE);
            ErrorCode::InvalidParam
        })?;
        self.storage.write(TOKEN_FILE_PATH, token.as_bytes()).map_err(|e| {
            warn!("auth: token persist failed ({})", e);
            ErrorCode::WriteFileFailed
        })?;
        self.current.lock(|c| c.set(token));
        info!("auth: token updated");
        Ok(())
    }

    /// Forget the persisted token and fall back to the default.
    pub fn reset(&self) -> Result<(), StorageError> {
        self.storage.remove(TOKEN_FILE_PATH)?;
        self.current.lock(|c| c.set(Token::default()));
        info!("auth: token reset to default");
        Ok(())
    }
}

// ── Frame gate ───────────────────────────────────────────────

/// Validate a raw command frame against `store`.
///
/// Returns the decoded request, or the error response to send back
/// immediately without queueing.
pub fn validate_frame(bytes: &[u8], store: &TokenStore) -> Result<CommandRequest, CommandResponse> {
    let Ok(header) = RequestHeader::decode(bytes) else {
        warn!("auth: frame too short ({} < {})", bytes.len(), HEADER_SIZE);
        return Err(CommandResponse::new(0, Token([0; TOKEN_SIZE]), ErrorCode::InvalidCommandReq));
    };

    if !store.matches(&header.token) {
        warn!("auth: invalid token (id={})", header.identifier);
        return Err(reject(&header, ErrorCode::InvalidToken));
    }

    CommandRequest::with_header(header, bytes).map_err(|e| {
        warn!("auth: {} (id={}, len={})", e, header.identifier, bytes.len());
        reject(&header, ErrorCode::InvalidCommandSize)
    })
}

fn reject(header: &RequestHeader, error: ErrorCode) -> CommandResponse {
    let mut response = CommandResponse::for_request(header);
    response.set_error(error);
    response
}

// ── Tests ────────────────────────────────────────────────────
