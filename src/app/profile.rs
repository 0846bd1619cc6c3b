//! Badge profile: owner and contact strings, factory reset.
//!
//! Both strings live in their own file and are created with a default on
//! first read. Factory reset forgets them together with the BLE token.

use std::sync::Arc;

use log::{info, warn};

use crate::app::ports::StoragePort;
use crate::config::{
    CONTACT_FILE_PATH, DEFAULT_CONTACT, DEFAULT_OWNER, OWNER_FILE_PATH, PAYLOAD_SIZE,
    TOKEN_FILE_PATH,
};
use crate::error::ErrorCode;
use crate::rpc::auth::TokenStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Owner,
    Contact,
}

impl Field {
    fn path(self) -> &'static str {
        match self {
            Self::Owner => OWNER_FILE_PATH,
            Self::Contact => CONTACT_FILE_PATH,
        }
    }

    fn default_value(self) -> &'static str {
        match self {
            Self::Owner => DEFAULT_OWNER,
            Self::Contact => DEFAULT_CONTACT,
        }
    }
}

pub struct Profile {
    storage: Arc<dyn StoragePort>,
    tokens: Arc<TokenStore>,
}

impl Profile {
    pub fn new(storage: Arc<dyn StoragePort>, tokens: Arc<TokenStore>) -> Self {
        Self { storage, tokens }
    }

    /// Stored text, capped at one payload.
    pub fn get(&self, field: Field) -> Result<Vec<u8>, ErrorCode> {
        let mut value = self
            .storage
            .read_or_init(field.path(), field.default_value().as_bytes())
            .map_err(|e| {
                warn!("profile: {:?} read failed: {}", field, e);
                ErrorCode::from(e)
            })?;
        value.truncate(PAYLOAD_SIZE);
        Ok(value)
    }

    /// Replace the text. Must be 1..=64 bytes of UTF-8.
    pub fn set(&self, field: Field, value: &[u8]) -> Result<(), ErrorCode> {
        if value.is_empty() || value.len() > PAYLOAD_SIZE || core::str::from_utf8(value).is_err() {
            warn!("profile: rejected {:?} of {} bytes", field, value.len());
            return Err(ErrorCode::InvalidParam);
        }
        self.storage.write(field.path(), value).map_err(|e| {
            warn!("profile: {:?} write failed: {}", field, e);
            ErrorCode::WriteFileFailed
        })?;
        info!("profile: {:?} updated", field);
        Ok(())
    }

    /// Remove owner, contact and token files; the default token is active
    /// afterwards.
    pub fn factory_reset(&self) -> Result<(), ErrorCode> {
        for path in [OWNER_FILE_PATH, CONTACT_FILE_PATH] {
            self.storage.remove(path).map_err(|e| {
                warn!("profile: {} not removed: {}", path, e);
                ErrorCode::ActionFailed
            })?;
        }
        self.tokens.reset().map_err(|e| {
            warn!("profile: {} not removed: {}", TOKEN_FILE_PATH, e);
            ErrorCode::ActionFailed
        })?;
        info!("profile: factory reset done");
        Ok(())
    }
}
