//! EConBadge firmware library.
//!
//! Exposes the protocol, update and adapter modules for integration
//! testing. All ESP-IDF-specific code is guarded by
//! `#[cfg(target_os = "espidf")]` within each module.

#![deny(unused_must_use)]

pub mod adapters;
pub mod app;
pub mod config;
pub mod drivers;
pub mod error;
pub mod rpc;

#[cfg(target_os = "espidf")]
mod esp_link_shims;

pub use error::ErrorCode;
