//! Command/data RPC over BLE.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        RPC Stack                             │
//! │                                                              │
//! │  command write ──▶ auth (token + size gate) ──▶ channels     │
//! │        │                    │ reject             (queue)     │
//! │        │                    ▼                       │        │
//! │        │              error response                ▼        │
//! │        │                                    engine (dispatch)│
//! │        │                                      │         │    │
//! │        ▼                                      ▼         ▼    │
//! │   transport (Link) ◀──── response ──── profile / ota ──────  │
//! │        ▲                                        │            │
//! │        └──────── data chunks ───────────────────┘            │
//! │                                         verify (SHA-256/RSA) │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod auth;
pub mod channels;
pub mod codec;
pub mod engine;
pub mod ota;
pub mod transport;
pub mod verify;
