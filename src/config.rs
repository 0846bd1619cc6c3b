//! Protocol constants and tunable timing.
//!
//! Wire sizes, paths and identifiers are compile-time constants shared
//! with the companion application. Timing that tests need to shrink lives
//! in [`LinkConfig`] and [`UpdaterConfig`].

use core::time::Duration;

use serde::{Deserialize, Serialize};

// ── Command frame ─────────────────────────────────────────────

/// Shared-secret length carried in every frame header.
pub const TOKEN_SIZE: usize = 16;

/// Packed header: identifier (4) + token (16) + type/error (1) + size (1).
pub const HEADER_SIZE: usize = 4 + TOKEN_SIZE + 1 + 1;

/// Payload capacity of both requests and responses.
pub const PAYLOAD_SIZE: usize = 64;

/// Full fixed frame: header + payload.
pub const FRAME_SIZE: usize = HEADER_SIZE + PAYLOAD_SIZE;

/// Token used until the peer rotates it.
pub const DEFAULT_TOKEN: &[u8; TOKEN_SIZE] = b"0000000000000000";

// ── Transport ─────────────────────────────────────────────────

/// Largest payload moved by one notify/write on the data characteristic.
pub const BLE_MTU: usize = 503;

/// Pending commands the dispatcher accepts before failing closed.
pub const COMMAND_QUEUE_DEPTH: usize = 10;

/// Main loop period.
pub const CONTROL_TICK_MS: u32 = 25;

/// Marker closing an ad-hoc raw transfer on the data characteristic.
pub const DATA_END_MARKER: [u8; 16] = [
    0xFE, 0xDE, 0xAD, 0xC0, 0xDE, 0xEC, 0xBB, 0xAD, 0x0E, 0x12, 0x34, 0x56, 0x78, 0x90, 0xAA,
    0xBB,
];

// ── GATT layout ───────────────────────────────────────────────

pub const SERVICE_UUID: u128 = 0xd3e63261_0000_1000_8000_00805f9b34fb;
pub const CHAR_HW_VERSION: u128 = 0x997ca8f9_0000_1000_8000_00805f9b34fb;
pub const CHAR_SW_VERSION: u128 = 0x20a14f57_0000_1000_8000_00805f9b34fb;
pub const CHAR_COMMAND: u128 = 0x2d3a8ac3_0000_1000_8000_00805f9b34fb;
pub const CHAR_DATA: u128 = 0x83670c18_0000_1000_8000_00805f9b34fb;

// ── Board identity ────────────────────────────────────────────

/// Hardware revision an update image must declare as compatible.
pub const HW_REVISION: &str = "HW R.1F";

/// Running firmware version exposed on the software version characteristic.
pub const SW_VERSION: &str = env!("CARGO_PKG_VERSION");

// ── Update pipeline ───────────────────────────────────────────

/// Sentinel opening every update header.
pub const UPDATE_MAGIC: u32 = 0xECB0_C0DE;

/// Transfer, hash and flash granularity.
pub const UPDATE_CHUNK_SIZE: usize = 16 * 1024;

/// PEM-encoded RSA-2048 public key that signs release images.
pub const UPDATE_PUBLIC_KEY_PEM: &str = include_str!("../keys/update_signing_pub.pem");

// ── Storage paths ─────────────────────────────────────────────

pub const TOKEN_FILE_PATH: &str = "/bttoken";
pub const UPDATE_FILE_PATH: &str = "/firmware_update";
pub const OWNER_FILE_PATH: &str = "/owner";
pub const CONTACT_FILE_PATH: &str = "/contact";

pub const DEFAULT_OWNER: &str = "Unknown";
pub const DEFAULT_CONTACT: &str = "No Contact";

// ── Tunable timing ────────────────────────────────────────────

/// Retry and wait bounds for the BLE link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Attempts to queue one notification before giving up.
    pub notify_attempts: u8,
    /// Pause between rejected notification attempts (ms).
    pub notify_retry_delay_ms: u32,
    /// Resends of one data chunk the peer reported as failed.
    pub max_chunk_resends: u8,
    /// Wait for a notify-complete event on the data characteristic (ms).
    pub send_timeout_ms: u32,
    /// How long an inbound write waits for the receive slot (ms).
    pub inbound_slot_wait_ms: u32,
    /// Wait for the previous command notification to complete (ms).
    pub response_lock_wait_ms: u32,
}

impl LinkConfig {
    pub fn notify_retry_delay(&self) -> Duration {
        Duration::from_millis(u64::from(self.notify_retry_delay_ms))
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.send_timeout_ms))
    }

    pub fn inbound_slot_wait(&self) -> Duration {
        Duration::from_millis(u64::from(self.inbound_slot_wait_ms))
    }

    pub fn response_lock_wait(&self) -> Duration {
        Duration::from_millis(u64::from(self.response_lock_wait_ms))
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            notify_attempts: 10,
            notify_retry_delay_ms: 50,
            max_chunk_resends: 10,
            send_timeout_ms: 5_000,
            inbound_slot_wait_ms: 5_000,
            response_lock_wait_ms: 1_000,
        }
    }
}

/// Update session pacing and task placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdaterConfig {
    /// Bound on every receive call of a session (ms).
    pub request_timeout_ms: u32,
    /// Pause before rebooting so the final response can leave the radio (ms).
    pub restart_delay_ms: u32,
    /// Stack reserved for the update task (KiB).
    pub task_stack_kb: usize,
    /// FreeRTOS priority of the update task.
    pub task_priority: u8,
}

impl UpdaterConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.request_timeout_ms))
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(u64::from(self.restart_delay_ms))
    }
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
            restart_delay_ms: 100,
            task_stack_kb: 16,
            task_priority: 20,
        }
    }
}
