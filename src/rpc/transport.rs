//! Transport layer — single-slot flow control over a notify/write pair.
//!
//! A [`TransportBuffer`] is one direction of the data characteristic. It
//! holds at most one MTU-sized chunk and two binary semaphores:
//!
//! ```text
//!   producer                       slot                      consumer
//!  ──────────  take(write_lock) ┌─────────┐ take(read_lock) ──────────
//!  BLE write ─────────────────▶ │ ≤ MTU B │ ─────────────────▶ receive()
//!  callback    give(read_lock)  └─────────┘ give(write_lock)
//!                                           (once fully drained)
//! ```
//!
//! Outbound, the same `write_lock` paces [`TransportBuffer::send_with`]:
//! each chunk is notified, then the sender waits for the stack's
//! notify-complete event before moving on or resending.
//!
//! The semaphores are `embassy-sync` signals. Plain threads block on them
//! through `futures_lite::future::block_on`, bounded by
//! `embassy_time::with_timeout` where a timeout is given.
//!
//! [`Link`] is the byte-channel contract the dispatcher and the updater are
//! written against; the BLE adapter implements it.

use core::cell::RefCell;
use core::fmt;
use core::time::Duration;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use futures_lite::future::block_on;
use log::warn;

use crate::config::{BLE_MTU, LinkConfig};
use crate::error::ErrorCode;
use crate::rpc::codec::CommandResponse;

// ── Errors ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// No central is connected.
    NotConnected,
    /// A semaphore wait elapsed.
    Timeout,
    /// The stack kept rejecting a notification or kept reporting failure.
    SendFailed,
    /// An inbound write larger than the MTU.
    Oversized,
    /// The previous command notification has not completed yet.
    Busy,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "no central connected"),
            Self::Timeout => write!(f, "transport wait timed out"),
            Self::SendFailed => write!(f, "notification failed"),
            Self::Oversized => write!(f, "write exceeds MTU"),
            Self::Busy => write!(f, "previous response still in flight"),
        }
    }
}

impl TransportError {
    /// Wire code for a failure while receiving.
    pub fn on_receive(self) -> ErrorCode {
        ErrorCode::TransRecvFailed
    }
}

// ── Link contract ────────────────────────────────────────────

/// Byte channel and response path shared by the dispatcher and the updater.
pub trait Link: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Fill `buf` completely from the data characteristic.
    /// `None` waits without bound between chunks.
    fn receive(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize, TransportError>;

    /// Notify `data` on the data characteristic in MTU-sized chunks.
    fn send(&self, data: &[u8]) -> Result<usize, TransportError>;

    /// Notify one response on the command characteristic.
    fn send_response(&self, response: &CommandResponse) -> Result<(), TransportError>;

    /// Like [`send_response`](Self::send_response), but fails with
    /// [`TransportError::Busy`] instead of waiting for the previous command
    /// notification to complete.
    fn try_send_response(&self, response: &CommandResponse) -> Result<(), TransportError>;

    /// Drop any unread inbound chunk and free the receive slot.
    fn reset_inbound(&self);

    /// Like [`reset_inbound`](Self::reset_inbound), and also drop every later
    /// inbound write without waiting until the next `reset_inbound`.
    fn discard_inbound(&self);
}

// ── Binary semaphore ─────────────────────────────────────────

pub(crate) type Semaphore = Signal<CriticalSectionRawMutex, ()>;

/// Take `sem`, waiting at most `timeout` (`None` = forever).
pub(crate) fn take(sem: &Semaphore, timeout: Option<Duration>) -> bool {
    match timeout {
        None => {
            block_on(sem.wait());
            true
        }
        Some(t) => {
            let t = embassy_time::Duration::from_micros(t.as_micros() as u64);
            block_on(embassy_time::with_timeout(t, sem.wait())).is_ok()
        }
    }
}

pub(crate) fn give(sem: &Semaphore) {
    sem.signal(());
}

// ── Transport buffer ─────────────────────────────────────────

struct Slot {
    buffer: [u8; BLE_MTU],
    cursor: usize,
    message_size: usize,
    retry: bool,
    /// Inbound writes are dropped on arrival.
    discarding: bool,
}

impl Slot {
    const fn new() -> Self {
        Self {
            buffer: [0; BLE_MTU],
            cursor: 0,
            message_size: 0,
            retry: false,
            discarding: false,
        }
    }
}

/// One direction of the data characteristic.
pub struct TransportBuffer {
    read_lock: Semaphore,
    write_lock: Semaphore,
    slot: Mutex<CriticalSectionRawMutex, RefCell<Slot>>,
}

impl TransportBuffer {
    /// Empty slot: `write_lock` given, `read_lock` taken.
    pub fn new() -> Self {
        let tb = Self {
            read_lock: Signal::new(),
            write_lock: Signal::new(),
            slot: Mutex::new(RefCell::new(Slot::new())),
        };
        give(&tb.write_lock);
        tb
    }

    /// Drop whatever the slot holds and return to the initial state.
    pub fn reset(&self) {
        self.clear(false);
    }

    /// Drop whatever the slot holds, then drop every chunk [`put`](Self::put)
    /// until the next [`reset`](Self::reset). The producer never waits.
    pub fn discard(&self) {
        self.clear(true);
    }

    fn clear(&self, discarding: bool) {
        self.read_lock.reset();
        self.slot.lock(|s| {
            let mut s = s.borrow_mut();
            s.cursor = 0;
            s.message_size = 0;
            s.retry = false;
            s.discarding = discarding;
        });
        give(&self.write_lock);
    }

    // ── Inbound ──────────────────────────────────────────────

    /// Producer side: place one chunk written by the peer into the slot,
    /// waiting at most `wait` for the previous chunk to be drained.
    pub fn put(&self, data: &[u8], wait: Option<Duration>) -> Result<(), TransportError> {
        if data.len() > BLE_MTU {
            return Err(TransportError::Oversized);
        }
        if data.is_empty() || self.slot.lock(|s| s.borrow().discarding) {
            return Ok(());
        }
        if !take(&self.write_lock, wait) {
            return Err(TransportError::Timeout);
        }
        self.slot.lock(|s| {
            let mut s = s.borrow_mut();
            s.buffer[..data.len()].copy_from_slice(data);
            s.cursor = 0;
            s.message_size = data.len();
        });
        give(&self.read_lock);
        Ok(())
    }

    /// Consumer side: fill `buf` from successive chunks. Each wait for the
    /// next chunk is bounded by `timeout`.
    pub fn take(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize, TransportError> {
        let mut filled = 0;
        while filled < buf.len() {
            if !take(&self.read_lock, timeout) {
                return Err(TransportError::Timeout);
            }
            let drained = self.slot.lock(|s| {
                let mut s = s.borrow_mut();
                let n = (buf.len() - filled).min(s.message_size - s.cursor);
                let start = s.cursor;
                buf[filled..filled + n].copy_from_slice(&s.buffer[start..start + n]);
                s.cursor += n;
                filled += n;
                s.cursor == s.message_size
            });
            if drained {
                give(&self.write_lock);
            } else {
                give(&self.read_lock);
            }
        }
        Ok(filled)
    }

    // ── Outbound ─────────────────────────────────────────────

    /// Send `data` chunk by chunk through `notify`, which queues one
    /// notification and reports whether the stack accepted it. Completion
    /// of each chunk arrives through [`complete`](Self::complete).
    pub fn send_with(
        &self,
        data: &[u8],
        config: &LinkConfig,
        notify: impl Fn(&[u8]) -> bool,
    ) -> Result<usize, TransportError> {
        if data.is_empty() {
            return Ok(0);
        }
        if !take(&self.write_lock, Some(config.send_timeout())) {
            return Err(TransportError::Timeout);
        }
        self.slot.lock(|s| {
            let mut s = s.borrow_mut();
            s.cursor = 0;
            s.message_size = data.len();
        });

        let result = self.send_chunks(data, config, notify);
        give(&self.write_lock);
        result
    }

    fn send_chunks(
        &self,
        data: &[u8],
        config: &LinkConfig,
        notify: impl Fn(&[u8]) -> bool,
    ) -> Result<usize, TransportError> {
        let mut resends = 0u8;
        loop {
            let cursor = self.slot.lock(|s| {
                let mut s = s.borrow_mut();
                s.retry = false;
                s.cursor
            });
            if cursor >= data.len() {
                return Ok(data.len());
            }
            let chunk = &data[cursor..(cursor + BLE_MTU).min(data.len())];

            if !notify_with_retries(chunk, config, &notify) {
                warn!("BLE: data notify rejected {} times", config.notify_attempts);
                return Err(TransportError::SendFailed);
            }
            if !take(&self.write_lock, Some(config.send_timeout())) {
                warn!("BLE: no notify completion at offset {}", cursor);
                return Err(TransportError::Timeout);
            }

            let retry = self.slot.lock(|s| {
                let mut s = s.borrow_mut();
                if !s.retry {
                    s.cursor += chunk.len();
                }
                s.retry
            });
            if retry {
                resends += 1;
                if resends > config.max_chunk_resends {
                    warn!("BLE: chunk at offset {} failed {} times", cursor, resends);
                    return Err(TransportError::SendFailed);
                }
            } else {
                resends = 0;
            }
        }
    }

    /// Notify-complete event for the chunk in flight.
    pub fn complete(&self, ok: bool) {
        self.slot.lock(|s| s.borrow_mut().retry = !ok);
        give(&self.write_lock);
    }
}

impl Default for TransportBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Queue one notification, retrying while the stack rejects it.
pub(crate) fn notify_with_retries(
    data: &[u8],
    config: &LinkConfig,
    notify: &impl Fn(&[u8]) -> bool,
) -> bool {
    for attempt in 0..config.notify_attempts {
        if notify(data) {
            return true;
        }
        if attempt + 1 < config.notify_attempts {
            std::thread::sleep(config.notify_retry_delay());
        }
    }
    false
}

// ── Tests ────────────────────────────────────────────────────
