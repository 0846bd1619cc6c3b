//! BLE link — [`Link`] over the command and data characteristics.
//!
//! The GATT glue feeds platform events in through the `on_*` methods and
//! queues notifications through a [`Notifier`]:
//!
//! ```text
//!  Bluedroid task                 BleLink                     core tasks
//!  ──────────────                 ───────                     ──────────
//!  data write ─────────▶ on_data_written ─▶ rx slot ─▶ receive()  (updater)
//!  notify complete ────▶ on_data_notified ─▶ tx slot ◀─ send()
//!  command notify done ▶ on_command_notified ─▶ cmd lock ◀─ send_response()
//!  connect / disconnect ▶ on_connect / on_disconnect
//! ```
//!
//! Command writes are not handled here: the glue hands them straight to
//! the command intake.
//!
//! ## Characteristics
//!
//! | Characteristic   | UUID prefix | Perms             |
//! |------------------|-------------|-------------------|
//! | Hardware version | `997ca8f9`  | Read              |
//! | Software version | `20a14f57`  | Read              |
//! | Command          | `2d3a8ac3`  | Read+Write+Notify |
//! | Data             | `83670c18`  | Read+Write+Notify |

use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::config::{BLE_MTU, DATA_END_MARKER, LinkConfig};
use crate::rpc::codec::CommandResponse;
use crate::rpc::transport::{
    Link, Semaphore, TransportBuffer, TransportError, give, notify_with_retries, take,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Characteristic {
    Command,
    Data,
}

/// Queues one notification with the BLE stack.
pub trait Notifier: Send + Sync {
    /// Returns `false` if the stack refused the notification.
    fn notify(&self, characteristic: Characteristic, data: &[u8]) -> bool;
}

impl<T: Notifier + ?Sized> Notifier for Arc<T> {
    fn notify(&self, characteristic: Characteristic, data: &[u8]) -> bool {
        (**self).notify(characteristic, data)
    }
}

pub struct BleLink<N: Notifier> {
    notifier: N,
    config: LinkConfig,
    connected: AtomicBool,
    rx: TransportBuffer,
    tx: TransportBuffer,
    command_lock: Semaphore,
}

impl<N: Notifier> BleLink<N> {
    pub fn new(notifier: N, config: LinkConfig) -> Self {
        let link = Self {
            notifier,
            config,
            connected: AtomicBool::new(false),
            rx: TransportBuffer::new(),
            tx: TransportBuffer::new(),
            command_lock: Semaphore::new(),
        };
        give(&link.command_lock);
        link
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    fn notify(&self, characteristic: Characteristic, data: &[u8]) -> bool {
        self.connected.load(Ordering::Acquire) && self.notifier.notify(characteristic, data)
    }

    // ── Platform events ──────────────────────────────────────

    pub fn on_connect(&self) {
        self.rx.reset();
        self.tx.reset();
        give(&self.command_lock);
        self.connected.store(true, Ordering::Release);
        info!("BLE: central connected");
    }

    /// Drops any unread inbound chunk and fails a chunk in flight, so a
    /// blocked sender sees `SendFailed` instead of a phantom success.
    pub fn on_disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        self.rx.reset();
        self.tx.complete(false);
        give(&self.command_lock);
        info!("BLE: central disconnected");
    }

    /// Bytes written by the peer on the data characteristic.
    pub fn on_data_written(&self, data: &[u8]) {
        if data.len() > BLE_MTU {
            warn!("BLE: dropped {} byte data write (MTU {})", data.len(), BLE_MTU);
            return;
        }
        if let Err(e) = self.rx.put(data, Some(self.config.inbound_slot_wait())) {
            warn!("BLE: dropped {} byte data write: {}", data.len(), e);
        }
    }

    /// Completion of a data notification.
    pub fn on_data_notified(&self, ok: bool) {
        if !ok {
            debug!("BLE: data notify reported failure");
        }
        self.tx.complete(ok);
    }

    /// Completion of a command notification.
    pub fn on_command_notified(&self) {
        give(&self.command_lock);
    }

    /// Notify `response` with the command lock held. The lock is handed back
    /// by the completion event, or here if the stack refuses the frame.
    fn notify_response(&self, response: &CommandResponse) -> Result<(), TransportError> {
        let frame = response.encode();
        if notify_with_retries(&frame, &self.config, &|bytes: &[u8]| {
            self.notify(Characteristic::Command, bytes)
        }) {
            Ok(())
        } else {
            give(&self.command_lock);
            warn!("BLE: command notify rejected {} times", self.config.notify_attempts);
            Err(TransportError::SendFailed)
        }
    }

    /// Terminate an ad-hoc raw transfer on the data channel.
    pub fn send_data_end(&self) -> Result<(), TransportError> {
        self.send(&DATA_END_MARKER).map(|_| ())
    }
}

impl<N: Notifier> Link for BleLink<N> {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn receive(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.rx.take(buf, timeout)
    }

    fn send(&self, data: &[u8]) -> Result<usize, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.tx
            .send_with(data, &self.config, |chunk| self.notify(Characteristic::Data, chunk))
    }

    fn send_response(&self, response: &CommandResponse) -> Result<(), TransportError> {
        if !self.is_connected() {
            debug!("BLE: response id={} dropped, not connected", response.header.identifier);
            return Err(TransportError::NotConnected);
        }
        if !take(&self.command_lock, Some(self.config.response_lock_wait())) {
            warn!("BLE: previous command notify never completed");
        }
        self.notify_response(response)
    }

    fn try_send_response(&self, response: &CommandResponse) -> Result<(), TransportError> {
        if !self.is_connected() {
            debug!("BLE: response id={} dropped, not connected", response.header.identifier);
            return Err(TransportError::NotConnected);
        }
        if self.command_lock.try_take().is_none() {
            return Err(TransportError::Busy);
        }
        self.notify_response(response)
    }

    fn reset_inbound(&self) {
        self.rx.reset();
    }

    fn discard_inbound(&self) {
        self.rx.discard();
    }
}
