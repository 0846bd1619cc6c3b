//! Update partition adapter.
//!
//! Implements [`FlashWriter`] on top of the `esp-ota` crate, which wraps the
//! ESP-IDF OTA partition API. On host targets a recording in-memory flash
//! stands in, with switches to make each step fail.

use log::{info, warn};

use crate::app::ports::{FlashError, FlashSession, FlashWriter};

// ── ESP-IDF (esp-ota) ─────────────────────────────────────────

#[cfg(target_os = "espidf")]
pub struct EspOtaFlash;

#[cfg(target_os = "espidf")]
impl EspOtaFlash {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(target_os = "espidf")]
impl Default for EspOtaFlash {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "espidf")]
struct EspOtaSession {
    update: esp_ota::OtaUpdate,
}

#[cfg(target_os = "espidf")]
impl FlashWriter for EspOtaFlash {
    fn begin(&self, image_size: usize) -> Result<Box<dyn FlashSession>, FlashError> {
        let update = esp_ota::OtaUpdate::begin().map_err(|e| {
            warn!("esp-ota begin failed: {:?}", e);
            FlashError::BeginFailed
        })?;
        info!("OTA: flash session open for {} bytes", image_size);
        Ok(Box::new(EspOtaSession { update }))
    }

    fn reboot(&self) {
        info!("OTA: rebooting into new firmware");
        esp_ota::restart();
    }
}

#[cfg(target_os = "espidf")]
impl FlashSession for EspOtaSession {
    fn write(&mut self, data: &[u8]) -> Result<usize, FlashError> {
        self.update.write(data).map_err(|e| {
            warn!("esp-ota write failed: {:?}", e);
            FlashError::WriteFailed
        })?;
        Ok(data.len())
    }

    fn end(self: Box<Self>) -> Result<(), FlashError> {
        let mut completed = self.update.finalize().map_err(|e| {
            warn!("esp-ota finalize failed: {:?}", e);
            FlashError::FinalizeFailed
        })?;
        completed.set_as_boot_partition().map_err(|e| {
            warn!("esp-ota set_as_boot_partition failed: {:?}", e);
            FlashError::BootSetFailed
        })?;
        info!("OTA: new image set as boot partition");
        Ok(())
    }

    fn abort(self: Box<Self>) {
        // esp-ota aborts the partition write when OtaUpdate is dropped.
        drop(self.update);
        warn!("OTA: flash session aborted");
    }
}

// ── Simulation ────────────────────────────────────────────────

#[cfg(not(target_os = "espidf"))]
use std::sync::{Arc, Mutex, PoisonError};

/// What the simulated partition has seen so far.
#[cfg(not(target_os = "espidf"))]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlashRecord {
    pub image: Vec<u8>,
    pub declared_size: usize,
    pub sessions: u32,
    pub ended: bool,
    pub aborted: bool,
    pub rebooted: bool,
}

#[cfg(not(target_os = "espidf"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashFault {
    None,
    Begin,
    /// Accept one byte less than offered.
    ShortWrite,
    End,
}

#[cfg(not(target_os = "espidf"))]
pub struct MemoryFlash {
    record: Arc<Mutex<FlashRecord>>,
    fault: FlashFault,
}

#[cfg(not(target_os = "espidf"))]
impl MemoryFlash {
    pub fn new() -> Self {
        Self::with_fault(FlashFault::None)
    }

    pub fn with_fault(fault: FlashFault) -> Self {
        Self {
            record: Arc::new(Mutex::new(FlashRecord::default())),
            fault,
        }
    }

    pub fn record(&self) -> FlashRecord {
        lock(&self.record).clone()
    }
}

#[cfg(not(target_os = "espidf"))]
impl Default for MemoryFlash {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(not(target_os = "espidf"))]
fn lock(record: &Mutex<FlashRecord>) -> std::sync::MutexGuard<'_, FlashRecord> {
    record.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(not(target_os = "espidf"))]
struct MemorySession {
    record: Arc<Mutex<FlashRecord>>,
    fault: FlashFault,
}

#[cfg(not(target_os = "espidf"))]
impl FlashWriter for MemoryFlash {
    fn begin(&self, image_size: usize) -> Result<Box<dyn FlashSession>, FlashError> {
        if self.fault == FlashFault::Begin {
            return Err(FlashError::BeginFailed);
        }
        let mut r = lock(&self.record);
        r.image.clear();
        r.declared_size = image_size;
        r.sessions += 1;
        r.ended = false;
        r.aborted = false;
        info!("OTA(sim): flash session open for {} bytes", image_size);
        Ok(Box::new(MemorySession {
            record: Arc::clone(&self.record),
            fault: self.fault,
        }))
    }

    fn reboot(&self) {
        info!("OTA(sim): reboot requested");
        lock(&self.record).rebooted = true;
    }
}

#[cfg(not(target_os = "espidf"))]
impl FlashSession for MemorySession {
    fn write(&mut self, data: &[u8]) -> Result<usize, FlashError> {
        let accepted = if self.fault == FlashFault::ShortWrite {
            data.len().saturating_sub(1)
        } else {
            data.len()
        };
        lock(&self.record).image.extend_from_slice(&data[..accepted]);
        Ok(accepted)
    }

    fn end(self: Box<Self>) -> Result<(), FlashError> {
        if self.fault == FlashFault::End {
            return Err(FlashError::FinalizeFailed);
        }
        let mut r = lock(&self.record);
        if r.image.len() != r.declared_size {
            return Err(FlashError::FinalizeFailed);
        }
        r.ended = true;
        Ok(())
    }

    fn abort(self: Box<Self>) {
        let mut r = lock(&self.record);
        r.image.clear();
        r.aborted = true;
    }
}
