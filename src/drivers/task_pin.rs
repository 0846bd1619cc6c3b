//! Core-pinned thread spawning for the ESP32 dual-core.
//!
//! Uses esp-idf-hal's `ThreadSpawnConfiguration` (a wrapper over
//! `esp_pthread_set_cfg()`) so that the next `std::thread` spawn creates a
//! FreeRTOS task pinned to a given core with explicit priority and stack
//! size. The config applies to the *next* `pthread_create()` from the
//! calling thread, so the config→spawn pair must not interleave with other
//! thread creation on the same thread.
//!
//! On host targets the core and priority are ignored.

use std::io;
use std::thread::JoinHandle;

/// CPU core identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Core {
    /// Core 0 (PRO_CPU): Bluedroid and the IDF system tasks.
    Pro,
    /// Core 1 (APP_CPU): main loop and update task.
    App,
}

#[cfg(target_os = "espidf")]
impl From<Core> for esp_idf_hal::cpu::Core {
    fn from(core: Core) -> Self {
        match core {
            Core::Pro => Self::Core0,
            Core::App => Self::Core1,
        }
    }
}

/// Spawn a thread pinned to `core`. `name` must be NUL-terminated
/// (e.g. `"ota-update\0"`).
#[cfg(target_os = "espidf")]
pub fn spawn_on_core(
    core: Core,
    priority: u8,
    stack_kb: usize,
    name: &'static str,
    f: impl FnOnce() + Send + 'static,
) -> io::Result<JoinHandle<()>> {
    use esp_idf_hal::task::thread::ThreadSpawnConfiguration;

    ThreadSpawnConfiguration {
        name: Some(name.as_bytes()),
        stack_size: stack_kb * 1024,
        priority,
        pin_to_core: Some(core.into()),
        ..Default::default()
    }
    .set()
    .map_err(|e| io::Error::other(format!("thread spawn config rejected: {e}")))?;

    let display_name = name.trim_end_matches('\0');
    log::info!(
        "Spawning '{}' on {:?} (pri={}, stack={}KB)",
        display_name,
        core,
        priority,
        stack_kb
    );

    let spawned = std::thread::Builder::new().name(display_name.into()).spawn(f);
    if let Err(e) = ThreadSpawnConfiguration::default().set() {
        log::warn!("thread spawn config not restored: {}", e);
    }
    spawned
}

/// Host fallback. Threads keep the platform default stack, which is larger
/// than any configured task stack.
#[cfg(not(target_os = "espidf"))]
pub fn spawn_on_core(
    _core: Core,
    _priority: u8,
    stack_kb: usize,
    name: &'static str,
    f: impl FnOnce() + Send + 'static,
) -> io::Result<JoinHandle<()>> {
    let display_name = name.trim_end_matches('\0');
    log::info!(
        "Spawning '{}' (sim, no core pinning, target stack={}KB)",
        display_name,
        stack_kb
    );

    std::thread::Builder::new().name(display_name.into()).spawn(f)
}
