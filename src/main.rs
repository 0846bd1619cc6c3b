//! EConBadge Firmware — Main Entry Point
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                      Adapters (outer ring)                     │
//! │                                                                │
//! │  Bluedroid glue ──▶ BleLink (Link)     FatStorage (Storage)    │
//! │        │                               EspOtaFlash (Flash)     │
//! │        ▼                                                       │
//! │  CommandIntake ──▶ CommandQueue                                │
//! │                                                                │
//! │  ──────────────── Port Trait Boundary ───────────────────      │
//! │                                                                │
//! │  ┌────────────────────────────────────────────────────────┐    │
//! │  │  Dispatcher (main loop)   Updater (task on APP core)   │    │
//! │  │  Profile · TokenStore     SHA-256 · RSA · esp-ota      │    │
//! │  └────────────────────────────────────────────────────────┘    │
//! └────────────────────────────────────────────────────────────────┘
//! ```
#![deny(unused_must_use)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{info, warn};

use econbadge::adapters::ble::{self, GattNotifier};
use econbadge::adapters::ble_transport::BleLink;
use econbadge::adapters::device_id;
use econbadge::adapters::flash::EspOtaFlash;
use econbadge::adapters::storage::FatStorage;
use econbadge::app::ports::{PeripheralPort, StoragePort};
use econbadge::app::profile::Profile;
use econbadge::config::{CONTROL_TICK_MS, HW_REVISION, LinkConfig, UpdaterConfig};
use econbadge::error::ErrorCode;
use econbadge::rpc::auth::TokenStore;
use econbadge::rpc::channels::CommandQueue;
use econbadge::rpc::codec::{CommandResponse, CommandType};
use econbadge::rpc::engine::{CommandIntake, Dispatcher};
use econbadge::rpc::ota::{self, UpdateState, Updater};
use econbadge::rpc::transport::Link;

/// Display and LED drivers are not attached in this build; every
/// peripheral command is answered with `NOT_INITIALIZED`.
struct DetachedPeripherals;

impl PeripheralPort for DetachedPeripherals {
    fn handle(&mut self, command: CommandType, _payload: &[u8], response: &mut CommandResponse) {
        warn!("peripheral command {:?} with no driver attached", command);
        response.set_error(ErrorCode::NotInitialized);
    }
}

fn main() -> Result<()> {
    // ── 1. ESP-IDF bootstrap ──────────────────────────────────
    esp_idf_svc::sys::link_patches();
    esp_idf_logger::init()?;

    info!("╔══════════════════════════════════════╗");
    info!("║  EConBadge v{}  ({})           ║", env!("CARGO_PKG_VERSION"), HW_REVISION);
    info!("╚══════════════════════════════════════╝");

    // ── 2. Confirm the running image ──────────────────────────
    ota::check_rollback();

    // ── 3. Storage and credentials ────────────────────────────
    let storage: Arc<dyn StoragePort> = Arc::new(FatStorage::mount()?);
    let tokens = Arc::new(TokenStore::load(Arc::clone(&storage)));

    // ── 4. Link, intake and update pipeline ───────────────────
    let link = Arc::new(BleLink::new(GattNotifier, LinkConfig::default()));
    let dyn_link: Arc<dyn Link> = link.clone();
    let queue = Arc::new(CommandQueue::new());
    let intake = Arc::new(CommandIntake::new(
        Arc::clone(&queue),
        Arc::clone(&tokens),
        Arc::clone(&dyn_link),
    ));
    let updater = Arc::new(Updater::new(
        UpdaterConfig::default(),
        Arc::clone(&dyn_link),
        Arc::clone(&storage),
        Arc::new(EspOtaFlash::new()),
    ));
    let mut dispatcher = Dispatcher::new(
        queue,
        Arc::clone(&tokens),
        dyn_link,
        Arc::clone(&updater),
        Profile::new(Arc::clone(&storage), tokens),
        Box::new(DetachedPeripherals),
    );

    // ── 5. BLE ────────────────────────────────────────────────
    let name = device_id::device_name(&device_id::read_mac());
    ble::start(&name, link, intake)?;

    // ── 6. Main loop ──────────────────────────────────────────
    let tick = Duration::from_millis(u64::from(CONTROL_TICK_MS));
    let mut last_state = updater.state();
    let mut last_progress = updater.progress();

    loop {
        dispatcher.execute_commands();

        let state = updater.state();
        let progress = updater.progress();
        if state != last_state {
            info!("OTA state: {} -> {}", last_state, state);
            last_state = state;
        }
        if state.is_busy() && progress / 10 != last_progress / 10 {
            info!("OTA progress: {}%", progress);
        }
        last_progress = progress;

        std::thread::sleep(tick);
    }
}
