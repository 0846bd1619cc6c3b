//! Simulated badge and BLE central for integration tests.
//!
//! [`Radio`] stands in for the Bluedroid stack: it records every
//! notification and completes it immediately. [`Badge`] wires the real
//! link, intake, dispatcher and updater together over host storage and
//! the in-memory flash, and exposes the peer's side of the conversation.

#![allow(dead_code)]

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use econbadge::adapters::ble_transport::{BleLink, Characteristic, Notifier};
use econbadge::adapters::flash::MemoryFlash;
use econbadge::adapters::storage::FatStorage;
use econbadge::app::ports::{PeripheralPort, StorageError, StoragePort};
use econbadge::app::profile::Profile;
use econbadge::config::{BLE_MTU, DEFAULT_TOKEN, HW_REVISION, LinkConfig, UpdaterConfig};
use econbadge::error::ErrorCode;
use econbadge::rpc::auth::TokenStore;
use econbadge::rpc::channels::CommandQueue;
use econbadge::rpc::codec::{CommandRequest, CommandResponse, CommandType, RequestHeader, Token};
use econbadge::rpc::engine::{CommandIntake, Dispatcher};
use econbadge::rpc::ota::{UpdateHeader, Updater};
use econbadge::rpc::transport::Link;
use econbadge::rpc::verify::digest;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use sha2::Sha256;

pub const TEST_PUBLIC_PEM: &str = include_str!("../fixtures/test_signing_pub.pem");
const TEST_PRIVATE_PEM: &str = include_str!("../fixtures/test_signing_key.pem");

pub const WAIT: Duration = Duration::from_secs(5);

// ── Radio ─────────────────────────────────────────────────────

pub type TestLink = BleLink<Arc<Radio>>;

#[derive(Default)]
pub struct Radio {
    responses: Mutex<Vec<CommandResponse>>,
    arrived: Condvar,
    data: Mutex<Vec<u8>>,
    link: OnceLock<Weak<TestLink>>,
    /// Report data notifications as failed.
    fail_data: AtomicBool,
    /// Leave command notifications uncompleted.
    hold_commands: AtomicBool,
}

impl Notifier for Radio {
    fn notify(&self, characteristic: Characteristic, data: &[u8]) -> bool {
        let link = self.link.get().and_then(Weak::upgrade);
        match characteristic {
            Characteristic::Command => {
                if let Ok(response) = CommandResponse::decode(data) {
                    self.responses.lock().unwrap().push(response);
                    self.arrived.notify_all();
                }
                if let Some(link) = link.filter(|_| !self.hold_commands.load(Ordering::SeqCst)) {
                    link.on_command_notified();
                }
            }
            Characteristic::Data => {
                let ok = !self.fail_data.load(Ordering::SeqCst);
                if ok {
                    self.data.lock().unwrap().extend_from_slice(data);
                }
                if let Some(link) = link {
                    link.on_data_notified(ok);
                }
            }
        }
        true
    }
}

impl Radio {
    pub fn responses(&self) -> Vec<CommandResponse> {
        self.responses.lock().unwrap().clone()
    }

    pub fn codes(&self) -> Vec<ErrorCode> {
        self.responses().iter().map(CommandResponse::error).collect()
    }

    /// Block until at least `count` responses arrived or `WAIT` elapses.
    pub fn wait_for_responses(&self, count: usize) -> Vec<CommandResponse> {
        let guard = self.responses.lock().unwrap();
        let (guard, _) = self
            .arrived
            .wait_timeout_while(guard, WAIT, |r| r.len() < count)
            .unwrap();
        guard.clone()
    }

    pub fn data(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    pub fn fail_data(&self, fail: bool) {
        self.fail_data.store(fail, Ordering::SeqCst);
    }

    pub fn hold_command_completions(&self, hold: bool) {
        self.hold_commands.store(hold, Ordering::SeqCst);
    }
}

pub fn fast_link_config() -> LinkConfig {
    LinkConfig {
        notify_retry_delay_ms: 1,
        max_chunk_resends: 3,
        send_timeout_ms: 500,
        inbound_slot_wait_ms: 500,
        response_lock_wait_ms: 100,
        ..LinkConfig::default()
    }
}

pub fn fast_updater_config() -> UpdaterConfig {
    UpdaterConfig {
        request_timeout_ms: 1_000,
        restart_delay_ms: 1,
        ..UpdaterConfig::default()
    }
}

pub fn connected_link(config: LinkConfig) -> (Arc<Radio>, Arc<TestLink>) {
    let radio = Arc::new(Radio::default());
    let link = Arc::new(BleLink::new(Arc::clone(&radio), config));
    radio.link.set(Arc::downgrade(&link)).ok();
    link.on_connect();
    (radio, link)
}

// ── Peripherals ───────────────────────────────────────────────

/// Records forwarded peripheral commands and echoes their payload.
#[derive(Default, Clone)]
pub struct RecordingPeripherals {
    pub seen: Arc<Mutex<Vec<CommandType>>>,
}

impl PeripheralPort for RecordingPeripherals {
    fn handle(&mut self, command: CommandType, payload: &[u8], response: &mut CommandResponse) {
        self.seen.lock().unwrap().push(command);
        response.set_payload(payload);
    }
}

// ── Storage that refuses to stage files ───────────────────────

/// Host storage whose streamed writes fail after `budget` bytes.
pub struct ShortStorage {
    inner: FatStorage,
    budget: usize,
}

impl ShortStorage {
    pub fn new(budget: usize) -> Self {
        Self {
            inner: FatStorage::new(),
            budget,
        }
    }
}

struct ShortWriter {
    inner: Box<dyn Write + Send>,
    left: usize,
}

impl Write for ShortWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.left == 0 {
            return Err(io::Error::other("medium full"));
        }
        let n = buf.len().min(self.left);
        self.left -= n;
        self.inner.write(&buf[..n])
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl StoragePort for ShortStorage {
    fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        self.inner.read(path)
    }

    fn write(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        self.inner.write(path, data)
    }

    fn remove(&self, path: &str) -> Result<(), StorageError> {
        self.inner.remove(path)
    }

    fn exists(&self, path: &str) -> bool {
        self.inner.exists(path)
    }

    fn create(&self, path: &str) -> Result<Box<dyn Write + Send>, StorageError> {
        Ok(Box::new(ShortWriter {
            inner: self.inner.create(path)?,
            left: self.budget,
        }))
    }

    fn open(&self, path: &str) -> Result<Box<dyn Read + Send>, StorageError> {
        self.inner.open(path)
    }
}

// ── Badge ─────────────────────────────────────────────────────

pub struct Badge {
    pub radio: Arc<Radio>,
    pub link: Arc<TestLink>,
    pub storage: Arc<dyn StoragePort>,
    pub flash: Arc<MemoryFlash>,
    pub tokens: Arc<TokenStore>,
    pub queue: Arc<CommandQueue>,
    pub intake: CommandIntake,
    pub updater: Arc<Updater>,
    pub dispatcher: Dispatcher,
    pub peripherals: RecordingPeripherals,
}

impl Badge {
    pub fn new() -> Self {
        Self::with(Arc::new(FatStorage::new()), MemoryFlash::new())
    }

    pub fn with(storage: Arc<dyn StoragePort>, flash: MemoryFlash) -> Self {
        Self::build(storage, flash, fast_updater_config(), TEST_PUBLIC_PEM)
    }

    pub fn build(
        storage: Arc<dyn StoragePort>,
        flash: MemoryFlash,
        updater_config: UpdaterConfig,
        public_key_pem: &'static str,
    ) -> Self {
        let (radio, link) = connected_link(fast_link_config());
        let dyn_link: Arc<dyn Link> = link.clone();
        let flash = Arc::new(flash);
        let tokens = Arc::new(TokenStore::load(Arc::clone(&storage)));
        let queue = Arc::new(CommandQueue::new());
        let intake = CommandIntake::new(Arc::clone(&queue), Arc::clone(&tokens), Arc::clone(&dyn_link));
        let updater = Arc::new(
            Updater::new(
                updater_config,
                Arc::clone(&dyn_link),
                Arc::clone(&storage),
                flash.clone(),
            )
            .with_public_key(public_key_pem),
        );
        let peripherals = RecordingPeripherals::default();
        let dispatcher = Dispatcher::new(
            Arc::clone(&queue),
            Arc::clone(&tokens),
            dyn_link,
            Arc::clone(&updater),
            Profile::new(Arc::clone(&storage), Arc::clone(&tokens)),
            Box::new(peripherals.clone()),
        );
        Self {
            radio,
            link,
            storage,
            flash,
            tokens,
            queue,
            intake,
            updater,
            dispatcher,
            peripherals,
        }
    }

    /// Write a command frame as the peer would, with the given token.
    pub fn send_with_token(&self, id: u32, token: Token, command: CommandType, payload: &[u8]) {
        let frame = CommandRequest::new(id, token, command.as_u8(), payload).unwrap().encode();
        self.intake.on_command_written(&frame);
    }

    /// Write a command frame carrying the factory token.
    pub fn send(&self, id: u32, command: CommandType, payload: &[u8]) {
        self.send_with_token(id, Token(*DEFAULT_TOKEN), command, payload);
    }

    /// Run the main loop once.
    pub fn tick(&mut self) -> usize {
        self.dispatcher.execute_commands()
    }

    /// Send `command`, run the main loop and return its response.
    pub fn call(&mut self, id: u32, command: CommandType, payload: &[u8]) -> CommandResponse {
        let before = self.radio.responses().len();
        self.send(id, command, payload);
        self.tick();
        let responses = self.radio.wait_for_responses(before + 1);
        responses[before].clone()
    }

    /// Peer writes on the data characteristic, one MTU at a time.
    pub fn write_data(&self, bytes: &[u8]) {
        for chunk in bytes.chunks(BLE_MTU) {
            self.link.on_data_written(chunk);
        }
    }

    pub fn wait_until_settled(&self) {
        let deadline = Instant::now() + WAIT;
        while self.updater.state().is_busy() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

// ── Update images ─────────────────────────────────────────────

pub fn update_request(id: u32) -> RequestHeader {
    CommandRequest::new(id, Token(*DEFAULT_TOKEN), CommandType::FirmwareUpdate.as_u8(), &[])
        .unwrap()
        .header
}

/// Deterministic image bytes.
pub fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + 7) as u8).collect()
}

/// Header for `image`, signed with the test key.
pub fn signed_header(image: &[u8]) -> UpdateHeader {
    let checksum = digest(image);
    let key = RsaPrivateKey::from_pkcs8_pem(TEST_PRIVATE_PEM).unwrap();
    let signature = key.sign(Pkcs1v15Sign::new::<Sha256>(), &checksum).unwrap();
    UpdateHeader::new(image.len() as u32, checksum, &signature, HW_REVISION)
}
