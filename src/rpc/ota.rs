//! Verified OTA update pipeline.
//!
//! One session per `FIRMWARE_UPDATE` command, run on its own task:
//!
//! ```text
//!  peer                         badge (update task)
//!  ────                         ───────────────────
//!  FIRMWARE_UPDATE ───────────▶ ack NO_ERROR
//!  UpdateHeader (312 B) ──────▶ magic + hw check, fresh staging file
//!                   ◀────────── NO_ERROR (ready for data)
//!  image bytes ───────────────▶ Downloading   progress  0..33
//!                               Verifying     progress 33..66  SHA-256 + RSA
//!                               Applying      progress 66..100 flash writer
//!                   ◀────────── NO_ERROR, short delay, reboot
//! ```
//!
//! The whole image is staged and verified before a single byte reaches the
//! update partition. Any failure removes the staged file, aborts an open
//! flash session, clears the inbound transport slot and sends one error
//! response; the updater then sits in `Aborted(code)` until the next
//! session.

use core::cell::Cell;
use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};
use std::io::{Read, Write};
use std::sync::Arc;
use std::thread::JoinHandle;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use log::{info, warn};

use crate::app::ports::{FlashSession, FlashWriter, StoragePort};
use crate::config::{
    HW_REVISION, UPDATE_CHUNK_SIZE, UPDATE_FILE_PATH, UPDATE_MAGIC, UPDATE_PUBLIC_KEY_PEM,
    UpdaterConfig,
};
use crate::drivers::task_pin::{Core, spawn_on_core};
use crate::error::ErrorCode;
use crate::rpc::codec::{CommandResponse, RequestHeader};
use crate::rpc::transport::Link;
use crate::rpc::verify::{DIGEST_SIZE, ImageDigest, SignatureVerifier, to_hex};

// ── Update header ─────────────────────────────────────────────

pub const SIGNATURE_SIZE: usize = 256;
pub const HW_FIELD_SIZE: usize = 16;

const MAGIC_OFFSET: usize = 0;
const SIZE_OFFSET: usize = 4;
const CHECKSUM_OFFSET: usize = 8;
const SIGNATURE_OFFSET: usize = CHECKSUM_OFFSET + DIGEST_SIZE;
const HW_OFFSET: usize = SIGNATURE_OFFSET + SIGNATURE_SIZE;

/// Encoded length of [`UpdateHeader`] on the data channel.
pub const UPDATE_HEADER_SIZE: usize = HW_OFFSET + HW_FIELD_SIZE;

/// Sent once on the data channel ahead of the image.
///
/// ```text
/// ┌────────┬────────┬──────────────┬────────────────┬──────────────┐
/// │ magic  │ size   │ checksum     │ signature      │ compat_hw    │
/// │ u32 LE │ u32 LE │ SHA-256 (32) │ RSA-2048 (256) │ NUL-term (16)│
/// └────────┴────────┴──────────────┴────────────────┴──────────────┘
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateHeader {
    pub magic: u32,
    pub size: u32,
    pub checksum: [u8; DIGEST_SIZE],
    pub signature: [u8; SIGNATURE_SIZE],
    pub compat_hw: [u8; HW_FIELD_SIZE],
}

impl UpdateHeader {
    /// Header for an image of `size` bytes built for `hw_revision`.
    /// The revision is cut to 15 bytes so the field stays NUL-terminated.
    pub fn new(size: u32, checksum: [u8; DIGEST_SIZE], signature: &[u8], hw_revision: &str) -> Self {
        let mut sig = [0u8; SIGNATURE_SIZE];
        let n = signature.len().min(SIGNATURE_SIZE);
        sig[..n].copy_from_slice(&signature[..n]);

        let mut hw = [0u8; HW_FIELD_SIZE];
        let n = hw_revision.len().min(HW_FIELD_SIZE - 1);
        hw[..n].copy_from_slice(&hw_revision.as_bytes()[..n]);

        Self {
            magic: UPDATE_MAGIC,
            size,
            checksum,
            signature: sig,
            compat_hw: hw,
        }
    }

    pub fn decode(raw: &[u8; UPDATE_HEADER_SIZE]) -> Self {
        let mut checksum = [0u8; DIGEST_SIZE];
        checksum.copy_from_slice(&raw[CHECKSUM_OFFSET..SIGNATURE_OFFSET]);
        let mut signature = [0u8; SIGNATURE_SIZE];
        signature.copy_from_slice(&raw[SIGNATURE_OFFSET..HW_OFFSET]);
        let mut compat_hw = [0u8; HW_FIELD_SIZE];
        compat_hw.copy_from_slice(&raw[HW_OFFSET..]);
        Self {
            magic: read_u32(raw, MAGIC_OFFSET),
            size: read_u32(raw, SIZE_OFFSET),
            checksum,
            signature,
            compat_hw,
        }
    }

    pub fn encode(&self) -> [u8; UPDATE_HEADER_SIZE] {
        let mut out = [0u8; UPDATE_HEADER_SIZE];
        out[MAGIC_OFFSET..SIZE_OFFSET].copy_from_slice(&self.magic.to_le_bytes());
        out[SIZE_OFFSET..CHECKSUM_OFFSET].copy_from_slice(&self.size.to_le_bytes());
        out[CHECKSUM_OFFSET..SIGNATURE_OFFSET].copy_from_slice(&self.checksum);
        out[SIGNATURE_OFFSET..HW_OFFSET].copy_from_slice(&self.signature);
        out[HW_OFFSET..].copy_from_slice(&self.compat_hw);
        out
    }

    /// Revision text up to the first NUL.
    pub fn hw_revision(&self) -> &[u8] {
        let end = self
            .compat_hw
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(HW_FIELD_SIZE);
        &self.compat_hw[..end]
    }

    /// Accept only non-empty images with our magic built for `hw_revision`.
    pub fn validate(&self, hw_revision: &str) -> Result<(), ErrorCode> {
        if self.magic != UPDATE_MAGIC {
            warn!("OTA: bad magic {:#010x}", self.magic);
            return Err(ErrorCode::InvalidParam);
        }
        if self.hw_revision() != hw_revision.as_bytes() {
            warn!(
                "OTA: image built for '{}', running '{}'",
                String::from_utf8_lossy(self.hw_revision()),
                hw_revision
            );
            return Err(ErrorCode::InvalidParam);
        }
        if self.size == 0 {
            warn!("OTA: empty image");
            return Err(ErrorCode::InvalidParam);
        }
        Ok(())
    }
}

fn read_u32(raw: &[u8], offset: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&raw[offset..offset + 4]);
    u32::from_le_bytes(b)
}

// ── State and progress ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    Downloading,
    Verifying,
    Applying,
    /// Last session failed with this code. Accepts a new session.
    Aborted(ErrorCode),
}

impl UpdateState {
    pub fn is_busy(self) -> bool {
        matches!(self, Self::Downloading | Self::Verifying | Self::Applying)
    }
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Downloading => write!(f, "downloading"),
            Self::Verifying => write!(f, "verifying"),
            Self::Applying => write!(f, "applying"),
            Self::Aborted(code) => write!(f, "aborted: {code}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Download,
    Verify,
    Apply,
}

/// Overall progress for `percent` of `phase` done. Apply tops out at 99;
/// 100 is only reported once the flash writer has accepted the image.
pub fn band(phase: Phase, percent: u8) -> u8 {
    let p = percent.min(100) / 3;
    match phase {
        Phase::Download => p,
        Phase::Verify => 33 + p,
        Phase::Apply => 66 + p,
    }
}

fn percent_done(total: usize, remaining: usize) -> u8 {
    (100 - (remaining as u64 * 100 / total as u64)) as u8
}

// ── Updater ───────────────────────────────────────────────────

pub struct Updater {
    config: UpdaterConfig,
    link: Arc<dyn Link>,
    storage: Arc<dyn StoragePort>,
    flash: Arc<dyn FlashWriter>,
    public_key_pem: &'static str,
    hw_revision: &'static str,
    state: Mutex<CriticalSectionRawMutex, Cell<UpdateState>>,
    progress: AtomicU8,
}

impl Updater {
    pub fn new(
        config: UpdaterConfig,
        link: Arc<dyn Link>,
        storage: Arc<dyn StoragePort>,
        flash: Arc<dyn FlashWriter>,
    ) -> Self {
        Self {
            config,
            link,
            storage,
            flash,
            public_key_pem: UPDATE_PUBLIC_KEY_PEM,
            hw_revision: HW_REVISION,
            state: Mutex::new(Cell::new(UpdateState::Idle)),
            progress: AtomicU8::new(0),
        }
    }

    /// Verify images against another signing key (PEM, SPKI).
    #[must_use]
    pub fn with_public_key(mut self, pem: &'static str) -> Self {
        self.public_key_pem = pem;
        self
    }

    pub fn state(&self) -> UpdateState {
        self.state.lock(Cell::get)
    }

    /// Session progress, 0..=100.
    pub fn progress(&self) -> u8 {
        self.progress.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: UpdateState) {
        self.state.lock(|s| s.set(state));
    }

    fn advance(&self, phase: Phase, percent: u8) {
        self.progress.fetch_max(band(phase, percent), Ordering::Relaxed);
    }

    /// Start a session for `request` on the update task.
    ///
    /// Fails with `ACTION_FAILED`, without sending anything, when a session
    /// is already running or the task cannot be spawned. Otherwise the task
    /// sends every response of the session, starting with the ack.
    pub fn request_update(self: &Arc<Self>, request: RequestHeader) -> Result<JoinHandle<()>, ErrorCode> {
        let claimed = self.state.lock(|s| {
            if s.get().is_busy() {
                false
            } else {
                s.set(UpdateState::Downloading);
                true
            }
        });
        if !claimed {
            warn!("OTA: session already running, rejecting id={}", request.identifier);
            return Err(ErrorCode::ActionFailed);
        }
        self.progress.store(0, Ordering::Relaxed);

        let this = Arc::clone(self);
        spawn_on_core(
            Core::App,
            self.config.task_priority,
            self.config.task_stack_kb,
            "ota-update\0",
            move || this.run_session(&request),
        )
        .map_err(|e| {
            warn!("OTA: update task spawn failed: {}", e);
            self.set_state(UpdateState::Aborted(ErrorCode::ActionFailed));
            ErrorCode::ActionFailed
        })
    }

    fn run_session(&self, request: &RequestHeader) {
        info!("OTA: session started (id={})", request.identifier);
        match self.pipeline(request) {
            Ok(()) => {
                if let Err(e) = self.storage.remove(UPDATE_FILE_PATH) {
                    warn!("OTA: staged image not removed: {}", e);
                }
                self.respond(request, ErrorCode::NoError);
                std::thread::sleep(self.config.restart_delay());
                self.set_state(UpdateState::Idle);
                info!("OTA: update applied, rebooting");
                self.flash.reboot();
            }
            Err(code) => {
                warn!("OTA: session aborted: {}", code);
                self.link.discard_inbound();
                if let Err(e) = self.storage.remove(UPDATE_FILE_PATH) {
                    warn!("OTA: staged image not removed: {}", e);
                }
                self.respond(request, code);
                self.set_state(UpdateState::Aborted(code));
            }
        }
    }

    fn pipeline(&self, request: &RequestHeader) -> Result<(), ErrorCode> {
        self.link.reset_inbound();
        self.respond(request, ErrorCode::NoError);

        let mut buf = Vec::new();
        buf.try_reserve_exact(UPDATE_CHUNK_SIZE).map_err(|_| {
            warn!("OTA: no memory for {} byte chunk buffer", UPDATE_CHUNK_SIZE);
            ErrorCode::NoMoreMemory
        })?;
        buf.resize(UPDATE_CHUNK_SIZE, 0);

        let header = self.download(request, &mut buf)?;
        self.set_state(UpdateState::Verifying);
        self.verify(&header, &mut buf)?;
        self.set_state(UpdateState::Applying);
        self.apply(&header, &mut buf)
    }

    // ── Downloading ──────────────────────────────────────────

    fn download(&self, request: &RequestHeader, buf: &mut [u8]) -> Result<UpdateHeader, ErrorCode> {
        let timeout = Some(self.config.request_timeout());

        let mut raw = [0u8; UPDATE_HEADER_SIZE];
        self.link.receive(&mut raw, timeout).map_err(|e| {
            warn!("OTA: header receive failed: {}", e);
            ErrorCode::InvalidParam
        })?;
        let header = UpdateHeader::decode(&raw);
        header.validate(self.hw_revision)?;
        info!("OTA: header accepted, image is {} bytes", header.size);

        self.storage.remove(UPDATE_FILE_PATH).map_err(|e| {
            warn!("OTA: stale image not removed: {}", e);
            ErrorCode::from(e)
        })?;
        let mut file = self.storage.create(UPDATE_FILE_PATH).map_err(|e| {
            warn!("OTA: staging file not created: {}", e);
            ErrorCode::from(e)
        })?;

        self.respond(request, ErrorCode::NoError);

        let total = header.size as usize;
        let mut remaining = total;
        while remaining > 0 {
            let n = remaining.min(buf.len());
            self.link.receive(&mut buf[..n], timeout).map_err(|e| {
                warn!("OTA: data receive failed, {} bytes outstanding: {}", remaining, e);
                e.on_receive()
            })?;
            file.write_all(&buf[..n]).map_err(|e| {
                warn!("OTA: staging write failed: {}", e);
                ErrorCode::WriteFileFailed
            })?;
            remaining -= n;
            self.advance(Phase::Download, percent_done(total, remaining));
        }
        file.flush().map_err(|e| {
            warn!("OTA: staging flush failed: {}", e);
            ErrorCode::WriteFileFailed
        })?;

        info!("OTA: download complete");
        Ok(header)
    }

    // ── Verifying ────────────────────────────────────────────

    fn verify(&self, header: &UpdateHeader, buf: &mut [u8]) -> Result<(), ErrorCode> {
        header.validate(self.hw_revision)?;
        let mut file = self.open_staged()?;

        let total = header.size as usize;
        let mut remaining = total;
        let mut digest = ImageDigest::new();
        while remaining > 0 {
            let n = remaining.min(buf.len());
            let got = read_chunk(&mut *file, &mut buf[..n])?;
            digest.update(&buf[..got]);
            remaining -= got;
            self.advance(Phase::Verify, percent_done(total, remaining));
        }

        let computed = digest.finalize();
        info!("OTA: image digest {}", to_hex(&computed));
        if computed != header.checksum {
            warn!("OTA: digest does not match header checksum");
            return Err(ErrorCode::CorruptedData);
        }

        let verifier = SignatureVerifier::from_pem(self.public_key_pem).map_err(|e| {
            warn!("OTA: {}", e);
            ErrorCode::ActionFailed
        })?;
        verifier.verify(&header.checksum, &header.signature).map_err(|e| {
            warn!("OTA: {}", e);
            ErrorCode::CorruptedData
        })?;

        info!("OTA: signature valid");
        Ok(())
    }

    // ── Applying ─────────────────────────────────────────────

    fn apply(&self, header: &UpdateHeader, buf: &mut [u8]) -> Result<(), ErrorCode> {
        let mut file = self.open_staged()?;
        let total = header.size as usize;

        let mut session = self.flash.begin(total).map_err(|e| {
            warn!("OTA: {}", e);
            ErrorCode::ActionFailed
        })?;
        if let Err(code) = self.stream_into(&mut *session, &mut *file, total, buf) {
            session.abort();
            return Err(code);
        }
        session.end().map_err(|e| {
            warn!("OTA: {}", e);
            ErrorCode::ActionFailed
        })?;

        self.progress.store(100, Ordering::Relaxed);
        Ok(())
    }

    fn stream_into(
        &self,
        session: &mut dyn FlashSession,
        file: &mut dyn Read,
        total: usize,
        buf: &mut [u8],
    ) -> Result<(), ErrorCode> {
        let mut remaining = total;
        while remaining > 0 {
            let n = remaining.min(buf.len());
            let got = read_chunk(file, &mut buf[..n])?;
            match session.write(&buf[..got]) {
                Ok(written) if written == got => {}
                Ok(written) => {
                    warn!("OTA: flash took {} of {} bytes", written, got);
                    return Err(ErrorCode::CorruptedData);
                }
                Err(e) => {
                    warn!("OTA: {}", e);
                    return Err(ErrorCode::CorruptedData);
                }
            }
            remaining -= got;
            self.advance(Phase::Apply, percent_done(total, remaining));
        }
        Ok(())
    }

    // ── Helpers ──────────────────────────────────────────────

    fn open_staged(&self) -> Result<Box<dyn Read + Send>, ErrorCode> {
        self.storage.open(UPDATE_FILE_PATH).map_err(|e| {
            warn!("OTA: staged image not opened: {}", e);
            ErrorCode::from(e)
        })
    }

    fn respond(&self, request: &RequestHeader, code: ErrorCode) {
        let mut response = CommandResponse::for_request(request);
        response.set_error(code);
        if let Err(e) = self.link.send_response(&response) {
            warn!("OTA: response {} not delivered: {}", code, e);
        }
    }
}

/// One read of at most `buf.len()` bytes. End of file before the declared
/// size counts as a read failure.
fn read_chunk(file: &mut dyn Read, buf: &mut [u8]) -> Result<usize, ErrorCode> {
    match file.read(buf) {
        Ok(0) => {
            warn!("OTA: staged image ended early");
            Err(ErrorCode::ReadFileFailed)
        }
        Ok(n) => Ok(n),
        Err(e) => {
            warn!("OTA: staged image read failed: {}", e);
            Err(ErrorCode::ReadFileFailed)
        }
    }
}

// ── Boot validation ───────────────────────────────────────────

/// Mark the running image valid so the bootloader does not roll back.
#[cfg(target_os = "espidf")]
pub fn check_rollback() {
    match esp_ota::mark_app_valid() {
        Ok(()) => info!("OTA: firmware marked valid (rollback cancelled)"),
        Err(e) => warn!("OTA: mark_app_valid failed: {:?}", e),
    }
}

#[cfg(not(target_os = "espidf"))]
pub fn check_rollback() {
    info!("OTA rollback check (simulation): skipped");
}

// ── Tests ─────────────────────────────────────────────────────
