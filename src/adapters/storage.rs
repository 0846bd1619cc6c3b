//! File storage adapter.
//!
//! Implements [`StoragePort`] for the badge's small files (BLE token,
//! owner, contact) and the staged update image.
//!
//! ## cfg gating
//!
//! - **`target_os = "espidf"`**: FAT on the wear-levelled `storage` flash
//!   partition, mounted at `/storage` and accessed through `std::fs`.
//! - **all other targets**: in-memory file map for host-side tests.

use std::io::{Read, Write};

use log::info;

use crate::app::ports::{StorageError, StoragePort};

#[cfg(not(target_os = "espidf"))]
use std::collections::HashMap;
#[cfg(not(target_os = "espidf"))]
use std::sync::{Arc, Mutex, PoisonError};

#[cfg(target_os = "espidf")]
const MOUNT_POINT: &str = "/storage";

#[cfg(not(target_os = "espidf"))]
type Files = Arc<Mutex<HashMap<String, Vec<u8>>>>;

pub struct FatStorage {
    #[cfg(not(target_os = "espidf"))]
    files: Files,
}

// ───────────────────────────────────────────────────────────────
// ESP-IDF backend
// ───────────────────────────────────────────────────────────────

#[cfg(target_os = "espidf")]
impl FatStorage {
    /// Mount the FAT partition, formatting it if it holds no filesystem.
    pub fn mount() -> Result<Self, StorageError> {
        use esp_idf_svc::sys::*;

        let config = esp_vfs_fat_mount_config_t {
            format_if_mount_failed: true,
            max_files: 4,
            allocation_unit_size: 4096,
            ..Default::default()
        };
        let mut wl_handle: wl_handle_t = -1;
        // SAFETY: both strings are NUL-terminated statics; called once from
        // the main task before any file access.
        let ret = unsafe {
            esp_vfs_fat_spiflash_mount_rw_wl(
                c"/storage".as_ptr(),
                c"storage".as_ptr(),
                &config,
                &mut wl_handle,
            )
        };
        if ret != ESP_OK {
            log::error!("storage: FAT mount failed ({})", ret);
            return Err(StorageError::NotMounted);
        }
        info!("storage: FAT mounted at {}", MOUNT_POINT);
        Ok(Self {})
    }

    fn full_path(path: &str) -> String {
        format!("{MOUNT_POINT}{path}")
    }
}

#[cfg(target_os = "espidf")]
fn map_io(e: &std::io::Error, fallback: StorageError) -> StorageError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound
    } else {
        fallback
    }
}

#[cfg(target_os = "espidf")]
impl StoragePort for FatStorage {
    fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        std::fs::read(Self::full_path(path)).map_err(|e| map_io(&e, StorageError::ReadFailed))
    }

    fn write(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        std::fs::write(Self::full_path(path), data).map_err(|e| map_io(&e, StorageError::WriteFailed))
    }

    fn remove(&self, path: &str) -> Result<(), StorageError> {
        match std::fs::remove_file(Self::full_path(path)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(_) => Err(StorageError::RemoveFailed),
        }
    }

    fn exists(&self, path: &str) -> bool {
        std::path::Path::new(&Self::full_path(path)).exists()
    }

    fn create(&self, path: &str) -> Result<Box<dyn Write + Send>, StorageError> {
        let file = std::fs::File::create(Self::full_path(path))
            .map_err(|e| map_io(&e, StorageError::OpenFailed))?;
        Ok(Box::new(std::io::BufWriter::new(file)))
    }

    fn open(&self, path: &str) -> Result<Box<dyn Read + Send>, StorageError> {
        let file = std::fs::File::open(Self::full_path(path))
            .map_err(|e| map_io(&e, StorageError::OpenFailed))?;
        Ok(Box::new(file))
    }
}

// ───────────────────────────────────────────────────────────────
// Simulation backend
// ───────────────────────────────────────────────────────────────

#[cfg(not(target_os = "espidf"))]
impl FatStorage {
    pub fn new() -> Self {
        info!("storage: simulation backend");
        Self {
            files: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn mount() -> Result<Self, StorageError> {
        Ok(Self::new())
    }

    fn with_files<T>(&self, f: impl FnOnce(&mut HashMap<String, Vec<u8>>) -> T) -> T {
        let mut files = self.files.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut files)
    }
}

#[cfg(not(target_os = "espidf"))]
impl Default for FatStorage {
    fn default() -> Self {
        Self::new()
    }
}

/// Streaming writer that appends straight into the shared file map, so a
/// partially written file is visible the way it would be on FAT.
#[cfg(not(target_os = "espidf"))]
struct MemWriter {
    files: Files,
    path: String,
}

#[cfg(not(target_os = "espidf"))]
impl Write for MemWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut files = self.files.lock().unwrap_or_else(PoisonError::into_inner);
        files.entry(self.path.clone()).or_default().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(not(target_os = "espidf"))]
impl StoragePort for FatStorage {
    fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        self.with_files(|f| f.get(path).cloned().ok_or(StorageError::NotFound))
    }

    fn write(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        self.with_files(|f| f.insert(path.to_owned(), data.to_vec()));
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<(), StorageError> {
        self.with_files(|f| f.remove(path));
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        self.with_files(|f| f.contains_key(path))
    }

    fn create(&self, path: &str) -> Result<Box<dyn Write + Send>, StorageError> {
        self.with_files(|f| f.insert(path.to_owned(), Vec::new()));
        Ok(Box::new(MemWriter {
            files: Arc::clone(&self.files),
            path: path.to_owned(),
        }))
    }

    fn open(&self, path: &str) -> Result<Box<dyn Read + Send>, StorageError> {
        let content = self.read(path)?;
        Ok(Box::new(std::io::Cursor::new(content)))
    }
}

// ───────────────────────────────────────────────────────────────
// Tests
// ───────────────────────────────────────────────────────────────
