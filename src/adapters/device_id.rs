//! Device identity derived from the ESP32 factory MAC address.
//!
//! The BLE advertising name is `ECB-` followed by all six MAC bytes in
//! uppercase hex (e.g. `ECB-DEADBEEFCAFE`). It is stable across reboots
//! because the MAC is burned into eFuse.

use core::fmt::Write;

/// `ECB-` + 12 hex digits.
pub type DeviceName = heapless::String<16>;

/// Full 6-byte MAC address.
pub type MacAddress = [u8; 6];

/// Read the factory MAC address from eFuse.
#[cfg(target_os = "espidf")]
pub fn read_mac() -> MacAddress {
    let mut mac: MacAddress = [0u8; 6];
    // SAFETY: the buffer is exactly the 6 bytes the call writes.
    unsafe {
        esp_idf_svc::sys::esp_efuse_mac_get_default(mac.as_mut_ptr());
    }
    mac
}

/// Simulation: returns a deterministic fake MAC.
#[cfg(not(target_os = "espidf"))]
pub fn read_mac() -> MacAddress {
    [0xDE, 0xAD, 0xBE, 0xEF, 0xCA, 0xFE]
}

pub fn device_name(mac: &MacAddress) -> DeviceName {
    let mut name = DeviceName::new();
    let _ = name.push_str("ECB-");
    for b in mac {
        let _ = write!(name, "{b:02X}");
    }
    name
}
