//! Adapters — concrete implementations of the port traits and the BLE glue.
//!
//! | Adapter         | Implements          | Connects to                  |
//! |-----------------|---------------------|------------------------------|
//! | `ble`           | GATT event routing  | Bluedroid GATT server        |
//! | `ble_transport` | Link                | command / data characteristics |
//! | `device_id`     | advertising name    | eFuse MAC                    |
//! | `flash`         | FlashWriter         | OTA partitions (esp-ota)     |
//! | `storage`       | StoragePort         | FAT on wear-levelled flash   |

#[cfg(target_os = "espidf")]
pub mod ble;
pub mod ble_transport;
pub mod device_id;
pub mod flash;
pub mod storage;
