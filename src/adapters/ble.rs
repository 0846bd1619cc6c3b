//! Bluedroid GATT server glue (ESP-IDF only).
//!
//! Registers the badge service, advertises as `ECB-<MAC>` and routes GATT
//! events into [`BleLink`] and [`CommandIntake`]. Bluedroid callbacks are C
//! function pointers that cannot capture Rust state, so handles live in
//! static atomics and the event sinks in a `OnceLock` set by
//! [`start`].
//!
//! Service registration is a chain driven by GATTS events:
//!
//! ```text
//! REG ─▶ create service ─▶ CREATE ─▶ add char[0] ─▶ ADD_CHAR ─┬▶ add char[n+1] …
//!                                                             └▶ add CCCD ─▶ ADD_CHAR_DESCR ─▶ add char[n+1]
//! ```

use core::fmt;
use core::sync::atomic::{AtomicU8, AtomicU16, Ordering};
use std::sync::{Arc, OnceLock};

use esp_idf_svc::sys::*;
use log::{error, info, warn};

use crate::adapters::ble_transport::{BleLink, Characteristic, Notifier};
use crate::adapters::device_id::DeviceName;
use crate::config::{
    BLE_MTU, CHAR_COMMAND, CHAR_DATA, CHAR_HW_VERSION, CHAR_SW_VERSION, HW_REVISION, SERVICE_UUID,
    SW_VERSION,
};
use crate::rpc::engine::CommandIntake;

/// ATT MTU requested from the stack: data MTU plus the 3-byte ATT header.
const LOCAL_MTU: u16 = BLE_MTU as u16 + 3;
const SERVICE_HANDLES: u16 = 12;

// ───────────────────────────────────────────────────────────────
// Errors
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BleError {
    AlreadyStarted,
    Stack { step: &'static str, code: i32 },
}

impl fmt::Display for BleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyStarted => write!(f, "BLE server already started"),
            Self::Stack { step, code } => write!(f, "BLE {} failed ({})", step, code),
        }
    }
}

impl std::error::Error for BleError {}

fn check(code: esp_err_t, step: &'static str) -> Result<(), BleError> {
    if code == ESP_OK {
        Ok(())
    } else {
        error!("BLE: {} failed ({})", step, code);
        Err(BleError::Stack { step, code })
    }
}

// ───────────────────────────────────────────────────────────────
// Characteristic table
// ───────────────────────────────────────────────────────────────

struct CharSpec {
    uuid: u128,
    /// Fixed value served by the stack; `None` for the notify channels.
    value: Option<&'static [u8]>,
}

const CHARS: [CharSpec; 4] = [
    CharSpec {
        uuid: CHAR_HW_VERSION,
        value: Some(HW_REVISION.as_bytes()),
    },
    CharSpec {
        uuid: CHAR_SW_VERSION,
        value: Some(SW_VERSION.as_bytes()),
    },
    CharSpec {
        uuid: CHAR_COMMAND,
        value: None,
    },
    CharSpec {
        uuid: CHAR_DATA,
        value: None,
    },
];

const COMMAND_IDX: usize = 2;
const DATA_IDX: usize = 3;

// ── Static state bridging C callbacks ──────────────────────────

static GATTS_IF: AtomicU8 = AtomicU8::new(ESP_GATT_IF_NONE as u8);
static CONN_ID: AtomicU16 = AtomicU16::new(0);
static SVC_HANDLE: AtomicU16 = AtomicU16::new(0);
static CHAR_STEP: AtomicU8 = AtomicU8::new(0);
static HANDLES: [AtomicU16; 4] = [const { AtomicU16::new(0) }; 4];

struct Sinks {
    link: Arc<BleLink<GattNotifier>>,
    intake: Arc<CommandIntake>,
}

static SINKS: OnceLock<Sinks> = OnceLock::new();

// ───────────────────────────────────────────────────────────────
// Notifier
// ───────────────────────────────────────────────────────────────

/// Notifications through `esp_ble_gatts_send_indicate`. Completion comes
/// back as `ESP_GATTS_CONF_EVT`.
pub struct GattNotifier;

impl Notifier for GattNotifier {
    fn notify(&self, characteristic: Characteristic, data: &[u8]) -> bool {
        let idx = match characteristic {
            Characteristic::Command => COMMAND_IDX,
            Characteristic::Data => DATA_IDX,
        };
        let handle = HANDLES[idx].load(Ordering::Acquire);
        if handle == 0 {
            return false;
        }
        // SAFETY: the stack copies `data` before returning.
        let ret = unsafe {
            esp_ble_gatts_send_indicate(
                GATTS_IF.load(Ordering::Relaxed),
                CONN_ID.load(Ordering::Relaxed),
                handle,
                data.len() as u16,
                data.as_ptr().cast_mut(),
                false,
            )
        };
        ret == ESP_OK
    }
}

// ───────────────────────────────────────────────────────────────
// Startup
// ───────────────────────────────────────────────────────────────

/// Bring up the controller and Bluedroid, register the service and start
/// advertising as `name`.
pub fn start(
    name: &DeviceName,
    link: Arc<BleLink<GattNotifier>>,
    intake: Arc<CommandIntake>,
) -> Result<(), BleError> {
    SINKS
        .set(Sinks { link, intake })
        .map_err(|_| BleError::AlreadyStarted)?;

    let mut c_name = [0u8; 17];
    c_name[..name.len()].copy_from_slice(name.as_bytes());

    // SAFETY: called once from the main task; every pointer handed to the
    // stack is valid for the duration of the call.
    unsafe {
        check(
            esp_bt_controller_mem_release(esp_bt_mode_t_ESP_BT_MODE_CLASSIC_BT),
            "classic BT mem release",
        )?;
        let mut bt_cfg = esp_bt_controller_config_t::default();
        check(esp_bt_controller_init(&mut bt_cfg), "controller init")?;
        check(esp_bt_controller_enable(esp_bt_mode_t_ESP_BT_MODE_BLE), "controller enable")?;
        check(esp_bluedroid_init(), "bluedroid init")?;
        check(esp_bluedroid_enable(), "bluedroid enable")?;

        check(esp_ble_gap_register_callback(Some(gap_event_handler)), "GAP callback")?;
        check(esp_ble_gatts_register_callback(Some(gatts_event_handler)), "GATTS callback")?;
        check(esp_ble_gatts_app_register(0), "GATTS app register")?;
        check(esp_ble_gatt_set_local_mtu(LOCAL_MTU), "set local MTU")?;

        check(esp_ble_gap_set_device_name(c_name.as_ptr().cast()), "set device name")?;
        let mut adv_data = esp_ble_adv_data_t {
            set_scan_rsp: false,
            include_name: true,
            include_txpower: false,
            flag: (ESP_BLE_ADV_FLAG_GEN_DISC | ESP_BLE_ADV_FLAG_BREDR_NOT_SPT) as u8,
            ..core::mem::zeroed()
        };
        check(esp_ble_gap_config_adv_data(&mut adv_data), "config adv data")?;
    }

    info!("BLE: stack up, advertising as '{}'", name);
    Ok(())
}

fn uuid128_to_esp(uuid: u128) -> esp_bt_uuid_t {
    // SAFETY: all-zero is a valid esp_bt_uuid_t.
    let mut t: esp_bt_uuid_t = unsafe { core::mem::zeroed() };
    t.len = 16;
    t.uuid.uuid128 = uuid.to_le_bytes();
    t
}

unsafe fn start_advertising() {
    let mut adv_params = esp_ble_adv_params_t {
        adv_int_min: 0x20,
        adv_int_max: 0x40,
        adv_type: esp_ble_adv_type_t_ADV_TYPE_IND,
        own_addr_type: esp_ble_addr_type_t_BLE_ADDR_TYPE_PUBLIC,
        channel_map: esp_ble_adv_channel_t_ADV_CHNL_ALL,
        adv_filter_policy: esp_ble_adv_filter_t_ADV_FILTER_ALLOW_SCAN_ANY_CON_ANY,
        // SAFETY: remaining fields (peer address) are plain data.
        ..unsafe { core::mem::zeroed() }
    };
    // SAFETY: params are copied by the stack.
    let ret = unsafe { esp_ble_gap_start_advertising(&mut adv_params) };
    if ret != ESP_OK {
        warn!("BLE: start advertising failed ({})", ret);
    }
}

unsafe fn add_char(svc_handle: u16, spec: &CharSpec) {
    let mut uuid = uuid128_to_esp(spec.uuid);
    let ret = match spec.value {
        Some(value) => {
            let mut attr = esp_attr_value_t {
                attr_max_len: value.len() as u16,
                attr_len: value.len() as u16,
                attr_value: value.as_ptr().cast_mut(),
            };
            let mut control = esp_attr_control_t {
                auto_rsp: ESP_GATT_AUTO_RSP as u8,
            };
            // SAFETY: the stack copies the initial value.
            unsafe {
                esp_ble_gatts_add_char(
                    svc_handle,
                    &mut uuid,
                    ESP_GATT_PERM_READ as esp_gatt_perm_t,
                    ESP_GATT_CHAR_PROP_BIT_READ as esp_gatt_char_prop_t,
                    &mut attr,
                    &mut control,
                )
            }
        }
        // SAFETY: null value and control select app-handled reads.
        None => unsafe {
            esp_ble_gatts_add_char(
                svc_handle,
                &mut uuid,
                (ESP_GATT_PERM_READ | ESP_GATT_PERM_WRITE) as esp_gatt_perm_t,
                (ESP_GATT_CHAR_PROP_BIT_READ | ESP_GATT_CHAR_PROP_BIT_WRITE | ESP_GATT_CHAR_PROP_BIT_NOTIFY)
                    as esp_gatt_char_prop_t,
                core::ptr::null_mut(),
                core::ptr::null_mut(),
            )
        },
    };
    if ret != ESP_OK {
        warn!("BLE: add characteristic {:032x} failed ({})", spec.uuid, ret);
    }
}

unsafe fn add_cccd(svc_handle: u16) {
    // SAFETY: all-zero is a valid esp_bt_uuid_t.
    let mut uuid: esp_bt_uuid_t = unsafe { core::mem::zeroed() };
    uuid.len = 2;
    uuid.uuid.uuid16 = ESP_GATT_UUID_CHAR_CLIENT_CONFIG as u16;
    // SAFETY: null value and control; the stack answers CCCD reads itself.
    let ret = unsafe {
        esp_ble_gatts_add_char_descr(
            svc_handle,
            &mut uuid,
            (ESP_GATT_PERM_READ | ESP_GATT_PERM_WRITE) as esp_gatt_perm_t,
            core::ptr::null_mut(),
            core::ptr::null_mut(),
        )
    };
    if ret != ESP_OK {
        warn!("BLE: add CCCD failed ({})", ret);
    }
}

/// Register the characteristic after `step`, or finish the chain.
unsafe fn next_char(step: usize) {
    let next = step + 1;
    if let Some(spec) = CHARS.get(next) {
        CHAR_STEP.store(next as u8, Ordering::Relaxed);
        // SAFETY: called from the GATTS task during registration.
        unsafe { add_char(SVC_HANDLE.load(Ordering::Relaxed), spec) };
    } else {
        info!("BLE GATTS: all characteristics registered");
    }
}

// ───────────────────────────────────────────────────────────────
// Event handlers
// ───────────────────────────────────────────────────────────────

unsafe extern "C" fn gap_event_handler(event: esp_gap_ble_cb_event_t, _param: *mut esp_ble_gap_cb_param_t) {
    match event {
        esp_gap_ble_cb_event_t_ESP_GAP_BLE_ADV_DATA_SET_COMPLETE_EVT => {
            // SAFETY: Bluedroid task context.
            unsafe { start_advertising() };
        }
        esp_gap_ble_cb_event_t_ESP_GAP_BLE_ADV_START_COMPLETE_EVT => {
            info!("BLE GAP: advertising started");
        }
        esp_gap_ble_cb_event_t_ESP_GAP_BLE_UPDATE_CONN_PARAMS_EVT => {
            info!("BLE GAP: connection parameters updated");
        }
        _ => {}
    }
}

unsafe extern "C" fn gatts_event_handler(
    event: esp_gatts_cb_event_t,
    gatts_if: esp_gatt_if_t,
    param: *mut esp_ble_gatts_cb_param_t,
) {
    // SAFETY: Bluedroid passes a valid parameter union for `event` that
    // lives for the duration of the callback.
    unsafe { handle_gatts_event(event, gatts_if, &*param) }
}

unsafe fn handle_gatts_event(event: esp_gatts_cb_event_t, gatts_if: esp_gatt_if_t, param: &esp_ble_gatts_cb_param_t) {
    let Some(sinks) = SINKS.get() else {
        return;
    };

    match event {
        esp_gatts_cb_event_t_ESP_GATTS_REG_EVT => {
            GATTS_IF.store(gatts_if, Ordering::Relaxed);
            info!("BLE GATTS: app registered (if={})", gatts_if);
            let mut svc_id = esp_gatt_srvc_id_t {
                id: esp_gatt_id_t {
                    uuid: uuid128_to_esp(SERVICE_UUID),
                    inst_id: 0,
                },
                is_primary: true,
            };
            // SAFETY: svc_id is copied by the stack.
            let ret = unsafe { esp_ble_gatts_create_service(gatts_if, &mut svc_id, SERVICE_HANDLES) };
            if ret != ESP_OK {
                error!("BLE GATTS: create service failed ({})", ret);
            }
        }
        esp_gatts_cb_event_t_ESP_GATTS_CREATE_EVT => {
            // SAFETY: union member matching CREATE_EVT.
            let svc_handle = unsafe { param.create.service_handle };
            SVC_HANDLE.store(svc_handle, Ordering::Relaxed);
            CHAR_STEP.store(0, Ordering::Relaxed);
            info!("BLE GATTS: service created (handle={})", svc_handle);
            // SAFETY: registration chain, GATTS task.
            unsafe {
                esp_ble_gatts_start_service(svc_handle);
                add_char(svc_handle, &CHARS[0]);
            }
        }
        esp_gatts_cb_event_t_ESP_GATTS_ADD_CHAR_EVT => {
            // SAFETY: union member matching ADD_CHAR_EVT.
            let handle = unsafe { param.add_char.attr_handle };
            let step = usize::from(CHAR_STEP.load(Ordering::Relaxed));
            HANDLES[step].store(handle, Ordering::Release);
            info!("BLE GATTS: characteristic {} (handle={})", step, handle);
            // SAFETY: registration chain, GATTS task.
            unsafe {
                if CHARS[step].value.is_none() {
                    add_cccd(SVC_HANDLE.load(Ordering::Relaxed));
                } else {
                    next_char(step);
                }
            }
        }
        esp_gatts_cb_event_t_ESP_GATTS_ADD_CHAR_DESCR_EVT => {
            // SAFETY: registration chain, GATTS task.
            unsafe { next_char(usize::from(CHAR_STEP.load(Ordering::Relaxed))) };
        }
        esp_gatts_cb_event_t_ESP_GATTS_CONNECT_EVT => {
            // SAFETY: union member matching CONNECT_EVT.
            let p = unsafe { &param.connect };
            CONN_ID.store(p.conn_id, Ordering::Relaxed);
            let mut conn_params = esp_ble_conn_update_params_t {
                bda: p.remote_bda,
                min_int: 0x10,
                max_int: 0x20,
                latency: 0,
                timeout: 400,
            };
            // SAFETY: params are copied by the stack.
            let ret = unsafe { esp_ble_gap_update_conn_params(&mut conn_params) };
            if ret != ESP_OK {
                warn!("BLE GAP: connection parameter update failed ({})", ret);
            }
            sinks.link.on_connect();
        }
        esp_gatts_cb_event_t_ESP_GATTS_DISCONNECT_EVT => {
            sinks.link.on_disconnect();
            // SAFETY: Bluedroid task context.
            unsafe { start_advertising() };
        }
        esp_gatts_cb_event_t_ESP_GATTS_MTU_EVT => {
            // SAFETY: union member matching MTU_EVT.
            let mtu = unsafe { param.mtu.mtu };
            info!("BLE GATTS: MTU negotiated to {}", mtu);
        }
        esp_gatts_cb_event_t_ESP_GATTS_READ_EVT => {
            // SAFETY: union member matching READ_EVT.
            let p = unsafe { &param.read };
            if p.need_rsp {
                let mut rsp = esp_gatt_rsp_t {
                    attr_value: esp_gatt_value_t {
                        handle: p.handle,
                        // SAFETY: all-zero is an empty attribute value.
                        ..unsafe { core::mem::zeroed() }
                    },
                };
                // SAFETY: rsp is copied by the stack.
                unsafe {
                    esp_ble_gatts_send_response(gatts_if, p.conn_id, p.trans_id, esp_gatt_status_t_ESP_GATT_OK, &mut rsp);
                }
            }
        }
        esp_gatts_cb_event_t_ESP_GATTS_WRITE_EVT => {
            // SAFETY: union member matching WRITE_EVT.
            let p = unsafe { &param.write };
            if p.need_rsp {
                // SAFETY: write responses carry no body.
                unsafe {
                    esp_ble_gatts_send_response(
                        gatts_if,
                        p.conn_id,
                        p.trans_id,
                        esp_gatt_status_t_ESP_GATT_OK,
                        core::ptr::null_mut(),
                    );
                }
            }
            if p.is_prep {
                warn!("BLE GATTS: long write ignored (handle={})", p.handle);
                return;
            }
            // SAFETY: value/len describe the written bytes for this callback.
            let data = unsafe { core::slice::from_raw_parts(p.value, usize::from(p.len)) };
            if p.handle == HANDLES[COMMAND_IDX].load(Ordering::Acquire) {
                sinks.intake.on_command_written(data);
            } else if p.handle == HANDLES[DATA_IDX].load(Ordering::Acquire) {
                sinks.link.on_data_written(data);
            }
        }
        esp_gatts_cb_event_t_ESP_GATTS_CONF_EVT => {
            // SAFETY: union member matching CONF_EVT.
            let p = unsafe { &param.conf };
            if p.handle == HANDLES[DATA_IDX].load(Ordering::Acquire) {
                sinks.link.on_data_notified(p.status == esp_gatt_status_t_ESP_GATT_OK);
            } else if p.handle == HANDLES[COMMAND_IDX].load(Ordering::Acquire) {
                sinks.link.on_command_notified();
            }
        }
        _ => {}
    }
}
