//! Firmware update sessions end to end: the central streams a signed
//! image over the data characteristic while the update task stages,
//! verifies and flashes it.

use std::sync::Arc;

use econbadge::adapters::flash::{FlashFault, MemoryFlash};
use econbadge::adapters::storage::FatStorage;
use econbadge::app::ports::StoragePort;
use econbadge::config::{BLE_MTU, UPDATE_FILE_PATH, UpdaterConfig};
use econbadge::error::ErrorCode;
use econbadge::rpc::codec::CommandType;
use econbadge::rpc::ota::{UpdateHeader, UpdateState};

use crate::mock_hw::{Badge, ShortStorage, fast_updater_config, image, signed_header, update_request};

use ErrorCode::{ActionFailed, CorruptedData, InvalidParam, NoError, TransRecvFailed, WriteFileFailed};

/// Play the central's side of a session and wait for the update task.
/// Data is only streamed once the header has been accepted.
fn deliver(badge: &Badge, image: &[u8], header: &UpdateHeader) -> Vec<ErrorCode> {
    let session = badge.updater.request_update(update_request(1)).unwrap();
    badge.radio.wait_for_responses(1);
    badge.write_data(&header.encode());

    let after_header = badge.radio.wait_for_responses(2);
    if after_header.get(1).map(|r| r.error()) == Some(NoError) {
        for chunk in image.chunks(BLE_MTU) {
            if badge.radio.responses().len() > 2 {
                break;
            }
            badge.link.on_data_written(chunk);
        }
    }
    session.join().unwrap();
    badge.radio.codes()
}

#[test]
fn signed_image_is_flashed_and_badge_reboots() {
    let badge = Badge::new();
    let firmware = image(40_000);
    let header = signed_header(&firmware);

    let session = badge.updater.request_update(update_request(7)).unwrap();
    assert_eq!(badge.radio.wait_for_responses(1)[0].error(), NoError);
    badge.write_data(&header.encode());
    assert_eq!(badge.radio.wait_for_responses(2)[1].error(), NoError);

    let mut progress = vec![badge.updater.progress()];
    for chunk in firmware.chunks(BLE_MTU) {
        badge.link.on_data_written(chunk);
        progress.push(badge.updater.progress());
    }
    session.join().unwrap();
    progress.push(badge.updater.progress());

    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {progress:?}");
    assert_eq!(badge.updater.progress(), 100);
    assert_eq!(badge.updater.state(), UpdateState::Idle);

    let responses = badge.radio.responses();
    assert_eq!(badge.radio.codes(), vec![NoError, NoError, NoError]);
    assert!(responses.iter().all(|r| r.header.identifier == 7));

    let flash = badge.flash.record();
    assert_eq!(flash.image, firmware);
    assert!(flash.ended);
    assert!(flash.rebooted);
    assert!(!badge.storage.exists(UPDATE_FILE_PATH));
}

#[test]
fn update_started_through_the_command_channel() {
    let mut badge = Badge::new();
    let firmware = image(1_000);
    let header = signed_header(&firmware);

    badge.send(3, CommandType::FirmwareUpdate, b"");
    badge.tick();
    assert_eq!(badge.radio.wait_for_responses(1)[0].error(), NoError);
    badge.write_data(&header.encode());
    assert_eq!(badge.radio.wait_for_responses(2)[1].error(), NoError);
    badge.write_data(&firmware);

    badge.radio.wait_for_responses(3);
    badge.wait_until_settled();
    assert_eq!(badge.radio.codes(), vec![NoError, NoError, NoError]);
    assert!(badge.flash.record().rebooted);
}

#[test]
fn flipped_bit_is_caught_before_flashing() {
    let badge = Badge::new();
    let mut firmware = image(20_000);
    let header = signed_header(&firmware);
    firmware[12_345] ^= 0x01;

    assert_eq!(deliver(&badge, &firmware, &header), vec![NoError, NoError, CorruptedData]);
    assert_eq!(badge.updater.state(), UpdateState::Aborted(CorruptedData));
    assert!(!badge.storage.exists(UPDATE_FILE_PATH));
    let flash = badge.flash.record();
    assert_eq!(flash.sessions, 0);
    assert!(!flash.rebooted);
}

#[test]
fn forged_signature_is_rejected() {
    let badge = Badge::new();
    let firmware = image(5_000);
    let mut header = signed_header(&firmware);
    header.signature[10] ^= 0x80;

    assert_eq!(deliver(&badge, &firmware, &header), vec![NoError, NoError, CorruptedData]);
    assert_eq!(badge.flash.record().sessions, 0);
}

#[test]
fn unusable_public_key_fails_the_action() {
    let badge = Badge::build(
        Arc::new(FatStorage::new()),
        MemoryFlash::new(),
        fast_updater_config(),
        "not a key",
    );
    let firmware = image(2_000);
    let header = signed_header(&firmware);

    assert_eq!(deliver(&badge, &firmware, &header), vec![NoError, NoError, ActionFailed]);
    assert_eq!(badge.flash.record().sessions, 0);
}

#[test]
fn other_hardware_revision_is_refused_before_any_data() {
    let badge = Badge::new();
    let firmware = image(2_000);
    let signed = signed_header(&firmware);
    let header = UpdateHeader::new(signed.size, signed.checksum, &signed.signature, "HW R.2A");

    assert_eq!(deliver(&badge, &firmware, &header), vec![NoError, InvalidParam]);
    assert_eq!(badge.updater.state(), UpdateState::Aborted(InvalidParam));
    assert!(!badge.storage.exists(UPDATE_FILE_PATH));
}

#[test]
fn bad_magic_and_empty_image_are_invalid() {
    let badge = Badge::new();
    let firmware = image(100);
    let mut header = signed_header(&firmware);
    header.magic = 0xDEAD_BEEF;
    assert_eq!(deliver(&badge, &firmware, &header), vec![NoError, InvalidParam]);

    let badge = Badge::new();
    let mut header = signed_header(&firmware);
    header.size = 0;
    assert_eq!(deliver(&badge, &[], &header), vec![NoError, InvalidParam]);
}

#[test]
fn missing_header_is_an_invalid_request() {
    let config = UpdaterConfig {
        request_timeout_ms: 50,
        ..fast_updater_config()
    };
    let badge = Badge::build(
        Arc::new(FatStorage::new()),
        MemoryFlash::new(),
        config,
        crate::mock_hw::TEST_PUBLIC_PEM,
    );
    let session = badge.updater.request_update(update_request(1)).unwrap();
    session.join().unwrap();

    assert_eq!(badge.radio.codes(), vec![NoError, InvalidParam]);
    assert_eq!(badge.updater.state(), UpdateState::Aborted(InvalidParam));
}

#[test]
fn stream_cut_short_times_out_and_discards_the_stage() {
    let config = UpdaterConfig {
        request_timeout_ms: 100,
        ..fast_updater_config()
    };
    let badge = Badge::build(
        Arc::new(FatStorage::new()),
        MemoryFlash::new(),
        config,
        crate::mock_hw::TEST_PUBLIC_PEM,
    );
    let firmware = image(30_000);
    let header = signed_header(&firmware);

    assert_eq!(
        deliver(&badge, &firmware[..20_000], &header),
        vec![NoError, NoError, TransRecvFailed]
    );
    assert!(!badge.storage.exists(UPDATE_FILE_PATH));
    assert_eq!(badge.flash.record().sessions, 0);
}

#[test]
fn staging_write_failure_is_reported() {
    let badge = Badge::with(Arc::new(ShortStorage::new(1_000)), MemoryFlash::new());
    let firmware = image(20_000);
    let header = signed_header(&firmware);

    assert_eq!(deliver(&badge, &firmware, &header), vec![NoError, NoError, WriteFileFailed]);
    assert_eq!(badge.updater.state(), UpdateState::Aborted(WriteFileFailed));
    assert!(!badge.storage.exists(UPDATE_FILE_PATH));
}

#[test]
fn flash_faults_map_to_error_codes() {
    let cases = [
        (FlashFault::Begin, ActionFailed),
        (FlashFault::ShortWrite, CorruptedData),
        (FlashFault::End, ActionFailed),
    ];
    for (fault, expected) in cases {
        let badge = Badge::with(Arc::new(FatStorage::new()), MemoryFlash::with_fault(fault));
        let firmware = image(3_000);
        let header = signed_header(&firmware);

        assert_eq!(
            deliver(&badge, &firmware, &header),
            vec![NoError, NoError, expected],
            "fault {fault:?}"
        );
        let flash = badge.flash.record();
        assert!(!flash.rebooted, "fault {fault:?}");
        assert!(!badge.storage.exists(UPDATE_FILE_PATH), "fault {fault:?}");
        if fault == FlashFault::ShortWrite {
            assert!(flash.aborted);
        }
    }
}

#[test]
fn second_request_while_busy_is_refused_and_aborted_session_can_retry() {
    let badge = Badge::new();
    let firmware = image(1_500);
    let mut header = signed_header(&firmware);
    header.magic = 0;

    let first = badge.updater.request_update(update_request(1)).unwrap();
    badge.radio.wait_for_responses(1);
    assert_eq!(badge.updater.request_update(update_request(2)).err(), Some(ActionFailed));

    badge.write_data(&header.encode());
    first.join().unwrap();
    assert_eq!(badge.updater.state(), UpdateState::Aborted(InvalidParam));

    let header = signed_header(&firmware);
    let retry = badge.updater.request_update(update_request(3)).unwrap();
    badge.radio.wait_for_responses(3);
    badge.write_data(&header.encode());
    assert_eq!(badge.radio.wait_for_responses(4)[3].error(), NoError);
    badge.write_data(&firmware);
    retry.join().unwrap();

    assert_eq!(badge.radio.codes(), vec![NoError, InvalidParam, NoError, NoError, NoError]);
    assert_eq!(badge.updater.state(), UpdateState::Idle);
    assert_eq!(badge.flash.record().image, firmware);
}
