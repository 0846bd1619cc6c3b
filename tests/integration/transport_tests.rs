//! Data characteristic flow control between the badge and the central.

use std::thread;
use std::time::{Duration, Instant};

use econbadge::config::{BLE_MTU, DATA_END_MARKER, LinkConfig};
use econbadge::error::ErrorCode;
use econbadge::rpc::ota::UpdateState;
use econbadge::rpc::transport::{Link, TransportError};

use crate::mock_hw::{Badge, connected_link, fast_link_config, image, signed_header, update_request};

#[test]
fn outbound_payload_is_split_at_the_mtu() {
    let (radio, link) = connected_link(fast_link_config());
    let payload: Vec<u8> = (0..3 * BLE_MTU + 7).map(|i| i as u8).collect();
    assert_eq!(link.send(&payload), Ok(payload.len()));
    assert_eq!(radio.data(), payload);

    link.send_data_end().unwrap();
    assert!(radio.data().ends_with(&DATA_END_MARKER));
}

#[test]
fn chunk_that_keeps_failing_gives_up() {
    let (radio, link) = connected_link(fast_link_config());
    radio.fail_data(true);
    assert_eq!(link.send(&[1u8; 10]), Err(TransportError::SendFailed));

    radio.fail_data(false);
    assert_eq!(link.send(&[2u8; 10]), Ok(10));
    assert_eq!(radio.data(), vec![2u8; 10]);
}

#[test]
fn inbound_writes_are_reassembled_across_chunks() {
    let (_, link) = connected_link(fast_link_config());
    let payload: Vec<u8> = (0..2 * BLE_MTU + 11).map(|i| (i * 7) as u8).collect();

    let writer = {
        let link = link.clone();
        let payload = payload.clone();
        thread::spawn(move || {
            for chunk in payload.chunks(BLE_MTU) {
                link.on_data_written(chunk);
            }
        })
    };

    let mut received = vec![0u8; payload.len()];
    let n = link.receive(&mut received, Some(Duration::from_secs(2))).unwrap();
    writer.join().unwrap();
    assert_eq!(n, payload.len());
    assert_eq!(received, payload);
}

#[test]
fn receive_across_a_small_buffer_keeps_the_remainder() {
    let (_, link) = connected_link(fast_link_config());
    link.on_data_written(b"abcdef");

    let mut head = [0u8; 4];
    let mut tail = [0u8; 2];
    link.receive(&mut head, Some(Duration::from_millis(200))).unwrap();
    link.receive(&mut tail, Some(Duration::from_millis(200))).unwrap();
    assert_eq!(&head, b"abcd");
    assert_eq!(&tail, b"ef");
}

#[test]
fn disconnect_during_update_aborts_the_session() {
    let badge = Badge::new();
    let firmware = image(20_000);
    let session = badge.updater.request_update(update_request(1)).unwrap();
    badge.radio.wait_for_responses(1);
    badge.write_data(&signed_header(&firmware).encode());
    badge.radio.wait_for_responses(2);
    badge.link.on_data_written(&firmware[..BLE_MTU]);

    badge.link.on_disconnect();
    session.join().unwrap();

    assert_eq!(badge.updater.state(), UpdateState::Aborted(ErrorCode::TransRecvFailed));
    // The failure response had no central to go to.
    assert_eq!(badge.radio.codes(), vec![ErrorCode::NoError, ErrorCode::NoError]);
    assert!(!badge.link.is_connected());
}

#[test]
fn discarded_inbound_writes_return_immediately() {
    let (_, link) = connected_link(LinkConfig::default());
    link.discard_inbound();

    let started = Instant::now();
    for _ in 0..3 {
        link.on_data_written(&[0u8; BLE_MTU]);
    }
    assert!(started.elapsed() < Duration::from_secs(1), "BLE callback blocked {:?}", started.elapsed());

    let mut buf = [0u8; 1];
    assert_eq!(
        link.receive(&mut buf, Some(Duration::from_millis(20))),
        Err(TransportError::Timeout)
    );
}

#[test]
fn central_streaming_after_an_abort_does_not_stall_the_callback() {
    let badge = Badge::new();
    let firmware = image(4 * BLE_MTU);
    let mut header = signed_header(&firmware);
    header.magic = 0;

    let session = badge.updater.request_update(update_request(1)).unwrap();
    badge.radio.wait_for_responses(1);
    badge.write_data(&header.encode());
    session.join().unwrap();
    assert_eq!(badge.updater.state(), UpdateState::Aborted(ErrorCode::InvalidParam));

    // The central has not seen the rejection yet and keeps streaming.
    let started = Instant::now();
    badge.write_data(&firmware);
    let elapsed = started.elapsed();
    assert!(
        elapsed < Duration::from_millis(250),
        "slot wait is {}ms, callback blocked {:?}",
        badge.link.config().inbound_slot_wait_ms,
        elapsed
    );
}
