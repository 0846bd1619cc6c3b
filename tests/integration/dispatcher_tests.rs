//! Command path: frame gate, queue and handler table, driven through the
//! intake the way the BLE glue feeds it.

use std::time::Instant;

use econbadge::app::ports::StoragePort;
use econbadge::config::{
    COMMAND_QUEUE_DEPTH, DEFAULT_CONTACT, DEFAULT_OWNER, DEFAULT_TOKEN, HEADER_SIZE, TOKEN_FILE_PATH,
};
use econbadge::error::ErrorCode;
use econbadge::rpc::codec::{CommandRequest, CommandType, Token};

use crate::mock_hw::Badge;

const NEW_TOKEN: &[u8; 16] = b"ABCDEFGHIJKLMNOP";

#[test]
fn ping_echoes_payload_and_identifier() {
    let mut badge = Badge::new();
    let response = badge.call(42, CommandType::Ping, b"hello");
    assert_eq!(response.error(), ErrorCode::NoError);
    assert_eq!(response.header.identifier, 42);
    assert_eq!(response.header.token, Token(*DEFAULT_TOKEN));
    assert_eq!(response.payload(), b"hello");
}

#[test]
fn wrong_token_is_answered_without_queueing() {
    let badge = Badge::new();
    badge.send_with_token(5, Token([b'x'; 16]), CommandType::Ping, b"");

    let responses = badge.radio.responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].error(), ErrorCode::InvalidToken);
    assert_eq!(responses[0].header.identifier, 5);
    assert_eq!(responses[0].header.token, Token([b'x'; 16]));
    assert!(badge.queue.is_empty());
}

#[test]
fn bad_token_burst_never_waits_on_a_pending_notification() {
    let mut badge = Badge::new();
    badge.radio.hold_command_completions(true);
    let intruder = Token([b'x'; 16]);

    let started = Instant::now();
    for id in 0..=COMMAND_QUEUE_DEPTH as u32 {
        badge.send_with_token(id, intruder, CommandType::Ping, b"");
    }
    let elapsed = started.elapsed();
    assert!(
        elapsed < badge.link.config().response_lock_wait(),
        "BLE callback blocked {:?}",
        elapsed
    );
    // Only the first rejection went out; the rest wait for the main loop.
    assert_eq!(badge.radio.responses().len(), 1);
    assert!(badge.queue.is_empty());

    badge.radio.hold_command_completions(false);
    badge.link.on_command_notified();
    assert_eq!(badge.tick(), 0);

    let responses = badge.radio.wait_for_responses(COMMAND_QUEUE_DEPTH + 1);
    let ids: Vec<u32> = responses.iter().map(|r| r.header.identifier).collect();
    assert_eq!(ids, (0..=COMMAND_QUEUE_DEPTH as u32).collect::<Vec<_>>());
    assert!(responses.iter().all(|r| r.error() == ErrorCode::InvalidToken));
}

#[test]
fn size_field_over_payload_capacity_is_rejected() {
    let badge = Badge::new();
    let mut frame = CommandRequest::new(8, Token(*DEFAULT_TOKEN), CommandType::Ping.as_u8(), &[])
        .unwrap()
        .encode()
        .to_vec();
    frame[HEADER_SIZE - 1] = 65;
    frame.extend_from_slice(&[0u8; 65]);

    badge.intake.on_command_written(&frame);
    assert_eq!(badge.radio.codes(), vec![ErrorCode::InvalidCommandSize]);
    assert!(badge.queue.is_empty());
}

#[test]
fn length_disagreeing_with_size_is_rejected() {
    let badge = Badge::new();
    let mut frame = CommandRequest::new(8, Token(*DEFAULT_TOKEN), CommandType::Ping.as_u8(), b"abc")
        .unwrap()
        .encode()
        .to_vec();
    frame.pop();

    badge.intake.on_command_written(&frame);
    assert_eq!(badge.radio.codes(), vec![ErrorCode::InvalidCommandSize]);
}

#[test]
fn short_frame_is_an_invalid_request() {
    let badge = Badge::new();
    badge.intake.on_command_written(&[1, 2, 3]);
    let responses = badge.radio.responses();
    assert_eq!(responses[0].error(), ErrorCode::InvalidCommandReq);
    assert_eq!(responses[0].header.identifier, 0);
}

#[test]
fn unknown_command_code_is_an_invalid_request() {
    let mut badge = Badge::new();
    let frame = CommandRequest::new(3, Token(*DEFAULT_TOKEN), 200, &[]).unwrap().encode();
    badge.intake.on_command_written(&frame);
    assert!(badge.radio.responses().is_empty());

    badge.tick();
    let responses = badge.radio.wait_for_responses(1);
    assert_eq!(responses[0].error(), ErrorCode::InvalidCommandReq);
    assert_eq!(responses[0].header.identifier, 3);
}

#[test]
fn token_rotation_takes_effect_and_persists() {
    let mut badge = Badge::new();
    let response = badge.call(1, CommandType::SetBtToken, NEW_TOKEN);
    assert_eq!(response.error(), ErrorCode::NoError);
    assert_eq!(badge.storage.read(TOKEN_FILE_PATH).unwrap(), NEW_TOKEN);

    badge.send(2, CommandType::Ping, b"");
    assert_eq!(badge.radio.codes().last(), Some(&ErrorCode::InvalidToken));

    badge.send_with_token(3, Token(*NEW_TOKEN), CommandType::Ping, b"ok");
    badge.tick();
    let responses = badge.radio.wait_for_responses(3);
    assert_eq!(responses[2].error(), ErrorCode::NoError);
    assert_eq!(responses[2].payload(), b"ok");
}

#[test]
fn token_of_wrong_length_keeps_the_old_one() {
    let mut badge = Badge::new();
    let response = badge.call(1, CommandType::SetBtToken, b"short");
    assert_eq!(response.error(), ErrorCode::InvalidParam);
    assert_eq!(badge.tokens.current(), Token(*DEFAULT_TOKEN));
}

#[test]
fn owner_and_contact_have_defaults_and_can_be_set() {
    let mut badge = Badge::new();
    assert_eq!(badge.call(1, CommandType::GetOwner, b"").payload(), DEFAULT_OWNER.as_bytes());
    assert_eq!(badge.call(2, CommandType::GetContact, b"").payload(), DEFAULT_CONTACT.as_bytes());

    assert_eq!(badge.call(3, CommandType::SetOwner, b"Ada").error(), ErrorCode::NoError);
    assert_eq!(badge.call(4, CommandType::SetContact, b"ada@example.org").error(), ErrorCode::NoError);
    assert_eq!(badge.call(5, CommandType::GetOwner, b"").payload(), b"Ada");
    assert_eq!(badge.call(6, CommandType::GetContact, b"").payload(), b"ada@example.org");

    assert_eq!(badge.call(7, CommandType::SetOwner, b"").error(), ErrorCode::InvalidParam);
}

#[test]
fn factory_reset_restores_defaults() {
    let mut badge = Badge::new();
    badge.call(1, CommandType::SetOwner, b"Ada");
    badge.call(2, CommandType::SetBtToken, NEW_TOKEN);

    badge.send_with_token(3, Token(*NEW_TOKEN), CommandType::FactoryReset, b"");
    badge.tick();
    assert_eq!(badge.radio.wait_for_responses(3)[2].error(), ErrorCode::NoError);
    assert_eq!(badge.tokens.current(), Token(*DEFAULT_TOKEN));
    assert!(!badge.storage.exists(TOKEN_FILE_PATH));

    assert_eq!(badge.call(4, CommandType::GetOwner, b"").payload(), DEFAULT_OWNER.as_bytes());
}

#[test]
fn full_queue_answers_max_command_reached_and_keeps_order() {
    let mut badge = Badge::new();
    for id in 1..=COMMAND_QUEUE_DEPTH as u32 {
        badge.send(id, CommandType::Ping, &id.to_le_bytes());
    }
    assert!(badge.radio.responses().is_empty());

    badge.send(99, CommandType::Ping, b"");
    let rejected = badge.radio.responses();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].error(), ErrorCode::MaxCommandReached);
    assert_eq!(rejected[0].header.identifier, 99);

    assert_eq!(badge.tick(), COMMAND_QUEUE_DEPTH);
    let ids: Vec<u32> = badge.radio.wait_for_responses(COMMAND_QUEUE_DEPTH + 1)[1..]
        .iter()
        .map(|r| r.header.identifier)
        .collect();
    assert_eq!(ids, (1..=COMMAND_QUEUE_DEPTH as u32).collect::<Vec<_>>());
}

#[test]
fn peripheral_commands_are_forwarded() {
    let mut badge = Badge::new();
    let response = badge.call(1, CommandType::LedBorderSetBrightness, &[128]);
    assert_eq!(response.error(), ErrorCode::NoError);
    assert_eq!(response.payload(), &[128]);
    assert_eq!(
        *badge.peripherals.seen.lock().unwrap(),
        vec![CommandType::LedBorderSetBrightness]
    );
}

#[test]
fn local_commands_run_silently() {
    let mut badge = Badge::new();
    badge.intake.enqueue_local(CommandType::SetOwner, b"Grace").unwrap();
    assert_eq!(badge.tick(), 1);
    assert!(badge.radio.responses().is_empty());
    assert_eq!(badge.call(2, CommandType::GetOwner, b"").payload(), b"Grace");
}

#[test]
fn update_request_while_busy_is_refused() {
    let mut badge = Badge::new();
    badge.send(1, CommandType::FirmwareUpdate, b"");
    badge.tick();
    assert_eq!(badge.radio.wait_for_responses(1)[0].error(), ErrorCode::NoError);

    let refused = badge.call(2, CommandType::FirmwareUpdate, b"");
    assert_eq!(refused.header.identifier, 2);
    assert_eq!(refused.error(), ErrorCode::ActionFailed);

    // The first session gives up waiting for its header.
    let responses = badge.radio.wait_for_responses(3);
    assert_eq!(responses[2].header.identifier, 1);
    assert_eq!(responses[2].error(), ErrorCode::InvalidParam);
}
