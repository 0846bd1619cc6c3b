//! Fuzz target: `UpdateHeader::decode` / `validate`
//!
//! Any 312 bytes decode into a header; validation either passes or names
//! INVALID_PARAM, and decoding is stable under re-encoding.
//!
//! cargo fuzz run fuzz_update_header

#![no_main]

use econbadge::config::HW_REVISION;
use econbadge::error::ErrorCode;
use econbadge::rpc::ota::{UPDATE_HEADER_SIZE, UpdateHeader};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = <[u8; UPDATE_HEADER_SIZE]>::try_from(data) else {
        return;
    };
    let header = UpdateHeader::decode(&raw);
    assert_eq!(header.encode(), raw);
    match header.validate(HW_REVISION) {
        Ok(()) => assert!(header.size > 0),
        Err(code) => assert_eq!(code, ErrorCode::InvalidParam),
    }
});
