//! Fuzz target: `validate_frame`
//!
//! Feeds arbitrary bytes through the command frame gate. It must never
//! panic, and whatever it accepts must re-encode to the same bytes.
//!
//! cargo fuzz run fuzz_frame_validator

#![no_main]

use std::sync::Arc;

use econbadge::adapters::storage::FatStorage;
use econbadge::config::{HEADER_SIZE, PAYLOAD_SIZE};
use econbadge::rpc::auth::{TokenStore, validate_frame};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let store = TokenStore::load(Arc::new(FatStorage::new()));
    match validate_frame(data, &store) {
        Ok(request) => {
            assert!(request.payload().len() <= PAYLOAD_SIZE);
            assert_eq!(data.len(), HEADER_SIZE + request.payload().len());
            assert_eq!(&request.encode()[..], data);
        }
        Err(response) => {
            assert!(!response.error().is_ok());
            assert!(response.payload().is_empty());
        }
    }
});
