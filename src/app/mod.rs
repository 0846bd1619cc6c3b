//! Application core: badge profile data and the port traits the rest of
//! the firmware talks to hardware through.
//!
//! Everything here is testable on the host; storage and flash access
//! goes through the traits in [`ports`].

pub mod ports;
pub mod profile;
