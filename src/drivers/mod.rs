//! Task placement and timer service helpers.

pub mod task_pin;
pub mod timer_queue;
