//! Runtime symbols that `critical-section` and `embassy-time` expect the
//! platform to provide.

use core::cell::{Cell, RefCell};
use core::task::Waker;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use crate::drivers::timer_queue::TimerQueue;

static CRITICAL_SECTION_MUTEX: Mutex<()> = Mutex::new(());

static TIMER_QUEUE: TimerQueue = TimerQueue::new();
static TIMER_SERVICE: OnceLock<bool> = OnceLock::new();

thread_local! {
    static CRITICAL_SECTION_DEPTH: Cell<u8> = const { Cell::new(0) };
    static CRITICAL_SECTION_GUARD: RefCell<Option<MutexGuard<'static, ()>>> = const { RefCell::new(None) };
}

/// Re-entrant acquire: only the outermost call takes the mutex.
#[unsafe(no_mangle)]
pub extern "C" fn _critical_section_1_0_acquire() -> u8 {
    CRITICAL_SECTION_DEPTH.with(|depth| {
        let d = depth.get();
        if d == 0 {
            let lock = CRITICAL_SECTION_MUTEX
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            CRITICAL_SECTION_GUARD.with(|guard| *guard.borrow_mut() = Some(lock));
        }
        let new_depth = d.saturating_add(1);
        depth.set(new_depth);
        new_depth
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn _critical_section_1_0_release(_token: u8) {
    CRITICAL_SECTION_DEPTH.with(|depth| {
        let d = depth.get();
        if d == 0 {
            return;
        }
        depth.set(d - 1);
        if d == 1 {
            CRITICAL_SECTION_GUARD.with(|guard| *guard.borrow_mut() = None);
        }
    });
}

/// Monotonic microseconds since boot.
#[unsafe(no_mangle)]
pub fn _embassy_time_now() -> u64 {
    // SAFETY: esp_timer is started by the IDF before app_main.
    unsafe { esp_idf_sys::esp_timer_get_time() as u64 }
}

/// Wake `waker` at tick `at` from the shared timer service.
///
/// The service thread is started on first use. If it cannot be started the
/// waker fires at once: the timer re-checks its deadline when polled, so
/// waits still end on time, at the cost of polling.
#[unsafe(no_mangle)]
pub fn _embassy_time_schedule_wake(at: u64, waker: &Waker) {
    let running = *TIMER_SERVICE.get_or_init(|| match TIMER_QUEUE.spawn_service(_embassy_time_now) {
        Ok(()) => true,
        Err(e) => {
            log::error!("time: timer service not started: {}", e);
            false
        }
    });
    if running {
        TIMER_QUEUE.schedule(at, waker);
    } else {
        waker.wake_by_ref();
    }
}
