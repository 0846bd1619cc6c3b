//! Deadline queue behind the async timer driver.
//!
//! Every timed semaphore wait registers `(deadline, waker)` here. One
//! long-lived service thread sleeps until the earliest deadline, wakes
//! everything due and goes back to sleep:
//!
//! ```text
//!  waiting tasks               TimerQueue                service thread
//!  ─────────────   schedule  ┌─────────────┐  wait_timeout  ───────────
//!  with_timeout ───────────▶ │ (at, waker) │ ◀──────────── run(now)
//!                  notify    │     ...     │  wake due
//!                            └─────────────┘
//! ```
//!
//! A waker that is already queued is updated in place, so the queue holds
//! at most one entry per waiting task, however many waits it performs.

use core::task::Waker;
use core::time::Duration;
use std::io;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

struct Entry {
    at: u64,
    waker: Waker,
}

pub struct TimerQueue {
    entries: Mutex<Vec<Entry>>,
    changed: Condvar,
}

impl TimerQueue {
    pub const fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wake `waker` once the clock reaches `at` (microseconds).
    pub fn schedule(&self, at: u64, waker: &Waker) {
        let mut entries = self.lock();
        match entries.iter_mut().find(|e| e.waker.will_wake(waker)) {
            Some(entry) => entry.at = entry.at.min(at),
            None => entries.push(Entry {
                at,
                waker: waker.clone(),
            }),
        }
        drop(entries);
        self.changed.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Wake every entry due at `now`. Returns the earliest deadline left.
    pub fn wake_due(&self, now: u64) -> Option<u64> {
        let (due, next) = take_due(&mut self.lock(), now);
        due.into_iter().for_each(Waker::wake);
        next
    }

    /// Service loop over the monotonic clock `now` (microseconds).
    pub fn run(&self, now: fn() -> u64) -> ! {
        loop {
            let mut entries = self.lock();
            let t = now();
            let (due, next) = take_due(&mut entries, t);
            if !due.is_empty() {
                drop(entries);
                due.into_iter().for_each(Waker::wake);
                continue;
            }
            // Wakes on the earliest deadline or on any new registration.
            match next {
                None => drop(self.changed.wait(entries).unwrap_or_else(PoisonError::into_inner)),
                Some(at) => drop(
                    self.changed
                        .wait_timeout(entries, Duration::from_micros(at.saturating_sub(t)))
                        .unwrap_or_else(PoisonError::into_inner),
                ),
            }
        }
    }

    /// Start the service thread for this queue.
    pub fn spawn_service(&'static self, now: fn() -> u64) -> io::Result<()> {
        std::thread::Builder::new()
            .name("timer-queue".into())
            .stack_size(4096)
            .spawn(move || self.run(now))
            .map(drop)
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn take_due(entries: &mut Vec<Entry>, now: u64) -> (Vec<Waker>, Option<u64>) {
    let mut due = Vec::new();
    let mut next: Option<u64> = None;
    let mut i = 0;
    while i < entries.len() {
        if entries[i].at <= now {
            due.push(entries.swap_remove(i).waker);
        } else {
            next = Some(next.map_or(entries[i].at, |n| n.min(entries[i].at)));
            i += 1;
        }
    }
    (due, next)
}
