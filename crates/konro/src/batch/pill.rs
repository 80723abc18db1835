//! Worker panic propagation.

use std::thread;

/// A poison pill moved into the worker task.
///
/// If the worker panics, the pill is dropped during unwinding and re-raises,
/// so the failure surfaces instead of leaving committed futures parked
/// forever behind a dead consumer.
pub struct Pill {}

impl Pill {
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for Pill {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Pill {
    fn drop(&mut self) {
        if thread::panicking() {
            panic!("batch worker panicked - propagating to owner");
        }
    }
}
