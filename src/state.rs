//! Process-wide activity flags shared between the UI and background loops.
//!
//! Uses atomics for lock-free access: the UI flips them, the waterfall and
//! maintenance loops only read them.

use std::sync::atomic::{AtomicBool, Ordering};

/// Shared state for communication between the UI and worker threads.
#[derive(Debug)]
pub struct SharedState {
    /// User has been idle long enough for idle-time work
    idle: AtomicBool,
    /// Higher-priority work (imports, big db jobs) is in flight
    busy: AtomicBool,
    /// Shutdown flag
    shutdown: AtomicBool,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            idle: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn set_idle(&self, idle: bool) {
        self.idle.store(idle, Ordering::SeqCst);
    }

    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::SeqCst)
    }

    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Check if shutdown was requested
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}
