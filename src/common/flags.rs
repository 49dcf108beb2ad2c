//! Sticky operator modes and latched status bits
//!
//! Each flag has a single conceptual writer: mode toggles come from the
//! command loop, `file_open` and the error latch come from the run loop
//! (the error latch is cleared by the command loop on the next command).
//! Relaxed ordering is enough; a missed update costs at most one loop
//! iteration.

use std::sync::atomic::{AtomicBool, Ordering};

/// Lock-free flag set shared between the command loop and the run loop.
#[derive(Debug, Default)]
pub struct ControlFlags {
    /// Record spills to disk during the current run.
    pub record_data: AtomicBool,
    /// Chunked broadcast ("shared-memory") mode instead of notifications.
    pub shm_mode: AtomicBool,
    /// Suppress per-spill console chatter.
    pub quiet: AtomicBool,
    /// Verbose drain/broadcast diagnostics and synthetic file writes.
    pub debug: AtomicBool,
    /// Boot without reprogramming every FPGA.
    pub boot_fast: AtomicBool,
    /// A run-scope fatal occurred; shown until the next operator command.
    pub had_error: AtomicBool,
    /// Supersedes everything; the run loop exits as soon as it can.
    pub kill_all: AtomicBool,
    /// An output file is currently open (owned by the run loop).
    pub file_open: AtomicBool,
}

impl ControlFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(flag: &AtomicBool) -> bool {
        flag.load(Ordering::Relaxed)
    }

    pub fn set(flag: &AtomicBool, value: bool) {
        flag.store(value, Ordering::Relaxed);
    }

    /// Flip a mode flag and return the new value.
    pub fn toggle(flag: &AtomicBool) -> bool {
        // Single-writer per flag, so load+store does not race.
        let new = !flag.load(Ordering::Relaxed);
        flag.store(new, Ordering::Relaxed);
        new
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggle_twice_restores_initial_state() {
        let flags = ControlFlags::new();
        assert!(!ControlFlags::get(&flags.shm_mode));
        assert!(ControlFlags::toggle(&flags.shm_mode));
        assert!(!ControlFlags::toggle(&flags.shm_mode));
        assert!(!ControlFlags::get(&flags.shm_mode));
    }

    #[test]
    fn flags_default_cleared() {
        let flags = ControlFlags::new();
        assert!(!ControlFlags::get(&flags.record_data));
        assert!(!ControlFlags::get(&flags.had_error));
        assert!(!ControlFlags::get(&flags.kill_all));
        assert!(!ControlFlags::get(&flags.file_open));
    }
}
