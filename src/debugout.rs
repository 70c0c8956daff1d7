//! Process-wide switchable verbose printer.
//!
//! Per-packet diagnostics are too noisy for the structured log; they go
//! through this sink instead and are dropped unless verbose output was
//! requested at startup.

use std::sync::atomic::{AtomicBool, Ordering};

static VERBOSE: AtomicBool = AtomicBool::new(false);

/// Switch verbose output on or off. Called once at startup.
pub fn set_verbose(enabled: bool) {
    VERBOSE.store(enabled, Ordering::Relaxed);
}

pub fn verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

/// Print a formatted line to standard output when verbose output is
/// enabled. Safe to call from any task.
#[macro_export]
macro_rules! debugout {
    ($($arg:tt)*) => {
        if $crate::debugout::verbose() {
            println!($($arg)*);
        }
    };
}
