//! Logging and debugging facilities for Horizon Bridge.
//!
//! Horizon Bridge uses the `tracing` crate for instrumentation and never
//! installs a subscriber itself. To see logs, install one in your
//! application:
//!
//! ```ignore
//! fn main() {
//!     tracing_subscriber::fmt()
//!         .with_max_level(tracing::Level::TRACE)
//!         .init();
//!
//!     // Your application code...
//! }
//! ```
//!
//! Use [`Display::debug_snapshot`](crate::Display::debug_snapshot) to capture
//! a display's internal state as a [`DisplayDebug`].

use std::fmt;
use std::thread::ThreadId;

use crate::bridge::LoopMode;

/// Target names for log filtering.
///
/// Use these with `tracing` directives to filter logs by subsystem.
pub mod targets {
    /// Crate-wide target.
    pub const BRIDGE: &str = "horizon_bridge";
    /// Loop cycles, mode selection, and trampolines.
    pub const EVENT_LOOP: &str = "horizon_bridge::event_loop";
    /// Exclusive section handoffs.
    pub const SECTION: &str = "horizon_bridge::section";
    /// Deferred call queue.
    pub const SYNC: &str = "horizon_bridge::sync";
    /// Relayed callback failures.
    pub const RELAY: &str = "horizon_bridge::relay";
    /// Timer scheduling and expiry.
    pub const TIMER: &str = "horizon_bridge::timer";
    /// The in-process native dispatcher.
    pub const NATIVE: &str = "horizon_bridge::native";
    /// Display lifecycle.
    pub const DISPLAY: &str = "horizon_bridge::display";
}

/// A point-in-time view of a display's internals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayDebug {
    /// Display name.
    pub name: String,
    /// Loop mode.
    pub mode: LoopMode,
    /// Owning thread.
    pub owner: ThreadId,
    /// Whether the display has been disposed.
    pub disposed: bool,
    /// Thread currently inside the exclusive section.
    pub section_holder: Option<ThreadId>,
    /// Actors blocked entering the section.
    pub section_waiting: usize,
    /// Queued deferred calls.
    pub pending_calls: usize,
    /// Relayed failures not yet re-raised.
    pub pending_failures: usize,
    /// Scheduled timers.
    pub active_timers: usize,
    /// Posted events awaiting delivery.
    pub deferred_events: usize,
    /// Registered display listeners.
    pub listeners: usize,
}

impl fmt::Display for DisplayDebug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Display '{}' ({:?} mode, owner {:?}){}",
            self.name,
            self.mode,
            self.owner,
            if self.disposed { " [disposed]" } else { "" }
        )?;
        match self.section_holder {
            Some(holder) => writeln!(
                f,
                "  section: held by {holder:?}, {} waiting",
                self.section_waiting
            )?,
            None => writeln!(f, "  section: free, {} waiting", self.section_waiting)?,
        }
        writeln!(f, "  deferred calls: {}", self.pending_calls)?;
        writeln!(f, "  posted events: {}", self.deferred_events)?;
        writeln!(f, "  pending failures: {}", self.pending_failures)?;
        writeln!(f, "  timers: {}", self.active_timers)?;
        write!(f, "  listeners: {}", self.listeners)
    }
}
