//! Threading bridge for Horizon UI facades.
//!
//! Application code written against a single-threaded UI API expects exactly
//! one UI thread that owns a cooperative loop (`read_and_dispatch`, `sleep`,
//! `wake`). Many native toolkits instead deliver events on their own
//! dedicated dispatch thread. This crate reconciles the two:
//!
//! - **Exclusive section**: a re-entrant lock plus monitor that lets the
//!   native thread run facade callbacks only while the owning thread has
//!   handed it a turn
//! - **Deferred calls**: `async_exec` and `sync_exec` from any thread, drained
//!   on the owning thread's behalf
//! - **Timers**: one-shot delayed runnables keyed by identity
//! - **Exception relay**: panics in callbacks run on the owner's behalf are
//!   re-raised on the owning thread as [`BridgeError::FailedExec`]
//! - **Display**: the per-thread facade root tying it all together
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use horizon_bridge::{Display, NativeDispatcher};
//!
//! let toolkit = Arc::new(NativeDispatcher::spawn()?);
//! let display = Display::new(toolkit)?;
//!
//! let (tx, rx) = crossbeam_channel::bounded(1);
//! {
//!     let display = display.clone();
//!     std::thread::spawn(move || {
//!         tx.send(display.sync_exec(|| 6 * 7)).unwrap();
//!         let _ = display.wake();
//!     });
//! }
//!
//! let answer = loop {
//!     if let Ok(result) = rx.try_recv() {
//!         break result?;
//!     }
//!     if !display.read_and_dispatch()? {
//!         display.sleep()?;
//!     }
//! };
//! assert_eq!(answer, 42);
//! display.dispose()?;
//! # Ok::<(), horizon_bridge::BridgeError>(())
//! ```

pub mod bridge;
pub mod display;
mod error;
pub mod event;
pub mod logging;
pub mod native;
mod registry;
pub mod relay;
pub mod section;
pub mod synchronizer;
pub mod thread_check;
pub mod timer;

pub use bridge::{EventLoopBridge, LoopMode};
pub use display::{Display, DisplayBuilder, DisplayConfig, ExceptionHandler};
pub use error::{BridgeError, CallbackPanic, Result};
pub use event::{Event, EventKind, ListenerId};
pub use logging::DisplayDebug;
pub use native::{
    DispatcherBuilder, DispatcherConfig, NativeDispatcher, NativeHandle, NativeTask, NativeToolkit,
};
pub use relay::{ExceptionRelay, RelayPolicy};
pub use section::{ExclusiveSection, SectionGuard};
pub use synchronizer::Synchronizer;
pub use thread_check::ThreadAffinity;
pub use timer::{Runnable, TimerId, TimerService};
