//! Error types for Horizon Bridge.

use std::any::Any;
use std::fmt;
use std::thread::ThreadId;

use thiserror::Error;

/// The main error type for Horizon Bridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The caller is neither the owning thread nor the current section holder.
    #[error("invalid thread access: the display belongs to another thread")]
    ThreadInvalidAccess,

    /// The display has been disposed.
    #[error("display has been disposed")]
    DeviceDisposed,

    /// The native handle behind a widget is no longer alive.
    #[error("widget has been disposed")]
    WidgetDisposed,

    /// A live display already exists for the thread.
    #[error("a display already exists for thread {0:?}")]
    DisplayExists(ThreadId),

    /// An argument was outside its accepted range.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The native toolkit no longer accepts work.
    #[error("native toolkit is no longer accepting work")]
    ToolkitUnavailable,

    /// A helper thread could not be started.
    #[error("failed to spawn thread '{name}': {source}")]
    ThreadSpawn {
        /// Requested thread name.
        name: String,
        /// The underlying spawn failure.
        #[source]
        source: std::io::Error,
    },

    /// A callback run on the display's behalf panicked.
    #[error("failed to execute callback: {0}")]
    FailedExec(#[from] CallbackPanic),
}

impl BridgeError {
    /// Returns the relayed panic if this is a `FailedExec` error.
    pub fn as_panic(&self) -> Option<&CallbackPanic> {
        match self {
            Self::FailedExec(panic) => Some(panic),
            _ => None,
        }
    }
}

/// A panic captured while running a callback, ready to be re-raised elsewhere.
///
/// The message is extracted eagerly so the failure can be logged and compared
/// without touching the payload; the payload itself is kept so the receiving
/// thread can resume the original unwind with [`CallbackPanic::resume`].
#[derive(Error)]
#[error("callback panicked on thread '{thread}': {message}")]
pub struct CallbackPanic {
    thread: String,
    message: String,
    payload: Box<dyn Any + Send + 'static>,
}

impl CallbackPanic {
    /// Wrap a payload returned by `std::panic::catch_unwind`.
    ///
    /// Must be called on the thread that caught the panic so the thread name
    /// recorded here is the one the callback ran on.
    pub fn from_payload(payload: Box<dyn Any + Send + 'static>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "<non-string panic payload>".to_string()
        };

        Self {
            thread: crate::thread_check::current_thread_label(),
            message,
            payload,
        }
    }

    /// The panic message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Name of the thread the callback ran on.
    pub fn thread_name(&self) -> &str {
        &self.thread
    }

    /// Consume the failure and return the raw panic payload.
    pub fn into_payload(self) -> Box<dyn Any + Send + 'static> {
        self.payload
    }

    /// Resume unwinding with the original payload on the current thread.
    pub fn resume(self) -> ! {
        std::panic::resume_unwind(self.payload)
    }
}

impl fmt::Debug for CallbackPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackPanic")
            .field("thread", &self.thread)
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// A specialized Result type for Horizon Bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;
