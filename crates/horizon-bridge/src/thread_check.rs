//! Owning-thread bookkeeping.
//!
//! [`ThreadAffinity`] only knows which thread created a display. Whether a
//! caller may touch facade state also depends on the exclusive section, so
//! access decisions go through [`EventLoopBridge::has_access`] and the checks
//! built on it: [`Display::check_device`] and [`Display::assert_widget_thread`].
//!
//! [`EventLoopBridge::has_access`]: crate::EventLoopBridge::has_access
//! [`Display::check_device`]: crate::Display::check_device
//! [`Display::assert_widget_thread`]: crate::Display::assert_widget_thread

use std::thread::{self, ThreadId};

/// A human-readable label for the current thread, used in diagnostics.
pub fn current_thread_label() -> String {
    let current = thread::current();
    match current.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", current.id()),
    }
}

/// The thread a display was created on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadAffinity {
    thread_id: ThreadId,
}

impl ThreadAffinity {
    /// Bind to the calling thread.
    #[inline]
    pub fn current() -> Self {
        Self {
            thread_id: thread::current().id(),
        }
    }

    /// The bound thread.
    #[inline]
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Whether the caller is the bound thread.
    #[inline]
    pub fn is_same_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

/// Panic for a facade touched without access to its display.
#[cold]
#[inline(never)]
pub(crate) fn access_violation(owner: ThreadId, what: &str) -> ! {
    panic!(
        "{what}: called from thread \"{}\", display is owned by {owner:?}; \
         use Display::async_exec or Display::sync_exec to reach the owning thread",
        current_thread_label()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affinity_binds_creating_thread() {
        let affinity = ThreadAffinity::current();
        assert!(affinity.is_same_thread());
        assert_eq!(affinity.thread_id(), thread::current().id());

        let elsewhere = thread::spawn(move || affinity.is_same_thread())
            .join()
            .unwrap();
        assert!(!elsewhere);
    }

    #[test]
    fn test_current_thread_label_uses_name() {
        let label = thread::Builder::new()
            .name("label-check".into())
            .spawn(current_thread_label)
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(label, "label-check");
    }

    #[test]
    fn test_access_violation_names_threads() {
        let owner = thread::current().id();
        let result = thread::Builder::new()
            .name("intruder".into())
            .spawn::<_, ()>(move || access_violation(owner, "widget accessed"))
            .unwrap()
            .join();

        let payload = result.unwrap_err();
        let message = payload.downcast_ref::<String>().unwrap();
        assert!(message.starts_with("widget accessed"));
        assert!(message.contains("\"intruder\""));
    }
}
