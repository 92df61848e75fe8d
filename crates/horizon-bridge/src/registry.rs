//! Process-wide record of live displays, one per owning thread.
//!
//! Only display construction and disposal touch the registry; there is no
//! ambient "current display" lookup.

use std::collections::HashMap;
use std::sync::{OnceLock, Weak};
use std::thread::ThreadId;

use parking_lot::Mutex;

use crate::error::{BridgeError, Result};

/// Implemented by whatever the registry tracks, so stale entries can be told
/// apart from live ones.
pub(crate) trait Registered: Send + Sync {
    fn is_live(&self) -> bool;
}

type Entries = HashMap<ThreadId, Weak<dyn Registered>>;

fn entries() -> &'static Mutex<Entries> {
    static REGISTRY: OnceLock<Mutex<Entries>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Record `display` as the live display of `thread`.
///
/// Fails with `DisplayExists` if another display for that thread is still
/// alive and not disposed. Stale entries are replaced.
pub(crate) fn register(thread: ThreadId, display: Weak<dyn Registered>) -> Result<()> {
    let mut entries = entries().lock();
    let existing = entries.get(&thread).and_then(Weak::upgrade);
    let occupied = existing.as_ref().is_some_and(|current| current.is_live());
    if !occupied {
        entries.insert(thread, display);
    }

    // The upgraded entry may hold the last strong reference; release it unlocked.
    drop(entries);
    drop(existing);

    if occupied {
        Err(BridgeError::DisplayExists(thread))
    } else {
        Ok(())
    }
}

/// Remove the entry for `thread` if it still points at `display`.
pub(crate) fn deregister(thread: ThreadId, display: &Weak<dyn Registered>) {
    let mut entries = entries().lock();
    if entries
        .get(&thread)
        .is_some_and(|current| Weak::ptr_eq(current, display))
    {
        entries.remove(&thread);
    }
}
