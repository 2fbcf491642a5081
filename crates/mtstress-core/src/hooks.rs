//! Library-side view of the locking callback.
//!
//! A session library embeds one [`Hooks`] slot. The harness installs a
//! [`Locking`] implementation into it before workers start; from then on
//! every access the library makes to a [`Shared`] table is bracketed by
//! `Lock`/`Unlock` calls for that table's identifier. Without an installed
//! callback the library runs unserialized, which is only sound on one thread.
//!
//! [`ErrorQueue`] is the per-thread error bookkeeping that the thread-id
//! callback exists for: fatal steps record a message for the calling thread,
//! and the worker that observed the failure drains its own messages.

use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::{Mutex, RwLock};

use crate::{
    error::LockError,
    locking::{LockMode, Locking, current_thread_id},
};

/// Slot holding the locking callback installed into a library.
#[derive(Default)]
pub struct Hooks {
    callback: RwLock<Option<Arc<dyn Locking>>>,
}

impl Hooks {
    /// Create a slot with no callback installed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `callback` as the library's serialization mechanism.
    ///
    /// # Errors
    ///
    /// `AlreadyInstalled` if a callback is present; the existing one is kept.
    pub fn install(&self, callback: Arc<dyn Locking>) -> Result<(), LockError> {
        let mut slot = self.callback.write();
        if slot.is_some() {
            return Err(LockError::AlreadyInstalled);
        }
        *slot = Some(callback);
        Ok(())
    }

    /// Remove and return the installed callback.
    pub fn uninstall(&self) -> Option<Arc<dyn Locking>> {
        self.callback.write().take()
    }

    /// Whether a callback is installed.
    pub fn is_installed(&self) -> bool {
        self.callback.read().is_some()
    }

    /// Take lock `id` until the returned guard is dropped.
    ///
    /// The guard keeps its own reference to the callback so the matching
    /// `Unlock` reaches the same registry that saw the `Lock`.
    pub fn enter(&self, id: usize) -> HookGuard {
        let callback = self.callback.read().clone();
        if let Some(callback) = &callback {
            callback.lock(LockMode::Lock, id);
        }
        HookGuard { callback, id }
    }

    /// Identifier of the calling thread, as reported by the callback.
    pub fn thread_id(&self) -> u64 {
        self.callback.read().as_ref().map_or_else(current_thread_id, |cb| cb.thread_id())
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks").field("installed", &self.is_installed()).finish()
    }
}

/// Held lock on behalf of the library; released on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct HookGuard {
    callback: Option<Arc<dyn Locking>>,
    id: usize,
}

impl HookGuard {
    /// Identifier of the held lock.
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback.lock(LockMode::Unlock, self.id);
        }
    }
}

/// Library table serialized by one lock identifier.
///
/// The inner mutex only provides safe interior mutability; with the callback
/// installed it is never contended, because every access already holds the
/// registry lock for `id`.
#[derive(Debug)]
pub struct Shared<T> {
    id: usize,
    data: Mutex<T>,
}

impl<T> Shared<T> {
    /// Wrap `value` under lock `id`.
    pub const fn new(id: usize, value: T) -> Self {
        Self { id, data: Mutex::new(value) }
    }

    /// Lock identifier serializing this table.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Run `f` with exclusive access to the table.
    pub fn with<R>(&self, hooks: &Hooks, f: impl FnOnce(&mut T) -> R) -> R {
        let _serialized = hooks.enter(self.id);
        let mut data = self.data.lock();
        f(&mut data)
    }
}

/// Per-thread error messages recorded by the library.
#[derive(Debug)]
pub struct ErrorQueue {
    entries: Shared<HashMap<u64, Vec<String>>>,
}

impl ErrorQueue {
    /// Create an empty queue serialized by lock `id`.
    pub fn new(id: usize) -> Self {
        Self { entries: Shared::new(id, HashMap::new()) }
    }

    /// Record `message` for the calling thread.
    pub fn push(&self, hooks: &Hooks, message: impl Into<String>) {
        let thread = hooks.thread_id();
        let message = message.into();
        self.entries.with(hooks, |entries| entries.entry(thread).or_default().push(message));
    }

    /// Remove and return the calling thread's messages, oldest first.
    pub fn drain(&self, hooks: &Hooks) -> Vec<String> {
        let thread = hooks.thread_id();
        self.entries.with(hooks, |entries| entries.remove(&thread).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::locking::LockRegistry;

    #[test]
    fn second_install_is_rejected() {
        let hooks = Hooks::new();
        hooks.install(Arc::new(LockRegistry::new(1))).unwrap();
        assert_eq!(hooks.install(Arc::new(LockRegistry::new(1))), Err(LockError::AlreadyInstalled));

        assert!(hooks.uninstall().is_some());
        assert!(hooks.install(Arc::new(LockRegistry::new(1))).is_ok());
    }

    #[test]
    fn shared_access_goes_through_registry() {
        let hooks = Hooks::new();
        let registry = Arc::new(LockRegistry::new(2));
        hooks.install(registry.clone()).unwrap();

        let table = Shared::new(1, 0u32);
        for _ in 0..3 {
            table.with(&hooks, |n| *n += 1);
        }

        assert_eq!(table.with(&hooks, |n| *n), 3);
        assert_eq!(registry.counters(), vec![0, 4]);
    }

    #[test]
    fn shared_works_without_callback() {
        let hooks = Hooks::new();
        let table = Shared::new(0, Vec::new());
        table.with(&hooks, |v| v.push(1));
        assert_eq!(table.with(&hooks, |v| v.len()), 1);
    }

    #[test]
    fn guard_unlocks_original_registry_after_uninstall() {
        let hooks = Hooks::new();
        let registry = Arc::new(LockRegistry::new(1));
        hooks.install(registry.clone()).unwrap();

        let guard = hooks.enter(0);
        drop(hooks.uninstall());
        drop(guard);

        assert_eq!(registry.teardown(), Ok(vec![1]));
    }

    #[test]
    fn error_queue_is_per_thread() {
        let hooks = Arc::new(Hooks::new());
        hooks.install(Arc::new(LockRegistry::new(1))).unwrap();
        let queue = Arc::new(ErrorQueue::new(0));

        queue.push(&hooks, "main failed");

        let (h, q) = (Arc::clone(&hooks), Arc::clone(&queue));
        let other = thread::spawn(move || {
            q.push(&h, "worker failed");
            q.drain(&h)
        })
        .join()
        .unwrap();

        assert_eq!(other, vec!["worker failed".to_string()]);
        assert_eq!(queue.drain(&hooks), vec!["main failed".to_string()]);
        assert!(queue.drain(&hooks).is_empty());
    }
}
