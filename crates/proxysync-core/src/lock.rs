//! The coordinator lock.
//!
//! [`ProxyLock`] has two modes:
//!
//! - **Concurrent-mutation mode** ([`ProxyLock::lock`]): taken by steady-state
//!   events such as local subscribes and inbound messages. Many holders may
//!   mutate subscription tables at once; the tables carry their own
//!   fine-grained locks. Acquisition is recursive, so a holder may re-enter.
//! - **Exclusive structural mode** ([`ProxyLock::lock_exclusive`]): taken for
//!   neighbour creation and removal, start/stop and topic-space changes.
//!   Excludes every other holder of either mode. Not re-entrant: code running
//!   under it must not call back into anything taking the lock.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Guard for concurrent-mutation mode.
pub type SharedGuard<'a> = RwLockReadGuard<'a, ()>;

/// Guard for exclusive structural mode.
pub type ExclusiveGuard<'a> = RwLockWriteGuard<'a, ()>;

/// Shared/exclusive coordinator lock.
#[derive(Debug, Default)]
pub struct ProxyLock {
    inner: RwLock<()>,
}

impl ProxyLock {
    /// Create an unlocked lock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire concurrent-mutation mode.
    ///
    /// Recursive: does not queue behind a waiting exclusive holder, so a
    /// thread already holding this mode cannot deadlock against one.
    pub fn lock(&self) -> SharedGuard<'_> {
        self.inner.read_recursive()
    }

    /// Acquire exclusive structural mode.
    pub fn lock_exclusive(&self) -> ExclusiveGuard<'_> {
        self.inner.write()
    }

    /// Try to acquire exclusive structural mode without blocking.
    pub fn try_lock_exclusive(&self) -> Option<ExclusiveGuard<'_>> {
        self.inner.try_write()
    }
}
