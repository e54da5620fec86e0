//! Async locks whose acquisition gives up after a time budget.
use crate::pool::Error;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::time::timeout;

/// A [`Mutex`] that fails with [`Error::LockTimeout`] instead of waiting forever.
pub(crate) struct BoundedMutex<T> {
    inner: Mutex<T>,
    budget: Duration,
    what: &'static str,
}

impl<T> BoundedMutex<T> {
    pub(crate) fn new(value: T, budget: Duration, what: &'static str) -> Self {
        Self {
            inner: Mutex::new(value),
            budget,
            what,
        }
    }

    pub(crate) async fn lock(&self) -> Result<MutexGuard<'_, T>, Error> {
        timeout(self.budget, self.inner.lock())
            .await
            .map_err(|_| timed_out(self.budget, self.what))
    }
}

/// A [`RwLock`] that fails with [`Error::LockTimeout`] instead of waiting forever.
pub(crate) struct BoundedRwLock<T> {
    inner: RwLock<T>,
    budget: Duration,
    what: &'static str,
}

impl<T> BoundedRwLock<T> {
    pub(crate) fn new(value: T, budget: Duration, what: &'static str) -> Self {
        Self {
            inner: RwLock::new(value),
            budget,
            what,
        }
    }

    pub(crate) async fn read(&self) -> Result<RwLockReadGuard<'_, T>, Error> {
        timeout(self.budget, self.inner.read())
            .await
            .map_err(|_| timed_out(self.budget, self.what))
    }

    pub(crate) async fn write(&self) -> Result<RwLockWriteGuard<'_, T>, Error> {
        timeout(self.budget, self.inner.write())
            .await
            .map_err(|_| timed_out(self.budget, self.what))
    }
}

fn timed_out(budget: Duration, what: &'static str) -> Error {
    tracing::warn!(?budget, lock = what, "Gave up waiting for a lock");
    Error::LockTimeout { budget, what }
}
