//! Structured fan-out over threads.
//!
//! A [`MultipleResultScope`] runs a group of tasks, keeps the values of the
//! ones that succeed and discards the failures. `join` returns once every
//! task has finished, or as soon as the scope is cancelled, and only then
//! exposes the collected set.

use std::collections::HashSet;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

struct TokenInner {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

/// Shared cancellation flag handed to every task in a scope.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                lock: Mutex::new(()),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        let _guard = self.inner.lock.lock();
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Sleep for up to `timeout`, waking early on cancellation.
    /// Returns whether the token is cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut guard = self.inner.lock.lock();
        if !self.is_cancelled() {
            self.inner.cond.wait_for(&mut guard, timeout);
        }
        self.is_cancelled()
    }

    fn notify(&self) {
        let _guard = self.inner.lock.lock();
        self.inner.cond.notify_all();
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

pub struct MultipleResultScope<T> {
    token: CancellationToken,
    results: Arc<Mutex<HashSet<T>>>,
    running: Arc<AtomicUsize>,
    handles: Vec<JoinHandle<()>>,
    name: String,
}

impl<T> MultipleResultScope<T>
where
    T: Eq + Hash + Send + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            token: CancellationToken::new(),
            results: Arc::new(Mutex::new(HashSet::new())),
            running: Arc::new(AtomicUsize::new(0)),
            handles: Vec::new(),
            name: name.into(),
        }
    }

    /// A handle that can cancel the scope from another thread.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Run `task` on its own thread. An `Ok` value joins the result set.
    pub fn fork<F, E>(&mut self, task: F) -> std::io::Result<()>
    where
        F: FnOnce(CancellationToken) -> Result<T, E> + Send + 'static,
        E: Display,
    {
        let token = self.token.clone();
        let results = self.results.clone();
        let running = self.running.clone();
        let index = self.handles.len();

        running.fetch_add(1, Ordering::AcqRel);
        let spawned = std::thread::Builder::new()
            .name(format!("{}-{}", self.name, index))
            .spawn(move || {
                match task(token.clone()) {
                    Ok(value) => {
                        results.lock().insert(value);
                    }
                    Err(e) => debug!("scoped task {} failed: {}", index, e),
                }
                running.fetch_sub(1, Ordering::AcqRel);
                token.notify();
            });

        match spawned {
            Ok(handle) => {
                self.handles.push(handle);
                Ok(())
            }
            Err(e) => {
                self.running.fetch_sub(1, Ordering::AcqRel);
                Err(e)
            }
        }
    }

    /// Wait for all tasks, or for cancellation, and return the successes.
    ///
    /// After a cancellation, tasks that are still running are detached;
    /// whatever they produce later is discarded.
    pub fn join(mut self) -> HashSet<T> {
        {
            let mut guard = self.token.inner.lock.lock();
            while self.running.load(Ordering::Acquire) > 0 && !self.token.is_cancelled() {
                self.token.inner.cond.wait(&mut guard);
            }
        }

        if self.running.load(Ordering::Acquire) == 0 {
            for handle in self.handles.drain(..) {
                let _ = handle.join();
            }
        } else {
            debug!(
                scope = %self.name,
                still_running = self.running.load(Ordering::Acquire),
                "scope cancelled, detaching tasks"
            );
            self.handles.clear();
        }

        std::mem::take(&mut *self.results.lock())
    }
}
