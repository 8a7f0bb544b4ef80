//! Ordered parallel pipeline for packet cryptography.
//!
//! Sealing and opening are independent per packet, so they can run on
//! several threads at once. The peer on the other end (or the TUN device)
//! still wants packets in the order they were submitted. The pipeline
//! decouples the two:
//!
//! ```text
//!              /--[worker 1]--\
//!  enqueue --+---[worker 0]---+--> completion table --> dequeue
//!              \--[worker 2]--/        (by sequence)
//! ```
//!
//! Every enqueue takes the next sequence number. Workers run the transform
//! in whatever order they pick items up and file the result under its
//! sequence number. `dequeue` only ever hands out the head-of-line sequence,
//! so dequeue call `i` returns the result of enqueue call `i` regardless of
//! which worker finished first.
//!
//! At most `capacity` items are in flight (enqueued but not yet dequeued).
//! Enqueue blocks beyond that, which bounds memory and pushes back on the
//! producer. A slow head item holds up everything behind it.
//!
//! [`OrderedPipeline::shutdown`] cancels all pending work and wakes every
//! blocked caller with [`PipelineError::Cancelled`].

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, error, trace};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError<E> {
    #[error("pipeline cancelled")]
    Cancelled,

    #[error("transform failed: {0}")]
    Transform(E),

    #[error("transform panicked")]
    Panicked,
}

/// Returned by [`OrderedPipeline::try_enqueue`] with the rejected item.
#[derive(Debug)]
pub enum TryEnqueueError<T> {
    Full(T),
    Cancelled(T),
}

impl<T> TryEnqueueError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(item) | Self::Cancelled(item) => item,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Prefix for worker thread names.
    pub name: String,
    pub capacity: usize,
    pub workers: usize,
}

impl PipelineConfig {
    pub fn new(name: impl Into<String>, capacity: usize, workers: usize) -> Self {
        Self {
            name: name.into(),
            capacity: capacity.max(1),
            workers: workers.max(1),
        }
    }
}

type Transform<T, U, E> = dyn Fn(&T) -> Result<U, E> + Send + Sync;
type Completion<T, U, E> = dyn Fn(&Result<U, PipelineError<E>>, T) + Send + Sync;

struct Job<T> {
    seq: u64,
    item: T,
}

struct State<U, E> {
    next_seq: u64,
    head: u64,
    in_flight: usize,
    completed: HashMap<u64, Result<U, PipelineError<E>>>,
    closed: bool,
}

struct Shared<U, E> {
    state: Mutex<State<U, E>>,
    /// Signalled when an in-flight slot frees up.
    space: Condvar,
    /// Signalled when a result is filed or the pipeline closes.
    ready: Condvar,
    capacity: usize,
}

pub struct OrderedPipeline<T, U, E> {
    shared: Arc<Shared<U, E>>,
    sender: Mutex<Option<Sender<Job<T>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    name: String,
}

impl<T, U, E> OrderedPipeline<T, U, E>
where
    T: Send + 'static,
    U: Send + 'static,
    E: Send + 'static,
{
    /// Start the worker threads.
    ///
    /// `transform` runs on a worker for every item. `on_complete` runs on the
    /// same worker right after, with the result and the original item, and
    /// is the last owner of the item.
    pub fn new<F, C>(config: PipelineConfig, transform: F, on_complete: C) -> std::io::Result<Self>
    where
        F: Fn(&T) -> Result<U, E> + Send + Sync + 'static,
        C: Fn(&Result<U, PipelineError<E>>, T) + Send + Sync + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                next_seq: 0,
                head: 0,
                in_flight: 0,
                completed: HashMap::with_capacity(config.capacity),
                closed: false,
            }),
            space: Condvar::new(),
            ready: Condvar::new(),
            capacity: config.capacity,
        });

        let transform: Arc<Transform<T, U, E>> = Arc::new(transform);
        let on_complete: Arc<Completion<T, U, E>> = Arc::new(on_complete);
        let (sender, receiver) = crossbeam_channel::unbounded::<Job<T>>();

        let pipeline = Self {
            shared: shared.clone(),
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(Vec::with_capacity(config.workers)),
            name: config.name.clone(),
        };

        for index in 0..config.workers {
            let shared = shared.clone();
            let receiver = receiver.clone();
            let transform = transform.clone();
            let on_complete = on_complete.clone();

            let spawned = std::thread::Builder::new()
                .name(format!("{}-{}", config.name, index))
                .spawn(move || worker_loop(shared, receiver, transform, on_complete));

            match spawned {
                Ok(handle) => pipeline.workers.lock().push(handle),
                Err(e) => {
                    pipeline.shutdown();
                    return Err(e);
                }
            }
        }

        debug!(
            name = %config.name,
            capacity = config.capacity,
            workers = config.workers,
            "pipeline started"
        );
        Ok(pipeline)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Items enqueued but not yet dequeued.
    pub fn in_flight(&self) -> usize {
        self.shared.state.lock().in_flight
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Submit an item, blocking while the pipeline is at capacity.
    ///
    /// Returns the sequence number assigned to the item.
    pub fn enqueue(&self, item: T) -> Result<u64, PipelineError<E>> {
        let mut state = self.shared.state.lock();
        while !state.closed && state.in_flight >= self.shared.capacity {
            self.shared.space.wait(&mut state);
        }
        if state.closed {
            return Err(PipelineError::Cancelled);
        }
        self.submit_locked(&mut state, item)
            .map_err(|_| PipelineError::Cancelled)
    }

    /// Submit an item without blocking.
    pub fn try_enqueue(&self, item: T) -> Result<u64, TryEnqueueError<T>> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(TryEnqueueError::Cancelled(item));
        }
        if state.in_flight >= self.shared.capacity {
            return Err(TryEnqueueError::Full(item));
        }
        self.submit_locked(&mut state, item)
            .map_err(TryEnqueueError::Cancelled)
    }

    fn submit_locked(&self, state: &mut State<U, E>, item: T) -> Result<u64, T> {
        let seq = state.next_seq;
        let sent = match self.sender.lock().as_ref() {
            Some(sender) => sender.send(Job { seq, item }).map_err(|e| e.into_inner().item),
            None => Err(item),
        };

        match sent {
            Ok(()) => {
                state.next_seq += 1;
                state.in_flight += 1;
                trace!(pipeline = %self.name, seq, "enqueued");
                Ok(seq)
            }
            Err(item) => {
                state.closed = true;
                self.shared.ready.notify_all();
                self.shared.space.notify_all();
                Err(item)
            }
        }
    }

    /// Take the result of the oldest outstanding item, blocking until its
    /// transform has finished.
    pub fn dequeue(&self) -> Result<U, PipelineError<E>> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(result) = self.take_head(&mut state) {
                return result;
            }
            if state.closed {
                return Err(PipelineError::Cancelled);
            }
            self.shared.ready.wait(&mut state);
        }
    }

    /// Like [`dequeue`](Self::dequeue), giving up after `timeout`.
    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<Result<U, PipelineError<E>>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if let Some(result) = self.take_head(&mut state) {
                return Some(result);
            }
            if state.closed {
                return Some(Err(PipelineError::Cancelled));
            }
            if self.shared.ready.wait_until(&mut state, deadline).timed_out() {
                return self.take_head(&mut state);
            }
        }
    }

    fn take_head(&self, state: &mut State<U, E>) -> Option<Result<U, PipelineError<E>>> {
        let head = state.head;
        let result = state.completed.remove(&head)?;
        state.head += 1;
        state.in_flight -= 1;
        self.shared.space.notify_one();
        trace!(pipeline = %self.name, seq = head, "dequeued");
        Some(result)
    }

    /// Cancel pending work and stop the workers.
    ///
    /// Blocked `enqueue`/`dequeue` callers return [`PipelineError::Cancelled`].
    /// Items still queued are handed to the completion callback with the same
    /// error so their resources are released. Must not be called from the
    /// completion callback.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.closed && self.sender.lock().is_none() {
                return;
            }
            state.closed = true;
            state.completed.clear();
            self.shared.ready.notify_all();
            self.shared.space.notify_all();
        }

        self.sender.lock().take();

        let workers = std::mem::take(&mut *self.workers.lock());
        let current = std::thread::current().id();
        for handle in workers {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!(pipeline = %self.name, "worker thread panicked");
            }
        }
        debug!(pipeline = %self.name, "pipeline shut down");
    }
}

impl<T, U, E> Drop for OrderedPipeline<T, U, E> {
    fn drop(&mut self) {
        self.shared.state.lock().closed = true;
        self.shared.ready.notify_all();
        self.shared.space.notify_all();
        self.sender.get_mut().take();
        for handle in self.workers.get_mut().drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop<T, U, E>(
    shared: Arc<Shared<U, E>>,
    receiver: Receiver<Job<T>>,
    transform: Arc<Transform<T, U, E>>,
    on_complete: Arc<Completion<T, U, E>>,
) {
    for Job { seq, item } in receiver.iter() {
        if shared.state.lock().closed {
            on_complete(&Err(PipelineError::Cancelled), item);
            continue;
        }

        let result = match catch_unwind(AssertUnwindSafe(|| transform(&item))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(PipelineError::Transform(e)),
            Err(_) => {
                error!(seq, "pipeline transform panicked");
                Err(PipelineError::Panicked)
            }
        };

        if catch_unwind(AssertUnwindSafe(|| on_complete(&result, item))).is_err() {
            error!(seq, "pipeline completion callback panicked");
        }

        let mut state = shared.state.lock();
        if state.closed {
            continue;
        }
        state.completed.insert(seq, result);
        shared.ready.notify_all();
    }
}
