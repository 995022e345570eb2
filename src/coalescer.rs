//! Rate-limited batching of writes to lights, groups and scenes.
//!
//! Every bridge owns one [`Coalescer`]. Targets with pending changes are
//! added to it; the first addition while idle schedules a flush on the next
//! scheduler turn, so everything changed within one logical operation goes
//! out together. After that, flush cycles run no closer together than the
//! configured interval until a cycle finds nothing to do.
//!
//! Within a cycle targets are written strictly one at a time. A target added
//! several times before its cycle is written once and every caller receives
//! the same outcome.
//!
//! "Within one logical operation" relies on the flush task not running while
//! the caller is still changing things. On a multi-threaded executor the
//! flush task may run on another worker at any moment, so a caller that
//! blocks or awaits between setters can see its changes split over several
//! writes. Wrap such sequences in [`Lightset::defer`] and
//! [`Lightset::submit`] (or [`Lightset::nodefer`]) to keep them together.
//!
//! [`Lightset::defer`]: crate::Lightset::defer
//! [`Lightset::submit`]: crate::Lightset::submit
//! [`Lightset::nodefer`]: crate::Lightset::nodefer

use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::channel::oneshot;
use log::{debug, error, trace};
use serde_json::Value;

use crate::callbacks::lock;
use crate::errors::Error;
use crate::runtime::{self, BoxFuture, Instant};
use crate::target::{Flushable, TargetKey, TargetWrite};

type Result<T> = std::result::Result<T, Error>;

/// Callback receiving the outcome of a target's write.
pub type Completion = Box<dyn FnOnce(&Result<Value>) + Send>;

/// Where coalesced writes end up; normally the bridge's request queue.
pub trait WriteSink: Send + Sync {
    fn write(&self, write: TargetWrite) -> BoxFuture<'_, Result<Value>>;

    /// GET `path`, relative to the bridge's `/api/<username>` prefix.
    fn read(&self, path: String, category: &'static str) -> BoxFuture<'_, Result<Value>>;
}

/// Batches target writes into paced flush cycles.
///
/// Cloning is cheap; clones share the same pending set.
#[derive(Clone)]
pub struct Coalescer {
    inner: Arc<CoalescerInner>,
}

struct CoalescerInner {
    sink: Arc<dyn WriteSink>,
    interval: Duration,
    state: Mutex<FlushState>,
}

#[derive(Default)]
struct FlushState {
    pending: Vec<PendingTarget>,
    // True while a flush task exists.
    armed: bool,
}

struct PendingTarget {
    key: TargetKey,
    target: Arc<dyn Flushable>,
    callbacks: Vec<Completion>,
}

impl Coalescer {
    pub fn new(sink: Arc<dyn WriteSink>, interval: Duration) -> Self {
        Coalescer {
            inner: Arc::new(CoalescerInner {
                sink,
                interval,
                state: Mutex::new(FlushState::default()),
            }),
        }
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    /// Queue `target` for the next flush cycle.
    ///
    /// `on_complete`, if given, receives the outcome of the write that
    /// includes this call's changes.
    pub fn add_target(&self, target: Arc<dyn Flushable>, on_complete: Option<Completion>) {
        let key = target.key();
        let start = {
            let mut state = lock(&self.inner.state);
            match state.pending.iter_mut().find(|p| p.key == key) {
                Some(pending) => pending.callbacks.extend(on_complete),
                None => state.pending.push(PendingTarget {
                    key: key.clone(),
                    target,
                    callbacks: on_complete.into_iter().collect(),
                }),
            }
            !mem::replace(&mut state.armed, true)
        };
        trace!("Target {key:?} queued for flush");

        if start {
            let inner = Arc::clone(&self.inner);
            runtime::spawn(async move { inner.run().await }).detach();
        }
    }

    /// Queue `target` and wait for the outcome of its write.
    pub fn submit(&self, target: Arc<dyn Flushable>) -> BoxFuture<'static, Result<Value>> {
        let (tx, rx) = oneshot::channel();
        self.add_target(
            target,
            Some(Box::new(move |outcome: &Result<Value>| {
                let _ = tx.send(outcome.clone());
            })),
        );
        Box::pin(async move { rx.await.unwrap_or(Err(Error::Cancelled)) })
    }

    /// Fetch a target's info through the same sink its writes go to.
    ///
    /// Reads bypass the pending set and are not paced.
    pub fn read(&self, path: String, category: &'static str) -> BoxFuture<'static, Result<Value>> {
        let sink = Arc::clone(&self.inner.sink);
        Box::pin(async move { sink.read(path, category).await })
    }

    /// Number of targets waiting for the next cycle.
    pub fn pending(&self) -> usize {
        lock(&self.inner.state).pending.len()
    }

    /// Whether a flush task is scheduled or running.
    pub fn is_flushing(&self) -> bool {
        lock(&self.inner.state).armed
    }
}

impl CoalescerInner {
    async fn run(&self) {
        runtime::yield_now().await;

        loop {
            let started = Instant::now();
            let batch = {
                let mut state = lock(&self.state);
                if state.pending.is_empty() {
                    state.armed = false;
                    return;
                }
                mem::take(&mut state.pending)
            };
            debug!("Flushing {} target(s)", batch.len());

            for PendingTarget {
                key,
                target,
                callbacks,
            } in batch
            {
                let write = target.take_write();
                trace!("Writing {key:?} to {}: {}", write.path, write.body);
                let outcome = self.sink.write(write).await;
                if let Err(e) = &outcome {
                    debug!("Write to {key:?} failed: {e}");
                }

                target.complete(&outcome);
                for callback in callbacks {
                    if panic::catch_unwind(AssertUnwindSafe(|| callback(&outcome))).is_err() {
                        error!("Completion callback for {key:?} panicked");
                    }
                }
            }

            if let Some(rest) = self.interval.checked_sub(started.elapsed()) {
                runtime::sleep(rest).await;
            }
        }
    }
}
