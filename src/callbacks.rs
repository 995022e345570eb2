//! Subscriber lists shared by bridges and the registry.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::error;
use uuid::Uuid;

/// Identifies a registered callback so it can be removed later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(Uuid);

type Callback<A> = Arc<dyn Fn(&A) + Send + Sync>;

/// An ordered list of callbacks receiving `&A`.
pub(crate) struct Callbacks<A: ?Sized> {
    label: &'static str,
    list: Mutex<Vec<(CallbackId, Callback<A>)>>,
}

impl<A: ?Sized> Callbacks<A> {
    pub(crate) fn new(label: &'static str) -> Self {
        Callbacks {
            label,
            list: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        let id = CallbackId(Uuid::new_v4());
        lock(&self.list).push((id, Arc::new(callback)));
        id
    }

    /// Returns false if the callback was not registered.
    pub(crate) fn remove(&self, id: CallbackId) -> bool {
        let mut list = lock(&self.list);
        let before = list.len();
        list.retain(|(known, _)| *known != id);
        list.len() != before
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        lock(&self.list).len()
    }

    /// Call every callback in registration order.
    ///
    /// The list is copied first, so callbacks may add or remove callbacks.
    /// A panicking callback is logged and skipped.
    pub(crate) fn notify(&self, arg: &A) {
        let snapshot: Vec<Callback<A>> = lock(&self.list)
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for cb in snapshot {
            if panic::catch_unwind(AssertUnwindSafe(|| cb(arg))).is_err() {
                error!("{} callback panicked; continuing with remaining subscribers", self.label);
            }
        }
    }
}

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
