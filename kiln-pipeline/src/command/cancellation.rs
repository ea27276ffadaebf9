use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type CancelCallback = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct CancellationTokenInner {
    cancelled: AtomicBool,
    next_callback_id: AtomicU64,
    callbacks: Mutex<Vec<(u64, CancelCallback)>>,
}

/// Build-wide cooperative cancellation signal. Clones share the same state.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<CancellationTokenInner>,
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Signal cancellation. Registered callbacks run once, on the calling thread.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }

        let callbacks = std::mem::take(&mut *self.inner.callbacks.lock().unwrap());
        for (_, callback) in callbacks {
            callback();
        }
    }

    /// Run `callback` when the token is cancelled, or right away if it already is. Returns an id
    /// that can be passed to `unregister`.
    pub fn on_cancel<F: Fn() + Send + Sync + 'static>(
        &self,
        callback: F,
    ) -> u64 {
        let id = self.inner.next_callback_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut callbacks = self.inner.callbacks.lock().unwrap();
            if !self.is_cancelled() {
                callbacks.push((id, Box::new(callback)));
                return id;
            }
        }

        callback();
        id
    }

    pub fn unregister(
        &self,
        id: u64,
    ) {
        self.inner
            .callbacks
            .lock()
            .unwrap()
            .retain(|(callback_id, _)| *callback_id != id);
    }
}
