// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::store::Subscription;

type InvalidationCallback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct WatchInner {
    terminal: AtomicBool,
    subscriptions: Mutex<Vec<Box<dyn Subscription + Send>>>,
    callback: Mutex<Option<InvalidationCallback>>,
}

/// Handle over the store subscriptions backing one live permission computation.
///
/// The handle fires its invalidation callback at most once; the first of "an invalidating event
/// arrives" and "the caller tears the watch down" wins, and either way every underlying store
/// subscription is stopped immediately so nothing keeps watching a result nobody holds anymore.
///
/// The callback is only armed once the computation has produced its result. Events delivered
/// before arming still tear the subscriptions down, but the callback is dropped unfired: the
/// caller has not seen a result yet, so there is nothing to invalidate.
#[derive(Clone, Default)]
pub struct WatchHandle {
    inner: Arc<WatchInner>,
}

impl WatchHandle {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, subscription: Box<dyn Subscription + Send>) {
        self.inner
            .subscriptions
            .lock()
            .expect("watch lock")
            .push(subscription);
    }

    /// Install the callback to fire on invalidation. No-op when already terminal.
    pub(crate) fn arm(&self, callback: InvalidationCallback) {
        if self.inner.terminal.load(Ordering::SeqCst) {
            return;
        }
        *self.inner.callback.lock().expect("watch lock") = Some(callback);
        // An event may have raced us between the load and the store above; re-check so the
        // callback cannot linger armed on a dead watch.
        if self.inner.terminal.load(Ordering::SeqCst) {
            self.inner.callback.lock().expect("watch lock").take();
        }
    }

    /// Signal that the watched result is no longer valid.
    pub(crate) fn invalidate(&self) {
        if self.inner.terminal.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_subscriptions();
        let callback = self.inner.callback.lock().expect("watch lock").take();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Tear the watch down without firing the callback. Idempotent.
    pub fn stop(&self) {
        if self.inner.terminal.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_subscriptions();
        self.inner.callback.lock().expect("watch lock").take();
    }

    fn stop_subscriptions(&self) {
        let subscriptions = std::mem::take(
            &mut *self.inner.subscriptions.lock().expect("watch lock"),
        );
        for subscription in &subscriptions {
            subscription.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::store::Subscription;

    use super::WatchHandle;

    struct CountingSubscription(Arc<AtomicUsize>);

    impl Subscription for CountingSubscription {
        fn stop(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn invalidation_fires_once_and_stops_subscriptions() {
        let stops = Arc::new(AtomicUsize::new(0));
        let fires = Arc::new(AtomicUsize::new(0));

        let watch = WatchHandle::new();
        watch.push(Box::new(CountingSubscription(stops.clone())));
        let fired = fires.clone();
        watch.arm(Box::new(move || {
            fired.fetch_add(1, Ordering::SeqCst);
        }));

        watch.invalidate();
        watch.invalidate();
        assert_eq!(fires.load(Ordering::SeqCst), 1);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_prevents_firing() {
        let fires = Arc::new(AtomicUsize::new(0));
        let watch = WatchHandle::new();
        let fired = fires.clone();
        watch.arm(Box::new(move || {
            fired.fetch_add(1, Ordering::SeqCst);
        }));

        watch.stop();
        watch.invalidate();
        assert_eq!(fires.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn events_before_arming_drop_the_callback() {
        let fires = Arc::new(AtomicUsize::new(0));
        let watch = WatchHandle::new();

        watch.invalidate();

        let fired = fires.clone();
        watch.arm(Box::new(move || {
            fired.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fires.load(Ordering::SeqCst), 0);
    }
}
