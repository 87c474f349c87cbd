//! Cooperative cancellation scopes.
//!
//! A [`Cancellable`] is a node in a tree of scopes. Cancelling a scope
//! cancels every scope below it, wakes anything sleeping on it, and
//! notifies attached [`CancelListener`]s so that blocking waits elsewhere
//! (queue backpressure, drain waits) can re-check their predicates.
//!
//! Scopes are created per automation run and are not reused once cancelled.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use crate::error::{CancelReason, Cancelled};

/// Hook invoked once when a scope is cancelled.
///
/// Called without any scope lock held, from the thread that cancelled.
pub trait CancelListener: Send + Sync {
    fn on_cancel(&self, reason: &CancelReason);
}

#[derive(Default)]
struct ScopeState {
    reason: Option<CancelReason>,
    children: Vec<Weak<Scope>>,
    listeners: Vec<(u64, Weak<dyn CancelListener>)>,
    next_listener_id: u64,
}

/// Classic predicate-signal pair; the predicate is `reason.is_some()`
#[derive(Default)]
struct Scope {
    state: Mutex<ScopeState>,
    cvar: Condvar,
}

impl Scope {
    fn lock(&self) -> MutexGuard<'_, ScopeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel(self: &Arc<Self>, reason: CancelReason) -> bool {
        let (children, listeners) = {
            let mut state = self.lock();
            if state.reason.is_some() {
                return false;
            }
            state.reason = Some(reason.clone());
            self.cvar.notify_all();
            (
                std::mem::take(&mut state.children),
                std::mem::take(&mut state.listeners),
            )
        };

        for (_, listener) in listeners {
            if let Some(listener) = listener.upgrade() {
                listener.on_cancel(&reason);
            }
        }
        for child in children {
            if let Some(child) = child.upgrade() {
                child.cancel(CancelReason::ParentCancelled);
            }
        }
        true
    }
}

/// Shared handle to a cancellation scope
#[derive(Clone, Default)]
pub struct Cancellable {
    inner: Arc<Scope>,
}

impl std::fmt::Debug for Cancellable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cancellable")
            .field("reason", &self.reason())
            .finish()
    }
}

impl Cancellable {
    /// A fresh root scope
    pub fn new() -> Self {
        Self::default()
    }

    /// A scope that is cancelled whenever this one is.
    ///
    /// A child of an already-cancelled scope starts out cancelled.
    pub fn child(&self) -> Self {
        let child = Arc::new(Scope::default());
        let mut state = self.inner.lock();
        if state.reason.is_some() {
            child.lock().reason = Some(CancelReason::ParentCancelled);
        } else {
            state.children.retain(|c| c.strong_count() > 0);
            state.children.push(Arc::downgrade(&child));
        }
        Self { inner: child }
    }

    /// Cancel this scope and everything below it.
    /// Returns `false` if it was already cancelled.
    pub fn cancel(&self) -> bool {
        self.inner.cancel(CancelReason::Requested)
    }

    /// Cancel with an explanation of what went wrong.
    pub fn abort(&self, message: impl Into<String>) -> bool {
        self.inner.cancel(CancelReason::Aborted(message.into()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().reason.is_some()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        self.inner.lock().reason.clone()
    }

    /// `Err(Cancelled)` if this scope has been cancelled
    pub fn check(&self) -> Result<(), Cancelled> {
        match self.reason() {
            Some(reason) => Err(Cancelled(reason)),
            None => Ok(()),
        }
    }

    /// Sleep for `duration`, returning early if cancelled.
    pub fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        let deadline = Instant::now() + duration;
        let mut state = self.inner.lock();
        loop {
            if let Some(reason) = &state.reason {
                return Err(Cancelled(reason.clone()));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            state = self
                .inner
                .cvar
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Register a listener for cancellation of this scope.
    ///
    /// The scope only holds a weak reference; the listener is detached when
    /// the returned guard is dropped. If the scope is already cancelled the
    /// listener fires immediately on this thread.
    pub fn attach<L: CancelListener + 'static>(&self, listener: &Arc<L>) -> ListenerGuard {
        let weak: Weak<dyn CancelListener> = Arc::downgrade(listener) as Weak<dyn CancelListener>;
        let mut state = self.inner.lock();
        if let Some(reason) = state.reason.clone() {
            drop(state);
            listener.on_cancel(&reason);
            return ListenerGuard {
                scope: Weak::new(),
                id: 0,
            };
        }
        let id = state.next_listener_id;
        state.next_listener_id += 1;
        state.listeners.push((id, weak));
        ListenerGuard {
            scope: Arc::downgrade(&self.inner),
            id,
        }
    }
}

/// Detaches a [`CancelListener`] from its scope on drop
#[must_use = "the listener is detached when the guard is dropped"]
pub struct ListenerGuard {
    scope: Weak<Scope>,
    id: u64,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(scope) = self.scope.upgrade() {
            scope.lock().listeners.retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl CancelListener for Counter {
        fn on_cancel(&self, _reason: &CancelReason) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_cancel_propagates_down_not_up() {
        let root = Cancellable::new();
        let child = root.child();
        let grandchild = child.child();
        let sibling = root.child();

        assert!(child.cancel());
        assert!(!child.cancel());
        assert!(grandchild.is_cancelled());
        assert_eq!(grandchild.reason(), Some(CancelReason::ParentCancelled));
        assert!(!root.is_cancelled());
        assert!(!sibling.is_cancelled());

        root.abort("link lost");
        assert_eq!(
            sibling.check(),
            Err(Cancelled(CancelReason::ParentCancelled))
        );
        assert_eq!(
            root.reason(),
            Some(CancelReason::Aborted("link lost".to_owned()))
        );
        assert!(root.child().is_cancelled());
    }

    #[test]
    fn test_sleep_wakes_on_cancel() {
        let scope = Cancellable::new();
        let remote = scope.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.cancel();
        });

        let start = Instant::now();
        let result = scope.sleep(Duration::from_secs(10));
        assert!(result.is_err());
        assert!(start.elapsed() < Duration::from_secs(5));
        t.join().unwrap();

        assert!(Cancellable::new().sleep(Duration::from_millis(1)).is_ok());
    }

    #[test]
    fn test_listeners_fire_once_and_detach() {
        let counter = Arc::new(Counter::default());
        let root = Cancellable::new();
        let child = root.child();

        let guard = child.attach(&counter);
        let detached = root.attach(&counter);
        drop(detached);

        root.cancel();
        child.cancel();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        drop(guard);

        // Attaching to a cancelled scope fires immediately
        let _late = child.attach(&counter);
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }
}
