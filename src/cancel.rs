//! Cooperative cancellation.
//!
//! A [`CancellationSource`] owns the right to cancel; the
//! [`CancellationToken`]s it hands out can only observe. Cancellation is a
//! one-way flag: once a token reports canceled it does so forever, and every
//! listener registered on it runs exactly once, immediately if the token was
//! already canceled at registration time.
//!
//! Sources can be derived from a parent token with
//! [`CancellationSource::child_of`]. Canceling the parent cancels the child;
//! canceling the child leaves the parent alone. Dropping a child source
//! detaches it, so short-lived children don't pile up listeners on a
//! long-lived parent.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::OperationCanceled;

type Listener = Box<dyn FnOnce() + Send>;

struct CancelState {
    canceled: AtomicBool,
    next_id: AtomicU64,
    /// `None` once the state was canceled and the listeners were drained.
    listeners: Mutex<Option<BTreeMap<u64, Listener>>>,
}

impl CancelState {
    fn new() -> Self {
        Self {
            canceled: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            listeners: Mutex::new(Some(BTreeMap::new())),
        }
    }

    fn canceled() -> Self {
        Self {
            canceled: AtomicBool::new(true),
            next_id: AtomicU64::new(0),
            listeners: Mutex::new(None),
        }
    }

    fn cancel(&self) {
        if self.canceled.swap(true, Ordering::AcqRel) {
            return;
        }

        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        // Listeners run outside of the lock, in registration order.
        for (_, listener) in listeners.into_iter().flatten() {
            listener();
        }
    }

    fn add_listener(self: &Arc<Self>, listener: Listener) -> ListenerRef {
        if !self.canceled.load(Ordering::Acquire) {
            let mut guard = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(listeners) = guard.as_mut() {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                listeners.insert(id, listener);
                return ListenerRef {
                    state: Arc::downgrade(self),
                    id: Some(id),
                };
            }
        }

        listener();
        ListenerRef::unregistered()
    }

    fn remove_listener(&self, id: u64) -> bool {
        let mut guard = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .as_mut()
            .map(|listeners| listeners.remove(&id).is_some())
            .unwrap_or(false)
    }

    #[cfg(test)]
    fn listener_count(&self) -> usize {
        let guard = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().map(BTreeMap::len).unwrap_or(0)
    }

    fn has_listener(&self, id: u64) -> bool {
        let guard = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .as_ref()
            .map(|listeners| listeners.contains_key(&id))
            .unwrap_or(false)
    }
}

/// Handle to a listener registered on a [`CancellationToken`].
///
/// Dropping the handle does not unregister the listener.
pub struct ListenerRef {
    state: Weak<CancelState>,
    id: Option<u64>,
}

impl ListenerRef {
    pub(crate) fn unregistered() -> Self {
        Self {
            state: Weak::new(),
            id: None,
        }
    }

    /// Returns `true` while the listener is still waiting to be notified.
    pub fn is_registered(&self) -> bool {
        match (self.id, self.state.upgrade()) {
            (Some(id), Some(state)) => state.has_listener(id),
            _ => false,
        }
    }

    /// Removes the listener. Calling this more than once is harmless.
    pub fn unregister(&self) {
        if let (Some(id), Some(state)) = (self.id, self.state.upgrade()) {
            state.remove_listener(id);
        }
    }
}

impl Debug for ListenerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRef")
            .field("registered", &self.is_registered())
            .finish()
    }
}

/// The observing side of a cancellation request.
#[derive(Clone)]
pub struct CancellationToken {
    state: Arc<CancelState>,
}

impl CancellationToken {
    /// A token that is never canceled.
    pub fn uncancelable() -> Self {
        Self {
            state: Arc::new(CancelState::new()),
        }
    }

    /// A token that is already canceled.
    pub fn canceled() -> Self {
        Self {
            state: Arc::new(CancelState::canceled()),
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.state.canceled.load(Ordering::Acquire)
    }

    /// Returns `Err(OperationCanceled)` once cancellation was requested.
    pub fn check_canceled(&self) -> Result<(), OperationCanceled> {
        if self.is_canceled() {
            Err(OperationCanceled)
        } else {
            Ok(())
        }
    }

    /// Registers a listener to be run once when the token gets canceled. If
    /// the token is already canceled the listener runs before this method
    /// returns.
    pub fn add_cancellation_listener<F>(&self, listener: F) -> ListenerRef
    where
        F: FnOnce() + Send + 'static,
    {
        self.state.add_listener(Box::new(listener))
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        self.state.listener_count()
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::uncancelable()
    }
}

impl Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

/// The controlling side of a cancellation request.
pub struct CancellationSource {
    state: Arc<CancelState>,
    parent: Option<ListenerRef>,
}

impl CancellationSource {
    pub fn new() -> Self {
        Self {
            state: Arc::new(CancelState::new()),
            parent: None,
        }
    }

    /// Creates a source which is canceled whenever `parent` is. A parent that
    /// is already canceled cancels the child before this function returns.
    ///
    /// The link to the parent lives as long as the source: once the source
    /// is dropped its tokens no longer follow the parent.
    pub fn child_of(parent: &CancellationToken) -> Self {
        let state = Arc::new(CancelState::new());
        let weak = Arc::downgrade(&state);

        let parent_ref = parent.add_cancellation_listener(move || {
            if let Some(state) = weak.upgrade() {
                state.cancel();
            }
        });

        Self {
            state,
            parent: Some(parent_ref),
        }
    }

    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            state: Arc::clone(&self.state),
        }
    }

    pub fn cancel(&self) {
        self.state.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.state.canceled.load(Ordering::Acquire)
    }

    /// Stops forwarding the parent's cancellation to this source.
    pub fn detach_from_parent(&self) {
        if let Some(parent) = &self.parent {
            parent.unregister();
        }
    }
}

impl Drop for CancellationSource {
    fn drop(&mut self) {
        self.detach_from_parent();
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for CancellationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationSource")
            .field("canceled", &self.is_canceled())
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}

/// Returns a token which is canceled as soon as any of the given tokens is.
pub fn any_token<'a, I>(tokens: I) -> CancellationToken
where
    I: IntoIterator<Item = &'a CancellationToken>,
{
    let state = Arc::new(CancelState::new());

    for token in tokens {
        let weak = Arc::downgrade(&state);
        token.add_cancellation_listener(move || {
            if let Some(state) = weak.upgrade() {
                state.cancel();
            }
        });
    }

    CancellationToken { state }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_cancel_is_monotonic() {
        let source = CancellationSource::new();
        let token = source.token();
        assert!(!token.is_canceled());

        source.cancel();
        assert!(token.is_canceled());
        source.cancel();
        assert!(token.is_canceled());
        assert_eq!(token.check_canceled(), Err(OperationCanceled));
    }

    #[test]
    fn test_listener_runs_once() {
        let source = CancellationSource::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        let listener = source.token().add_cancellation_listener(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(listener.is_registered());

        source.cancel();
        source.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!listener.is_registered());
    }

    #[test]
    fn test_late_listener_runs_immediately() {
        let source = CancellationSource::new();
        source.cancel();

        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let listener = source.token().add_cancellation_listener(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!listener.is_registered());
    }

    #[test]
    fn test_unregister() {
        let source = CancellationSource::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let listener = source.token().add_cancellation_listener(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        listener.unregister();
        listener.unregister();
        source.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_constant_tokens() {
        assert!(!CancellationToken::uncancelable().is_canceled());
        assert!(CancellationToken::canceled().is_canceled());
    }

    #[test]
    fn test_parent_cancels_child() {
        let parent = CancellationSource::new();
        let child = CancellationSource::child_of(&parent.token());
        let grandchild = CancellationSource::child_of(&child.token());

        parent.cancel();
        assert!(child.is_canceled());
        assert!(grandchild.token().is_canceled());
    }

    #[test]
    fn test_child_of_canceled_parent() {
        let child = CancellationSource::child_of(&CancellationToken::canceled());
        assert!(child.token().is_canceled());
    }

    #[test]
    fn test_child_does_not_cancel_parent() {
        let parent = CancellationSource::new();
        let child = CancellationSource::child_of(&parent.token());

        child.cancel();
        assert!(child.is_canceled());
        assert!(!parent.is_canceled());
    }

    #[test]
    fn test_detached_child() {
        let parent = CancellationSource::new();
        let child = CancellationSource::child_of(&parent.token());

        child.detach_from_parent();
        parent.cancel();
        assert!(!child.is_canceled());
    }

    #[test]
    fn test_dropped_child_unregisters_from_parent() {
        let parent = CancellationSource::new();
        let token = parent.token();

        for _ in 0..1000 {
            let child = CancellationSource::child_of(&token);
            assert_eq!(token.listener_count(), 1);
            drop(child);
        }
        assert_eq!(token.listener_count(), 0);

        let child = CancellationSource::child_of(&token);
        let child_token = child.token();
        parent.cancel();
        assert!(child_token.is_canceled());
    }

    #[test]
    fn test_any_token() {
        let a = CancellationSource::new();
        let b = CancellationSource::new();
        let any = any_token([&a.token(), &b.token()]);

        assert!(!any.is_canceled());
        b.cancel();
        assert!(any.is_canceled());
    }
}
