use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::access::{AccessRequest, AccessResult, AccessToken};
use crate::executor::{InOrderExecutor, SyncTaskExecutor, TaskExecutor};

/// A right that can be requested from an access manager.
pub trait AccessRight: Clone + Eq + Hash + Debug + Send + Sync + 'static {
    /// Whether holding `self` and `other` at the same time is a conflict when
    /// at least one of them is held for writing.
    fn conflicts_with(&self, other: &Self) -> bool {
        self == other
    }
}

impl AccessRight for String {}
impl AccessRight for &'static str {}
impl AccessRight for u64 {}

/// A right on a node of a tree of resources, e.g. `config/network/proxy`.
///
/// Two rights conflict when one is an ancestor of (or equal to) the other.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HierarchicalRight(Arc<[Arc<str>]>);

impl HierarchicalRight {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Arc<str>>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Splits a path on `/`, ignoring empty segments.
    pub fn parse(path: &str) -> Self {
        Self::new(path.split('/').filter(|s| !s.is_empty()))
    }

    pub fn segments(&self) -> &[Arc<str>] {
        &self.0
    }

    pub fn is_prefix_of(&self, other: &Self) -> bool {
        other.0.starts_with(&self.0)
    }
}

impl AccessRight for HierarchicalRight {
    fn conflicts_with(&self, other: &Self) -> bool {
        self.is_prefix_of(other) || other.is_prefix_of(self)
    }
}

fn any_conflict<R: AccessRight>(a: &[R], b: &[R]) -> bool {
    a.iter().any(|x| b.iter().any(|y| x.conflicts_with(y)))
}

struct Grant<Id, R> {
    serial: u64,
    token: AccessToken<Id>,
    read: Vec<R>,
    write: Vec<R>,
}

impl<Id, R: AccessRight> Grant<Id, R> {
    fn conflicts_with(&self, request: &AccessRequest<Id, R>) -> bool {
        any_conflict(&request.write_rights, &self.write)
            || any_conflict(&request.write_rights, &self.read)
            || any_conflict(&request.read_rights, &self.write)
    }
}

struct Grants<Id, R> {
    next_serial: u64,
    active: Vec<Grant<Id, R>>,
}

struct ManagerInner<Id, R> {
    executor: Arc<dyn TaskExecutor>,
    grants: Mutex<Grants<Id, R>>,
}

impl<Id, R> ManagerInner<Id, R> {
    fn lock(&self) -> MutexGuard<'_, Grants<Id, R>> {
        self.grants.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Grants read and write rights.
///
/// Read rights are shared, write rights are exclusive against every
/// conflicting read or write right. A grant lasts until its token
/// terminates. Checking for conflicts and registering the new grant happen
/// under one lock, so two conflicting requests can never both succeed.
pub struct GenericAccessManager<Id, R> {
    inner: Arc<ManagerInner<Id, R>>,
}

impl<Id, R> Clone for GenericAccessManager<Id, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<Id, R> GenericAccessManager<Id, R>
where
    Id: Clone + Send + Sync + 'static,
    R: AccessRight,
{
    /// Tokens of this manager run their jobs on `executor`.
    pub fn new(executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                executor,
                grants: Mutex::new(Grants {
                    next_serial: 0,
                    active: Vec::new(),
                }),
            }),
        }
    }

    /// A manager whose tokens run their jobs on the submitting thread.
    pub fn sync() -> Self {
        Self::new(Arc::new(SyncTaskExecutor))
    }

    /// Grants the request if nothing conflicts with it, otherwise returns the
    /// tokens in the way.
    pub fn try_get_access(&self, request: &AccessRequest<Id, R>) -> AccessResult<Id> {
        let context = InOrderExecutor::new(self.inner.executor.clone());
        let token = AccessToken::with_context(request.id.clone(), context);

        let serial = {
            let mut grants = self.inner.lock();
            let blocking: Vec<_> = grants
                .active
                .iter()
                .filter(|grant| grant.conflicts_with(request))
                .map(|grant| grant.token.clone())
                .collect();

            if !blocking.is_empty() {
                return AccessResult::blocked(blocking);
            }
            Self::register(&mut grants, &token, request)
        };

        self.release_on_termination(&token, serial);
        AccessResult::granted(token)
    }

    /// Always grants the request. The returned token doesn't run any job
    /// until every conflicting token terminated.
    pub fn get_scheduled_access(&self, request: &AccessRequest<Id, R>) -> AccessToken<Id> {
        let context = InOrderExecutor::new_paused(self.inner.executor.clone());
        let token = AccessToken::with_context(request.id.clone(), context.clone());

        let (serial, blocking) = {
            let mut grants = self.inner.lock();
            let blocking: Vec<_> = grants
                .active
                .iter()
                .filter(|grant| grant.conflicts_with(request))
                .map(|grant| grant.token.clone())
                .collect();
            (Self::register(&mut grants, &token, request), blocking)
        };
        self.release_on_termination(&token, serial);

        if blocking.is_empty() {
            context.resume();
            return token;
        }

        let remaining = Arc::new(AtomicUsize::new(blocking.len()));
        for blocker in blocking {
            let remaining = remaining.clone();
            let context = context.clone();
            blocker.add_termination_listener(move || {
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    context.resume();
                }
            });
        }
        token
    }

    /// The tokens currently preventing `request` from being granted.
    pub fn blocking_tokens(&self, request: &AccessRequest<Id, R>) -> Vec<AccessToken<Id>> {
        self.inner
            .lock()
            .active
            .iter()
            .filter(|grant| grant.conflicts_with(request))
            .map(|grant| grant.token.clone())
            .collect()
    }

    pub fn is_available(&self, request: &AccessRequest<Id, R>) -> bool {
        !self
            .inner
            .lock()
            .active
            .iter()
            .any(|grant| grant.conflicts_with(request))
    }

    pub fn active_grants(&self) -> usize {
        self.inner.lock().active.len()
    }

    fn register(
        grants: &mut Grants<Id, R>,
        token: &AccessToken<Id>,
        request: &AccessRequest<Id, R>,
    ) -> u64 {
        let serial = grants.next_serial;
        grants.next_serial += 1;
        grants.active.push(Grant {
            serial,
            token: token.clone(),
            read: request.read_rights.clone(),
            write: request.write_rights.clone(),
        });
        serial
    }

    fn release_on_termination(&self, token: &AccessToken<Id>, serial: u64) {
        let manager: Weak<ManagerInner<Id, R>> = Arc::downgrade(&self.inner);
        token.add_termination_listener(move || {
            if let Some(manager) = manager.upgrade() {
                manager.lock().active.retain(|grant| grant.serial != serial);
            }
        });
    }
}
