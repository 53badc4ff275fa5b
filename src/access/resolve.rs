use crate::access::{
    AccessRequest, AccessResult, AccessRight, AccessToken, GenericAccessManager, unblock_results,
};
use crate::cancel::CancellationToken;
use crate::rew::{RewExecutor, RewFuture};

/// Decides what to do when an access request of [`try_execute`] is blocked.
///
/// Returning `true` retries the request, `false` gives up. A resolver
/// usually removes the blocking tokens before retrying, but retrying
/// without doing so is allowed.
pub trait AccessResolver<Id> {
    fn can_continue(&self, read: &AccessResult<Id>, write: &AccessResult<Id>) -> bool;
}

impl<Id, F> AccessResolver<Id> for F
where
    F: Fn(&AccessResult<Id>, &AccessResult<Id>) -> bool,
{
    fn can_continue(&self, read: &AccessResult<Id>, write: &AccessResult<Id>) -> bool {
        self(read, write)
    }
}

/// Never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct AbandonResolver;

impl<Id> AccessResolver<Id> for AbandonResolver {
    fn can_continue(&self, _: &AccessResult<Id>, _: &AccessResult<Id>) -> bool {
        false
    }
}

/// Shuts down the blocking tokens and waits for them before retrying.
/// Gives up when the wait gets canceled.
#[derive(Debug, Clone, Default)]
pub struct UnblockResolver {
    cancel: CancellationToken,
}

impl UnblockResolver {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }
}

impl<Id> AccessResolver<Id> for UnblockResolver {
    fn can_continue(&self, read: &AccessResult<Id>, write: &AccessResult<Id>) -> bool {
        match unblock_results(&self.cancel, &[read, write]) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Giving up on blocked access: {e}");
                false
            }
        }
    }
}

/// Executes `task` once the rights of `request` are available for writing.
///
/// The input is read in the context of a synchronous token needing no
/// rights. Both tokens are shut down when the task is done. Returns `None`
/// if the resolver gave up.
pub fn try_execute<Id, R, T, E, Res>(
    manager: &GenericAccessManager<Id, R>,
    executor: &E,
    resolver: &Res,
    request: &AccessRequest<Id, R>,
    task: T,
) -> Option<RewFuture>
where
    Id: Clone + Send + Sync + 'static,
    R: AccessRight,
    E: RewExecutor<T> + ?Sized,
    Res: AccessResolver<Id> + ?Sized,
{
    let mut attempts = 0usize;
    loop {
        attempts += 1;
        let read = AccessResult::granted(AccessToken::sync(request.id.clone()));
        let write = manager.try_get_access(request);

        if let (Some(read_token), Some(write_token)) = (read.token(), write.token()) {
            tracing::trace!(attempts, "Access granted");
            return Some(executor.execute_and_release(task, read_token, write_token));
        }

        read.release();
        if !resolver.can_continue(&read, &write) {
            tracing::debug!(attempts, "Access abandoned");
            return None;
        }
    }
}
