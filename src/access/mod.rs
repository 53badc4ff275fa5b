//! Access-token arbitration.
//!
//! A [`GenericAccessManager`] hands out [`AccessToken`]s for sets of read and
//! write rights. Code running in the context of a token may touch the
//! resources its rights stand for without further locking, provided every
//! mutator goes through a token of the same manager.

mod manager;
mod resolve;
mod token;

use std::fmt::Debug;

use crate::cancel::CancellationToken;
use crate::error::AccessError;

pub use manager::{AccessRight, GenericAccessManager, HierarchicalRight};
pub use resolve::{AbandonResolver, AccessResolver, UnblockResolver, try_execute};
pub use token::AccessToken;

/// The rights requested by `id`.
#[derive(Debug, Clone)]
pub struct AccessRequest<Id, R> {
    pub id: Id,
    pub read_rights: Vec<R>,
    pub write_rights: Vec<R>,
}

impl<Id, R> AccessRequest<Id, R> {
    pub fn new(
        id: Id,
        read_rights: impl IntoIterator<Item = R>,
        write_rights: impl IntoIterator<Item = R>,
    ) -> Self {
        Self {
            id,
            read_rights: read_rights.into_iter().collect(),
            write_rights: write_rights.into_iter().collect(),
        }
    }

    pub fn read(id: Id, rights: impl IntoIterator<Item = R>) -> Self {
        Self::new(id, rights, [])
    }

    pub fn write(id: Id, rights: impl IntoIterator<Item = R>) -> Self {
        Self::new(id, [], rights)
    }
}

/// Outcome of an access request: either a token, or the tokens standing in
/// the way. Conflicts are not errors.
pub struct AccessResult<Id> {
    token: Option<AccessToken<Id>>,
    blocking: Vec<AccessToken<Id>>,
}

impl<Id> AccessResult<Id> {
    pub fn granted(token: AccessToken<Id>) -> Self {
        Self {
            token: Some(token),
            blocking: Vec::new(),
        }
    }

    pub fn blocked(blocking: Vec<AccessToken<Id>>) -> Self {
        Self {
            token: None,
            blocking,
        }
    }

    pub fn is_available(&self) -> bool {
        self.token.is_some()
    }

    pub fn token(&self) -> Option<&AccessToken<Id>> {
        self.token.as_ref()
    }

    pub fn into_token(self) -> Option<AccessToken<Id>> {
        self.token
    }

    pub fn blocking_tokens(&self) -> &[AccessToken<Id>] {
        &self.blocking
    }

    pub fn blocking_ids(&self) -> Vec<Id>
    where
        Id: Clone,
    {
        self.blocking.iter().map(|t| t.id().clone()).collect()
    }

    /// Asks the blocking tokens to release their rights. Doesn't wait.
    pub fn shutdown_blocking_tokens(&self) {
        for token in &self.blocking {
            token.shutdown();
        }
    }

    /// Releases the granted token, if any.
    pub fn release(&self) {
        if let Some(token) = &self.token {
            token.shutdown();
        }
    }
}

impl<Id: Debug> Debug for AccessResult<Id> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessResult")
            .field("token", &self.token)
            .field("blocking", &self.blocking)
            .finish()
    }
}

/// Shuts down every token blocking the given results and waits until they
/// terminated.
pub fn unblock_results<Id>(
    cancel: &CancellationToken,
    results: &[&AccessResult<Id>],
) -> Result<(), AccessError> {
    for result in results {
        result.shutdown_blocking_tokens();
    }
    for result in results {
        for token in result.blocking_tokens() {
            token.await_termination(cancel)?;
        }
    }
    Ok(())
}
