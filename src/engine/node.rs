use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::engine::TaskNodeKey;

/// A node whose execution waits for a restriction strategy to admit it.
///
/// Releasing is idempotent: only the first call runs the release action, no
/// matter which clone it was made on.
#[derive(Clone)]
pub struct RestrictableNode {
    key: TaskNodeKey,
    action: Arc<dyn Fn() + Send + Sync>,
    released: Arc<AtomicBool>,
}

impl RestrictableNode {
    pub fn new<F>(key: TaskNodeKey, action: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            key,
            action: Arc::new(action),
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn key(&self) -> &TaskNodeKey {
        &self.key
    }

    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            (self.action)();
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Debug for RestrictableNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestrictableNode")
            .field("key", &self.key)
            .field("released", &self.is_released())
            .finish()
    }
}
