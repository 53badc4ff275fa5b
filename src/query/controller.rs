use std::sync::{Arc, Mutex};

use crate::query::{AsyncDataController, AsyncDataState};

/// Controller of a retrieval that cannot be stopped, e.g. one whose value was
/// already available.
#[derive(Debug, Clone, Default)]
pub struct StaticDataController {
    state: Option<AsyncDataState>,
}

impl StaticDataController {
    pub fn new(state: Option<AsyncDataState>) -> Self {
        Self { state }
    }
}

impl AsyncDataController for StaticDataController {
    fn cancel(&self) {}

    fn data_state(&self) -> Option<AsyncDataState> {
        self.state.clone()
    }
}

#[derive(Default)]
struct Pending {
    controller: Option<Arc<dyn AsyncDataController>>,
    canceled: bool,
}

/// A controller whose target is only known after it was handed out.
///
/// A cancel request arriving early is remembered and forwarded on
/// [`init_controller`](Self::init_controller).
#[derive(Default)]
pub struct InitLaterDataController {
    pending: Mutex<Pending>,
}

impl InitLaterDataController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the target. Later calls are ignored.
    pub fn init_controller(&self, controller: Arc<dyn AsyncDataController>) {
        let cancel = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            if pending.controller.is_some() {
                return;
            }
            pending.controller = Some(controller.clone());
            pending.canceled
        };

        if cancel {
            controller.cancel();
        }
    }

    fn target(&self) -> Option<Arc<dyn AsyncDataController>> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .controller
            .clone()
    }
}

impl AsyncDataController for InitLaterDataController {
    fn cancel(&self) {
        let target = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.canceled = true;
            pending.controller.clone()
        };

        if let Some(target) = target {
            target.cancel();
        }
    }

    fn data_state(&self) -> Option<AsyncDataState> {
        self.target().and_then(|c| c.data_state())
    }
}
