//! Child debugger hand-off over NDJSON
//!
//! The binary does not embed lldb or a JDWP debugger. Each child
//! configuration is published as a `child_started` event for the attached
//! front end to act on, and stopping a child publishes `child_stopped`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use adbg_app::launcher::next_child_id;
use adbg_app::{ChildConfig, ChildSessionId, DebuggerLauncher};
use adbg_core::prelude::*;

use super::{EventSink, HeadlessEvent};

#[derive(Debug, Clone, Default)]
pub struct HeadlessLauncher {
    sink: EventSink,
    active: Arc<Mutex<HashSet<ChildSessionId>>>,
}

impl HeadlessLauncher {
    pub fn new(sink: EventSink) -> Self {
        Self {
            sink,
            active: Arc::default(),
        }
    }

    /// Children started and not yet stopped.
    pub fn active(&self) -> usize {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl DebuggerLauncher for HeadlessLauncher {
    async fn start(&self, config: ChildConfig) -> Result<ChildSessionId> {
        let id = next_child_id();
        info!("Handing off {} child {} for pid {}", config.kind(), id, config.pid());
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id);
        self.sink.emit(HeadlessEvent::child_started(id, config));
        Ok(id)
    }

    async fn stop(&self, id: ChildSessionId) -> Result<()> {
        let removed = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        if !removed {
            return Err(Error::invalid_argument(format!(
                "unknown child session {}",
                id
            )));
        }
        self.sink.emit(HeadlessEvent::child_stopped(id));
        Ok(())
    }
}
