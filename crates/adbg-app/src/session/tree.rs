//! Session phases and the child session tree

use adbg_core::DebuggerKind;

use crate::launcher::ChildSessionId;

/// Lifecycle of one debug request. Phases only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionPhase {
    Configuring,
    Resolving,
    Starting,
    Attached,
    Terminating,
    Terminated,
}

impl SessionPhase {
    pub fn is_finished(&self) -> bool {
        matches!(self, SessionPhase::Terminating | SessionPhase::Terminated)
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionPhase::Configuring => "configuring",
            SessionPhase::Resolving => "resolving",
            SessionPhase::Starting => "starting",
            SessionPhase::Attached => "attached",
            SessionPhase::Terminating => "terminating",
            SessionPhase::Terminated => "terminated",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildEntry {
    pub kind: DebuggerKind,
    pub id: ChildSessionId,
}

/// Child debugger sessions started for one request, in start order.
#[derive(Debug, Clone, Default)]
pub struct DebugSessionTree {
    children: Vec<ChildEntry>,
}

impl DebugSessionTree {
    pub fn add(&mut self, kind: DebuggerKind, id: ChildSessionId) {
        self.children.push(ChildEntry { kind, id });
    }

    pub fn children(&self) -> &[ChildEntry] {
        &self.children
    }

    pub fn get(&self, kind: DebuggerKind) -> Option<ChildSessionId> {
        self.children.iter().find(|c| c.kind == kind).map(|c| c.id)
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Remove and return every child.
    pub fn take(&mut self) -> Vec<ChildEntry> {
        std::mem::take(&mut self.children)
    }
}
