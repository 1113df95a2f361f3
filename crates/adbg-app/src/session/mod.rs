//! Debug sessions: one attach or launch request and its child debuggers

mod orchestrator;
mod tree;

#[cfg(test)]
mod tests;

pub use orchestrator::DebugSession;
pub use tree::{ChildEntry, DebugSessionTree, SessionPhase};
