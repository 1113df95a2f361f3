//! Events pushed by supervised subprocesses

/// Output or lifecycle event from a streaming subprocess.
///
/// Readers coalesce lines that are available at the same time into one
/// batch. Exactly one [`ProcessEvent::Exited`] is sent per process, after
/// which no further events arrive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// One or more complete stdout lines
    Stdout(Vec<String>),

    /// One or more complete stderr lines
    Stderr(Vec<String>),

    /// Process has exited
    Exited { code: Option<i32> },
}

impl ProcessEvent {
    pub fn is_exit(&self) -> bool {
        matches!(self, ProcessEvent::Exited { .. })
    }

    /// Lines carried by this event, regardless of stream.
    pub fn lines(&self) -> &[String] {
        match self {
            ProcessEvent::Stdout(lines) | ProcessEvent::Stderr(lines) => lines,
            ProcessEvent::Exited { .. } => &[],
        }
    }
}
