//! Delivery of worker output to the host.

use std::io::{self, Write};

use crate::execute::ExecutionId;
use crate::ipc::{OutputLine, StreamKind};

/// A worker output line attributed to its execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledOutput {
    pub id: ExecutionId,
    /// The `request_name` given at exec time.
    pub name: String,
    pub line: OutputLine,
}

/// Receives worker output that is not a protocol message.
///
/// Called from the runner's monitor threads, one call per line, in the order
/// a single worker wrote them.
pub trait OutputObserver: Send + Sync {
    fn on_output(&self, output: &LabeledOutput);
}

/// Echoes worker output to the host's own stdout/stderr as `[<name>] <text>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoObserver;

impl OutputObserver for EchoObserver {
    fn on_output(&self, output: &LabeledOutput) {
        let text = format!("[{}] {}\n", output.name, output.line.text);
        let _ = match output.line.stream {
            StreamKind::Stdout => io::stdout().write_all(text.as_bytes()),
            StreamKind::Stderr => io::stderr().write_all(text.as_bytes()),
        };
    }
}
