//! How a worker process ended.

use std::fmt;

use nix::sys::wait::WaitStatus;
use serde::{Deserialize, Serialize};

/// Reason a worker process terminated, as seen by the controller's `waitpid`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited { code: i32 },
    /// Killed by a signal.
    Signaled {
        signal: i32,
        name: String,
        core_dumped: bool,
    },
    StillAlive,
    Unknown,
}

impl TerminationReason {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited { code: 0 })
    }

    /// Get a human-readable description.
    pub fn description(&self) -> String {
        match self {
            Self::Exited { code } => format!("exited with code {}", code),
            Self::Signaled {
                name, core_dumped, ..
            } => {
                if *core_dumped {
                    format!("was killed by {} (core dumped)", name)
                } else {
                    format!("was killed by {}", name)
                }
            }
            Self::StillAlive => "is still running".to_string(),
            Self::Unknown => "ended for an unknown reason".to_string(),
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

/// Analyze a `WaitStatus` to determine the termination reason.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited { code },
        WaitStatus::Signaled(_, signal, core_dumped) => TerminationReason::Signaled {
            signal: signal as i32,
            name: signal.as_str().to_string(),
            core_dumped,
        },
        WaitStatus::StillAlive => TerminationReason::StillAlive,
        _ => TerminationReason::Unknown,
    }
}
