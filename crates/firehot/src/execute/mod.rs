//! Forked execution of registered functions.
//!
//! # Architecture
//!
//! ```text
//! ImportRunner (host)
//!     │
//!     ├── stdin  ── ForkRequest / ExitRequest ──▶ controller
//!     │
//!     └── stdout ◀── ImportComplete / ForkResponse / ChildExited ── controller
//!                ◀── [PID:<pid>:stdout]... ── controller ◀── pipe ── worker
//!
//! controller (re-executed host binary, single-threaded)
//!     │
//!     ├── Registry::import_all  (warm state, once)
//!     │
//!     └── fork() per ForkRequest
//!             │
//!             └── worker: stream multiplexer → child_entrypoint → ChildComplete / ChildError → _exit
//! ```
//!
//! # Module Structure
//!
//! - `completion` - Outcome table `communicate` waits on
//! - `controller` - Controller process loop
//! - `output` - Observer for worker output
//! - `runner` - Host-side `ImportRunner`
//! - `termination` - Wait status analysis
//! - `worker` - Code run inside a forked worker

mod completion;
mod controller;
mod output;
mod runner;
mod termination;
mod worker;

pub use completion::{ExecutionId, ExecutionOutcome};
pub use controller::{run_controller, run_controller_if_requested};
pub use output::{EchoObserver, LabeledOutput, OutputObserver};
pub use runner::ImportRunner;
pub use termination::{TerminationReason, analyze_wait_status};
pub use worker::{ChildFailure, child_entrypoint};
