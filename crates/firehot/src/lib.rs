//! Hot re-execution of package code from a warm, forked controller.
//!
//! This crate provides:
//! - A controller process that runs expensive module imports once
//! - Forked workers that each run one registered function from that warm state
//! - A call codec that ships function references and arguments to workers
//! - Tagged multiplexing of worker stdout/stderr
//! - A pre-fork thread audit
//! - Change detection that rebuilds the controller when the package changes
//!
//! A host binary registers its modules, hands control to the controller loop
//! when it was launched as one, and otherwise drives an [`ImportRunner`]:
//!
//! ```no_run
//! use firehot::{CallArgs, CallError, FunctionRef, ImportRunner, Registry, RunnerConfig, Value};
//!
//! fn greet(args: &[Value]) -> Result<Value, CallError> {
//!     let name = args.first().and_then(Value::as_str).unwrap_or("world");
//!     Ok(Value::from(format!("Hello, {}!", name)))
//! }
//!
//! fn main() -> firehot::Result<()> {
//!     let mut registry = Registry::new();
//!     registry.module("app.greetings").function("greet", greet);
//!     firehot::run_controller_if_requested(&registry);
//!
//!     let runner = ImportRunner::start(&registry, ".", RunnerConfig::from_env())?;
//!     let id = runner.exec(&FunctionRef::new("app.greetings", "greet"), CallArgs::one("World"))?;
//!     assert_eq!(runner.communicate(&id)?, Value::from("Hello, World!"));
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod codec;
pub mod config;
pub mod error;
pub mod execute;
pub mod host;
pub mod ipc;
pub mod logging;
pub mod package;
pub mod registry;

pub use codec::{CallArgs, SerializedCall, Value, decode_call, encode_call};
pub use config::{IgnoreRules, RunnerConfig};
pub use error::{Error, Result};
pub use execute::{
    ChildFailure, EchoObserver, ExecutionId, ExecutionOutcome, ImportRunner, LabeledOutput,
    OutputObserver, TerminationReason, run_controller_if_requested,
};
pub use host::RunnerId;
pub use ipc::{LineSink, MultiplexedStream, OutputLine, StreamKind, StreamRedirect};
pub use registry::{CallError, FunctionRef, Registry};
