//! Inter-process communication between the host, the controller and workers.
//!
//! This module provides the JSON-line protocol spoken over the controller's
//! stdin/stdout, the stream multiplexer that tags worker output, and the
//! close-on-exec pipe plumbing both are built on.

pub mod multiplex;
pub mod pipe;
pub mod protocol;

pub use multiplex::{
    LineSink, MultiplexedStream, OutputLine, StreamKind, StreamRedirect, format_multiplexed_line,
    parse_multiplexed_line, write_multiplexed_line,
};
pub use pipe::{LineSplitter, PipeFd};
pub use protocol::{FailureKind, Message, read_message, write_message};
