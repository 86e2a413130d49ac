//! Worker side of an isolated call.
//!
//! A worker is a `fork()` of the warm controller. It decodes one call,
//! refreshes the owning module, runs the function and reports the outcome as
//! a protocol line on stdout, then exits without running any destructors of
//! the state it inherited.

use std::backtrace::Backtrace;
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Mutex;

use crate::codec::{self, Value};
use crate::error::Error;
use crate::ipc::{
    FailureKind, Message, MultiplexedStream, OutputLine, StreamKind, write_multiplexed_line,
};
use crate::registry::Registry;

/// Why an isolated call did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildFailure {
    pub kind: FailureKind,
    /// Error type name, e.g. `ValueError`.
    pub class: String,
    pub message: String,
    pub traceback: Option<String>,
}

impl ChildFailure {
    /// The call could not be set up.
    pub fn setup(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Setup,
            class: "SetupError".to_string(),
            message: message.into(),
            traceback: None,
        }
    }

    fn from_setup_error(err: Error) -> Self {
        let class = match &err {
            Error::ModuleNotFound(_) => "ModuleNotFoundError",
            Error::FunctionNotFound { .. } => "AttributeError",
            Error::Import { .. } => "ImportError",
            Error::Codec(_) => "DecodeError",
            _ => "SetupError",
        };
        Self {
            kind: FailureKind::Setup,
            class: class.to_string(),
            message: err.to_string(),
            traceback: None,
        }
    }

    fn runtime(class: impl Into<String>, message: impl Into<String>, traceback: String) -> Self {
        Self {
            kind: FailureKind::Runtime,
            class: class.into(),
            message: message.into(),
            traceback: Some(traceback),
        }
    }

    /// Protocol form.
    pub fn to_message(&self) -> Message {
        Message::ChildError {
            kind: self.kind,
            class: self.class.clone(),
            error: self.message.clone(),
            traceback: self.traceback.clone(),
        }
    }
}

impl From<ChildFailure> for Error {
    fn from(failure: ChildFailure) -> Self {
        Error::Child {
            class: failure.class,
            message: failure.message,
            traceback: failure.traceback,
        }
    }
}

/// Backtrace of the most recent panic in this process.
static PANIC_TRACE: Mutex<Option<String>> = Mutex::new(None);

fn install_panic_capture() {
    panic::set_hook(Box::new(|_| {
        let trace = Backtrace::force_capture().to_string();
        *PANIC_TRACE.lock().unwrap_or_else(|e| e.into_inner()) = Some(trace);
    }));
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

/// Run one serialized call.
///
/// `module_path` is the binding the controller injected next to the
/// payload; the module path inside the payload takes precedence.
pub fn child_entrypoint(
    registry: &Registry,
    root: &Path,
    module_path: Option<&str>,
    pickled_str: &str,
) -> Result<Value, ChildFailure> {
    let call = codec::decode_call(pickled_str).map_err(ChildFailure::from_setup_error)?;

    let Some(module) = call.module_path.as_deref().or(module_path) else {
        return Err(ChildFailure::setup("No module path provided"));
    };

    tracing::debug!("Importing module: {}", module);
    registry
        .reload(module, root)
        .map_err(ChildFailure::from_setup_error)?;
    let function = registry
        .resolve(module, &call.function_name)
        .map_err(ChildFailure::from_setup_error)?;

    let args = call.args.positional();
    match panic::catch_unwind(AssertUnwindSafe(|| function(&args))) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(ChildFailure::runtime(
            err.class,
            err.message,
            format!("in {}.{}", module, call.function_name),
        )),
        Err(payload) => {
            let trace = PANIC_TRACE
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
                .unwrap_or_default();
            Err(ChildFailure::runtime(
                "Panic",
                panic_message(payload.as_ref()),
                format!("in {}.{}\n{}", module, call.function_name, trace),
            ))
        }
    }
}

/// Body of a freshly forked worker. Never returns.
pub(crate) fn run_worker(
    registry: &Registry,
    root: &Path,
    module_path: Option<&str>,
    pickled_str: &str,
) -> ! {
    install_panic_capture();

    let redirect = match MultiplexedStream::setup_stream_redirection() {
        Ok(guard) => Some(guard),
        Err(e) => {
            tracing::error!("Worker output will not be tagged: {}", e);
            None
        }
    };

    let message = match child_entrypoint(registry, root, module_path, pickled_str) {
        Ok(value) => match codec::encode_value(&value) {
            Ok(result) => Message::ChildComplete {
                result: Some(result),
            },
            Err(e) => ChildFailure::setup(format!("result could not be encoded: {}", e)).to_message(),
        },
        Err(failure) => failure.to_message(),
    };

    // Tear the redirection down first: the pumps end any partial line the
    // callable left behind, so the outcome always starts a line of its own.
    match redirect {
        Some(guard) => drop(guard),
        None => {
            let _ = io::stdout().write_all(b"\n");
        }
    }

    let code = match report_outcome(&mut io::stdout(), &message) {
        Ok(()) => 0,
        Err(_) => 1,
    };
    unsafe { libc::_exit(code) }
}

/// Write the outcome as a tagged stdout line of this process.
fn report_outcome<W: Write>(writer: &mut W, message: &Message) -> crate::error::Result<()> {
    let line = OutputLine {
        pid: std::process::id(),
        stream: StreamKind::Stdout,
        text: message.to_line()?.trim_end().to_string(),
    };
    write_multiplexed_line(writer, &line)?;
    Ok(())
}
