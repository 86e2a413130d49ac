//! Line protocol between the host and the controller process.
//!
//! Every message is one JSON object on one line, tagged by `name`. The host
//! writes requests to the controller's stdin; the controller answers on
//! stdout. Worker lines, outcomes included, are relayed by the controller
//! wrapped in the multiplexer prefix (see [`super::multiplex`]), controller
//! lines arrive bare.

use std::io::{BufRead, Write};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::execute::TerminationReason;

/// Whether a worker failed before or during the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Payload, module or function could not be resolved.
    Setup,
    /// The callable itself raised.
    Runtime,
}

/// Protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name")]
pub enum Message {
    /// Controller finished importing every registered module.
    ImportComplete {
        /// Number of modules imported.
        module_count: usize,
    },

    /// Controller failed to import a module and will exit.
    ImportError {
        module: Option<String>,
        error: String,
    },

    /// Host asks the controller to fork a worker for one call.
    ForkRequest {
        request_id: String,
        /// Label used for the worker's output.
        request_name: String,
        /// Owning module of the callable, injected next to the payload.
        module_path: Option<String>,
        /// Base64 serialized call.
        pickled_str: String,
    },

    /// Controller forked the worker.
    ForkResponse {
        request_id: String,
        request_name: String,
        child_pid: i32,
    },

    /// Controller could not fork.
    ForkError { request_id: String, error: String },

    /// Worker finished the call. `result` is the transport-encoded value.
    ChildComplete { result: Option<String> },

    /// Worker failed.
    ChildError {
        kind: FailureKind,
        class: String,
        error: String,
        traceback: Option<String>,
    },

    /// Controller reaped a worker.
    ChildExited {
        child_pid: i32,
        reason: TerminationReason,
    },

    /// Host asks the controller to exit.
    ExitRequest,

    /// Error that cannot be attributed to a request.
    UnknownError { error: String },
}

impl Message {
    /// Serialize to a JSON line (with newline).
    pub fn to_line(&self) -> Result<String> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from a JSON line.
    pub fn from_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim())?)
    }
}

/// Write one message and flush.
pub fn write_message<W: Write>(writer: &mut W, message: &Message) -> Result<()> {
    let line = message.to_line()?;
    writer
        .write_all(line.as_bytes())
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message: {}", e)))?;
    writer
        .flush()
        .map_err(|e| Error::Ipc(format!("Failed to flush IPC stream: {}", e)))?;
    Ok(())
}

/// Read the next message, skipping blank lines.
///
/// Returns `None` on EOF.
pub fn read_message<R: BufRead>(reader: &mut R) -> Result<Option<Message>> {
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader
            .read_line(&mut line)
            .map_err(|e| Error::Ipc(format!("Failed to read IPC message: {}", e)))?;
        if read == 0 {
            return Ok(None);
        }
        if !line.trim().is_empty() {
            return Message::from_line(&line).map(Some);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_messages_are_tagged_by_name() {
        let line = Message::ForkResponse {
            request_id: "abc".to_string(),
            request_name: "greet".to_string(),
            child_pid: 4242,
        }
        .to_line()
        .unwrap();

        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        let json: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(json["name"], "ForkResponse");
        assert_eq!(json["child_pid"], 4242);
    }

    #[test]
    fn test_read_message_sequence() {
        let mut buf = Vec::new();
        write_message(&mut buf, &Message::ImportComplete { module_count: 3 }).unwrap();
        buf.extend_from_slice(b"\n");
        write_message(
            &mut buf,
            &Message::ChildError {
                kind: FailureKind::Runtime,
                class: "ValueError".to_string(),
                error: "multi\nline".to_string(),
                traceback: None,
            },
        )
        .unwrap();

        let mut cursor = Cursor::new(buf);
        assert_eq!(
            read_message(&mut cursor).unwrap(),
            Some(Message::ImportComplete { module_count: 3 })
        );
        match read_message(&mut cursor).unwrap() {
            Some(Message::ChildError { kind, error, .. }) => {
                assert_eq!(kind, FailureKind::Runtime);
                assert_eq!(error, "multi\nline");
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert_eq!(read_message(&mut cursor).unwrap(), None);
    }

    #[test]
    fn test_plain_output_is_not_a_message() {
        assert!(Message::from_line("Hello stdout!").is_err());
        assert!(Message::from_line(r#"{"name":"NoSuchMessage"}"#).is_err());
    }
}
