//! Stream multiplexer for worker output.
//!
//! A worker's stdout and stderr are swapped for pipes. One pump thread per
//! stream splits the pipe into lines and forwards each line tagged with the
//! worker pid and stream name:
//!
//! ```text
//! [PID:4242:stdout]Hello from the worker
//! [PID:4242:stderr]warning: something odd
//! ```
//!
//! In a worker the original descriptors are its private output pipe. The
//! controller reads that pipe and re-emits whole lines on its own stdout, so
//! lines from different workers never interleave, whatever their length.
//! Inside one process, tagged lines are serialized by a lock.

use std::fmt;
use std::io::{self, Read, Write};
use std::os::fd::OwnedFd;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::ipc::pipe::{LineSplitter, PipeFd, cloexec_pipe, dup_cloexec, replace_stdio};

/// Only one redirection may own fds 1 and 2 at a time.
static ACTIVE: AtomicBool = AtomicBool::new(false);

/// Held while a tagged line is written, so stdout and stderr lines from one
/// process stay whole on a shared descriptor.
static WRITE_LOCK: Mutex<()> = Mutex::new(());

/// How long dropping a redirection waits for the pumps to drain. A pipe
/// writer inherited by a spawned program keeps a pump alive past this.
const PUMP_DRAIN: Duration = Duration::from_millis(500);

const PREFIX: &str = "[PID:";

/// Which standard stream a line was written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stdout" => Ok(StreamKind::Stdout),
            "stderr" => Ok(StreamKind::Stderr),
            other => Err(Error::Ipc(format!("unknown stream name: {}", other))),
        }
    }
}

/// One line of worker output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub pid: u32,
    pub stream: StreamKind,
    pub text: String,
}

/// Render a line in the tagged wire format (without trailing newline).
pub fn format_multiplexed_line(line: &OutputLine) -> String {
    format!("{}{}:{}]{}", PREFIX, line.pid, line.stream, line.text)
}

/// Parse a tagged line. The trailing newline, if any, is not part of the text.
pub fn parse_multiplexed_line(line: &str) -> Result<OutputLine> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    let invalid = || Error::Ipc(format!("not a multiplexed line: {:?}", line));

    let rest = line.strip_prefix(PREFIX).ok_or_else(invalid)?;
    let (header, text) = rest.split_once(']').ok_or_else(invalid)?;
    let (pid, stream) = header.split_once(':').ok_or_else(invalid)?;

    Ok(OutputLine {
        pid: pid.parse().map_err(|_| invalid())?,
        stream: stream.parse()?,
        text: text.to_string(),
    })
}

/// Write one tagged line and flush it.
pub fn write_multiplexed_line<W: Write>(writer: &mut W, line: &OutputLine) -> io::Result<()> {
    let mut tagged = format_multiplexed_line(line);
    tagged.push('\n');

    let _guard = WRITE_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    writer.write_all(tagged.as_bytes())?;
    writer.flush()
}

/// Where the pump threads deliver lines.
#[derive(Debug, Clone)]
pub enum LineSink {
    /// Tagged text written to the descriptor that was in place before the
    /// redirection.
    Original,
    /// Structured records, used in-process.
    Channel(Sender<OutputLine>),
}

/// Entry point for installing a redirection.
pub struct MultiplexedStream;

impl MultiplexedStream {
    /// Redirect fds 1 and 2 into tagged lines on the original descriptors.
    pub fn setup_stream_redirection() -> Result<StreamRedirect> {
        Self::with_sink(LineSink::Original)
    }

    /// Redirect fds 1 and 2 into `sink`.
    pub fn with_sink(sink: LineSink) -> Result<StreamRedirect> {
        if ACTIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::StreamRedirect(
                "stream redirection is already active in this process".to_string(),
            ));
        }

        flush_std();

        // Partially installed state is rolled back by the guard's Drop.
        let mut guard = StreamRedirect {
            redirected: Vec::with_capacity(2),
        };
        for stream in [StreamKind::Stdout, StreamKind::Stderr] {
            guard.redirected.push(redirect(stream, sink.clone())?);
        }
        Ok(guard)
    }
}

struct Redirected {
    stream: StreamKind,
    saved: OwnedFd,
    pump: Option<JoinHandle<()>>,
}

/// Active redirection. Dropping it restores fds 1 and 2 and drains the pumps.
#[must_use = "the redirection is undone as soon as the guard is dropped"]
pub struct StreamRedirect {
    redirected: Vec<Redirected>,
}

impl fmt::Debug for StreamRedirect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamRedirect")
            .field("streams", &self.redirected.iter().map(|r| r.stream).collect::<Vec<_>>())
            .finish()
    }
}

impl Drop for StreamRedirect {
    fn drop(&mut self) {
        flush_std();

        // Restoring the fd drops our pipe writer, so the pump sees EOF unless
        // a spawned program still holds a copy.
        for entry in &self.redirected {
            let _ = replace_stdio(entry.stream, &entry.saved);
        }

        let deadline = Instant::now() + PUMP_DRAIN;
        for entry in &mut self.redirected {
            let Some(pump) = entry.pump.take() else {
                continue;
            };
            while !pump.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(1));
            }
            if pump.is_finished() {
                let _ = pump.join();
            }
        }

        ACTIVE.store(false, Ordering::SeqCst);
    }
}

fn flush_std() {
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
}

fn redirect_error(what: &str, e: io::Error) -> Error {
    Error::StreamRedirect(format!("{}: {}", what, e))
}

fn redirect(stream: StreamKind, sink: LineSink) -> Result<Redirected> {
    let saved = match stream {
        StreamKind::Stdout => dup_cloexec(io::stdout()),
        StreamKind::Stderr => dup_cloexec(io::stderr()),
    }
    .map_err(|e| redirect_error("dup failed", e))?;

    let (reader, writer) = cloexec_pipe().map_err(|e| redirect_error("pipe failed", e))?;

    // The pump owns its own handle on the original descriptor.
    let out = match sink {
        LineSink::Original => Some(PipeFd::new(
            dup_cloexec(&saved).map_err(|e| redirect_error("dup failed", e))?,
        )),
        LineSink::Channel(_) => None,
    };

    replace_stdio(stream, &writer).map_err(|e| redirect_error("dup2 failed", e))?;
    drop(writer);

    let pid = std::process::id();
    let pump = std::thread::Builder::new()
        .name(format!("firehot-{}-pump", stream))
        .spawn(move || pump_lines(reader, pid, stream, sink, out));

    match pump {
        Ok(handle) => Ok(Redirected {
            stream,
            saved,
            pump: Some(handle),
        }),
        Err(e) => {
            let _ = replace_stdio(stream, &saved);
            Err(redirect_error("failed to start pump thread", e))
        }
    }
}

/// Read the pipe until every writer is gone, emitting one record per line.
///
/// Must not log: its own stderr may be the pipe it is draining.
fn pump_lines(
    mut reader: PipeFd,
    pid: u32,
    stream: StreamKind,
    sink: LineSink,
    mut out: Option<PipeFd>,
) {
    let mut emit = |bytes: Vec<u8>| {
        let line = OutputLine {
            pid,
            stream,
            text: String::from_utf8_lossy(&bytes).into_owned(),
        };
        match (&sink, out.as_mut()) {
            (LineSink::Channel(tx), _) => {
                let _ = tx.send(line);
            }
            (LineSink::Original, Some(file)) => {
                let _ = write_multiplexed_line(file, &line);
            }
            (LineSink::Original, None) => {}
        }
    };

    let mut lines = LineSplitter::default();
    let mut buf = [0u8; 8192];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        lines.push(&buf[..n]);
        while let Some(line) = lines.next_line() {
            emit(line);
        }
    }

    if let Some(rest) = lines.finish() {
        emit(rest);
    }
}
