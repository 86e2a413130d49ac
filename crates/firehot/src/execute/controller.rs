//! The controller process.
//!
//! Launched by the runner as a re-execution of the host binary. It imports
//! every registered module once, then serves fork requests from stdin until
//! it is told to exit or the host goes away. It stays single-threaded so
//! that every fork copies a consistent process.
//!
//! Each worker writes to a private pipe. The controller is the only writer of
//! its own stdout: it relays worker lines whole and reports a worker's exit
//! only after the worker's last line.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::os::fd::AsFd;
use std::path::Path;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork};
use rustc_hash::FxHashMap;
use tracing::{debug, error, info, warn};

use crate::audit;
use crate::config::{CONTROLLER_ROLE, PACKAGE_ENV, ROLE_ENV};
use crate::error::{Error, Result};
use crate::execute::worker::run_worker;
use crate::execute::{TerminationReason, analyze_wait_status};
use crate::ipc::pipe::{cloexec_pipe, replace_stdio};
use crate::ipc::{
    LineSplitter, Message, OutputLine, PipeFd, StreamKind, format_multiplexed_line,
    parse_multiplexed_line, read_message, write_message,
};
use crate::logging::{self, LogConfig};
use crate::registry::Registry;

/// How long to wait for a command before checking for exited workers.
const REAP_INTERVAL_MS: u16 = 50;

/// How long an exited worker's output pipe may stay open before its exit is
/// reported anyway.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Output pipe of one forked worker.
struct WorkerOutput {
    pipe: Option<PipeFd>,
    lines: LineSplitter,
    exited: Option<(TerminationReason, Instant)>,
}

type Workers = FxHashMap<i32, WorkerOutput>;

/// Turn this process into a controller if it was launched as one.
///
/// Call first thing in `main`, with the same registry the host uses. In a
/// normal launch this returns immediately; in a controller launch it never
/// returns.
pub fn run_controller_if_requested(registry: &Registry) {
    if std::env::var(ROLE_ENV).as_deref() != Ok(CONTROLLER_ROLE) {
        return;
    }

    logging::init(LogConfig::for_controller().with_env_overrides());

    let code = match std::env::var(PACKAGE_ENV) {
        Ok(root) => match run_controller(registry, Path::new(&root)) {
            Ok(()) => 0,
            Err(e) => {
                error!("Controller failed: {}", e);
                1
            }
        },
        Err(_) => {
            error!("{} is not set, controller has no package root", PACKAGE_ENV);
            2
        }
    };
    std::process::exit(code);
}

/// Import the registry's modules and serve commands on stdin.
pub fn run_controller(registry: &Registry, root: &Path) -> Result<()> {
    let mut out = io::stdout();
    let started = Instant::now();

    match registry.import_all(root) {
        Ok(module_count) => {
            debug!(
                "Imported {} modules in {:?}",
                module_count,
                started.elapsed()
            );
            write_message(&mut out, &Message::ImportComplete { module_count })?;
        }
        Err(Error::Import { module, message }) => {
            write_message(
                &mut out,
                &Message::ImportError {
                    module: Some(module.clone()),
                    error: message.clone(),
                },
            )?;
            return Err(Error::Import { module, message });
        }
        Err(e) => {
            write_message(
                &mut out,
                &Message::ImportError {
                    module: None,
                    error: e.to_string(),
                },
            )?;
            return Err(e);
        }
    }

    let stdin = File::from(io::stdin().as_fd().try_clone_to_owned()?);
    let mut input = BufReader::new(stdin);
    let mut workers = Workers::default();

    loop {
        reap_workers(&mut out, &mut workers)?;
        report_finished(&mut out, &mut workers)?;

        let ready = wait_ready(&input, &workers)?;
        for pid in ready.workers {
            if let Some(output) = workers.get_mut(&pid) {
                relay_output(&mut out, pid, output)?;
            }
        }
        if !ready.stdin {
            continue;
        }

        let message = match read_message(&mut input) {
            Ok(Some(message)) => message,
            Ok(None) => {
                info!("Host closed the command stream, controller exiting");
                break;
            }
            Err(e) => {
                warn!("Unreadable command: {}", e);
                write_message(
                    &mut out,
                    &Message::UnknownError {
                        error: e.to_string(),
                    },
                )?;
                continue;
            }
        };

        match message {
            Message::ForkRequest {
                request_id,
                request_name,
                module_path,
                pickled_str,
            } => fork_worker(
                registry,
                root,
                &mut out,
                &mut workers,
                request_id,
                request_name,
                module_path,
                &pickled_str,
            )?,
            Message::ExitRequest => {
                info!("Exit requested, controller exiting");
                break;
            }
            other => {
                warn!("Unexpected command: {:?}", other);
                write_message(
                    &mut out,
                    &Message::UnknownError {
                        error: format!("unexpected command: {:?}", other),
                    },
                )?;
            }
        }
    }

    reap_workers(&mut out, &mut workers)?;
    report_finished(&mut out, &mut workers)?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn fork_worker<W: Write>(
    registry: &Registry,
    root: &Path,
    out: &mut W,
    workers: &mut Workers,
    request_id: String,
    request_name: String,
    module_path: Option<String>,
    pickled_str: &str,
) -> Result<()> {
    let (reader, writer) = match cloexec_pipe() {
        Ok(pipe) => pipe,
        Err(e) => {
            error!("Could not create a worker output pipe: {}", e);
            return write_message(
                out,
                &Message::ForkError {
                    request_id,
                    error: e.to_string(),
                },
            );
        }
    };

    audit::check_thread_safety();

    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            // The worker writes only to its own pipe; the controller relays it.
            let installed = replace_stdio(StreamKind::Stdout, &writer)
                .and_then(|()| replace_stdio(StreamKind::Stderr, &writer));
            if installed.is_err() {
                unsafe { libc::_exit(1) }
            }
            drop(writer);
            drop(reader);
            run_worker(registry, root, module_path.as_deref(), pickled_str)
        }
        Ok(ForkResult::Parent { child }) => {
            drop(writer);
            debug!("Forked worker {} for {}", child, request_name);
            workers.insert(
                child.as_raw(),
                WorkerOutput {
                    pipe: Some(reader),
                    lines: LineSplitter::default(),
                    exited: None,
                },
            );
            write_message(
                out,
                &Message::ForkResponse {
                    request_id,
                    request_name,
                    child_pid: child.as_raw(),
                },
            )
        }
        Err(e) => {
            error!("fork() failed: {}", e);
            write_message(
                out,
                &Message::ForkError {
                    request_id,
                    error: e.to_string(),
                },
            )
        }
    }
}

/// Note every worker that has exited since the last call. Workers without an
/// output pipe are reported at once.
fn reap_workers<W: Write>(out: &mut W, workers: &mut Workers) -> Result<()> {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => return Ok(()),
            Ok(status) => {
                let Some(pid) = status.pid() else {
                    continue;
                };
                let reason = analyze_wait_status(status);
                debug!("Worker {} {}", pid, reason);
                match workers.get_mut(&pid.as_raw()) {
                    Some(output) => output.exited = Some((reason, Instant::now())),
                    None => report_exit(out, pid.as_raw(), reason)?,
                }
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Report exited workers whose output is fully relayed. Exit reports always
/// follow the worker's last line, so the host sees an outcome before the exit.
fn report_finished<W: Write>(out: &mut W, workers: &mut Workers) -> Result<()> {
    let finished: Vec<i32> = workers
        .iter()
        .filter(|(_, output)| {
            output
                .exited
                .as_ref()
                .is_some_and(|(_, at)| output.pipe.is_none() || at.elapsed() >= DRAIN_GRACE)
        })
        .map(|(pid, _)| *pid)
        .collect();

    for pid in finished {
        let Some(mut output) = workers.remove(&pid) else {
            continue;
        };
        if output.pipe.is_some() {
            debug!("Worker {} exited but its output is still open, closing it", pid);
        }
        if let Some(rest) = output.lines.finish() {
            relay_line(out, pid, &rest)?;
        }
        if let Some((reason, _)) = output.exited {
            report_exit(out, pid, reason)?;
        }
    }
    Ok(())
}

fn report_exit<W: Write>(out: &mut W, pid: i32, reason: TerminationReason) -> Result<()> {
    write_message(
        out,
        &Message::ChildExited {
            child_pid: pid,
            reason,
        },
    )
}

/// Move whatever the worker's pipe holds to the controller's stdout.
fn relay_output<W: Write>(out: &mut W, pid: i32, output: &mut WorkerOutput) -> Result<()> {
    let Some(pipe) = output.pipe.as_mut() else {
        return Ok(());
    };

    let mut buf = [0u8; 16 * 1024];
    let n = match pipe.read(&mut buf) {
        Ok(n) => n,
        Err(e) => {
            debug!("Reading output of worker {} failed: {}", pid, e);
            0
        }
    };
    if n == 0 {
        output.pipe = None;
        if let Some(rest) = output.lines.finish() {
            relay_line(out, pid, &rest)?;
        }
        return Ok(());
    }

    output.lines.push(&buf[..n]);
    while let Some(line) = output.lines.next_line() {
        relay_line(out, pid, &line)?;
    }
    Ok(())
}

/// Write one worker line on stdout. Lines that bypassed the multiplexer are
/// tagged as the worker's stdout.
fn relay_line<W: Write>(out: &mut W, pid: i32, bytes: &[u8]) -> Result<()> {
    let text = String::from_utf8_lossy(bytes);
    let mut line = match parse_multiplexed_line(&text) {
        Ok(_) => text.into_owned(),
        Err(_) => format_multiplexed_line(&OutputLine {
            pid: pid as u32,
            stream: StreamKind::Stdout,
            text: text.into_owned(),
        }),
    };
    line.push('\n');

    out.write_all(line.as_bytes())
        .and_then(|()| out.flush())
        .map_err(|e| Error::Ipc(format!("Failed to relay worker output: {}", e)))
}

/// Descriptors with something to read after one poll round.
struct Ready {
    stdin: bool,
    workers: Vec<i32>,
}

/// Wait up to the reap interval for a command or worker output. EOF and
/// hangups count as readable.
fn wait_ready(input: &BufReader<File>, workers: &Workers) -> Result<Ready> {
    let buffered = !input.buffer().is_empty();

    let mut pids = Vec::with_capacity(workers.len());
    let mut fds = vec![PollFd::new(input.get_ref().as_fd(), PollFlags::POLLIN)];
    for (pid, output) in workers {
        if let Some(pipe) = &output.pipe {
            pids.push(*pid);
            fds.push(PollFd::new(pipe.as_fd(), PollFlags::POLLIN));
        }
    }

    let timeout = if buffered {
        PollTimeout::ZERO
    } else {
        PollTimeout::from(REAP_INTERVAL_MS)
    };
    match poll(&mut fds, timeout) {
        Ok(_) => {}
        Err(Errno::EINTR) => {
            return Ok(Ready {
                stdin: buffered,
                workers: Vec::new(),
            });
        }
        Err(e) => return Err(e.into()),
    }

    let readable = |fd: &PollFd| {
        fd.revents()
            .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR))
    };
    Ok(Ready {
        stdin: buffered || readable(&fds[0]),
        workers: pids
            .into_iter()
            .zip(&fds[1..])
            .filter(|(_, fd)| readable(fd))
            .map(|(pid, _)| pid)
            .collect(),
    })
}
