//! Host side of the controller.
//!
//! An [`ImportRunner`] owns one controller process for one package root.
//! Two monitor threads read the controller's stdout and stderr; they answer
//! fork acknowledgements, resolve execution outcomes and hand worker output
//! to the configured [`OutputObserver`].

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use rustc_hash::FxHashMap;
use tracing::{debug, error, info, trace, warn};

use crate::codec::{self, CallArgs, Value};
use crate::config::{CONTROLLER_ROLE, PACKAGE_ENV, ROLE_ENV, RunnerConfig};
use crate::error::{Error, Result};
use crate::execute::completion::{Attributed, Completions};
use crate::execute::{ChildFailure, ExecutionId, ExecutionOutcome, LabeledOutput, OutputObserver};
use crate::ipc::{Message, OutputLine, StreamKind, parse_multiplexed_line, write_message};
use crate::package::{self, Fingerprint};
use crate::registry::{FunctionRef, Registry};

/// Time a worker gets between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_millis(100);

/// Runs registered functions in processes forked from a warm controller.
///
/// ```no_run
/// use firehot::{CallArgs, FunctionRef, ImportRunner, Registry, RunnerConfig};
///
/// # fn main() -> firehot::Result<()> {
/// let registry = Registry::new();
/// firehot::run_controller_if_requested(&registry);
///
/// let runner = ImportRunner::start(&registry, "path/to/package", RunnerConfig::from_env())?;
/// let id = runner.exec(&FunctionRef::new("pkg.tasks", "rebuild"), CallArgs::none())?;
/// let value = runner.communicate(&id)?;
/// println!("{}", value);
/// runner.stop()?;
/// # Ok(())
/// # }
/// ```
pub struct ImportRunner {
    root: PathBuf,
    config: RunnerConfig,
    module_count: usize,
    completions: Arc<Completions>,
    state: Mutex<RunnerState>,
}

struct RunnerState {
    controller: Option<Controller>,
    fingerprint: Fingerprint,
    stopped: bool,
}

impl ImportRunner {
    /// Boot a controller for `package_path`.
    ///
    /// # Errors
    /// - [`Error::PathNotFound`] if the package root does not exist.
    /// - [`Error::Import`] if a module's import hook fails in the controller.
    /// - [`Error::Spawn`] / [`Error::Timeout`] if the controller cannot be started.
    pub fn start(
        registry: &Registry,
        package_path: impl AsRef<Path>,
        config: RunnerConfig,
    ) -> Result<Self> {
        if std::env::var(ROLE_ENV).as_deref() == Ok(CONTROLLER_ROLE) {
            return Err(Error::Spawn(
                "refusing to start a runner inside a controller; call run_controller_if_requested at the top of main".to_string(),
            ));
        }

        let root = package::resolve_root(package_path.as_ref())?;
        let fingerprint = Fingerprint::scan(&root, &config.ignore)?;
        debug!("Fingerprinted {} files under {}", fingerprint.len(), root.display());

        let completions = Arc::new(Completions::default());
        let module_count = registry.module_paths().len();
        let controller = Controller::spawn(&root, &config, module_count, &completions)?;

        Ok(Self {
            root,
            config,
            module_count,
            completions,
            state: Mutex::new(RunnerState {
                controller: Some(controller),
                fingerprint,
                stopped: false,
            }),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, RunnerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn package_root(&self) -> &Path {
        &self.root
    }

    /// Process id of the current controller.
    pub fn controller_pid(&self) -> Option<u32> {
        self.lock_state().controller.as_ref().map(|c| c.child.id())
    }

    /// Fork a worker that runs `func(args)`. Returns once the fork is
    /// acknowledged, without waiting for the call.
    pub fn exec(&self, func: &FunctionRef, args: CallArgs) -> Result<ExecutionId> {
        self.exec_named(func, args, func.name())
    }

    /// Like [`exec`](Self::exec), labelling the worker's output with `name`.
    pub fn exec_named(&self, func: &FunctionRef, args: CallArgs, name: &str) -> Result<ExecutionId> {
        let pickled_str = codec::encode_call(func, args)?;

        let mut state = self.lock_state();
        let controller = state.controller.as_mut().ok_or(Error::Stopped)?;

        let id = ExecutionId::new();
        let (tx, rx) = mpsc::channel();
        controller.shared.forks().insert(id.to_string(), tx);

        let request = Message::ForkRequest {
            request_id: id.to_string(),
            request_name: name.to_string(),
            module_path: func.module().map(str::to_string),
            pickled_str,
        };
        if let Err(e) = write_message(&mut controller.stdin, &request) {
            controller.shared.forks().remove(id.as_str());
            return Err(e);
        }

        match rx.recv_timeout(self.config.fork_timeout) {
            Ok(Ok(pid)) => {
                debug!("Execution {} ({}) running in worker {}", id, func, pid);
                Ok(id)
            }
            Ok(Err(e)) => Err(e),
            Err(RecvTimeoutError::Timeout) => {
                if controller.shared.forks().remove(id.as_str()).is_none() {
                    // The acknowledgement arrived while timing out and is
                    // being delivered.
                    if let Ok(Ok(pid)) = rx.recv() {
                        debug!("Execution {} ({}) running in worker {}", id, func, pid);
                        return Ok(id);
                    }
                }
                Err(Error::Timeout(
                    self.config.fork_timeout,
                    format!("fork acknowledgement for {}", func),
                ))
            }
            Err(RecvTimeoutError::Disconnected) => Err(Error::Ipc(
                "controller exited before acknowledging the fork".to_string(),
            )),
        }
    }

    /// Wait for the outcome of an execution and consume it.
    ///
    /// A second call for the same id returns [`Error::HandleNotFound`]. On
    /// [`Error::Timeout`] the execution stays tracked and may be waited on
    /// again.
    pub fn communicate(&self, id: &ExecutionId) -> Result<Value> {
        let outcome = self
            .completions
            .wait(id, self.config.communicate_timeout)?;
        trace!("Execution {} finished: {:?}", id, outcome);
        outcome.into_result()
    }

    /// Terminate one execution's worker and forget the execution.
    ///
    /// Returns `false` if the id is unknown.
    pub fn stop_isolated(&self, id: &ExecutionId) -> Result<bool> {
        match self.completions.remove(id) {
            None => {
                warn!("No execution found with id {}", id);
                Ok(false)
            }
            Some(None) => {
                debug!("Execution {} had already finished", id);
                Ok(true)
            }
            Some(Some(pid)) => {
                info!("Stopping execution {} (worker {})", id, pid);
                terminate_worker(pid);
                Ok(true)
            }
        }
    }

    /// Rebuild the controller if files under the package root changed.
    ///
    /// Executions still running are resolved as
    /// [`Error::ControllerRestarted`] and their workers are killed. Returns
    /// whether a rebuild happened.
    pub fn update_environment(&self) -> Result<bool> {
        let mut state = self.lock_state();
        if state.stopped {
            return Err(Error::Stopped);
        }

        info!("Checking for environment updates...");
        let fingerprint = Fingerprint::scan(&self.root, &self.config.ignore)?;
        let diff = state.fingerprint.diff(&fingerprint);

        if diff.is_empty() && state.controller.is_some() {
            info!("No changes to the package detected");
            return Ok(false);
        }
        info!(
            "Detected package changes. Added: {:?}, Removed: {:?}, Modified: {:?}",
            diff.added, diff.removed, diff.modified
        );

        self.completions
            .invalidate_pending(ExecutionOutcome::ControllerRestarted);
        kill_workers(&self.completions.live_workers());
        if let Some(old) = state.controller.take() {
            old.shutdown(self.config.shutdown_grace);
        }
        self.completions.clear_workers();

        state.controller = Some(Controller::spawn(
            &self.root,
            &self.config,
            self.module_count,
            &self.completions,
        )?);
        state.fingerprint = fingerprint;

        info!("Environment updated successfully");
        Ok(true)
    }

    /// Stop every worker and the controller.
    ///
    /// Executions still running resolve as [`Error::Stopped`]. Returns
    /// `false` if the runner was already stopped.
    pub fn stop(&self) -> Result<bool> {
        let mut state = self.lock_state();
        if state.stopped {
            return Ok(false);
        }
        state.stopped = true;

        self.completions.invalidate_pending(ExecutionOutcome::Stopped);
        kill_workers(&self.completions.live_workers());
        if let Some(controller) = state.controller.take() {
            controller.shutdown(self.config.shutdown_grace);
        }
        self.completions.clear_workers();

        info!("Runner for {} stopped", self.root.display());
        Ok(true)
    }
}

impl Drop for ImportRunner {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Failed to stop runner: {}", e);
        }
    }
}

/// SIGTERM, then SIGKILL if the worker is still there after a grace period.
fn terminate_worker(pid: i32) {
    let pid = Pid::from_raw(pid);
    if let Err(e) = kill(pid, Signal::SIGTERM) {
        debug!("SIGTERM to worker {} failed: {}", pid, e);
        let _ = kill(pid, Signal::SIGKILL);
        return;
    }

    let deadline = Instant::now() + TERM_GRACE;
    while Instant::now() < deadline {
        if kill(pid, None::<Signal>).is_err() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    let _ = kill(pid, Signal::SIGKILL);
}

fn kill_workers(pids: &[i32]) {
    for &pid in pids {
        debug!("Killing worker {}", pid);
        let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
    }
}

/// State shared between the runner and one controller's monitor threads.
struct Shared {
    completions: Arc<Completions>,
    observer: Arc<dyn OutputObserver>,
    forks: Mutex<FxHashMap<String, Sender<Result<i32>>>>,
    boot: Mutex<Option<Sender<Result<usize>>>>,
}

impl Shared {
    fn forks(&self) -> MutexGuard<'_, FxHashMap<String, Sender<Result<i32>>>> {
        self.forks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn finish_boot(&self, result: Result<usize>) {
        let sender = self.boot.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(tx) = sender {
            let _ = tx.send(result);
        }
    }
}

/// One running controller process.
struct Controller {
    child: Child,
    stdin: ChildStdin,
    shared: Arc<Shared>,
    monitors: Vec<JoinHandle<()>>,
}

impl Controller {
    fn spawn(
        root: &Path,
        config: &RunnerConfig,
        expected_modules: usize,
        completions: &Arc<Completions>,
    ) -> Result<Self> {
        let program = config.controller_program()?;
        let started = Instant::now();

        let mut child = Command::new(&program)
            .env(ROLE_ENV, CONTROLLER_ROLE)
            .env(PACKAGE_ENV, root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Spawn(format!("{}: {}", program.display(), e)))?;

        let (stdin, stdout, stderr) =
            match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
                (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
                _ => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(Error::Spawn("controller pipes not captured".to_string()));
                }
            };

        let (boot_tx, boot_rx) = mpsc::channel();
        let shared = Arc::new(Shared {
            completions: completions.clone(),
            observer: config.observer.clone(),
            forks: Mutex::new(FxHashMap::default()),
            boot: Mutex::new(Some(boot_tx)),
        });

        let mut controller = Self {
            child,
            stdin,
            shared: shared.clone(),
            monitors: Vec::with_capacity(2),
        };
        for (stream, reader) in [
            (StreamKind::Stdout, Box::new(stdout) as Box<dyn Read + Send>),
            (StreamKind::Stderr, Box::new(stderr) as Box<dyn Read + Send>),
        ] {
            let shared = shared.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("firehot-controller-{}", stream))
                .spawn(move || monitor(shared, stream, BufReader::new(reader)));
            match spawned {
                Ok(handle) => controller.monitors.push(handle),
                Err(e) => {
                    controller.shutdown(Duration::ZERO);
                    return Err(Error::Spawn(format!("failed to start monitor thread: {}", e)));
                }
            }
        }

        let pid = controller.child.id();
        match boot_rx.recv_timeout(config.boot_timeout) {
            Ok(Ok(module_count)) => {
                if module_count != expected_modules {
                    warn!(
                        "Controller {} imported {} modules, the host registered {}; is it built from the same registry?",
                        pid, module_count, expected_modules
                    );
                }
                info!(
                    "Controller {} booted in {:?} ({} modules)",
                    pid,
                    started.elapsed(),
                    module_count
                );
                Ok(controller)
            }
            Ok(Err(e)) => {
                error!("Controller {} failed to boot: {}", pid, e);
                controller.shutdown(Duration::ZERO);
                Err(e)
            }
            Err(RecvTimeoutError::Timeout) => {
                controller.shutdown(Duration::ZERO);
                Err(Error::Timeout(
                    config.boot_timeout,
                    "controller imports".to_string(),
                ))
            }
            Err(RecvTimeoutError::Disconnected) => {
                controller.shutdown(Duration::ZERO);
                Err(Error::Spawn("controller exited during boot".to_string()))
            }
        }
    }

    /// Ask the controller to exit, kill it after `grace`, and join the monitors.
    fn shutdown(mut self, grace: Duration) {
        let pid = self.child.id();
        if let Err(e) = write_message(&mut self.stdin, &Message::ExitRequest) {
            debug!("Controller {} did not take the exit request: {}", pid, e);
        }
        drop(self.stdin);

        let deadline = Instant::now() + grace;
        let exited = loop {
            match self.child.try_wait() {
                Ok(Some(_)) => break true,
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                _ => break false,
            }
        };
        if !exited {
            debug!("Killing controller {}", pid);
            let _ = self.child.kill();
            let _ = self.child.wait();
        }

        for monitor in self.monitors {
            let _ = monitor.join();
        }
    }
}

/// Read one controller stream until EOF.
fn monitor(shared: Arc<Shared>, stream: StreamKind, mut reader: impl BufRead) {
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Controller {} read failed: {}", stream, e);
                break;
            }
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\n', '\r']);

        if let Ok(tagged) = parse_multiplexed_line(line) {
            handle_worker_line(&shared, tagged);
        } else if stream == StreamKind::Stdout {
            handle_controller_line(&shared, line);
        } else if !line.is_empty() {
            info!(target: "firehot::controller", "{}", line);
        }
    }

    if stream == StreamKind::Stdout {
        shared.finish_boot(Err(Error::Spawn(
            "controller exited before finishing imports".to_string(),
        )));
        for (_, tx) in shared.forks().drain() {
            let _ = tx.send(Err(Error::Ipc("controller exited".to_string())));
        }
    }
}

fn handle_controller_line(shared: &Shared, line: &str) {
    let message = match Message::from_line(line) {
        Ok(message) => message,
        Err(_) => {
            if !line.trim().is_empty() {
                debug!("Controller stdout: {}", line);
            }
            return;
        }
    };

    match message {
        Message::ImportComplete { module_count } => shared.finish_boot(Ok(module_count)),
        Message::ImportError { module, error } => shared.finish_boot(Err(Error::Import {
            module: module.unwrap_or_else(|| "<unknown>".to_string()),
            message: error,
        })),
        Message::ForkResponse {
            request_id,
            request_name,
            child_pid,
        } => {
            let Some(tx) = shared.forks().remove(&request_id) else {
                // The caller gave up waiting, so nobody can collect this one.
                warn!(
                    "Fork {} acknowledged after its caller timed out, killing worker {}",
                    request_id, child_pid
                );
                let _ = kill(Pid::from_raw(child_pid), Signal::SIGKILL);
                return;
            };
            shared.completions.register(
                ExecutionId::from(request_id.as_str()),
                &request_name,
                child_pid,
            );
            let _ = tx.send(Ok(child_pid));
        }
        Message::ForkError { request_id, error } => {
            if let Some(tx) = shared.forks().remove(&request_id) {
                let _ = tx.send(Err(Error::Ipc(format!("fork failed: {}", error))));
            }
        }
        Message::ChildExited { child_pid, reason } => {
            trace!("Worker {} {}", child_pid, reason);
            if let Some(id) = shared.completions.worker_exited(child_pid, reason.clone()) {
                warn!("Execution {}: worker {} {} before reporting", id, child_pid, reason);
            }
        }
        Message::UnknownError { error } => warn!("Controller reported: {}", error),
        other => debug!("Ignoring controller message: {:?}", other),
    }
}

fn handle_worker_line(shared: &Shared, line: OutputLine) {
    let pid = line.pid;
    match shared.completions.attribute(line) {
        Some(output) => dispatch(shared, output),
        None => debug!("Dropping output from unknown worker {}", pid),
    }
}

/// Route one attributed worker line: outcome messages resolve the
/// execution, anything else goes to the observer.
fn dispatch(shared: &Shared, output: Attributed) {
    if output.line.stream == StreamKind::Stdout
        && let Ok(message) = Message::from_line(&output.line.text)
    {
        let outcome = match message {
            Message::ChildComplete { result } => match result {
                Some(text) => match codec::decode_value(&text) {
                    Ok(value) => ExecutionOutcome::Succeeded(value),
                    Err(e) => ExecutionOutcome::Failed(ChildFailure::setup(format!(
                        "result could not be decoded: {}",
                        e
                    ))),
                },
                None => ExecutionOutcome::Succeeded(Value::Null),
            },
            Message::ChildError {
                kind,
                class,
                error,
                traceback,
            } => ExecutionOutcome::Failed(ChildFailure {
                kind,
                class,
                message: error,
                traceback,
            }),
            other => {
                debug!("Ignoring worker message: {:?}", other);
                return;
            }
        };
        if !shared.completions.resolve(&output.id, outcome) {
            debug!("Execution {} already resolved", output.id);
        }
        return;
    }

    shared.observer.on_output(&LabeledOutput {
        id: output.id,
        name: output.name,
        line: output.line,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execute::EchoObserver;
    use std::os::unix::process::ExitStatusExt;

    fn shared() -> Shared {
        Shared {
            completions: Arc::new(Completions::default()),
            observer: Arc::new(EchoObserver),
            forks: Mutex::new(FxHashMap::default()),
            boot: Mutex::new(None),
        }
    }

    fn fork_response(request_id: &str, child_pid: i32) -> String {
        Message::ForkResponse {
            request_id: request_id.to_string(),
            request_name: "late".to_string(),
            child_pid,
        }
        .to_line()
        .unwrap()
    }

    #[test]
    fn test_acknowledged_fork_is_registered() {
        let shared = shared();
        let (tx, rx) = mpsc::channel();
        shared.forks().insert("req-1".to_string(), tx);

        handle_controller_line(&shared, fork_response("req-1", 4321).trim_end());

        assert_eq!(rx.recv().unwrap().unwrap(), 4321);
        assert_eq!(shared.completions.live_workers(), vec![4321]);
        assert!(shared.forks().is_empty());
    }

    #[test]
    fn test_late_acknowledgement_kills_the_worker() {
        let shared = shared();
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id() as i32;

        // No sender waiting: the caller already timed out.
        handle_controller_line(&shared, fork_response("req-gone", pid).trim_end());

        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGKILL as i32));
        assert!(shared.completions.live_workers().is_empty());
        assert!(
            shared
                .completions
                .remove(&ExecutionId::from("req-gone"))
                .is_none()
        );
    }
}
