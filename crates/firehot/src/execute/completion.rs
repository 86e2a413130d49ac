//! Outcome tracking for forked executions.
//!
//! The runner's monitor threads resolve outcomes as protocol messages come
//! in; `communicate` blocks on the condition variable until its execution
//! reaches a terminal state. The first resolution of an execution wins.

use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use uuid::Uuid;

use crate::codec::Value;
use crate::error::{Error, Result};
use crate::execute::{ChildFailure, TerminationReason};
use crate::ipc::OutputLine;

/// Identifier of one isolated execution (UUID v4).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutionId(String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for ExecutionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ExecutionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Terminal state of an execution.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Succeeded(Value),
    /// The callable raised, or the call could not be set up.
    Failed(ChildFailure),
    /// The worker died without reporting.
    Crashed { pid: i32, reason: TerminationReason },
    /// The controller was rebuilt while the execution was running.
    ControllerRestarted,
    /// The runner was stopped while the execution was running.
    Stopped,
}

impl ExecutionOutcome {
    pub fn into_result(self) -> Result<Value> {
        match self {
            ExecutionOutcome::Succeeded(value) => Ok(value),
            ExecutionOutcome::Failed(failure) => Err(failure.into()),
            ExecutionOutcome::Crashed { pid, reason } => Err(Error::WorkerCrashed { pid, reason }),
            ExecutionOutcome::ControllerRestarted => Err(Error::ControllerRestarted),
            ExecutionOutcome::Stopped => Err(Error::Stopped),
        }
    }
}

struct Record {
    pid: i32,
    outcome: Option<ExecutionOutcome>,
}

struct Worker {
    id: ExecutionId,
    name: String,
}

#[derive(Default)]
struct Table {
    records: FxHashMap<ExecutionId, Record>,
    /// Live workers by pid. An entry goes away when the worker's exit is
    /// reported, which the controller sends after the worker's last line.
    workers: FxHashMap<i32, Worker>,
}

/// Output line resolved to the execution that produced it.
pub(crate) struct Attributed {
    pub id: ExecutionId,
    pub name: String,
    pub line: OutputLine,
}

#[derive(Default)]
pub(crate) struct Completions {
    table: Mutex<Table>,
    changed: Condvar,
}

impl Completions {
    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Track a freshly forked worker.
    pub fn register(&self, id: ExecutionId, name: &str, pid: i32) {
        let mut table = self.lock();
        table.records.insert(
            id.clone(),
            Record {
                pid,
                outcome: None,
            },
        );
        table.workers.insert(
            pid,
            Worker {
                id,
                name: name.to_string(),
            },
        );
    }

    /// Attribute a line to the live worker that wrote it.
    pub fn attribute(&self, line: OutputLine) -> Option<Attributed> {
        let table = self.lock();
        let worker = table.workers.get(&(line.pid as i32))?;
        Some(Attributed {
            id: worker.id.clone(),
            name: worker.name.clone(),
            line,
        })
    }

    /// Set the outcome unless one is already set. Returns whether it took.
    pub fn resolve(&self, id: &ExecutionId, outcome: ExecutionOutcome) -> bool {
        let mut table = self.lock();
        let Some(record) = table.records.get_mut(id) else {
            return false;
        };
        if record.outcome.is_some() {
            return false;
        }
        record.outcome = Some(outcome);
        self.changed.notify_all();
        true
    }

    /// The controller reaped `pid`. Its attribution is dropped, so a later
    /// worker that reuses the pid starts clean. An execution that never
    /// reported becomes a crash; its id is returned.
    pub fn worker_exited(&self, pid: i32, reason: TerminationReason) -> Option<ExecutionId> {
        let mut table = self.lock();
        let worker = table.workers.remove(&pid)?;
        let record = table.records.get_mut(&worker.id)?;
        if record.outcome.is_some() {
            return None;
        }
        record.outcome = Some(ExecutionOutcome::Crashed { pid, reason });
        self.changed.notify_all();
        Some(worker.id)
    }

    /// Resolve every execution still running. Returns how many there were.
    pub fn invalidate_pending(&self, outcome: ExecutionOutcome) -> usize {
        let mut table = self.lock();
        let mut count = 0;
        for record in table.records.values_mut() {
            if record.outcome.is_none() {
                record.outcome = Some(outcome.clone());
                count += 1;
            }
        }
        self.changed.notify_all();
        count
    }

    /// Pids of every worker whose exit has not been seen, whether or not it
    /// already reported an outcome.
    pub fn live_workers(&self) -> Vec<i32> {
        self.lock().workers.keys().copied().collect()
    }

    /// Forget pid attribution, for a controller that is going away.
    pub fn clear_workers(&self) {
        self.lock().workers.clear();
    }

    /// Drop an execution. Returns its pid if it was still running.
    pub fn remove(&self, id: &ExecutionId) -> Option<Option<i32>> {
        let mut table = self.lock();
        let record = table.records.remove(id)?;
        self.changed.notify_all();
        Some(record.outcome.is_none().then_some(record.pid))
    }

    /// Wait for the outcome of `id` and consume it.
    ///
    /// On timeout the record stays in place so the caller may retry.
    pub fn wait(&self, id: &ExecutionId, timeout: Duration) -> Result<ExecutionOutcome> {
        let deadline = Instant::now() + timeout;
        let mut table = self.lock();
        loop {
            let Some(record) = table.records.get(id) else {
                return Err(Error::HandleNotFound(id.to_string()));
            };
            if record.outcome.is_some() {
                let outcome = table.records.remove(id).and_then(|r| r.outcome);
                return outcome.ok_or_else(|| Error::HandleNotFound(id.to_string()));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(timeout, format!("execution {}", id)));
            }
            table = match self.changed.wait_timeout(table, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        self.lock()
            .records
            .values()
            .filter(|r| r.outcome.is_none())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::StreamKind;
    use std::sync::Arc;
    use std::thread;

    fn line(pid: u32, text: &str) -> OutputLine {
        OutputLine {
            pid,
            stream: StreamKind::Stdout,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_first_resolution_wins_and_is_consumed_once() {
        let completions = Completions::default();
        let id = ExecutionId::new();
        completions.register(id.clone(), "greet", 100);

        assert!(completions.resolve(&id, ExecutionOutcome::Succeeded(Value::from("first"))));
        assert!(!completions.resolve(&id, ExecutionOutcome::Stopped));
        assert!(completions.worker_exited(100, TerminationReason::Exited { code: 0 }).is_none());

        let outcome = completions.wait(&id, Duration::from_millis(10)).unwrap();
        assert_eq!(outcome, ExecutionOutcome::Succeeded(Value::from("first")));
        assert!(matches!(
            completions.wait(&id, Duration::from_millis(10)),
            Err(Error::HandleNotFound(_))
        ));
    }

    #[test]
    fn test_timeout_keeps_record() {
        let completions = Completions::default();
        let id = ExecutionId::new();
        completions.register(id.clone(), "slow", 101);

        assert!(matches!(
            completions.wait(&id, Duration::from_millis(20)),
            Err(Error::Timeout(..))
        ));
        assert_eq!(completions.pending_count(), 1);

        completions.resolve(&id, ExecutionOutcome::Succeeded(Value::Null));
        assert!(completions.wait(&id, Duration::from_millis(20)).is_ok());
    }

    #[test]
    fn test_exit_without_report_is_a_crash() {
        let completions = Completions::default();
        let id = ExecutionId::new();
        completions.register(id.clone(), "crasher", 102);

        let reason = TerminationReason::Signaled {
            signal: libc::SIGABRT,
            name: "SIGABRT".to_string(),
            core_dumped: false,
        };
        assert_eq!(completions.worker_exited(102, reason.clone()), Some(id.clone()));

        let err = completions
            .wait(&id, Duration::from_millis(10))
            .unwrap()
            .into_result()
            .unwrap_err();
        assert!(matches!(err, Error::WorkerCrashed { pid: 102, reason: r } if r == reason));
    }

    #[test]
    fn test_wait_wakes_on_resolution() {
        let completions = Arc::new(Completions::default());
        let id = ExecutionId::new();
        completions.register(id.clone(), "bg", 103);

        let resolver = {
            let completions = completions.clone();
            let id = id.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                completions.resolve(&id, ExecutionOutcome::Succeeded(Value::from(7)));
            })
        };

        let outcome = completions.wait(&id, Duration::from_secs(5)).unwrap();
        assert_eq!(outcome, ExecutionOutcome::Succeeded(Value::from(7)));
        resolver.join().unwrap();
    }

    #[test]
    fn test_output_from_unknown_pid_is_not_attributed() {
        let completions = Completions::default();
        assert!(completions.attribute(line(104, "stray")).is_none());

        let id = ExecutionId::new();
        completions.register(id.clone(), "named", 104);
        let attributed = completions.attribute(line(104, "hello")).unwrap();
        assert_eq!(attributed.id, id);
        assert_eq!(attributed.name, "named");
    }

    #[test]
    fn test_reused_pid_belongs_to_the_new_worker() {
        let completions = Completions::default();
        let first = ExecutionId::new();
        completions.register(first.clone(), "first", 200);
        completions.resolve(&first, ExecutionOutcome::Succeeded(Value::from(1)));
        completions.wait(&first, Duration::ZERO).unwrap();
        assert!(completions.worker_exited(200, TerminationReason::Exited { code: 0 }).is_none());

        // Nothing is attributed to a pid between its exit and its reuse.
        assert!(completions.attribute(line(200, "late")).is_none());
        assert!(completions.live_workers().is_empty());

        let second = ExecutionId::new();
        completions.register(second.clone(), "second", 200);
        let attributed = completions.attribute(line(200, "mine")).unwrap();
        assert_eq!(attributed.id, second);
        assert!(completions.resolve(&second, ExecutionOutcome::Succeeded(Value::from(2))));
        assert!(completions.worker_exited(200, TerminationReason::Exited { code: 0 }).is_none());
        assert_eq!(
            completions.wait(&second, Duration::ZERO).unwrap(),
            ExecutionOutcome::Succeeded(Value::from(2))
        );
    }

    #[test]
    fn test_live_workers_include_finished_but_running() {
        let completions = Completions::default();
        let reported = ExecutionId::new();
        let exited = ExecutionId::new();
        completions.register(reported.clone(), "reported", 301);
        completions.register(exited.clone(), "exited", 302);
        completions.resolve(&reported, ExecutionOutcome::Succeeded(Value::Null));
        completions.worker_exited(302, TerminationReason::Exited { code: 1 });

        assert_eq!(completions.live_workers(), vec![301]);
        completions.clear_workers();
        assert!(completions.live_workers().is_empty());
    }

    #[test]
    fn test_invalidate_pending_only_touches_running() {
        let completions = Completions::default();
        let done = ExecutionId::new();
        let running = ExecutionId::new();
        completions.register(done.clone(), "done", 105);
        completions.register(running.clone(), "running", 106);
        completions.resolve(&done, ExecutionOutcome::Succeeded(Value::Null));

        assert_eq!(completions.invalidate_pending(ExecutionOutcome::ControllerRestarted), 1);

        assert!(matches!(
            completions.wait(&running, Duration::ZERO).unwrap().into_result(),
            Err(Error::ControllerRestarted)
        ));
        assert!(completions.wait(&done, Duration::ZERO).unwrap().into_result().is_ok());
    }

    #[test]
    fn test_remove_reports_running_pid() {
        let completions = Completions::default();
        let id = ExecutionId::new();
        completions.register(id.clone(), "victim", 107);

        assert_eq!(completions.remove(&id), Some(Some(107)));
        assert_eq!(completions.remove(&id), None);
    }
}
