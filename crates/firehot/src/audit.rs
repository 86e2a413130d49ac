//! Pre-fork thread audit.
//!
//! `fork()` copies only the calling thread. Any other thread that held a
//! lock at that moment leaves it held forever in the child, which shows up
//! as a deadlock or a corrupted allocator much later. The controller never
//! starts threads, but code run by import hooks might, so every fork is
//! preceded by [`check_thread_safety`].
//!
//! The audit is diagnostic only: it logs, it never fails and never blocks
//! the fork.

use std::backtrace::Backtrace;
use std::io;
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

use tracing::warn;

/// One thread observed just before a fork.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSnapshot {
    pub name: String,
    pub id: u64,
    /// Whether the thread was started as a background (non-joined) thread.
    pub is_daemon: bool,
    pub is_alive: bool,
    pub stack_trace: String,
}

/// Result of an audit.
#[derive(Debug, Clone, Default)]
pub struct ThreadAudit {
    pub threads: Vec<ThreadSnapshot>,
}

impl ThreadAudit {
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn is_single_threaded(&self) -> bool {
        self.threads.len() <= 1
    }
}

struct TrackedThread {
    id: u64,
    name: String,
    daemon: bool,
    entry: &'static str,
    spawn_site: String,
}

static TRACKED: Mutex<Vec<TrackedThread>> = Mutex::new(Vec::new());

fn tracked() -> std::sync::MutexGuard<'static, Vec<TrackedThread>> {
    TRACKED.lock().unwrap_or_else(|e| e.into_inner())
}

/// Removes the table entry when the thread exits, unwinding included.
struct Untrack(u64);

impl Drop for Untrack {
    fn drop(&mut self) {
        tracked().retain(|t| t.id != self.0);
    }
}

/// Spawn a named thread that the audit can describe in detail.
///
/// Untracked threads are reported by kernel name and state only. Tracked
/// ones also carry the entry function and the backtrace of the spawn site.
pub fn spawn_tracked<F, T>(name: &str, daemon: bool, f: F) -> io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let entry = std::any::type_name::<F>();
    let spawn_site = Backtrace::force_capture().to_string();
    let thread_name = name.to_string();

    thread::Builder::new().name(name.to_string()).spawn(move || {
        let id = current_thread_id();
        tracked().push(TrackedThread {
            id,
            name: thread_name,
            daemon,
            entry,
            spawn_site,
        });
        let _untrack = Untrack(id);
        f()
    })
}

/// Enumerate live threads and warn if there is more than one.
pub fn check_thread_safety() -> ThreadAudit {
    let threads = snapshot_threads();
    audit_threads(&threads);
    ThreadAudit { threads }
}

/// Emit the fork-safety warnings for a thread population.
///
/// Returns `true` if warnings were emitted.
pub fn audit_threads(threads: &[ThreadSnapshot]) -> bool {
    if threads.len() <= 1 {
        return false;
    }

    warn!(
        "Detected {} active threads before fork(). This can lead to deadlocks and memory corruption in the child process.",
        threads.len()
    );
    for thread in threads {
        warn!(
            "Name: {}, ID: {}, Daemon: {}, Alive: {}\nStack Trace:\n{}",
            thread.name, thread.id, thread.is_daemon, thread.is_alive, thread.stack_trace
        );
    }
    true
}

fn snapshot_threads() -> Vec<ThreadSnapshot> {
    let current_id = current_thread_id();
    let raw = other_threads(current_id);
    let table = tracked();
    let lookup = |id: u64| table.iter().find(|t| t.id == id);

    let mut others: Vec<ThreadSnapshot> = raw
        .into_iter()
        .map(|(id, kernel_name, state)| match lookup(id) {
            Some(t) => ThreadSnapshot {
                name: t.name.clone(),
                id,
                is_daemon: t.daemon,
                is_alive: state.is_alive(),
                stack_trace: format!("{}\nSpawned at:\n{}", t.entry, t.spawn_site),
            },
            None => ThreadSnapshot {
                name: kernel_name,
                id,
                is_daemon: false,
                is_alive: state.is_alive(),
                stack_trace: format!("<untracked thread, state: {}>", state.0),
            },
        })
        .collect();
    others.sort_by_key(|t| t.id);

    let current = thread::current();
    let mut threads = vec![ThreadSnapshot {
        name: lookup(current_id)
            .map(|t| t.name.clone())
            .or_else(|| current.name().map(str::to_string))
            .unwrap_or_else(|| "unnamed".to_string()),
        id: current_id,
        is_daemon: lookup(current_id).is_some_and(|t| t.daemon),
        is_alive: true,
        stack_trace: current_stack_trace(others.is_empty()),
    }];

    threads.extend(others);
    threads
}

/// The caller's backtrace, or nothing when it is the only thread.
fn current_stack_trace(lone: bool) -> String {
    if lone {
        String::new()
    } else {
        Backtrace::force_capture().to_string()
    }
}

/// Kernel scheduler state, e.g. `S (sleeping)`.
struct TaskState(String);

impl TaskState {
    fn is_alive(&self) -> bool {
        !(self.0.starts_with('Z') || self.0.starts_with('X'))
    }
}

#[cfg(target_os = "linux")]
fn current_thread_id() -> u64 {
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

#[cfg(not(target_os = "linux"))]
fn current_thread_id() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};

    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static ID: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    ID.with(|id| *id)
}

/// Every task of this process except `current`, from `/proc/self/task`.
#[cfg(target_os = "linux")]
fn other_threads(current: u64) -> Vec<(u64, String, TaskState)> {
    let Ok(entries) = std::fs::read_dir("/proc/self/task") else {
        return Vec::new();
    };

    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let id: u64 = entry.file_name().to_str()?.parse().ok()?;
            if id == current {
                return None;
            }
            let dir = entry.path();
            let name = std::fs::read_to_string(dir.join("comm"))
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|_| "unknown".to_string());
            let state = std::fs::read_to_string(dir.join("status"))
                .ok()
                .and_then(|status| {
                    status
                        .lines()
                        .find_map(|line| line.strip_prefix("State:"))
                        .map(|s| s.trim().to_string())
                })
                .unwrap_or_else(|| "unknown".to_string());
            Some((id, name, TaskState(state)))
        })
        .collect()
}

/// Without procfs only tracked threads are visible.
#[cfg(not(target_os = "linux"))]
fn other_threads(current: u64) -> Vec<(u64, String, TaskState)> {
    tracked()
        .iter()
        .filter(|t| t.id != current)
        .map(|t| (t.id, t.name.clone(), TaskState("R (running)".to_string())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    fn capture_warnings<T>(f: impl FnOnce() -> T) -> (T, String) {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();
        let result = tracing::subscriber::with_default(subscriber, f);
        (result, captured.text())
    }

    fn snapshot(name: &str, id: u64, daemon: bool) -> ThreadSnapshot {
        ThreadSnapshot {
            name: name.to_string(),
            id,
            is_daemon: daemon,
            is_alive: true,
            stack_trace: format!("  at {}", name),
        }
    }

    static RUNNING: AtomicBool = AtomicBool::new(false);
    static STOP: AtomicBool = AtomicBool::new(false);

    fn background_function() {
        RUNNING.store(true, Ordering::SeqCst);
        while !STOP.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_single_thread_is_silent() {
        let (warned, output) = capture_warnings(|| audit_threads(&[snapshot("main", 1, false)]));
        assert!(!warned);
        assert!(output.is_empty());
    }

    #[test]
    fn test_warning_format() {
        let threads = [snapshot("main", 1, false), snapshot("background_worker", 2, true)];
        let (warned, output) = capture_warnings(|| audit_threads(&threads));

        assert!(warned);
        assert!(output.contains(
            "Detected 2 active threads before fork(). This can lead to deadlocks and memory corruption in the child process."
        ));
        assert!(output.contains("Name: background_worker, ID: 2, Daemon: true, Alive: true"));
        assert!(output.contains("Name: main, ID: 1, Daemon: false, Alive: true"));
        assert_eq!(output.matches("Stack Trace:").count(), 2);
        assert!(output.contains("at background_worker"));
    }

    #[test]
    fn test_tracked_thread_is_reported_with_entry_point() {
        let handle = spawn_tracked("firehot-audit-bg", true, background_function).unwrap();
        while !RUNNING.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }

        let (audit, output) = capture_warnings(check_thread_safety);

        let background = audit
            .threads
            .iter()
            .find(|t| t.name == "firehot-audit-bg")
            .expect("tracked thread missing from audit");
        assert!(background.is_daemon);
        assert!(background.is_alive);
        assert!(background.stack_trace.contains("background_function"));
        assert!(!audit.is_single_threaded());
        assert!(output.contains("Detected"));
        assert!(output.contains("firehot-audit-bg"));

        STOP.store(true, Ordering::SeqCst);
        handle.join().unwrap();
        assert!(!tracked().iter().any(|t| t.name == "firehot-audit-bg"));
    }

    #[test]
    fn test_calling_thread_comes_first() {
        let (audit, _) = capture_warnings(check_thread_safety);
        let first = &audit.threads[0];
        assert_eq!(first.id, current_thread_id());
        assert!(first.is_alive);
        assert!(!first.stack_trace.is_empty());
    }

    #[test]
    fn test_lone_thread_skips_backtrace() {
        assert!(current_stack_trace(true).is_empty());
        assert!(!current_stack_trace(false).is_empty());
    }
}
