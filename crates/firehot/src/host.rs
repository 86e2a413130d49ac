//! Process-wide runner table for embedding hosts.
//!
//! Hosts that cannot hold an [`ImportRunner`] themselves (bindings, CLIs
//! driven by string ids) address runners by [`RunnerId`] through these
//! functions.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

use rustc_hash::FxHashMap;
use uuid::Uuid;

use crate::codec::CallArgs;
use crate::config::RunnerConfig;
use crate::error::{Error, Result};
use crate::execute::{ExecutionId, ImportRunner};
use crate::registry::{FunctionRef, Registry};

/// Identifier of a runner in the process-wide table (UUID v4).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunnerId(String);

impl RunnerId {
    fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RunnerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for RunnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

static RUNNERS: LazyLock<Mutex<FxHashMap<RunnerId, Arc<ImportRunner>>>> =
    LazyLock::new(|| Mutex::new(FxHashMap::default()));

fn runners() -> MutexGuard<'static, FxHashMap<RunnerId, Arc<ImportRunner>>> {
    RUNNERS.lock().unwrap_or_else(|e| e.into_inner())
}

fn runner(id: &RunnerId) -> Result<Arc<ImportRunner>> {
    runners()
        .get(id)
        .cloned()
        .ok_or_else(|| Error::RunnerNotFound(id.to_string()))
}

/// Start a runner configured from the environment.
pub fn start_import_runner(registry: &Registry, package_path: impl AsRef<Path>) -> Result<RunnerId> {
    start_import_runner_with(registry, package_path, RunnerConfig::from_env())
}

pub fn start_import_runner_with(
    registry: &Registry,
    package_path: impl AsRef<Path>,
    config: RunnerConfig,
) -> Result<RunnerId> {
    let runner = ImportRunner::start(registry, package_path, config)?;
    let id = RunnerId::new();
    runners().insert(id.clone(), Arc::new(runner));
    Ok(id)
}

/// Stop and forget a runner. Unknown ids are ignored.
pub fn stop_import_runner(id: &RunnerId) -> Result<()> {
    let removed = runners().remove(id);
    match removed {
        Some(runner) => runner.stop().map(|_| ()),
        None => Ok(()),
    }
}

pub fn exec_isolated(id: &RunnerId, func: &FunctionRef, args: CallArgs) -> Result<ExecutionId> {
    runner(id)?.exec(func, args)
}

/// Wait for an execution and render its value as text: strings verbatim,
/// anything else as JSON.
pub fn communicate_isolated(id: &RunnerId, execution: &ExecutionId) -> Result<String> {
    runner(id)?.communicate(execution).map(|value| value.to_string())
}

pub fn stop_isolated(id: &RunnerId, execution: &ExecutionId) -> Result<bool> {
    runner(id)?.stop_isolated(execution)
}

pub fn update_environment(id: &RunnerId) -> Result<bool> {
    runner(id)?.update_environment()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_runner() {
        let id = RunnerId::from("not-a-runner");
        assert!(matches!(
            exec_isolated(&id, &FunctionRef::new("m", "f"), CallArgs::none()),
            Err(Error::RunnerNotFound(_))
        ));
        assert!(matches!(
            communicate_isolated(&id, &ExecutionId::new()),
            Err(Error::RunnerNotFound(_))
        ));
        assert!(matches!(update_environment(&id), Err(Error::RunnerNotFound(_))));
        // Stopping something that is not there is not an error.
        assert!(stop_import_runner(&id).is_ok());
    }

    #[test]
    fn test_missing_package_is_reported_before_spawning() {
        let err = start_import_runner(&Registry::new(), "/definitely/not/a/package").unwrap_err();
        assert!(matches!(err, Error::PathNotFound(_)));
    }
}
