//! Runner configuration.
//!
//! # Environment Variables
//!
//! - `FIREHOT_CONTROLLER_BIN` - Program to launch as controller (default: the current executable)
//! - `FIREHOT_COMMUNICATE_TIMEOUT_MS` - Upper bound for `communicate`
//! - `FIREHOT_FORK_TIMEOUT_MS` - Upper bound for the fork acknowledgement in `exec`
//! - `FIREHOT_BOOT_TIMEOUT_MS` - Upper bound for the controller's module imports

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::execute::{EchoObserver, OutputObserver};

/// Marks a process as a controller. Set by the runner, read by
/// [`run_controller_if_requested`](crate::run_controller_if_requested).
pub const ROLE_ENV: &str = "FIREHOT_ROLE";
/// Value of [`ROLE_ENV`] for controllers.
pub const CONTROLLER_ROLE: &str = "controller";
/// Package root handed to the controller.
pub const PACKAGE_ENV: &str = "FIREHOT_PACKAGE";

pub const CONTROLLER_BIN_ENV: &str = "FIREHOT_CONTROLLER_BIN";
pub const COMMUNICATE_TIMEOUT_ENV: &str = "FIREHOT_COMMUNICATE_TIMEOUT_MS";
pub const FORK_TIMEOUT_ENV: &str = "FIREHOT_FORK_TIMEOUT_MS";
pub const BOOT_TIMEOUT_ENV: &str = "FIREHOT_BOOT_TIMEOUT_MS";

/// Which files under the package root take part in the fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnoreRules {
    /// Skip entries whose name starts with `.`.
    pub skip_hidden: bool,
    /// Directory names never descended into.
    pub ignore_dirs: Vec<String>,
    /// Only files with one of these extensions count. Empty means all.
    pub extensions: Vec<String>,
}

impl Default for IgnoreRules {
    fn default() -> Self {
        Self {
            skip_hidden: true,
            ignore_dirs: ["target", "node_modules", "__pycache__"]
                .into_iter()
                .map(String::from)
                .collect(),
            extensions: Vec::new(),
        }
    }
}

impl IgnoreRules {
    /// Restrict the fingerprint to the given extensions (without the dot).
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    pub fn ignore_dir(mut self, name: impl Into<String>) -> Self {
        self.ignore_dirs.push(name.into());
        self
    }

    /// Whether a directory entry is pruned from the walk.
    pub fn skips_dir(&self, name: &str) -> bool {
        (self.skip_hidden && name.starts_with('.')) || self.ignore_dirs.iter().any(|d| d == name)
    }

    /// Whether a file is left out of the fingerprint.
    pub fn skips_file(&self, path: &Path) -> bool {
        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('.'));
        if self.skip_hidden && hidden {
            return true;
        }
        if self.extensions.is_empty() {
            return false;
        }
        !path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.extensions.iter().any(|e| e == ext))
    }
}

/// Configuration for an [`ImportRunner`](crate::ImportRunner).
#[derive(Clone)]
pub struct RunnerConfig {
    /// Program launched as the controller. `None` re-executes the current
    /// executable, which must call `run_controller_if_requested` first thing
    /// in `main`.
    pub controller_bin: Option<PathBuf>,
    /// How long `communicate` waits for an outcome (default: 30s).
    pub communicate_timeout: Duration,
    /// How long `exec` waits for the fork acknowledgement (default: 10s).
    pub fork_timeout: Duration,
    /// How long `start` waits for the module imports (default: 60s).
    pub boot_timeout: Duration,
    /// Time the controller gets to exit on its own during `stop` (default: 500ms).
    pub shutdown_grace: Duration,
    pub ignore: IgnoreRules,
    /// Receives worker output that is not a protocol message.
    pub observer: Arc<dyn OutputObserver>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            controller_bin: None,
            communicate_timeout: Duration::from_secs(30),
            fork_timeout: Duration::from_secs(10),
            boot_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_millis(500),
            ignore: IgnoreRules::default(),
            observer: Arc::new(EchoObserver),
        }
    }
}

impl fmt::Debug for RunnerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerConfig")
            .field("controller_bin", &self.controller_bin)
            .field("communicate_timeout", &self.communicate_timeout)
            .field("fork_timeout", &self.fork_timeout)
            .field("boot_timeout", &self.boot_timeout)
            .field("shutdown_grace", &self.shutdown_grace)
            .field("ignore", &self.ignore)
            .finish_non_exhaustive()
    }
}

impl RunnerConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(bin) = var(CONTROLLER_BIN_ENV).filter(|s| !s.is_empty()) {
            self.controller_bin = Some(PathBuf::from(bin));
        }

        let millis = |key: &str| -> Option<Duration> {
            let raw = var(key)?;
            match raw.trim().parse::<u64>() {
                Ok(ms) => Some(Duration::from_millis(ms)),
                Err(_) => {
                    tracing::warn!("Ignoring {}={:?}: expected milliseconds", key, raw);
                    None
                }
            }
        };
        if let Some(timeout) = millis(COMMUNICATE_TIMEOUT_ENV) {
            self.communicate_timeout = timeout;
        }
        if let Some(timeout) = millis(FORK_TIMEOUT_ENV) {
            self.fork_timeout = timeout;
        }
        if let Some(timeout) = millis(BOOT_TIMEOUT_ENV) {
            self.boot_timeout = timeout;
        }

        self
    }

    pub fn controller_bin(mut self, path: impl Into<PathBuf>) -> Self {
        self.controller_bin = Some(path.into());
        self
    }

    pub fn communicate_timeout(mut self, timeout: Duration) -> Self {
        self.communicate_timeout = timeout;
        self
    }

    pub fn fork_timeout(mut self, timeout: Duration) -> Self {
        self.fork_timeout = timeout;
        self
    }

    pub fn boot_timeout(mut self, timeout: Duration) -> Self {
        self.boot_timeout = timeout;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn ignore(mut self, rules: IgnoreRules) -> Self {
        self.ignore = rules;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn OutputObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Resolve the program to launch as controller.
    pub fn controller_program(&self) -> Result<PathBuf> {
        match &self.controller_bin {
            Some(path) => Ok(path.clone()),
            None => std::env::current_exe()
                .map_err(|e| Error::Spawn(format!("cannot locate current executable: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: FxHashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.communicate_timeout, Duration::from_secs(30));
        assert!(config.controller_bin.is_none());
        assert!(config.ignore.skip_hidden);
    }

    #[test]
    fn test_env_overrides() {
        let config = RunnerConfig::default().with_overrides(vars(&[
            (CONTROLLER_BIN_ENV, "/opt/bin/controller"),
            (COMMUNICATE_TIMEOUT_ENV, "1500"),
            (FORK_TIMEOUT_ENV, "soon"),
        ]));

        assert_eq!(config.controller_bin, Some(PathBuf::from("/opt/bin/controller")));
        assert_eq!(config.communicate_timeout, Duration::from_millis(1500));
        // Unparseable values keep the default.
        assert_eq!(config.fork_timeout, Duration::from_secs(10));
        assert_eq!(config.controller_program().unwrap(), PathBuf::from("/opt/bin/controller"));
    }

    #[test]
    fn test_ignore_rules() {
        let rules = IgnoreRules::default().with_extensions(["py", "toml"]);
        assert!(rules.skips_dir(".git"));
        assert!(rules.skips_dir("target"));
        assert!(!rules.skips_dir("src"));
        assert!(rules.skips_file(Path::new("pkg/.DS_Store")));
        assert!(rules.skips_file(Path::new("pkg/readme.md")));
        assert!(!rules.skips_file(Path::new("pkg/module.py")));
        assert!(!IgnoreRules::default().skips_file(Path::new("pkg/readme.md")));
    }
}
