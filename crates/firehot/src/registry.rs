//! Registry of isolatable modules and their callables.
//!
//! Workers cannot receive code, so every callable that may run in isolation
//! is registered up front under a dotted module path. The same registry is
//! built in the host (to validate calls) and in the controller (to import
//! modules and resolve calls inside workers).
//!
//! ```
//! use firehot::registry::{CallError, Registry};
//! use firehot::Value;
//!
//! fn greet(args: &[Value]) -> Result<Value, CallError> {
//!     let name = args.first().and_then(Value::as_str).unwrap_or("nobody");
//!     Ok(Value::from(format!("Hello, {}!", name)))
//! }
//!
//! let mut registry = Registry::new();
//! registry.module("sample.greetings").function("greet", greet);
//! assert!(registry.resolve("sample.greetings", "greet").is_ok());
//! ```

use std::fmt;
use std::path::Path;

use rustc_hash::FxHashMap;

use crate::codec::Value;
use crate::error::{Error, Result};

/// Signature of an isolatable callable. Receives the positional arguments.
pub type Function = fn(&[Value]) -> std::result::Result<Value, CallError>;

/// Hook run when a module is imported (controller warm-up) or reloaded
/// (inside a worker, before the call). Receives the package root.
pub type ImportHook = fn(&Path) -> std::result::Result<(), String>;

/// Error raised by a callable.
///
/// `class` plays the role of the exception type, `message` is surfaced to
/// the caller verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallError {
    pub class: String,
    pub message: String,
}

impl CallError {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a `ValueError`.
    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new("ValueError", message)
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

impl std::error::Error for CallError {}

/// Reference to a callable by owning module and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionRef {
    module: Option<String>,
    name: String,
}

impl FunctionRef {
    /// Callable defined in an importable module.
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: Some(module.into()),
            name: name.into(),
        }
    }

    /// Callable defined in the process entry script. Such callables cannot
    /// be shipped to a worker.
    pub fn script(name: impl Into<String>) -> Self {
        Self {
            module: None,
            name: name.into(),
        }
    }

    pub fn module(&self) -> Option<&str> {
        self.module.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.module {
            Some(module) => write!(f, "{}.{}", module, self.name),
            None => write!(f, "__main__.{}", self.name),
        }
    }
}

/// One importable module.
#[derive(Clone, Default)]
pub struct Module {
    path: String,
    functions: FxHashMap<String, Function>,
    on_import: Option<ImportHook>,
    on_reload: Option<ImportHook>,
}

impl Module {
    fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            ..Self::default()
        }
    }

    /// Register a callable under `name`.
    pub fn function(&mut self, name: &str, function: Function) -> &mut Self {
        self.functions.insert(name.to_string(), function);
        self
    }

    /// Expensive one-time setup, run once in the controller.
    pub fn on_import(&mut self, hook: ImportHook) -> &mut Self {
        self.on_import = Some(hook);
        self
    }

    /// Refresh run in each worker before a call into this module. Defaults
    /// to re-running the import hook.
    pub fn on_reload(&mut self, hook: ImportHook) -> &mut Self {
        self.on_reload = Some(hook);
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.function_names().collect();
        names.sort_unstable();
        f.debug_struct("Module")
            .field("path", &self.path)
            .field("functions", &names)
            .field("on_import", &self.on_import.is_some())
            .field("on_reload", &self.on_reload.is_some())
            .finish()
    }
}

/// All modules available to a runner.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    modules: FxHashMap<String, Module>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the module registered under `path`.
    pub fn module(&mut self, path: &str) -> &mut Module {
        self.modules
            .entry(path.to_string())
            .or_insert_with(|| Module::new(path))
    }

    pub fn contains_module(&self, path: &str) -> bool {
        self.modules.contains_key(path)
    }

    /// Module paths in import order.
    pub fn module_paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.modules.keys().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }

    /// Look up a callable.
    pub fn resolve(&self, module: &str, name: &str) -> Result<Function> {
        let entry = self
            .modules
            .get(module)
            .ok_or_else(|| Error::ModuleNotFound(module.to_string()))?;
        entry
            .functions
            .get(name)
            .copied()
            .ok_or_else(|| Error::FunctionNotFound {
                module: module.to_string(),
                function: name.to_string(),
            })
    }

    /// Check that a reference can be executed in isolation.
    pub fn validate(&self, func: &FunctionRef) -> Result<()> {
        match func.module() {
            Some(module) => self.resolve(module, func.name()).map(|_| ()),
            None => Err(Error::UnsupportedCallable(format!(
                "function {} belongs to the entry script, currently only module functions are supported",
                func.name()
            ))),
        }
    }

    /// Run every module's import hook, in path order.
    pub fn import_all(&self, root: &Path) -> Result<usize> {
        let mut imported = 0;
        for path in self.module_paths() {
            let module = &self.modules[path];
            if let Some(hook) = module.on_import {
                tracing::debug!("Importing module {}", path);
                hook(root).map_err(|message| Error::Import {
                    module: path.to_string(),
                    message,
                })?;
            }
            imported += 1;
        }
        Ok(imported)
    }

    /// Reload a single module ahead of a call into it.
    pub fn reload(&self, module: &str, root: &Path) -> Result<()> {
        let entry = self
            .modules
            .get(module)
            .ok_or_else(|| Error::ModuleNotFound(module.to_string()))?;
        match entry.on_reload.or(entry.on_import) {
            Some(hook) => hook(root).map_err(|message| Error::Import {
                module: module.to_string(),
                message,
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn echo(args: &[Value]) -> std::result::Result<Value, CallError> {
        Ok(Value::List(args.to_vec()))
    }

    static IMPORTS: AtomicUsize = AtomicUsize::new(0);

    fn count_import(_: &Path) -> std::result::Result<(), String> {
        IMPORTS.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    static RELOADS: AtomicUsize = AtomicUsize::new(0);

    fn count_reload(_: &Path) -> std::result::Result<(), String> {
        RELOADS.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn broken_import(_: &Path) -> std::result::Result<(), String> {
        Err("No module named 'missing_dep'".to_string())
    }

    #[test]
    fn test_resolve_registered_function() {
        let mut registry = Registry::new();
        registry.module("pkg.tools").function("echo", echo);

        let f = registry.resolve("pkg.tools", "echo").unwrap();
        assert_eq!(
            f(&[Value::from(1)]).unwrap(),
            Value::List(vec![Value::from(1)])
        );
    }

    #[test]
    fn test_resolve_errors_are_distinct() {
        let mut registry = Registry::new();
        registry.module("pkg.tools").function("echo", echo);

        assert!(matches!(
            registry.resolve("pkg.other", "echo"),
            Err(Error::ModuleNotFound(m)) if m == "pkg.other"
        ));
        assert!(matches!(
            registry.resolve("pkg.tools", "missing"),
            Err(Error::FunctionNotFound { function, .. }) if function == "missing"
        ));
    }

    #[test]
    fn test_validate_rejects_script_functions() {
        let registry = Registry::new();
        assert!(matches!(
            registry.validate(&FunctionRef::script("main_helper")),
            Err(Error::UnsupportedCallable(_))
        ));
    }

    #[test]
    fn test_import_all_runs_hooks_and_reports_failures() {
        let mut registry = Registry::new();
        registry.module("a.first").on_import(count_import);
        registry.module("b.second").on_import(count_import);

        let before = IMPORTS.load(Ordering::SeqCst);
        assert_eq!(registry.import_all(Path::new("/")).unwrap(), 2);
        assert_eq!(IMPORTS.load(Ordering::SeqCst) - before, 2);

        registry.module("c.broken").on_import(broken_import);
        match registry.import_all(Path::new("/")) {
            Err(Error::Import { module, message }) => {
                assert_eq!(module, "c.broken");
                assert!(message.contains("missing_dep"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_reload_falls_back_to_import_hook() {
        let mut registry = Registry::new();
        registry.module("pkg.reloaded").on_import(count_reload);

        registry.reload("pkg.reloaded", Path::new("/")).unwrap();
        assert_eq!(RELOADS.load(Ordering::SeqCst), 1);
        assert!(matches!(
            registry.reload("pkg.absent", Path::new("/")),
            Err(Error::ModuleNotFound(_))
        ));
    }

    #[test]
    fn test_function_ref_display() {
        assert_eq!(FunctionRef::new("pkg.mod", "f").to_string(), "pkg.mod.f");
        assert_eq!(FunctionRef::script("f").to_string(), "__main__.f");
    }
}
