//! The language-integration seam.
//!
//! The worker core never touches the source language directly: the
//! preloader owns a `Runtime` value and everything it needs —
//! importing, the per-module export map, assertion introspection —
//! goes through this trait. `StaticRuntime` is the in-crate
//! implementation: a registration table that stands in for a real
//! interpreter and powers the test suite and the default binary.

use crate::protocol::{Frame, ModuleName};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

/// A value a fixture can yield and a test can receive.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Str(s) => write!(f, "{s:?}"),
        }
    }
}

/// A module-level iterable, or a zero-argument callable yielding one,
/// whose name matches a test parameter.
#[derive(Clone)]
pub enum Fixture {
    Values(Vec<Value>),
    Thunk(fn() -> Vec<Value>),
}

impl Fixture {
    pub fn materialize(&self) -> Vec<Value> {
        match self {
            Fixture::Values(values) => values.clone(),
            Fixture::Thunk(thunk) => thunk(),
        }
    }
}

/// How one invocation of a test body ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Pass,
    /// A failed assertion; `None` means the bare check carried no
    /// message and the runner may ask for introspection.
    AssertFail { message: Option<String> },
    Raise {
        name: String,
        message: String,
        frames: Vec<Frame>,
    },
}

/// Result of re-executing a failed bare assertion with introspection
/// enabled.
#[derive(Debug, Clone, PartialEq)]
pub enum Rerun {
    /// The transformed body produced the operands, e.g. "BUT 2 != 3".
    Message(String),
    PassedOnRerun,
    FailedDifferently(String),
    /// The integration cannot rewrite this test.
    Unavailable,
}

#[derive(Debug, Clone)]
pub struct ImportError {
    pub name: String,
    pub message: String,
}

impl fmt::Display for ImportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for ImportError {}

/// One test entry of a module's export map.
#[derive(Clone)]
pub struct TestDef {
    pub name: String,
    pub params: Vec<String>,
    pub line: u32,
    pub source: String,
    pub body: fn(&[Value]) -> Outcome,
    /// Introspective re-execution hook for bare assertions.
    pub detail: Option<fn(&[Value]) -> Rerun>,
}

/// The export map a module presents once loaded: its tests plus the
/// named fixtures tests can draw parameters from.
#[derive(Clone, Default)]
pub struct ModuleExports {
    pub tests: Vec<TestDef>,
    pub fixtures: BTreeMap<String, Fixture>,
}

/// The seam the preloader talks through.
pub trait Runtime {
    /// Make `name` live, returning every module that newly became
    /// live as a result (the requested module included on a cold
    /// import, nothing at all when it was already warm).
    fn import(&mut self, name: &str) -> Result<BTreeSet<ModuleName>, ImportError>;

    /// Paths of every live module that has file backing.
    fn module_paths(&self) -> Vec<(ModuleName, PathBuf)>;

    /// The export map of a live module.
    fn exports(&self, module: &str) -> Option<ModuleExports>;

    /// Re-execute a failed bare assertion with introspection.
    fn enrich_assertion(&mut self, module: &str, test: &str, args: &[Value]) -> Rerun;
}

/// Everything `StaticRuntime` knows about one registered module
/// before it is imported.
#[derive(Clone, Default)]
pub struct ModuleDef {
    pub name: ModuleName,
    pub path: Option<PathBuf>,
    /// Modules this one pulls in when imported.
    pub imports: Vec<ModuleName>,
    /// Registered import-failure message, e.g. a syntax error.
    pub broken: Option<String>,
    pub exports: ModuleExports,
}

impl ModuleDef {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn path(mut self, path: &str) -> Self {
        self.path = Some(PathBuf::from(path));
        self
    }

    pub fn imports(mut self, names: &[&str]) -> Self {
        self.imports = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn broken(mut self, message: &str) -> Self {
        self.broken = Some(message.to_string());
        self
    }

    pub fn test(mut self, test: TestDef) -> Self {
        self.exports.tests.push(test);
        self
    }

    pub fn fixture(mut self, name: &str, fixture: Fixture) -> Self {
        self.exports.fixtures.insert(name.to_string(), fixture);
        self
    }
}

/// Registration-table runtime: module definitions registered up
/// front, a live-set updated by imports.
#[derive(Default)]
pub struct StaticRuntime {
    defs: BTreeMap<ModuleName, ModuleDef>,
    live: BTreeSet<ModuleName>,
}

impl StaticRuntime {
    pub fn new(defs: Vec<ModuleDef>) -> Self {
        Self {
            defs: defs.into_iter().map(|d| (d.name.clone(), d)).collect(),
            live: BTreeSet::new(),
        }
    }

    pub fn is_live(&self, name: &str) -> bool {
        self.live.contains(name)
    }

    fn load(&mut self, name: &str, delta: &mut BTreeSet<ModuleName>) -> Result<(), ImportError> {
        if self.live.contains(name) {
            return Ok(());
        }
        let def = self.defs.get(name).cloned().ok_or_else(|| ImportError {
            name: "ImportError".to_string(),
            message: format!("no module named {name:?}"),
        })?;
        if let Some(message) = def.broken {
            return Err(ImportError {
                name: "SyntaxError".to_string(),
                message,
            });
        }
        // A module counts as live before its imports run, so cycles
        // terminate the way a real module cache makes them.
        self.live.insert(name.to_string());
        delta.insert(name.to_string());
        for dep in &def.imports {
            self.load(dep, delta)?;
        }
        Ok(())
    }
}

impl Runtime for StaticRuntime {
    fn import(&mut self, name: &str) -> Result<BTreeSet<ModuleName>, ImportError> {
        let mut delta = BTreeSet::new();
        self.load(name, &mut delta)?;
        Ok(delta)
    }

    fn module_paths(&self) -> Vec<(ModuleName, PathBuf)> {
        self.live
            .iter()
            .filter_map(|name| {
                let def = self.defs.get(name)?;
                def.path.as_ref().map(|p| (name.clone(), p.clone()))
            })
            .collect()
    }

    fn exports(&self, module: &str) -> Option<ModuleExports> {
        if !self.live.contains(module) {
            return None;
        }
        self.defs.get(module).map(|d| d.exports.clone())
    }

    fn enrich_assertion(&mut self, module: &str, test: &str, args: &[Value]) -> Rerun {
        let detail = self
            .defs
            .get(module)
            .and_then(|d| d.exports.tests.iter().find(|t| t.name == test))
            .and_then(|t| t.detail);
        match detail {
            Some(rerun) => rerun(args),
            None => Rerun::Unavailable,
        }
    }
}

/// Constructor the coordinator hands to each worker; invoked on the
/// preloader side of the fork.
pub type RuntimeFactory = Box<dyn Fn() -> Box<dyn Runtime>>;

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> StaticRuntime {
        StaticRuntime::new(vec![
            ModuleDef::new("a").path("/src/a.py"),
            ModuleDef::new("b").imports(&["a"]).path("/src/b.py"),
            ModuleDef::new("c").imports(&["b"]),
            ModuleDef::new("bad").broken("invalid syntax"),
        ])
    }

    #[test]
    fn cold_import_reports_transitive_delta() {
        let mut rt = chain();
        let delta = rt.import("c").unwrap();
        let names: Vec<&str> = delta.iter().map(|s| s.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn warm_import_reports_empty_delta() {
        let mut rt = chain();
        rt.import("b").unwrap();
        assert!(rt.import("b").unwrap().is_empty());
        assert_eq!(rt.import("c").unwrap().len(), 1);
    }

    #[test]
    fn missing_module_is_an_import_error() {
        let mut rt = chain();
        let err = rt.import("nowhere").unwrap_err();
        assert_eq!(err.name, "ImportError");
    }

    #[test]
    fn broken_module_reports_registered_message() {
        let mut rt = chain();
        let err = rt.import("bad").unwrap_err();
        assert_eq!(err.name, "SyntaxError");
        assert_eq!(err.message, "invalid syntax");
    }

    #[test]
    fn module_paths_cover_only_live_file_backed_modules() {
        let mut rt = chain();
        rt.import("b").unwrap();
        let mut paths = rt.module_paths();
        paths.sort();
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[0].0, "a");
        assert_eq!(paths[1].0, "b");
    }

    #[test]
    fn exports_require_a_live_module() {
        let mut rt = chain();
        assert!(rt.exports("a").is_none());
        rt.import("a").unwrap();
        assert!(rt.exports("a").is_some());
    }

    #[test]
    fn cyclic_registrations_import_cleanly() {
        let mut rt = StaticRuntime::new(vec![
            ModuleDef::new("x").imports(&["y"]),
            ModuleDef::new("y").imports(&["x"]),
        ]);
        let delta = rt.import("x").unwrap();
        assert_eq!(delta.len(), 2);
    }
}
