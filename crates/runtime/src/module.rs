//! Module loading contract (spec §6).
//!
//! Parsing itself is out of scope (an external collaborator hands the
//! evaluator an already-built `Program`); what belongs here is the policy
//! around *locating* and *caching* modules once parsed: resolving an
//! import path relative to the script directory, memoizing already-parsed
//! and already-executed modules, and detecting import cycles before they
//! recurse forever. Module discovery and the package resolver proper are
//! a spec Non-goal, so `resolve` is the simplified stand-in: absolute
//! paths pass through, everything else is joined to the script directory
//! with a `.lat` extension auto-appended when one is missing.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use phase_core::ast::Program;
use phase_core::Value;

use crate::error::EvalError;

/// Supplied by the host embedding this evaluator: turns a resolved file
/// path into a parsed `Program`. Kept abstract so this crate never has to
/// depend on a concrete parser.
pub trait ModuleParser: Send + Sync {
    fn parse_file(&self, path: &Path) -> Result<Program, EvalError>;
}

#[derive(Clone)]
pub struct ModuleLoader {
    parser: Arc<dyn ModuleParser>,
    script_dir: PathBuf,
    programs: HashMap<PathBuf, Arc<Program>>,
    exports: HashMap<PathBuf, Value>,
    loading: HashSet<PathBuf>,
}

impl ModuleLoader {
    pub fn new(parser: Arc<dyn ModuleParser>, script_dir: impl Into<PathBuf>) -> Self {
        ModuleLoader {
            parser,
            script_dir: script_dir.into(),
            programs: HashMap::new(),
            exports: HashMap::new(),
            loading: HashSet::new(),
        }
    }

    pub fn resolve(&self, import_path: &str) -> PathBuf {
        let candidate = Path::new(import_path);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            let with_ext = if candidate.extension().is_none() {
                candidate.with_extension("lat")
            } else {
                candidate.to_path_buf()
            };
            self.script_dir.join(with_ext)
        }
    }

    /// Parses and caches the module at `import_path` (by resolved absolute
    /// path), returning the already-cached program on a repeat import.
    pub fn load_program(&mut self, import_path: &str) -> Result<Arc<Program>, EvalError> {
        let resolved = self.resolve(import_path);
        if let Some(program) = self.programs.get(&resolved) {
            return Ok(program.clone());
        }
        let program = Arc::new(self.parser.parse_file(&resolved)?);
        self.programs.insert(resolved, program.clone());
        Ok(program)
    }

    pub fn cached_exports(&self, import_path: &str) -> Option<Value> {
        self.exports.get(&self.resolve(import_path)).cloned()
    }

    pub fn cache_exports(&mut self, import_path: &str, exports: Value) {
        let resolved = self.resolve(import_path);
        self.exports.insert(resolved, exports);
    }

    /// Marks `import_path` as currently executing, returning an error if
    /// it's already mid-execution (a circular import, spec §6).
    pub fn begin_loading(&mut self, import_path: &str) -> Result<(), EvalError> {
        let resolved = self.resolve(import_path);
        if !self.loading.insert(resolved.clone()) {
            return Err(EvalError::ContractViolation {
                message: format!("circular import detected at `{}`", resolved.display()),
                trace: Vec::new(),
            });
        }
        Ok(())
    }

    pub fn finish_loading(&mut self, import_path: &str) {
        let resolved = self.resolve(import_path);
        self.loading.remove(&resolved);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct StubParser {
        calls: AtomicUsize,
    }
    impl ModuleParser for StubParser {
        fn parse_file(&self, _path: &Path) -> Result<Program, EvalError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Program { items: Vec::new() })
        }
    }

    #[test]
    fn load_program_caches_second_load() {
        let parser = Arc::new(StubParser { calls: AtomicUsize::new(0) });
        let mut loader = ModuleLoader::new(parser.clone(), "/scripts");
        loader.load_program("a.lat").unwrap();
        loader.load_program("a.lat").unwrap();
        assert_eq!(parser.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn begin_loading_twice_detects_cycle() {
        let parser = Arc::new(StubParser { calls: AtomicUsize::new(0) });
        let mut loader = ModuleLoader::new(parser, "/scripts");
        loader.begin_loading("a.lat").unwrap();
        let err = loader.begin_loading("a.lat").unwrap_err();
        assert!(matches!(err, EvalError::ContractViolation { .. }));
    }

    #[test]
    fn exports_round_trip_through_cache() {
        let parser = Arc::new(StubParser { calls: AtomicUsize::new(0) });
        let mut loader = ModuleLoader::new(parser, "/scripts");
        assert!(loader.cached_exports("a.lat").is_none());
        loader.cache_exports("a.lat", Value::int(1));
        assert!(loader.cached_exports("a.lat").unwrap().eq_value(&Value::int(1)));
    }
}
