use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use common::bundle::{Bundle, BundleError, SCRIPT_EXTENSIONS};
use parking_lot::Mutex;
use rhai::module_resolvers::ModuleResolver;
use rhai::{Dynamic, Engine, EvalAltResult, Module, Position, Scope, Shared};

use super::parse_error;

/// Resolves `import` statements against the modules of one bundle.
///
/// Each module is evaluated at most once per importer; later imports of the
/// same name share the result. A module that imports itself, directly or
/// through other modules, fails with an import cycle error.
#[derive(Debug, Clone)]
pub struct BundleImporter {
    bundle: Arc<Bundle>,
    loaded: Arc<Mutex<HashMap<String, Shared<Module>>>>,
    loading: Arc<Mutex<Vec<String>>>,
}

impl BundleImporter {
    pub fn new(bundle: Bundle) -> Self {
        Self {
            bundle: Arc::new(bundle),
            loaded: Arc::new(Mutex::new(HashMap::new())),
            loading: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Open the archive and check that it has an entry point.
    pub fn from_bytes(data: Bytes) -> Result<Self, BundleError> {
        let bundle = Bundle::from_bytes(data)?;
        bundle.entry_point()?;
        Ok(Self::new(bundle))
    }
}

/// Pops the module being evaluated off the loading stack.
struct LoadingGuard<'a> {
    stack: &'a Mutex<Vec<String>>,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.stack.lock().pop();
    }
}

fn module_name(path: &str) -> &str {
    SCRIPT_EXTENSIONS
        .iter()
        .find_map(|ext| path.strip_suffix(ext))
        .unwrap_or(path)
}

impl ModuleResolver for BundleImporter {
    fn resolve(
        &self,
        engine: &Engine,
        _source: Option<&str>,
        path: &str,
        pos: Position,
    ) -> Result<Shared<Module>, Box<EvalAltResult>> {
        let name = module_name(path);
        if let Some(module) = self.loaded.lock().get(name) {
            return Ok(module.clone());
        }

        {
            let mut stack = self.loading.lock();
            if let Some(start) = stack.iter().position(|loading| loading == name) {
                let mut cycle = stack[start..].to_vec();
                cycle.push(name.to_string());
                return Err(Box::new(EvalAltResult::ErrorRuntime(
                    Dynamic::from(format!("import cycle: {}", cycle.join(" -> "))),
                    pos,
                )));
            }
            stack.push(name.to_string());
        }
        let _loading = LoadingGuard {
            stack: &self.loading,
        };

        let (entry, source) = self.bundle.read_module(name).map_err(|e| match e {
            BundleError::ModuleNotFound(_) => {
                Box::new(EvalAltResult::ErrorModuleNotFound(path.to_string(), pos))
            }
            other => Box::new(EvalAltResult::ErrorRuntime(
                Dynamic::from(other.to_string()),
                pos,
            )),
        })?;
        tracing::debug!(module = %entry, "loading module");

        let mut ast = engine.compile(&source).map_err(|e| {
            Box::new(EvalAltResult::ErrorInModule(
                entry.clone(),
                Box::new(parse_error(e)),
                pos,
            ))
        })?;
        ast.set_source(entry.as_str());

        let module = Module::eval_ast_as_new(Scope::new(), &ast, engine)
            .map_err(|e| Box::new(EvalAltResult::ErrorInModule(entry, e, pos)))?;
        let module: Shared<Module> = module.into();
        self.loaded.lock().insert(name.to_string(), module.clone());
        Ok(module)
    }
}
