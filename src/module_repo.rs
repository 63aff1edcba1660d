//! Module repository: named zip code bundles and the lazily-loaded operator factory tables they
//! export.
//!
//! The numeric content of operators (what an operator's `call` actually computes) is out of
//! scope for this crate. A module's archive therefore does not carry compiled code to hot-load;
//! it carries a `module.yaml` manifest naming which operators it exports and whether each uses
//! batching, and those names are resolved against a [`FactoryRegistry`] the embedding application
//! populates before the node starts (analogous to linking the module's operators into the node
//! binary ahead of time). A module is unpacked once, on first use, and its manifest resolved
//! against the registry's named factories.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{EstuaryError, Result};
use crate::tuple::Tuple;

/// User-supplied operator logic. The only contract the runtime needs: consume a batch of input
/// tuples (a batch of one, for non-batching operators) and produce the same number of results.
pub trait OperatorLogic: Send + Sync {
    fn call(&self, batch: Vec<Tuple>) -> Vec<Tuple>;
}

pub type OperatorFactory = Arc<dyn Fn() -> Box<dyn OperatorLogic> + Send + Sync>;

#[derive(Clone, Default)]
pub struct FactoryRegistry(Arc<DashMap<String, OperatorFactory>>);

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, factory: OperatorFactory) {
        self.0.insert(name.into(), factory);
    }

    pub fn get(&self, name: &str) -> Option<OperatorFactory> {
        self.0.get(name).map(|f| f.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ManifestOperatorEntry {
    name: String,
    #[serde(default)]
    batch: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct ModuleManifest {
    #[allow(dead_code)]
    name: String,
    operators: Vec<ManifestOperatorEntry>,
}

pub struct LoadedOperator {
    pub factory: OperatorFactory,
    pub batch: bool,
}

/// A named code bundle on disk. Identity is the module name, not content: re-adding a module
/// under the same name replaces the archive path used on next materialization.
pub struct Module {
    pub name: String,
    archive_path: PathBuf,
    factories: OnceCell<HashMap<String, LoadedOperator>>,
}

impl Module {
    fn new(name: String, archive_path: PathBuf) -> Self {
        Self {
            name,
            archive_path,
            factories: OnceCell::new(),
        }
    }

    /// Unpacks the archive and resolves its manifest against `registry`, the first time an
    /// operator from this module is placed. Subsequent calls return the cached table.
    pub fn factories(
        &self,
        app_repo_path: &Path,
        registry: &FactoryRegistry,
    ) -> Result<&HashMap<String, LoadedOperator>> {
        self.factories.get_or_try_init(|| {
            let dest = app_repo_path.join(format!("{}", self.name));
            unpack_zip(&self.archive_path, &dest)?;
            let manifest = read_manifest(&dest)?;

            let mut table = HashMap::with_capacity(manifest.operators.len());
            for entry in manifest.operators {
                let factory = registry
                    .get(&entry.name)
                    .ok_or_else(|| EstuaryError::OperatorNotFound(entry.name.clone()))?;
                table.insert(
                    entry.name,
                    LoadedOperator {
                        factory,
                        batch: entry.batch,
                    },
                );
            }
            info!(module = %self.name, operators = table.len(), "materialized module factory table");
            Ok(table)
        })
    }
}

pub struct ModuleRepository {
    modules: DashMap<String, Arc<Module>>,
    app_repo_path: PathBuf,
    registry: FactoryRegistry,
}

impl ModuleRepository {
    pub fn new(app_repo_path: PathBuf, registry: FactoryRegistry) -> Self {
        Self {
            modules: DashMap::new(),
            app_repo_path,
            registry,
        }
    }

    pub fn add_module(&self, name: String, archive_path: PathBuf) -> Arc<Module> {
        let module = Arc::new(Module::new(name.clone(), archive_path));
        self.modules.insert(name, module.clone());
        module
    }

    pub fn has_module(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    pub fn module_names(&self) -> Vec<String> {
        self.modules.iter().map(|e| e.key().clone()).collect()
    }

    /// Reads the raw archive bytes for a stored module, for re-sending it on to another peer.
    pub fn archive_bytes(&self, name: &str) -> Result<Vec<u8>> {
        let module = self
            .modules
            .get(name)
            .ok_or_else(|| EstuaryError::Module(format!("no such module: {name}")))?;
        std::fs::read(&module.archive_path)
            .map_err(|e| EstuaryError::Module(format!("reading archive for {name}: {e}")))
    }

    /// Scans every loaded module (lazily materializing each module's factory table on first
    /// access) until one exports `operator_name`.
    pub fn get_operator(&self, operator_name: &str) -> Result<(OperatorFactory, bool)> {
        for entry in self.modules.iter() {
            if let Ok(table) = entry.value().factories(&self.app_repo_path, &self.registry) {
                if let Some(loaded) = table.get(operator_name) {
                    return Ok((loaded.factory.clone(), loaded.batch));
                }
            }
        }
        Err(EstuaryError::OperatorNotFound(operator_name.to_string()))
    }
}

fn read_manifest(module_dir: &Path) -> Result<ModuleManifest> {
    let manifest_path = module_dir.join("module.yaml");
    let contents = std::fs::read_to_string(&manifest_path).map_err(|e| {
        EstuaryError::Module(format!(
            "missing manifest at {}: {}",
            manifest_path.display(),
            e
        ))
    })?;
    serde_yaml::from_str(&contents)
        .map_err(|e| EstuaryError::Module(format!("malformed manifest: {}", e)))
}

fn unpack_zip(archive_path: &Path, dest: &Path) -> Result<()> {
    if dest.exists() {
        debug!(dest = %dest.display(), "module already unpacked, skipping");
        return Ok(());
    }
    std::fs::create_dir_all(dest)?;
    let file = File::open(archive_path)
        .map_err(|e| EstuaryError::Module(format!("opening archive {}: {}", archive_path.display(), e)))?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| EstuaryError::Module(format!("reading archive {}: {}", archive_path.display(), e)))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| EstuaryError::Module(e.to_string()))?;
        let Some(relative) = entry.enclosed_name() else {
            continue;
        };
        let out_path = dest.join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
        } else {
            if let Some(parent) = out_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out_file = File::create(&out_path)?;
            std::io::copy(&mut entry, &mut out_file)?;
        }
    }
    Ok(())
}
