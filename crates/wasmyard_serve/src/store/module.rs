//! In-memory index of pulled wasm modules.
//!
//! Records are immutable after creation. The id is the URL-safe base64
//! SHA-256 of the module bytes, so it uniquely identifies content; the name
//! is the user-supplied image reference and maps to exactly one id at any
//! instant. Payload files live on disk next to a small metadata sidecar so
//! the index can be rebuilt on boot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{YardError, YardResult};

/// Sidecar file holding the serialized record inside the module's directory.
const MODULE_METADATA_FILE: &str = "module.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WasmModule {
    /// URL-safe base64 of the SHA-256 over the module bytes.
    pub id: String,
    /// User-supplied image reference; unique per store.
    pub name: String,
    /// Absolute path of the module bytes on disk.
    pub filepath: PathBuf,
    /// Byte length of the module.
    pub size: u64,
    pub spec: WasmModuleSpec,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WasmModuleSpec {
    /// Source URL the module was fetched from.
    pub url: String,
    /// Signal name used when stopping instances of this module.
    pub stop_signal: String,
    /// Pass-through metadata from the pull request.
    pub annotations: HashMap<String, String>,
}

impl WasmModule {
    pub fn metadata_path(&self) -> PathBuf {
        match self.filepath.parent() {
            Some(dir) => dir.join(MODULE_METADATA_FILE),
            None => PathBuf::from(MODULE_METADATA_FILE),
        }
    }
}

/// Store of all wasm modules, indexed by name and by id.
///
/// Two-level locking: the outer lock guards the name set, the inner store
/// guards the id map, so a reader resolving a name can never observe a torn
/// name-index update.
pub struct ModuleStore {
    name_set: RwLock<HashMap<String, String>>,
    store: InnerStore,
}

impl ModuleStore {
    pub fn new() -> Self {
        Self {
            name_set: RwLock::new(HashMap::new()),
            store: InnerStore {
                modules: RwLock::new(HashMap::new()),
            },
        }
    }

    /// Resolves the name to the corresponding module id.
    pub fn resolve(&self, name: &str) -> YardResult<String> {
        self.name_set
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| YardError::not_found(format!("wasm module {name:?}")))
    }

    /// Adds a new module. Both index entries are installed under the outer
    /// write lock so concurrent adds of the same name cannot interleave.
    pub fn add(&self, module: WasmModule) -> YardResult<()> {
        let mut name_set = self.name_set.write().unwrap();
        if name_set.contains_key(&module.name) {
            return Err(YardError::already_exists(format!(
                "wasm module {:?}",
                module.name
            )));
        }

        let name = module.name.clone();
        let id = module.id.clone();
        self.store
            .add(module)
            .map_err(|e| e.context(format!("failed to add wasm module {name:?}")))?;
        name_set.insert(name, id);
        Ok(())
    }

    /// Removes both index entries. The caller owns the disk file.
    pub fn delete(&self, name: &str) -> YardResult<()> {
        let mut name_set = self.name_set.write().unwrap();
        let id = name_set
            .get(name)
            .cloned()
            .ok_or_else(|| YardError::not_found(format!("wasm module {name:?}")))?;

        self.store
            .delete(&id)
            .map_err(|e| e.context(format!("failed to delete wasm module {id:?}")))?;
        name_set.remove(name);
        Ok(())
    }

    /// Gets a module by name or id, trying the name first.
    pub fn get(&self, name_or_id: &str) -> YardResult<WasmModule> {
        if let Ok(id) = self.resolve(name_or_id) {
            return self.store.get(&id);
        }
        self.store.get(name_or_id)
    }

    pub fn list(&self) -> Vec<WasmModule> {
        self.store.list()
    }

    /// Rebuilds the index from the module directory: each subdirectory is a
    /// module id holding the payload and its metadata sidecar. Entries
    /// without a readable sidecar are skipped.
    pub fn reload(&self, module_dir: &Path) -> YardResult<usize> {
        if !module_dir.exists() {
            return Ok(0);
        }
        let mut loaded = 0;
        for entry in std::fs::read_dir(module_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let metadata_path = entry.path().join(MODULE_METADATA_FILE);
            let data = match std::fs::read(&metadata_path) {
                Ok(data) => data,
                Err(_) => continue,
            };
            let module: WasmModule = match serde_json::from_slice(&data) {
                Ok(module) => module,
                Err(e) => {
                    tracing::warn!(
                        "Skipping module metadata {}: {}",
                        metadata_path.display(),
                        e
                    );
                    continue;
                }
            };
            if !module.filepath.exists() {
                tracing::warn!(
                    "Skipping module {:?}: payload {} missing",
                    module.name,
                    module.filepath.display()
                );
                continue;
            }
            match self.add(module) {
                Ok(()) => loaded += 1,
                Err(e) => tracing::warn!("Skipping module from {}: {}", metadata_path.display(), e),
            }
        }
        Ok(loaded)
    }
}

impl Default for ModuleStore {
    fn default() -> Self {
        Self::new()
    }
}

struct InnerStore {
    modules: RwLock<HashMap<String, WasmModule>>,
}

impl InnerStore {
    fn add(&self, module: WasmModule) -> YardResult<()> {
        let mut modules = self.modules.write().unwrap();
        if modules.contains_key(&module.id) {
            return Err(YardError::already_exists(format!(
                "wasm module {:?}",
                module.id
            )));
        }
        modules.insert(module.id.clone(), module);
        Ok(())
    }

    fn get(&self, id: &str) -> YardResult<WasmModule> {
        self.modules
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| YardError::not_found(format!("wasm module {id:?}")))
    }

    fn delete(&self, id: &str) -> YardResult<()> {
        let mut modules = self.modules.write().unwrap();
        if modules.remove(id).is_none() {
            return Err(YardError::not_found(format!("wasm module {id:?}")));
        }
        Ok(())
    }

    fn list(&self) -> Vec<WasmModule> {
        self.modules.read().unwrap().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(name: &str, id: &str) -> WasmModule {
        WasmModule {
            id: id.to_string(),
            name: name.to_string(),
            filepath: PathBuf::from(format!("/wasmmodules/{id}/app.wasm")),
            size: 4,
            spec: WasmModuleSpec {
                url: format!("http://example.com/{name}.wasm"),
                stop_signal: "SIGKILL".to_string(),
                annotations: HashMap::new(),
            },
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn add_then_get_by_name_and_id() {
        let store = ModuleStore::new();
        store.add(module("app", "id-1")).unwrap();

        assert_eq!(store.resolve("app").unwrap(), "id-1");
        assert_eq!(store.get("app").unwrap().id, "id-1");
        assert_eq!(store.get("id-1").unwrap().name, "app");
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let store = ModuleStore::new();
        store.add(module("app", "id-1")).unwrap();
        let err = store.add(module("app", "id-2")).unwrap_err();
        assert!(matches!(err, YardError::AlreadyExists(_)));
    }

    #[test]
    fn delete_removes_both_indexes() {
        let store = ModuleStore::new();
        store.add(module("app", "id-1")).unwrap();
        store.delete("app").unwrap();

        assert!(store.resolve("app").is_err());
        assert!(store.get("id-1").is_err());
        assert!(store.list().is_empty());

        // The name is free again.
        store.add(module("app", "id-3")).unwrap();
    }

    #[test]
    fn reload_rebuilds_the_index_from_disk() {
        let td = tempfile::tempdir().unwrap();

        let payload_dir = td.path().join("id-1");
        std::fs::create_dir_all(&payload_dir).unwrap();
        let filepath = payload_dir.join("app.wasm");
        std::fs::write(&filepath, b"\0asm").unwrap();
        let on_disk = WasmModule {
            filepath,
            ..module("app", "id-1")
        };
        std::fs::write(
            on_disk.metadata_path(),
            serde_json::to_vec(&on_disk).unwrap(),
        )
        .unwrap();

        // A directory without a sidecar is skipped, not an error.
        std::fs::create_dir_all(td.path().join("junk")).unwrap();

        let store = ModuleStore::new();
        assert_eq!(store.reload(td.path()).unwrap(), 1);
        assert_eq!(store.resolve("app").unwrap(), "id-1");
        assert_eq!(store.get("id-1").unwrap().size, 4);
    }

    #[test]
    fn name_bijection_holds_after_mixed_operations() {
        let store = ModuleStore::new();
        store.add(module("a", "id-a")).unwrap();
        store.add(module("b", "id-b")).unwrap();
        store.delete("a").unwrap();
        store.add(module("c", "id-c")).unwrap();

        for m in store.list() {
            assert_eq!(store.resolve(&m.name).unwrap(), m.id);
            assert_eq!(store.get(&m.id).unwrap().name, m.name);
        }
        assert_eq!(store.list().len(), 2);
    }
}
