use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct YardConfig {
    /// Name of the service instance.
    pub name: String,

    /// CRI server listen configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Endpoint of the wasmdealer task service.
    #[serde(default)]
    pub dealer: DealerConfig,

    /// Runtime used for wasm tasks created through the wasmdealer.
    pub runtime: RuntimeConfig,

    /// On-disk layout.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Directory where the config file is located.
    /// Relative storage paths are resolved against this directory.
    #[serde(skip)]
    config_dir: PathBuf,
}

impl YardConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config: YardConfig = serde_yaml::from_reader(
            std::fs::File::open(path).map_err(|e| format!("Failed to open file: {}", e))?,
        )
        .map_err(|e| format!("Failed to parse YAML: {}", e))?;

        let path = path
            .canonicalize()
            .map_err(|e| format!("Failed to canonicalize path: {}", e))?;
        config.config_dir = path
            .parent()
            .ok_or_else(|| format!("Failed to get parent directory of path: {}", path.display()))?
            .to_path_buf();
        config.validate()?;

        Ok(config)
    }

    /// Builds a config without a file, rooting all storage under `base`.
    /// Used by tests and embedders.
    pub fn with_base_dir<P: AsRef<Path>>(name: &str, runtime_name: &str, base: P) -> Self {
        let base = base.as_ref();
        Self {
            name: name.to_string(),
            server: ServerConfig::default(),
            dealer: DealerConfig::default(),
            runtime: RuntimeConfig {
                name: runtime_name.to_string(),
                options: IndexMap::new(),
            },
            storage: StorageConfig {
                root_dir: base.join("root"),
                state_dir: base.join("state"),
                module_dir: None,
            },
            config_dir: base.to_path_buf(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err("Name is required in the name field".to_string());
        }
        if self.server.port == 0 {
            return Err("Server port must not be zero".to_string());
        }
        if self.dealer.address.is_empty() {
            return Err("Dealer address must not be empty".to_string());
        }
        if self.dealer.port == 0 {
            return Err("Dealer port must not be zero".to_string());
        }
        if self.runtime.name.is_empty() {
            return Err("Runtime name must not be empty".to_string());
        }
        Ok(())
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_relative() {
            self.config_dir.join(path)
        } else {
            path.to_path_buf()
        }
    }

    /// Root of persistent per-workload state.
    pub fn root_dir(&self) -> PathBuf {
        self.resolve(&self.storage.root_dir)
    }

    /// Root of volatile per-workload state (FIFOs and other ephemeral data).
    pub fn state_dir(&self) -> PathBuf {
        self.resolve(&self.storage.state_dir)
    }

    /// Directory holding content-addressed wasm module payloads.
    pub fn module_dir(&self) -> PathBuf {
        match &self.storage.module_dir {
            Some(dir) => self.resolve(dir),
            None => self.root_dir().join("wasmmodules"),
        }
    }

    pub fn instance_root_dir(&self, id: &str) -> PathBuf {
        self.root_dir().join("wasminstances").join(id)
    }

    pub fn volatile_instance_root_dir(&self, id: &str) -> PathBuf {
        self.state_dir().join("wasminstances").join(id)
    }

    pub fn dealer_endpoint(&self) -> String {
        format!("http://{}:{}", self.dealer.address, self.dealer.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Address the CRI gRPC server binds to.
    #[serde(default = "ServerConfig::default_address")]
    pub address: String,
    /// Port the CRI gRPC server binds to.
    #[serde(default = "ServerConfig::default_port")]
    pub port: u16,
}

impl ServerConfig {
    fn default_address() -> String {
        "0.0.0.0".to_string()
    }

    fn default_port() -> u16 {
        50610
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: Self::default_address(),
            port: Self::default_port(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DealerConfig {
    /// Address of the wasmdealer task service.
    #[serde(default = "DealerConfig::default_address")]
    pub address: String,
    /// Port of the wasmdealer task service.
    #[serde(default = "DealerConfig::default_port")]
    pub port: u16,
}

impl DealerConfig {
    fn default_address() -> String {
        "127.0.0.1".to_string()
    }

    fn default_port() -> u16 {
        50620
    }
}

impl Default for DealerConfig {
    fn default() -> Self {
        Self {
            address: Self::default_address(),
            port: Self::default_port(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Name of the wasm runtime handler, e.g. `io.wasmyard.wasmtime.v1`.
    pub name: String,
    /// Opaque runtime options forwarded to the wasmdealer on task creation.
    /// Order is preserved so serialized options are stable across restarts.
    #[serde(default)]
    pub options: IndexMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Persistent root directory.
    #[serde(default = "StorageConfig::default_root_dir")]
    pub root_dir: PathBuf,
    /// Volatile state directory.
    #[serde(default = "StorageConfig::default_state_dir")]
    pub state_dir: PathBuf,
    /// Module payload directory. Defaults to `<root_dir>/wasmmodules`.
    #[serde(default)]
    pub module_dir: Option<PathBuf>,
}

impl StorageConfig {
    fn default_root_dir() -> PathBuf {
        PathBuf::from("/var/lib/wasmyard")
    }

    fn default_state_dir() -> PathBuf {
        PathBuf::from("/run/wasmyard")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_dir: Self::default_root_dir(),
            state_dir: Self::default_state_dir(),
            module_dir: None,
        }
    }
}
