//! Runtime spec generation for wasm instances.

use std::path::Path;

use oci_spec::runtime::{MountBuilder, ProcessBuilder, RootBuilder, Spec, SpecBuilder};

use crate::error::{YardError, YardResult};
use crate::grpc::cri_proto::{ContainerConfig, PodSandboxConfig};
use crate::store::module::WasmModule;
use crate::store::status::Resources;

const DEFAULT_PATH_ENV: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
const RELATIVE_ROOTFS_PATH: &str = "rootfs";

/// Builds the spec handed to the wasmdealer.
///
/// No default security profile is applied: the runtime either brings its own
/// base spec or runs without one. The module file's directory is bind-mounted
/// onto `/` so argv[0] resolves inside the task's view of the filesystem.
pub fn build_wasm_spec(
    id: &str,
    module: &WasmModule,
    config: &ContainerConfig,
    sandbox_config: &PodSandboxConfig,
    fallback_hostname: &str,
) -> YardResult<Spec> {
    let mut env = vec![DEFAULT_PATH_ENV.to_string()];
    let hostname = if sandbox_config.hostname.is_empty() {
        fallback_hostname
    } else {
        &sandbox_config.hostname
    };
    env.push(format!("HOSTNAME={hostname}"));
    for kv in &config.envs {
        env.push(format!("{}={}", kv.key, kv.value));
    }

    let process = ProcessBuilder::default()
        .terminal(config.tty)
        .args(process_args(module, config))
        .env(env)
        .cwd(if config.working_dir.is_empty() {
            "/".to_string()
        } else {
            config.working_dir.clone()
        })
        .build()
        .map_err(|e| YardError::internal(format!("failed to build process for {id:?}: {e}")))?;

    let root = RootBuilder::default()
        .path(RELATIVE_ROOTFS_PATH.to_string())
        .readonly(false)
        .build()
        .map_err(|e| YardError::internal(format!("failed to build root for {id:?}: {e}")))?;

    let module_mount_dir = module
        .filepath
        .parent()
        .unwrap_or_else(|| Path::new("/"))
        .to_path_buf();
    let mount = MountBuilder::default()
        .destination("/")
        .source(module_mount_dir)
        .typ("bind".to_string())
        .options(vec!["rbind".to_string(), "ro".to_string()])
        .build()
        .map_err(|e| YardError::internal(format!("failed to build mount for {id:?}: {e}")))?;

    SpecBuilder::default()
        .hostname(hostname.to_string())
        .process(process)
        .root(root)
        .mounts(vec![mount])
        .build()
        .map_err(|e| YardError::internal(format!("failed to generate spec for {id:?}: {e}")))
}

/// The process args are the CRI command + args; an empty command falls back
/// to the module filename alone.
fn process_args(module: &WasmModule, config: &ContainerConfig) -> Vec<String> {
    if config.command.is_empty() {
        let filename = module
            .filepath
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        return vec![filename];
    }
    let mut args = config.command.clone();
    args.extend(config.args.iter().cloned());
    args
}

/// Copies resource constraints from the container config into the status.
pub fn resources_from_config(config: &ContainerConfig) -> Option<Resources> {
    let resources = config.linux.as_ref()?.resources.as_ref()?;
    Some(Resources {
        cpu_period: resources.cpu_period,
        cpu_quota: resources.cpu_quota,
        cpu_shares: resources.cpu_shares,
        memory_limit_in_bytes: resources.memory_limit_in_bytes,
        oom_score_adj: resources.oom_score_adj,
        cpuset_cpus: resources.cpuset_cpus.clone(),
        cpuset_mems: resources.cpuset_mems.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::module::WasmModuleSpec;
    use chrono::Utc;
    use std::path::PathBuf;

    fn module() -> WasmModule {
        WasmModule {
            id: "mod-id".to_string(),
            name: "app".to_string(),
            filepath: PathBuf::from("/wasmmodules/mod-id/app.wasm"),
            size: 4,
            spec: WasmModuleSpec::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn empty_command_falls_back_to_module_filename() {
        let config = ContainerConfig::default();
        let sandbox_config = PodSandboxConfig::default();
        let spec = build_wasm_spec("id", &module(), &config, &sandbox_config, "host-1").unwrap();

        let process = spec.process().as_ref().unwrap();
        assert_eq!(
            process.args().as_ref().unwrap(),
            &vec!["app.wasm".to_string()]
        );
        assert!(
            process
                .env()
                .as_ref()
                .unwrap()
                .contains(&"HOSTNAME=host-1".to_string())
        );
    }

    #[test]
    fn command_and_args_are_concatenated() {
        let config = ContainerConfig {
            command: vec!["app.wasm".to_string()],
            args: vec!["test".to_string()],
            ..ContainerConfig::default()
        };
        let spec = build_wasm_spec(
            "id",
            &module(),
            &config,
            &PodSandboxConfig::default(),
            "host-1",
        )
        .unwrap();
        assert_eq!(
            spec.process().as_ref().unwrap().args().as_ref().unwrap(),
            &vec!["app.wasm".to_string(), "test".to_string()]
        );
    }

    #[test]
    fn module_directory_is_mounted_at_root() {
        let spec = build_wasm_spec(
            "id",
            &module(),
            &ContainerConfig::default(),
            &PodSandboxConfig::default(),
            "host-1",
        )
        .unwrap();
        let mounts = spec.mounts().as_ref().unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].destination(), &PathBuf::from("/"));
        assert_eq!(
            mounts[0].source().as_ref().unwrap(),
            &PathBuf::from("/wasmmodules/mod-id")
        );
    }
}
