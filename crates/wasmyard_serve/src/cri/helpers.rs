use std::collections::HashMap;

use crate::constants::{
    COMPLETE_EXIT_REASON, ERROR_EXIT_REASON, WASM_INSTANCE_LABEL_VALUE, WASM_MODULE_URL_ANNOTATION,
    WORKLOAD_KIND_LABEL_KEY,
};
use crate::grpc::cri_proto::{
    Container, ContainerMetadata, ContainerState, ContainerStatus, Image, ImageSpec,
    PodSandboxMetadata,
};
use crate::store::instance::WasmInstance;
use crate::store::module::WasmModule;
use crate::store::status::InstanceState;

/// An image spec with the wasm module url annotation is a wasm module; the
/// same predicate marks containers created from one.
pub fn is_wasm(annotations: &HashMap<String, String>) -> bool {
    annotations.contains_key(WASM_MODULE_URL_ANNOTATION)
}

pub fn is_wasm_image(image: &ImageSpec) -> bool {
    is_wasm(&image.annotations)
}

/// Composite workload name: kubelet container metadata joined with the
/// sandbox identity, so restarts of the same container collide by design.
pub fn make_instance_name(
    metadata: &ContainerMetadata,
    sandbox_metadata: &PodSandboxMetadata,
) -> String {
    [
        metadata.name.as_str(),
        sandbox_metadata.name.as_str(),
        sandbox_metadata.namespace.as_str(),
        sandbox_metadata.uid.as_str(),
        &metadata.attempt.to_string(),
    ]
    .join("_")
}

/// Copies the CRI labels and tags the workload kind.
pub fn build_labels(config_labels: &HashMap<String, String>) -> HashMap<String, String> {
    let mut labels = config_labels.clone();
    labels.insert(
        WORKLOAD_KIND_LABEL_KEY.to_string(),
        WASM_INSTANCE_LABEL_VALUE.to_string(),
    );
    labels
}

pub fn to_cri_state(state: InstanceState) -> ContainerState {
    match state {
        InstanceState::Created => ContainerState::ContainerCreated,
        InstanceState::Running => ContainerState::ContainerRunning,
        InstanceState::Exited => ContainerState::ContainerExited,
        InstanceState::Unknown => ContainerState::ContainerUnknown,
    }
}

/// Uniform projection of a wasm instance onto the CRI container shape.
pub fn wasm_to_cri_container(instance: &WasmInstance) -> Container {
    let status = instance.status.get();
    let meta = &instance.metadata;
    Container {
        id: meta.id.clone(),
        pod_sandbox_id: meta.sandbox_id.clone(),
        metadata: meta.config.metadata.clone(),
        image: meta.config.image.clone(),
        image_ref: meta.module_ref.clone(),
        state: to_cri_state(status.state()) as i32,
        created_at: status.created_at,
        labels: meta.labels.clone(),
        annotations: meta.config.annotations.clone(),
    }
}

/// Full status projection, synthesizing an exit reason when none was set.
pub fn wasm_to_cri_container_status(instance: &WasmInstance) -> ContainerStatus {
    let status = instance.status.get();
    let meta = &instance.metadata;
    let state = status.state();

    let mut reason = status.reason.clone();
    if state == InstanceState::Exited && reason.is_empty() {
        reason = if status.exit_code == 0 {
            COMPLETE_EXIT_REASON.to_string()
        } else {
            ERROR_EXIT_REASON.to_string()
        };
    }

    // Created instances report no start/finish timestamps yet.
    let (started_at, finished_at) = match state {
        InstanceState::Running => (status.started_at, 0),
        InstanceState::Exited | InstanceState::Unknown => (status.started_at, status.finished_at),
        InstanceState::Created => (0, 0),
    };

    ContainerStatus {
        id: meta.id.clone(),
        metadata: meta.config.metadata.clone(),
        state: to_cri_state(state) as i32,
        created_at: status.created_at,
        started_at,
        finished_at,
        exit_code: status.exit_code,
        image: meta.config.image.clone(),
        image_ref: meta.module_ref.clone(),
        reason,
        message: status.message.clone(),
        labels: meta.config.labels.clone(),
        annotations: meta.config.annotations.clone(),
        log_path: meta.log_path.clone(),
        resources: status.resources.as_ref().map(|r| {
            crate::grpc::cri_proto::LinuxContainerResources {
                cpu_period: r.cpu_period,
                cpu_quota: r.cpu_quota,
                cpu_shares: r.cpu_shares,
                memory_limit_in_bytes: r.memory_limit_in_bytes,
                oom_score_adj: r.oom_score_adj,
                cpuset_cpus: r.cpuset_cpus.clone(),
                cpuset_mems: r.cpuset_mems.clone(),
            }
        }),
    }
}

/// Projects a wasm module onto the CRI image shape.
pub fn wasm_to_cri_image(module: &WasmModule) -> Image {
    Image {
        id: module.id.clone(),
        repo_tags: vec![module.name.clone()],
        repo_digests: vec![module.id.clone()],
        size: module.size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wasm_predicate_keys_on_the_url_annotation() {
        let mut annotations = HashMap::new();
        assert!(!is_wasm(&annotations));
        annotations.insert(
            WASM_MODULE_URL_ANNOTATION.to_string(),
            "http://example.com/app.wasm".to_string(),
        );
        assert!(is_wasm(&annotations));
    }

    #[test]
    fn instance_name_is_composite() {
        let metadata = ContainerMetadata {
            name: "app".to_string(),
            attempt: 2,
        };
        let sandbox_metadata = PodSandboxMetadata {
            name: "sandbox1".to_string(),
            uid: "uid-1".to_string(),
            namespace: "default".to_string(),
            attempt: 0,
        };
        assert_eq!(
            make_instance_name(&metadata, &sandbox_metadata),
            "app_sandbox1_default_uid-1_2"
        );
    }

    #[test]
    fn labels_are_tagged_with_the_workload_kind() {
        let labels = build_labels(&HashMap::from([("a".to_string(), "b".to_string())]));
        assert_eq!(
            labels.get(WORKLOAD_KIND_LABEL_KEY).map(String::as_str),
            Some(WASM_INSTANCE_LABEL_VALUE)
        );
        assert_eq!(labels.get("a").map(String::as_str), Some("b"));
    }
}
