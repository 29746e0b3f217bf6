//! Module pull pipeline.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE;
use chrono::Utc;
use sha2::{Digest as _, Sha256};

use crate::constants::{
    DEFAULT_MODULE_STOP_SIGNAL, WASM_MODULE_FILENAME_ANNOTATION, WASM_MODULE_STOP_SIGNAL_ANNOTATION,
    WASM_MODULE_URL_ANNOTATION,
};
use crate::cri::CriService;
use crate::error::{YardError, YardResult};
use crate::grpc::cri_proto::{PullImageRequest, PullImageResponse};
use crate::store::module::{WasmModule, WasmModuleSpec};

impl CriService {
    /// Pulls a wasm module by URL into the content-addressed store.
    ///
    /// Pulling an already-present name is a no-op returning the existing id.
    /// The store insert happens before the disk write; a failed write rolls
    /// the insert back so no orphaned entry survives.
    pub(crate) async fn pull_wasm_module(
        &self,
        r: PullImageRequest,
    ) -> YardResult<PullImageResponse> {
        let image = r
            .image
            .ok_or_else(|| YardError::invalid_argument("image spec is required"))?;
        let name = image.image.clone();

        if let Ok(id) = self.module_store.resolve(&name) {
            tracing::info!("Wasm module {name:?} already exists, skipping pull");
            return Ok(PullImageResponse { image_ref: id });
        }

        let url = image
            .annotations
            .get(WASM_MODULE_URL_ANNOTATION)
            .cloned()
            .unwrap_or_default();
        let filename = image
            .annotations
            .get(WASM_MODULE_FILENAME_ANNOTATION)
            .filter(|f| !f.is_empty())
            .cloned()
            .ok_or_else(|| YardError::invalid_argument("wasm module filename is empty"))?;
        let stop_signal = image
            .annotations
            .get(WASM_MODULE_STOP_SIGNAL_ANNOTATION)
            .filter(|s| !s.is_empty())
            .cloned()
            .unwrap_or_else(|| {
                tracing::warn!(
                    "Stop signal not specified for {name:?}, using {DEFAULT_MODULE_STOP_SIGNAL}"
                );
                DEFAULT_MODULE_STOP_SIGNAL.to_string()
            });

        let body = fetch_wasm_module(&url)
            .await
            .map_err(|e| e.context(format!("failed to download wasm module {name:?}")))?;

        let id = URL_SAFE.encode(Sha256::digest(&body));
        let filepath = self.config.module_dir().join(&id).join(&filename);

        let now = Utc::now();
        let module = WasmModule {
            id: id.clone(),
            name: name.clone(),
            filepath: filepath.clone(),
            size: body.len() as u64,
            spec: WasmModuleSpec {
                url,
                stop_signal,
                annotations: image.annotations,
            },
            created_at: now,
            updated_at: now,
        };
        let metadata_path = module.metadata_path();
        let metadata = serde_json::to_vec(&module)?;

        self.module_store
            .add(module)
            .map_err(|e| e.context("failed to save wasm module"))?;

        // The store entry exists now; any disk failure below must remove it
        // again so a later pull can re-insert cleanly.
        if let Err(e) = persist_module(&filepath, &body, &metadata_path, &metadata) {
            if let Err(del_err) = self.module_store.delete(&name) {
                tracing::error!("Failed to roll back wasm module {name:?}: {del_err}");
            }
            return Err(e.context(format!("failed to save wasm module {name:?} to disk")));
        }

        tracing::debug!("Pulled wasm module {name:?} with id {id:?}");
        Ok(PullImageResponse { image_ref: id })
    }
}

async fn fetch_wasm_module(url: &str) -> YardResult<Vec<u8>> {
    let response = reqwest::get(url)
        .await
        .map_err(|e| YardError::internal(e.to_string()))?
        .error_for_status()
        .map_err(|e| YardError::internal(e.to_string()))?;
    let body = response
        .bytes()
        .await
        .map_err(|e| YardError::internal(e.to_string()))?;
    Ok(body.to_vec())
}

fn persist_module(
    filepath: &std::path::Path,
    body: &[u8],
    metadata_path: &std::path::Path,
    metadata: &[u8],
) -> YardResult<()> {
    let dir = filepath
        .parent()
        .ok_or_else(|| YardError::internal("module path has no parent directory"))?;
    std::fs::create_dir_all(dir)?;
    std::fs::write(filepath, body)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        std::fs::set_permissions(filepath, std::fs::Permissions::from_mode(0o644))?;
    }
    std::fs::write(metadata_path, metadata)?;
    Ok(())
}
