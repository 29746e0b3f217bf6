//! Image status, removal, and listing for wasm modules.

use crate::cri::CriService;
use crate::cri::helpers::wasm_to_cri_image;
use crate::error::{YardError, YardResult};
use crate::grpc::cri_proto::{
    ImageStatusRequest, ImageStatusResponse, ListImagesRequest, ListImagesResponse,
    RemoveImageRequest, RemoveImageResponse,
};

impl CriService {
    /// Returns the module's image projection, or an empty response when the
    /// reference is unknown (CRI expects no error for absent images).
    pub(crate) fn wasm_image_status(&self, r: ImageStatusRequest) -> YardResult<ImageStatusResponse> {
        let image = r
            .image
            .ok_or_else(|| YardError::invalid_argument("image spec is required"))?;

        let module = match self.module_store.get(&image.image) {
            Ok(module) => module,
            Err(e) if e.is_not_found() => {
                return Ok(ImageStatusResponse {
                    image: None,
                    info: Default::default(),
                });
            }
            Err(e) => return Err(e.context(format!("failed to resolve {:?}", image.image))),
        };

        let mut info = std::collections::HashMap::new();
        if r.verbose {
            info.insert(
                "moduleSpec".to_string(),
                serde_json::to_string(&module.spec)?,
            );
        }

        Ok(ImageStatusResponse {
            image: Some(wasm_to_cri_image(&module)),
            info,
        })
    }

    /// Removes the module payload from disk, then drops the store entry.
    pub(crate) fn remove_wasm_module(&self, r: RemoveImageRequest) -> YardResult<RemoveImageResponse> {
        let image = r
            .image
            .ok_or_else(|| YardError::invalid_argument("image spec is required"))?;
        let name = &image.image;

        let module = match self.module_store.get(name) {
            Ok(module) => module,
            // Removing an absent image succeeds per CRI semantics.
            Err(e) if e.is_not_found() => return Ok(RemoveImageResponse {}),
            Err(e) => return Err(e.context(format!("failed to get wasm module {name:?}"))),
        };

        let module_dir = module
            .filepath
            .parent()
            .map(std::path::Path::to_path_buf)
            .unwrap_or_else(|| module.filepath.clone());
        if let Err(e) = std::fs::remove_dir_all(&module_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(YardError::internal(format!(
                    "failed to delete wasm module files {}: {e}",
                    module_dir.display()
                )));
            }
        }

        self.module_store
            .delete(&module.name)
            .map_err(|e| e.context(format!("failed to delete wasm module {name:?}")))?;
        Ok(RemoveImageResponse {})
    }

    pub(crate) fn list_wasm_images(&self, r: ListImagesRequest) -> ListImagesResponse {
        let filter_ref = r
            .filter
            .and_then(|f| f.image)
            .map(|image| image.image)
            .filter(|image| !image.is_empty());

        let images = self
            .module_store
            .list()
            .iter()
            .filter(|module| match &filter_ref {
                Some(wanted) => &module.name == wanted || &module.id == wanted,
                None => true,
            })
            .map(wasm_to_cri_image)
            .collect();
        ListImagesResponse { images }
    }
}
