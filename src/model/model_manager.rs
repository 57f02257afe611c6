use crate::{
    error::{Result, SeparationError},
    io::{
        crypto::verify_sha256,
        net::{download_with_progress, http_client},
        paths::models_cache_dir,
    },
    model::registry::resolve_manifest_url,
    types::ModelManifest,
};

use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{info, warn};

#[derive(Clone, Debug)]
pub struct ModelHandle {
    pub manifest: ModelManifest,
    pub local_path: PathBuf,
}

fn fetch_manifest(model_name: &str, manifest_url_override: Option<&str>) -> Result<ModelManifest> {
    let manifest_url = match manifest_url_override {
        Some(url) => url.to_string(),
        None => resolve_manifest_url(model_name)?,
    };

    let client = http_client()?;
    let manifest: ModelManifest = client
        .get(&manifest_url)
        .send()?
        .error_for_status()?
        .json()?;
    Ok(manifest)
}

/// Fetch the manifest and make sure its primary artifact sits verified in the cache.
pub fn ensure_model(model_name: &str, manifest_url_override: Option<&str>) -> Result<ModelHandle> {
    let manifest = fetch_manifest(model_name, manifest_url_override)?;

    let a = manifest
        .resolve_primary_artifact()
        .map_err(SeparationError::Manifest)?
        .clone();
    if a.sha256.len() < 8 {
        return Err(SeparationError::Manifest(format!(
            "artifact `{}` has no usable sha256",
            a.file
        )));
    }

    let cache_dir = models_cache_dir()?;
    fs::create_dir_all(&cache_dir)?;
    let ext = a
        .file
        .rsplit('.')
        .next()
        .map(|s| format!(".{s}"))
        .unwrap_or_default();
    let file_name = format!("{}-{}{}", manifest.name, &a.sha256[..8], ext);
    let local_path = cache_dir.join(file_name);

    let need_download = !matches!(verify_sha256(&local_path, &a.sha256), Ok(true));
    if need_download {
        info!(model = %manifest.name, url = %a.url, "downloading model artifact");
        let client = http_client()?;
        download_with_progress(&client, &a.url, &local_path)?;
        if !verify_sha256(&local_path, &a.sha256)? {
            fs::remove_file(&local_path).ok();
            return Err(SeparationError::Checksum {
                path: local_path.display().to_string(),
            });
        }
        if a.size_bytes > 0 {
            let size = fs::metadata(&local_path).map(|m| m.len()).unwrap_or(0);
            if size != a.size_bytes {
                warn!(
                    path = %local_path.display(),
                    expected = a.size_bytes,
                    got = size,
                    "model size mismatch"
                );
            }
        }
    } else {
        info!(path = %local_path.display(), "using cached model");
    }

    Ok(ModelHandle {
        manifest,
        local_path,
    })
}

/// Pair a local model file with the manifest describing it.
pub fn load_model_from_path(
    path: &Path,
    model_name: &str,
    manifest_url_override: Option<&str>,
) -> Result<ModelHandle> {
    if !path.is_file() {
        return Err(SeparationError::Manifest(format!(
            "model file not found: {}",
            path.display()
        )));
    }
    let manifest = fetch_manifest(model_name, manifest_url_override)?;
    Ok(ModelHandle {
        manifest,
        local_path: path.to_path_buf(),
    })
}

/// Local file when `model_path` is given, otherwise the cached download.
pub fn prepare_model(
    model_name: &str,
    manifest_url_override: Option<&str>,
    model_path: Option<&Path>,
) -> Result<ModelHandle> {
    match model_path {
        Some(path) => load_model_from_path(path, model_name, manifest_url_override),
        None => ensure_model(model_name, manifest_url_override),
    }
}
