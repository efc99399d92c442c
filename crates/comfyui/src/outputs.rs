//! Output image discovery and download for a finished prompt.

use std::path::{Component, Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;

use crate::api::{ComfyUIApi, ComfyUIApiError, ImageKind};

/// One image reference from a history `outputs` record.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OutputImage {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// List every `output`-type image recorded for `prompt_id`.
///
/// Accepts both the `/history/{id}` shape (`{id: {outputs: ...}}`) and a
/// bare `{outputs: ...}` record. Preview (`temp`) images are skipped.
pub fn extract_output_images(history: &Value, prompt_id: &str) -> Vec<OutputImage> {
    let outputs = history
        .get(prompt_id)
        .and_then(|entry| entry.get("outputs"))
        .or_else(|| history.get("outputs"));

    let Some(outputs) = outputs.and_then(Value::as_object) else {
        return Vec::new();
    };

    outputs
        .values()
        .filter_map(|node_output| node_output.get("images").and_then(Value::as_array))
        .flatten()
        .filter_map(|image| serde_json::from_value::<OutputImage>(image.clone()).ok())
        .filter(|image| image.kind == ImageKind::Output.as_str())
        .collect()
}

/// Where an output image is written under `output_dir`.
///
/// The server's subfolder is kept so equally named images from different
/// subfolders stay apart. Only plain path components survive: `..`, root
/// and prefix parts are dropped, as is any directory part of the filename.
/// `None` when the filename has no usable final component.
pub fn local_output_path(output_dir: &Path, image: &OutputImage) -> Option<PathBuf> {
    let name = Path::new(&image.filename).file_name()?;

    let mut path = output_dir.to_path_buf();
    for part in Path::new(&image.subfolder).components() {
        if let Component::Normal(part) = part {
            path.push(part);
        }
    }
    path.push(name);
    Some(path)
}

/// Download every output image of `prompt_id` into `output_dir`.
///
/// Files are written to [`local_output_path`]. Returns the written paths
/// in history order (empty when the prompt produced no output images).
pub async fn collect_outputs(
    api: &ComfyUIApi,
    prompt_id: &str,
    output_dir: &Path,
) -> Result<Vec<PathBuf>, ComfyUIApiError> {
    let history = api.get_history(prompt_id).await?;
    let images = extract_output_images(&history, prompt_id);
    if images.is_empty() {
        return Ok(Vec::new());
    }

    let mut written: Vec<PathBuf> = Vec::with_capacity(images.len());
    for image in &images {
        let Some(path) = local_output_path(output_dir, image) else {
            tracing::warn!(filename = %image.filename, "Skipping output with unusable filename");
            continue;
        };
        if written.contains(&path) {
            tracing::warn!(
                prompt_id = %prompt_id,
                path = %path.display(),
                "Skipping output that maps to an already written file",
            );
            continue;
        }

        let bytes = api
            .get_image(&image.filename, &image.subfolder, &image.kind)
            .await?;

        let dir = path.parent().unwrap_or(output_dir);
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| ComfyUIApiError::Io {
                path: dir.to_path_buf(),
                source,
            })?;

        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|source| ComfyUIApiError::Io {
                path: path.clone(),
                source,
            })?;

        tracing::info!(
            prompt_id = %prompt_id,
            path = %path.display(),
            bytes = bytes.len(),
            "Saved output image",
        );
        written.push(path);
    }

    Ok(written)
}
