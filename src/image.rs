//! Resolves `source_image` (a local path or a download URL) to a single
//! cached raw image file, once per orchestrator run, before any per-VM
//! cloning (C6) begins.

use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::AsyncWriteExt;

use crate::config::SourceImage;
use crate::error::VmBuilderError;

/// Download a response body to a file, updating the progress bar as chunks arrive.
async fn download_to_file(
    path: &Path,
    response: reqwest::Response,
    pb: &ProgressBar,
) -> Result<(), VmBuilderError> {
    let mut file = tokio::fs::File::create(path).await.map_err(|e| VmBuilderError::Io {
        context: format!("creating temp file {}", path.display()),
        source: e,
    })?;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| VmBuilderError::ImageDownload {
            message: "error reading response body".into(),
            source: Box::new(e),
        })?;
        file.write_all(&chunk).await.map_err(|e| VmBuilderError::Io {
            context: "writing image data".into(),
            source: e,
        })?;
        pb.inc(chunk.len() as u64);
    }

    file.flush().await.map_err(|e| VmBuilderError::Io { context: "flushing image file".into(), source: e })?;

    Ok(())
}

/// Ensure `source_image` is available as a local raw image, downloading it
/// if it names a URL. Returns the path to the cached/local image file.
pub async fn ensure_source_image(source: &SourceImage, cache_dir: &Path) -> Result<PathBuf, VmBuilderError> {
    if let Some(path) = &source.path {
        let path = PathBuf::from(path);
        if !path.exists() {
            return Err(VmBuilderError::Io {
                context: format!("source image not found: {}", path.display()),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
            });
        }
        return Ok(path);
    }

    let url = source.url.as_deref().ok_or_else(|| VmBuilderError::Validation {
        message: "source_image has neither path nor url".into(),
    })?;

    let filename = url.rsplit('/').next().unwrap_or("image.raw");

    tokio::fs::create_dir_all(cache_dir).await.map_err(|e| VmBuilderError::Io {
        context: format!("creating cache dir {}", cache_dir.display()),
        source: e,
    })?;

    let dest = cache_dir.join(filename);
    if dest.exists() {
        tracing::info!(path = %dest.display(), "using cached source image");
        return Ok(dest);
    }

    tracing::info!(url, "downloading source image");

    let response = reqwest::get(url).await.map_err(|e| VmBuilderError::ImageDownload {
        message: format!("request to {url} failed"),
        source: Box::new(e),
    })?;

    if !response.status().is_success() {
        return Err(VmBuilderError::ImageDownload {
            message: format!("HTTP {} from {url}", response.status()),
            source: format!("HTTP {}", response.status()).into(),
        });
    }

    let total_size = response.content_length().unwrap_or(0);

    let pb = ProgressBar::new(total_size);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .unwrap()
            .progress_chars("#>-"),
    );

    let tmp_path = dest.with_extension("part");
    let _ = tokio::fs::remove_file(&tmp_path).await;

    if let Err(e) = download_to_file(&tmp_path, response, &pb).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }

    tokio::fs::rename(&tmp_path, &dest).await.map_err(|e| VmBuilderError::Io {
        context: format!("renaming {} to {}", tmp_path.display(), dest.display()),
        source: e,
    })?;

    pb.finish_with_message("download complete");
    tracing::info!(path = %dest.display(), "source image cached");

    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn uses_local_path_directly_without_downloading() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("ubuntu.raw");
        tokio::fs::write(&img, b"raw image bytes").await.unwrap();
        let source = SourceImage { path: Some(img.to_string_lossy().into_owned()), url: None };
        let resolved = ensure_source_image(&source, dir.path()).await.unwrap();
        assert_eq!(resolved, img);
    }

    #[tokio::test]
    async fn missing_local_path_errors() {
        let dir = tempfile::tempdir().unwrap();
        let source = SourceImage { path: Some("/no/such/image.raw".into()), url: None };
        assert!(ensure_source_image(&source, dir.path()).await.is_err());
    }
}
