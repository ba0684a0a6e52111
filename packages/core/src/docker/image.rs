//! Image operations: build, pull, tag, remove, save, load.

use super::{DockerClient, DockerError};
use bollard::query_parameters::{
    BuildImageOptions, CreateImageOptions, RemoveImageOptions, TagImageOptions,
};
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures_util::StreamExt;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Check if an image exists locally on the client's host.
pub async fn image_exists(client: &DockerClient, reference: &str) -> Result<bool, DockerError> {
    match client.inner().inspect_image(reference).await {
        Ok(_) => Ok(true),
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        }) => Ok(false),
        Err(e) => Err(DockerError::from(e)),
    }
}

/// Image id for a reference, or `NotFound`.
pub async fn image_id(client: &DockerClient, reference: &str) -> Result<String, DockerError> {
    let info = client
        .inner()
        .inspect_image(reference)
        .await
        .map_err(DockerError::from)?;
    Ok(info.id.unwrap_or_default())
}

/// Reported size of an image in bytes, used to scale transfer progress.
pub async fn image_size(client: &DockerClient, reference: &str) -> Result<Option<u64>, DockerError> {
    let info = client
        .inner()
        .inspect_image(reference)
        .await
        .map_err(DockerError::from)?;
    Ok(info.size.filter(|s| *s > 0).map(|s| s as u64))
}

/// Create a gzipped tar of a build-context directory.
fn create_build_context(context_dir: &Path) -> std::io::Result<Vec<u8>> {
    let mut archive_buffer = Vec::new();
    {
        let encoder = GzEncoder::new(&mut archive_buffer, Compression::default());
        let mut tar = tar::Builder::new(encoder);
        tar.append_dir_all(".", context_dir)?;
        let encoder = tar.into_inner()?;
        encoder.finish()?;
    }
    Ok(archive_buffer)
}

/// Build `tag` from the Dockerfile in `context_dir`.
///
/// Streams build output; per-step messages are forwarded to `on_step`.
/// Returns the built image id when the daemon reports one.
pub async fn build_image(
    client: &DockerClient,
    context_dir: &Path,
    tag: &str,
    mut on_step: impl FnMut(&str),
) -> Result<Option<String>, DockerError> {
    if !context_dir.join("Dockerfile").exists() {
        return Err(DockerError::Build(format!(
            "Dockerfile not found in {}",
            context_dir.display()
        )));
    }

    debug!(host = client.host_label(), tag, "build image");
    let context = create_build_context(context_dir)
        .map_err(|e| DockerError::Build(format!("failed to create build context: {e}")))?;

    let options = BuildImageOptions {
        t: Some(tag.to_string()),
        dockerfile: "Dockerfile".to_string(),
        rm: true,
        ..Default::default()
    };

    let mut stream = client
        .inner()
        .build_image(options, None, Some(bollard::body_full(Bytes::from(context))));

    let mut maybe_image_id = None;
    while let Some(result) = stream.next().await {
        let info = result.map_err(|e| DockerError::Build(e.to_string()))?;
        if let Some(message) = info.stream {
            let message = message.trim();
            if !message.is_empty() {
                on_step(message);
            }
        }
        if let Some(error) = info.error_detail.and_then(|detail| detail.message) {
            return Err(DockerError::Build(error));
        }
        if let Some(bollard::models::BuildInfoAux::Default(image_id)) = info.aux {
            maybe_image_id = image_id.id;
        }
    }
    Ok(maybe_image_id)
}

/// Pull an image if absent. No-op when the reference is already local.
pub async fn pull_image_if_absent(
    client: &DockerClient,
    reference: &str,
) -> Result<(), DockerError> {
    if image_exists(client, reference).await? {
        return Ok(());
    }
    pull_image(client, reference).await
}

/// Pull an image, draining the layer progress stream.
pub async fn pull_image(client: &DockerClient, reference: &str) -> Result<(), DockerError> {
    debug!(host = client.host_label(), reference, "pull image");
    let (image, tag) = reference
        .rsplit_once(':')
        .unwrap_or((reference, "latest"));
    let options = CreateImageOptions {
        from_image: Some(image.to_string()),
        tag: Some(tag.to_string()),
        ..Default::default()
    };
    let mut stream = client.inner().create_image(Some(options), None, None);
    while let Some(result) = stream.next().await {
        result.map_err(DockerError::from)?;
    }
    Ok(())
}

pub async fn tag_image(
    client: &DockerClient,
    reference: &str,
    repo: &str,
    tag: &str,
) -> Result<(), DockerError> {
    debug!(host = client.host_label(), reference, repo, tag, "tag image");
    let options = TagImageOptions {
        repo: Some(repo.to_string()),
        tag: Some(tag.to_string()),
    };
    client
        .inner()
        .tag_image(reference, Some(options))
        .await
        .map_err(DockerError::from)
}

/// Remove an image without forcing. "In use" conflicts surface as
/// [`DockerError::Conflict`] so callers can skip cleanup gracefully.
pub async fn remove_image(client: &DockerClient, reference: &str) -> Result<(), DockerError> {
    debug!(host = client.host_label(), reference, "remove image");
    let options = RemoveImageOptions {
        force: false,
        noprune: false,
        platforms: None,
    };
    client
        .inner()
        .remove_image(reference, Some(options), None)
        .await
        .map_err(DockerError::from)?;
    Ok(())
}

/// Stream `docker save` output for an image into a file.
///
/// `on_bytes` receives the cumulative byte count after each chunk, letting
/// the migration engine map transfer volume onto its progress range.
pub async fn save_image_to_file(
    client: &DockerClient,
    reference: &str,
    path: &Path,
    mut on_bytes: impl FnMut(u64),
) -> Result<u64, DockerError> {
    debug!(host = client.host_label(), reference, path = %path.display(), "save image");
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| DockerError::Io(e.to_string()))?;

    let mut stream = client.inner().export_image(reference);
    let mut total: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(DockerError::from)?;
        total += chunk.len() as u64;
        file.write_all(&chunk)
            .await
            .map_err(|e| DockerError::Io(e.to_string()))?;
        on_bytes(total);
    }
    file.flush()
        .await
        .map_err(|e| DockerError::Io(e.to_string()))?;
    Ok(total)
}

/// `docker load` an image tarball from a file into the client's daemon.
pub async fn load_image_from_file(
    client: &DockerClient,
    path: &Path,
) -> Result<(), DockerError> {
    debug!(host = client.host_label(), path = %path.display(), "load image");
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| DockerError::Io(e.to_string()))?;
    let options = bollard::query_parameters::ImportImageOptions {
        quiet: false,
        ..Default::default()
    };
    let mut stream = client
        .inner()
        .import_image(options, bollard::body_full(Bytes::from(bytes)), None);
    while let Some(result) = stream.next().await {
        result.map_err(DockerError::from)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_context_is_gzip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM alpine:3.20\n").unwrap();
        let context = create_build_context(dir.path()).unwrap();
        assert!(!context.is_empty());
        assert_eq!(context[0], 0x1f);
        assert_eq!(context[1], 0x8b);
    }
}
