//! Image downloading with content-addressed basenames.

use std::path::{Path, PathBuf};

use reqwest::header::{REFERER, USER_AGENT};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{ArchiveError, Result};
use crate::urls;

use super::BOT_USER_AGENT;

/// Cap on downloaded image size.
const IMAGE_MAX_BYTES: usize = 10 * 1024 * 1024;

/// Extensions accepted as-is; anything else becomes `.jpg`.
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "svg", "bmp", "ico"];

/// Downloads an image into `images_dir` under a SHA-256-derived basename.
///
/// Idempotent: when the destination file already exists its path is
/// returned without a fetch. The body is written to a temporary file and
/// renamed into place so partial downloads never become visible.
pub async fn download_image(
    client: &reqwest::Client,
    images_dir: &Path,
    image_url: &str,
    referer: &str,
) -> Result<PathBuf> {
    // Validates the URL early; the extension comes from its path.
    let parsed = url::Url::parse(image_url).map_err(|source| ArchiveError::InvalidUrl {
        url: image_url.to_string(),
        source,
    })?;

    let extension = image_extension(parsed.path());
    let basename = format!("{}.{extension}", urls::file_basename_stem(image_url));
    let destination = images_dir.join(&basename);

    if tokio::fs::try_exists(&destination).await.unwrap_or(false) {
        debug!(path = %destination.display(), "image already downloaded");
        return Ok(destination);
    }

    let response = client
        .get(image_url)
        .header(USER_AGENT, BOT_USER_AGENT)
        .header(REFERER, referer)
        .send()
        .await
        .map_err(|err| ArchiveError::FetchFailed {
            url: image_url.to_string(),
            reason: err.to_string(),
        })?;

    if !response.status().is_success() {
        return Err(ArchiveError::FetchFailed {
            url: image_url.to_string(),
            reason: format!("status {}", response.status()),
        });
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_lowercase();
    if !content_type.starts_with("image/") {
        return Err(ArchiveError::SkippedContent(format!(
            "not an image content type: {content_type}"
        )));
    }

    write_capped(response, &destination, IMAGE_MAX_BYTES, image_url).await?;
    debug!(url = image_url, path = %destination.display(), "image downloaded");
    Ok(destination)
}

/// Streams a response body into `destination` via a temp file, keeping at
/// most `cap` bytes.
pub(super) async fn write_capped(
    mut response: reqwest::Response,
    destination: &Path,
    cap: usize,
    source_url: &str,
) -> Result<()> {
    let tmp = destination.with_extension("tmp");
    let mut file = tokio::fs::File::create(&tmp)
        .await
        .map_err(|err| ArchiveError::FetchFailed {
            url: source_url.to_string(),
            reason: format!("create temp file: {err}"),
        })?;

    let mut written = 0usize;
    let outcome = loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let remaining = cap.saturating_sub(written);
                if remaining == 0 {
                    break Ok(());
                }
                let slice = &chunk[..chunk.len().min(remaining)];
                if let Err(err) = file.write_all(slice).await {
                    break Err(ArchiveError::FetchFailed {
                        url: source_url.to_string(),
                        reason: format!("write body: {err}"),
                    });
                }
                written += slice.len();
            }
            Ok(None) => break Ok(()),
            Err(err) => {
                break Err(ArchiveError::FetchFailed {
                    url: source_url.to_string(),
                    reason: format!("read body: {err}"),
                })
            }
        }
    };

    if let Err(err) = outcome {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(err);
    }

    file.flush().await.ok();
    drop(file);
    tokio::fs::rename(&tmp, destination)
        .await
        .map_err(|err| {
            ArchiveError::FetchFailed {
                url: source_url.to_string(),
                reason: format!("rename into place: {err}"),
            }
        })?;
    Ok(())
}

fn image_extension(url_path: &str) -> String {
    let extension = Path::new(url_path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.trim().to_lowercase())
        .unwrap_or_default();
    if IMAGE_EXTENSIONS.contains(&extension.as_str()) {
        extension
    } else {
        "jpg".to_string()
    }
}
