// Firmware download
//
// Streams the firmware binary into `<file>.part`, renames it into place on
// success and hands the result to `FirmwareArtifact` for length and hash.
// Any failure aborts immediately and removes the partial file.

use crate::artifact::FirmwareArtifact;
use crate::config::DownloadConfig;
use crate::error::DownloadError;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

const USER_AGENT: &str = concat!("sonic-sabotage/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DownloadProgress {
    /// Server declared a content length.
    Percent { percent: u8 },
    /// No content length; only the byte count is known.
    Indeterminate { bytes: u64 },
}

impl Default for DownloadProgress {
    fn default() -> Self {
        DownloadProgress::Indeterminate { bytes: 0 }
    }
}

pub fn http_client() -> Result<reqwest::Client, DownloadError> {
    Ok(reqwest::Client::builder().user_agent(USER_AGENT).build()?)
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Download the configured firmware into the configured directory.
pub async fn download_firmware(
    config: &DownloadConfig,
    progress: &watch::Sender<DownloadProgress>,
) -> Result<FirmwareArtifact, DownloadError> {
    let client = http_client()?;
    download_to(&client, &config.url(), &config.destination(), progress).await
}

pub async fn download_to(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
    progress: &watch::Sender<DownloadProgress>,
) -> Result<FirmwareArtifact, DownloadError> {
    let io_err = |path: &Path, source: std::io::Error| DownloadError::Io {
        path: path.display().to_string(),
        source,
    };

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_err(parent, e))?;
    }

    let part = partial_path(dest);
    tlog!("[download] GET {url} -> {}", dest.display());
    if let Err(e) = fetch(client, url, &part, progress).await {
        tlog!("[download] Failed: {e}");
        if let Err(rm) = tokio::fs::remove_file(&part).await {
            if rm.kind() != std::io::ErrorKind::NotFound {
                tlog!("[download] Could not remove {}: {rm}", part.display());
            }
        }
        return Err(e);
    }

    tokio::fs::rename(&part, dest)
        .await
        .map_err(|e| io_err(dest, e))?;
    let artifact = FirmwareArtifact::from_path(dest).await?;
    tlog!("[download] Saved {} ({} bytes)", dest.display(), artifact.len);
    Ok(artifact)
}

async fn fetch(
    client: &reqwest::Client,
    url: &str,
    part: &Path,
    progress: &watch::Sender<DownloadProgress>,
) -> Result<u64, DownloadError> {
    let io_err = |source: std::io::Error| DownloadError::Io {
        path: part.display().to_string(),
        source,
    };

    let mut response = client.get(url).send().await?.error_for_status()?;
    let total = response.content_length().filter(|&len| len > 0);
    let mut file = tokio::fs::File::create(part).await.map_err(io_err)?;

    let mut received = 0u64;
    progress.send_replace(match total {
        Some(_) => DownloadProgress::Percent { percent: 0 },
        None => DownloadProgress::Indeterminate { bytes: 0 },
    });
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await.map_err(io_err)?;
        received += chunk.len() as u64;
        progress.send_replace(match total {
            Some(total) => DownloadProgress::Percent {
                percent: (received.saturating_mul(100) / total).min(100) as u8,
            },
            None => DownloadProgress::Indeterminate { bytes: received },
        });
    }
    file.flush().await.map_err(io_err)?;
    Ok(received)
}
