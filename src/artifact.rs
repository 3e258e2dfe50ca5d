// Firmware artifact
//
// Length and SHA-256 of a firmware file, always computed together in a
// single pass over the same open file.

use crate::error::ArtifactError;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;

const READ_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FirmwareArtifact {
    pub path: PathBuf,
    pub len: u64,
    /// Lowercase hex, 64 characters.
    pub sha256: String,
}

impl FirmwareArtifact {
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, ArtifactError> {
        let path = path.as_ref();
        let io_err = |source: std::io::Error| ArtifactError::Io {
            path: path.display().to_string(),
            source,
        };

        let mut file = tokio::fs::File::open(path).await.map_err(io_err)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; READ_BUFFER];
        let mut len = 0u64;
        loop {
            let n = file.read(&mut buf).await.map_err(io_err)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            len += n as u64;
        }

        if len == 0 {
            return Err(ArtifactError::Empty(path.display().to_string()));
        }

        let artifact = Self {
            path: path.to_path_buf(),
            len,
            sha256: hex::encode(hasher.finalize()),
        };
        tlog!(
            "[artifact] {} ({} bytes, sha256 {})",
            artifact.path.display(),
            artifact.len,
            artifact.sha256
        );
        Ok(artifact)
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// SHA-256 of an in-memory buffer as lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
