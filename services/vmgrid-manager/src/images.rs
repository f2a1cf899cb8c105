// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! OS image catalog.
//!
//! Images live on disk under one directory per image id, next to a
//! `meta.json` describing the payload file. Agents fetch the payload
//! through the signature-gated download route; the orchestrator resolves
//! ids through the [`ImageCatalog`] trait so tests can substitute a stub.
//!
//! Layout:
//!
//! ```text
//! {OS_IMAGE_DIR}/debian-12/meta.json
//! {OS_IMAGE_DIR}/debian-12/debian-12-genericcloud-amd64.qcow2
//! ```
//!
//! The sha256 is computed on first use and written back into `meta.json`
//! so later downloads reuse it.

use std::io::Read;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;
use vmgrid_agent_api::FormatMode;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("unknown image {0:?}")]
    NotFound(String),

    #[error("invalid image id {0:?}")]
    BadId(String),

    #[error("image metadata for {id:?} unreadable: {detail}")]
    BadMetadata { id: String, detail: String },

    #[error("image io failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Contents of an image's `meta.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ImageMeta {
    filename: String,
    #[serde(rename = "type")]
    mode: FormatMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bytes: Option<u64>,
}

/// A resolved image, ready to hand to an agent.
#[derive(Debug, Clone)]
pub struct ImageInfo {
    pub os_name: String,
    pub filename: String,
    pub mode: FormatMode,
    pub sha256: String,
    pub bytes: u64,
    /// Absolute path of the payload file.
    pub path: PathBuf,
}

#[async_trait]
pub trait ImageCatalog: Send + Sync {
    async fn resolve(&self, os_name: &str) -> Result<ImageInfo, ImageError>;
}

/// Directory-backed [`ImageCatalog`].
pub struct DirImageCatalog {
    root: PathBuf,
}

impl DirImageCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Image ids become path components, so anything that could step out
    /// of the catalog directory is rejected outright.
    fn checked_id(os_name: &str) -> Result<&str, ImageError> {
        let ok = !os_name.is_empty()
            && !os_name.starts_with('.')
            && os_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if ok {
            Ok(os_name)
        } else {
            Err(ImageError::BadId(os_name.to_string()))
        }
    }

    fn meta_path(&self, os_name: &str) -> PathBuf {
        self.root.join(os_name).join("meta.json")
    }

    fn read_meta(&self, os_name: &str) -> Result<ImageMeta, ImageError> {
        let path = self.meta_path(os_name);
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ImageError::NotFound(os_name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&raw).map_err(|e| ImageError::BadMetadata {
            id: os_name.to_string(),
            detail: e.to_string(),
        })
    }

    fn write_meta(&self, os_name: &str, meta: &ImageMeta) -> Result<(), ImageError> {
        let raw = serde_json::to_vec_pretty(meta).map_err(|e| ImageError::BadMetadata {
            id: os_name.to_string(),
            detail: e.to_string(),
        })?;
        std::fs::write(self.meta_path(os_name), raw)?;
        Ok(())
    }
}

#[async_trait]
impl ImageCatalog for DirImageCatalog {
    async fn resolve(&self, os_name: &str) -> Result<ImageInfo, ImageError> {
        let os_name = Self::checked_id(os_name)?.to_string();
        let mut meta = self.read_meta(&os_name)?;
        // The payload filename comes from metadata we control, but keep it
        // a bare filename anyway.
        if meta.filename.contains('/') || meta.filename.contains("..") {
            return Err(ImageError::BadMetadata {
                id: os_name.clone(),
                detail: format!("suspicious filename {:?}", meta.filename),
            });
        }
        let path = self.root.join(&os_name).join(&meta.filename);
        if !path.is_file() {
            return Err(ImageError::NotFound(os_name));
        }

        let bytes = std::fs::metadata(&path)?.len();
        let refresh = meta.sha256.is_none() || meta.bytes != Some(bytes);
        let sha256 = match (&meta.sha256, refresh) {
            (Some(sum), false) => sum.clone(),
            _ => {
                info!(image = %os_name, bytes, "computing image checksum");
                let sum = {
                    let path = path.clone();
                    tokio::task::spawn_blocking(move || sha256_file(&path))
                        .await
                        .map_err(|e| ImageError::BadMetadata {
                            id: os_name.clone(),
                            detail: e.to_string(),
                        })??
                };
                meta.sha256 = Some(sum.clone());
                meta.bytes = Some(bytes);
                self.write_meta(&os_name, &meta)?;
                sum
            }
        };

        Ok(ImageInfo {
            os_name,
            filename: meta.filename,
            mode: meta.mode,
            sha256,
            bytes,
            path,
        })
    }
}

fn sha256_file(path: &Path) -> Result<String, std::io::Error> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
