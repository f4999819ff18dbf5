//! On-disk bodies of stateful endpoint responses.
//!
//! Every distinct response body lives under
//! `responses/{endpoint}/xx/yy/{digest}`, with an advisory `{digest}.meta`
//! companion carrying the upstream `Last-Modified` when one was supplied.
//! Bodies are immutable; replaying a historical digest is just reading it
//! back.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::trace;

use keg_formats::key::partition_hex;
use keg_psv::PsvDocument;

use crate::error::{Error, Result};

#[derive(Debug, Serialize, Deserialize)]
struct ResponseMeta {
    #[serde(rename = "last-modified", skip_serializing_if = "Option::is_none")]
    last_modified: Option<String>,
}

/// Handle on the `responses/` tree.
#[derive(Debug, Clone)]
pub struct StateCache {
    cache_dir: PathBuf,
}

impl StateCache {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    /// Path a response body lives at.
    pub fn path_for(&self, endpoint: &str, digest: &str) -> Result<PathBuf> {
        Ok(self
            .cache_dir
            .join(endpoint.trim_matches('/'))
            .join(partition_hex(digest)?))
    }

    pub fn exists(&self, endpoint: &str, digest: &str) -> bool {
        self.path_for(endpoint, digest)
            .map(|p| p.is_file())
            .unwrap_or(false)
    }

    pub fn read(&self, endpoint: &str, digest: &str) -> Result<Vec<u8>> {
        let path = self.path_for(endpoint, digest)?;
        std::fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound {
                    kind: "response",
                    key: format!("{endpoint} {digest}"),
                }
            } else {
                e.into()
            }
        })
    }

    /// Replay a historical PSV response.
    pub fn read_psv(&self, endpoint: &str, digest: &str) -> Result<PsvDocument> {
        let body = self.read(endpoint, digest)?;
        let text = String::from_utf8_lossy(&body);
        Ok(PsvDocument::parse(&text)?)
    }

    /// Persist a response body if it is not already present.
    ///
    /// Writes go through a temp sibling and a rename, so readers never see
    /// a partial body.
    pub fn write(
        &self,
        endpoint: &str,
        digest: &str,
        content: &[u8],
        last_modified: Option<&str>,
    ) -> Result<()> {
        let path = self.path_for(endpoint, digest)?;
        if path.is_file() {
            trace!("Response {endpoint} {digest} already cached");
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        atomic_write(&path, content)?;

        if let Some(last_modified) = last_modified {
            let meta = ResponseMeta {
                last_modified: Some(last_modified.to_string()),
            };
            let meta_path = path.with_file_name(format!("{digest}.meta"));
            atomic_write(&meta_path, serde_json::to_string(&meta)?.as_bytes())?;
        }
        Ok(())
    }

    /// The recorded `Last-Modified`, when a usable `.meta` exists.
    pub fn last_modified(&self, endpoint: &str, digest: &str) -> Option<String> {
        let path = self.path_for(endpoint, digest).ok()?;
        let meta_path = path.with_file_name(format!("{digest}.meta"));
        let text = std::fs::read_to_string(meta_path).ok()?;
        serde_json::from_str::<ResponseMeta>(&text)
            .ok()
            .and_then(|m| m.last_modified)
    }
}

fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let temp = path.with_extension(format!("{}.keg_temp", std::process::id()));
    std::fs::write(&temp, content)?;
    std::fs::rename(&temp, path)?;
    Ok(())
}
