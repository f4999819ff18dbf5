//! The build manager.
//!
//! Opens one build, a `(build_config, cdn_config)` pair, over an object
//! store and lazily materializes what working with it needs: parsed
//! configs, the archive group, the encoding file, the install and download
//! manifests. File access goes content key → encoded key → bytes, trying a
//! loose object, then a fragment, then an archive range.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use keg_blte::Error as BlteError;
use keg_cdn::{Error as StoreError, ObjectKind, ObjectStore};
use keg_crypto::KeyTable;
use keg_formats::Key;
use keg_formats::archive::{ArchiveGroup, ArchiveIndex};
use keg_formats::config::{BuildConfig, CdnConfig};
use keg_formats::download::DownloadManifest;
use keg_formats::encoding::EncodingFile;
use keg_formats::install::{InstallEntry, InstallManifest};
use keg_formats::key::md5_hex;

use crate::error::{Error, Result};

/// What an install pass did (or, dry, would do).
#[derive(Debug, Default)]
pub struct InstallReport {
    /// `(path, ckey, decoded size)` of every file written.
    pub installed: Vec<(String, Key, u64)>,
    /// Files skipped because their decryption key is not provisioned.
    pub skipped: Vec<(String, String)>,
}

/// Handle on one build over an object store.
pub struct BuildManager {
    store: Arc<dyn ObjectStore>,
    build_config_key: Key,
    cdn_config_key: Key,
    verify: bool,
    blte_keys: Option<KeyTable>,

    build_config: Option<BuildConfig>,
    cdn_config: Option<CdnConfig>,
    archive_group: Option<ArchiveGroup>,
    encoding: Option<EncodingFile>,
    install: Option<InstallManifest>,
    download: Option<DownloadManifest>,
}

impl BuildManager {
    pub fn new(store: Arc<dyn ObjectStore>, build_config_key: Key, cdn_config_key: Key) -> Self {
        Self {
            store,
            build_config_key,
            cdn_config_key,
            verify: true,
            blte_keys: None,
            build_config: None,
            cdn_config: None,
            archive_group: None,
            encoding: None,
            install: None,
            download: None,
        }
    }

    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Keys for BLTE-encrypted chunks.
    pub fn with_key_table(mut self, keys: KeyTable) -> Self {
        self.blte_keys = Some(keys);
        self
    }

    pub fn build_config_key(&self) -> &Key {
        &self.build_config_key
    }

    pub async fn build_config(&mut self) -> Result<&BuildConfig> {
        if self.build_config.is_none() {
            let bytes = self
                .store
                .get(ObjectKind::Config, &self.build_config_key)
                .await?;
            self.build_config = Some(BuildConfig::parse(&String::from_utf8_lossy(&bytes))?);
        }
        Ok(self.build_config.as_ref().unwrap())
    }

    pub async fn cdn_config(&mut self) -> Result<&CdnConfig> {
        if self.cdn_config.is_none() {
            let bytes = self
                .store
                .get(ObjectKind::Config, &self.cdn_config_key)
                .await?;
            self.cdn_config = Some(CdnConfig::parse(&String::from_utf8_lossy(&bytes))?);
        }
        Ok(self.cdn_config.as_ref().unwrap())
    }

    /// The union of the build's archive indices, in CDN-config order.
    pub async fn archive_group(&mut self) -> Result<&ArchiveGroup> {
        if self.archive_group.is_none() {
            let archives = self.cdn_config().await?.archives.clone();
            let mut indices = Vec::with_capacity(archives.len());
            for archive_key in &archives {
                let bytes = self.store.get(ObjectKind::DataIndex, archive_key).await?;
                indices.push(ArchiveIndex::parse(&bytes, archive_key, self.verify)?);
            }
            debug!(
                "Opened archive group: {} indices, {} entries",
                archives.len(),
                indices.iter().map(ArchiveIndex::len).sum::<usize>()
            );
            self.archive_group = Some(ArchiveGroup::new(indices));
        }
        Ok(self.archive_group.as_ref().unwrap())
    }

    pub async fn encoding(&mut self) -> Result<&EncodingFile> {
        if self.encoding.is_none() {
            let pair = self.build_config().await?.encoding;
            let (Some(content_key), Some(ekey)) = (pair.content_key, pair.encoding_key) else {
                return Err(Error::NotFound {
                    kind: "encoding file",
                    key: self.build_config_key.to_hex(),
                });
            };

            let blob = self.get_encoded_bytes(&ekey).await?;
            let decoded = keg_blte::decode(&blob, Some(ekey.as_bytes()), self.blte_keys.as_ref())?;
            self.check_content_key("encoding file", &content_key, &decoded)?;
            self.encoding = Some(EncodingFile::parse(&decoded, self.verify)?);
        }
        Ok(self.encoding.as_ref().unwrap())
    }

    pub async fn install_manifest(&mut self) -> Result<&InstallManifest> {
        if self.install.is_none() {
            let pair = self.build_config().await?.install;
            let Some(content_key) = pair.content_key else {
                return Err(Error::NotFound {
                    kind: "install manifest",
                    key: self.build_config_key.to_hex(),
                });
            };
            let decoded = self.fetch_manifest(content_key, pair.encoding_key).await?;
            self.install = Some(InstallManifest::parse(&decoded)?);
        }
        Ok(self.install.as_ref().unwrap())
    }

    pub async fn download_manifest(&mut self) -> Result<&DownloadManifest> {
        if self.download.is_none() {
            let pair = self.build_config().await?.download;
            let Some(content_key) = pair.content_key else {
                return Err(Error::NotFound {
                    kind: "download manifest",
                    key: self.build_config_key.to_hex(),
                });
            };
            let decoded = self.fetch_manifest(content_key, pair.encoding_key).await?;
            self.download = Some(DownloadManifest::parse(&decoded)?);
        }
        Ok(self.download.as_ref().unwrap())
    }

    /// The decoded root manifest, for products that use one.
    pub async fn root_bytes(&mut self) -> Result<Vec<u8>> {
        let Some(root) = self.build_config().await?.root else {
            return Err(Error::NotFound {
                kind: "root manifest",
                key: self.build_config_key.to_hex(),
            });
        };
        self.get_file(&root).await
    }

    /// Fetch a manifest named by content key, with its encoded key either
    /// given by the build config or resolved through encoding.
    async fn fetch_manifest(&mut self, content_key: Key, ekey: Option<Key>) -> Result<Vec<u8>> {
        let ekey = match ekey {
            Some(ekey) => ekey,
            None => *self.encoding().await?.find_by_content_key(&content_key)?,
        };
        let blob = self.get_encoded_bytes(&ekey).await?;
        let decoded = keg_blte::decode(&blob, Some(ekey.as_bytes()), self.blte_keys.as_ref())?;
        self.check_content_key("manifest", &content_key, &decoded)?;
        Ok(decoded)
    }

    /// Locate and read an encoded blob: loose object, then fragment, then
    /// archive range, then (through a delegating store) the remote.
    pub async fn get_encoded_bytes(&mut self, ekey: &Key) -> Result<Vec<u8>> {
        if self.store.has(ObjectKind::Data, ekey) {
            return Ok(self.store.get(ObjectKind::Data, ekey).await?);
        }
        if self.store.has(ObjectKind::Fragment, ekey) {
            return Ok(self.store.get(ObjectKind::Fragment, ekey).await?);
        }

        if let Some(location) = self.archive_group().await?.lookup(ekey) {
            return Ok(self
                .store
                .get_range(
                    ObjectKind::Data,
                    &location.archive_key,
                    u64::from(location.offset),
                    u64::from(location.size),
                )
                .await?);
        }

        match self.store.get(ObjectKind::Data, ekey).await {
            Ok(bytes) => Ok(bytes),
            Err(StoreError::Missing { .. } | StoreError::NoRemote { .. }) => {
                Err(Error::NotFound {
                    kind: "encoded key",
                    key: ekey.to_hex(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read and decode a file by content key.
    pub async fn get_file(&mut self, ckey: &Key) -> Result<Vec<u8>> {
        let ekey = *self.encoding().await?.find_by_content_key(ckey)?;
        let blob = match self.get_encoded_bytes(&ekey).await {
            Err(Error::NotFound { .. }) => {
                return Err(Error::NotFound {
                    kind: "content key",
                    key: ckey.to_hex(),
                });
            }
            other => other?,
        };

        let decoded = keg_blte::decode(&blob, Some(ekey.as_bytes()), self.blte_keys.as_ref())?;
        self.check_content_key("file", ckey, &decoded)?;
        Ok(decoded)
    }

    /// Read a file's encoded bytes without BLTE-decoding them.
    pub async fn get_file_raw(&mut self, ckey: &Key) -> Result<Vec<u8>> {
        let ekey = *self.encoding().await?.find_by_content_key(ckey)?;
        self.get_encoded_bytes(&ekey).await
    }

    fn check_content_key(&self, what: &str, ckey: &Key, decoded: &[u8]) -> Result<()> {
        if self.verify && md5_hex(decoded) != ckey.to_hex() {
            return Err(Error::Store(StoreError::Integrity {
                what: format!("{what} {ckey}"),
                expected: ckey.to_hex(),
                actual: md5_hex(decoded),
            }));
        }
        Ok(())
    }

    /// The install entries a tag selection produces, sorted by path.
    ///
    /// When two entries share a path with different content keys, the
    /// first in sorted order wins and the loser is logged.
    pub async fn install_entries(&mut self, tags: &[&str]) -> Result<Vec<InstallEntry>> {
        let manifest = self.install_manifest().await?;
        let mut entries: Vec<InstallEntry> = manifest
            .filter_entries(tags)?
            .into_iter()
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path).then(a.ckey.cmp(&b.ckey)));

        let mut seen = HashSet::new();
        entries.retain(|entry| {
            if seen.insert(entry.path.clone()) {
                true
            } else {
                warn!(
                    "Duplicate install path {:?}, keeping the first entry (dropped {})",
                    entry.path, entry.ckey
                );
                false
            }
        });
        Ok(entries)
    }

    /// Install the selected entries under `output`.
    ///
    /// Files whose decryption key is missing are skipped with a warning;
    /// a file with no locatable blob fails with its name. A dry run
    /// resolves everything but writes nothing.
    pub async fn install_to(
        &mut self,
        output: &Path,
        tags: &[&str],
        dry_run: bool,
    ) -> Result<InstallReport> {
        let entries = self.install_entries(tags).await?;
        let mut report = InstallReport::default();

        for entry in entries {
            let bytes = match self.get_file(&entry.ckey).await {
                Ok(bytes) => bytes,
                Err(Error::Blte(BlteError::MissingKey(name))) => {
                    let name = format!("{name:016x}");
                    warn!("Skipping {:?}: missing decryption key {name}", entry.path);
                    report.skipped.push((entry.path, name));
                    continue;
                }
                Err(
                    Error::NotFound { .. }
                    | Error::Format(keg_formats::Error::NotFound { .. }),
                ) => {
                    return Err(Error::NotFound {
                        kind: "install file",
                        key: format!("{} ({})", entry.path, entry.ckey),
                    });
                }
                Err(e) => return Err(e),
            };

            if !dry_run {
                let path = output.join(&entry.path);
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&path, &bytes).await?;
            }
            report
                .installed
                .push((entry.path, entry.ckey, bytes.len() as u64));
        }

        Ok(report)
    }
}
