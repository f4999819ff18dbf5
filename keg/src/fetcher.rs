//! The fetch planner.
//!
//! Given one version of a remote, the planner walks the build's transitive
//! object graph in phases: product config, build/CDN configs, archive
//! indices, loose metadata, patch indices, then (unless metadata-only)
//! archives, loose files and patch files. Each phase is a queue of
//! idempotent items: fetching an item that is already local is a no-op,
//! and one item's network failure never unqueues another.
//!
//! The caller drives iteration: [`Fetcher::next_drain`] hands out one
//! queue at a time, absorbing whatever the previous drain landed before
//! planning the next.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde_json::Value;
use tracing::{debug, warn};

use keg_cdn::{CachedStore, ObjectKind, ObjectStore};
use keg_crypto::ArmadilloKey;
use keg_formats::Key;
use keg_formats::archive::{ArchiveGroup, ArchiveIndex};
use keg_formats::config::{BuildConfig, CdnConfig, PatchConfig};
use keg_formats::encoding::EncodingFile;
use keg_formats::key::md5_hex;

use crate::error::{Error, Result};
use crate::remote::VersionsEntry;

/// Collapse versions that share `(build_config, cdn_config,
/// product_config)`; regions frequently share all three. Order is
/// preserved; the first region with a given triple wins.
pub fn dedupe_versions(versions: &[VersionsEntry]) -> Vec<VersionsEntry> {
    let mut seen = HashSet::new();
    versions
        .iter()
        .filter(|v| {
            let triple = (
                v.build_config.clone(),
                v.cdn_config.clone(),
                v.product_config.clone(),
            );
            seen.insert(triple)
        })
        .cloned()
        .collect()
}

/// One object to make local.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchItem {
    pub kind: ObjectKind,
    pub key: Key,
}

impl FetchItem {
    /// Make the object local. A no-op when it already is.
    pub async fn fetch(&self, store: &CachedStore) -> Result<bool> {
        Ok(store.ensure(self.kind, &self.key).await?)
    }
}

/// One homogeneous queue of fetch work.
#[derive(Debug)]
pub struct Drain {
    pub name: &'static str,
    items: Vec<FetchItem>,
    force: bool,
}

impl Drain {
    fn new(name: &'static str, kind: ObjectKind, keys: BTreeSet<Key>) -> Self {
        Self {
            name,
            items: keys.into_iter().map(|key| FetchItem { kind, key }).collect(),
            force: false,
        }
    }

    pub fn items(&self) -> &[FetchItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Fetch every item, collecting per-item failures instead of stopping.
    pub async fn run(&self, store: &CachedStore) -> DrainOutcome {
        let mut outcome = DrainOutcome {
            name: self.name,
            fetched: 0,
            present: 0,
            failures: Vec::new(),
        };

        for item in &self.items {
            let result = if self.force {
                store
                    .refetch(item.kind, &item.key)
                    .await
                    .map(|()| true)
                    .map_err(Error::from)
            } else {
                item.fetch(store).await
            };
            match result {
                Ok(true) => outcome.fetched += 1,
                Ok(false) => outcome.present += 1,
                Err(e) => {
                    warn!("Failed to fetch {} {}: {e}", item.kind, item.key);
                    outcome.failures.push((*item, e));
                }
            }
        }

        debug!(
            "Drained {}: {} fetched, {} present, {} failed",
            self.name,
            outcome.fetched,
            outcome.present,
            outcome.failures.len()
        );
        outcome
    }
}

/// What one drain accomplished.
#[derive(Debug)]
pub struct DrainOutcome {
    pub name: &'static str,
    pub fetched: usize,
    pub present: usize,
    pub failures: Vec<(FetchItem, Error)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    ProductConfig,
    BuildConfig,
    CdnConfig,
    PatchConfig,
    DataIndices,
    LooseMetadata,
    PatchIndices,
    Archives,
    LooseFiles,
    PatchArchives,
    PatchFiles,
    Done,
}

/// Plans and drives the fetch of one version.
pub struct Fetcher {
    version: VersionsEntry,
    store: CachedStore,
    verify: bool,
    metadata_only: bool,
    force: bool,
    known_keys: HashMap<String, ArmadilloKey>,
    game_blob: Option<Value>,
    phase: Phase,

    pub product_config: Option<Value>,
    pub build_config: Option<BuildConfig>,
    pub cdn_config: Option<CdnConfig>,
    pub patch_config: Option<PatchConfig>,
    pub encoding: Option<EncodingFile>,
    archive_group: Option<ArchiveGroup>,

    /// Name of the product's decryption key, when the product config (or
    /// legacy game blob) declares one.
    pub decryption_key_name: Option<String>,
    /// Non-fatal conditions encountered while planning.
    pub warnings: Vec<String>,
}

impl Fetcher {
    pub fn new(version: VersionsEntry, store: CachedStore) -> Self {
        Self {
            version,
            store,
            verify: true,
            metadata_only: false,
            force: false,
            known_keys: HashMap::new(),
            game_blob: None,
            phase: Phase::ProductConfig,
            product_config: None,
            build_config: None,
            cdn_config: None,
            patch_config: None,
            encoding: None,
            archive_group: None,
            decryption_key_name: None,
            warnings: Vec::new(),
        }
    }

    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Skip the data phase entirely.
    pub fn with_metadata_only(mut self, metadata_only: bool) -> Self {
        self.metadata_only = metadata_only;
        self
    }

    /// Re-fetch every item even when a local copy exists.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// The provisioned armadillo keys, by name.
    pub fn with_known_keys(mut self, keys: HashMap<String, ArmadilloKey>) -> Self {
        self.known_keys = keys;
        self
    }

    /// Legacy path: versions without a product config consult the `game`
    /// blob for the decryption key name.
    pub fn with_game_blob(mut self, blob: Option<Value>) -> Self {
        self.game_blob = blob;
        self
    }

    pub fn store(&self) -> &CachedStore {
        &self.store
    }

    pub fn version(&self) -> &VersionsEntry {
        &self.version
    }

    /// The next non-empty queue of the plan, or `None` when done.
    ///
    /// Each call absorbs whatever the previous drain made local (parsing
    /// configs, indices and the encoding file) before planning further.
    pub async fn next_drain(&mut self) -> Result<Option<Drain>> {
        loop {
            let drain = self.step().await?;
            match drain {
                Some(drain) if drain.is_empty() => continue,
                Some(mut drain) => {
                    drain.force = self.force;
                    return Ok(Some(drain));
                }
                None if self.phase == Phase::Done => return Ok(None),
                None => continue,
            }
        }
    }

    /// Run the whole plan against the store.
    pub async fn run(&mut self) -> Result<Vec<DrainOutcome>> {
        let mut outcomes = Vec::new();
        while let Some(drain) = self.next_drain().await? {
            outcomes.push(drain.run(&self.store).await);
        }
        Ok(outcomes)
    }

    async fn step(&mut self) -> Result<Option<Drain>> {
        match self.phase {
            Phase::ProductConfig => {
                self.phase = Phase::BuildConfig;
                let mut keys = BTreeSet::new();
                if let Ok(key) = Key::from_hex(&self.version.product_config) {
                    keys.insert(key);
                }
                Ok(Some(Drain::new(
                    "product config",
                    ObjectKind::ProductConfig,
                    keys,
                )))
            }

            Phase::BuildConfig => {
                self.load_product_config().await?;
                self.phase = Phase::CdnConfig;

                let mut keys = BTreeSet::new();
                if let Ok(key) = Key::from_hex(&self.version.build_config) {
                    keys.insert(key);
                }
                Ok(Some(Drain::new("build config", ObjectKind::Config, keys)))
            }

            Phase::CdnConfig => {
                self.phase = Phase::PatchConfig;
                let mut keys = BTreeSet::new();
                if let Ok(key) = Key::from_hex(&self.version.cdn_config) {
                    keys.insert(key);
                }
                Ok(Some(Drain::new("cdn config", ObjectKind::Config, keys)))
            }

            Phase::PatchConfig => {
                self.load_configs().await?;
                self.phase = Phase::DataIndices;

                let mut keys = BTreeSet::new();
                if let Some(key) = self.build_config.as_ref().and_then(|b| b.patch_config) {
                    keys.insert(key);
                }
                Ok(Some(Drain::new("patch config", ObjectKind::Config, keys)))
            }

            Phase::DataIndices => {
                self.load_patch_config().await?;
                self.phase = Phase::LooseMetadata;

                let mut keys = BTreeSet::new();
                if let Some(cdn) = &self.cdn_config {
                    keys.extend(cdn.archives.iter().copied());
                    keys.extend(cdn.file_index);
                }
                Ok(Some(Drain::new(
                    "archive indices",
                    ObjectKind::DataIndex,
                    keys,
                )))
            }

            Phase::LooseMetadata => {
                self.load_archive_group().await?;
                self.phase = Phase::PatchIndices;

                // Metadata referenced by ekey out of the build config:
                // encoding, install, download, size and the patch manifest.
                // An item already reachable through an archive range is not
                // fetched loose.
                let mut keys = BTreeSet::new();
                if let Some(build) = &self.build_config {
                    for pair in [&build.encoding, &build.install, &build.download, &build.size]
                    {
                        if let Some(ekey) = pair.encoding_key {
                            if !self.in_archives(&ekey) {
                                keys.insert(ekey);
                            }
                        }
                    }
                    if let Some(ekey) = build.patch {
                        if !self.in_archives(&ekey) {
                            keys.insert(ekey);
                        }
                    }
                }
                Ok(Some(Drain::new("loose metadata", ObjectKind::Data, keys)))
            }

            Phase::PatchIndices => {
                self.load_encoding().await?;
                self.phase = if self.metadata_only {
                    Phase::Done
                } else {
                    Phase::Archives
                };

                let mut keys = BTreeSet::new();
                if let Some(cdn) = &self.cdn_config {
                    keys.extend(cdn.patch_archives.iter().copied());
                    keys.extend(cdn.patch_file_index);
                }
                Ok(Some(Drain::new(
                    "patch indices",
                    ObjectKind::PatchIndex,
                    keys,
                )))
            }

            Phase::Archives => {
                self.phase = Phase::LooseFiles;
                let mut keys = BTreeSet::new();
                if let Some(cdn) = &self.cdn_config {
                    keys.extend(cdn.archives.iter().copied());
                }
                Ok(Some(Drain::new("archives", ObjectKind::Archive, keys)))
            }

            Phase::LooseFiles => {
                self.phase = Phase::PatchArchives;
                let mut keys = BTreeSet::new();
                if let Some(encoding) = &self.encoding {
                    for entry in encoding.encoded_entries() {
                        if !self.in_archives(&entry.ekey) {
                            keys.insert(entry.ekey);
                        }
                    }
                }
                Ok(Some(Drain::new("loose files", ObjectKind::Data, keys)))
            }

            Phase::PatchArchives => {
                self.phase = Phase::PatchFiles;
                let mut keys = BTreeSet::new();
                if let Some(cdn) = &self.cdn_config {
                    keys.extend(cdn.patch_archives.iter().copied());
                }
                Ok(Some(Drain::new(
                    "patch archives",
                    ObjectKind::PatchArchive,
                    keys,
                )))
            }

            Phase::PatchFiles => {
                self.phase = Phase::Done;
                let mut keys = BTreeSet::new();
                if let Some(patch) = &self.patch_config {
                    for entry in &patch.patch_entries {
                        keys.extend(entry.pairs.iter().map(|(_, _, patch_key, _)| *patch_key));
                    }
                }
                Ok(Some(Drain::new("patch files", ObjectKind::Patch, keys)))
            }

            Phase::Done => Ok(None),
        }
    }

    fn in_archives(&self, ekey: &Key) -> bool {
        self.archive_group
            .as_ref()
            .is_some_and(|group| group.has_key(ekey))
    }

    /// Absorb the product config (or legacy game blob) and resolve the
    /// decryption key it names against the known-keys table.
    async fn load_product_config(&mut self) -> Result<()> {
        if let Ok(key) = Key::from_hex(&self.version.product_config) {
            if self.store.has(ObjectKind::ProductConfig, &key) {
                let bytes = self.store.get(ObjectKind::ProductConfig, &key).await?;
                self.product_config = Some(serde_json::from_slice(&bytes)?);
            }
        }

        let source = self.product_config.as_ref().or(self.game_blob.as_ref());
        let key_name = source
            .and_then(|v| v.pointer("/all/config/decryption_key_name"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        if let Some(name) = key_name {
            match self.known_keys.get(&name) {
                Some(key) => {
                    debug!("Using decryption key {name}");
                    self.store.set_armadillo(Some(key.clone()));
                }
                None => {
                    self.warnings
                        .push(format!("Decryption key {name:?} is not provisioned"));
                }
            }
            self.decryption_key_name = Some(name);
        }
        Ok(())
    }

    async fn load_configs(&mut self) -> Result<()> {
        if let Ok(key) = Key::from_hex(&self.version.build_config) {
            if self.store.has(ObjectKind::Config, &key) {
                let bytes = self.store.get(ObjectKind::Config, &key).await?;
                self.build_config =
                    Some(BuildConfig::parse(&String::from_utf8_lossy(&bytes))?);
            }
        }
        if let Ok(key) = Key::from_hex(&self.version.cdn_config) {
            if self.store.has(ObjectKind::Config, &key) {
                let bytes = self.store.get(ObjectKind::Config, &key).await?;
                self.cdn_config = Some(CdnConfig::parse(&String::from_utf8_lossy(&bytes))?);
            }
        }
        Ok(())
    }

    async fn load_patch_config(&mut self) -> Result<()> {
        let Some(key) = self.build_config.as_ref().and_then(|b| b.patch_config) else {
            return Ok(());
        };
        if self.store.has(ObjectKind::Config, &key) {
            let bytes = self.store.get(ObjectKind::Config, &key).await?;
            self.patch_config = Some(PatchConfig::parse(&String::from_utf8_lossy(&bytes))?);
        }
        Ok(())
    }

    async fn load_archive_group(&mut self) -> Result<()> {
        let Some(cdn) = &self.cdn_config else {
            return Ok(());
        };

        let mut indices = Vec::new();
        for archive_key in &cdn.archives {
            if self.store.has(ObjectKind::DataIndex, archive_key) {
                let bytes = self.store.get(ObjectKind::DataIndex, archive_key).await?;
                indices.push(ArchiveIndex::parse(&bytes, archive_key, self.verify)?);
            }
        }
        debug!("Archive group: {} indices", indices.len());
        self.archive_group = Some(ArchiveGroup::new(indices));
        Ok(())
    }

    async fn load_encoding(&mut self) -> Result<()> {
        let Some(build) = &self.build_config else {
            return Ok(());
        };
        let (Some(content_key), Some(ekey)) =
            (build.encoding.content_key, build.encoding.encoding_key)
        else {
            return Ok(());
        };
        if !self.store.has(ObjectKind::Data, &ekey) {
            return Ok(());
        }

        let blob = self.store.get(ObjectKind::Data, &ekey).await?;
        let decoded = keg_blte::decode(&blob, Some(ekey.as_bytes()), None)?;

        if self.verify && md5_hex(&decoded) != content_key.to_hex() {
            return Err(Error::Store(keg_cdn::Error::Integrity {
                what: format!("encoding file {content_key}"),
                expected: content_key.to_hex(),
                actual: md5_hex(&decoded),
            }));
        }

        self.encoding = Some(EncodingFile::parse(&decoded, self.verify)?);
        Ok(())
    }
}
