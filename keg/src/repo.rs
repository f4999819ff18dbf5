//! The repository handle.
//!
//! A keg repository is one directory:
//!
//! ```text
//! <root>/
//!   keg.conf                      configuration
//!   keg.db                        relational state cache
//!   objects/{config,data,patch}/  content-addressed object store
//!   fragments/                    loose sub-archive pieces
//!   responses/                    stateful endpoint bodies
//!   tmp/                          scratch for in-flight writes
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use keg_cdn::{CachedStore, LocalStore, ObjectKind, RemoteStore, verify_bytes};
use keg_crypto::ArmadilloKey;
use keg_formats::Key;

use crate::conf::KegConfig;
use crate::db::KegDb;
use crate::error::{Error, Result};
use crate::fetcher::{DrainOutcome, Fetcher, dedupe_versions};
use crate::remote::{CacheableRemote, CdnsEntry, VersionsEntry};
use crate::statecache::StateCache;

/// An open keg repository.
pub struct Keg {
    path: PathBuf,
    pub config: KegConfig,
    pub db: KegDb,
    pub state_cache: StateCache,
    local: LocalStore,
}

/// What one `fetch` pass did for one unique version.
pub struct VersionFetch {
    pub version: VersionsEntry,
    pub outcomes: Vec<DrainOutcome>,
    pub warnings: Vec<String>,
    /// Set when the version's metadata was unusable; other versions
    /// proceed regardless.
    pub error: Option<Error>,
}

/// What one `fetch` pass did for a remote.
pub struct FetchSummary {
    pub versions: Vec<VersionFetch>,
}

/// One object that failed `fsck`.
#[derive(Debug)]
pub struct FsckFailure {
    pub kind: ObjectKind,
    pub key: Key,
    pub path: PathBuf,
    pub reason: String,
}

/// The result of an `fsck` walk.
#[derive(Debug, Default)]
pub struct FsckReport {
    pub checked: usize,
    pub failures: Vec<FsckFailure>,
    pub deleted: usize,
}

impl FsckReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

impl Keg {
    /// Open an initialized repository.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.join("keg.conf").is_file() {
            return Err(Error::NotFound {
                kind: "repository",
                key: path.display().to_string(),
            });
        }

        let config = KegConfig::load(path.join("keg.conf"))?;
        let db = KegDb::open(&path.join("keg.db"))?;
        db.create_tables()?;
        let state_cache = StateCache::new(path.join("responses"));
        let local = LocalStore::new(
            path.join("objects"),
            path.join("fragments"),
            path.join("tmp"),
        );

        Ok(Self {
            path,
            config,
            db,
            state_cache,
            local,
        })
    }

    /// Initialize a repository, or reopen one that already exists.
    ///
    /// Returns the handle and whether the repository was already
    /// initialized. A reinitialization mutates nothing.
    pub fn init(path: impl Into<PathBuf>) -> Result<(Self, bool)> {
        let path = path.into();
        let reinitialized = path.join("keg.conf").is_file();

        for dir in ["objects", "fragments", "responses", "tmp"] {
            std::fs::create_dir_all(path.join(dir))?;
        }

        let mut config = KegConfig::load(path.join("keg.conf"))?;
        config.initialize()?;

        let db = KegDb::open(&path.join("keg.db"))?;
        db.create_tables()?;

        if reinitialized {
            info!("Reinitialized existing repository at {path:?}");
        } else {
            info!("Initialized repository at {path:?}");
        }

        let keg = Self::open(path)?;
        Ok((keg, reinitialized))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn local_store(&self) -> &LocalStore {
        &self.local
    }

    /// A delegating store over this repository and an optional mirror.
    pub fn cached_store(&self, remote: Option<RemoteStore>) -> CachedStore {
        CachedStore::new(self.local.clone(), remote)
            .with_verify_reads(self.config.verify_integrity())
    }

    /// Qualify a bare remote name with the configured prefix.
    pub fn clean_remote(&self, remote: &str) -> String {
        if remote.contains("://") {
            remote.to_string()
        } else {
            format!(
                "{}{}",
                self.config.default_remote_prefix().trim_end_matches('/'),
                format!("/{remote}").replace("//", "/")
            )
        }
    }

    /// The caching patch-server client for a remote.
    pub fn get_remote(&self, remote: &str) -> Result<CacheableRemote> {
        CacheableRemote::new(
            self.clean_remote(remote),
            self.db.clone(),
            self.state_cache.clone(),
        )
    }

    pub fn add_remote(&mut self, remote: &str, default_fetch: bool, writeable: bool) -> Result<()> {
        let remote = self.clean_remote(remote);
        self.config.add_remote(&remote, default_fetch, writeable)
    }

    /// Forget a remote: its configuration and state-cache rows go, its
    /// objects stay.
    pub fn remove_remote(&mut self, remote: &str) -> Result<()> {
        let remote = self.clean_remote(remote);
        self.config.remove_remote(&remote)?;
        self.db.remove_remote(&remote)
    }

    /// Every provisioned armadillo key, by name.
    pub fn armadillo_keys(&self) -> HashMap<String, ArmadilloKey> {
        let Some(dir) = self.config.armadillo_keys_dir() else {
            return HashMap::new();
        };
        let dir = if dir.is_absolute() {
            dir
        } else {
            self.path.join(dir)
        };

        let mut keys = HashMap::new();
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return keys;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("ak") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match ArmadilloKey::from_file(&path) {
                Ok(key) => {
                    keys.insert(name.to_string(), key);
                }
                Err(e) => warn!("Ignoring bad armadillo key {path:?}: {e}"),
            }
        }
        keys
    }

    /// Pick one mirror for this session, honoring `keg.preferred-cdns`.
    pub fn select_cdn(&self, cdns: &[CdnsEntry]) -> Option<RemoteStore> {
        let entry = cdns.first()?;
        let servers = entry.all_servers();
        if servers.is_empty() {
            return None;
        }

        let server = self
            .config
            .preferred_cdns()
            .iter()
            .find_map(|preferred| {
                servers
                    .iter()
                    .find(|s| s.contains(preferred.as_str()))
                    .cloned()
            })
            .unwrap_or_else(|| servers[0].clone());

        debug!("Selected CDN mirror {server}");
        RemoteStore::new(server, entry.path.clone(), entry.config_path.clone()).ok()
    }

    /// Plan and fetch one version.
    pub async fn fetch_version(
        &self,
        version: VersionsEntry,
        remote_store: Option<RemoteStore>,
        game_blob: Option<serde_json::Value>,
        metadata_only: bool,
        force: bool,
    ) -> VersionFetch {
        let store = self.cached_store(remote_store);
        let mut fetcher = Fetcher::new(version.clone(), store)
            .with_verify(self.config.verify_integrity())
            .with_metadata_only(metadata_only)
            .with_force(force)
            .with_known_keys(self.armadillo_keys())
            .with_game_blob(game_blob);

        match fetcher.run().await {
            Ok(outcomes) => VersionFetch {
                version,
                outcomes,
                warnings: fetcher.warnings.clone(),
                error: None,
            },
            Err(e) => VersionFetch {
                version,
                outcomes: Vec::new(),
                warnings: fetcher.warnings.clone(),
                error: Some(e),
            },
        }
    }

    /// Fetch a remote: pull its stateful endpoints, dedupe the versions,
    /// and drive one fetch plan per unique version.
    pub async fn fetch_remote(&self, remote: &str, metadata_only: bool) -> Result<FetchSummary> {
        let client = self.get_remote(remote)?;

        let versions = client.get_versions().await?;
        let cdns = client.get_cdns().await?;

        // Optional endpoints; absence is not an error.
        if let Err(e) = client.get_bgdl().await {
            if !matches!(e, Error::NoData { .. }) {
                return Err(e);
            }
        }
        if let Err(e) = client.get_blobs().await {
            if !matches!(e, Error::NoData { .. }) {
                return Err(e);
            }
        }
        let game_blob = match client.get_game_blob().await {
            Ok(blob) => Some(blob),
            Err(Error::NoData { .. }) => None,
            Err(e) => return Err(e),
        };

        let remote_store = self.select_cdn(&cdns);
        let unique = dedupe_versions(&versions);
        debug!(
            "Fetching {remote}: {} versions, {} unique",
            versions.len(),
            unique.len()
        );

        let mut summary = FetchSummary {
            versions: Vec::new(),
        };
        for version in unique {
            let blob = if version.product_config.is_empty() {
                game_blob.clone()
            } else {
                None
            };
            summary.versions.push(
                self.fetch_version(
                    version,
                    remote_store.clone(),
                    blob,
                    metadata_only,
                    false,
                )
                .await,
            );
        }
        Ok(summary)
    }

    /// Fetch every remote configured with `default-fetch`.
    pub async fn fetch_all(&self, metadata_only: bool) -> Result<Vec<(String, FetchSummary)>> {
        let mut results = Vec::new();
        for remote in self.config.fetchable_remotes() {
            let summary = self.fetch_remote(&remote, metadata_only).await?;
            results.push((remote, summary));
        }
        Ok(results)
    }

    /// Verify every stored object against the key its path claims.
    ///
    /// With `delete`, offending objects are unlinked after being reported.
    pub async fn fsck(&self, delete: bool) -> Result<FsckReport> {
        let mut report = FsckReport::default();

        let mut objects = self.local.list_objects()?;
        objects.extend(self.local.list_fragments()?);

        for object in objects {
            report.checked += 1;
            let data = std::fs::read(&object.path)?;
            if let Err(e) = verify_bytes(object.kind, &object.key, &data) {
                warn!("fsck: {} {} is corrupt: {e}", object.kind, object.key);
                report.failures.push(FsckFailure {
                    kind: object.kind,
                    key: object.key,
                    path: object.path.clone(),
                    reason: e.to_string(),
                });
                if delete {
                    self.local.delete(object.kind, &object.key).await?;
                    report.deleted += 1;
                }
            }
        }

        debug!(
            "fsck: {} objects checked, {} bad, {} deleted",
            report.checked,
            report.failures.len(),
            report.deleted
        );
        Ok(report)
    }
}
