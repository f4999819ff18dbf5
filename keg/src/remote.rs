//! The patch-server client.
//!
//! A remote is a named upstream endpoint serving stateful PSV tables
//! (`versions`, `cdns`, `bgdl`, `blobs`) and JSON blobs (`blob/game`,
//! `blob/install`). Every response is content-addressed by the MD5 of its
//! raw bytes; the caching wrapper persists each distinct body and logs it
//! in the state cache before handing it back.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::{Client, StatusCode};
use tracing::{debug, trace};

use keg_formats::key::md5_hex;
use keg_psv::{PsvDocument, PsvRow};

use crate::db::KegDb;
use crate::error::{Error, Result};
use crate::statecache::StateCache;

const REQUEST_TIMEOUT_SECS: u64 = 30;

/// One response from a stateful endpoint, digested.
#[derive(Debug, Clone)]
pub struct StatefulResponse {
    /// Endpoint name: `versions`, `cdns`, `blob/game`, …
    pub endpoint: String,
    pub content: Vec<u8>,
    /// MD5 of the raw body, trailing newlines included.
    pub digest: String,
    pub timestamp: i64,
    pub last_modified: Option<String>,
}

/// One row of a `versions` (or `bgdl`) response.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionsEntry {
    pub region: String,
    pub build_config: String,
    pub build_id: String,
    pub cdn_config: String,
    pub key_ring: String,
    pub product_config: String,
    pub versions_name: String,
}

impl VersionsEntry {
    pub fn from_row(row: &PsvRow) -> Self {
        Self {
            region: row.get_or_default("Region").to_string(),
            build_config: row.get_or_default("BuildConfig").to_lowercase(),
            build_id: row.get_or_default("BuildId").to_string(),
            cdn_config: row.get_or_default("CDNConfig").to_lowercase(),
            key_ring: row.get_or_default("KeyRing").to_lowercase(),
            product_config: row.get_or_default("ProductConfig").to_lowercase(),
            versions_name: row.get_or_default("VersionsName").to_string(),
        }
    }

    /// The identity the fetch planner dedupes on.
    pub fn config_triple(&self) -> (&str, &str, &str) {
        (&self.build_config, &self.cdn_config, &self.product_config)
    }
}

/// One row of a `cdns` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdnsEntry {
    pub name: String,
    pub path: String,
    pub config_path: String,
    pub hosts: Vec<String>,
    pub servers: Vec<String>,
}

impl CdnsEntry {
    pub fn from_row(row: &PsvRow) -> Self {
        Self {
            name: row.get_or_default("Name").to_string(),
            path: row.get_or_default("Path").to_string(),
            config_path: row.get_or_default("ConfigPath").to_string(),
            hosts: row
                .get_or_default("Hosts")
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            servers: row
                .get_or_default("Servers")
                .split_whitespace()
                .map(str::to_string)
                .collect(),
        }
    }

    /// Every mirror base URL: explicit servers first, then plain-HTTP hosts.
    pub fn all_servers(&self) -> Vec<String> {
        self.servers
            .iter()
            .cloned()
            .chain(self.hosts.iter().map(|h| format!("http://{h}")))
            .collect()
    }
}

/// One row of a `blobs` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobsEntry {
    pub region: String,
    pub install_blob_md5: String,
    pub game_blob_md5: String,
}

impl BlobsEntry {
    pub fn from_row(row: &PsvRow) -> Self {
        Self {
            region: row.get_or_default("Region").to_string(),
            install_blob_md5: row.get_or_default("InstallBlobMD5").to_lowercase(),
            game_blob_md5: row.get_or_default("GameBlobMD5").to_lowercase(),
        }
    }
}

/// Plain HTTP client for one remote.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: Client,
    /// Full remote URL, e.g. `http://us.patch.battle.net:1119/product`.
    pub remote: String,
}

impl HttpRemote {
    pub fn new(remote: impl Into<String>) -> Result<Self> {
        let remote = remote.into();
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|source| Error::Network {
                url: remote.clone(),
                source,
            })?;
        Ok(Self { client, remote })
    }

    /// Fetch one endpoint and digest the body.
    ///
    /// A 404 means the endpoint has no data; several are optional.
    pub async fn get_response(&self, endpoint: &str) -> Result<StatefulResponse> {
        let url = format!("{}/{}", self.remote.trim_end_matches('/'), endpoint);
        debug!("Requesting {url}");

        let response =
            self.client
                .get(&url)
                .send()
                .await
                .map_err(|source| Error::Network {
                    url: url.clone(),
                    source,
                })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(Error::NoData {
                endpoint: endpoint.to_string(),
            });
        }
        if !status.is_success() {
            return Err(Error::Status {
                url,
                status: status.as_u16(),
            });
        }

        let last_modified = response
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let content = response
            .bytes()
            .await
            .map_err(|source| Error::Network { url, source })?
            .to_vec();

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;

        Ok(StatefulResponse {
            endpoint: endpoint.to_string(),
            digest: md5_hex(&content),
            content,
            timestamp,
            last_modified,
        })
    }

    pub async fn get_psv(&self, endpoint: &str) -> Result<(PsvDocument, StatefulResponse)> {
        let response = self.get_response(endpoint).await?;
        let text = String::from_utf8_lossy(&response.content);
        let document = PsvDocument::parse(&text)?;
        trace!(
            "PSV {endpoint}: {} rows, digest {}",
            document.rows().len(),
            response.digest
        );
        Ok((document, response))
    }

    pub async fn get_blob(
        &self,
        name: &str,
    ) -> Result<(serde_json::Value, StatefulResponse)> {
        let response = self.get_response(&format!("blob/{name}")).await?;
        let value = serde_json::from_slice(&response.content)?;
        Ok((value, response))
    }
}

/// The caching patch-server client: every response is persisted to the
/// state cache and logged in the database before it is returned.
pub struct CacheableRemote {
    inner: HttpRemote,
    db: KegDb,
    state_cache: StateCache,
}

impl CacheableRemote {
    pub fn new(remote: impl Into<String>, db: KegDb, state_cache: StateCache) -> Result<Self> {
        Ok(Self {
            inner: HttpRemote::new(remote)?,
            db,
            state_cache,
        })
    }

    pub fn remote(&self) -> &str {
        &self.inner.remote
    }

    fn record(&self, response: &StatefulResponse) -> Result<()> {
        self.state_cache.write(
            &response.endpoint,
            &response.digest,
            &response.content,
            response.last_modified.as_deref(),
        )?;
        self.db.write_response(
            &self.inner.remote,
            &response.endpoint,
            &response.digest,
            response.timestamp,
        )
    }

    pub async fn get_psv(&self, endpoint: &str) -> Result<(PsvDocument, StatefulResponse)> {
        let (document, response) = self.inner.get_psv(endpoint).await?;
        self.record(&response)?;
        self.db
            .write_psv(&self.inner.remote, endpoint, &response.digest, &document)?;
        Ok((document, response))
    }

    pub async fn get_blob(&self, name: &str) -> Result<(serde_json::Value, StatefulResponse)> {
        let (value, response) = self.inner.get_blob(name).await?;
        self.record(&response)?;
        Ok((value, response))
    }

    pub async fn get_versions(&self) -> Result<Vec<VersionsEntry>> {
        let (document, _) = self.get_psv("versions").await?;
        Ok(document.rows().iter().map(VersionsEntry::from_row).collect())
    }

    pub async fn get_cdns(&self) -> Result<Vec<CdnsEntry>> {
        let (document, _) = self.get_psv("cdns").await?;
        Ok(document.rows().iter().map(CdnsEntry::from_row).collect())
    }

    /// Background-download builds. Optional; missing data is `NoData`.
    pub async fn get_bgdl(&self) -> Result<Vec<VersionsEntry>> {
        let (document, _) = self.get_psv("bgdl").await?;
        Ok(document.rows().iter().map(VersionsEntry::from_row).collect())
    }

    /// The blobs table. Optional; missing data is `NoData`.
    pub async fn get_blobs(&self) -> Result<Vec<BlobsEntry>> {
        let (document, _) = self.get_psv("blobs").await?;
        Ok(document.rows().iter().map(BlobsEntry::from_row).collect())
    }

    pub async fn get_game_blob(&self) -> Result<serde_json::Value> {
        Ok(self.get_blob("game").await?.0)
    }

    pub async fn get_install_blob(&self) -> Result<serde_json::Value> {
        Ok(self.get_blob("install").await?.0)
    }

    /// The newest cached response for an endpoint, falling back to a live
    /// request when nothing is cached yet.
    pub async fn get_cached_psv(&self, endpoint: &str) -> Result<PsvDocument> {
        match self.db.latest_digest(&self.inner.remote, endpoint)? {
            Some(digest) => self.state_cache.read_psv(endpoint, &digest),
            None => Ok(self.get_psv(endpoint).await?.0),
        }
    }

    pub async fn get_cached_versions(&self) -> Result<Vec<VersionsEntry>> {
        let document = self.get_cached_psv("versions").await?;
        Ok(document.rows().iter().map(VersionsEntry::from_row).collect())
    }

    pub async fn get_cached_cdns(&self) -> Result<Vec<CdnsEntry>> {
        let document = self.get_cached_psv("cdns").await?;
        Ok(document.rows().iter().map(CdnsEntry::from_row).collect())
    }

    /// Replay a specific historical response.
    pub fn read_psv(&self, endpoint: &str, digest: &str) -> Result<PsvDocument> {
        self.state_cache.read_psv(endpoint, digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VERSIONS_PSV: &str = "\
Region!STRING:0|BuildConfig!HEX:16|CDNConfig!HEX:16|KeyRing!HEX:16|BuildId!DEC:4|VersionsName!String:0|ProductConfig!HEX:16
us|AA3571F9DACAA935F1B9B8C75B2DE34C|bb3571f9dacaa935f1b9b8c75b2de34c||61491|1.13.2.61491|cc3571f9dacaa935f1b9b8c75b2de34c
";

    const CDNS_PSV: &str = "\
Name!STRING:0|Path!STRING:0|Hosts!STRING:0|Servers!STRING:0|ConfigPath!STRING:0
us|tpr/product|mirror-a.example.net mirror-b.example.net|http://mirror-c.example.net|tpr/configs/data
";

    #[test]
    fn test_versions_entry() {
        let document = PsvDocument::parse(VERSIONS_PSV).unwrap();
        let entry = VersionsEntry::from_row(&document.rows()[0]);

        assert_eq!(entry.region, "us");
        assert_eq!(entry.build_config, "aa3571f9dacaa935f1b9b8c75b2de34c");
        assert_eq!(entry.key_ring, "");
        assert_eq!(entry.versions_name, "1.13.2.61491");
        assert_eq!(
            entry.config_triple(),
            (
                "aa3571f9dacaa935f1b9b8c75b2de34c",
                "bb3571f9dacaa935f1b9b8c75b2de34c",
                "cc3571f9dacaa935f1b9b8c75b2de34c"
            )
        );
    }

    #[test]
    fn test_cdns_entry() {
        let document = PsvDocument::parse(CDNS_PSV).unwrap();
        let entry = CdnsEntry::from_row(&document.rows()[0]);

        assert_eq!(entry.path, "tpr/product");
        assert_eq!(entry.config_path, "tpr/configs/data");
        assert_eq!(
            entry.all_servers(),
            vec![
                "http://mirror-c.example.net",
                "http://mirror-a.example.net",
                "http://mirror-b.example.net",
            ]
        );
    }

    #[test]
    fn test_digest_covers_raw_bytes() {
        // The digest is over the raw response, trailing newline included.
        let with_newline = md5_hex(b"Region!STRING:0\nus\n");
        let without = md5_hex(b"Region!STRING:0\nus");
        assert_ne!(with_newline, without);
    }
}
