//! The relational state cache, `keg.db`.
//!
//! Every distinct response from a stateful endpoint is logged as a
//! `(remote, path, digest, timestamp)` row; PSV responses are additionally
//! decoded into `psv_rows` and denormalized per-endpoint views so builds
//! can be looked up by name, id or key without re-parsing. Rows are
//! append-only; the current value of an endpoint is its newest row.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, params};
use tracing::debug;

use keg_psv::PsvDocument;

use crate::error::Result;

const TABLE_DEFINITIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS responses (
        remote TEXT NOT NULL,
        path TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        digest TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS psv_rows (
        remote TEXT NOT NULL,
        path TEXT NOT NULL,
        digest TEXT NOT NULL,
        row INTEGER NOT NULL,
        data TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS versions (
        remote TEXT NOT NULL,
        digest TEXT NOT NULL,
        row INTEGER NOT NULL,
        build_config TEXT,
        build_id TEXT,
        cdn_config TEXT,
        key_ring TEXT,
        product_config TEXT,
        region TEXT,
        versions_name TEXT
    )",
    "CREATE TABLE IF NOT EXISTS bgdl (
        remote TEXT NOT NULL,
        digest TEXT NOT NULL,
        row INTEGER NOT NULL,
        build_config TEXT,
        build_id TEXT,
        cdn_config TEXT,
        key_ring TEXT,
        product_config TEXT,
        region TEXT,
        versions_name TEXT
    )",
    "CREATE TABLE IF NOT EXISTS cdns (
        remote TEXT NOT NULL,
        digest TEXT NOT NULL,
        row INTEGER NOT NULL,
        name TEXT,
        path TEXT,
        hosts TEXT,
        servers TEXT,
        config_path TEXT
    )",
    "CREATE TABLE IF NOT EXISTS blobs (
        remote TEXT NOT NULL,
        digest TEXT NOT NULL,
        row INTEGER NOT NULL,
        region TEXT,
        install_blob_md5 TEXT,
        game_blob_md5 TEXT
    )",
];

/// One `responses` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseRow {
    pub path: String,
    pub digest: String,
    pub timestamp: i64,
}

/// One denormalized `versions` (or `bgdl`) row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRow {
    pub region: String,
    pub build_config: String,
    pub build_id: String,
    pub cdn_config: String,
    pub product_config: String,
    pub versions_name: String,
}

/// Handle on `keg.db`. Writes serialize through the shared connection;
/// readers are free to share it.
#[derive(Clone)]
pub struct KegDb {
    conn: Arc<Mutex<Connection>>,
}

impl KegDb {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            conn: Arc::new(Mutex::new(Connection::open(path)?)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        })
    }

    pub fn create_tables(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        for statement in TABLE_DEFINITIONS {
            conn.execute(statement, [])?;
        }
        Ok(())
    }

    /// Append a response-log row.
    pub fn write_response(
        &self,
        remote: &str,
        path: &str,
        digest: &str,
        timestamp: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO responses (remote, path, timestamp, digest) VALUES (?1, ?2, ?3, ?4)",
            params![remote, path, timestamp, digest],
        )?;
        Ok(())
    }

    /// The newest digest seen for an endpoint.
    pub fn latest_digest(&self, remote: &str, path: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let mut statement = conn.prepare(
            "SELECT digest FROM responses WHERE remote = ?1 AND path = ?2
             ORDER BY timestamp DESC, rowid DESC LIMIT 1",
        )?;
        let mut rows = statement.query(params![remote, path])?;
        Ok(match rows.next()? {
            Some(row) => Some(row.get(0)?),
            None => None,
        })
    }

    /// The whole response log for a remote, newest first.
    pub fn response_log(&self, remote: &str) -> Result<Vec<ResponseRow>> {
        let conn = self.conn.lock().unwrap();
        let mut statement = conn.prepare(
            "SELECT path, digest, timestamp FROM responses WHERE remote = ?1
             ORDER BY timestamp DESC, rowid DESC",
        )?;
        let rows = statement.query_map(params![remote], |row| {
            Ok(ResponseRow {
                path: row.get(0)?,
                digest: row.get(1)?,
                timestamp: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    /// Decode a PSV document into `psv_rows` plus the endpoint's
    /// denormalized view, if it has one.
    pub fn write_psv(
        &self,
        remote: &str,
        path: &str,
        digest: &str,
        document: &PsvDocument,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        for (index, row) in document.rows().iter().enumerate() {
            let cells: BTreeMap<&str, &str> = document
                .schema()
                .fields()
                .iter()
                .map(|f| (f.name.as_str(), row.cell(f.index).unwrap_or("")))
                .collect();
            conn.execute(
                "INSERT INTO psv_rows (remote, path, digest, row, data)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    remote,
                    path,
                    digest,
                    index as i64,
                    serde_json::to_string(&cells)?
                ],
            )?;

            match path {
                "versions" | "bgdl" => {
                    conn.execute(
                        &format!(
                            "INSERT INTO {path} (remote, digest, row, build_config, build_id,
                             cdn_config, key_ring, product_config, region, versions_name)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                        ),
                        params![
                            remote,
                            digest,
                            index as i64,
                            row.get_or_default("BuildConfig").to_lowercase(),
                            row.get_or_default("BuildId"),
                            row.get_or_default("CDNConfig").to_lowercase(),
                            row.get_or_default("KeyRing").to_lowercase(),
                            row.get_or_default("ProductConfig").to_lowercase(),
                            row.get_or_default("Region"),
                            row.get_or_default("VersionsName"),
                        ],
                    )?;
                }
                "cdns" => {
                    conn.execute(
                        "INSERT INTO cdns (remote, digest, row, name, path, hosts, servers,
                         config_path) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                        params![
                            remote,
                            digest,
                            index as i64,
                            row.get_or_default("Name"),
                            row.get_or_default("Path"),
                            row.get_or_default("Hosts"),
                            row.get_or_default("Servers"),
                            row.get_or_default("ConfigPath"),
                        ],
                    )?;
                }
                "blobs" => {
                    conn.execute(
                        "INSERT INTO blobs (remote, digest, row, region, install_blob_md5,
                         game_blob_md5) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![
                            remote,
                            digest,
                            index as i64,
                            row.get_or_default("Region"),
                            row.get_or_default("InstallBlobMD5").to_lowercase(),
                            row.get_or_default("GameBlobMD5").to_lowercase(),
                        ],
                    )?;
                }
                _ => {}
            }
        }

        debug!(
            "Recorded {} PSV rows for {remote} {path} ({digest})",
            document.rows().len()
        );
        Ok(())
    }

    /// Find known builds by version name, build id, or build-config key
    /// prefix.
    pub fn lookup_versions(&self, remote: &str, needle: &str) -> Result<Vec<VersionRow>> {
        let conn = self.conn.lock().unwrap();
        let mut statement = conn.prepare(
            "SELECT DISTINCT region, build_config, build_id, cdn_config, product_config,
             versions_name FROM versions
             WHERE remote = ?1
               AND (versions_name = ?2 OR build_id = ?2 OR build_config LIKE ?3)",
        )?;
        let pattern = format!("{}%", needle.to_lowercase());
        let rows = statement.query_map(params![remote, needle, pattern], |row| {
            Ok(VersionRow {
                region: row.get(0)?,
                build_config: row.get(1)?,
                build_id: row.get(2)?,
                cdn_config: row.get(3)?,
                product_config: row.get(4)?,
                versions_name: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    /// Drop every row belonging to a remote. Objects are untouched.
    pub fn remove_remote(&self, remote: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        for table in ["responses", "psv_rows", "versions", "bgdl", "cdns", "blobs"] {
            conn.execute(&format!("DELETE FROM {table} WHERE remote = ?1"), params![
                remote
            ])?;
        }
        Ok(())
    }
}
