//! The repository configuration file, `keg.conf`.
//!
//! TOML with a handful of recognized keys. The whole document is retained
//! and written back as parsed, so keys this version does not recognize
//! survive a rewrite verbatim.

use std::path::PathBuf;

use toml::Table;
use toml::value::Value;
use tracing::debug;

use crate::error::{Error, Result};

/// The remote prefix applied to bare remote names.
pub const DEFAULT_REMOTE_PREFIX: &str = "http://us.patch.battle.net:1119/";

const CONFIG_VERSION: i64 = 1;

/// Handle on a `keg.conf` document.
#[derive(Debug, Clone)]
pub struct KegConfig {
    path: PathBuf,
    table: Table,
}

impl KegConfig {
    /// Load an existing config, or an empty one if the file is absent.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let table = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            let table: Table = text.parse().map_err(|e| Error::Config {
                key: path.display().to_string(),
                reason: format!("not valid TOML: {e}"),
            })?;
            validate(&table)?;
            table
        } else {
            Table::new()
        };

        Ok(Self { path, table })
    }

    /// Write the default document if the file does not exist yet.
    pub fn initialize(&mut self) -> Result<()> {
        if self.path.exists() {
            return Ok(());
        }

        let mut keg = Table::new();
        keg.insert("config_version".into(), Value::Integer(CONFIG_VERSION));
        keg.insert(
            "default-remote-prefix".into(),
            Value::String(DEFAULT_REMOTE_PREFIX.into()),
        );
        keg.insert("verify-integrity".into(), Value::Boolean(true));
        keg.insert("preferred-cdns".into(), Value::Array(Vec::new()));
        self.table.insert("keg".into(), Value::Table(keg));

        let mut ngdp = Table::new();
        ngdp.insert("hash_function".into(), Value::String("md5".into()));
        self.table.insert("ngdp".into(), Value::Table(ngdp));

        self.save()
    }

    pub fn save(&self) -> Result<()> {
        debug!("Writing config to {:?}", self.path);
        std::fs::write(&self.path, toml::to_string_pretty(&self.table).map_err(
            |e| Error::Config {
                key: self.path.display().to_string(),
                reason: format!("cannot serialize: {e}"),
            },
        )?)?;
        Ok(())
    }

    fn keg_section(&self) -> Option<&Table> {
        self.table.get("keg").and_then(Value::as_table)
    }

    pub fn default_remote_prefix(&self) -> String {
        self.keg_section()
            .and_then(|t| t.get("default-remote-prefix"))
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_REMOTE_PREFIX)
            .to_string()
    }

    pub fn verify_integrity(&self) -> bool {
        self.keg_section()
            .and_then(|t| t.get("verify-integrity"))
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }

    /// Mirror hostnames to prefer, in order.
    pub fn preferred_cdns(&self) -> Vec<String> {
        self.keg_section()
            .and_then(|t| t.get("preferred-cdns"))
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Directory of provisioned armadillo key files.
    pub fn armadillo_keys_dir(&self) -> Option<PathBuf> {
        self.table
            .get("armadillo")
            .and_then(Value::as_table)
            .and_then(|t| t.get("keys"))
            .and_then(Value::as_str)
            .map(PathBuf::from)
    }

    fn remotes_section(&self) -> Option<&Table> {
        self.table.get("remotes").and_then(Value::as_table)
    }

    /// All configured remotes.
    pub fn remotes(&self) -> Vec<String> {
        self.remotes_section()
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_remote(&self, remote: &str) -> bool {
        self.remotes_section()
            .is_some_and(|t| t.contains_key(remote))
    }

    fn remote_flag(&self, remote: &str, flag: &str) -> bool {
        self.remotes_section()
            .and_then(|t| t.get(remote))
            .and_then(Value::as_table)
            .and_then(|t| t.get(flag))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn remote_is_writeable(&self, remote: &str) -> bool {
        self.remote_flag(remote, "writeable")
    }

    pub fn remote_is_default_fetch(&self, remote: &str) -> bool {
        self.remote_flag(remote, "default-fetch")
    }

    /// Remotes that `fetch-all` covers.
    pub fn fetchable_remotes(&self) -> Vec<String> {
        self.remotes()
            .into_iter()
            .filter(|r| self.remote_is_default_fetch(r))
            .collect()
    }

    pub fn add_remote(&mut self, remote: &str, default_fetch: bool, writeable: bool) -> Result<()> {
        let remotes = self
            .table
            .entry("remotes")
            .or_insert_with(|| Value::Table(Table::new()));
        let Some(remotes) = remotes.as_table_mut() else {
            return Err(Error::Config {
                key: "remotes".to_string(),
                reason: "not a table".to_string(),
            });
        };

        let mut entry = Table::new();
        entry.insert("default-fetch".into(), Value::Boolean(default_fetch));
        entry.insert("writeable".into(), Value::Boolean(writeable));
        remotes.insert(remote.to_string(), Value::Table(entry));
        self.save()
    }

    pub fn remove_remote(&mut self, remote: &str) -> Result<()> {
        let removed = self
            .table
            .get_mut("remotes")
            .and_then(Value::as_table_mut)
            .and_then(|t| t.remove(remote));
        if removed.is_none() {
            return Err(Error::NotFound {
                kind: "remote",
                key: remote.to_string(),
            });
        }
        self.save()
    }
}

fn validate(table: &Table) -> Result<()> {
    let version = table
        .get("keg")
        .and_then(Value::as_table)
        .and_then(|t| t.get("config_version"))
        .and_then(Value::as_integer);
    if version != Some(CONFIG_VERSION) {
        return Err(Error::Config {
            key: "keg.config_version".to_string(),
            reason: format!("expected {CONFIG_VERSION}, found {version:?}"),
        });
    }

    let hash_function = table
        .get("ngdp")
        .and_then(Value::as_table)
        .and_then(|t| t.get("hash_function"))
        .and_then(Value::as_str);
    if hash_function != Some("md5") {
        return Err(Error::Config {
            key: "ngdp.hash_function".to_string(),
            reason: format!("unsupported hash function {hash_function:?}"),
        });
    }

    Ok(())
}
