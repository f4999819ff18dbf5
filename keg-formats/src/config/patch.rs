//! Patch configuration parser.

use tracing::warn;

use crate::config::{parse_key, parse_pairs, parse_u64};
use crate::error::{Error, Result};
use crate::key::Key;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PatchConfig {
    /// Encoded key of the patch manifest.
    pub patch: Option<Key>,
    pub patch_size: Option<u64>,
    /// One entry per `patch-entry` line.
    pub patch_entries: Vec<PatchEntry>,
}

/// One `patch-entry` line: the patched file and the old→patch pairs that
/// produce it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchEntry {
    /// What kind of file is patched (`encoding`, `install`, …).
    pub kind: String,
    pub content_key: Key,
    pub content_size: u64,
    /// Encoding spec of the patched result, carried opaquely.
    pub espec: String,
    /// `(old_key, old_size, patch_key, patch_size)` alternatives.
    pub pairs: Vec<(Key, u64, Key, u64)>,
}

impl PatchEntry {
    fn parse(value: &str) -> Result<Self> {
        let parse_err = |reason: &str| Error::ConfigValue {
            key: "patch-entry".to_string(),
            expected: "patch entry",
            value: format!("{reason}: {value}"),
        };

        let mut tokens = value.split_whitespace();
        let kind = tokens.next().ok_or_else(|| parse_err("empty"))?.to_string();
        let content_key = parse_key("patch-entry", tokens.next().ok_or_else(|| parse_err("missing content key"))?)?;
        let content_size = parse_u64(
            "patch-entry",
            tokens.next().ok_or_else(|| parse_err("missing content size"))?,
        )?;
        let espec = tokens
            .next()
            .ok_or_else(|| parse_err("missing espec"))?
            .to_string();

        let rest: Vec<&str> = tokens.collect();
        if rest.len() % 4 != 0 {
            return Err(parse_err("pair list not a multiple of 4"));
        }

        let mut pairs = Vec::with_capacity(rest.len() / 4);
        for chunk in rest.chunks_exact(4) {
            pairs.push((
                parse_key("patch-entry", chunk[0])?,
                parse_u64("patch-entry", chunk[1])?,
                parse_key("patch-entry", chunk[2])?,
                parse_u64("patch-entry", chunk[3])?,
            ));
        }

        Ok(Self {
            kind,
            content_key,
            content_size,
            espec,
            pairs,
        })
    }
}

impl PatchConfig {
    pub fn parse(text: &str) -> Result<Self> {
        let mut o = Self::default();

        for (k, v) in parse_pairs(text)? {
            match k.as_str() {
                "patch" => o.patch = Some(parse_key(&k, &v)?),
                "patch-size" => o.patch_size = Some(parse_u64(&k, &v)?),
                "patch-entry" => o.patch_entries.push(PatchEntry::parse(&v)?),
                other => {
                    warn!("Unknown patch config key: {other:?}");
                }
            }
        }

        Ok(o)
    }
}
