//! `key = value` configuration documents.
//!
//! Build, CDN and patch configs all share one line format:
//!
//! ```text
//! # Comment to be ignored
//!
//! root = 5a3571f9dacaa935f1b9b8c75b2de34c
//! archives = 61f4667bdb9718c8fca3d707c0f232b1 ebd09b37571b4d8b0ba1c19a0d4a1a1f
//! ```
//!
//! Repeated keys accumulate. Values may be whitespace-separated lists. The
//! identity of a config document is the MD5 of its raw bytes.

mod build;
mod cdn;
mod patch;

pub use build::BuildConfig;
pub use cdn::CdnConfig;
pub use patch::{PatchConfig, PatchEntry};

use crate::error::{Error, Result};
use crate::key::Key;

/// Parse config text into its `(key, value)` pairs, in order.
///
/// Comments and blank lines are skipped. Repeated keys yield repeated pairs.
pub fn parse_pairs(text: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            return Err(Error::ConfigSyntax {
                line: line.to_string(),
            });
        };
        pairs.push((k.trim().to_string(), v.trim().to_string()));
    }

    Ok(pairs)
}

/// A `content-key [encoded-key]` value, as carried by the `encoding`,
/// `install`, `download` and `size` build-config keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyPair {
    pub content_key: Option<Key>,
    pub encoding_key: Option<Key>,
}

pub(crate) fn parse_key(key: &str, value: &str) -> Result<Key> {
    Key::from_hex(value).map_err(|_| Error::ConfigValue {
        key: key.to_string(),
        expected: "key",
        value: value.to_string(),
    })
}

pub(crate) fn parse_key_list(key: &str, value: &str) -> Result<Vec<Key>> {
    value
        .split_whitespace()
        .map(|v| parse_key(key, v))
        .collect()
}

pub(crate) fn parse_key_pair(key: &str, value: &str) -> Result<KeyPair> {
    let mut parts = value.split_whitespace();
    let content_key = parts.next().map(|v| parse_key(key, v)).transpose()?;
    let encoding_key = parts.next().map(|v| parse_key(key, v)).transpose()?;
    Ok(KeyPair {
        content_key,
        encoding_key,
    })
}

pub(crate) fn parse_u64(key: &str, value: &str) -> Result<u64> {
    value.parse().map_err(|_| Error::ConfigValue {
        key: key.to_string(),
        expected: "integer",
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pairs() {
        let text = "\
# build config

root = 5a3571f9dacaa935f1b9b8c75b2de34c
encoding = aa3571f9dacaa935f1b9b8c75b2de34c bb3571f9dacaa935f1b9b8c75b2de34c
patch-entry = one
patch-entry = two
";
        let pairs = parse_pairs(text).unwrap();
        assert_eq!(pairs.len(), 4);
        assert_eq!(pairs[0].0, "root");
        assert_eq!(pairs[2], ("patch-entry".to_string(), "one".to_string()));
        assert_eq!(pairs[3], ("patch-entry".to_string(), "two".to_string()));
    }

    #[test]
    fn test_parse_pairs_rejects_bare_lines() {
        let err = parse_pairs("no equals sign here").unwrap_err();
        assert!(matches!(err, Error::ConfigSyntax { .. }));
    }

    #[test]
    fn test_key_pair() {
        let pair = parse_key_pair(
            "encoding",
            "aa3571f9dacaa935f1b9b8c75b2de34c bb3571f9dacaa935f1b9b8c75b2de34c",
        )
        .unwrap();
        assert_eq!(
            pair.content_key.unwrap().to_hex(),
            "aa3571f9dacaa935f1b9b8c75b2de34c"
        );
        assert_eq!(
            pair.encoding_key.unwrap().to_hex(),
            "bb3571f9dacaa935f1b9b8c75b2de34c"
        );

        let single = parse_key_pair("install", "aa3571f9dacaa935f1b9b8c75b2de34c").unwrap();
        assert!(single.encoding_key.is_none());
    }
}
