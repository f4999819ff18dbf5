//! CDN configuration parser.
//!
//! The CDN config is a build's physical manifest: which archives exist,
//! their group index, and the loose-file indices.

use tracing::warn;

use crate::config::{parse_key, parse_key_list, parse_pairs};
use crate::error::Result;
use crate::key::Key;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CdnConfig {
    /// Archive keys, in lookup-priority order.
    pub archives: Vec<Key>,
    /// Key of the merged group index over all archives.
    pub archive_group: Option<Key>,

    pub patch_archives: Vec<Key>,
    pub patch_archive_group: Option<Key>,

    /// Index of loose (non-archived) data files.
    pub file_index: Option<Key>,
    /// Index of loose patch files.
    pub patch_file_index: Option<Key>,
}

impl CdnConfig {
    pub fn parse(text: &str) -> Result<Self> {
        let mut o = Self::default();

        for (k, v) in parse_pairs(text)? {
            match k.as_str() {
                "archives" => o.archives = parse_key_list(&k, &v)?,
                "archive-group" => o.archive_group = Some(parse_key(&k, &v)?),
                "patch-archives" => o.patch_archives = parse_key_list(&k, &v)?,
                "patch-archive-group" => o.patch_archive_group = Some(parse_key(&k, &v)?),
                "file-index" => o.file_index = Some(parse_key(&k, &v)?),
                "patch-file-index" => o.patch_file_index = Some(parse_key(&k, &v)?),
                "archives-index-size" | "patch-archives-index-size" | "file-index-size"
                | "patch-file-index-size" => {}
                other => {
                    warn!("Unknown CDN config key: {other:?}");
                }
            }
        }

        Ok(o)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cdn_config() {
        let text = "\
archives = 61f4667bdb9718c8fca3d707c0f232b1 ebd09b37571b4d8b0ba1c19a0d4a1a1f
archives-index-size = 565616 263928
archive-group = 5a80e9e60edb3511bbdcdb7a8fa58d40
patch-archives = 9a70a02cf0f5b3ec7bed2c9e0f4e121c
file-index = e83b3f1b4ac0b4dbd7274ccf36a3b0de
";
        let config = CdnConfig::parse(text).unwrap();
        assert_eq!(config.archives.len(), 2);
        assert_eq!(
            config.archives[0].to_hex(),
            "61f4667bdb9718c8fca3d707c0f232b1"
        );
        assert_eq!(config.patch_archives.len(), 1);
        assert!(config.archive_group.is_some());
        assert!(config.file_index.is_some());
        assert!(config.patch_file_index.is_none());
    }

    #[test]
    fn test_archive_order_preserved() {
        let text = "archives = ffffffffffffffffffffffffffffffff 00000000000000000000000000000000";
        let config = CdnConfig::parse(text).unwrap();
        assert!(config.archives[0] > config.archives[1]);
    }
}
