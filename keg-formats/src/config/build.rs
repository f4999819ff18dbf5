//! Build configuration parser.
//!
//! The build config is the logical manifest root of a build: it names the
//! root, encoding, install, download and size files, plus build metadata.

use tracing::warn;

use crate::config::{KeyPair, parse_key, parse_key_pair, parse_pairs};
use crate::error::Result;
use crate::key::Key;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BuildConfig {
    /// Content key of the root manifest.
    pub root: Option<Key>,

    /// The encoding file, as `content-key encoded-key`.
    pub encoding: KeyPair,
    /// The install manifest.
    pub install: KeyPair,
    /// The download manifest.
    pub download: KeyPair,
    /// The size file.
    pub size: KeyPair,

    /// Encoded key of the patch manifest.
    pub patch: Option<Key>,
    /// Key of the patch config document.
    pub patch_config: Option<Key>,

    pub build_name: Option<String>,
    pub build_uid: Option<String>,
    pub build_product: Option<String>,
}

impl BuildConfig {
    pub fn parse(text: &str) -> Result<Self> {
        let mut o = Self::default();

        for (k, v) in parse_pairs(text)? {
            match k.as_str() {
                "root" => o.root = Some(parse_key(&k, &v)?),
                "encoding" => o.encoding = parse_key_pair(&k, &v)?,
                "install" => o.install = parse_key_pair(&k, &v)?,
                "download" => o.download = parse_key_pair(&k, &v)?,
                "size" => o.size = parse_key_pair(&k, &v)?,
                "patch" => o.patch = Some(parse_key(&k, &v)?),
                "patch-config" => o.patch_config = Some(parse_key(&k, &v)?),
                "build-name" => o.build_name = Some(v),
                "build-uid" => o.build_uid = Some(v),
                "build-product" => o.build_product = Some(v),
                // Size hints and the rest of the build-* metadata carry no
                // information the engine acts on.
                "encoding-size" | "install-size" | "download-size" | "size-size"
                | "patch-size" => {}
                other if other.starts_with("build-") => {}
                other => {
                    warn!("Unknown build config key: {other:?}");
                }
            }
        }

        Ok(o)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUILD_CONFIG: &str = "\
# Build Configuration

root = 4d9f1b9e0f4cbbd0af4f4550702aa29f
install = 1f8b6280c17a58a4dd9d2b9f5ecc4cb5 8733aff2e93a6d8300bd4c3ef5a12a40
download = 5ab7d596b5d6087ec4ac00b2b1234b3c
encoding = aef79fbd0ea10ecb2def9f0e58f19e1b c5d4b1d3ff15d1d85162ec26de74e0d9
encoding-size = 30935921 30936230
build-name = WOW-32089patch9.0.1_Beta
build-product = WoW
build-uid = wow_beta
patch = e35f9b4d2b6a88a4e93f8c5f7e1dd6b0
patch-config = ff2eaf4a6ba98e7ba4ab8d2e4ba5a7cf
";

    #[test]
    fn test_parse_build_config() {
        let config = BuildConfig::parse(BUILD_CONFIG).unwrap();

        assert_eq!(
            config.root.unwrap().to_hex(),
            "4d9f1b9e0f4cbbd0af4f4550702aa29f"
        );
        assert_eq!(
            config.encoding.content_key.unwrap().to_hex(),
            "aef79fbd0ea10ecb2def9f0e58f19e1b"
        );
        assert_eq!(
            config.encoding.encoding_key.unwrap().to_hex(),
            "c5d4b1d3ff15d1d85162ec26de74e0d9"
        );
        assert!(config.install.encoding_key.is_some());
        assert!(config.download.encoding_key.is_none());
        assert_eq!(config.build_name.as_deref(), Some("WOW-32089patch9.0.1_Beta"));
        assert_eq!(config.build_uid.as_deref(), Some("wow_beta"));
        assert!(config.patch_config.is_some());
    }

    #[test]
    fn test_empty_config() {
        let config = BuildConfig::parse("").unwrap();
        assert_eq!(config, BuildConfig::default());
    }

    #[test]
    fn test_bad_key_value() {
        assert!(BuildConfig::parse("root = nothex").is_err());
    }
}
