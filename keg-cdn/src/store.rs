//! The store interface and object-kind addressing.

use std::fmt;

use async_trait::async_trait;

use keg_formats::Key;

use crate::error::Result;

/// What kind of object a key names. The kind picks the subtree and suffix
/// an object is stored under, and how its digest is verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// Build/CDN/patch config documents. MD5 of the raw bytes.
    Config,
    /// Product config JSON, served from the CDN's config path.
    ProductConfig,
    /// Loose encoded files. BLTE blobs verify against their header MD5,
    /// anything else against the raw MD5.
    Data,
    /// Whole archives. Same subtree as `Data`; an archive's key is the MD5
    /// of its index footer, so the archive body is verified by walking its
    /// concatenated blobs instead.
    Archive,
    /// Archive indices, `.index` suffix. MD5 of the 28-byte footer.
    DataIndex,
    /// Loose patch files.
    Patch,
    /// Whole patch archives. Same subtree as `Patch`, keyed by their index
    /// footer MD5 like data archives, and verified the same way.
    PatchArchive,
    /// Patch archive indices.
    PatchIndex,
    /// Loose sub-archive pieces; local-only, parallel tree.
    Fragment,
}

impl ObjectKind {
    /// Path of an object relative to the objects root (or, for fragments,
    /// the fragments root): `{subtree}/xx/yy/{key}[.index]`.
    pub fn object_path(&self, key: &Key) -> String {
        let partitioned = key.partition();
        match self {
            ObjectKind::Config | ObjectKind::ProductConfig => format!("config/{partitioned}"),
            ObjectKind::Data | ObjectKind::Archive => format!("data/{partitioned}"),
            ObjectKind::DataIndex => format!("data/{partitioned}.index"),
            ObjectKind::Patch | ObjectKind::PatchArchive => format!("patch/{partitioned}"),
            ObjectKind::PatchIndex => format!("patch/{partitioned}.index"),
            ObjectKind::Fragment => partitioned,
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ObjectKind::Config => "config",
            ObjectKind::ProductConfig => "product config",
            ObjectKind::Data => "data",
            ObjectKind::Archive => "archive",
            ObjectKind::DataIndex => "index",
            ObjectKind::Patch => "patch",
            ObjectKind::PatchArchive => "patch archive",
            ObjectKind::PatchIndex => "patch index",
            ObjectKind::Fragment => "fragment",
        })
    }
}

/// The capability set shared by the store implementations.
///
/// Readers may run concurrently; writes for one key go through a temp file
/// and a final rename, so a half-written object is never visible.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Whether the object is available locally without network traffic.
    fn has(&self, kind: ObjectKind, key: &Key) -> bool;

    /// Read a whole object.
    async fn get(&self, kind: ObjectKind, key: &Key) -> Result<Vec<u8>>;

    /// Read a byte range of an object (archive range reads).
    async fn get_range(&self, kind: ObjectKind, key: &Key, offset: u64, size: u64)
    -> Result<Vec<u8>>;

    /// Make the object available locally. Returns whether anything was
    /// fetched; a no-op when the object is already present.
    async fn ensure(&self, kind: ObjectKind, key: &Key) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_paths() {
        let key = Key::from_hex("0123abcd0123abcd0123abcd0123abcd").unwrap();
        assert_eq!(
            ObjectKind::Config.object_path(&key),
            "config/01/23/0123abcd0123abcd0123abcd0123abcd"
        );
        assert_eq!(
            ObjectKind::DataIndex.object_path(&key),
            "data/01/23/0123abcd0123abcd0123abcd0123abcd.index"
        );
        assert_eq!(
            ObjectKind::Fragment.object_path(&key),
            "01/23/0123abcd0123abcd0123abcd0123abcd"
        );
    }
}
