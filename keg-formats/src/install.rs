//! Install manifest parser.
//!
//! The install manifest lists the files that make up an installed game
//! tree: a path, the file's content key, its size, and which tags it
//! carries. Filtering by tag decides what lands on disk for a given
//! platform and locale.

use byteorder::{BigEndian, ReadBytesExt};
use std::io::Cursor;
use tracing::debug;

use crate::error::{Error, Result};
use crate::ioutil::{read_bytes, read_cstring};
use crate::key::Key;
use crate::tags::{Tag, pack_mask, selection_mask, unpack_mask};

const INSTALL_MAGIC: [u8; 2] = *b"IN";

/// Install manifest header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallHeader {
    pub version: u8,
    pub hash_size: u8,
    pub tag_count: u16,
    pub entry_count: u32,
}

/// One installable file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallEntry {
    /// Path relative to the install root.
    pub path: String,
    pub ckey: Key,
    pub size: u32,
}

/// A parsed install manifest.
pub struct InstallManifest {
    pub header: InstallHeader,
    pub tags: Vec<Tag>,
    pub entries: Vec<InstallEntry>,
}

impl InstallManifest {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);

        let mut magic = [0u8; 2];
        std::io::Read::read_exact(&mut cursor, &mut magic)?;
        if magic != INSTALL_MAGIC {
            return Err(Error::BadMagic { format: "install" });
        }

        let header = InstallHeader {
            version: cursor.read_u8()?,
            hash_size: cursor.read_u8()?,
            tag_count: cursor.read_u16::<BigEndian>()?,
            entry_count: cursor.read_u32::<BigEndian>()?,
        };
        if header.hash_size != 16 {
            return Err(Error::Parse {
                format: "install",
                offset: 3,
                reason: format!("unsupported hash size {}", header.hash_size),
            });
        }

        let mask_len = (header.entry_count as usize).div_ceil(8);
        let mut tags = Vec::with_capacity(header.tag_count as usize);
        for _ in 0..header.tag_count {
            let name = read_cstring(&mut cursor, "install")?;
            let tag_type = cursor.read_u16::<BigEndian>()?;
            let mask_bytes = read_bytes(&mut cursor, mask_len)?;
            tags.push(Tag {
                name,
                tag_type,
                mask: unpack_mask(&mask_bytes, header.entry_count as usize),
            });
        }

        let mut entries = Vec::with_capacity(header.entry_count as usize);
        for _ in 0..header.entry_count {
            let path = read_cstring(&mut cursor, "install")?;
            let ckey = Key::from_slice(&read_bytes(&mut cursor, 16)?)?;
            let size = cursor.read_u32::<BigEndian>()?;
            entries.push(InstallEntry { path, ckey, size });
        }

        debug!(
            "Parsed install manifest: {} tags, {} entries",
            tags.len(),
            entries.len()
        );
        Ok(Self {
            header,
            tags,
            entries,
        })
    }

    /// Entries matching a tag selection.
    ///
    /// Within a tag type, selected tags are alternatives; across types they
    /// all must hold. Unknown tag names fail.
    pub fn filter_entries(&self, selected: &[&str]) -> Result<Vec<&InstallEntry>> {
        let include = selection_mask(&self.tags, selected, self.entries.len())?;
        Ok(self
            .entries
            .iter()
            .zip(include)
            .filter_map(|(entry, keep)| keep.then_some(entry))
            .collect())
    }

    pub fn tag_names(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(|t| t.name.as_str())
    }

    /// Total decoded size of a tag selection.
    pub fn size_for_tags(&self, selected: &[&str]) -> Result<u64> {
        Ok(self
            .filter_entries(selected)?
            .iter()
            .map(|e| u64::from(e.size))
            .sum())
    }
}

/// Builds a well-formed install manifest.
#[derive(Debug, Default)]
pub struct InstallBuilder {
    tags: Vec<(String, u16)>,
    entries: Vec<(InstallEntry, Vec<String>)>,
}

impl InstallBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tag(&mut self, name: &str, tag_type: u16) -> &mut Self {
        self.tags.push((name.to_string(), tag_type));
        self
    }

    /// Add an entry carrying the named tags.
    pub fn add_entry(&mut self, path: &str, ckey: Key, size: u32, tags: &[&str]) -> &mut Self {
        self.entries.push((
            InstallEntry {
                path: path.to_string(),
                ckey,
                size,
            },
            tags.iter().map(|t| t.to_string()).collect(),
        ));
        self
    }

    pub fn build(self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        data.extend_from_slice(&INSTALL_MAGIC);
        data.push(1); // version
        data.push(16); // hash size
        data.extend_from_slice(&(self.tags.len() as u16).to_be_bytes());
        data.extend_from_slice(&(self.entries.len() as u32).to_be_bytes());

        for (name, tag_type) in &self.tags {
            let mask: Vec<bool> = self
                .entries
                .iter()
                .map(|(_, entry_tags)| entry_tags.contains(name))
                .collect();

            data.extend_from_slice(name.as_bytes());
            data.push(0);
            data.extend_from_slice(&tag_type.to_be_bytes());
            data.extend_from_slice(&pack_mask(&mask));
        }

        for (entry, _) in &self.entries {
            data.extend_from_slice(entry.path.as_bytes());
            data.push(0);
            data.extend_from_slice(entry.ckey.as_bytes());
            data.extend_from_slice(&entry.size.to_be_bytes());
        }

        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_n(n: u8) -> Key {
        Key::from_bytes([n; 16])
    }

    fn sample_manifest() -> Vec<u8> {
        let mut builder = InstallBuilder::new();
        builder.add_tag("Windows", 1);
        builder.add_tag("OSX", 1);
        builder.add_tag("enUS", 2);
        builder.add_tag("frFR", 2);
        builder.add_entry("game.exe", key_n(1), 1000, &["Windows", "enUS"]);
        builder.add_entry("game.app", key_n(2), 2000, &["OSX", "enUS"]);
        builder.add_entry("data_fr.bin", key_n(3), 3000, &["Windows", "frFR"]);
        builder.build().unwrap()
    }

    #[test]
    fn test_parse() {
        let manifest = InstallManifest::parse(&sample_manifest()).unwrap();
        assert_eq!(manifest.header.tag_count, 4);
        assert_eq!(manifest.header.entry_count, 3);
        assert_eq!(manifest.entries[0].path, "game.exe");
        assert_eq!(manifest.entries[0].ckey, key_n(1));
        assert_eq!(manifest.entries[2].size, 3000);
        assert_eq!(
            manifest.tag_names().collect::<Vec<_>>(),
            vec!["Windows", "OSX", "enUS", "frFR"]
        );
    }

    #[test]
    fn test_filter_and_semantics_across_types() {
        let manifest = InstallManifest::parse(&sample_manifest()).unwrap();

        let entries = manifest.filter_entries(&["Windows", "enUS"]).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "game.exe");
    }

    #[test]
    fn test_filter_or_semantics_within_type() {
        let manifest = InstallManifest::parse(&sample_manifest()).unwrap();

        let entries = manifest.filter_entries(&["enUS", "frFR"]).unwrap();
        assert_eq!(entries.len(), 3);

        let entries = manifest.filter_entries(&["Windows"]).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_unknown_tag() {
        let manifest = InstallManifest::parse(&sample_manifest()).unwrap();
        assert!(matches!(
            manifest.filter_entries(&["Amiga"]),
            Err(Error::UnknownTag { .. })
        ));
    }

    #[test]
    fn test_size_for_tags() {
        let manifest = InstallManifest::parse(&sample_manifest()).unwrap();
        assert_eq!(manifest.size_for_tags(&["Windows"]).unwrap(), 4000);
        assert_eq!(manifest.size_for_tags(&[]).unwrap(), 6000);
    }

    #[test]
    fn test_bad_magic() {
        assert!(matches!(
            InstallManifest::parse(b"XX\x01\x10\x00\x00\x00\x00\x00\x00"),
            Err(Error::BadMagic { format: "install" })
        ));
    }
}
