//! Download manifest parser.
//!
//! The download manifest lists the encoded files a client needs to reach a
//! playable state, ordered by a priority byte: lower priorities download
//! first. It shares the install manifest's tag machinery but is keyed by
//! encoded key, not path.

use byteorder::{BigEndian, ReadBytesExt};
use std::io::Cursor;
use tracing::debug;

use crate::error::{Error, Result};
use crate::ioutil::{read_bytes, read_cstring};
use crate::key::Key;
use crate::tags::{Tag, pack_mask, selection_mask, unpack_mask};

const DOWNLOAD_MAGIC: [u8; 2] = *b"DL";

/// Download manifest header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadHeader {
    pub version: u8,
    pub hash_size: u8,
    pub tag_count: u16,
    pub entry_count: u32,
}

/// One downloadable blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadEntry {
    pub ekey: Key,
    /// Encoded size.
    pub size: u32,
    /// Playable-state tier; lower downloads first.
    pub priority: i8,
}

/// A parsed download manifest.
pub struct DownloadManifest {
    pub header: DownloadHeader,
    pub tags: Vec<Tag>,
    pub entries: Vec<DownloadEntry>,
}

impl DownloadManifest {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);

        let mut magic = [0u8; 2];
        std::io::Read::read_exact(&mut cursor, &mut magic)?;
        if magic != DOWNLOAD_MAGIC {
            return Err(Error::BadMagic { format: "download" });
        }

        let header = DownloadHeader {
            version: cursor.read_u8()?,
            hash_size: cursor.read_u8()?,
            tag_count: cursor.read_u16::<BigEndian>()?,
            entry_count: cursor.read_u32::<BigEndian>()?,
        };
        if header.hash_size != 16 {
            return Err(Error::Parse {
                format: "download",
                offset: 3,
                reason: format!("unsupported hash size {}", header.hash_size),
            });
        }

        let mask_len = (header.entry_count as usize).div_ceil(8);
        let mut tags = Vec::with_capacity(header.tag_count as usize);
        for _ in 0..header.tag_count {
            let name = read_cstring(&mut cursor, "download")?;
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
            let ekey = Key::from_slice(&read_bytes(&mut cursor, 16)?)?;
            let size = cursor.read_u32::<BigEndian>()?;
            let priority = cursor.read_i8()?;
            entries.push(DownloadEntry {
                ekey,
                size,
                priority,
            });
        }

        debug!(
            "Parsed download manifest: {} tags, {} entries",
            tags.len(),
            entries.len()
        );
        Ok(Self {
            header,
            tags,
            entries,
        })
    }

    /// Entries matching a tag selection, sorted by ascending priority.
    pub fn filter_entries(&self, selected: &[&str]) -> Result<Vec<&DownloadEntry>> {
        let include = selection_mask(&self.tags, selected, self.entries.len())?;
        let mut entries: Vec<&DownloadEntry> = self
            .entries
            .iter()
            .zip(include)
            .filter_map(|(entry, keep)| keep.then_some(entry))
            .collect();
        entries.sort_by_key(|e| e.priority);
        Ok(entries)
    }

    pub fn tag_names(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(|t| t.name.as_str())
    }
}

/// Builds a well-formed download manifest.
#[derive(Debug, Default)]
pub struct DownloadBuilder {
    tags: Vec<(String, u16)>,
    entries: Vec<(DownloadEntry, Vec<String>)>,
}

impl DownloadBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tag(&mut self, name: &str, tag_type: u16) -> &mut Self {
        self.tags.push((name.to_string(), tag_type));
        self
    }

    pub fn add_entry(&mut self, ekey: Key, size: u32, priority: i8, tags: &[&str]) -> &mut Self {
        self.entries.push((
            DownloadEntry {
                ekey,
                size,
                priority,
            },
            tags.iter().map(|t| t.to_string()).collect(),
        ));
        self
    }

    pub fn build(self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        data.extend_from_slice(&DOWNLOAD_MAGIC);
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
            data.extend_from_slice(entry.ekey.as_bytes());
            data.extend_from_slice(&entry.size.to_be_bytes());
            data.push(entry.priority as u8);
        }

        Ok(data)
    }
}
