//! Archive indices and archive assembly.
//!
//! An archive is a plain concatenation of encoded blobs; its index maps each
//! blob's encoded key to a `(size, offset)` range. Indices are fixed-block
//! files: 4096-byte blocks of sorted 24-byte records, zero-padded at each
//! block tail, closed by a 28-byte footer. The MD5 of that footer is the
//! index's own key.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use md5::{Digest, Md5};
use tracing::trace;

use crate::error::{Error, Result};
use crate::key::Key;

/// Index block size in bytes.
pub const BLOCK_SIZE: usize = 4096;

/// One record: 16-byte key, 32-bit size, 32-bit offset.
pub const ENTRY_SIZE: usize = 24;

/// Footer size in bytes.
pub const FOOTER_SIZE: usize = 28;

const ENTRIES_PER_BLOCK: usize = BLOCK_SIZE / ENTRY_SIZE;

/// One archive index record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: Key,
    pub size: u32,
    pub offset: u32,
}

/// The 28-byte index footer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexFooter {
    /// First 8 bytes of the MD5 over each block's last key.
    pub toc_hash: [u8; 8],
    pub version: u8,
    pub flags: [u8; 2],
    pub block_size_kb: u8,
    pub offset_bytes: u8,
    pub size_bytes: u8,
    pub key_bytes: u8,
    pub checksum_size: u8,
    pub num_entries: u32,
    /// First 8 bytes of the MD5 over the footer body with this field zeroed.
    pub checksum: [u8; 8],
}

impl IndexFooter {
    pub fn parse(bytes: &[u8; FOOTER_SIZE]) -> Result<Self> {
        let footer = Self {
            toc_hash: bytes[0..8].try_into().unwrap(),
            version: bytes[8],
            flags: [bytes[9], bytes[10]],
            block_size_kb: bytes[11],
            offset_bytes: bytes[12],
            size_bytes: bytes[13],
            key_bytes: bytes[14],
            checksum_size: bytes[15],
            num_entries: LittleEndian::read_u32(&bytes[16..20]),
            checksum: bytes[20..28].try_into().unwrap(),
        };

        if footer.version != 1 {
            return Err(Error::Parse {
                format: "archive index",
                offset: 8,
                reason: format!("unknown footer version {}", footer.version),
            });
        }
        if (
            footer.block_size_kb,
            footer.offset_bytes,
            footer.size_bytes,
            footer.key_bytes,
            footer.checksum_size,
        ) != (4, 4, 4, 16, 8)
        {
            return Err(Error::Parse {
                format: "archive index",
                offset: 11,
                reason: "unsupported footer field widths".to_string(),
            });
        }

        Ok(footer)
    }

    /// Serialize the footer, computing its self-checksum.
    pub fn to_bytes(&self) -> [u8; FOOTER_SIZE] {
        let mut bytes = [0u8; FOOTER_SIZE];
        bytes[0..8].copy_from_slice(&self.toc_hash);
        bytes[8] = self.version;
        bytes[9] = self.flags[0];
        bytes[10] = self.flags[1];
        bytes[11] = self.block_size_kb;
        bytes[12] = self.offset_bytes;
        bytes[13] = self.size_bytes;
        bytes[14] = self.key_bytes;
        bytes[15] = self.checksum_size;
        LittleEndian::write_u32(&mut bytes[16..20], self.num_entries);
        let checksum = Self::compute_checksum(&bytes);
        bytes[20..28].copy_from_slice(&checksum);
        bytes
    }

    /// The footer checksum: MD5 over the footer body (after the TOC hash)
    /// with the checksum field itself zeroed, truncated to 8 bytes.
    fn compute_checksum(bytes: &[u8; FOOTER_SIZE]) -> [u8; 8] {
        let mut hasher = Md5::new();
        hasher.update(&bytes[8..20]);
        hasher.update([0u8; 8]);
        hasher.finalize()[..8].try_into().unwrap()
    }

    fn verify_checksum(&self, bytes: &[u8; FOOTER_SIZE]) -> Result<()> {
        let expected = Self::compute_checksum(bytes);
        if self.checksum != expected {
            return Err(Error::ChecksumMismatch {
                what: "archive index footer".to_string(),
                expected: hex::encode(expected),
                actual: hex::encode(self.checksum),
            });
        }
        Ok(())
    }
}

/// A parsed archive index.
#[derive(Debug, Clone)]
pub struct ArchiveIndex {
    key: Key,
    footer: IndexFooter,
    entries: Vec<IndexEntry>,
}

impl ArchiveIndex {
    /// Parse an index from its raw bytes.
    ///
    /// `key` is the index's own key (its CDN filename without the `.index`
    /// suffix). With `verify`, the footer MD5 is checked against it, along
    /// with the footer's self-checksum and the TOC hash. Entry ordering and
    /// the entry count are validated unconditionally.
    pub fn parse(data: &[u8], key: &Key, verify: bool) -> Result<Self> {
        if data.len() < FOOTER_SIZE || (data.len() - FOOTER_SIZE) % BLOCK_SIZE != 0 {
            return Err(Error::Parse {
                format: "archive index",
                offset: data.len(),
                reason: "file is not whole blocks plus a footer".to_string(),
            });
        }

        let footer_bytes: &[u8; FOOTER_SIZE] =
            data[data.len() - FOOTER_SIZE..].try_into().unwrap();
        let footer = IndexFooter::parse(footer_bytes)?;

        if verify {
            let actual = Key::of(footer_bytes);
            if &actual != key {
                return Err(Error::ChecksumMismatch {
                    what: format!("archive index {key}"),
                    expected: key.to_hex(),
                    actual: actual.to_hex(),
                });
            }
            footer.verify_checksum(footer_bytes)?;
        }

        let blocks = &data[..data.len() - FOOTER_SIZE];
        let mut entries = Vec::with_capacity(footer.num_entries as usize);
        let mut block_last_keys = Vec::with_capacity(blocks.len() / BLOCK_SIZE);

        for block in blocks.chunks_exact(BLOCK_SIZE) {
            let mut last_key = None;
            for record in block.chunks_exact(ENTRY_SIZE) {
                let entry_key = Key::from_slice(&record[0..16])?;
                if entry_key.is_zero() {
                    // Zero padding runs to the block tail.
                    break;
                }

                if let Some(previous) = entries.last().map(|e: &IndexEntry| e.key) {
                    if entry_key <= previous {
                        return Err(Error::Parse {
                            format: "archive index",
                            offset: entries.len() * ENTRY_SIZE,
                            reason: format!("entry {entry_key} out of order"),
                        });
                    }
                }

                entries.push(IndexEntry {
                    key: entry_key,
                    size: BigEndian::read_u32(&record[16..20]),
                    offset: BigEndian::read_u32(&record[20..24]),
                });
                last_key = Some(entry_key);
            }
            if let Some(last) = last_key {
                block_last_keys.push(last);
            }
        }

        if entries.len() != footer.num_entries as usize {
            return Err(Error::Parse {
                format: "archive index",
                offset: data.len() - FOOTER_SIZE,
                reason: format!(
                    "footer declares {} entries, found {}",
                    footer.num_entries,
                    entries.len()
                ),
            });
        }

        if verify {
            let toc_hash = compute_toc_hash(&block_last_keys);
            if toc_hash != footer.toc_hash {
                return Err(Error::ChecksumMismatch {
                    what: "archive index TOC".to_string(),
                    expected: hex::encode(footer.toc_hash),
                    actual: hex::encode(toc_hash),
                });
            }
        }

        trace!("Parsed archive index {key}: {} entries", entries.len());
        Ok(Self {
            key: *key,
            footer,
            entries,
        })
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn footer(&self) -> &IndexFooter {
        &self.footer
    }

    /// Entries in strictly increasing key order.
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Binary search by encoded key.
    pub fn lookup(&self, key: &Key) -> Option<&IndexEntry> {
        self.entries
            .binary_search_by(|e| e.key.cmp(key))
            .ok()
            .map(|i| &self.entries[i])
    }
}

fn compute_toc_hash(block_last_keys: &[Key]) -> [u8; 8] {
    let mut hasher = Md5::new();
    for key in block_last_keys {
        hasher.update(key.as_bytes());
    }
    hasher.finalize()[..8].try_into().unwrap()
}

/// Where an encoded blob lives: which archive, and what range of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveLocation {
    pub archive_key: Key,
    pub size: u32,
    pub offset: u32,
}

/// An overlay of several archive indices, consulted in CDN-config order.
#[derive(Debug, Default)]
pub struct ArchiveGroup {
    indices: Vec<ArchiveIndex>,
}

impl ArchiveGroup {
    /// Build a group from indices in the order their archives appear in the
    /// CDN config. Lookups return the first match in that order.
    pub fn new(indices: Vec<ArchiveIndex>) -> Self {
        Self { indices }
    }

    pub fn lookup(&self, key: &Key) -> Option<ArchiveLocation> {
        self.indices.iter().find_map(|index| {
            index.lookup(key).map(|entry| ArchiveLocation {
                archive_key: *index.key(),
                size: entry.size,
                offset: entry.offset,
            })
        })
    }

    pub fn has_key(&self, key: &Key) -> bool {
        self.lookup(key).is_some()
    }

    pub fn archive_keys(&self) -> impl Iterator<Item = &Key> {
        self.indices.iter().map(ArchiveIndex::key)
    }

    /// Total entry count across the group, duplicates included.
    pub fn len(&self) -> usize {
        self.indices.iter().map(ArchiveIndex::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.iter().all(ArchiveIndex::is_empty)
    }
}

/// Builds a well-formed archive index from unordered entries.
#[derive(Debug, Default)]
pub struct ArchiveIndexBuilder {
    entries: Vec<IndexEntry>,
}

impl ArchiveIndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entry(&mut self, key: Key, size: u32, offset: u32) -> &mut Self {
        self.entries.push(IndexEntry { key, size, offset });
        self
    }

    /// Serialize the index. Returns the bytes and the index's key (the MD5
    /// of its footer).
    pub fn build(mut self) -> Result<(Vec<u8>, Key)> {
        self.entries.sort_by(|a, b| a.key.cmp(&b.key));
        for pair in self.entries.windows(2) {
            if pair[0].key == pair[1].key {
                return Err(Error::Parse {
                    format: "archive index",
                    offset: 0,
                    reason: format!("duplicate entry {}", pair[0].key),
                });
            }
        }

        let mut data = Vec::new();
        let mut block_last_keys = Vec::new();

        for block in self.entries.chunks(ENTRIES_PER_BLOCK) {
            let block_start = data.len();
            for entry in block {
                data.extend_from_slice(entry.key.as_bytes());
                data.extend_from_slice(&entry.size.to_be_bytes());
                data.extend_from_slice(&entry.offset.to_be_bytes());
            }
            data.resize(block_start + BLOCK_SIZE, 0);
            block_last_keys.push(block.last().unwrap().key);
        }

        let footer = IndexFooter {
            toc_hash: compute_toc_hash(&block_last_keys),
            version: 1,
            flags: [0, 0],
            block_size_kb: 4,
            offset_bytes: 4,
            size_bytes: 4,
            key_bytes: 16,
            checksum_size: 8,
            num_entries: self.entries.len() as u32,
            checksum: [0u8; 8],
        };
        let footer_bytes = footer.to_bytes();
        let index_key = Key::of(&footer_bytes);
        data.extend_from_slice(&footer_bytes);

        Ok((data, index_key))
    }
}

/// A finished archive plus its index, ready to store.
///
/// One key names both: the archive lives at `data/…/{key}` and its index
/// at `data/…/{key}.index`. The key is the MD5 of the index footer.
#[derive(Debug)]
pub struct BuiltArchive {
    /// Archive bytes: the blobs, concatenated.
    pub data: Vec<u8>,
    pub index: Vec<u8>,
    pub key: Key,
}

/// Assembles an archive by appending encoded blobs, recording each range.
#[derive(Debug, Default)]
pub struct ArchiveBuilder {
    data: Vec<u8>,
    index: ArchiveIndexBuilder,
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one encoded blob under its encoded key.
    pub fn add_blob(&mut self, key: Key, blob: &[u8]) -> &mut Self {
        let offset = self.data.len() as u32;
        self.data.extend_from_slice(blob);
        self.index.add_entry(key, blob.len() as u32, offset);
        self
    }

    pub fn finish(self) -> Result<BuiltArchive> {
        let (index, key) = self.index.build()?;
        Ok(BuiltArchive {
            data: self.data,
            index,
            key,
        })
    }
}
