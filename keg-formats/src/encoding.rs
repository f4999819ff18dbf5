//! Encoding file parser and builder.
//!
//! The encoding file is the bridge between the two key spaces: each content
//! key maps to the encoded key(s) it is stored under, and each encoded key
//! maps back to its encoding spec and decoded size. Both directions are
//! paged, with a per-page MD5 in the page table.
//!
//! Encoding files use big-endian fields throughout, unlike the archive
//! index footer.

use byteorder::{BigEndian, ByteOrder};
use md5::{Digest, Md5};
use std::collections::HashMap;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::key::Key;

const ENCODING_MAGIC: [u8; 2] = *b"EN";
const HEADER_SIZE: usize = 22;

/// Encoding file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodingHeader {
    pub version: u8,
    pub ckey_hash_size: u8,
    pub ekey_hash_size: u8,
    /// CKey page size in KiB.
    pub ckey_page_size_kb: u16,
    /// EKey page size in KiB.
    pub ekey_page_size_kb: u16,
    pub ckey_page_count: u32,
    pub ekey_page_count: u32,
    pub espec_block_size: u32,
}

/// A content key's entry: its decoded size and alternative encodings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentEntry {
    pub ckey: Key,
    pub size: u64,
    /// Encoded keys, primary first.
    pub ekeys: Vec<Key>,
}

/// An encoded key's entry: which espec produced it and the decoded size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedEntry {
    pub ekey: Key,
    pub espec_index: u32,
    pub size: u64,
}

/// A parsed encoding file.
pub struct EncodingFile {
    header: EncodingHeader,
    especs: Vec<String>,
    content: HashMap<Key, ContentEntry>,
    content_order: Vec<Key>,
    encoded: HashMap<Key, EncodedEntry>,
    encoded_order: Vec<Key>,
    ekey_to_ckey: HashMap<Key, Key>,
}

impl EncodingFile {
    /// Parse an encoding file from its decoded bytes.
    ///
    /// With `verify`, each page's MD5 is checked against the page table.
    pub fn parse(data: &[u8], verify: bool) -> Result<Self> {
        let header = parse_header(data)?;
        debug!(
            "Parsed encoding header: ckey_pages={}, ekey_pages={}, espec_block={}",
            header.ckey_page_count, header.ekey_page_count, header.espec_block_size
        );

        let mut offset = HEADER_SIZE;
        let espec_block = take(data, &mut offset, header.espec_block_size as usize)?;
        let especs: Vec<String> = if espec_block.is_empty() {
            Vec::new()
        } else {
            std::str::from_utf8(espec_block)
                .map_err(|_| Error::Parse {
                    format: "encoding",
                    offset: HEADER_SIZE,
                    reason: "espec block is not UTF-8".to_string(),
                })?
                .split('|')
                .map(str::to_string)
                .collect()
        };

        let ckey_table = parse_page_table(data, &mut offset, header.ckey_page_count)?;
        let ckey_pages = PageIter::new(
            data,
            &mut offset,
            &ckey_table,
            header.ckey_page_size_kb,
            verify,
            "ckey page",
        )?;

        let mut content = HashMap::new();
        let mut content_order = Vec::new();
        for page in &ckey_pages {
            parse_ckey_page(page, &mut content, &mut content_order)?;
        }

        let ekey_table = parse_page_table(data, &mut offset, header.ekey_page_count)?;
        let ekey_pages = PageIter::new(
            data,
            &mut offset,
            &ekey_table,
            header.ekey_page_size_kb,
            verify,
            "ekey page",
        )?;

        let mut encoded = HashMap::new();
        let mut encoded_order = Vec::new();
        for page in &ekey_pages {
            parse_ekey_page(page, especs.len(), &mut encoded, &mut encoded_order)?;
        }

        let mut ekey_to_ckey = HashMap::new();
        for entry in content.values() {
            for ekey in &entry.ekeys {
                ekey_to_ckey.insert(*ekey, entry.ckey);
            }
        }

        debug!(
            "Parsed encoding file: {} content keys, {} encoded keys, {} especs",
            content.len(),
            encoded.len(),
            especs.len()
        );

        Ok(Self {
            header,
            especs,
            content,
            content_order,
            encoded,
            encoded_order,
            ekey_to_ckey,
        })
    }

    pub fn header(&self) -> &EncodingHeader {
        &self.header
    }

    pub fn especs(&self) -> &[String] {
        &self.especs
    }

    /// The primary encoded key for a content key.
    pub fn find_by_content_key(&self, ckey: &Key) -> Result<&Key> {
        self.content
            .get(ckey)
            .and_then(|entry| entry.ekeys.first())
            .ok_or_else(|| Error::NotFound {
                kind: "content key",
                key: ckey.to_hex(),
            })
    }

    /// The espec string and decoded size of an encoded key.
    pub fn find_by_encoded_key(&self, ekey: &Key) -> Result<(&str, u64)> {
        let entry = self.encoded.get(ekey).ok_or_else(|| Error::NotFound {
            kind: "encoded key",
            key: ekey.to_hex(),
        })?;
        Ok((self.especs[entry.espec_index as usize].as_str(), entry.size))
    }

    /// The content key an encoded key decodes to.
    pub fn find_content_key(&self, ekey: &Key) -> Result<&Key> {
        self.ekey_to_ckey.get(ekey).ok_or_else(|| Error::NotFound {
            kind: "encoded key",
            key: ekey.to_hex(),
        })
    }

    pub fn has_encoding_key(&self, ekey: &Key) -> bool {
        self.encoded.contains_key(ekey)
    }

    /// Content entries in file order.
    pub fn content_entries(&self) -> impl Iterator<Item = &ContentEntry> {
        self.content_order.iter().map(|k| &self.content[k])
    }

    /// Encoded entries in file order.
    pub fn encoded_entries(&self) -> impl Iterator<Item = &EncodedEntry> {
        self.encoded_order.iter().map(|k| &self.encoded[k])
    }

    pub fn content_count(&self) -> usize {
        self.content.len()
    }

    pub fn encoded_count(&self) -> usize {
        self.encoded.len()
    }
}

fn parse_header(data: &[u8]) -> Result<EncodingHeader> {
    if data.len() < HEADER_SIZE {
        return Err(Error::Parse {
            format: "encoding",
            offset: 0,
            reason: "shorter than header".to_string(),
        });
    }
    if data[0..2] != ENCODING_MAGIC {
        return Err(Error::BadMagic { format: "encoding" });
    }

    let header = EncodingHeader {
        version: data[2],
        ckey_hash_size: data[3],
        ekey_hash_size: data[4],
        ckey_page_size_kb: BigEndian::read_u16(&data[5..7]),
        ekey_page_size_kb: BigEndian::read_u16(&data[7..9]),
        ckey_page_count: BigEndian::read_u32(&data[9..13]),
        ekey_page_count: BigEndian::read_u32(&data[13..17]),
        espec_block_size: BigEndian::read_u32(&data[18..22]),
    };

    if header.version != 1 {
        return Err(Error::Parse {
            format: "encoding",
            offset: 2,
            reason: format!("unknown version {}", header.version),
        });
    }
    if header.ckey_hash_size != 16 || header.ekey_hash_size != 16 {
        return Err(Error::Parse {
            format: "encoding",
            offset: 3,
            reason: "only 16-byte hashes are supported".to_string(),
        });
    }

    Ok(header)
}

fn take<'a>(data: &'a [u8], offset: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = *offset + len;
    let slice = data.get(*offset..end).ok_or_else(|| Error::Parse {
        format: "encoding",
        offset: *offset,
        reason: format!("truncated: wanted {len} bytes"),
    })?;
    *offset = end;
    Ok(slice)
}

/// `(first_key, page_md5)` page table entries.
fn parse_page_table(data: &[u8], offset: &mut usize, count: u32) -> Result<Vec<(Key, [u8; 16])>> {
    let mut table = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let first_key = Key::from_slice(take(data, offset, 16)?)?;
        let checksum: [u8; 16] = take(data, offset, 16)?.try_into().unwrap();
        table.push((first_key, checksum));
    }
    Ok(table)
}

struct PageIter<'a> {
    pages: Vec<&'a [u8]>,
}

impl<'a> PageIter<'a> {
    fn new(
        data: &'a [u8],
        offset: &mut usize,
        table: &[(Key, [u8; 16])],
        page_size_kb: u16,
        verify: bool,
        what: &str,
    ) -> Result<Self> {
        let page_size = page_size_kb as usize * 1024;
        let mut pages = Vec::with_capacity(table.len());

        for (i, (_, checksum)) in table.iter().enumerate() {
            let page = take(data, offset, page_size)?;
            if verify {
                let actual: [u8; 16] = Md5::digest(page).into();
                if &actual != checksum {
                    return Err(Error::ChecksumMismatch {
                        what: format!("{what} {i}"),
                        expected: hex::encode(checksum),
                        actual: hex::encode(actual),
                    });
                }
            }
            pages.push(page);
        }

        Ok(Self { pages })
    }
}

impl<'a> IntoIterator for &'a PageIter<'a> {
    type Item = &'a &'a [u8];
    type IntoIter = std::slice::Iter<'a, &'a [u8]>;

    fn into_iter(self) -> Self::IntoIter {
        self.pages.iter()
    }
}

/// Records: `ekey_count:u8 | size:u40be | ckey | ekey × count`.
fn parse_ckey_page(
    page: &[u8],
    entries: &mut HashMap<Key, ContentEntry>,
    order: &mut Vec<Key>,
) -> Result<()> {
    let mut offset = 0;

    while offset + 6 + 16 <= page.len() {
        let ekey_count = page[offset] as usize;
        if ekey_count == 0 {
            // Zero padding runs to the page tail.
            break;
        }
        offset += 1;

        let size = read_u40_be(&page[offset..offset + 5]);
        offset += 5;

        let ckey = Key::from_slice(&page[offset..offset + 16])?;
        offset += 16;

        let mut ekeys = Vec::with_capacity(ekey_count);
        for _ in 0..ekey_count {
            if offset + 16 > page.len() {
                return Err(Error::Parse {
                    format: "encoding",
                    offset,
                    reason: "ckey record overruns its page".to_string(),
                });
            }
            ekeys.push(Key::from_slice(&page[offset..offset + 16])?);
            offset += 16;
        }

        trace!("ckey {ckey}: {ekey_count} ekeys, size {size}");
        order.push(ckey);
        entries.insert(ckey, ContentEntry { ckey, size, ekeys });
    }

    Ok(())
}

/// Records: `ekey | espec_index:i32be | size:u40be`; index −1 ends the page.
fn parse_ekey_page(
    page: &[u8],
    espec_count: usize,
    entries: &mut HashMap<Key, EncodedEntry>,
    order: &mut Vec<Key>,
) -> Result<()> {
    let mut offset = 0;

    while offset + 16 + 9 <= page.len() {
        let espec_index = BigEndian::read_i32(&page[offset + 16..offset + 20]);
        if espec_index == -1 {
            break;
        }

        let ekey = Key::from_slice(&page[offset..offset + 16])?;
        if ekey.is_zero() {
            break;
        }

        if espec_index < 0 || espec_index as usize >= espec_count {
            return Err(Error::Parse {
                format: "encoding",
                offset: offset + 16,
                reason: format!("espec index {espec_index} out of range"),
            });
        }

        let size = read_u40_be(&page[offset + 20..offset + 25]);
        order.push(ekey);
        entries.insert(
            ekey,
            EncodedEntry {
                ekey,
                espec_index: espec_index as u32,
                size,
            },
        );
        offset += 25;
    }

    Ok(())
}

fn read_u40_be(bytes: &[u8]) -> u64 {
    let mut value = 0u64;
    for &b in &bytes[..5] {
        value = (value << 8) | u64::from(b);
    }
    value
}

fn write_u40_be(value: u64) -> [u8; 5] {
    let bytes = value.to_be_bytes();
    bytes[3..8].try_into().unwrap()
}

/// Builds a well-formed encoding file.
#[derive(Debug, Default)]
pub struct EncodingBuilder {
    especs: Vec<String>,
    entries: Vec<(Key, Vec<Key>, u64, u32)>,
}

impl EncodingBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an espec string, returning its index.
    pub fn add_espec(&mut self, espec: &str) -> u32 {
        if let Some(i) = self.especs.iter().position(|s| s == espec) {
            return i as u32;
        }
        self.especs.push(espec.to_string());
        (self.especs.len() - 1) as u32
    }

    /// Record a content key with its encodings. Every ekey is entered into
    /// the ekey table under `espec_index`.
    pub fn add_entry(&mut self, ckey: Key, ekeys: &[Key], size: u64, espec_index: u32) -> &mut Self {
        self.entries
            .push((ckey, ekeys.to_vec(), size, espec_index));
        self
    }

    /// Serialize with 1 KiB pages.
    pub fn build(mut self) -> Result<Vec<u8>> {
        const PAGE_SIZE_KB: u16 = 1;
        const PAGE_SIZE: usize = PAGE_SIZE_KB as usize * 1024;

        self.entries.sort_by(|a, b| a.0.cmp(&b.0));
        let espec_block = self.especs.join("|").into_bytes();

        // CKey pages.
        let mut ckey_pages: Vec<(Key, Vec<u8>)> = Vec::new();
        for (ckey, ekeys, size, _) in &self.entries {
            let record_len = 6 + 16 + 16 * ekeys.len();
            let mut record = Vec::with_capacity(record_len);
            record.push(ekeys.len() as u8);
            record.extend_from_slice(&write_u40_be(*size));
            record.extend_from_slice(ckey.as_bytes());
            for ekey in ekeys {
                record.extend_from_slice(ekey.as_bytes());
            }

            match ckey_pages.last_mut() {
                Some((_, page)) if page.len() + record_len <= PAGE_SIZE => {
                    page.extend_from_slice(&record)
                }
                _ => ckey_pages.push((*ckey, record)),
            }
        }

        // EKey pages, sorted by ekey.
        let mut ekey_records: Vec<(Key, u32, u64)> = self
            .entries
            .iter()
            .flat_map(|(_, ekeys, size, espec)| ekeys.iter().map(|e| (*e, *espec, *size)))
            .collect();
        ekey_records.sort_by(|a, b| a.0.cmp(&b.0));
        ekey_records.dedup_by_key(|r| r.0);

        let mut ekey_pages: Vec<(Key, Vec<u8>)> = Vec::new();
        for (ekey, espec_index, size) in &ekey_records {
            let mut record = Vec::with_capacity(25);
            record.extend_from_slice(ekey.as_bytes());
            record.extend_from_slice(&(*espec_index as i32).to_be_bytes());
            record.extend_from_slice(&write_u40_be(*size));

            match ekey_pages.last_mut() {
                Some((_, page)) if page.len() + 25 <= PAGE_SIZE => {
                    page.extend_from_slice(&record)
                }
                _ => ekey_pages.push((*ekey, record)),
            }
        }

        // Header.
        let mut data = Vec::new();
        data.extend_from_slice(&ENCODING_MAGIC);
        data.push(1); // version
        data.push(16); // ckey hash size
        data.push(16); // ekey hash size
        data.extend_from_slice(&PAGE_SIZE_KB.to_be_bytes());
        data.extend_from_slice(&PAGE_SIZE_KB.to_be_bytes());
        data.extend_from_slice(&(ckey_pages.len() as u32).to_be_bytes());
        data.extend_from_slice(&(ekey_pages.len() as u32).to_be_bytes());
        data.push(0);
        data.extend_from_slice(&(espec_block.len() as u32).to_be_bytes());
        data.extend_from_slice(&espec_block);

        for (first_key, page) in &mut ckey_pages {
            page.resize(PAGE_SIZE, 0);
            let checksum: [u8; 16] = Md5::digest(page.as_slice()).into();
            data.extend_from_slice(first_key.as_bytes());
            data.extend_from_slice(&checksum);
        }
        for (_, page) in &ckey_pages {
            data.extend_from_slice(page);
        }

        for (first_key, page) in &mut ekey_pages {
            // End-of-page marker: an all-ones espec index after the records.
            if page.len() + 25 <= PAGE_SIZE {
                page.extend_from_slice(&[0u8; 16]);
                page.extend_from_slice(&(-1i32).to_be_bytes());
                page.extend_from_slice(&[0u8; 5]);
            }
            page.resize(PAGE_SIZE, 0);
            let checksum: [u8; 16] = Md5::digest(page.as_slice()).into();
            data.extend_from_slice(first_key.as_bytes());
            data.extend_from_slice(&checksum);
        }
        for (_, page) in &ekey_pages {
            data.extend_from_slice(page);
        }

        Ok(data)
    }
}
