//! BLTE header and chunk table parsing

use byteorder::{BigEndian, ReadBytesExt};
use std::io::Read;
use tracing::trace;

use crate::{BLTE_MAGIC, Error, MD5_LENGTH, Md5, Result};

/// The chunk table flag byte this codec understands.
const TABLE_FORMAT: u8 = 0x0F;

/// Size of one chunk record: encoded size, decoded size, MD5.
const CHUNK_RECORD_LEN: u32 = 4 + 4 + MD5_LENGTH as u32;

/// A parsed BLTE header.
///
/// The header region (magic, header size and, when present, the chunk
/// table) is what the blob's ekey is the MD5 of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlteHeader {
    header_size: u32,
    chunks: Vec<ChunkInfo>,
}

/// One chunk table record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    /// Encoded chunk size, including the mode byte.
    pub encoded_size: u32,
    /// Decoded chunk size. Zero for the single-chunk form, where it is
    /// unknown until decode time.
    pub decoded_size: u32,
    /// MD5 of the encoded chunk. Absent for the single-chunk form.
    pub checksum: Option<Md5>,
    /// Offset of the encoded chunk from the start of the blob.
    pub offset: usize,
}

impl BlteHeader {
    /// Parse a header from the front of `data`, where `data` is the whole
    /// blob (or at least its header region plus one chunk for the
    /// single-chunk form).
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = data;

        if data.len() < 8 {
            return Err(Error::Truncated {
                expected: 8,
                actual: data.len() as u64,
            });
        }

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != BLTE_MAGIC {
            return Err(Error::InvalidMagic(magic));
        }

        let header_size = reader.read_u32::<BigEndian>()?;

        if header_size == 0 {
            // Single-chunk form: everything after the 8-byte prelude is one
            // chunk of unknown decoded size.
            return Ok(Self {
                header_size,
                chunks: vec![ChunkInfo {
                    encoded_size: (data.len() - 8) as u32,
                    decoded_size: 0,
                    checksum: None,
                    offset: 8,
                }],
            });
        }

        if (data.len() as u64) < u64::from(header_size) {
            return Err(Error::Truncated {
                expected: header_size.into(),
                actual: data.len() as u64,
            });
        }

        let flags = reader.read_u8()?;
        if flags != TABLE_FORMAT {
            return Err(Error::UnsupportedTableFormat(flags));
        }
        let chunk_count = reader.read_u24::<BigEndian>()?;
        trace!("BLTE chunk table: {chunk_count} chunks, header {header_size} bytes");

        if chunk_count == 0 || header_size != 8 + 4 + chunk_count * CHUNK_RECORD_LEN {
            return Err(Error::InvalidChunkCount(chunk_count));
        }

        let mut chunks = Vec::with_capacity(chunk_count as usize);
        let mut offset = header_size as usize;
        for _ in 0..chunk_count {
            let encoded_size = reader.read_u32::<BigEndian>()?;
            let decoded_size = reader.read_u32::<BigEndian>()?;
            let mut checksum = [0u8; MD5_LENGTH];
            reader.read_exact(&mut checksum)?;

            chunks.push(ChunkInfo {
                encoded_size,
                decoded_size,
                checksum: Some(checksum),
                offset,
            });
            offset += encoded_size as usize;
        }

        Ok(Self {
            header_size,
            chunks,
        })
    }

    /// The declared header size field. Zero means single-chunk.
    pub fn header_size(&self) -> u32 {
        self.header_size
    }

    pub fn is_single_chunk(&self) -> bool {
        self.header_size == 0
    }

    /// Length of the header region the blob's ekey covers.
    ///
    /// For the single-chunk form this is just the 8-byte prelude; the ekey
    /// then covers the prelude *and* the payload.
    pub fn header_region_len(&self) -> usize {
        if self.is_single_chunk() {
            8
        } else {
            self.header_size as usize
        }
    }

    pub fn chunks(&self) -> &[ChunkInfo] {
        &self.chunks
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Total decoded size, if the table declares it. `None` for the
    /// single-chunk form.
    pub fn total_decoded_size(&self) -> Option<u64> {
        if self.is_single_chunk() {
            None
        } else {
            Some(self.chunks.iter().map(|c| u64::from(c.decoded_size)).sum())
        }
    }

    /// Total blob length the table declares: header plus all encoded chunks.
    pub fn declared_len(&self) -> usize {
        self.header_region_len()
            + self
                .chunks
                .iter()
                .map(|c| c.encoded_size as usize)
                .sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_chunk_header() {
        let data = b"BLTE\x00\x00\x00\x00Nhello";
        let header = BlteHeader::parse(data).unwrap();

        assert!(header.is_single_chunk());
        assert_eq!(header.chunk_count(), 1);
        assert_eq!(header.chunks()[0].offset, 8);
        assert_eq!(header.chunks()[0].encoded_size, 6);
        assert_eq!(header.total_decoded_size(), None);
    }

    #[test]
    fn test_multi_chunk_header() {
        let mut data = Vec::new();
        data.extend_from_slice(b"BLTE");
        data.extend_from_slice(&60u32.to_be_bytes()); // 8 + 4 + 2 * 24
        data.push(0x0F);
        data.extend_from_slice(&[0, 0, 2]);
        data.extend_from_slice(&10u32.to_be_bytes());
        data.extend_from_slice(&9u32.to_be_bytes());
        data.extend_from_slice(&[0xAA; 16]);
        data.extend_from_slice(&20u32.to_be_bytes());
        data.extend_from_slice(&19u32.to_be_bytes());
        data.extend_from_slice(&[0xBB; 16]);
        data.resize(60 + 30, 0);

        let header = BlteHeader::parse(&data).unwrap();
        assert!(!header.is_single_chunk());
        assert_eq!(header.chunk_count(), 2);
        assert_eq!(header.chunks()[0].offset, 60);
        assert_eq!(header.chunks()[1].offset, 70);
        assert_eq!(header.chunks()[1].checksum, Some([0xBB; 16]));
        assert_eq!(header.total_decoded_size(), Some(28));
        assert_eq!(header.declared_len(), 90);
    }

    #[test]
    fn test_bad_magic() {
        let err = BlteHeader::parse(b"NOPE\x00\x00\x00\x00").unwrap_err();
        assert!(matches!(err, Error::InvalidMagic(_)));
    }

    #[test]
    fn test_truncated_prelude() {
        let err = BlteHeader::parse(b"BLT").unwrap_err();
        assert!(matches!(
            err,
            Error::Truncated {
                expected: 8,
                actual: 3
            }
        ));
    }

    #[test]
    fn test_bad_table_flag() {
        let mut data = Vec::new();
        data.extend_from_slice(b"BLTE");
        data.extend_from_slice(&36u32.to_be_bytes());
        data.push(0x10);
        data.extend_from_slice(&[0, 0, 1]);
        data.resize(64, 0);

        let err = BlteHeader::parse(&data).unwrap_err();
        assert!(matches!(err, Error::UnsupportedTableFormat(0x10)));
    }

    #[test]
    fn test_chunk_count_header_size_mismatch() {
        let mut data = Vec::new();
        data.extend_from_slice(b"BLTE");
        data.extend_from_slice(&60u32.to_be_bytes());
        data.push(0x0F);
        data.extend_from_slice(&[0, 0, 1]); // table says 1, size says 2
        data.resize(64, 0);

        let err = BlteHeader::parse(&data).unwrap_err();
        assert!(matches!(err, Error::InvalidChunkCount(1)));
    }
}
